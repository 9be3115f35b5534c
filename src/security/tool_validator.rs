use super::context::ToolCategory;
use super::error::{Result, SecurityError};
use super::patterns::{DANGEROUS_ACTION_KEYWORDS, FORBIDDEN_TOOL_NAMES};
use crate::config::ToolValidatorConfig;
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Separator of the namespaced form (`prefix__ns__action`).
pub const NAMESPACE_SEPARATOR: &str = "__";

static SEGMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[_-][A-Za-z0-9]+)*$").expect("static regex")
});

static FORBIDDEN_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[;&|$`<>(){}\[\]\\'"!*?#~%]"#).expect("static regex"));

static PERMISSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z]+|\*):([a-z][a-z0-9_-]*|\*)$").expect("static regex"));

/// Naming convention a tool name was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameFormat {
    /// `prefix__ns__action`
    Namespaced,
    /// `ns.action`
    Dotted,
}

/// Components of a recognized tool name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedToolName {
    pub format: NameFormat,
    pub prefix: Option<String>,
    pub namespace: Option<String>,
    pub action: String,
}

/// Declared shape of a tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ToolCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    /// `<category>:<action>` strings, e.g. `file:read`
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub dangerous: bool,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.push(permission.into());
        self
    }

    pub fn dangerous(mut self) -> Self {
        self.dangerous = true;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Canonical name; for dotted names this is the suggested namespaced form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_name: Option<String>,
}

impl ToolValidationResult {
    /// Convert into a hard error for callers that cannot continue.
    pub fn into_result(self) -> Result<Self> {
        if self.valid {
            Ok(self)
        } else {
            Err(SecurityError::Validation(self.errors))
        }
    }
}

/// Validates tool names/definitions and keeps the registry of known tools.
pub struct ToolValidator {
    config: ToolValidatorConfig,
    extra_forbidden: Vec<Regex>,
    registry: DashMap<String, ToolDefinition>,
}

impl Default for ToolValidator {
    fn default() -> Self {
        Self::new(ToolValidatorConfig::default())
    }
}

impl ToolValidator {
    /// Build without extra forbidden patterns; invalid ones in `config` are skipped.
    pub fn new(config: ToolValidatorConfig) -> Self {
        let extra_forbidden = config
            .forbidden_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(pattern = %p, "Ignoring invalid forbidden tool pattern: {e}");
                    None
                }
            })
            .collect();
        Self {
            config,
            extra_forbidden,
            registry: DashMap::new(),
        }
    }

    /// Build from config, failing on invalid forbidden patterns.
    pub fn from_config(config: &ToolValidatorConfig) -> Result<Self> {
        let extra_forbidden = config
            .forbidden_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| SecurityError::InvalidPattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config: config.clone(),
            extra_forbidden,
            registry: DashMap::new(),
        })
    }

    /// Whether the gate should run name validation at all.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Split a name into its convention and segments, if it follows one.
    pub fn parse_name(name: &str) -> Option<ParsedToolName> {
        if name.contains(NAMESPACE_SEPARATOR) {
            let segments: Vec<&str> = name.split(NAMESPACE_SEPARATOR).collect();
            if !(2..=4).contains(&segments.len())
                || !segments.iter().all(|s| SEGMENT.is_match(s))
            {
                return None;
            }
            let action = segments[segments.len() - 1].to_string();
            let (prefix, namespace) = match segments.len() {
                2 => (None, Some(segments[0].to_string())),
                _ => (
                    Some(segments[0].to_string()),
                    Some(segments[1..segments.len() - 1].join(NAMESPACE_SEPARATOR)),
                ),
            };
            return Some(ParsedToolName {
                format: NameFormat::Namespaced,
                prefix,
                namespace,
                action,
            });
        }

        if name.contains('.') {
            let segments: Vec<&str> = name.split('.').collect();
            if !(2..=3).contains(&segments.len()) || !segments.iter().all(|s| SEGMENT.is_match(s)) {
                return None;
            }
            return Some(ParsedToolName {
                format: NameFormat::Dotted,
                prefix: None,
                namespace: Some(segments[..segments.len() - 1].join(".")),
                action: segments[segments.len() - 1].to_string(),
            });
        }

        None
    }

    pub fn validate_name(&self, name: &str) -> ToolValidationResult {
        let mut result = ToolValidationResult::default();

        if name.trim().is_empty() {
            result.errors.push("Tool name must not be empty".into());
            return result;
        }

        if name.len() > self.config.max_name_length {
            result.errors.push(format!(
                "Tool name exceeds {} characters ({})",
                self.config.max_name_length,
                name.len()
            ));
        }

        if FORBIDDEN_TOOL_NAMES
            .iter()
            .any(|f| f.eq_ignore_ascii_case(name))
        {
            result
                .errors
                .push(format!("Tool name '{name}' is reserved and cannot be used"));
        }
        if name.chars().any(char::is_whitespace) {
            result
                .errors
                .push("Tool name contains forbidden characters (whitespace)".into());
        }
        if let Some(m) = FORBIDDEN_CHARS.find(name) {
            result.errors.push(format!(
                "Tool name contains forbidden characters ('{}')",
                m.as_str()
            ));
        }
        if name.contains('/') || name.contains("..") {
            result
                .errors
                .push("Tool name contains forbidden characters (path separator)".into());
        }
        for re in &self.extra_forbidden {
            if re.is_match(name) {
                result
                    .errors
                    .push(format!("Tool name matches forbidden pattern '{}'", re.as_str()));
            }
        }

        match Self::parse_name(name) {
            Some(parsed) if parsed.format == NameFormat::Namespaced => {
                result.normalized_name = Some(name.to_string());
            }
            Some(parsed) => {
                let mut segments = vec![self.config.default_prefix.clone()];
                segments.extend(
                    parsed
                        .namespace
                        .iter()
                        .flat_map(|ns| ns.split('.').map(str::to_string)),
                );
                segments.push(parsed.action);
                let suggested = segments.join(NAMESPACE_SEPARATOR);
                result.warnings.push(format!(
                    "Tool name '{name}' uses the dotted form; prefer '{suggested}'"
                ));
                result.normalized_name = Some(suggested);
            }
            None if result.errors.is_empty() => {
                result.errors.push(format!(
                    "Tool name '{name}' has an unrecognized format; expected 'prefix__namespace__action' or 'namespace.action'"
                ));
            }
            None => {}
        }

        result.valid = result.errors.is_empty();
        result
    }

    pub fn validate_tool(&self, tool: &ToolDefinition) -> ToolValidationResult {
        let mut result = self.validate_name(&tool.name);

        if self.config.require_description && tool.description.trim().is_empty() {
            result.errors.push("Tool description is required".into());
        } else if tool.description.len() > 1024 {
            result
                .warnings
                .push("Tool description is longer than 1024 characters".into());
        }
        if self.config.require_category && tool.category.is_none() {
            result.errors.push("Tool category is required".into());
        }
        match &tool.input_schema {
            None if self.config.require_input_schema => {
                result.errors.push("Tool input schema is required".into());
            }
            Some(schema) if !schema.is_object() => {
                result.errors.push("Tool input schema must be a JSON object".into());
            }
            _ => {}
        }

        for permission in &tool.permissions {
            if let Err(message) = validate_permission(permission) {
                result.errors.push(message);
            }
        }
        if tool.dangerous && tool.permissions.is_empty() {
            result.errors.push(format!(
                "Dangerous tool '{}' must declare the permissions it needs",
                tool.name
            ));
        }

        result.valid = result.errors.is_empty();
        result
    }

    /// Validate and store under the normalized name; re-registration overwrites.
    pub fn register_tool(&self, tool: ToolDefinition) -> ToolValidationResult {
        let result = self.validate_tool(&tool);
        if !result.valid {
            tracing::warn!(tool = %tool.name, errors = ?result.errors, "Rejected tool registration");
            return result;
        }
        let key = result
            .normalized_name
            .clone()
            .unwrap_or_else(|| tool.name.clone());
        let normalized = ToolDefinition {
            name: key.clone(),
            ..tool
        };
        if self.registry.insert(key.clone(), normalized).is_some() {
            tracing::debug!(tool = %key, "Tool re-registered");
        }
        result
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        self.registry.remove(&self.registry_key(name)).is_some()
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolDefinition> {
        self.registry
            .get(&self.registry_key(name))
            .map(|entry| entry.value().clone())
    }

    /// Registered tools sorted by name.
    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> =
            self.registry.iter().map(|e| e.value().clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Explicit `dangerous` flag OR a dangerous keyword in the action segment.
    pub fn is_dangerous(&self, name: &str) -> bool {
        if self.get_tool(name).is_some_and(|t| t.dangerous) {
            return true;
        }
        let action = Self::parse_name(name)
            .map(|p| p.action)
            .unwrap_or_else(|| name.to_string())
            .to_ascii_lowercase();
        action
            .split(['_', '-'])
            .any(|word| DANGEROUS_ACTION_KEYWORDS.contains(&word))
    }

    /// Both `file.read` and `hawkeye__file__read` resolve to the same entry.
    fn registry_key(&self, name: &str) -> String {
        match Self::parse_name(name) {
            Some(parsed) if parsed.format == NameFormat::Dotted => {
                self.validate_name(name).normalized_name.unwrap_or_else(|| name.to_string())
            }
            _ => name.to_string(),
        }
    }
}

fn validate_permission(permission: &str) -> std::result::Result<(), String> {
    let Some(caps) = PERMISSION.captures(permission) else {
        return Err(format!(
            "Permission '{permission}' must look like '<category>:<action>'"
        ));
    };
    let category = &caps[1];
    if category != "*" && category.parse::<ToolCategory>().is_err() {
        return Err(format!(
            "Permission '{permission}' names unknown category '{category}'"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validator() -> ToolValidator {
        ToolValidator::default()
    }

    #[test]
    fn namespaced_name_is_valid_unchanged() {
        let result = validator().validate_name("hawkeye__file__read");
        assert!(result.valid, "{result:?}");
        assert!(result.warnings.is_empty());
        assert_eq!(result.normalized_name.as_deref(), Some("hawkeye__file__read"));
    }

    #[test]
    fn dotted_name_is_valid_with_suggestion() {
        let result = validator().validate_name("file.read");
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.normalized_name.as_deref(), Some("hawkeye__file__read"));
    }

    #[test]
    fn shell_text_is_rejected() {
        let result = validator().validate_name("rm -rf /");
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("forbidden characters")));
    }

    #[test]
    fn empty_and_long_names_rejected() {
        let v = validator();
        assert!(!v.validate_name("").valid);
        assert!(!v.validate_name("   ").valid);
        let long = format!("hawkeye__file__{}", "a".repeat(200));
        let result = v.validate_name(&long);
        assert!(!result.valid);
        assert!(result.errors[0].contains("exceeds"));
    }

    #[test]
    fn reserved_names_rejected() {
        let v = validator();
        for name in ["eval", "exec", "EXEC", "system"] {
            assert!(!v.validate_name(name).valid, "{name} should be rejected");
        }
    }

    #[test]
    fn unrecognized_format_is_error() {
        let v = validator();
        let result = v.validate_name("readfile");
        assert!(!result.valid);
        assert!(result.errors[0].contains("unrecognized format"));
        assert!(!v.validate_name("a__b__c__d__e").valid);
        assert!(!v.validate_name("a___b").valid);
        assert!(!v.validate_name("1ns.action").valid);
    }

    #[test]
    fn segment_counts() {
        let v = validator();
        assert!(v.validate_name("file__read").valid);
        assert!(v.validate_name("hawkeye__browser__tab__close").valid);
        assert!(v.validate_name("browser.tab.close").valid);
        assert_eq!(
            v.validate_name("browser.tab.close").normalized_name.as_deref(),
            Some("hawkeye__browser__tab__close")
        );
        assert!(!v.validate_name("a.b.c.d").valid);
    }

    #[test]
    fn parse_name_splits_segments() {
        let parsed = ToolValidator::parse_name("hawkeye__file__read").unwrap();
        assert_eq!(parsed.format, NameFormat::Namespaced);
        assert_eq!(parsed.prefix.as_deref(), Some("hawkeye"));
        assert_eq!(parsed.namespace.as_deref(), Some("file"));
        assert_eq!(parsed.action, "read");

        let parsed = ToolValidator::parse_name("shell.run_command").unwrap();
        assert_eq!(parsed.format, NameFormat::Dotted);
        assert_eq!(parsed.action, "run_command");
        assert!(ToolValidator::parse_name("plain").is_none());
    }

    #[test]
    fn extra_forbidden_patterns_apply() {
        let config = ToolValidatorConfig {
            forbidden_patterns: vec!["^internal".into()],
            ..ToolValidatorConfig::default()
        };
        let v = ToolValidator::from_config(&config).unwrap();
        assert!(!v.validate_name("internal__debug__dump").valid);
        assert!(v.validate_name("hawkeye__debug__dump").valid);

        let bad = ToolValidatorConfig {
            forbidden_patterns: vec!["(".into()],
            ..ToolValidatorConfig::default()
        };
        assert!(ToolValidator::from_config(&bad).is_err());
    }

    #[test]
    fn validate_tool_checks_definition() {
        let v = validator();
        let ok = ToolDefinition::new("hawkeye__file__read", "Read a file")
            .with_category(ToolCategory::File)
            .with_permission("file:read")
            .with_schema(json!({"type": "object"}));
        assert!(v.validate_tool(&ok).valid);

        let missing_description = ToolDefinition::new("hawkeye__file__read", "");
        let result = v.validate_tool(&missing_description);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("description")));

        let bad_permission =
            ToolDefinition::new("hawkeye__file__read", "Read").with_permission("teleport:now");
        assert!(!v.validate_tool(&bad_permission).valid);

        let bad_schema =
            ToolDefinition::new("hawkeye__file__read", "Read").with_schema(json!("string"));
        assert!(!v.validate_tool(&bad_schema).valid);
    }

    #[test]
    fn dangerous_tool_needs_permissions() {
        let v = validator();
        let tool = ToolDefinition::new("hawkeye__shell__exec", "Run a command").dangerous();
        let result = v.validate_tool(&tool);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|e| e.contains("must declare")));

        let tool = tool.with_permission("shell:execute");
        assert!(v.validate_tool(&tool).valid);
    }

    #[test]
    fn config_requirements_toggle_checks() {
        let v = ToolValidator::new(ToolValidatorConfig {
            require_description: false,
            require_category: true,
            require_input_schema: true,
            ..ToolValidatorConfig::default()
        });
        let result = v.validate_tool(&ToolDefinition::new("hawkeye__ai__chat", ""));
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn register_normalizes_and_overwrites() {
        let v = validator();
        let result = v.register_tool(ToolDefinition::new("file.read", "Read v1"));
        assert!(result.valid);
        let stored = v.get_tool("hawkeye__file__read").unwrap();
        assert_eq!(stored.name, "hawkeye__file__read");
        assert_eq!(v.get_tool("file.read").unwrap().description, "Read v1");

        v.register_tool(ToolDefinition::new("hawkeye__file__read", "Read v2"));
        assert_eq!(v.list_tools().len(), 1);
        assert_eq!(v.get_tool("file.read").unwrap().description, "Read v2");

        assert!(v.unregister_tool("file.read"));
        assert!(v.list_tools().is_empty());
    }

    #[test]
    fn invalid_tool_is_not_registered() {
        let v = validator();
        let result = v.register_tool(ToolDefinition::new("rm -rf /", "bad"));
        assert!(!result.valid);
        assert!(v.list_tools().is_empty());
        assert!(result.into_result().is_err());
    }

    #[test]
    fn dangerous_heuristic() {
        let v = validator();
        assert!(v.is_dangerous("hawkeye__file__delete"));
        assert!(v.is_dangerous("shell.exec"));
        assert!(v.is_dangerous("hawkeye__system__sudo_run"));
        assert!(!v.is_dangerous("hawkeye__file__read"));
        assert!(!v.is_dangerous("browser.screenshot"));

        v.register_tool(
            ToolDefinition::new("hawkeye__browser__submit", "Submit a form")
                .with_permission("browser:submit")
                .dangerous(),
        );
        assert!(v.is_dangerous("hawkeye__browser__submit"));
    }
}
