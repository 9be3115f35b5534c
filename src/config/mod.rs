pub mod schema;

pub use schema::{
    AuditConfig, AuditConsoleLevel, CommandSecurityConfig, Config, CustomInjectionPattern,
    FileSystemSecurityConfig, InjectionConfig, LoggingConfig, PermissionConfig, RateLimitConfig,
    RollbackConfig, SecurityConfig, SecurityLevel, ToolValidatorConfig,
};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "HAWKEYE_CONFIG";

/// Expand `~` and environment variables in a configured path.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).as_ref()),
    }
}

/// `~/.hawkeye`, or `./.hawkeye` when no home directory can be determined.
pub fn hawkeye_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".hawkeye"))
        .unwrap_or_else(|| PathBuf::from(".hawkeye"))
}

pub fn default_config_path() -> PathBuf {
    hawkeye_dir().join("config.toml")
}

impl Config {
    /// Load from `path`, then `$HAWKEYE_CONFIG`, then `~/.hawkeye/config.toml`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(|p| expand_path(&p)))
            .unwrap_or_else(default_config_path);

        if !config_path.exists() {
            tracing::debug!(
                path = %config_path.display(),
                "No config file found, using defaults"
            );
            return Ok(Self {
                config_path,
                ..Self::default()
            });
        }

        let raw = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?;
        let mut config = Self::from_toml(&raw)
            .with_context(|| format!("Failed to parse config {}", config_path.display()))?;
        config.config_path = config_path;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    /// Reject values that would make a component misbehave silently.
    pub fn validate(&self) -> Result<()> {
        let security = &self.security;
        if !(0.0..=1.0).contains(&security.injection.min_confidence) {
            anyhow::bail!(
                "security.injection.min_confidence must be within 0..=1, got {}",
                security.injection.min_confidence
            );
        }
        for custom in &security.injection.custom_patterns {
            if !(0.0..=1.0).contains(&custom.confidence) {
                anyhow::bail!(
                    "custom injection pattern '{}' has confidence {} outside 0..=1",
                    custom.id,
                    custom.confidence
                );
            }
        }
        if security.audit.max_entries == 0 {
            anyhow::bail!("security.audit.max_entries must be at least 1");
        }
        if security.tool_validator.max_name_length == 0 {
            anyhow::bail!("security.tool_validator.max_name_length must be at least 1");
        }
        if security.rollback.max_rollback_points == 0 {
            anyhow::bail!("security.rollback.max_rollback_points must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::context::{PermissionLevel, ToolCategory};
    use crate::security::permission::RulePattern;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.security.enabled);
        assert_eq!(config.security.permissions.default_level, PermissionLevel::Prompt);
        assert_eq!(config.security.audit.max_entries, 10_000);
        assert_eq!(config.security.rollback.max_rollback_points, 50);
        assert!(!config.security.rollback.persist_rollback_points);
        assert_eq!(config.security.command.level, SecurityLevel::Standard);
        assert!(config
            .security
            .filesystem
            .forbidden_paths
            .iter()
            .any(|p| p == "/proc"));
        assert!(!config.security.rate_limit.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn parses_policies_and_sections() {
        let raw = r#"
[logging]
level = "debug"

[security.permissions]
default_level = "deny"
permission_ttl_secs = 60

[[security.permissions.policies]]
id = "ops"
name = "Ops rules"

[[security.permissions.policies.rules]]
id = "sudo"
pattern = { regex = '^sudo\s+' }
category = "shell"
permission = "prompt"
reason = "Privileged command"
priority = 10

[[security.permissions.policies.rules]]
id = "docs"
pattern = { literal = "/docs/" }
permission = "allow"

[security.command]
level = "strict"
allowed_commands = ["ls", "git"]
"#;
        let config = Config::from_toml(raw).unwrap();
        assert_eq!(config.logging.level, "debug");
        let perms = &config.security.permissions;
        assert_eq!(perms.default_level, PermissionLevel::Deny);
        assert_eq!(perms.permission_ttl_secs, 60);
        assert_eq!(perms.max_cached_permissions, 500);
        assert_eq!(perms.policies.len(), 1);

        let policy = &perms.policies[0];
        assert!(policy.enabled);
        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.rules[0].category, Some(ToolCategory::Shell));
        assert!(matches!(policy.rules[0].pattern, RulePattern::Regex(_)));
        assert!(policy.rules[0].pattern.is_match("sudo rm"));
        assert!(matches!(policy.rules[1].pattern, RulePattern::Literal(_)));
        assert_eq!(policy.rules[1].priority, 0);

        assert_eq!(config.security.command.level, SecurityLevel::Strict);
        assert_eq!(config.security.command.allowed_commands, vec!["ls", "git"]);
    }

    #[test]
    fn invalid_regex_rule_is_rejected() {
        let raw = r#"
[[security.permissions.policies]]
id = "bad"
name = "Bad"

[[security.permissions.policies.rules]]
id = "broken"
pattern = { regex = "(unclosed" }
permission = "deny"
"#;
        assert!(Config::from_toml(raw).is_err());
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        let raw = "[security.injection]\nmin_confidence = 1.5\n";
        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("min_confidence"));
    }

    #[test]
    fn zero_rollback_points_is_rejected() {
        let raw = "[security.rollback]\nmax_rollback_points = 0\n";
        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("max_rollback_points"));
    }

    #[test]
    fn toml_roundtrip_preserves_policies() {
        let mut config = Config::default();
        config.security.permissions.policies = vec![fixture_policy()];
        let raw = config.to_toml().unwrap();
        let parsed = Config::from_toml(&raw).unwrap();
        assert_eq!(parsed.security.permissions.policies.len(), 1);
        assert_eq!(parsed.security.permissions.policies[0].rules[0].id, "no-curl");
    }

    fn fixture_policy() -> crate::security::permission::PermissionPolicy {
        use crate::security::permission::{PermissionPolicy, PolicyRule};
        PermissionPolicy::new("fixture", "Fixture").with_rule(
            PolicyRule::new("no-curl", RulePattern::literal("curl"), PermissionLevel::Deny)
                .with_category(ToolCategory::Shell),
        )
    }

    #[test]
    fn load_missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("absent.toml");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.config_path, path);
        assert!(config.security.enabled);
    }

    #[test]
    fn load_reads_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[security]\nenabled = false\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert!(!config.security.enabled);
        assert_eq!(config.config_path, path);
    }

    #[test]
    fn expand_path_handles_tilde() {
        let expanded = expand_path("~/x");
        assert!(!expanded.to_string_lossy().starts_with('~') || std::env::var("HOME").is_err());
        assert_eq!(expand_path("/abs/path"), PathBuf::from("/abs/path"));
    }
}
