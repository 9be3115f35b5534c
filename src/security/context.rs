use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broad class of action the agent wants to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Shell,
    File,
    Browser,
    Network,
    System,
    Ai,
}

impl ToolCategory {
    pub const ALL: [ToolCategory; 6] = [
        Self::Shell,
        Self::File,
        Self::Browser,
        Self::Network,
        Self::System,
        Self::Ai,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::File => "file",
            Self::Browser => "browser",
            Self::Network => "network",
            Self::System => "system",
            Self::Ai => "ai",
        }
    }
}

impl std::fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ToolCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown tool category '{s}'"))
    }
}

/// Who asked for the action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionSource {
    #[default]
    User,
    System,
    Plugin,
    /// Background work the agent started on its own
    Autonomous,
}

impl std::fmt::Display for ActionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::System => write!(f, "system"),
            Self::Plugin => write!(f, "plugin"),
            Self::Autonomous => write!(f, "autonomous"),
        }
    }
}

impl std::str::FromStr for ActionSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            "plugin" => Ok(Self::Plugin),
            "autonomous" => Ok(Self::Autonomous),
            other => Err(format!("unknown action source '{other}'")),
        }
    }
}

/// Verdict of a permission rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Allow,
    /// Ask the user before proceeding
    #[default]
    Prompt,
    Deny,
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Prompt => write!(f, "prompt"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// Full description of one proposed action, built fresh per attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub tool_id: String,
    pub category: ToolCategory,
    pub action: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub source: ActionSource,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(
        tool_id: impl Into<String>,
        category: ToolCategory,
        action: impl Into<String>,
    ) -> Self {
        Self {
            tool_id: tool_id.into(),
            category,
            action: action.into(),
            parameters: Map::new(),
            source: ActionSource::User,
            timestamp: Utc::now(),
            session_id: None,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_source(mut self, source: ActionSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// String parameter lookup; non-string values are ignored.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// The text policy rules are matched against for this context's category.
    pub fn match_target(&self) -> &str {
        let preferred = match self.category {
            ToolCategory::Shell => self.param_str("command"),
            ToolCategory::File => self.param_str("path"),
            ToolCategory::Browser => self.param_str("url"),
            ToolCategory::Network => self.param_str("url").or_else(|| self.param_str("host")),
            ToolCategory::System | ToolCategory::Ai => None,
        };
        preferred.unwrap_or(&self.action)
    }
}
