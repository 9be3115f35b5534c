use crate::security::context::PermissionLevel;
use crate::security::injection::InjectionType;
use crate::security::patterns::{DEFAULT_FORBIDDEN_PATHS, EXECUTABLE_EXTENSIONS};
use crate::security::permission::PermissionPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration file (`~/.hawkeye/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where this config was loaded from (not serialized)
    #[serde(skip)]
    pub config_path: PathBuf,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Strictness applied by the advisory command/filesystem scorers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Strict,
    #[default]
    Standard,
    Permissive,
    /// Scoring still runs, nothing is blocked
    Off,
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Strict => write!(f, "strict"),
            Self::Standard => write!(f, "standard"),
            Self::Permissive => write!(f, "permissive"),
            Self::Off => write!(f, "off"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Master switch; when false the gate allows everything (still audited)
    pub enabled: bool,
    pub injection: InjectionConfig,
    pub tool_validator: ToolValidatorConfig,
    pub permissions: PermissionConfig,
    pub audit: AuditConfig,
    pub rollback: RollbackConfig,
    pub command: CommandSecurityConfig,
    pub filesystem: FileSystemSecurityConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            injection: InjectionConfig::default(),
            tool_validator: ToolValidatorConfig::default(),
            permissions: PermissionConfig::default(),
            audit: AuditConfig::default(),
            rollback: RollbackConfig::default(),
            command: CommandSecurityConfig::default(),
            filesystem: FileSystemSecurityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

// ── Injection ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InjectionConfig {
    pub enabled: bool,
    /// Matches below this confidence are reported but not treated as detections
    pub min_confidence: f64,
    pub detect_prompt_injection: bool,
    pub detect_command_injection: bool,
    pub detect_path_traversal: bool,
    pub detect_sql_injection: bool,
    pub detect_script_injection: bool,
    pub detect_data_exfiltration: bool,
    pub custom_patterns: Vec<CustomInjectionPattern>,
}

impl Default for InjectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_confidence: 0.7,
            detect_prompt_injection: true,
            detect_command_injection: true,
            detect_path_traversal: true,
            detect_sql_injection: true,
            detect_script_injection: true,
            detect_data_exfiltration: true,
            custom_patterns: Vec::new(),
        }
    }
}

impl InjectionConfig {
    pub fn is_type_enabled(&self, injection_type: InjectionType) -> bool {
        match injection_type {
            InjectionType::PromptInjection => self.detect_prompt_injection,
            InjectionType::CommandInjection => self.detect_command_injection,
            InjectionType::PathTraversal => self.detect_path_traversal,
            InjectionType::SqlInjection => self.detect_sql_injection,
            InjectionType::ScriptInjection => self.detect_script_injection,
            InjectionType::DataExfiltration => self.detect_data_exfiltration,
        }
    }
}

/// User-supplied injection signature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomInjectionPattern {
    pub id: String,
    pub injection_type: InjectionType,
    /// Regular expression
    pub pattern: String,
    pub confidence: f64,
    #[serde(default)]
    pub description: String,
}

// ── Tool validator ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolValidatorConfig {
    pub enabled: bool,
    pub max_name_length: usize,
    /// Prefix used when suggesting a namespaced name for a dotted one
    pub default_prefix: String,
    pub require_description: bool,
    pub require_category: bool,
    pub require_input_schema: bool,
    /// Extra regexes a tool name must not match
    pub forbidden_patterns: Vec<String>,
}

impl Default for ToolValidatorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_name_length: 128,
            default_prefix: "hawkeye".into(),
            require_description: true,
            require_category: false,
            require_input_schema: false,
            forbidden_patterns: Vec::new(),
        }
    }
}

// ── Permissions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionConfig {
    /// Verdict when no rule matches
    pub default_level: PermissionLevel,
    pub max_cached_permissions: usize,
    /// Lifetime of a cached confirmation
    pub permission_ttl_secs: u64,
    pub load_builtin_policies: bool,
    pub policies: Vec<PermissionPolicy>,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            default_level: PermissionLevel::Prompt,
            max_cached_permissions: 500,
            permission_ttl_secs: 3600,
            load_builtin_policies: true,
            policies: Vec::new(),
        }
    }
}

// ── Audit ────────────────────────────────────────────────────────────────────

/// Minimum severity of audit entries mirrored to the console log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditConsoleLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub max_entries: usize,
    pub console_level: AuditConsoleLevel,
    /// Store parameter values (redacted) in context snapshots instead of keys only
    pub include_parameters: bool,
    /// Append every entry as a JSON line to `storage_path`
    pub persist: bool,
    pub storage_path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
            console_level: AuditConsoleLevel::Warn,
            include_parameters: false,
            persist: false,
            storage_path: "~/.hawkeye/audit.jsonl".into(),
        }
    }
}

// ── Rollback ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub enabled: bool,
    pub max_rollback_points: usize,
    pub persist_rollback_points: bool,
    /// Directory holding one `<id>.json` per rollback point
    pub storage_path: String,
    pub rollback_point_ttl_secs: u64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_rollback_points: 50,
            persist_rollback_points: false,
            storage_path: "~/.hawkeye/rollback".into(),
            rollback_point_ttl_secs: 7 * 24 * 3600,
        }
    }
}

impl RollbackConfig {
    pub fn storage_dir(&self) -> PathBuf {
        super::expand_path(&self.storage_path)
    }
}

// ── Command / filesystem scorers ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandSecurityConfig {
    pub level: SecurityLevel,
    /// When non-empty, every sub-command's base must be listed here
    pub allowed_commands: Vec<String>,
    /// Always blocked (except at level `off`)
    pub blocked_commands: Vec<String>,
    pub allow_sudo: bool,
    pub allow_network: bool,
}

impl Default for CommandSecurityConfig {
    fn default() -> Self {
        Self {
            level: SecurityLevel::Standard,
            allowed_commands: Vec::new(),
            blocked_commands: Vec::new(),
            allow_sudo: false,
            allow_network: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSystemSecurityConfig {
    pub level: SecurityLevel,
    /// Every path must resolve inside this directory when set
    pub sandbox_root: Option<String>,
    /// When non-empty, every path must be under one of these
    pub allowed_roots: Vec<String>,
    /// Prefixes or glob patterns that are always blocked
    pub forbidden_paths: Vec<String>,
    /// Extensions (without dot) that may not be written, created or executed
    pub blocked_extensions: Vec<String>,
}

impl Default for FileSystemSecurityConfig {
    fn default() -> Self {
        Self {
            level: SecurityLevel::Standard,
            sandbox_root: None,
            allowed_roots: Vec::new(),
            forbidden_paths: DEFAULT_FORBIDDEN_PATHS.iter().map(|p| (*p).into()).collect(),
            blocked_extensions: EXECUTABLE_EXTENSIONS.iter().map(|e| (*e).into()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_actions_per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_actions_per_hour: 100,
        }
    }
}
