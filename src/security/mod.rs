pub mod audit;
pub mod command;
pub mod context;
pub mod error;
pub mod filesystem;
pub mod injection;
pub mod patterns;
pub mod permission;
pub mod rate_limit;
pub mod rollback;
pub mod tool_validator;
pub mod unified;

pub use audit::{
    AuditEventType, AuditLogEntry, AuditLogger, AuditQuery, AuditResult, AuditStats, ExportFormat,
    SortOrder,
};
pub use command::{CommandCheckResult, CommandChecker};
pub use context::{ActionSource, ExecutionContext, PermissionLevel, ToolCategory};
pub use error::{Result, SecurityError};
pub use filesystem::{FileCheckResult, FileOperation, FileSystemGuard};
pub use injection::{InjectionDetectionResult, InjectionDetector, InjectionPattern, InjectionType};
pub use patterns::RiskLevel;
pub use permission::{
    ConfirmationHandler, DecisionSource, PermissionManager, PermissionPolicy, PermissionResult,
    PolicyRule, RulePattern, StaticConfirmation, ToolPermission,
};
pub use rate_limit::RateLimiter;
pub use rollback::{
    JsonFileStore, MemoryStore, RollbackManager, RollbackOperation, RollbackOperationType,
    RollbackPoint, RollbackResult, RollbackStats, RollbackStore,
};
pub use tool_validator::{ToolDefinition, ToolValidationResult, ToolValidator};
pub use unified::{SecurityCheckResult, SecurityStage, UnifiedSecurityManager};

use crate::config::SecurityConfig;
use std::sync::{Arc, OnceLock};

static DEFAULT_MANAGER: OnceLock<Arc<UnifiedSecurityManager>> = OnceLock::new();

/// Process-wide gate, built from default config on first use.
///
/// Prefer passing an explicit `UnifiedSecurityManager`. State here is shared
/// by every caller in the process, tests included.
pub fn default_manager() -> Arc<UnifiedSecurityManager> {
    DEFAULT_MANAGER
        .get_or_init(|| {
            let manager = UnifiedSecurityManager::from_config(&SecurityConfig::default())
                .unwrap_or_else(|e| {
                    tracing::warn!("Default security config failed, using bare components: {e:#}");
                    UnifiedSecurityManager::default()
                });
            Arc::new(manager)
        })
        .clone()
}

/// Install the process-wide gate. Fails, handing the manager back, if one is
/// already in place.
pub fn install_default_manager(
    manager: UnifiedSecurityManager,
) -> std::result::Result<(), Arc<UnifiedSecurityManager>> {
    DEFAULT_MANAGER.set(Arc::new(manager))
}

/// Mask a secret for logs: first 4 characters then `***`; short values become `***`.
pub fn redact(value: &str) -> String {
    if value.chars().count() <= 4 {
        "***".to_string()
    } else {
        let prefix: String = value.chars().take(4).collect();
        format!("{prefix}***")
    }
}
