//! The single gate every sensitive action passes through.
//!
//! [`UnifiedSecurityManager::check_security`] runs injection detection, tool
//! name validation, the optional rate limit and permission evaluation in that
//! order. The first stage that denies stops the pipeline. Every outcome is
//! written to the audit log.

use super::audit::{AuditEventType, AuditLogEntry, AuditLogger, AuditResult};
use super::command::{CommandCheckResult, CommandChecker};
use super::context::{ExecutionContext, PermissionLevel};
use super::error::{Result, SecurityError};
use super::filesystem::{FileCheckResult, FileOperation, FileSystemGuard};
use super::injection::{InjectionDetectionResult, InjectionDetector};
use super::permission::{PermissionManager, PermissionResult};
use super::rate_limit::RateLimiter;
use super::rollback::{RollbackManager, RollbackResult};
use super::tool_validator::{ToolValidationResult, ToolValidator};
use crate::config::SecurityConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Gate stage that produced a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityStage {
    Injection,
    Validation,
    RateLimit,
    Permission,
}

impl std::fmt::Display for SecurityStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Injection => write!(f, "injection"),
            Self::Validation => write!(f, "validation"),
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Permission => write!(f, "permission"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityCheckResult {
    pub allowed: bool,
    pub requires_confirmation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<SecurityStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injection: Option<InjectionDetectionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ToolValidationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission: Option<PermissionResult>,
}

impl SecurityCheckResult {
    fn deny(mut self, stage: SecurityStage, reason: impl Into<String>) -> Self {
        self.allowed = false;
        self.denied_by = Some(stage);
        self.reason = Some(reason.into());
        self
    }

    /// Turn a denial into the matching [`SecurityError`].
    pub fn into_result(self, tool_id: &str) -> Result<Self> {
        if self.allowed {
            return Ok(self);
        }
        let reason = self.reason.clone().unwrap_or_else(|| "denied".into());
        let err = match (self.denied_by, &self.injection, &self.validation, &self.permission) {
            (Some(SecurityStage::Injection), Some(found), _, _) => match found.injection_type {
                Some(injection_type) => SecurityError::InjectionDetected {
                    injection_type,
                    pattern: found.pattern.clone().unwrap_or_default(),
                    location: found.location.clone().unwrap_or_else(|| "input".into()),
                },
                None => SecurityError::PermissionDenied {
                    level: PermissionLevel::Deny,
                    reason,
                },
            },
            (Some(SecurityStage::Validation), _, Some(validation), _) => {
                SecurityError::Validation(validation.errors.clone())
            }
            // A prompt answered with "no" ends at deny; an unanswered one stays at prompt.
            (_, _, _, Some(permission))
                if permission.requires_confirmation && permission.level == PermissionLevel::Deny =>
            {
                SecurityError::ConfirmationRejected {
                    tool_id: tool_id.to_string(),
                }
            }
            (_, _, _, Some(permission)) => SecurityError::PermissionDenied {
                level: permission.level,
                reason,
            },
            _ => SecurityError::PermissionDenied {
                level: PermissionLevel::Deny,
                reason,
            },
        };
        Err(err)
    }
}

pub struct UnifiedSecurityManager {
    enabled: bool,
    injection: Arc<InjectionDetector>,
    validator: Arc<ToolValidator>,
    permissions: Arc<PermissionManager>,
    audit: Arc<AuditLogger>,
    rollback: Arc<RollbackManager>,
    command: Arc<CommandChecker>,
    filesystem: Arc<FileSystemGuard>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

/// Default components, no policies, no rate limit. Meant for embedding and tests.
impl Default for UnifiedSecurityManager {
    fn default() -> Self {
        Self {
            enabled: true,
            injection: Arc::new(InjectionDetector::default()),
            validator: Arc::new(ToolValidator::default()),
            permissions: Arc::new(PermissionManager::default()),
            audit: Arc::new(AuditLogger::default()),
            rollback: Arc::new(RollbackManager::default()),
            command: Arc::new(CommandChecker::default()),
            filesystem: Arc::new(FileSystemGuard::default()),
            rate_limiter: None,
        }
    }
}

impl UnifiedSecurityManager {
    pub fn from_config(config: &SecurityConfig) -> anyhow::Result<Self> {
        let injection = InjectionDetector::from_config(&config.injection)
            .context("Failed to build injection detector")?;
        let validator = ToolValidator::from_config(&config.tool_validator)
            .context("Failed to build tool validator")?;
        let permissions = PermissionManager::from_config(&config.permissions)
            .context("Failed to build permission manager")?;
        let rollback =
            RollbackManager::open(config.rollback.clone()).context("Failed to open rollback ledger")?;
        let rate_limiter = config
            .rate_limit
            .enabled
            .then(|| Arc::new(RateLimiter::from_config(&config.rate_limit)));

        tracing::info!(
            enabled = config.enabled,
            policies = permissions.list_policies().len(),
            rollback_points = rollback.list_rollback_points().len(),
            rate_limit = rate_limiter.is_some(),
            "Security manager initialized"
        );

        Ok(Self {
            enabled: config.enabled,
            injection: Arc::new(injection),
            validator: Arc::new(validator),
            permissions: Arc::new(permissions),
            audit: Arc::new(AuditLogger::from_config(&config.audit)),
            rollback: Arc::new(rollback),
            command: Arc::new(CommandChecker::from_config(&config.command)),
            filesystem: Arc::new(FileSystemGuard::from_config(&config.filesystem)),
            rate_limiter,
        })
    }

    // ── Builders ──

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_injection_detector(mut self, detector: InjectionDetector) -> Self {
        self.injection = Arc::new(detector);
        self
    }

    pub fn with_tool_validator(mut self, validator: ToolValidator) -> Self {
        self.validator = Arc::new(validator);
        self
    }

    pub fn with_permission_manager(mut self, permissions: PermissionManager) -> Self {
        self.permissions = Arc::new(permissions);
        self
    }

    pub fn with_audit_logger(mut self, audit: AuditLogger) -> Self {
        self.audit = Arc::new(audit);
        self
    }

    pub fn with_rollback_manager(mut self, rollback: RollbackManager) -> Self {
        self.rollback = Arc::new(rollback);
        self
    }

    pub fn with_command_checker(mut self, command: CommandChecker) -> Self {
        self.command = Arc::new(command);
        self
    }

    pub fn with_filesystem_guard(mut self, filesystem: FileSystemGuard) -> Self {
        self.filesystem = Arc::new(filesystem);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.rate_limiter = Some(Arc::new(limiter));
        self
    }

    // ── Gate ──

    pub async fn check_security(&self, context: &ExecutionContext) -> SecurityCheckResult {
        let mut result = SecurityCheckResult::default();

        if !self.enabled {
            let mut details = Map::new();
            details.insert("security_enabled".into(), Value::Bool(false));
            self.audit.log(
                AuditEventType::PermissionCheck,
                &context.action,
                AuditResult::Allowed,
                Some(context),
                details,
            );
            result.allowed = true;
            result.reason = Some("Security checks are disabled".into());
            return result;
        }

        let detection = self.injection.detect_in_context(context);
        if detection.detected {
            self.audit.log_injection_detected(context, &detection);
            let reason = format!(
                "{} detected in {}",
                detection
                    .injection_type
                    .map_or_else(|| "injection".to_string(), |t| t.to_string()),
                detection.location.as_deref().unwrap_or("input")
            );
            tracing::warn!(tool = %context.tool_id, "Blocked: {reason}");
            result.injection = Some(detection);
            return result.deny(SecurityStage::Injection, reason);
        }
        result.injection = Some(detection);

        if self.validator.is_enabled() {
            let validation = self.validator.validate_name(&context.tool_id);
            if !validation.valid {
                self.audit.log_tool_validation(context, &validation);
                let reason = format!("Invalid tool name: {}", validation.errors.join("; "));
                tracing::warn!(tool = %context.tool_id, "Blocked: {reason}");
                result.validation = Some(validation);
                return result.deny(SecurityStage::Validation, reason);
            }
            result.validation = Some(validation);
        }

        if let Some(limiter) = &self.rate_limiter {
            let key = context.session_id.as_deref().unwrap_or(&context.tool_id);
            if !limiter.record_action(key) {
                self.audit
                    .log_rate_limit_exceeded(context, limiter.max_actions_per_hour());
                tracing::warn!(tool = %context.tool_id, key, "Blocked: rate limit exceeded");
                return result.deny(
                    SecurityStage::RateLimit,
                    format!(
                        "Rate limit exceeded: {} actions per hour",
                        limiter.max_actions_per_hour()
                    ),
                );
            }
        }

        let permission = self.permissions.check_permission(context).await;
        self.audit.log_permission_check(context, &permission);
        result.allowed = permission.allowed;
        result.requires_confirmation = permission.requires_confirmation;
        result.reason = permission.reason.clone();
        if !permission.allowed {
            result.denied_by = Some(SecurityStage::Permission);
            tracing::info!(
                tool = %context.tool_id,
                level = %permission.level,
                "Blocked by permission check"
            );
        }
        result.permission = Some(permission);
        result
    }

    /// [`check_security`](Self::check_security), with a denial as an error.
    pub async fn enforce(&self, context: &ExecutionContext) -> Result<SecurityCheckResult> {
        self.check_security(context)
            .await
            .into_result(&context.tool_id)
    }

    // ── Helpers ──

    pub fn log_sensitive_operation(
        &self,
        context: &ExecutionContext,
        operation: &str,
        details: Map<String, Value>,
    ) -> AuditLogEntry {
        self.audit.log_sensitive_operation(context, operation, details)
    }

    pub fn check_command(&self, command: &str) -> CommandCheckResult {
        self.command.check(command)
    }

    pub fn check_path(&self, path: &str, operation: FileOperation) -> FileCheckResult {
        self.filesystem.check(path, operation)
    }

    /// Roll back a point and record the outcome in the audit log.
    pub fn rollback(&self, id: &str) -> Result<RollbackResult> {
        match self.rollback.rollback(id) {
            Ok(result) => {
                self.audit.log_rollback(&result);
                Ok(result)
            }
            Err(e) => {
                self.audit.log_error(None, &format!("Rollback of {id} failed: {e}"));
                Err(e)
            }
        }
    }

    // ── Accessors ──

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn injection_detector(&self) -> &Arc<InjectionDetector> {
        &self.injection
    }

    pub fn tool_validator(&self) -> &Arc<ToolValidator> {
        &self.validator
    }

    pub fn permission_manager(&self) -> &Arc<PermissionManager> {
        &self.permissions
    }

    pub fn audit_logger(&self) -> &Arc<AuditLogger> {
        &self.audit
    }

    pub fn rollback_manager(&self) -> &Arc<RollbackManager> {
        &self.rollback
    }

    pub fn command_checker(&self) -> &Arc<CommandChecker> {
        &self.command
    }

    pub fn filesystem_guard(&self) -> &Arc<FileSystemGuard> {
        &self.filesystem
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }
}
