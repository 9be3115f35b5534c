use super::context::PermissionLevel;
use super::injection::InjectionType;
use super::rollback::RollbackOperationType;

/// Failure modes of the security core.
///
/// Validation problems are normally reported through
/// [`ToolValidationResult`](super::tool_validator::ToolValidationResult) and
/// only become a `SecurityError` when a caller asks for a hard failure.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("{injection_type} detected in {location}: `{pattern}`")]
    InjectionDetected {
        injection_type: InjectionType,
        pattern: String,
        location: String,
    },

    #[error("permission denied ({level}): {reason}")]
    PermissionDenied {
        level: PermissionLevel,
        reason: String,
    },

    #[error("confirmation rejected for {tool_id}")]
    ConfirmationRejected { tool_id: String },

    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("rollback point not found: {0}")]
    RollbackPointNotFound(String),

    #[error("rollback point {0} is already being rolled back")]
    RollbackInProgress(String),

    #[error("{0} operations cannot be rolled back")]
    NonRecoverableOperation(RollbackOperationType),

    #[error("rollback of operation {operation_id} failed: {message}")]
    RollbackFailed {
        operation_id: String,
        message: String,
    },

    #[error("no pre-state recorded for {0}")]
    MissingPreState(String),

    #[error("invalid pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl SecurityError {
    /// Whether retrying (after fixing the environment) could succeed.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::NonRecoverableOperation(_))
    }
}

pub type Result<T> = std::result::Result<T, SecurityError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_recoverable_is_flagged() {
        let err = SecurityError::NonRecoverableOperation(RollbackOperationType::CommandExecute);
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "command_execute operations cannot be rolled back"
        );
    }

    #[test]
    fn validation_joins_messages() {
        let err = SecurityError::Validation(vec!["a".into(), "b".into()]);
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "validation failed: a; b");
    }

    #[test]
    fn permission_denied_carries_reason() {
        let err = SecurityError::PermissionDenied {
            level: PermissionLevel::Deny,
            reason: "root filesystem wipe".into(),
        };
        assert!(err.to_string().contains("root filesystem wipe"));
        assert!(err.to_string().contains("deny"));
    }
}
