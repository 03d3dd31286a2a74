//! Error types for the planning engine
//!
//! Step failures are not errors: they are classified (see [`crate::classifier`])
//! and reported through the execution outcome. The variants here cover the
//! cases where the engine itself cannot proceed.

use crate::classifier::ClassifiedError;

/// Main engine error type
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Entity missing from the store
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A status transition that the state machine does not allow
    #[error("invalid transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    /// A step was started while one of its dependencies was not completed.
    /// This is a caller bug, never a recoverable step failure.
    #[error("step {step_id} started before dependency {dependency} completed")]
    DependencyViolation { step_id: String, dependency: String },

    /// The plan's step graph is malformed (no steps, missing target, cycle)
    #[error("structural violation: {0}")]
    StructuralViolation(String),

    /// Another process or plan already holds execution responsibility
    #[error("execution conflict for plan {plan_id}: {reason}")]
    ExecutionConflict { plan_id: String, reason: String },

    /// Automatic recovery is exhausted and a human must act
    #[error("task {task_id} requires human intervention: {reason}")]
    RequiresHumanIntervention {
        task_id: String,
        reason: String,
        /// The failure that triggered the escalation
        last_error: Option<Box<ClassifiedError>>,
    },

    /// The decomposer could not produce a usable plan body
    #[error("decomposition failed: {0}")]
    Decomposition(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// Timeout
    #[error("operation timed out after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Collaborator failure (store, transport, IO)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Shorthand for a missing task
    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "task",
            id: id.into(),
        }
    }

    /// Shorthand for a missing plan
    pub fn plan_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "plan",
            id: id.into(),
        }
    }

    /// Recover an engine error wrapped in an `anyhow` chain, or wrap the chain
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        match error.downcast::<EngineError>() {
            Ok(engine) => engine,
            Err(other) => Self::Other(other),
        }
    }

    /// Check if error requires human intervention
    pub fn requires_human(&self) -> bool {
        matches!(self, Self::RequiresHumanIntervention { .. })
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = EngineError::task_not_found("t-1");
        assert_eq!(err.to_string(), "task not found: t-1");

        let err = EngineError::DependencyViolation {
            step_id: "b".to_string(),
            dependency: "a".to_string(),
        };
        assert!(err.to_string().contains("before dependency a"));
        assert!(!err.requires_human());
    }

    #[test]
    fn test_from_anyhow_keeps_engine_errors() {
        let wrapped: anyhow::Error = EngineError::Decomposition("empty reply".to_string()).into();
        assert!(matches!(
            EngineError::from_anyhow(wrapped),
            EngineError::Decomposition(_)
        ));

        let plain = anyhow::anyhow!("disk on fire");
        assert!(matches!(EngineError::from_anyhow(plain), EngineError::Other(_)));
    }

    #[test]
    fn test_requires_human() {
        let err = EngineError::RequiresHumanIntervention {
            task_id: "t-1".to_string(),
            reason: "max attempts".to_string(),
            last_error: None,
        };
        assert!(err.requires_human());
    }
}
