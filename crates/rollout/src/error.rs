//! Error types for deployment orchestration.
//!
//! Errors are categorized so the engine can decide what to retry, what to
//! hand to recovery and what must stop the run immediately.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while orchestrating a deployment.
#[derive(Debug, Error)]
pub enum Error {
    /// A fatal prerequisite check failed; nothing was mutated
    #[error("prerequisite '{check}' failed: {message}")]
    PrerequisiteFailure { check: String, message: String },

    /// Desired state for a phase could not be rendered
    #[error("cannot render phase '{phase}': {message}")]
    ConfigRender { phase: String, message: String },

    /// Creating or updating a resource failed
    #[error("apply of {resource} failed: {message}")]
    Apply {
        resource: String,
        message: String,
        transient: bool,
    },

    /// A phase did not become ready within its timeout
    #[error("phase '{phase}' not ready after {}s (waiting on: {})", .elapsed.as_secs(), .pending.join(", "))]
    ReadinessTimeout {
        phase: String,
        elapsed: Duration,
        pending: Vec<String>,
    },

    /// The phase was interrupted by a cancellation request
    #[error("phase '{phase}' cancelled")]
    Cancelled { phase: String },

    /// One or more critical validation checks failed
    #[error("critical validation checks failed: {}", .checks.join(", "))]
    ValidationFailure { checks: Vec<String> },

    /// Teardown left tracked resources behind
    #[error("teardown left {} resource(s) behind: {}", .remaining.len(), .remaining.join(", "))]
    TeardownLeak { remaining: Vec<String> },

    /// The remote system rejected or failed a call
    #[error("remote error: {message}")]
    Remote { message: String, transient: bool },

    /// A resource is not tracked by this run
    #[error("resource {0} is not tracked")]
    Untracked(String),

    /// Resource status change that would violate the ledger invariants
    #[error("resource {resource} cannot move from {from} to {to}")]
    StatusTransition {
        resource: String,
        from: String,
        to: String,
    },

    /// Run lifecycle transition that the state machine forbids
    #[error("run cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The plan itself is malformed
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Worker pool could not be created
    #[error("worker pool: {0}")]
    WorkerPool(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a transient remote error (timeouts, throttling, connection resets).
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            transient: true,
        }
    }

    /// Create a permanent remote error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether the error is typically transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Remote { transient, .. } | Self::Apply { transient, .. } => *transient,
            _ => false,
        }
    }

    /// Whether the recovery controller can pick the run up after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Apply { .. } | Self::ReadinessTimeout { .. } | Self::Cancelled { .. }
        )
    }
}

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::transient("connection reset").is_retryable());
        assert!(!Error::permanent("forbidden").is_retryable());
        assert!(
            !Error::ConfigRender {
                phase: "core".into(),
                message: "missing overlay".into(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_recoverable_classification() {
        let timeout = Error::ReadinessTimeout {
            phase: "operators".into(),
            elapsed: Duration::from_secs(300),
            pending: vec!["Deployment/ops/engine".into()],
        };
        assert!(timeout.is_recoverable());
        assert!(
            !Error::PrerequisiteFailure {
                check: "cluster-access".into(),
                message: "unauthorized".into(),
            }
            .is_recoverable()
        );
    }

    #[test]
    fn test_timeout_message_names_pending_resources() {
        let err = Error::ReadinessTimeout {
            phase: "storage".into(),
            elapsed: Duration::from_secs(120),
            pending: vec!["PersistentVolumeClaim/data/models".into()],
        };
        let message = err.to_string();
        assert!(message.contains("storage"));
        assert!(message.contains("120s"));
        assert!(message.contains("PersistentVolumeClaim/data/models"));
    }
}
