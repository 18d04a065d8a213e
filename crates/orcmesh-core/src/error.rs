//! Top-level typed error for the orchestrator's public surface.

use thiserror::Error;
use uuid::Uuid;

/// Result alias used across the public API.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Errors returned from the orchestrator's public API.
///
/// Internal plumbing between subcomponents may still use `anyhow::Result`
/// for convenience; every boundary that crosses the public API surface
/// returns one of these variants instead.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    #[error("queue full: {pending} pending tasks at capacity {capacity}")]
    QueueFull { pending: usize, capacity: usize },

    #[error("resource exhausted: requested {requested}, available {available}")]
    ResourceExhausted { requested: f64, available: f64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error("internal error [{correlation_id}]: {message}")]
    Internal {
        correlation_id: Uuid,
        message: String,
    },
}

impl OrchestratorError {
    /// Wrap an arbitrary internal fault as an `Internal` variant, generating
    /// a fresh correlation id for cross-referencing with emitted events.
    pub fn internal(message: impl Into<String>) -> Self {
        OrchestratorError::Internal {
            correlation_id: Uuid::new_v4(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_generates_unique_correlation_ids() {
        let a = OrchestratorError::internal("boom");
        let b = OrchestratorError::internal("boom");
        match (a, b) {
            (
                OrchestratorError::Internal { correlation_id: a, .. },
                OrchestratorError::Internal { correlation_id: b, .. },
            ) => assert_ne!(a, b),
            _ => unreachable!(),
        }
    }

    #[test]
    fn display_messages_are_human_readable() {
        let err = OrchestratorError::QueueFull {
            pending: 10,
            capacity: 10,
        };
        assert_eq!(
            err.to_string(),
            "queue full: 10 pending tasks at capacity 10"
        );
    }
}
