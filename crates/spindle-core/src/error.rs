use std::time::Duration;

use thiserror::Error;

use crate::domain::{TaskId, TaskType};
use crate::ports::StoreError;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Another task holding the same unique key is still alive.
    #[error("a task with unique key {0} already exists")]
    DuplicateTask(String),

    /// The entry was no longer in its source container.
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("no task available")]
    NoTaskAvailable,

    #[error("broker unavailable: {0}")]
    BrokerUnavailable(#[from] StoreError),

    #[error("corrupted task record: {0}")]
    Codec(#[from] serde_json::Error),
}

impl BrokerError {
    /// True for outcomes callers handle locally instead of surfacing.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::TaskNotFound(_) | Self::NoTaskAvailable)
    }
}

/// Why a single attempt failed. Every variant leads to a retry or a kill.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("no handler registered for task_type={0}")]
    UnknownTaskType(TaskType),

    #[error("payload decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("canceled by shutdown")]
    Canceled,
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_surface_as_unavailable() {
        let err: BrokerError = StoreError::Connection("refused".into()).into();
        assert!(matches!(err, BrokerError::BrokerUnavailable(_)));
        assert!(!err.is_benign());
        assert_eq!(err.to_string(), "broker unavailable: store connection failed: refused");
    }

    #[test]
    fn handler_errors_render_their_reason() {
        assert_eq!(HandlerError::failed("boom").to_string(), "boom");
        assert_eq!(
            HandlerError::UnknownTaskType(TaskType::new("nope")).to_string(),
            "no handler registered for task_type=nope"
        );
    }
}
