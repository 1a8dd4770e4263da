use std::time::Duration;

use thiserror::Error;

use crate::runtime::task::{TaskId, TaskStatus};

pub type Result<T> = std::result::Result<T, CancelerError>;

#[derive(Debug, Error)]
pub enum CancelerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("task {id} closed with status {status}")]
    ChildClosed { id: TaskId, status: TaskStatus },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote error (status {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("operation {operation} timed out after {timeout:?}")]
    OperationTimedOut {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("payload not found in storage for key={0}")]
    PayloadNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("unexpected output for operation {0}")]
    UnexpectedOutput(&'static str),
}

impl CancelerError {
    /// Transient failures are retried by the dispatcher; everything else aborts the call.
    pub fn is_retryable(&self) -> bool {
        match self {
            CancelerError::Transport(_) | CancelerError::Storage(_) => true,
            CancelerError::Remote { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for CancelerError {
    fn from(e: serde_json::Error) -> Self {
        CancelerError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for CancelerError {
    fn from(e: std::io::Error) -> Self {
        CancelerError::Storage(e.to_string())
    }
}

impl From<redis::RedisError> for CancelerError {
    fn from(e: redis::RedisError) -> Self {
        CancelerError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for CancelerError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => CancelerError::Remote {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => CancelerError::Transport(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert!(CancelerError::Transport("reset".into()).is_retryable());
        assert!(CancelerError::Remote { status: 503, message: "busy".into() }.is_retryable());
        assert!(CancelerError::Remote { status: 429, message: "slow down".into() }.is_retryable());
        assert!(!CancelerError::Remote { status: 400, message: "bad query".into() }.is_retryable());
        assert!(!CancelerError::PayloadNotFound("k".into()).is_retryable());
        assert!(!CancelerError::MissingCredentials("api key".into()).is_retryable());
    }
}
