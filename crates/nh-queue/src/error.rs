//! Queue-local error type, converted into [`nh_common::Error`] at the
//! `Dispatcher`/`Client` boundary (mirrors `fc-queue::QueueError` converting
//! into `fc-router::RouterError`).

use nh_common::{Error, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is stopped")]
    Stopped,
    #[error("queue is full")]
    Full,
    #[error("enqueue deadline elapsed")]
    DeadlineElapsed,
    #[error("handle not found: {0}")]
    HandleNotFound(String),
    #[error("operation was cancelled")]
    Cancelled,
    #[error("worker unavailable")]
    WorkerUnavailable,
}

impl From<QueueError> for Error {
    fn from(err: QueueError) -> Self {
        let code = match err {
            QueueError::Stopped => ErrorCode::QueueFull, // permanent, non-retryable below
            QueueError::Full => ErrorCode::QueueFull,
            QueueError::DeadlineElapsed => ErrorCode::DeadlineExceeded,
            QueueError::HandleNotFound(_) => ErrorCode::HandleNotFound,
            QueueError::Cancelled => ErrorCode::Cancelled,
            QueueError::WorkerUnavailable => ErrorCode::WorkerUnavailable,
        };
        let retryable = !matches!(err, QueueError::Stopped | QueueError::Cancelled);
        Error::new(code, err.to_string()).with_retryable(retryable)
    }
}
