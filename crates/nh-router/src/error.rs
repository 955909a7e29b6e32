//! Router-local error type, converted into [`nh_common::Error`] at the
//! `Client`/`Dispatcher` boundary (mirrors `fc-router::RouterError`).

use nh_common::{Error, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no targets supplied")]
    NoTargets,
    #[error("unroutable targets: {0:?}")]
    Unroutable(Vec<String>),
    #[error("sender not found: {0}")]
    SenderNotFound(String),
    #[error("sender {0} already registered with a different factory")]
    DuplicateSender(String),
    #[error("circuit open for platform {0}")]
    CircuitOpen(String),
    #[error("invalid sender configuration: {0}")]
    InvalidConfig(String),
    #[error("all platforms failed wholesale")]
    AllPlatformsFailed,
    #[error(transparent)]
    Queue(#[from] nh_queue::QueueError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl From<RouterError> for Error {
    fn from(err: RouterError) -> Self {
        let code = match &err {
            RouterError::NoTargets => ErrorCode::NoTargets,
            RouterError::Unroutable(_) => ErrorCode::TargetResolutionFailed,
            RouterError::SenderNotFound(_) => ErrorCode::PlatformNotFound,
            RouterError::DuplicateSender(_) => ErrorCode::InvalidConfig,
            RouterError::CircuitOpen(_) => ErrorCode::ResourceExhausted,
            RouterError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            RouterError::AllPlatformsFailed => ErrorCode::PlatformUnavailable,
            RouterError::Queue(_) => ErrorCode::OperationFailed,
            RouterError::Http(_) => ErrorCode::ConnectionFailed,
            RouterError::Serialization(_) => ErrorCode::InvalidMessage,
        };
        let retryable = matches!(
            err,
            RouterError::Http(_) | RouterError::Queue(_) | RouterError::AllPlatformsFailed
        );
        Error::new(code, err.to_string()).with_retryable(retryable)
    }
}
