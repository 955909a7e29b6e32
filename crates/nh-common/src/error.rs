//! Structured error model shared by every NotifyHub crate.
//!
//! Each crate that needs I/O-specific error variants (`nh_queue::QueueError`,
//! `nh_router::RouterError`) defines its own `thiserror` enum and converts
//! into [`Error`] at its public boundary, the same layering FlowCatalyst
//! uses between `fc-queue` and `fc-router`.

use std::fmt;
use std::time::Duration;

/// A structured error code. Matching is by variant equality, never by
/// string comparison of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Configuration
    InvalidConfig,
    MissingCredentials,
    // Message
    InvalidMessage,
    MessageTooLarge,
    EmptyMessage,
    UnknownFormat,
    TemplateRenderFailed,
    // Target
    InvalidTarget,
    EmptyTarget,
    UnsupportedTarget,
    TargetResolutionFailed,
    NoTargets,
    // Platform
    PlatformUnavailable,
    PlatformNotFound,
    PlatformTimeout,
    PlatformAuthFailed,
    PlatformRejected,
    // Network
    NetworkTimeout,
    ConnectionFailed,
    DnsFailed,
    SslError,
    // Rate limit
    RateLimitExceeded,
    QuotaExceeded,
    Throttled,
    // System
    InternalError,
    NotImplemented,
    ResourceExhausted,
    DeadlineExceeded,
    Cancelled,
    // Async
    OperationFailed,
    HandleNotFound,
    QueueFull,
    WorkerUnavailable,
}

impl ErrorCode {
    /// Static tag used in serialized/displayed form, matching spec.md's
    /// `SCREAMING_SNAKE_CASE` code table (e.g. `INVALID_MESSAGE`).
    pub fn tag(self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::MissingCredentials => "MISSING_CREDENTIALS",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::MessageTooLarge => "MESSAGE_TOO_LARGE",
            ErrorCode::EmptyMessage => "EMPTY_MESSAGE",
            ErrorCode::UnknownFormat => "UNKNOWN_FORMAT",
            ErrorCode::TemplateRenderFailed => "TEMPLATE_RENDER_FAILED",
            ErrorCode::InvalidTarget => "INVALID_TARGET",
            ErrorCode::EmptyTarget => "EMPTY_TARGET",
            ErrorCode::UnsupportedTarget => "UNSUPPORTED_TARGET",
            ErrorCode::TargetResolutionFailed => "TARGET_RESOLUTION_FAILED",
            ErrorCode::NoTargets => "NO_TARGETS",
            ErrorCode::PlatformUnavailable => "PLATFORM_UNAVAILABLE",
            ErrorCode::PlatformNotFound => "PLATFORM_NOT_FOUND",
            ErrorCode::PlatformTimeout => "PLATFORM_TIMEOUT",
            ErrorCode::PlatformAuthFailed => "PLATFORM_AUTH_FAILED",
            ErrorCode::PlatformRejected => "PLATFORM_REJECTED",
            ErrorCode::NetworkTimeout => "NETWORK_TIMEOUT",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::DnsFailed => "DNS_FAILED",
            ErrorCode::SslError => "SSL_ERROR",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::Throttled => "THROTTLED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::NotImplemented => "NOT_IMPLEMENTED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::OperationFailed => "OPERATION_FAILED",
            ErrorCode::HandleNotFound => "HANDLE_NOT_FOUND",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::WorkerUnavailable => "WORKER_UNAVAILABLE",
        }
    }

    /// Broad error category, per spec.md §7's taxonomy.
    pub fn category(self) -> ErrorCategory {
        use ErrorCategory::*;
        match self {
            ErrorCode::InvalidConfig | ErrorCode::MissingCredentials => Configuration,
            ErrorCode::InvalidMessage
            | ErrorCode::MessageTooLarge
            | ErrorCode::EmptyMessage
            | ErrorCode::UnknownFormat
            | ErrorCode::TemplateRenderFailed => Message,
            ErrorCode::InvalidTarget
            | ErrorCode::EmptyTarget
            | ErrorCode::UnsupportedTarget
            | ErrorCode::TargetResolutionFailed
            | ErrorCode::NoTargets => Target,
            ErrorCode::PlatformUnavailable
            | ErrorCode::PlatformNotFound
            | ErrorCode::PlatformTimeout
            | ErrorCode::PlatformAuthFailed
            | ErrorCode::PlatformRejected => Platform,
            ErrorCode::NetworkTimeout
            | ErrorCode::ConnectionFailed
            | ErrorCode::DnsFailed
            | ErrorCode::SslError => Network,
            ErrorCode::RateLimitExceeded | ErrorCode::QuotaExceeded | ErrorCode::Throttled => {
                RateLimit
            }
            ErrorCode::InternalError
            | ErrorCode::NotImplemented
            | ErrorCode::ResourceExhausted
            | ErrorCode::DeadlineExceeded
            | ErrorCode::Cancelled => System,
            ErrorCode::OperationFailed
            | ErrorCode::HandleNotFound
            | ErrorCode::QueueFull
            | ErrorCode::WorkerUnavailable => Async,
        }
    }

    /// Default priority, highest first. Used by handlers/metrics to weight
    /// alerting without needing to re-derive it from the category.
    pub fn priority(self) -> u8 {
        match self.category() {
            ErrorCategory::System => 5,
            ErrorCategory::Platform => 4,
            ErrorCategory::Network => 4,
            ErrorCategory::RateLimit => 3,
            ErrorCategory::Async => 3,
            ErrorCategory::Target => 2,
            ErrorCategory::Message => 2,
            ErrorCategory::Configuration => 1,
        }
    }

    /// Whether this code is, by default, eligible for retry. Individual
    /// [`Error`] values may still override this via their `retryable` field
    /// (e.g. a platform returning 4xx sets `retryable: false` regardless).
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::PlatformTimeout
                | ErrorCode::PlatformUnavailable
                | ErrorCode::NetworkTimeout
                | ErrorCode::ConnectionFailed
                | ErrorCode::DnsFailed
                | ErrorCode::RateLimitExceeded
                | ErrorCode::Throttled
                | ErrorCode::ResourceExhausted
                | ErrorCode::QueueFull
                | ErrorCode::WorkerUnavailable
        )
    }

    /// Whether this code's message is safe to show directly to an end user
    /// (vs. an internal diagnostic that should be summarized instead).
    pub fn user_facing(self) -> bool {
        !matches!(
            self,
            ErrorCode::InternalError | ErrorCode::NotImplemented | ErrorCode::DeadlineExceeded
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Broad error category, per spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    Message,
    Target,
    Platform,
    Network,
    RateLimit,
    System,
    Async,
}

/// A structured, user-inspectable error.
///
/// Deliberately not a `thiserror` enum itself — spec.md §4.2 calls for a
/// single carrier type with optional platform/target/cause fields rather
/// than one variant per failure shape; per-crate `thiserror` enums
/// (`QueueError`, `RouterError`) convert into this at their boundary.
#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub platform: Option<String>,
    pub target: Option<String>,
    pub cause: Option<String>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            retryable: code.default_retryable(),
            code,
            message: message.into(),
            platform: None,
            target: None,
            cause: None,
            retry_after: None,
        }
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.tag(), self.message)?;
        if let Some(platform) = &self.platform {
            write!(f, " (platform={platform})")?;
        }
        if let Some(target) = &self.target {
            write!(f, " (target={target})")?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

/// Is this code one of the `Configuration` category?
pub fn is_config_error(err: &Error) -> bool {
    err.code.category() == ErrorCategory::Configuration
}

/// Is this code one of the `Platform` category?
pub fn is_platform_error(err: &Error) -> bool {
    err.code.category() == ErrorCategory::Platform
}

/// Is this code one of the `Network` category?
pub fn is_network_error(err: &Error) -> bool {
    err.code.category() == ErrorCategory::Network
}

/// Retryability is by the error's own flag, not re-derived from the code —
/// a sender may downgrade an otherwise-retryable code (e.g. a 429 with no
/// `Retry-After` left) to non-retryable after exhausting attempts.
pub fn is_retryable_error(err: &Error) -> bool {
    err.retryable
}

/// "Temporary" errors are network/platform/rate-limit errors expected to
/// clear on their own, as opposed to configuration/message errors that
/// require caller intervention.
pub fn is_temporary_error(err: &Error) -> bool {
    matches!(
        err.code.category(),
        ErrorCategory::Network | ErrorCategory::Platform | ErrorCategory::RateLimit
    ) && err.retryable
}
