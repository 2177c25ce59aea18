//! Error types for webhook delivery operations.
//!
//! Every failed attempt ends up as a `DeliveryError` whose `Display` text is
//! stored on the event row, so messages stay short and carry the HTTP status
//! where there is one.

use std::{fmt, time::Duration};

use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised while delivering webhooks or running the service.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// HTTP response indicated client error (4xx).
    #[error("client error: HTTP {status_code}")]
    ClientError {
        /// HTTP status code (4xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// HTTP response indicated server error (5xx).
    #[error("server error: HTTP {status_code}")]
    ServerError {
        /// HTTP status code (5xx)
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Destination resolves to an address the guard refuses to dial.
    #[error("unsafe destination {url}: {reason}")]
    UnsafeDestination {
        /// Rejected URL
        url: String,
        /// Why it was rejected
        reason: String,
    },

    /// Destination URL could not be parsed or uses an unsupported scheme.
    #[error("invalid webhook url {url}: {reason}")]
    InvalidUrl {
        /// Rejected URL
        url: String,
        /// Parse or scheme failure
        reason: String,
    },

    /// Payload could not be serialized.
    #[error("payload serialization failed: {message}")]
    Serialization {
        /// Serializer error message
        message: String,
    },

    /// The delivery was cancelled before it completed.
    #[error("delivery cancelled")]
    Cancelled,

    /// Database operation failed during delivery.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Invalid service configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// The notification subscription could not be established.
    #[error("subscription failed after {attempts} attempts: {message}")]
    SubscriptionFailed {
        /// Attempts made
        attempts: u32,
        /// Last error seen
        message: String,
    },

    /// Graceful shutdown did not finish in time.
    #[error("shutdown did not complete within {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Worker index
        worker_id: usize,
        /// Join error text
        error: String,
    },

    /// Unexpected internal error.
    #[error("internal delivery error: {message}")]
    InternalError {
        /// Internal error message
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a timeout error for `elapsed`, rounding partial seconds up
    /// so a sub-second deadline never reads as `0s`.
    pub fn timeout_after(elapsed: Duration) -> Self {
        let seconds = elapsed.as_secs().saturating_add(u64::from(elapsed.subsec_nanos() > 0));
        Self::timeout(seconds)
    }

    /// Creates a client error from HTTP response.
    pub fn client_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ClientError { status_code, body: body.into() }
    }

    /// Creates a server error from HTTP response.
    pub fn server_error(status_code: u16, body: impl Into<String>) -> Self {
        Self::ServerError { status_code, body: body.into() }
    }

    /// Builds the HTTP error matching `status_code`.
    pub fn from_status(status_code: u16, body: impl Into<String>) -> Self {
        if status_code >= 500 {
            Self::server_error(status_code, body)
        } else {
            Self::client_error(status_code, body)
        }
    }

    /// Creates an unsafe destination error.
    pub fn unsafe_destination(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsafeDestination { url: url.into(), reason: reason.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into(), reason: reason.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into() }
    }

    /// Returns true if retrying the same request could plausibly succeed.
    ///
    /// Network failures, timeouts, HTTP errors and cancellation are
    /// transient. Destination validation failures will fail the same way
    /// until the webhook is reconfigured.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::ClientError { .. }
            | Self::ServerError { .. }
            | Self::Cancelled
            | Self::DatabaseError { .. } => true,

            Self::UnsafeDestination { .. }
            | Self::InvalidUrl { .. }
            | Self::Serialization { .. }
            | Self::ConfigurationError { .. }
            | Self::SubscriptionFailed { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Returns true for destination validation failures.
    pub fn is_destination_rejected(&self) -> bool {
        matches!(self, Self::UnsafeDestination { .. } | Self::InvalidUrl { .. })
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ClientError { status_code, .. } | Self::ServerError { status_code, .. } => {
                Some(*status_code)
            },
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::timeout(0);
        }
        Self::network(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization { message: err.to_string() }
    }
}

impl From<hookline_core::CoreError> for DeliveryError {
    fn from(err: hookline_core::CoreError) -> Self {
        Self::database(err.to_string())
    }
}

/// Category of delivery error for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Network,
    /// HTTP client errors (4xx).
    Client,
    /// HTTP server errors (5xx).
    Server,
    /// Destination rejected before dialing.
    Destination,
    /// Database operations.
    Database,
    /// Configuration problems.
    Configuration,
    /// Lifecycle: cancellation, subscription, shutdown.
    Lifecycle,
    /// Internal system errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::ClientError { .. } => Self::Client,
            DeliveryError::ServerError { .. } => Self::Server,
            DeliveryError::UnsafeDestination { .. } | DeliveryError::InvalidUrl { .. } => {
                Self::Destination
            },
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::Cancelled
            | DeliveryError::SubscriptionFailed { .. }
            | DeliveryError::ShutdownTimeout { .. } => Self::Lifecycle,
            DeliveryError::Serialization { .. }
            | DeliveryError::WorkerPanic { .. }
            | DeliveryError::InternalError { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Client => write!(f, "client"),
            Self::Server => write!(f, "server"),
            Self::Destination => write!(f, "destination"),
            Self::Database => write!(f, "database"),
            Self::Configuration => write!(f, "configuration"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
