//! Error types and result handling for event store operations.
//!
//! Defines the error taxonomy shared by every crate in the workspace:
//! validation failures raised before any backend call, transport failures
//! talking to the graph backend, graph-level rejections, and uniqueness
//! violations that writers downgrade to duplicate outcomes.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for event store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Malformed input rejected before any backend call.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the rejected input
        message: String,
    },

    /// Network-level failure or non-success HTTP status from the backend.
    #[error("transport error: {message}")]
    Transport {
        /// Error message describing the failure
        message: String,
        /// HTTP status code when the backend responded
        status: Option<u16>,
    },

    /// Backend call exceeded its request timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Timeout that was exceeded
        timeout_seconds: u64,
    },

    /// Backend accepted the request but rejected the operation.
    #[error("graph operation failed: {message}")]
    Graph {
        /// Joined error messages returned by the backend
        message: String,
    },

    /// Storage-level uniqueness constraint rejected an insert.
    #[error("constraint violation: {message}")]
    ConstraintViolation {
        /// Backend message naming the violated constraint
        message: String,
    },

    /// Backend response could not be interpreted.
    #[error("malformed response: {message}")]
    MalformedResponse {
        /// What was missing or unparseable
        message: String,
    },

    /// Referenced row does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Description of the missing entity
        message: String,
    },
}

impl Error {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a transport error without an HTTP status.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), status: None }
    }

    /// Creates a transport error for a non-success HTTP status.
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), status: Some(status) }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a graph error.
    pub fn graph(message: impl Into<String>) -> Self {
        Self::Graph { message: message.into() }
    }

    /// Creates a constraint violation error.
    pub fn constraint_violation(message: impl Into<String>) -> Self {
        Self::ConstraintViolation { message: message.into() }
    }

    /// Creates a malformed response error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse { message: message.into() }
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Returns whether this error is an insert-time uniqueness violation.
    pub const fn is_unique_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation { .. })
    }

    /// Returns whether this error was raised before reaching the backend.
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Returns whether this error is a network, timeout or HTTP status
    /// failure.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout { .. })
    }

    /// Determines if re-submitting the same request could succeed.
    ///
    /// Transport failures are retryable unless the backend answered with a
    /// 4xx status. Validation, graph and constraint errors are permanent for
    /// the given input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { status: Some(status), .. } => !(400..500).contains(status),
            Self::Transport { status: None, .. } | Self::Timeout { .. } => true,
            Self::Validation { .. }
            | Self::Graph { .. }
            | Self::ConstraintViolation { .. }
            | Self::MalformedResponse { .. }
            | Self::NotFound { .. } => false,
        }
    }

    /// Short machine-readable category, logged alongside failures.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Transport { .. } | Self::Timeout { .. } => "transport",
            Self::Graph { .. } => "graph",
            Self::ConstraintViolation { .. } => "constraint_violation",
            Self::MalformedResponse { .. } => "malformed_response",
            Self::NotFound { .. } => "not_found",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::malformed(err.to_string())
    }
}
