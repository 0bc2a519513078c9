//! Error types shared by every dispatcher in the crate.
//!
//! # Taxonomy
//! - Configuration: invalid options, missing upstreams. Never retried.
//! - Circuit breaker: fail-fast rejection, no network attempt made.
//! - Retry: retries exhausted or partial-content validation failed.
//! - Lifecycle: dispatch after close/destroy, caller aborts.
//! - Network: refused connections, socket errors, timeouts.
//!
//! `DispatchError` is `Clone` because a single error (e.g. the one passed to
//! `destroy`) settles every queued handler.

use std::fmt;

use http::{HeaderMap, StatusCode};
use thiserror::Error;

/// State of a circuit, as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a circuit short-circuits a request.
#[derive(Debug, Clone, Error)]
#[error("circuit breaker is {state} for key {key:?}")]
pub struct CircuitBreakerError {
    /// State the circuit was in when the request was rejected.
    pub state: CircuitState,
    /// Circuit key the request mapped to.
    pub key: String,
}

/// Raised by the retry interceptor when a logical request cannot complete.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RequestRetryError {
    pub message: String,
    /// Status of the last response, when the failure came from one.
    pub status: Option<StatusCode>,
    /// Headers of the last response, used for `Retry-After`.
    pub headers: Option<HeaderMap>,
    /// Number of attempts made so far.
    pub attempts: u32,
}

impl RequestRetryError {
    pub fn new(message: impl Into<String>, status: Option<StatusCode>, headers: Option<HeaderMap>, attempts: u32) -> Self {
        Self {
            message: message.into(),
            status,
            headers,
            attempts,
        }
    }
}

/// Errors surfaced to `DispatchHandler::on_error`.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Invalid constructor or dispatch options.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A balanced pool was asked to dispatch with no upstreams configured.
    #[error("no upstream has been added to the balanced pool")]
    MissingUpstream,

    /// The dispatcher was closed and takes no new work.
    #[error("dispatcher is closed")]
    Closed,

    /// The dispatcher was destroyed.
    #[error("dispatcher is destroyed")]
    Destroyed,

    /// The caller aborted the request.
    #[error("request aborted")]
    Aborted,

    /// A circuit breaker rejected the request.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerError),

    /// The retry interceptor gave up.
    #[error(transparent)]
    Retry(#[from] RequestRetryError),

    /// The connection could not be established.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The connection failed after it was established.
    #[error("socket error: {0}")]
    Socket(String),

    /// No response headers arrived in time.
    #[error("headers timeout")]
    HeadersTimeout,

    /// The response body stalled.
    #[error("body timeout")]
    BodyTimeout,

    /// Anything else reported by a member dispatcher.
    #[error("{0}")]
    Other(String),
}

impl DispatchError {
    /// Stable error code, matched by retry policies.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::InvalidArgument(_) => "UND_ERR_INVALID_ARG",
            DispatchError::MissingUpstream => "UND_ERR_BPL_MISSING_UPSTREAM",
            DispatchError::Closed => "UND_ERR_CLOSED",
            DispatchError::Destroyed => "UND_ERR_DESTROYED",
            DispatchError::Aborted => "UND_ERR_ABORTED",
            DispatchError::CircuitOpen(_) => "UND_ERR_CIRCUIT_BREAKER",
            DispatchError::Retry(_) => "UND_ERR_REQ_RETRY",
            DispatchError::ConnectionRefused(_) => "ECONNREFUSED",
            DispatchError::Socket(_) => "UND_ERR_SOCKET",
            DispatchError::HeadersTimeout => "UND_ERR_HEADERS_TIMEOUT",
            DispatchError::BodyTimeout => "UND_ERR_BODY_TIMEOUT",
            DispatchError::Other(_) => "UND_ERR",
        }
    }

    /// Connection-level failures feed circuit breakers and balancer penalties.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            DispatchError::ConnectionRefused(_)
                | DispatchError::Socket(_)
                | DispatchError::HeadersTimeout
                | DispatchError::BodyTimeout
        )
    }

    /// Configuration errors are never retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, DispatchError::InvalidArgument(_) | DispatchError::MissingUpstream)
    }

    /// Response status attached to the error, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            DispatchError::Retry(err) => err.status,
            _ => None,
        }
    }

    /// Response headers attached to the error, if any.
    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            DispatchError::Retry(err) => err.headers.as_ref(),
            _ => None,
        }
    }
}

/// Result type for dispatcher operations.
pub type DispatchResult<T> = Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::CircuitOpen(CircuitBreakerError {
            state: CircuitState::HalfOpen,
            key: "http://a".into(),
        });
        assert_eq!(err.to_string(), "circuit breaker is half-open for key \"http://a\"");

        let err = DispatchError::Retry(RequestRetryError::new("ETag mismatch", Some(StatusCode::PARTIAL_CONTENT), None, 2));
        assert_eq!(err.to_string(), "ETag mismatch");
        assert_eq!(err.status(), Some(StatusCode::PARTIAL_CONTENT));
    }

    #[test]
    fn test_error_classification() {
        assert!(DispatchError::ConnectionRefused("127.0.0.1:1".into()).is_connection_error());
        assert!(DispatchError::Socket("reset".into()).is_connection_error());
        assert!(!DispatchError::Aborted.is_connection_error());
        assert!(DispatchError::MissingUpstream.is_configuration_error());
        assert_eq!(DispatchError::ConnectionRefused(String::new()).code(), "ECONNREFUSED");
        assert_eq!(DispatchError::Socket(String::new()).code(), "UND_ERR_SOCKET");
    }
}
