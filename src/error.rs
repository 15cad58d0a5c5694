use std::time::Duration;

use thiserror::Error;

/// Failure taxonomy for the client engine.
///
/// Variants carry owned strings rather than source errors so the whole enum
/// is `Clone`; the single-flight loader in `transport` hands the same result
/// to every coalesced caller.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// The request exceeded its cancellation scope.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// 5xx after exhausting retries.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// 4xx; never retried, message extracted from the response body.
    #[error("request failed ({status}): {message}")]
    Client { status: u16, message: String },

    /// Connection-level failure (DNS, refused, reset mid-body).
    #[error("network error: {0}")]
    Network(String),

    /// A stream frame or poll response that did not decode. Callers log and
    /// drop the frame; this never terminates a session.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// The server refused to start or continue an execution, typically
    /// because no provider is configured or no model was resolvable.
    #[error("execution rejected: {0}")]
    ExecutionRejected(String),

    /// Session delete failed with something other than 404.
    #[error("failed to delete session ({status}): {message}")]
    SessionDeletionFailed { status: u16, message: String },
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Server { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(crate::transport::REQUEST_TIMEOUT)
        } else {
            Error::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::MalformedEvent(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
