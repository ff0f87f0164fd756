//! Error types for the convergence core
//!
//! [`Error`] is the outcome taxonomy every public operation returns.
//! [`ApiError`] is a single failed remote call, with its response payload
//! buffered in a [`ResponseBody`] so that classification and diagnostic
//! formatting can both read it.

use crate::status::{ResourceRef, TerminalStatusSet};
use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for convergence operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the convergence layer
#[derive(Error, Debug)]
pub enum Error {
    /// Credential refresh failed, or the call was still rejected after refreshing
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Non-retryable remote failure, passed through unchanged
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Conflict retry budget exhausted
    #[error("{operation}: exceeded max retries ({attempts}) due to conflict: {last}")]
    RetryExhausted {
        /// Operation being retried
        operation: String,
        /// Number of invocations made
        attempts: u32,
        /// The last conflict response observed
        last: ApiError,
    },

    /// Deadline elapsed while retrying or waiting on a remote call
    #[error("Deadline exceeded during {operation}")]
    DeadlineExceeded {
        /// Operation that was in flight
        operation: String,
    },

    /// Deadline elapsed before a terminal status was observed
    #[error("Timeout while waiting for {resource} to reach status [{targets}]")]
    PollTimeout {
        /// Resource being polled
        resource: ResourceRef,
        /// Statuses that were never reached
        targets: TerminalStatusSet,
    },

    /// A fetch failed for a reason other than not-found while polling
    #[error("Error while polling {resource}: {source}")]
    PollFetch {
        /// Resource being polled
        resource: ResourceRef,
        /// Underlying fetch failure
        #[source]
        source: Box<Error>,
    },

    /// Resource settled in a terminal status other than the acceptable one
    #[error("{resource} reached status {status}, expected {expected}")]
    UnexpectedStatus {
        /// Resource that was converged
        resource: ResourceRef,
        /// Observed terminal status
        status: String,
        /// Acceptable status
        expected: String,
    },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client errors that never reached the remote API
    #[error("HTTP error: {0}")]
    Http(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a deadline error naming the operation
    pub fn deadline(operation: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    /// The remote failure behind this error, if there is one
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Error::Api(e) => Some(e),
            Error::RetryExhausted { last, .. } => Some(last),
            Error::PollFetch { source, .. } => source.api_error(),
            _ => None,
        }
    }

    /// Check if this error wraps a 404 from the remote API
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Api(e) if e.is_not_found())
    }

    /// Check if this is the cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Check if a deadline elapsed, whether mid-poll or mid-retry
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::PollTimeout { .. } | Error::DeadlineExceeded { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

/// A response payload read off the wire exactly once
///
/// Cloning is cheap and every reader starts from the beginning, so keyword
/// classification never disturbs later consumers of the body.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ResponseBody(Arc<[u8]>);

impl ResponseBody {
    /// Wrap an already-buffered payload
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    /// Raw payload bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn as_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }

    /// A fresh reader positioned at the start of the payload
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.as_bytes())
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse the payload as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_reader(self.reader())?)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl From<Vec<u8>> for ResponseBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl From<&str> for ResponseBody {
    fn from(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }
}

impl From<String> for ResponseBody {
    fn from(s: String) -> Self {
        Self::new(s.into_bytes())
    }
}

/// A single failed call against the remote API
///
/// `status` is `None` when the request never produced a response (connect
/// failure, client-side timeout); the body then holds the transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    method: String,
    url: String,
    status: Option<u16>,
    body: ResponseBody,
}

impl ApiError {
    /// Create an error from a non-success HTTP response
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        status: u16,
        body: impl Into<ResponseBody>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            status: Some(status),
            body: body.into(),
        }
    }

    /// Create an error for a request that never got a response
    pub fn transport(
        method: impl Into<String>,
        url: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            status: None,
            body: ResponseBody::from(message.into()),
        }
    }

    /// Create an error carrying only a status and body
    pub fn from_status(status: u16, body: impl Into<ResponseBody>) -> Self {
        Self::new("", "", status, body)
    }

    /// HTTP method of the failed request
    pub fn method(&self) -> &str {
        &self.method
    }

    /// URL of the failed request
    pub fn url(&self) -> &str {
        &self.url
    }

    /// HTTP status code, if a response was received
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Buffered response payload
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// 401: credentials expired or invalid
    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }

    /// 404: the resource does not exist
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    /// 409: optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }

    /// 429 or 503: the API is shedding load
    pub fn is_throttled(&self) -> bool {
        matches!(self.status, Some(429) | Some(503))
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match (self.method.is_empty(), self.url.is_empty()) {
            (true, true) => String::from("request"),
            (true, false) => self.url.clone(),
            (false, true) => self.method.clone(),
            (false, false) => format!("{} {}", self.method, self.url),
        };

        match self.status {
            Some(status) if self.body.is_empty() => write!(f, "{target} failed with status {status}"),
            Some(status) => write!(f, "{target} failed with status {status}: {}", self.body.as_str()),
            None => write!(f, "{target} failed: {}", self.body.as_str()),
        }
    }
}

impl std::error::Error for ApiError {}
