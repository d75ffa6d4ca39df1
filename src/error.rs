//! Error types for the Responses streaming client

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Structured error body returned by the service.
///
/// The service wraps failures in an envelope of the form
/// `{"error": {"message": "...", "type": "...", "code": "...", "param": "..."}}`.
/// [`ApiErrorBody::from_envelope`] unwraps that envelope; the bare inner object
/// is also accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    error: ApiErrorBody,
}

impl ApiErrorBody {
    /// Parses a raw response body into the service's error envelope.
    ///
    /// Returns `None` when the body is not JSON or carries neither a message
    /// nor a code, so callers fall back to [`Error::Http`].
    pub fn from_envelope(body: &str) -> Option<Self> {
        let parsed = serde_json::from_str::<Envelope>(body)
            .map(|envelope| envelope.error)
            .or_else(|_| serde_json::from_str::<ApiErrorBody>(body))
            .ok()?;

        if parsed.message.is_none() && parsed.code.is_none() {
            return None;
        }
        Some(parsed)
    }
}

impl std::fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = self.message.as_deref().unwrap_or("unknown error");
        match &self.code {
            Some(code) => write!(f, "{} ({})", message, code),
            None => write!(f, "{}", message),
        }
    }
}

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    /// The base URL or request path could not be turned into a valid URL
    #[error("Invalid request target: {0}")]
    InvalidRequestTarget(String),

    /// Request body could not be serialized
    #[error("Failed to encode request: {0}")]
    RequestEncoding(#[source] serde_json::Error),

    /// Response body could not be deserialized
    #[error("Failed to decode response: {0}")]
    ResponseDecoding(#[source] serde_json::Error),

    /// Non-success status whose body is not a structured service error
    #[error("HTTP error {status}: {body}")]
    Http { status: u16, body: String },

    /// Non-success status with a structured service error body
    #[error("API error {status}: {error}")]
    Api { status: u16, error: ApiErrorBody },

    /// Connection-level failure (DNS, TLS, reset, ...)
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The event stream itself could not be decoded
    #[error("Stream decoding failed: {0}")]
    StreamDecoding(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No frame arrived within the streaming idle timeout
    #[error("Request timeout")]
    Timeout,

    /// The session task is no longer running
    #[error("Conversation session is closed")]
    SessionClosed,
}

impl Error {
    /// Create a new invalid request target error
    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Error::InvalidRequestTarget(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new stream decoding error
    pub fn stream_decoding(msg: impl Into<String>) -> Self {
        Error::StreamDecoding(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Builds the terminal error for a non-success status, preferring the
    /// structured [`Error::Api`] form whenever the body parses.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match ApiErrorBody::from_envelope(&body) {
            Some(error) => Error::Api { status, error },
            None => Error::Http { status, body },
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Http { status, .. } | Error::Api { status, .. } => Some(*status),
            Error::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
