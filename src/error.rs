//! Error types for siumai-relay
//!
//! Every fallible operation in the crate returns [`RelayError`]. Most failures
//! inside a session are recovered locally (diagnostic transcripts, error-tagged
//! tool results, skipped events); only transport errors and empty answers reach
//! the consumer's error callback.

use thiserror::Error;

/// Errors that can occur while relaying a streamed response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// Request could not be sent or the connection failed.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// The event stream broke while it was being read.
    #[error("Stream error: {0}")]
    StreamError(String),

    /// A single event payload could not be parsed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A tool handler rejected its invocation.
    #[error("{0}")]
    ToolError(String),

    /// No handler is registered for the requested function name.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Tool arguments were not valid JSON or failed schema validation.
    #[error("Invalid tool arguments: {0}")]
    InvalidToolArguments(String),

    /// The session completed without producing any text.
    #[error("empty response from server")]
    EmptyResponse,

    /// The transport did not open before the request timeout elapsed.
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    /// Invalid relay configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Telemetry initialization error.
    #[error("Telemetry initialization error: {0}")]
    TelemetryInit(String),

    /// Internal invariant violation or task failure.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl RelayError {
    /// True for the "empty response" anomaly reported at finalize.
    pub fn is_empty_response(&self) -> bool {
        matches!(self, RelayError::EmptyResponse)
    }

    /// True when the error originated from the transport layer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RelayError::HttpError(_) | RelayError::StreamError(_) | RelayError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::ParseError(e.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RelayError::HttpError(format!("request timed out: {e}"))
        } else {
            RelayError::HttpError(e.to_string())
        }
    }
}

/// Result type for siumai-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
