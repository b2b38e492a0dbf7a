use crate::upload::retry::ErrorType;
use crate::upload::session::SessionState;
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the crate
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors raised by the upload pipeline and the control-plane client
#[derive(Debug, Error)]
pub enum IngestError {
    /// Rejected credentials (401/403). Never retried.
    #[error("Authentication failed (status {status}): {message}")]
    Auth { status: u16, message: String },

    /// Control plane could not be reached after exhausting retries
    #[error("Control plane unavailable: {message}")]
    RemoteUnavailable { message: String },

    #[error("Session {session_id} is not open (state: {state})")]
    SessionNotOpen {
        session_id: String,
        state: SessionState,
    },

    #[error("Session {session_id} expired at {expires_at}")]
    SessionExpired {
        session_id: String,
        expires_at: DateTime<Utc>,
    },

    /// Timeouts, connection resets and other transport failures
    #[error("Network error: {message}")]
    TransientNetwork { message: String },

    #[error("Rate limited by server{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// Non-success status that has no dedicated variant
    #[error("Request failed with status {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String },

    #[error("Object store transfer failed{}: {message}", status_suffix(.status))]
    ObjectStoreTransferFailed { status: Option<u16>, message: String },

    #[error("Unsupported file type: {extension}")]
    UnsupportedType { extension: String },

    #[error("File too large: {size} bytes (max {max} bytes)")]
    OversizedFile { size: u64, max: u64 },

    #[error("Invalid metadata in {path}: {message}")]
    InvalidMetadata { path: String, message: String },

    /// Retry budget exhausted; wraps the last error seen
    #[error("Operation failed after {attempts} attempts: {source}")]
    OperationFailed {
        attempts: u32,
        #[source]
        source: Box<IngestError>,
    },

    #[error("No workspace given and no default workspace configured")]
    WorkspaceNotDefined,

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    retry_after
        .map(|d| format!(" (retry after {}s)", d.as_secs()))
        .unwrap_or_default()
}

fn status_suffix(status: &Option<u16>) -> String {
    status
        .map(|s| format!(" with status {}", s))
        .unwrap_or_default()
}

impl IngestError {
    /// Retry classification for this error
    pub fn error_type(&self) -> ErrorType {
        match self {
            IngestError::TransientNetwork { .. } => ErrorType::Network,
            IngestError::RateLimited { .. } => ErrorType::RateLimited,
            IngestError::Http { status, .. } => ErrorType::from_status(*status),
            IngestError::ObjectStoreTransferFailed {
                status: Some(status),
                ..
            } => ErrorType::from_status(*status),
            IngestError::ObjectStoreTransferFailed { status: None, .. } => ErrorType::Network,
            // Auth, session state, malformed responses and exhausted retries
            _ => ErrorType::Client,
        }
    }

    /// Whether this error means the session can no longer accept uploads
    pub fn is_session_state_error(&self) -> bool {
        match self {
            IngestError::SessionNotOpen { .. } | IngestError::SessionExpired { .. } => true,
            IngestError::OperationFailed { source, .. } => source.is_session_state_error(),
            _ => false,
        }
    }

    /// Innermost error, skipping retry wrappers
    pub fn root_cause(&self) -> &IngestError {
        match self {
            IngestError::OperationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return IngestError::MalformedResponse {
                message: err.to_string(),
            };
        }
        if err.is_builder() {
            return IngestError::Config(err.to_string());
        }
        IngestError::TransientNetwork {
            message: err.to_string(),
        }
    }
}
