//! Error types for the forecast cache

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for the forecast cache
pub type Result<T> = std::result::Result<T, Error>;

/// Error shared between every subscriber joined to one fetch
pub type SharedError = Arc<Error>;

/// Forecast cache errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport-level HTTP failure (connect, timeout, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status that should not be retried (4xx and friends)
    #[error("Request to {url} failed with status {status}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Server-side failure (5xx)
    #[error("Server error {status} from {url}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Application-level failure reported by a fetch function
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an application-level fetch error
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch(message.into())
    }

    /// Whether the HTTP layer should retry after this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Server { .. } | Self::Io(_) => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// HTTP status attached to this error, if any
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } | Self::Server { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}
