//! Error types

use std::path::PathBuf;

use thiserror::Error;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for client, session and transfer operations
#[derive(Debug, Error)]
pub enum Error {
    /// The supplied URL could not be parsed or is not absolute http(s)/ws(s)
    #[error("Malformed URL: {url}")]
    MalformedUrl {
        /// The offending URL string
        url: String,
    },

    /// A client already exists for this base URL
    #[error("A client for {url} already exists")]
    AlreadyExists {
        /// Normalized base URL of the existing client
        url: String,
    },

    /// No active session exists for this base URL
    #[error("No client exists for {url}")]
    SessionNotFound {
        /// Normalized base URL that was looked up
        url: String,
    },

    /// The upload source file's size could not be determined
    #[error("Unable to read file size of {path}")]
    FileSizeUnreadable {
        /// Path of the inaccessible file
        path: PathBuf,
    },

    /// Invalid configuration bag
    #[error("Invalid configuration: {message}")]
    Config {
        /// What was wrong with the configuration
        message: String,
    },

    /// Network-level failure with no HTTP response at all
    #[error("Transport error: {message}")]
    Transport {
        /// Description of the transport failure
        message: String,
    },

    /// Request timed out before a response was received
    #[error("Request timed out")]
    Timeout,

    /// Request was cancelled
    #[error("Request was cancelled")]
    Cancelled,

    /// Client certificate material could not be imported
    #[error("Failed to import client certificate: {message}")]
    ClientCertificateImport {
        /// Description of the import failure
        message: String,
    },

    /// The server's TLS certificate chain was rejected
    #[error("Server trust evaluation failed for {url}")]
    ServerTrustEvaluation {
        /// Origin the evaluation failed for
        url: String,
    },

    /// The WebSocket connection was closed
    #[error("WebSocket connection closed")]
    WebSocketClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// TLS backends report rejected server certificates as opaque connect
// failures; the verification verdict only survives in the source chain.
fn is_trust_failure(error: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(error);
    while let Some(inner) = source {
        if inner.to_string().contains("certificate") {
            return true;
        }
        source = inner.source();
    }
    false
}

impl Error {
    /// Classify a reqwest failure into the crate's taxonomy.
    pub(crate) fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Error::Timeout
        } else if error.is_builder() {
            Error::Internal(error.to_string())
        } else if error.is_connect() && is_trust_failure(&error) {
            Error::ServerTrustEvaluation {
                url: error.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            Error::Transport {
                message: error.to_string(),
            }
        }
    }

    /// Whether this failure may succeed on a later attempt.
    ///
    /// Connection resets and timeouts are transient; malformed input and
    /// cancellation are terminal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Timeout)
    }
}
