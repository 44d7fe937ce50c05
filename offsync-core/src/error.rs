//! Error types for offsync-core

use thiserror::Error;

/// Main error type for the offsync-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Sample rejected at the capture boundary
    #[error("invalid sample: {0}")]
    Validation(String),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Payload encryption or decryption failed
    #[error("crypto error: {0}")]
    Crypto(String),

    /// The protected secret store could not be read or written
    #[error("secret store error: {0}")]
    Secret(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure talking to the ingest endpoint
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Ingest endpoint answered with a non-2xx status
    #[error("ingest endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Request signature could not be computed
    #[error("signature error: {0}")]
    Signature(String),
}

impl Error {
    /// Whether a later upload attempt may succeed where this one failed.
    ///
    /// Network, status and storage failures all leave the batch pending, so
    /// they are retried on the next scheduled run. Validation and
    /// configuration problems will not fix themselves.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(_)
            | Error::Status { .. }
            | Error::Database(_)
            | Error::Io(_)
            | Error::Crypto(_) => true,
            Error::Validation(_)
            | Error::Json(_)
            | Error::Secret(_)
            | Error::Config(_)
            | Error::Signature(_) => false,
        }
    }
}

/// Result type alias for offsync-core
pub type Result<T> = std::result::Result<T, Error>;
