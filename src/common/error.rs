//! Error types for needlefs

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Storage Errors ===
    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// The cookie stored with the needle does not match the one in the
    /// request. Served to clients as not-found, logged distinctly.
    #[error("cookie mismatch: expected {expected:08x}, got {actual:08x}")]
    CookieMismatch { expected: u32, actual: u32 },

    // === Request Errors ===
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    // === Replication Errors ===
    #[error("insufficient replicas: need {needed}, have {available}")]
    UnderReplicated { needed: usize, available: usize },

    #[error("replica operation failed: {0}")]
    Peer(String),

    // === Directory Errors ===
    #[error("volume lookup failed: {0}")]
    Lookup(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    // === Config Errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Error::NotFound(_) | Error::CookieMismatch { .. } => StatusCode::NOT_FOUND,
            Error::BadRequest(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Reads fail closed: any storage-side ambiguity is not-found to the client.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::CookieMismatch { .. })
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
