//! Error types for sitecache
//!
//! All errors use thiserror for structured error handling.
//! Services convert these into typed "no result" values or user notifications
//! at their boundary; only unexpected conditions travel further up.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    #[error("Backend returned {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Storage quota exceeded: {needed} bytes requested, {available} available")]
    StorageQuota { needed: usize, available: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Realtime error: {0}")]
    Realtime(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Client is offline")]
    Offline,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Generic(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::WebSocket(Box::new(err))
    }
}

impl AppError {
    /// Whether a retry has a chance of succeeding.
    ///
    /// Transport failures and 5xx/429 responses are transient. Client errors,
    /// malformed payloads and local faults are not.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Http(e) => !e.is_decode() && !e.is_builder(),
            AppError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            AppError::WebSocket(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let server = AppError::HttpStatus {
            status: 503,
            body: "unavailable".to_string(),
        };
        let throttled = AppError::HttpStatus {
            status: 429,
            body: String::new(),
        };
        let client = AppError::HttpStatus {
            status: 404,
            body: "missing".to_string(),
        };

        assert!(server.is_transient());
        assert!(throttled.is_transient());
        assert!(!client.is_transient());
    }

    #[test]
    fn test_local_faults_not_transient() {
        assert!(!AppError::Offline.is_transient());
        assert!(!AppError::Storage("disk full".to_string()).is_transient());
        assert!(!AppError::StorageQuota {
            needed: 10,
            available: 5
        }
        .is_transient());
    }
}
