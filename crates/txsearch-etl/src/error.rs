//! Error types for the loader
//!
//! Every stage returns [`Result`]. Only the top-level driver turns an error
//! into a process exit status, and only the supervisor aborts sibling
//! workers.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for loader operations
pub type Result<T> = std::result::Result<T, EtlError>;

/// Main error type for the loader
#[derive(Error, Debug)]
pub enum EtlError {
    /// Exported row count differs from the count query result
    #[error("Mismatch between CSV and DB rows for job {job}! Expected: {expected} | Actual {actual} in: {}", path.display())]
    ValidationMismatch {
        job: String,
        expected: i64,
        actual: i64,
        path: PathBuf,
    },

    /// A search cluster call failed or answered with an error status
    #[error("Search cluster {operation} failed: {message}")]
    Transport { operation: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    /// Blob storage listing or download failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A cell or record in an export file could not be decoded
    #[error("Failed to decode row {row} of {}: {message}", path.display())]
    Decode {
        path: PathBuf,
        row: u64,
        message: String,
    },

    /// A supervised worker returned an error or panicked
    #[error("Worker {worker} exited with error: {reason}")]
    WorkerCrash { worker: String, reason: String },

    /// A job queue closed before the completion sentinel arrived
    #[error("Job queue closed unexpectedly: {0}")]
    QueueClosed(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EtlError {
    pub fn transport(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        EtlError::Transport {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        EtlError::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_mismatch_message() {
        let err = EtlError::ValidationMismatch {
            job: "2020_transactions".to_string(),
            expected: 3,
            actual: 2,
            path: PathBuf::from("/tmp/2020_transactions.csv"),
        };
        assert_eq!(
            err.to_string(),
            "Mismatch between CSV and DB rows for job 2020_transactions! Expected: 3 | Actual 2 in: /tmp/2020_transactions.csv"
        );
    }

    #[test]
    fn test_transport_helper() {
        let err = EtlError::transport("bulk", "connection refused");
        assert_eq!(err.to_string(), "Search cluster bulk failed: connection refused");
    }
}
