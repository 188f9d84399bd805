//! Error types for recap-core

use thiserror::Error;

use crate::inference::InferenceError;

/// Main error type for the recap-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Transcript parse error
    #[error("transcript error: {0}")]
    Transcript(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Inference backend error
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Job queue error (worker pool unavailable)
    #[error("job queue error: {0}")]
    Queue(String),
}

/// Result type alias for recap-core
pub type Result<T> = std::result::Result<T, Error>;
