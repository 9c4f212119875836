// Patch Atlas Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AtlasError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Library not initialized")]
    NotInitialized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Partial failure: {succeeded} succeeded, {failed} failed")]
    PartialFailure { succeeded: usize, failed: usize },

    #[error("MIDI transport error: {0}")]
    Transport(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for AtlasError {
    fn from(err: anyhow::Error) -> Self {
        AtlasError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AtlasError>;
