//! Error types for memlab-core.

use thiserror::Error;

/// Result type alias using memlab-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running trials, evolving memory, or computing statistics.
#[derive(Error, Debug)]
pub enum Error {
    /// Persistent store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Reasoning backend transport or API error
    #[error("Backend error: {backend} - {message}")]
    Backend { backend: String, message: String },

    /// External memory service error
    #[error("External memory error: {0}")]
    ExternalMemory(String),

    /// Malformed model output or task payload
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error while writing reports or reading config
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity lookup failed
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Request rejected before any work was done
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Operation aborted by a cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a backend error.
    pub fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    /// Whether this error came from a cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
