/// Error types for the messaging core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    /// No signed-in viewer where one is required
    #[error("Authentication required: no current user")]
    Authentication,

    #[error("Backend error: {0}")]
    Backend(String),

    /// Insert failed after the optimistic entry was appended (already rolled back)
    #[error("Send error: {0}")]
    Send(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl MessagingError {
    /// Re-label a backend-internal failure as a caller-facing backend error.
    pub fn backend(err: MessagingError) -> Self {
        match err {
            MessagingError::Authentication => MessagingError::Authentication,
            MessagingError::Backend(msg) => MessagingError::Backend(msg),
            other => MessagingError::Backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
