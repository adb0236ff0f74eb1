//! Error types for the event store.

use thiserror::Error;

/// Event store operation result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Event store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid table naming or connection settings
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Row contents the store cannot interpret (e.g. an unknown status)
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl StoreError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}
