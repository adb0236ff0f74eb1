//! Error types for the buffmgr engine

use buffmgr_db::StoreError;
use std::io;
use thiserror::Error;

/// Engine error type
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Event store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid glob: {0}")]
    Glob(#[from] glob::PatternError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Action failed: {0}")]
    Action(String),

    #[error("Unknown ingestion backend: '{0}'")]
    UnknownBackend(String),

    /// The backend panicked; the attempt was recorded as FAILURE.
    #[error("Ingestion backend panicked on {path}: {message}")]
    BackendPanic { path: String, message: String },

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl EndpointError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn action(msg: impl Into<String>) -> Self {
        Self::Action(msg.into())
    }

    /// Errors no amount of retrying in the same process will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnknownBackend(_)
                | Self::BackendPanic { .. }
                | Self::Regex(_)
                | Self::Glob(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EndpointError>;
