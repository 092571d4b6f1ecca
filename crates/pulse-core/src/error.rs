//! Error types shared across the Pulse crates.

use thiserror::Error;

/// Unified error type.
#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// An override was requested for a schedule that is no longer queued.
    #[error("Cannot override processed schedule {0}")]
    OverrideRejected(i64),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PulseError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, PulseError>;
