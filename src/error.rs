//! Error types for the relay.

use crate::types::Sequence;
use thiserror::Error;

/// Errors raised by the durable store and the components layered on it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid sequence: {0:?} (last persisted is {1:?})")]
    InvalidSequence(Sequence, Sequence),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            StoreError::Deserialization(e.to_string())
        } else {
            StoreError::Serialization(e.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Process-level error taxonomy.
///
/// `Config`, `Fetch` and `Storage` are fatal at startup. `Feed` and `Sink`
/// are reported by long-running collaborators and handled where they occur.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Target fetch failed: {0}")]
    Fetch(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Change feed error: {0}")]
    Feed(String),

    #[error("Notification sink error: {0}")]
    Sink(String),
}

impl RelayError {
    /// Short kind tag used in structured log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Config(_) => "config",
            RelayError::Fetch(_) => "fetch",
            RelayError::Storage(_) => "storage",
            RelayError::Feed(_) => "feed",
            RelayError::Sink(_) => "sink",
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
