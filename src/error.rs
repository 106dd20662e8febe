//! Error types for stanza synchronization.

use crate::types::{Seq, StreamName};
use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Bad or missing signature. Stanzas failing this are dropped, never delivered.
    #[error("Authentication failed for {stream} seq {seq}: {reason}")]
    Authentication {
        stream: StreamName,
        seq: Seq,
        reason: String,
    },

    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A gap was found inside a batch; recovered by re-fetching.
    #[error("Consistency violation in {stream}: expected after {expected:?}, got {got:?}")]
    Consistency {
        stream: StreamName,
        expected: Seq,
        got: Seq,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid storage format: {0}")]
    InvalidFormat(String),

    #[error("Storage is locked by another process")]
    Locked,

    #[error("Storage not initialized")]
    NotInitialized,
}

impl SyncError {
    /// Errors a read stream recovers from by retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_)
                | SyncError::Storage(_)
                | SyncError::Io(_)
                | SyncError::Consistency { .. }
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
