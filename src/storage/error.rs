//! Storage engine error types
//!
//! Defines all errors that can occur in the storage layer.

use std::sync::PoisonError;
use thiserror::Error;

/// Errors that can occur in the point store, WAL, segments and index
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Data corruption detected (checksum mismatch, index/store disagreement, etc.)
    #[error("Corrupt data: {0}")]
    Corruption(String),

    /// The store refused an append because it is full
    #[error("Point store is full: capacity of {capacity} points reached")]
    Capacity { capacity: usize },

    /// Offset does not address a stored point
    #[error("Point offset {offset} not found (store holds {len} points)")]
    NotFound { offset: u64, len: u64 },

    /// Point rejected on ingest
    #[error("Invalid point: {0}")]
    Validation(String),

    /// Segment file format error
    #[error("Invalid segment format: {0}")]
    InvalidSegment(String),

    /// WAL format or recovery error
    #[error("WAL error: {0}")]
    WalError(String),

    /// Lock acquisition failed
    #[error("Lock error: {0}")]
    Lock(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl<T> From<PoisonError<T>> for StorageError {
    fn from(err: PoisonError<T>) -> Self {
        StorageError::Lock(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
