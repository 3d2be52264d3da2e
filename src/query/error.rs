//! Query error types
//!
//! Every error carries the query shape; errors raised after validation
//! also carry the executor state that was active when the query failed.

use crate::query::executor::QueryState;
use crate::storage::StorageError;
use serde::Serialize;
use thiserror::Error;

/// Errors that can occur while running a query
#[derive(Error, Debug)]
pub enum QueryError {
    /// Descriptor rejected before any I/O
    #[error("Invalid query: {reason} (shape: {shape})")]
    InvalidQuery { shape: String, reason: String },

    /// Cancellation observed at a batch boundary
    #[error("Query cancelled while {stage} (shape: {shape})")]
    Cancelled { shape: String, stage: QueryState },

    /// Storage or index failure during planning or scanning
    #[error("Query failed while {stage}: {source} (shape: {shape})")]
    Storage {
        shape: String,
        stage: QueryState,
        #[source]
        source: StorageError,
    },
}

/// Error taxonomy shared by ingest and query paths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidQuery,
    Capacity,
    NotFound,
    Cancelled,
    Validation,
    Storage,
}

impl ErrorKind {
    pub fn of_storage(err: &StorageError) -> Self {
        match err {
            StorageError::Capacity { .. } => Self::Capacity,
            StorageError::NotFound { .. } => Self::NotFound,
            StorageError::Validation(_) => Self::Validation,
            _ => Self::Storage,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InvalidQuery => "InvalidQueryError",
            Self::Capacity => "CapacityError",
            Self::NotFound => "NotFoundError",
            Self::Cancelled => "CancelledError",
            Self::Validation => "ValidationError",
            Self::Storage => "StorageError",
        };
        f.write_str(name)
    }
}

impl QueryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidQuery { .. } => ErrorKind::InvalidQuery,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Storage { source, .. } => ErrorKind::of_storage(source),
        }
    }

    pub fn shape(&self) -> &str {
        match self {
            Self::InvalidQuery { shape, .. }
            | Self::Cancelled { shape, .. }
            | Self::Storage { shape, .. } => shape,
        }
    }

    /// State the executor was in when the query failed
    pub fn stage(&self) -> QueryState {
        match self {
            Self::InvalidQuery { .. } => QueryState::Received,
            Self::Cancelled { stage, .. } | Self::Storage { stage, .. } => *stage,
        }
    }
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;
