//! Storage layer
//!
//! - **types**: Core data structures (Point, TimeRange)
//! - **store**: Append-only point store addressed by offset
//! - **wal**: Write-ahead log for durability
//! - **segment**: Sealed segment file format
//! - **compression**: Delta encoding + LZ4 for segment blocks
//! - **engine**: Store and index kept in step behind one ingest path
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Write Path:
//!   Point → WAL → in-memory store → tag/time index
//!                      └─ checkpoint → Compress → Segment
//!
//! Recovery:
//!   Segments (contiguous from offset 0) → WAL replay → index rebuild
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use tsagg::storage::{Point, StorageConfig, StorageEngine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StorageEngine::open(StorageConfig::new("./data"))?;
//!
//!     engine.ingest(
//!         Point::new("cpu", 1_697_752_200_000)
//!             .tag("hostname", "host_0")
//!             .field("usage_user", 10.0),
//!     )?;
//!     engine.flush()?;
//!
//!     Ok(())
//! }
//! ```

pub mod compression;
pub mod engine;
pub mod error;
pub mod segment;
pub mod store;
pub mod types;
pub mod wal;

pub use compression::{compress_block, decompress_block};
pub use engine::{EngineStats, StorageConfig, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use segment::{CompressionType, Segment, SegmentHeader};
pub use store::{PointStore, StoreConfig, StoreStats};
pub use types::{Point, PointOffset, TimeRange, Timestamp, MIN_TIMESTAMP};
pub use wal::{WalIterator, WalRecord, WalSyncMode, WriteAheadLog};
