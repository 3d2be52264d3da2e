//! # tsagg
//!
//! Time-bucketed aggregation over an append-only, tag-indexed time-series
//! store.
//!
//! ## Features
//!
//! - **Append-only storage**: offset-addressed points, WAL durability,
//!   LZ4-compressed sealed segments
//! - **Tag/time index**: time-sorted posting lists per tag value with
//!   snapshot range scans
//! - **Bucketed aggregation**: `max`/`min`/`count` per fixed-width bucket,
//!   identical whether the index or a full scan produced the candidates
//! - **Diagnostics**: one structured trace per query, slow-query logging
//!
//! ## Modules
//!
//! - [`storage`]: Point store, WAL, segments and the storage engine
//! - [`index`]: Tag/time index and merged range scans
//! - [`query`]: Descriptors, planner, aggregator and executor
//! - [`config`]: TOML configuration with environment overrides
//! - [`import`]: CSV point import
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tsagg::query::{BucketUnit, QueryConfig, QueryDescriptor};
//! use tsagg::storage::{Point, StorageEngine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = StorageEngine::in_memory();
//!
//!     for (second, usage) in [(0, 10.0), (30, 20.0), (65, 5.0)] {
//!         engine.ingest(
//!             Point::new("cpu", second * 1000)
//!                 .tag("hostname", "host_0")
//!                 .field("usage_user", usage),
//!         )?;
//!     }
//!
//!     let query = QueryDescriptor::builder("cpu")
//!         .tag_eq("hostname", "host_0")
//!         .time_range(0, 120_000)
//!         .bucket(BucketUnit::Minute)
//!         .max("usage_user")
//!         .build();
//!
//!     let output = engine.executor(QueryConfig::default()).execute(&query)?;
//!     for row in &output.rows {
//!         println!("{} {:?}", row.timestamp, row.get("max_usage_user"));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod import;
pub mod index;
pub mod query;
pub mod storage;

pub use storage::{
    Point, PointOffset, PointStore, StorageConfig, StorageEngine, StorageError, StorageResult,
    TimeRange, Timestamp,
};

pub use index::{IndexConfig, IndexEntry, IndexStats, MergedScan, TagTimeIndex};

pub use query::{
    AggregationOp, AggregationSpec, BucketSpec, BucketUnit, CancellationToken, ErrorKind,
    QueryConfig, QueryDescriptor, QueryError, QueryExecutor, QueryOptions, QueryOutput,
    QueryState, QueryTrace, ResultRow, ScanPreference,
};

pub use config::{Config, ConfigError, LoggingConfig};
