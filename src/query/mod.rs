//! Query planning and execution
//!
//! - **descriptor**: Query descriptor, bucket and aggregation specs
//! - **planner**: Index-scan vs full-scan selection
//! - **aggregator**: Streaming per-bucket reduction
//! - **executor**: Query state machine over a store snapshot
//! - **trace**: Per-query diagnostics
//!
//! # Example
//!
//! ```rust,ignore
//! use tsagg::query::{BucketUnit, QueryDescriptor};
//!
//! let query = QueryDescriptor::builder("cpu")
//!     .tag_in("hostname", ["host_0", "host_3"])
//!     .time_range(start, end)
//!     .bucket(BucketUnit::Minute)
//!     .max("usage_user")
//!     .build();
//!
//! let output = executor.execute(&query)?;
//! for row in &output.rows {
//!     println!("{} {:?}", row.timestamp, row.values);
//! }
//! ```

mod aggregator;
mod descriptor;
mod error;
mod executor;
mod planner;
mod trace;

pub use aggregator::{BucketAggregator, ResultRow};
pub use descriptor::{
    truncate, AggregationOp, AggregationSpec, BucketSpec, BucketUnit, QueryBuilder,
    QueryDescriptor,
};
pub use error::{ErrorKind, QueryError, QueryResult};
pub use executor::{
    CancellationToken, QueryConfig, QueryExecutor, QueryOptions, QueryOutput, QueryState,
};
pub use planner::{PlannerConfig, QueryPlanner, ScanPlan, ScanPreference, ScanStrategy};
pub use trace::{DiagnosticsSink, NoopSink, QueryOutcome, QueryTrace, TracingSink};
