//! Query Executor
//!
//! Drives one query through its states:
//!
//! ```text
//! Received → Planned → Scanning → Aggregating → Done
//!     └──────────┴─────────┴───────────┴──────→ Failed
//! ```
//!
//! - **Received**: descriptor validation; failures surface before any I/O
//! - **Planned**: snapshot watermark taken, scan strategy chosen
//! - **Scanning**: candidates are resolved and re-checked batch by batch;
//!   accepted points are folded as they arrive. Cancellation is polled at
//!   every batch boundary.
//! - **Aggregating**: buckets drained in order
//!
//! A failure at any point drops the aggregator, so no partial result
//! escapes. The store and index are only read.

use crate::index::{IndexEntry, MergedScan, TagTimeIndex};
use crate::query::aggregator::{BucketAggregator, ResultRow};
use crate::query::descriptor::QueryDescriptor;
use crate::query::error::{QueryError, QueryResult};
use crate::query::planner::{PlannerConfig, QueryPlanner, ScanPlan, ScanPreference, ScanStrategy};
use crate::query::trace::{DiagnosticsSink, QueryOutcome, QueryTrace, TracingSink};
use crate::storage::{PointStore, StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Lifecycle state of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryState {
    Received,
    Planned,
    Scanning,
    Aggregating,
    Done,
    Failed,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Received => "received",
            Self::Planned => "planned",
            Self::Scanning => "scanning",
            Self::Aggregating => "aggregating",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared cancellation flag; clones observe the same signal
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Executor-wide settings
#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub selectivity_threshold: f64,
    /// Candidates per batch (cancellation granularity)
    pub batch_size: usize,
    pub slow_query_threshold: Duration,
    pub scan_preference: ScanPreference,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            selectivity_threshold: 0.3,
            batch_size: 1024,
            slow_query_threshold: Duration::from_millis(100),
            scan_preference: ScanPreference::Auto,
        }
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub scan: Option<ScanPreference>,
    pub cancel: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn scan(mut self, preference: ScanPreference) -> Self {
        self.scan = Some(preference);
        self
    }

    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Result of a successful query
#[derive(Debug, Clone)]
pub struct QueryOutput {
    /// Aggregation names in declaration order
    pub columns: Vec<String>,
    /// Buckets in ascending order
    pub rows: Vec<ResultRow>,
    pub trace: QueryTrace,
}

impl QueryOutput {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `(bucket, value)` pairs of one column, skipping buckets without it
    pub fn series(&self, column: &str) -> Vec<(i64, f64)> {
        self.rows
            .iter()
            .filter_map(|row| row.get(column).map(|v| (row.timestamp, v)))
            .collect()
    }
}

#[derive(Debug, Default)]
struct ScanCounters {
    keys_examined: u64,
    docs_examined: u64,
    points_matched: u64,
}

/// Bookkeeping for one in-flight query
struct Execution<'a> {
    query: &'a QueryDescriptor,
    query_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    shape: String,
    state: QueryState,
    plan: Option<ScanPlan>,
    counters: ScanCounters,
}

impl<'a> Execution<'a> {
    fn new(query: &'a QueryDescriptor, shape: String) -> Self {
        Self {
            query,
            query_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            shape,
            state: QueryState::Received,
            plan: None,
            counters: ScanCounters::default(),
        }
    }

    fn advance(&mut self, next: QueryState) {
        tracing::trace!(query_id = %self.query_id, from = %self.state, to = %next, "Query state");
        self.state = next;
    }

    fn storage_error(&self, source: StorageError) -> QueryError {
        QueryError::Storage {
            shape: self.shape.clone(),
            stage: self.state,
            source,
        }
    }

    fn check_cancelled(&self, options: &QueryOptions) -> QueryResult<()> {
        match &options.cancel {
            Some(token) if token.is_cancelled() => Err(QueryError::Cancelled {
                shape: self.shape.clone(),
                stage: self.state,
            }),
            _ => Ok(()),
        }
    }

    fn trace(&self, buckets_returned: u64, outcome: QueryOutcome) -> QueryTrace {
        QueryTrace {
            query_id: self.query_id,
            started_at: self.started_at,
            measurement: self.query.measurement.clone(),
            shape: self.query.shape(),
            plan_summary: self.plan.as_ref().map(ScanPlan::summary).unwrap_or_default(),
            selectivity: self.plan.as_ref().and_then(|p| p.selectivity),
            keys_examined: self.counters.keys_examined,
            docs_examined: self.counters.docs_examined,
            points_matched: self.counters.points_matched,
            buckets_returned,
            duration_ms: self.started.elapsed().as_millis() as u64,
            outcome,
        }
    }
}

/// Runs aggregation queries against a store and its index
///
/// Holds only shared handles, so one executor can serve many threads.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    store: Arc<PointStore>,
    index: Arc<TagTimeIndex>,
    config: QueryConfig,
    planner: QueryPlanner,
    sink: Arc<dyn DiagnosticsSink>,
}

impl QueryExecutor {
    pub fn new(store: Arc<PointStore>, index: Arc<TagTimeIndex>) -> Self {
        Self::with_config(store, index, QueryConfig::default())
    }

    pub fn with_config(store: Arc<PointStore>, index: Arc<TagTimeIndex>, config: QueryConfig) -> Self {
        let planner = QueryPlanner::new(PlannerConfig {
            selectivity_threshold: config.selectivity_threshold,
        });
        let sink = Arc::new(TracingSink::new(config.slow_query_threshold));
        Self {
            store,
            index,
            config,
            planner,
            sink,
        }
    }

    /// Replace the diagnostics sink
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    pub fn execute(&self, query: &QueryDescriptor) -> QueryResult<QueryOutput> {
        self.execute_with(query, &QueryOptions::default())
    }

    pub fn execute_with(&self, query: &QueryDescriptor, options: &QueryOptions) -> QueryResult<QueryOutput> {
        let shape = query.shape_string();
        query
            .validate()
            .map_err(|reason| QueryError::InvalidQuery { shape: shape.clone(), reason })?;

        let mut run = Execution::new(query, shape);
        match self.run(&mut run, options) {
            Ok(rows) => {
                run.advance(QueryState::Done);
                let trace = run.trace(rows.len() as u64, QueryOutcome::Done);
                self.sink.record(&trace);
                Ok(QueryOutput {
                    columns: query.columns(),
                    rows,
                    trace,
                })
            }
            Err(err) => {
                let stage = run.state;
                run.advance(QueryState::Failed);
                let trace = run.trace(0, QueryOutcome::Failed { kind: err.kind(), stage });
                self.sink.record(&trace);
                Err(err)
            }
        }
    }

    fn run(&self, run: &mut Execution<'_>, options: &QueryOptions) -> QueryResult<Vec<ResultRow>> {
        let query = run.query;

        // Snapshot: everything both appended and indexed before this point
        let watermark = (self.store.len() as u64).min(self.index.covered());
        let preference = options.scan.unwrap_or(self.config.scan_preference);
        let plan = self
            .planner
            .plan(query, &self.index, watermark, preference)
            .map_err(|e| run.storage_error(e))?;
        tracing::debug!(
            query_id = %run.query_id,
            plan = %plan.summary(),
            selectivity = ?plan.selectivity,
            watermark,
            "Query planned"
        );
        run.plan = Some(plan.clone());
        run.advance(QueryState::Planned);

        run.advance(QueryState::Scanning);
        let mut aggregator = BucketAggregator::new(query.bucket, &query.aggregations);
        let batch_size = self.config.batch_size.max(1);

        match &plan.strategy {
            ScanStrategy::IndexScan { tag_key, values } => {
                let scans = values
                    .iter()
                    .map(|value| {
                        self.index.range_scan(&query.measurement, tag_key, value, query.time_range, watermark)
                    })
                    .collect::<StorageResult<Vec<_>>>()
                    .map_err(|e| run.storage_error(e))?;

                let mut candidates = MergedScan::new(scans);
                let mut batch: Vec<IndexEntry> = Vec::with_capacity(batch_size);
                loop {
                    batch.clear();
                    batch.extend(candidates.by_ref().take(batch_size));
                    if batch.is_empty() {
                        break;
                    }
                    run.check_cancelled(options)?;
                    self.fold_index_batch(run, &batch, &mut aggregator)
                        .map_err(|e| run.storage_error(e))?;
                }
            }
            ScanStrategy::FullScan => {
                let mut next = 0;
                while next < watermark {
                    let end = (next + batch_size as u64).min(watermark);
                    run.check_cancelled(options)?;
                    self.fold_store_batch(run, next, end, &mut aggregator)
                        .map_err(|e| run.storage_error(e))?;
                    next = end;
                }
            }
        }

        run.advance(QueryState::Aggregating);
        Ok(aggregator.drain())
    }

    fn fold_index_batch(
        &self,
        run: &mut Execution<'_>,
        batch: &[IndexEntry],
        aggregator: &mut BucketAggregator,
    ) -> StorageResult<()> {
        let offsets: Vec<u64> = batch.iter().map(|e| e.offset).collect();
        let points = self.store.resolve_many(&offsets)?;
        run.counters.keys_examined += batch.len() as u64;

        for (entry, point) in batch.iter().zip(&points) {
            if point.time != entry.time {
                return Err(StorageError::Corruption(format!(
                    "index entry for offset {} has time {}, stored point has {}",
                    entry.offset, entry.time, point.time
                )));
            }
            run.counters.docs_examined += 1;
            if run.query.matches(point) {
                aggregator.fold(point);
                run.counters.points_matched += 1;
            }
        }
        Ok(())
    }

    fn fold_store_batch(
        &self,
        run: &mut Execution<'_>,
        start: u64,
        end: u64,
        aggregator: &mut BucketAggregator,
    ) -> StorageResult<()> {
        let points = self.store.read_range(start..end)?;
        if (points.len() as u64) < end - start {
            return Err(StorageError::NotFound {
                offset: start + points.len() as u64,
                len: self.store.len() as u64,
            });
        }

        for (_, point) in &points {
            run.counters.docs_examined += 1;
            if run.query.matches(point) {
                aggregator.fold(point);
                run.counters.points_matched += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::descriptor::BucketUnit;
    use crate::query::error::ErrorKind;
    use crate::storage::Point;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct CollectingSink(Mutex<Vec<QueryTrace>>);

    impl DiagnosticsSink for CollectingSink {
        fn record(&self, trace: &QueryTrace) {
            self.0.lock().unwrap().push(trace.clone());
        }
    }

    fn at(h: u32, m: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(2023, 10, 19, h, m, s)
            .unwrap()
            .timestamp_millis()
    }

    fn setup(points: Vec<Point>) -> (Arc<PointStore>, Arc<TagTimeIndex>) {
        let store = Arc::new(PointStore::in_memory());
        let index = Arc::new(TagTimeIndex::default());
        for point in points {
            let (offset, stored) = store.append_shared(point).unwrap();
            index.index_point(offset, &stored).unwrap();
        }
        (store, index)
    }

    fn cpu(host: &str, time: i64, usage: f64) -> Point {
        Point::new("cpu", time)
            .tag("hostname", host)
            .field("usage_user", usage)
    }

    fn host0_query(start: i64, end: i64) -> QueryDescriptor {
        QueryDescriptor::builder("cpu")
            .tag_eq("hostname", "host_0")
            .time_range(start, end)
            .bucket(BucketUnit::Minute)
            .max("usage_user")
            .build()
    }

    fn scenario() -> (Arc<PointStore>, Arc<TagTimeIndex>) {
        setup(vec![
            cpu("host_0", at(21, 50, 0), 10.0),
            cpu("host_1", at(21, 50, 10), 99.0),
            cpu("host_0", at(21, 50, 30), 20.0),
            cpu("host_0", at(21, 51, 5), 5.0),
        ])
    }

    #[test]
    fn test_minute_max_scenario() {
        let (store, index) = scenario();
        let executor = QueryExecutor::new(store, index);

        for scan in [ScanPreference::Index, ScanPreference::Full] {
            let output = executor
                .execute_with(
                    &host0_query(at(21, 49, 27), at(21, 52, 0)),
                    &QueryOptions::default().scan(scan),
                )
                .unwrap();

            assert_eq!(output.columns, vec!["max_usage_user".to_string()]);
            assert_eq!(
                output.series("max_usage_user"),
                vec![(at(21, 50, 0), 20.0), (at(21, 51, 0), 5.0)]
            );
            assert_eq!(output.trace.points_matched, 3);
            assert_eq!(output.trace.buckets_returned, 2);
        }
    }

    #[test]
    fn test_index_and_full_scan_agree_and_report_plan() {
        let (store, index) = scenario();
        let sink = Arc::new(CollectingSink::default());
        let executor = QueryExecutor::new(store, index).with_sink(sink.clone());
        let query = host0_query(at(21, 0, 0), at(22, 0, 0));

        let by_index = executor
            .execute_with(&query, &QueryOptions::default().scan(ScanPreference::Index))
            .unwrap();
        let by_store = executor
            .execute_with(&query, &QueryOptions::default().scan(ScanPreference::Full))
            .unwrap();
        assert_eq!(by_index.rows, by_store.rows);

        let traces = sink.0.lock().unwrap();
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[0].plan_summary, "IXSCAN { hostname: [host_0] }");
        assert_eq!(traces[0].keys_examined, 3);
        assert_eq!(traces[0].docs_examined, 3);
        assert_eq!(traces[1].plan_summary, "COLLSCAN");
        assert_eq!(traces[1].docs_examined, 4);
        assert_ne!(traces[0].query_id, traces[1].query_id);
    }

    #[test]
    fn test_repeated_query_is_identical() {
        let (store, index) = scenario();
        let executor = QueryExecutor::new(store, index);
        let query = host0_query(at(21, 0, 0), at(22, 0, 0));

        let first = executor.execute(&query).unwrap();
        let second = executor.execute(&query).unwrap();
        assert_eq!(first.rows, second.rows);
    }

    #[test]
    fn test_range_before_all_points_is_empty() {
        let (store, index) = scenario();
        let executor = QueryExecutor::new(store, index);

        let output = executor
            .execute(&host0_query(at(20, 0, 0), at(21, 0, 0)))
            .unwrap();
        assert!(output.is_empty());
        assert!(output.trace.is_done());
    }

    #[test]
    fn test_invalid_query_rejected_without_trace() {
        let (store, index) = scenario();
        let sink = Arc::new(CollectingSink::default());
        let executor = QueryExecutor::new(store, index).with_sink(sink.clone());

        let err = executor
            .execute(&host0_query(at(22, 0, 0), at(21, 0, 0)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidQuery);
        assert!(err.shape().contains("\"measurement\":\"cpu\""));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancellation_fails_query_and_leaves_state_intact() {
        let points = (0..5000)
            .map(|i| cpu(&format!("host_{}", i % 4), i * 1000, i as f64))
            .collect();
        let (store, index) = setup(points);
        let sink = Arc::new(CollectingSink::default());
        let executor = QueryExecutor::with_config(
            Arc::clone(&store),
            Arc::clone(&index),
            QueryConfig {
                batch_size: 100,
                ..QueryConfig::default()
            },
        )
        .with_sink(sink.clone());
        let query = host0_query(0, 5_000_000);

        let token = CancellationToken::new();
        token.cancel();
        let err = executor
            .execute_with(&query, &QueryOptions::default().cancel_token(token))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.stage(), QueryState::Scanning);

        let trace = sink.0.lock().unwrap().last().cloned().unwrap();
        assert_eq!(
            trace.outcome,
            QueryOutcome::Failed {
                kind: ErrorKind::Cancelled,
                stage: QueryState::Scanning
            }
        );

        assert_eq!(store.len(), 5000);
        assert_eq!(index.covered(), 5000);
        let output = executor.execute(&query).unwrap();
        assert_eq!(output.trace.points_matched, 1250);
    }

    #[test]
    fn test_cancellation_mid_scan_after_folding_batches() {
        let points = (0..100_000)
            .map(|i| cpu(&format!("host_{}", i % 4), i * 1000, i as f64))
            .collect();
        let (store, index) = setup(points);
        let sink = Arc::new(CollectingSink::default());
        let executor = QueryExecutor::with_config(
            Arc::clone(&store),
            Arc::clone(&index),
            QueryConfig {
                batch_size: 1,
                ..QueryConfig::default()
            },
        )
        .with_sink(sink.clone());
        let query = host0_query(0, 100_000_000);
        let options_for = |token: &CancellationToken| {
            QueryOptions::default()
                .scan(ScanPreference::Full)
                .cancel_token(token.clone())
        };

        // Cancel from another thread once the scan is under way
        let mut folded_before_cancel = None;
        for _ in 0..20 {
            let token = CancellationToken::new();
            let result = std::thread::scope(|scope| {
                let running = scope.spawn(|| executor.execute_with(&query, &options_for(&token)));
                std::thread::sleep(std::time::Duration::from_millis(2));
                token.cancel();
                running.join().unwrap()
            });

            let trace = sink.0.lock().unwrap().last().cloned().unwrap();
            match result {
                Err(err) => {
                    assert_eq!(err.kind(), ErrorKind::Cancelled);
                    assert_eq!(err.stage(), QueryState::Scanning);
                    assert!(trace.docs_examined < 100_000);
                    if trace.docs_examined > 0 {
                        folded_before_cancel = Some(trace.docs_examined);
                        break;
                    }
                }
                Ok(output) => assert_eq!(output.trace.points_matched, 25_000),
            }
        }
        assert!(folded_before_cancel.is_some(), "scan was never cancelled mid-way");

        assert_eq!(store.len(), 100_000);
        assert_eq!(index.covered(), 100_000);
        let output = executor.execute(&query).unwrap();
        assert_eq!(output.trace.points_matched, 25_000);
        assert_eq!(output.rows.last().and_then(|r| r.get("max_usage_user")), Some(99_996.0));
    }

    #[test]
    fn test_index_disagreeing_with_store_is_storage_error() {
        let (store, index) = setup(vec![cpu("host_0", 1000, 1.0)]);
        // An entry whose time does not match the point it points at
        index.insert("cpu", "hostname", "host_0", 2000, 0).unwrap();

        let executor = QueryExecutor::new(store, index);
        let err = executor
            .execute_with(
                &host0_query(0, 10_000),
                &QueryOptions::default().scan(ScanPreference::Index),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(err.stage(), QueryState::Scanning);
    }

    #[test]
    fn test_watermark_hides_unindexed_points() {
        let (store, index) = setup(vec![cpu("host_0", 1000, 1.0)]);
        // Appended but not yet indexed
        store.append(cpu("host_0", 2000, 50.0)).unwrap();

        let executor = QueryExecutor::new(store, index);
        for scan in [ScanPreference::Index, ScanPreference::Full] {
            let output = executor
                .execute_with(&host0_query(0, 10_000), &QueryOptions::default().scan(scan))
                .unwrap();
            assert_eq!(output.series("max_usage_user"), vec![(0, 1.0)]);
        }
    }

    #[test]
    fn test_multi_key_filter_rechecks_predicate() {
        let (store, index) = setup(vec![
            cpu("host_0", 0, 1.0).tag("region", "eu"),
            cpu("host_0", 1000, 2.0).tag("region", "us"),
            cpu("host_1", 2000, 3.0).tag("region", "eu"),
        ]);
        let executor = QueryExecutor::new(store, index);
        let query = QueryDescriptor::builder("cpu")
            .tag_eq("hostname", "host_0")
            .tag_eq("region", "eu")
            .time_range(0, 60_000)
            .max("usage_user")
            .count("usage_user")
            .build();

        let output = executor
            .execute_with(&query, &QueryOptions::default().scan(ScanPreference::Index))
            .unwrap();
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0].get("max_usage_user"), Some(1.0));
        assert_eq!(output.rows[0].get("count_usage_user"), Some(1.0));
    }
}
