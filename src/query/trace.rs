//! Per-query diagnostic records
//!
//! The executor hands one `QueryTrace` per finished query (successful or
//! not) to a `DiagnosticsSink`. What happens to it is up to the sink;
//! `TracingSink` turns slow queries into structured log events.

use crate::query::error::ErrorKind;
use crate::query::executor::QueryState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Done,
    Failed { kind: ErrorKind, stage: QueryState },
}

/// Structured record of one query execution
#[derive(Debug, Clone, Serialize)]
pub struct QueryTrace {
    pub query_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub measurement: String,
    pub shape: serde_json::Value,
    /// `IXSCAN { key: [values] }` or `COLLSCAN`; empty if planning failed
    pub plan_summary: String,
    pub selectivity: Option<f64>,
    /// Index entries read (0 for full scans)
    pub keys_examined: u64,
    /// Points resolved from the store
    pub docs_examined: u64,
    pub points_matched: u64,
    pub buckets_returned: u64,
    pub duration_ms: u64,
    pub outcome: QueryOutcome,
}

impl QueryTrace {
    pub fn is_done(&self) -> bool {
        self.outcome == QueryOutcome::Done
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Consumer of query traces
pub trait DiagnosticsSink: Send + Sync + std::fmt::Debug {
    fn record(&self, trace: &QueryTrace);
}

/// Discards every trace
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl DiagnosticsSink for NoopSink {
    fn record(&self, _trace: &QueryTrace) {}
}

/// Logs traces through `tracing`
///
/// Queries at or above the threshold are logged at INFO as "Slow query",
/// failures at WARN, everything else at DEBUG.
#[derive(Debug, Clone)]
pub struct TracingSink {
    pub slow_query_threshold: Duration,
}

impl TracingSink {
    pub fn new(slow_query_threshold: Duration) -> Self {
        Self { slow_query_threshold }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl DiagnosticsSink for TracingSink {
    fn record(&self, trace: &QueryTrace) {
        if let QueryOutcome::Failed { kind, stage } = trace.outcome {
            tracing::warn!(
                query_id = %trace.query_id,
                shape = %trace.shape,
                kind = %kind,
                stage = %stage,
                duration_ms = trace.duration_ms,
                "Query failed"
            );
            return;
        }

        if trace.duration_ms >= self.slow_query_threshold.as_millis() as u64 {
            tracing::info!(
                query_id = %trace.query_id,
                measurement = %trace.measurement,
                shape = %trace.shape,
                plan = %trace.plan_summary,
                keys_examined = trace.keys_examined,
                docs_examined = trace.docs_examined,
                n_returned = trace.buckets_returned,
                duration_ms = trace.duration_ms,
                "Slow query"
            );
        } else {
            tracing::debug!(
                query_id = %trace.query_id,
                plan = %trace.plan_summary,
                docs_examined = trace.docs_examined,
                n_returned = trace.buckets_returned,
                duration_ms = trace.duration_ms,
                "Query finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(outcome: QueryOutcome) -> QueryTrace {
        QueryTrace {
            query_id: Uuid::new_v4(),
            started_at: Utc::now(),
            measurement: "cpu".into(),
            shape: serde_json::json!({ "measurement": "cpu" }),
            plan_summary: "COLLSCAN".into(),
            selectivity: None,
            keys_examined: 0,
            docs_examined: 12,
            points_matched: 3,
            buckets_returned: 2,
            duration_ms: 7,
            outcome,
        }
    }

    #[test]
    fn test_trace_serializes() {
        let json: serde_json::Value = serde_json::from_str(&sample(QueryOutcome::Done).to_json()).unwrap();
        assert_eq!(json["plan_summary"], "COLLSCAN");
        assert_eq!(json["docs_examined"], 12);
        assert_eq!(json["outcome"]["status"], "done");

        let failed = sample(QueryOutcome::Failed {
            kind: ErrorKind::Cancelled,
            stage: QueryState::Scanning,
        });
        let json: serde_json::Value = serde_json::from_str(&failed.to_json()).unwrap();
        assert_eq!(json["outcome"]["status"], "failed");
        assert_eq!(json["outcome"]["kind"], "cancelled");
        assert_eq!(json["outcome"]["stage"], "scanning");
        assert!(!failed.is_done());
    }

    #[test]
    fn test_sinks_accept_traces() {
        NoopSink.record(&sample(QueryOutcome::Done));
        TracingSink::new(Duration::ZERO).record(&sample(QueryOutcome::Done));
        TracingSink::default().record(&sample(QueryOutcome::Failed {
            kind: ErrorKind::Storage,
            stage: QueryState::Planned,
        }));
    }
}
