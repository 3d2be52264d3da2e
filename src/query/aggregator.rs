//! Streaming bucket aggregation
//!
//! Each folded point is assigned to the bucket starting at
//! `bucket.truncate(point.time)` and updates one running scalar per
//! aggregation. Only buckets that received a point exist; `drain` hands
//! them back in ascending bucket order and resets the aggregator.

use crate::query::descriptor::{AggregationOp, AggregationSpec, BucketSpec};
use crate::storage::{Point, Timestamp};
use serde::Serialize;
use std::collections::BTreeMap;

/// One output bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    /// Bucket start
    pub timestamp: Timestamp,
    /// Aggregate values keyed by name; absent when no point in the bucket
    /// carried the field
    pub values: BTreeMap<String, f64>,
}

impl ResultRow {
    pub fn get(&self, column: &str) -> Option<f64> {
        self.values.get(column).copied()
    }
}

#[derive(Debug, Clone, Copy)]
enum Accumulator {
    Max(Option<f64>),
    Min(Option<f64>),
    Count(u64),
}

impl Accumulator {
    fn new(op: AggregationOp) -> Self {
        match op {
            AggregationOp::Max => Self::Max(None),
            AggregationOp::Min => Self::Min(None),
            AggregationOp::Count => Self::Count(0),
        }
    }

    fn update(&mut self, value: f64) {
        match self {
            Self::Max(current) => *current = Some(current.map_or(value, |c| c.max(value))),
            Self::Min(current) => *current = Some(current.map_or(value, |c| c.min(value))),
            Self::Count(n) => *n += 1,
        }
    }

    fn value(&self) -> Option<f64> {
        match *self {
            Self::Max(v) | Self::Min(v) => v,
            Self::Count(0) => None,
            Self::Count(n) => Some(n as f64),
        }
    }
}

/// Per-query reducer from points to bucket rows
#[derive(Debug)]
pub struct BucketAggregator {
    bucket: BucketSpec,
    specs: Vec<AggregationSpec>,
    buckets: BTreeMap<Timestamp, Vec<Accumulator>>,
    folded: u64,
}

impl BucketAggregator {
    pub fn new(bucket: BucketSpec, specs: &[AggregationSpec]) -> Self {
        Self {
            bucket,
            specs: specs.to_vec(),
            buckets: BTreeMap::new(),
            folded: 0,
        }
    }

    /// Fold one accepted point into its bucket
    pub fn fold(&mut self, point: &Point) {
        let key = self.bucket.truncate(point.time);
        let specs = &self.specs;
        let accumulators = self
            .buckets
            .entry(key)
            .or_insert_with(|| specs.iter().map(|s| Accumulator::new(s.op)).collect());

        for (spec, acc) in specs.iter().zip(accumulators.iter_mut()) {
            // A missing field leaves the running value untouched
            if let Some(value) = point.field_value(&spec.field) {
                acc.update(value);
            }
        }
        self.folded += 1;
    }

    /// Take all buckets in ascending order, leaving the aggregator empty
    pub fn drain(&mut self) -> Vec<ResultRow> {
        let buckets = std::mem::take(&mut self.buckets);
        self.folded = 0;

        buckets
            .into_iter()
            .map(|(timestamp, accumulators)| ResultRow {
                timestamp,
                values: self
                    .specs
                    .iter()
                    .zip(&accumulators)
                    .filter_map(|(spec, acc)| acc.value().map(|v| (spec.name.clone(), v)))
                    .collect(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn points_folded(&self) -> u64 {
        self.folded
    }
}
