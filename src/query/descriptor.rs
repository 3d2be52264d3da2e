//! Query descriptor types
//!
//! A `QueryDescriptor` is what callers submit: measurement, tag filter
//! (`$in` sets per key), half-open time range, bucket granularity and the
//! aggregations to compute per bucket.
//!
//! ```rust
//! use tsagg::query::{BucketUnit, QueryDescriptor};
//!
//! let query = QueryDescriptor::builder("cpu")
//!     .tag_in("hostname", ["host_0", "host_3"])
//!     .time_range(1_697_752_167_000, 1_697_752_320_000)
//!     .bucket(BucketUnit::Minute)
//!     .max("usage_user")
//!     .build();
//!
//! assert_eq!(query.columns(), vec!["max_usage_user".to_string()]);
//! ```

use crate::storage::{Point, TimeRange, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::str::FromStr;

/// Fixed-width bucket units (no calendar-aware months or years)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketUnit {
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
}

impl BucketUnit {
    /// Duration of one unit in milliseconds
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::Millisecond => 1,
            Self::Second => 1_000,
            Self::Minute => 60_000,
            Self::Hour => 3_600_000,
            Self::Day => 86_400_000,
        }
    }

    pub fn all() -> &'static [BucketUnit] {
        &[
            Self::Millisecond,
            Self::Second,
            Self::Minute,
            Self::Hour,
            Self::Day,
        ]
    }
}

impl std::fmt::Display for BucketUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Millisecond => write!(f, "millisecond"),
            Self::Second => write!(f, "second"),
            Self::Minute => write!(f, "minute"),
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
        }
    }
}

impl FromStr for BucketUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ms" | "millisecond" | "milliseconds" => Ok(Self::Millisecond),
            "s" | "sec" | "second" | "seconds" => Ok(Self::Second),
            "m" | "min" | "minute" | "minutes" => Ok(Self::Minute),
            "h" | "hour" | "hours" => Ok(Self::Hour),
            "d" | "day" | "days" => Ok(Self::Day),
            other => Err(format!("unknown bucket unit: {}", other)),
        }
    }
}

/// Round `t` down to the start of its `unit` bucket
pub fn truncate(t: Timestamp, unit: BucketUnit) -> Timestamp {
    BucketSpec::new(unit).truncate(t)
}

/// Bucket width: `bin_size` consecutive units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketSpec {
    pub unit: BucketUnit,
    #[serde(default = "default_bin_size")]
    pub bin_size: u32,
}

fn default_bin_size() -> u32 {
    1
}

impl BucketSpec {
    pub fn new(unit: BucketUnit) -> Self {
        Self { unit, bin_size: 1 }
    }

    pub fn with_bin_size(unit: BucketUnit, bin_size: u32) -> Self {
        Self { unit, bin_size }
    }

    /// Bucket width in milliseconds (at least 1)
    pub fn width_ms(&self) -> i64 {
        self.unit.duration_ms() * i64::from(self.bin_size.max(1))
    }

    /// Start of the bucket containing `t`
    ///
    /// Floors toward negative infinity, so a timestamp exactly on a
    /// boundary starts its own bucket and pre-epoch timestamps land in the
    /// bucket below them. Every `t >= MIN_TIMESTAMP`, which ingest
    /// enforces, has a representable bucket start.
    pub fn truncate(&self, t: Timestamp) -> Timestamp {
        let width = self.width_ms();
        t - t.rem_euclid(width)
    }
}

/// Per-bucket reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationOp {
    Max,
    Min,
    /// Number of points in the bucket carrying the field
    Count,
}

impl std::fmt::Display for AggregationOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Max => write!(f, "max"),
            Self::Min => write!(f, "min"),
            Self::Count => write!(f, "count"),
        }
    }
}

impl FromStr for AggregationOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(Self::Max),
            "min" => Ok(Self::Min),
            "count" => Ok(Self::Count),
            other => Err(format!("unknown aggregation: {}", other)),
        }
    }
}

/// One output column: `op(field)` named `name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub name: String,
    pub field: String,
    pub op: AggregationOp,
}

impl AggregationSpec {
    /// Named `{op}_{field}` by default
    pub fn new(op: AggregationOp, field: impl Into<String>) -> Self {
        let field = field.into();
        Self {
            name: format!("{}_{}", op, field),
            field,
            op,
        }
    }

    pub fn max(field: impl Into<String>) -> Self {
        Self::new(AggregationOp::Max, field)
    }

    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Parses `op:field` or `op:field:name`
impl FromStr for AggregationSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let (Some(op), Some(field)) = (parts.next(), parts.next()) else {
            return Err(format!("expected op:field[:name], got {:?}", s));
        };
        let spec = AggregationSpec::new(op.parse()?, field);
        Ok(match parts.next() {
            Some(name) => spec.alias(name),
            None => spec,
        })
    }
}

/// A complete aggregation query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub measurement: String,
    /// Tag key → allowed values; a point must match every key
    #[serde(default)]
    pub tag_filter: BTreeMap<String, BTreeSet<String>>,
    pub time_range: TimeRange,
    pub bucket: BucketSpec,
    pub aggregations: Vec<AggregationSpec>,
}

impl QueryDescriptor {
    pub fn builder(measurement: impl Into<String>) -> QueryBuilder {
        QueryBuilder::new(measurement)
    }

    /// Reasons this descriptor cannot run, checked before any I/O
    pub fn validate(&self) -> Result<(), String> {
        if self.measurement.is_empty() {
            return Err("measurement is empty".into());
        }
        if self.time_range.start >= self.time_range.end {
            return Err(format!(
                "time range start {} is not before end {}",
                self.time_range.start, self.time_range.end
            ));
        }
        if self.bucket.bin_size == 0 {
            return Err("bin size must be at least 1".into());
        }
        if self.aggregations.is_empty() {
            return Err("no aggregations requested".into());
        }

        let mut names = HashSet::new();
        for spec in &self.aggregations {
            if spec.field.is_empty() {
                return Err(format!("aggregation {} has an empty field name", spec.name));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(format!("duplicate aggregation name {}", spec.name));
            }
        }
        Ok(())
    }

    /// Full predicate: measurement, every tag filter, time range
    pub fn matches(&self, point: &Point) -> bool {
        point.measurement == self.measurement
            && self.time_range.contains(point.time)
            && self.tag_filter.iter().all(|(key, allowed)| {
                point
                    .tag_value(key)
                    .map(|v| allowed.contains(v))
                    .unwrap_or(false)
            })
    }

    /// Output column names in declaration order
    pub fn columns(&self) -> Vec<String> {
        self.aggregations.iter().map(|a| a.name.clone()).collect()
    }

    /// Canonical JSON description used in traces and error context
    pub fn shape(&self) -> serde_json::Value {
        let filter: serde_json::Map<String, serde_json::Value> = self
            .tag_filter
            .iter()
            .map(|(key, values)| (key.clone(), json!({ "$in": values })))
            .collect();
        let group: serde_json::Map<String, serde_json::Value> = self
            .aggregations
            .iter()
            .map(|a| {
                let mut op = serde_json::Map::new();
                op.insert(format!("${}", a.op), json!(format!("${}", a.field)));
                (a.name.clone(), serde_json::Value::Object(op))
            })
            .collect();

        json!({
            "measurement": self.measurement,
            "filter": filter,
            "time": { "$gte": self.time_range.start, "$lt": self.time_range.end },
            "bucket": { "unit": self.bucket.unit, "binSize": self.bucket.bin_size },
            "group": group,
        })
    }

    pub fn shape_string(&self) -> String {
        self.shape().to_string()
    }
}

/// Builder for [`QueryDescriptor`]
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    descriptor: QueryDescriptor,
}

impl QueryBuilder {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            descriptor: QueryDescriptor {
                measurement: measurement.into(),
                tag_filter: BTreeMap::new(),
                time_range: TimeRange::all(),
                bucket: BucketSpec::new(BucketUnit::Minute),
                aggregations: Vec::new(),
            },
        }
    }

    /// Allow any of `values` for `key` (adds to earlier values for the key)
    pub fn tag_in<I, S>(mut self, key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor
            .tag_filter
            .entry(key.into())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn tag_eq(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tag_in(key, [value.into()])
    }

    /// Half-open `[start, end)`; not checked until validation
    pub fn time_range(mut self, start: Timestamp, end: Timestamp) -> Self {
        self.descriptor.time_range = TimeRange { start, end };
        self
    }

    pub fn bucket(mut self, unit: BucketUnit) -> Self {
        self.descriptor.bucket.unit = unit;
        self
    }

    pub fn bin_size(mut self, bin_size: u32) -> Self {
        self.descriptor.bucket.bin_size = bin_size;
        self
    }

    pub fn aggregate(mut self, spec: AggregationSpec) -> Self {
        self.descriptor.aggregations.push(spec);
        self
    }

    pub fn max(self, field: impl Into<String>) -> Self {
        self.aggregate(AggregationSpec::new(AggregationOp::Max, field))
    }

    pub fn min(self, field: impl Into<String>) -> Self {
        self.aggregate(AggregationSpec::new(AggregationOp::Min, field))
    }

    pub fn count(self, field: impl Into<String>) -> Self {
        self.aggregate(AggregationSpec::new(AggregationOp::Count, field))
    }

    pub fn build(self) -> QueryDescriptor {
        self.descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_minute() {
        // 21:49:27.5 → 21:49:00
        let t = 1_697_752_167_500;
        assert_eq!(truncate(t, BucketUnit::Minute), 1_697_752_140_000);
        assert_eq!(truncate(t, BucketUnit::Second), 1_697_752_167_000);
        assert_eq!(truncate(t, BucketUnit::Hour), 1_697_749_200_000);
        assert_eq!(truncate(t, BucketUnit::Day), 1_697_673_600_000);
        assert_eq!(truncate(t, BucketUnit::Millisecond), t);
    }

    #[test]
    fn test_truncate_boundary_and_negative() {
        assert_eq!(truncate(60_000, BucketUnit::Minute), 60_000);
        assert_eq!(truncate(59_999, BucketUnit::Minute), 0);
        assert_eq!(truncate(-1, BucketUnit::Minute), -60_000);
        assert_eq!(truncate(-60_000, BucketUnit::Minute), -60_000);
    }

    #[test]
    fn test_bin_size() {
        let five_minutes = BucketSpec::with_bin_size(BucketUnit::Minute, 5);
        assert_eq!(five_minutes.width_ms(), 300_000);
        assert_eq!(five_minutes.truncate(299_999), 0);
        assert_eq!(five_minutes.truncate(300_000), 300_000);
        assert_eq!(five_minutes.truncate(-1), -300_000);
    }

    #[test]
    fn test_parse_units_and_aggregations() {
        assert_eq!("minute".parse::<BucketUnit>(), Ok(BucketUnit::Minute));
        assert_eq!("H".parse::<BucketUnit>(), Ok(BucketUnit::Hour));
        assert!("month".parse::<BucketUnit>().is_err());

        let spec: AggregationSpec = "max:usage_user".parse().unwrap();
        assert_eq!(spec, AggregationSpec::max("usage_user"));
        assert_eq!(spec.name, "max_usage_user");

        let spec: AggregationSpec = "min:usage_system:floor".parse().unwrap();
        assert_eq!(spec.op, AggregationOp::Min);
        assert_eq!(spec.name, "floor");

        assert!("avg:usage_user".parse::<AggregationSpec>().is_err());
        assert!("max".parse::<AggregationSpec>().is_err());
    }

    #[test]
    fn test_validation() {
        let ok = QueryDescriptor::builder("cpu")
            .time_range(0, 10)
            .max("usage_user")
            .build();
        assert!(ok.validate().is_ok());

        let empty_measurement = QueryDescriptor { measurement: String::new(), ..ok.clone() };
        assert!(empty_measurement.validate().is_err());

        let inverted = QueryDescriptor::builder("cpu")
            .time_range(10, 10)
            .max("usage_user")
            .build();
        assert!(inverted.validate().unwrap_err().contains("not before"));

        let zero_bin = QueryDescriptor::builder("cpu")
            .time_range(0, 10)
            .bin_size(0)
            .max("usage_user")
            .build();
        assert!(zero_bin.validate().is_err());

        let duplicate = QueryDescriptor::builder("cpu")
            .time_range(0, 10)
            .max("usage_user")
            .max("usage_user")
            .build();
        assert!(duplicate.validate().unwrap_err().contains("duplicate"));

        let no_aggs = QueryDescriptor::builder("cpu").time_range(0, 10).build();
        assert!(no_aggs.validate().is_err());
    }

    #[test]
    fn test_matches() {
        let query = QueryDescriptor::builder("cpu")
            .tag_in("hostname", ["host_0", "host_1"])
            .tag_eq("region", "eu")
            .time_range(1000, 2000)
            .max("usage_user")
            .build();

        let point = Point::new("cpu", 1000)
            .tag("hostname", "host_1")
            .tag("region", "eu");
        assert!(query.matches(&point));

        assert!(!query.matches(&Point { time: 2000, ..point.clone() }));
        assert!(!query.matches(&Point { measurement: "mem".into(), ..point.clone() }));
        assert!(!query.matches(&point.clone().tag("hostname", "host_2")));
        assert!(!query.matches(&Point::new("cpu", 1500).tag("hostname", "host_0")));
    }

    #[test]
    fn test_shape_is_canonical() {
        let a = QueryDescriptor::builder("cpu")
            .tag_in("hostname", ["host_3", "host_0"])
            .time_range(0, 60_000)
            .max("usage_user")
            .build();
        let b = QueryDescriptor::builder("cpu")
            .tag_in("hostname", ["host_0", "host_3"])
            .time_range(0, 60_000)
            .max("usage_user")
            .build();

        assert_eq!(a.shape_string(), b.shape_string());
        let shape = a.shape();
        assert_eq!(shape["filter"]["hostname"]["$in"], json!(["host_0", "host_3"]));
        assert_eq!(shape["group"]["max_usage_user"], json!({ "$max": "$usage_user" }));
        assert_eq!(shape["bucket"]["unit"], json!("minute"));
    }
}
