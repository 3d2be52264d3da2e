//! Core data types for the tsagg point store
//!
//! - `Point`: one immutable time-series record
//! - `TimeRange`: a half-open time interval used by scans and queries
//! - `Timestamp` / `PointOffset`: the primitive coordinates of the store

use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Earliest timestamp a point may carry
///
/// Leaves one widest bucket (`u32::MAX` days) of headroom above
/// `i64::MIN`, so every bucket start of a stored point is representable.
pub const MIN_TIMESTAMP: Timestamp = Timestamp::MIN + 86_400_000 * u32::MAX as i64;

/// Position of a point in append order (0-based, dense, never reused)
pub type PointOffset = u64;

/// A single time-series point
///
/// Field sets vary per point; an absent field is simply not present in
/// `fields`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Point {
    /// Measurement (series family), e.g. `cpu`
    pub measurement: String,
    /// Tag set used for filtering
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Unix timestamp in milliseconds
    pub time: Timestamp,
    /// Numeric field values
    #[serde(default)]
    pub fields: HashMap<String, f64>,
}

impl Point {
    /// Create a point with no tags or fields
    pub fn new(measurement: impl Into<String>, time: Timestamp) -> Self {
        Self {
            measurement: measurement.into(),
            tags: HashMap::new(),
            time,
            fields: HashMap::new(),
        }
    }

    /// Builder method: add a tag
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder method: add a field value
    pub fn field(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Check if this point has a specific tag value
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.get(key).map(|v| v == value).unwrap_or(false)
    }

    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field_value(&self, name: &str) -> Option<f64> {
        self.fields.get(name).copied()
    }

    /// Reject points the store cannot hold faithfully
    pub fn validate(&self) -> StorageResult<()> {
        if self.measurement.is_empty() {
            return Err(StorageError::Validation("measurement is empty".into()));
        }
        if self.time < MIN_TIMESTAMP {
            return Err(StorageError::Validation(format!(
                "time {} is before the earliest bucketable timestamp {}",
                self.time, MIN_TIMESTAMP
            )));
        }
        if self.tags.keys().any(|k| k.is_empty()) {
            return Err(StorageError::Validation(format!(
                "empty tag key on {} point at {}",
                self.measurement, self.time
            )));
        }
        for (name, value) in &self.fields {
            if name.is_empty() {
                return Err(StorageError::Validation(format!(
                    "empty field name on {} point at {}",
                    self.measurement, self.time
                )));
            }
            if !value.is_finite() {
                return Err(StorageError::Validation(format!(
                    "field {} is not finite ({})",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Time range for queries and scans (start inclusive, end exclusive)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub start: Timestamp,
    /// End timestamp (exclusive), in milliseconds
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a time range, returning None if start >= end
    pub fn try_new(start: Timestamp, end: Timestamp) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Range covering every representable timestamp
    pub fn all() -> Self {
        Self {
            start: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Check if this range overlaps with another
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Get the duration in milliseconds
    pub fn duration_millis(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Get intersection with another range, if any
    pub fn intersection(&self, other: &TimeRange) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        Self::try_new(start, end)
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_builder() {
        let point = Point::new("cpu", 1000)
            .tag("hostname", "host_0")
            .field("usage_user", 12.5);

        assert!(point.has_tag("hostname", "host_0"));
        assert!(!point.has_tag("hostname", "host_1"));
        assert_eq!(point.tag_value("region"), None);
        assert_eq!(point.field_value("usage_user"), Some(12.5));
        assert_eq!(point.field_value("usage_system"), None);
    }

    #[test]
    fn test_point_validation() {
        assert!(Point::new("cpu", 0).field("a", 1.0).validate().is_ok());

        let err = Point::new("", 0).validate().unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));

        let err = Point::new("cpu", 0)
            .field("usage_user", f64::NAN)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("usage_user"));

        let err = Point::new("cpu", 0).tag("", "x").validate().unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));

        let err = Point::new("cpu", i64::MIN + 1).validate().unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
        assert!(Point::new("cpu", MIN_TIMESTAMP - 1).validate().is_err());
        assert!(Point::new("cpu", MIN_TIMESTAMP).validate().is_ok());
        assert!(Point::new("cpu", i64::MAX).validate().is_ok());
    }

    #[test]
    fn test_time_range_half_open() {
        let range = TimeRange::try_new(1000, 2000).unwrap();
        assert!(range.contains(1000));
        assert!(range.contains(1999));
        assert!(!range.contains(2000));
        assert!(!range.contains(999));
        assert_eq!(range.duration_millis(), 1000);
        assert!(TimeRange::try_new(2000, 2000).is_none());
    }

    #[test]
    fn test_time_range_intersection() {
        let a = TimeRange::try_new(0, 100).unwrap();
        let b = TimeRange::try_new(50, 150).unwrap();
        let c = TimeRange::try_new(100, 200).unwrap();

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.intersection(&b), TimeRange::try_new(50, 100));
        assert_eq!(a.intersection(&c), None);
    }
}
