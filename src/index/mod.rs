//! Index structures for tag-filtered time-range scans
//!
//! - **TagTimeIndex**: `(measurement, tag key, tag value)` → time-sorted
//!   posting list of point offsets
//! - **MergedScan**: streaming k-way merge of several posting-list scans,
//!   used for `$in`-style multi-value filters
//!
//! # Architecture
//!
//! ```text
//! Filter: hostname ∈ {host_0, host_3}, time ∈ [t0, t1)
//!        ↓
//! range_scan(host_0) ─┐
//!                     ├─ MergedScan → offsets ordered by (time, offset)
//! range_scan(host_3) ─┘
//! ```
//!
//! The index is rebuilt from the point store on open; the store's WAL and
//! segments are its recovery source.

mod merge;
mod tag_index;

pub use merge::MergedScan;
pub use tag_index::{RangeScan, TagTimeIndex};

use crate::storage::{PointOffset, Timestamp};
use std::collections::HashSet;

/// One posting-list entry; ordering is by time, then offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexEntry {
    pub time: Timestamp,
    pub offset: PointOffset,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PostingKey {
    pub measurement: String,
    pub tag_key: String,
    pub tag_value: String,
}

impl PostingKey {
    pub fn new(measurement: &str, tag_key: &str, tag_value: &str) -> Self {
        Self {
            measurement: measurement.to_string(),
            tag_key: tag_key.to_string(),
            tag_value: tag_value.to_string(),
        }
    }
}

/// Which tag keys get posting lists
#[derive(Debug, Clone, Default)]
pub struct IndexConfig {
    /// `None` indexes every tag key
    pub indexed_tags: Option<HashSet<String>>,
}

impl IndexConfig {
    /// Index only the given tag keys
    pub fn only<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            indexed_tags: Some(keys.into_iter().map(Into::into).collect()),
        }
    }

    pub fn indexes(&self, tag_key: &str) -> bool {
        self.indexed_tags
            .as_ref()
            .map(|keys| keys.contains(tag_key))
            .unwrap_or(true)
    }
}

/// Statistics about the index
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub measurements: usize,
    /// Distinct (measurement, tag key) pairs
    pub tag_keys: usize,
    pub posting_lists: usize,
    pub total_entries: u64,
    pub indexed_points: u64,
}

impl std::fmt::Display for IndexStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Measurements: {}, Tag keys: {}, Postings: {}, Entries: {}, Indexed points: {}",
            self.measurements,
            self.tag_keys,
            self.posting_lists,
            self.total_entries,
            self.indexed_points
        )
    }
}
