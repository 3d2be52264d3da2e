//! Tag/time index
//!
//! Maps `(measurement, tag key, tag value)` to a posting list of
//! `(time, offset)` entries kept sorted by time, ties by offset. Posting
//! lists are copy-on-write: a range scan takes an `Arc` snapshot under a
//! short read lock and then iterates with no lock held, while the single
//! writer clones a list only if a scan still holds the old one.

use super::{IndexConfig, IndexEntry, IndexStats, PostingKey};
use crate::storage::{Point, PointOffset, StorageError, StorageResult, TimeRange, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct IndexState {
    postings: HashMap<PostingKey, Arc<Vec<IndexEntry>>>,
    /// Points indexed per measurement, including points with no indexed tag
    measurement_points: HashMap<String, u64>,
    total_entries: u64,
    /// Store prefix `0..covered` has been indexed
    covered: PointOffset,
}

/// Secondary index over tag values and time
#[derive(Debug, Default)]
pub struct TagTimeIndex {
    config: IndexConfig,
    state: RwLock<IndexState>,
}

impl TagTimeIndex {
    pub fn new(config: IndexConfig) -> Self {
        Self {
            config,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Whether entries are kept for this tag key
    pub fn is_indexed(&self, tag_key: &str) -> bool {
        self.config.indexes(tag_key)
    }

    /// Insert one entry into a posting list
    pub fn insert(
        &self,
        measurement: &str,
        tag_key: &str,
        tag_value: &str,
        time: Timestamp,
        offset: PointOffset,
    ) -> StorageResult<()> {
        let mut state = self.state.write()?;
        Self::insert_locked(&mut state, PostingKey::new(measurement, tag_key, tag_value), time, offset);
        Ok(())
    }

    fn insert_locked(state: &mut IndexState, key: PostingKey, time: Timestamp, offset: PointOffset) {
        let entry = IndexEntry { time, offset };
        let list = Arc::make_mut(state.postings.entry(key).or_default());

        // Appends are usually in time order; out-of-order points are
        // placed by binary search.
        match list.last() {
            Some(last) if *last > entry => {
                let pos = list.partition_point(|e| *e < entry);
                list.insert(pos, entry);
            }
            _ => list.push(entry),
        }
        state.total_entries += 1;
    }

    /// Index every indexed tag of the point stored at `offset`
    ///
    /// Offsets must arrive densely in append order; the covered watermark
    /// advances to `offset + 1`.
    pub fn index_point(&self, offset: PointOffset, point: &Point) -> StorageResult<()> {
        let mut state = self.state.write()?;
        if offset != state.covered {
            return Err(StorageError::Corruption(format!(
                "index expected offset {}, got {}",
                state.covered, offset
            )));
        }

        for (key, value) in &point.tags {
            if self.config.indexes(key) {
                Self::insert_locked(
                    &mut state,
                    PostingKey::new(&point.measurement, key, value),
                    point.time,
                    offset,
                );
            }
        }

        *state
            .measurement_points
            .entry(point.measurement.clone())
            .or_default() += 1;
        state.covered = offset + 1;
        Ok(())
    }

    /// Lazy, time-ordered scan of one posting list
    ///
    /// The scan sees the posting list as of this call and yields only
    /// offsets below `upto`. Calling again gives a fresh scan over the
    /// current state.
    pub fn range_scan(
        &self,
        measurement: &str,
        tag_key: &str,
        tag_value: &str,
        range: TimeRange,
        upto: PointOffset,
    ) -> StorageResult<RangeScan> {
        let key = PostingKey::new(measurement, tag_key, tag_value);
        let list = self.state.read()?.postings.get(&key).cloned();
        Ok(RangeScan::new(list.unwrap_or_default(), range, upto))
    }

    /// Number of entries of one posting list within `range`
    pub fn count_in_range(
        &self,
        measurement: &str,
        tag_key: &str,
        tag_value: &str,
        range: TimeRange,
    ) -> StorageResult<u64> {
        let key = PostingKey::new(measurement, tag_key, tag_value);
        let state = self.state.read()?;
        Ok(state
            .postings
            .get(&key)
            .map(|list| {
                let (start, end) = bounds(list, range);
                (end - start) as u64
            })
            .unwrap_or(0))
    }

    /// Points indexed for a measurement
    pub fn measurement_points(&self, measurement: &str) -> StorageResult<u64> {
        Ok(self
            .state
            .read()?
            .measurement_points
            .get(measurement)
            .copied()
            .unwrap_or(0))
    }

    /// Length of the indexed store prefix
    pub fn covered(&self) -> PointOffset {
        self.state.read().map(|s| s.covered).unwrap_or(0)
    }

    /// Indexed tag keys of a measurement, sorted
    pub fn tag_keys(&self, measurement: &str) -> StorageResult<Vec<String>> {
        let state = self.state.read()?;
        let keys: BTreeSet<&str> = state
            .postings
            .keys()
            .filter(|k| k.measurement == measurement)
            .map(|k| k.tag_key.as_str())
            .collect();
        Ok(keys.into_iter().map(String::from).collect())
    }

    /// Distinct values seen for a tag key, sorted
    pub fn tag_values(&self, measurement: &str, tag_key: &str) -> StorageResult<Vec<String>> {
        let state = self.state.read()?;
        let mut values: Vec<String> = state
            .postings
            .keys()
            .filter(|k| k.measurement == measurement && k.tag_key == tag_key)
            .map(|k| k.tag_value.clone())
            .collect();
        values.sort();
        Ok(values)
    }

    pub fn stats(&self) -> StorageResult<IndexStats> {
        let state = self.state.read()?;
        let tag_keys: BTreeSet<(&str, &str)> = state
            .postings
            .keys()
            .map(|k| (k.measurement.as_str(), k.tag_key.as_str()))
            .collect();
        Ok(IndexStats {
            measurements: state.measurement_points.len(),
            tag_keys: tag_keys.len(),
            posting_lists: state.postings.len(),
            total_entries: state.total_entries,
            indexed_points: state.covered,
        })
    }
}

/// Entry positions `[start, end)` of a sorted list that fall in `range`
fn bounds(list: &[IndexEntry], range: TimeRange) -> (usize, usize) {
    let start = list.partition_point(|e| e.time < range.start);
    let end = list.partition_point(|e| e.time < range.end).max(start);
    (start, end)
}

/// Iterator over a posting-list snapshot
#[derive(Debug, Clone)]
pub struct RangeScan {
    list: Arc<Vec<IndexEntry>>,
    pos: usize,
    end: usize,
    upto: PointOffset,
}

impl RangeScan {
    fn new(list: Arc<Vec<IndexEntry>>, range: TimeRange, upto: PointOffset) -> Self {
        let (pos, end) = bounds(&list, range);
        Self { list, pos, end, upto }
    }
}

impl Iterator for RangeScan {
    type Item = IndexEntry;

    fn next(&mut self) -> Option<IndexEntry> {
        while self.pos < self.end {
            let entry = self.list[self.pos];
            self.pos += 1;
            if entry.offset < self.upto {
                return Some(entry);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.end - self.pos))
    }
}
