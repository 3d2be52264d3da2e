//! K-way merge of posting-list scans
//!
//! Holds one pending entry per input in a min-heap, so memory is bounded
//! by the number of inputs rather than their length.

use super::{IndexEntry, RangeScan};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    entry: IndexEntry,
    source: usize,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.entry
            .cmp(&other.entry)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Streaming union of range scans, ordered by `(time, offset)`
///
/// An offset reachable from more than one input is yielded once.
#[derive(Debug)]
pub struct MergedScan {
    sources: Vec<RangeScan>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    last: Option<IndexEntry>,
}

impl MergedScan {
    pub fn new(sources: Vec<RangeScan>) -> Self {
        let mut merged = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            sources,
            last: None,
        };
        for source in 0..merged.sources.len() {
            merged.refill(source);
        }
        merged
    }

    fn refill(&mut self, source: usize) {
        if let Some(entry) = self.sources[source].next() {
            self.heap.push(Reverse(HeapEntry { entry, source }));
        }
    }
}

impl Iterator for MergedScan {
    type Item = IndexEntry;

    fn next(&mut self) -> Option<IndexEntry> {
        while let Some(Reverse(HeapEntry { entry, source })) = self.heap.pop() {
            self.refill(source);
            if self.last == Some(entry) {
                continue;
            }
            self.last = Some(entry);
            return Some(entry);
        }
        None
    }
}
