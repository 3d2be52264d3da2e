//! Block encoding for sealed segments
//!
//! Points are stored in offset order (never re-sorted, since a point's
//! position is its offset). Timestamps are delta-encoded against the
//! previous point, and measurement names, tag keys/values and field names
//! go through one string intern table. The bincode image is then LZ4
//! compressed.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Point, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize)]
struct EncodedBlock {
    /// First point's timestamp
    base_timestamp: Timestamp,
    /// Difference from the previous point (first entry is 0)
    timestamp_deltas: Vec<i64>,
    /// Interned measurement per point
    measurements: Vec<u32>,
    strings: StringTable,
    /// (key, value) intern pairs per point
    point_tags: Vec<Vec<(u32, u32)>>,
    /// (field name, value) per point
    point_fields: Vec<Vec<(u32, f64)>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StringTable {
    strings: Vec<String>,
    #[serde(skip)]
    lookup: HashMap<String, u32>,
}

impl StringTable {
    fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.lookup.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.lookup.insert(s.to_string(), idx);
        idx
    }

    fn get(&self, idx: u32) -> StorageResult<&str> {
        self.strings
            .get(idx as usize)
            .map(String::as_str)
            .ok_or_else(|| StorageError::Corruption(format!("string index {} out of range", idx)))
    }
}

/// Encode and compress a block of points
pub fn compress_block(points: &[Point]) -> StorageResult<Vec<u8>> {
    if points.is_empty() {
        return Ok(Vec::new());
    }

    let base_timestamp = points[0].time;
    let mut prev_ts = base_timestamp;
    let mut strings = StringTable::default();
    let mut block_tags = Vec::with_capacity(points.len());
    let mut block_fields = Vec::with_capacity(points.len());
    let mut timestamp_deltas = Vec::with_capacity(points.len());
    let mut measurements = Vec::with_capacity(points.len());

    for point in points {
        timestamp_deltas.push(point.time.wrapping_sub(prev_ts));
        prev_ts = point.time;
        measurements.push(strings.intern(&point.measurement));

        let mut tags: Vec<(u32, u32)> = point
            .tags
            .iter()
            .map(|(k, v)| (strings.intern(k), strings.intern(v)))
            .collect();
        tags.sort_unstable();
        block_tags.push(tags);

        let mut fields: Vec<(u32, f64)> = point
            .fields
            .iter()
            .map(|(name, value)| (strings.intern(name), *value))
            .collect();
        fields.sort_unstable_by_key(|(idx, _)| *idx);
        block_fields.push(fields);
    }

    let block = EncodedBlock {
        base_timestamp,
        timestamp_deltas,
        measurements,
        strings,
        point_tags: block_tags,
        point_fields: block_fields,
    };

    let serialized = bincode::serialize(&block)?;
    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress a block produced by [`compress_block`], preserving order
pub fn decompress_block(data: &[u8]) -> StorageResult<Vec<Point>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;

    let block: EncodedBlock = bincode::deserialize(&decompressed)?;

    let count = block.timestamp_deltas.len();
    if block.measurements.len() != count
        || block.point_tags.len() != count
        || block.point_fields.len() != count
    {
        return Err(StorageError::Corruption(format!(
            "block column lengths disagree: {} timestamps, {} measurements, {} tag sets, {} field sets",
            count,
            block.measurements.len(),
            block.point_tags.len(),
            block.point_fields.len()
        )));
    }

    let strings = &block.strings;
    let mut points = Vec::with_capacity(count);
    let mut current = block.base_timestamp;

    for i in 0..count {
        current = current.wrapping_add(block.timestamp_deltas[i]);

        let mut point = Point::new(strings.get(block.measurements[i])?, current);
        for &(k, v) in &block.point_tags[i] {
            point
                .tags
                .insert(strings.get(k)?.to_string(), strings.get(v)?.to_string());
        }
        for &(name, value) in &block.point_fields[i] {
            point.fields.insert(strings.get(name)?.to_string(), value);
        }
        points.push(point);
    }

    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(host: usize, time: i64, usage: f64) -> Point {
        Point::new("cpu", time)
            .tag("hostname", format!("host_{}", host))
            .tag("region", "eu-west-1")
            .field("usage_user", usage)
            .field("usage_system", usage / 2.0)
    }

    #[test]
    fn test_compress_decompress_empty() {
        let compressed = compress_block(&[]).unwrap();
        assert!(decompress_block(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_order_is_preserved() {
        // Out-of-order timestamps must come back in offset order
        let points = vec![cpu(0, 3000, 3.0), cpu(1, 1000, 1.0), cpu(2, 2000, 2.0)];

        let decompressed = decompress_block(&compress_block(&points).unwrap()).unwrap();
        assert_eq!(decompressed, points);
    }

    #[test]
    fn test_sparse_fields_and_measurements() {
        let points = vec![
            cpu(0, 1000, 10.0),
            Point::new("mem", 1000).field("used", 42.0),
            Point::new("cpu", 1001).tag("hostname", "host_9"),
            Point::new("cpu", -5000).field("usage_user", -1.5),
        ];

        let decompressed = decompress_block(&compress_block(&points).unwrap()).unwrap();
        assert_eq!(decompressed, points);
    }

    #[test]
    fn test_compression_ratio() {
        let points: Vec<Point> = (0..1000)
            .map(|i| cpu(i % 10, 1_700_000_000_000 + i as i64 * 10_000, (i % 100) as f64))
            .collect();

        let compressed = compress_block(&points).unwrap();
        let raw = bincode::serialize(&points).unwrap();
        let ratio = raw.len() as f64 / compressed.len() as f64;

        assert!(ratio > 2.0, "Compression ratio too low: {}", ratio);
    }

    #[test]
    fn test_garbage_input_is_an_error() {
        let err = decompress_block(&[1, 2, 3, 4, 5]).unwrap_err();
        assert!(matches!(
            err,
            StorageError::Compression(_) | StorageError::Serialization(_)
        ));
    }
}
