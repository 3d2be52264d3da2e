//! Append-only point store
//!
//! Points live in memory as `Arc<Point>` in offset order. With a data
//! directory the store is backed by a write-ahead log and sealed segments:
//!
//! ```text
//! append:      validate → capacity → WAL → visible in memory
//! flush:       WAL fsync (durability boundary)
//! checkpoint:  unsealed points → segment_NNNNNN.dat → WAL truncate
//! open:        segments (contiguous from 0) → WAL replay
//! ```

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::segment::{CompressionType, Segment};
use crate::storage::types::{Point, PointOffset};
use crate::storage::wal::{WalRecord, WalSyncMode, WriteAheadLog};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

/// Configuration for a point store
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Root directory for WAL and segments; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Maximum number of points the store accepts
    pub max_points: Option<usize>,
    pub wal_sync: WalSyncMode,
    pub compression: CompressionType,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            ..Default::default()
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn max_points(mut self, max_points: usize) -> Self {
        self.max_points = Some(max_points);
        self
    }

    pub fn segments_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("segments"))
    }

    pub fn wal_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join("wal").join("current.wal"))
    }
}

/// Writer-side state, serialized by one mutex
struct WriterState {
    wal: Option<WriteAheadLog>,
    /// Points below this offset are sealed in segments
    sealed_upto: PointOffset,
    next_segment_id: u32,
    segments: Vec<Segment>,
}

/// Append-only store of points addressed by offset
pub struct PointStore {
    config: StoreConfig,
    points: RwLock<Vec<Arc<Point>>>,
    writer: Mutex<WriterState>,
}

/// Point store statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub points: u64,
    pub sealed_points: u64,
    pub segment_count: usize,
    pub wal_entries: u64,
    pub segment_bytes: u64,
}

impl std::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Points: {}, Sealed: {}, Segments: {}, WAL: {}, Size: {:.2} MB",
            self.points,
            self.sealed_points,
            self.segment_count,
            self.wal_entries,
            self.segment_bytes as f64 / (1024.0 * 1024.0)
        )
    }
}

impl std::fmt::Debug for PointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointStore")
            .field("data_dir", &self.config.data_dir)
            .field("max_points", &self.config.max_points)
            .field("len", &self.len())
            .finish()
    }
}

impl PointStore {
    /// Unbounded store with no persistence
    pub fn in_memory() -> Self {
        Self::empty(StoreConfig::in_memory())
    }

    /// In-memory store that refuses appends past `max_points`
    pub fn with_capacity(max_points: usize) -> Self {
        Self::empty(StoreConfig::in_memory().max_points(max_points))
    }

    fn empty(config: StoreConfig) -> Self {
        Self {
            config,
            points: RwLock::new(Vec::new()),
            writer: Mutex::new(WriterState {
                wal: None,
                sealed_upto: 0,
                next_segment_id: 1,
                segments: Vec::new(),
            }),
        }
    }

    /// Open a store, recovering sealed segments and the WAL tail
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        let (Some(segments_dir), Some(wal_path)) = (config.segments_dir(), config.wal_path())
        else {
            return Ok(Self::empty(config));
        };

        std::fs::create_dir_all(&segments_dir)?;

        let segments = Self::load_segments(&segments_dir)?;
        let mut points: Vec<Arc<Point>> = Vec::new();
        for segment in &segments {
            if segment.header.base_offset != points.len() as u64 {
                return Err(StorageError::Corruption(format!(
                    "segment {:?} starts at offset {}, expected {}",
                    segment.path,
                    segment.header.base_offset,
                    points.len()
                )));
            }
            points.extend(segment.read_points()?.into_iter().map(Arc::new));
        }
        let sealed_upto = points.len() as u64;
        let next_segment_id = segments.iter().filter_map(Segment::id).max().unwrap_or(0) + 1;

        let mut wal = WriteAheadLog::open(&wal_path, config.wal_sync)?;
        let mut replayed = 0usize;
        for record in wal.recover()? {
            if record.offset < sealed_upto {
                // Sealed by a checkpoint that crashed before truncating the WAL
                continue;
            }
            let expected = points.len() as u64;
            if record.offset != expected {
                return Err(StorageError::Corruption(format!(
                    "WAL record for offset {} where offset {} was expected",
                    record.offset, expected
                )));
            }
            points.push(Arc::new(record.point));
            replayed += 1;
        }

        if !segments.is_empty() || replayed > 0 {
            tracing::info!(
                "Recovered {} points ({} sealed in {} segments, {} from WAL)",
                points.len(),
                sealed_upto,
                segments.len(),
                replayed
            );
        }

        Ok(Self {
            config,
            points: RwLock::new(points),
            writer: Mutex::new(WriterState {
                wal: Some(wal),
                sealed_upto,
                next_segment_id,
                segments,
            }),
        })
    }

    fn load_segments(dir: &Path) -> StorageResult<Vec<Segment>> {
        let mut segments = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "dat").unwrap_or(false) {
                segments.push(Segment::open(&path)?);
            } else if path.extension().map(|e| e == "tmp").unwrap_or(false) {
                tracing::warn!("Removing unfinished segment {:?}", path);
                std::fs::remove_file(&path)?;
            }
        }

        segments.sort_by_key(|s| s.header.base_offset);
        Ok(segments)
    }

    /// Append one point, returning its offset
    pub fn append(&self, point: Point) -> StorageResult<PointOffset> {
        self.append_shared(point).map(|(offset, _)| offset)
    }

    /// Append one point, returning its offset and the stored handle
    pub fn append_shared(&self, point: Point) -> StorageResult<(PointOffset, Arc<Point>)> {
        point.validate()?;

        let mut writer = self.writer.lock()?;
        let offset = self.points.read()?.len() as u64;
        self.check_capacity(offset as usize, 1)?;

        if let Some(wal) = writer.wal.as_mut() {
            wal.append(&WalRecord { offset, point: point.clone() })?;
        }

        let point = Arc::new(point);
        self.points.write()?.push(Arc::clone(&point));
        Ok((offset, point))
    }

    /// Append a batch atomically with respect to validation and capacity
    pub fn append_batch(&self, points: Vec<Point>) -> StorageResult<Vec<(PointOffset, Arc<Point>)>> {
        for point in &points {
            point.validate()?;
        }

        let mut writer = self.writer.lock()?;
        let base = self.points.read()?.len() as u64;
        self.check_capacity(base as usize, points.len())?;

        let records: Vec<WalRecord> = points
            .into_iter()
            .enumerate()
            .map(|(i, point)| WalRecord { offset: base + i as u64, point })
            .collect();

        if let Some(wal) = writer.wal.as_mut() {
            wal.append_batch(&records)?;
        }

        let appended: Vec<(PointOffset, Arc<Point>)> = records
            .into_iter()
            .map(|r| (r.offset, Arc::new(r.point)))
            .collect();
        self.points
            .write()?
            .extend(appended.iter().map(|(_, p)| Arc::clone(p)));
        Ok(appended)
    }

    fn check_capacity(&self, current: usize, incoming: usize) -> StorageResult<()> {
        match self.config.max_points {
            Some(capacity) if current + incoming > capacity => {
                Err(StorageError::Capacity { capacity })
            }
            _ => Ok(()),
        }
    }

    /// Resolve an offset to its point
    pub fn resolve(&self, offset: PointOffset) -> StorageResult<Arc<Point>> {
        let points = self.points.read()?;
        points
            .get(offset as usize)
            .cloned()
            .ok_or(StorageError::NotFound { offset, len: points.len() as u64 })
    }

    /// Resolve a batch of offsets under one lock acquisition
    pub fn resolve_many(&self, offsets: &[PointOffset]) -> StorageResult<Vec<Arc<Point>>> {
        let points = self.points.read()?;
        offsets
            .iter()
            .map(|&offset| {
                points
                    .get(offset as usize)
                    .cloned()
                    .ok_or(StorageError::NotFound { offset, len: points.len() as u64 })
            })
            .collect()
    }

    /// Points in an offset range, clipped to what is stored
    pub fn read_range(&self, range: Range<PointOffset>) -> StorageResult<Vec<(PointOffset, Arc<Point>)>> {
        let points = self.points.read()?;
        let end = (range.end as usize).min(points.len());
        let start = (range.start as usize).min(end);
        Ok(points[start..end]
            .iter()
            .enumerate()
            .map(|(i, p)| ((start + i) as u64, Arc::clone(p)))
            .collect())
    }

    /// Number of visible points
    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> Option<usize> {
        self.config.max_points
    }

    /// Make every acknowledged append durable
    pub fn flush(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock()?;
        if let Some(wal) = writer.wal.as_mut() {
            wal.sync()?;
        }
        Ok(())
    }

    /// Seal unsealed points into a new segment and truncate the WAL
    ///
    /// Returns the new segment's path, or `None` when nothing was pending
    /// or the store is in-memory.
    pub fn checkpoint(&self) -> StorageResult<Option<PathBuf>> {
        let Some(segments_dir) = self.config.segments_dir() else {
            return Ok(None);
        };

        let mut writer = self.writer.lock()?;
        let base = writer.sealed_upto;
        let pending: Vec<Point> = {
            let points = self.points.read()?;
            points[base as usize..].iter().map(|p| (**p).clone()).collect()
        };
        if pending.is_empty() {
            return Ok(None);
        }

        let path = segments_dir.join(Segment::file_name(writer.next_segment_id));
        let segment = Segment::write(&path, base, &pending, self.config.compression)?;

        if let Some(wal) = writer.wal.as_mut() {
            wal.truncate()?;
        }

        tracing::info!(
            "Checkpoint sealed offsets {:?} into {:?}",
            segment.header.offsets(),
            path
        );

        writer.sealed_upto = base + pending.len() as u64;
        writer.next_segment_id += 1;
        writer.segments.push(segment);
        Ok(Some(path))
    }

    pub fn stats(&self) -> StorageResult<StoreStats> {
        let writer = self.writer.lock()?;
        Ok(StoreStats {
            points: self.len() as u64,
            sealed_points: writer.sealed_upto,
            segment_count: writer.segments.len(),
            wal_entries: writer.wal.as_ref().map(|w| w.entry_count()).unwrap_or(0),
            segment_bytes: writer.segments.iter().map(Segment::size_bytes).sum(),
        })
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.config.data_dir.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cpu(host: &str, time: i64, usage: f64) -> Point {
        Point::new("cpu", time)
            .tag("hostname", host)
            .field("usage_user", usage)
    }

    #[test]
    fn test_append_and_resolve() {
        let store = PointStore::in_memory();
        assert!(store.is_empty());

        let a = store.append(cpu("host_0", 1000, 1.0)).unwrap();
        let b = store.append(cpu("host_1", 2000, 2.0)).unwrap();
        assert_eq!((a, b), (0, 1));
        assert_eq!(store.len(), 2);

        let point = store.resolve(1).unwrap();
        assert!(point.has_tag("hostname", "host_1"));
        assert_eq!(point.field_value("usage_user"), Some(2.0));
    }

    #[test]
    fn test_resolve_out_of_range_is_not_found() {
        let store = PointStore::in_memory();
        store.append(cpu("host_0", 0, 1.0)).unwrap();

        assert!(matches!(
            store.resolve(5),
            Err(StorageError::NotFound { offset: 5, len: 1 })
        ));
        assert!(matches!(
            store.resolve_many(&[0, 7]),
            Err(StorageError::NotFound { offset: 7, .. })
        ));
    }

    #[test]
    fn test_capacity_leaves_store_unchanged() {
        let store = PointStore::with_capacity(2);
        store.append(cpu("host_0", 0, 1.0)).unwrap();
        store.append(cpu("host_0", 1, 1.0)).unwrap();

        let err = store.append(cpu("host_0", 2, 1.0)).unwrap_err();
        assert!(matches!(err, StorageError::Capacity { capacity: 2 }));
        assert_eq!(store.len(), 2);
        assert!(store.resolve(2).is_err());
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let store = PointStore::with_capacity(3);
        store.append(cpu("host_0", 0, 1.0)).unwrap();

        let too_many = vec![cpu("a", 1, 1.0), cpu("b", 2, 1.0), cpu("c", 3, 1.0)];
        assert!(matches!(
            store.append_batch(too_many),
            Err(StorageError::Capacity { .. })
        ));
        assert_eq!(store.len(), 1);

        let invalid = vec![cpu("a", 1, 1.0), Point::new("", 2)];
        assert!(matches!(
            store.append_batch(invalid),
            Err(StorageError::Validation(_))
        ));
        assert_eq!(store.len(), 1);

        let appended = store
            .append_batch(vec![cpu("a", 1, 1.0), cpu("b", 2, 1.0)])
            .unwrap();
        let offsets: Vec<u64> = appended.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![1, 2]);
    }

    #[test]
    fn test_read_range_clips() {
        let store = PointStore::in_memory();
        for i in 0..5 {
            store.append(cpu("host_0", i, i as f64)).unwrap();
        }

        let slice = store.read_range(3..10).unwrap();
        let offsets: Vec<u64> = slice.iter().map(|(o, _)| *o).collect();
        assert_eq!(offsets, vec![3, 4]);
        assert!(store.read_range(8..10).unwrap().is_empty());
    }

    #[test]
    fn test_wal_recovery_after_flush() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path());

        {
            let store = PointStore::open(config.clone()).unwrap();
            for i in 0..50 {
                store.append(cpu("host_0", i * 1000, i as f64)).unwrap();
            }
            store.flush().unwrap();
        }

        let store = PointStore::open(config).unwrap();
        assert_eq!(store.len(), 50);
        assert_eq!(store.resolve(49).unwrap().time, 49_000);
        assert_eq!(store.stats().unwrap().wal_entries, 50);
    }

    #[test]
    fn test_checkpoint_then_more_appends() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path());

        {
            let store = PointStore::open(config.clone()).unwrap();
            for i in 0..30 {
                store.append(cpu("host_0", i, i as f64)).unwrap();
            }
            let path = store.checkpoint().unwrap().unwrap();
            assert!(path.ends_with("segment_000001.dat"));
            assert_eq!(store.checkpoint().unwrap(), None);

            for i in 30..40 {
                store.append(cpu("host_1", i, i as f64)).unwrap();
            }
            store.flush().unwrap();

            let stats = store.stats().unwrap();
            assert_eq!(stats.sealed_points, 30);
            assert_eq!(stats.segment_count, 1);
            assert_eq!(stats.wal_entries, 10);
        }

        let store = PointStore::open(config).unwrap();
        assert_eq!(store.len(), 40);
        assert!(store.resolve(10).unwrap().has_tag("hostname", "host_0"));
        assert!(store.resolve(35).unwrap().has_tag("hostname", "host_1"));

        // The next checkpoint continues the segment numbering
        store.append(cpu("host_2", 41, 0.0)).unwrap();
        let path = store.checkpoint().unwrap().unwrap();
        assert!(path.ends_with("segment_000002.dat"));
    }

    #[test]
    fn test_stale_wal_records_are_skipped() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path());

        {
            let store = PointStore::open(config.clone()).unwrap();
            for i in 0..5 {
                store.append(cpu("host_0", i, i as f64)).unwrap();
            }
            store.flush().unwrap();
        }

        // Seal the same offsets without truncating the WAL, as a crash
        // between segment write and WAL truncate would.
        let sealed: Vec<Point> = (0..5).map(|i| cpu("host_0", i, i as f64)).collect();
        Segment::write(
            config.segments_dir().unwrap().join(Segment::file_name(1)),
            0,
            &sealed,
            CompressionType::Lz4,
        )
        .unwrap();

        let store = PointStore::open(config).unwrap();
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn test_duplicate_wal_offset_is_corruption() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path());

        {
            let mut wal =
                WriteAheadLog::open(config.wal_path().unwrap(), WalSyncMode::EveryWrite).unwrap();
            wal.append(&WalRecord { offset: 0, point: cpu("host_0", 0, 1.0) })
                .unwrap();
            wal.append(&WalRecord { offset: 0, point: cpu("host_1", 0, 2.0) })
                .unwrap();
        }

        assert!(matches!(
            PointStore::open(config),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_segment_gap_is_corruption() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::new(dir.path());
        std::fs::create_dir_all(config.segments_dir().unwrap()).unwrap();

        Segment::write(
            config.segments_dir().unwrap().join(Segment::file_name(1)),
            10,
            &[cpu("host_0", 0, 0.0)],
            CompressionType::Lz4,
        )
        .unwrap();

        assert!(matches!(
            PointStore::open(config),
            Err(StorageError::Corruption(_))
        ));
    }

    #[test]
    fn test_in_memory_checkpoint_is_noop() {
        let store = PointStore::in_memory();
        store.append(cpu("host_0", 0, 0.0)).unwrap();
        assert_eq!(store.checkpoint().unwrap(), None);
        store.flush().unwrap();
        assert_eq!(store.stats().unwrap().points, 1);
    }
}
