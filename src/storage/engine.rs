//! Storage engine
//!
//! Pairs a `PointStore` with its `TagTimeIndex` and keeps them in step:
//! - Write path: Point → validate → WAL → store → index
//! - Read path: QueryExecutor → index/store snapshot → aggregator
//!
//! Ingest is single-writer; queries run concurrently through the shared
//! handles returned by `store()`/`index()`/`executor()`.

use crate::index::{IndexConfig, IndexStats, TagTimeIndex};
use crate::query::{QueryConfig, QueryExecutor};
use crate::storage::error::StorageResult;
use crate::storage::store::{PointStore, StoreConfig, StoreStats};
use crate::storage::types::{Point, PointOffset};
use std::ops::Range;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Points read per chunk while rebuilding the index
const REBUILD_CHUNK: u64 = 8192;

/// Configuration for the storage engine
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub store: StoreConfig,
    pub index: IndexConfig,
}

impl StorageConfig {
    /// Persistent engine rooted at `data_dir`
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            store: StoreConfig::new(data_dir.as_ref()),
            index: IndexConfig::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::default()
    }
}

/// Store plus index behind one ingest path
#[derive(Debug)]
pub struct StorageEngine {
    store: Arc<PointStore>,
    index: Arc<TagTimeIndex>,
    /// Serializes append + index so the index never sees offsets out of order
    ingest: Mutex<()>,
}

impl StorageEngine {
    /// Open an engine, recovering the store and rebuilding the index from it
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let store = PointStore::open(config.store)?;
        let index = TagTimeIndex::new(config.index);

        let rebuilt = Self::index_tail(&store, &index)?;
        if rebuilt > 0 {
            tracing::info!("Rebuilt index over {} points", rebuilt);
        }

        Ok(Self {
            store: Arc::new(store),
            index: Arc::new(index),
            ingest: Mutex::new(()),
        })
    }

    /// Unbounded engine with no persistence
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(PointStore::in_memory()),
            index: Arc::new(TagTimeIndex::default()),
            ingest: Mutex::new(()),
        }
    }

    /// Index every stored point past the index's covered watermark
    fn index_tail(store: &PointStore, index: &TagTimeIndex) -> StorageResult<u64> {
        let len = store.len() as u64;
        let start = index.covered();
        let mut next = start;
        while next < len {
            let end = (next + REBUILD_CHUNK).min(len);
            for (offset, point) in store.read_range(next..end)? {
                index.index_point(offset, &point)?;
            }
            next = end;
        }
        Ok(len.saturating_sub(start))
    }

    /// Bring the index level with the store before the next append
    ///
    /// A failed index update leaves the store ahead; the next ingest
    /// indexes that tail first instead of failing on every offset after it.
    fn catch_up(&self) -> StorageResult<()> {
        let indexed = Self::index_tail(&self.store, &self.index)?;
        if indexed > 0 {
            tracing::warn!("Indexed {} points the index had fallen behind on", indexed);
        }
        Ok(())
    }

    /// Append one point and index it
    pub fn ingest(&self, point: Point) -> StorageResult<PointOffset> {
        let _guard = self.ingest.lock()?;
        self.catch_up()?;
        let (offset, stored) = self.store.append_shared(point)?;
        self.index.index_point(offset, &stored).map_err(|e| {
            tracing::error!("Failed to index point at offset {}: {}", offset, e);
            e
        })?;
        Ok(offset)
    }

    /// Append a batch and index it; validation and capacity are all-or-nothing
    pub fn ingest_batch(&self, points: Vec<Point>) -> StorageResult<Range<PointOffset>> {
        let _guard = self.ingest.lock()?;
        self.catch_up()?;
        let appended = self.store.append_batch(points)?;

        let start = match appended.first() {
            Some((offset, _)) => *offset,
            None => return Ok(self.index.covered()..self.index.covered()),
        };
        for (offset, point) in &appended {
            self.index.index_point(*offset, point).map_err(|e| {
                tracing::error!("Failed to index point at offset {}: {}", offset, e);
                e
            })?;
        }

        tracing::debug!("Ingested {} points", appended.len());
        Ok(start..start + appended.len() as u64)
    }

    /// Make every acknowledged ingest durable
    pub fn flush(&self) -> StorageResult<()> {
        self.store.flush()
    }

    /// Seal pending points into a segment
    pub fn checkpoint(&self) -> StorageResult<bool> {
        let _guard = self.ingest.lock()?;
        Ok(self.store.checkpoint()?.is_some())
    }

    pub fn store(&self) -> &Arc<PointStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<TagTimeIndex> {
        &self.index
    }

    /// Query executor over this engine's store and index
    pub fn executor(&self, config: QueryConfig) -> QueryExecutor {
        QueryExecutor::with_config(Arc::clone(&self.store), Arc::clone(&self.index), config)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.store.data_dir()
    }

    pub fn stats(&self) -> StorageResult<EngineStats> {
        Ok(EngineStats {
            store: self.store.stats()?,
            index: self.index.stats()?,
        })
    }
}

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub store: StoreStats,
    pub index: IndexStats,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Store: {}", self.store)?;
        write!(f, "Index: {}", self.index)
    }
}
