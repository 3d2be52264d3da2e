//! Write-Ahead Log (WAL) for the point store
//!
//! Every append is written here before it becomes visible in memory.
//! `flush()` on the store syncs this file and is the durability boundary;
//! a checkpoint seals the logged points into a segment and truncates it.
//!
//! Format per entry:
//! - length: u32 (4 bytes)
//! - data: [u8; length] (bincode `WalRecord`)
//! - crc: u32 (4 bytes, CRC32 of length + data)

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Point, PointOffset};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Largest accepted record body
const MAX_RECORD_LEN: usize = 1_000_000;

/// Sync strategy for WAL writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalSyncMode {
    /// Fsync after every write (safest, slowest)
    EveryWrite,
    /// Fsync in batches and at every flush
    #[default]
    Batched,
    /// No fsync until flush, rely on OS
    None,
}

/// One logged append
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub offset: PointOffset,
    pub point: Point,
}

/// Write-Ahead Log for durability
pub struct WriteAheadLog {
    writer: BufWriter<File>,
    path: PathBuf,
    entry_count: u64,
    /// Byte length of every acknowledged record, written or still buffered
    committed_len: u64,
    /// Set when a failed append could not be rolled back
    poisoned: bool,
    bytes_since_sync: usize,
    sync_mode: WalSyncMode,
    /// Batch sync threshold (bytes)
    sync_threshold: usize,
}

impl WriteAheadLog {
    /// Open or create a WAL file
    ///
    /// A torn or corrupt tail left by a crash is cut off so new records
    /// land directly after the last valid one.
    pub fn open(path: impl AsRef<Path>, sync_mode: WalSyncMode) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (entry_count, valid_len) = Self::scan_valid_prefix(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            tracing::warn!(
                "Truncating {} bytes of torn WAL tail in {:?}",
                file_len - valid_len,
                path
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            writer: BufWriter::new(file),
            path,
            entry_count,
            committed_len: valid_len,
            poisoned: false,
            bytes_since_sync: 0,
            sync_mode,
            sync_threshold: 64 * 1024,
        })
    }

    /// Count valid entries and the byte length they span
    fn scan_valid_prefix(path: &Path) -> StorageResult<(u64, u64)> {
        if !path.exists() {
            return Ok((0, 0));
        }

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut count = 0u64;
        let mut valid_len = 0u64;

        loop {
            match Self::read_entry_from(&mut reader) {
                Ok(Some((_, len))) => {
                    count += 1;
                    valid_len += len as u64;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("WAL corruption at entry {}: {}", count, e);
                    break;
                }
            }
        }

        Ok((count, valid_len))
    }

    fn encode(record: &WalRecord) -> StorageResult<Vec<u8>> {
        let data = bincode::serialize(record)?;
        if data.len() > MAX_RECORD_LEN {
            return Err(StorageError::WalError(format!(
                "record for offset {} is {} bytes, limit is {}",
                record.offset,
                data.len(),
                MAX_RECORD_LEN
            )));
        }

        let len = (data.len() as u32).to_le_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len);
        hasher.update(&data);
        let crc = hasher.finalize();

        let mut frame = Vec::with_capacity(8 + data.len());
        frame.extend_from_slice(&len);
        frame.extend_from_slice(&data);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    /// Append one record
    ///
    /// On error the log is cut back to its last acknowledged record, so a
    /// rejected append never reappears on recovery.
    pub fn append(&mut self, record: &WalRecord) -> StorageResult<()> {
        let frame = Self::encode(record)?;
        self.write_frames(std::slice::from_ref(&frame))
    }

    /// Append several records with a single sync decision
    pub fn append_batch(&mut self, records: &[WalRecord]) -> StorageResult<()> {
        // Encode everything first so an oversized record writes nothing.
        let frames = records
            .iter()
            .map(Self::encode)
            .collect::<StorageResult<Vec<_>>>()?;
        self.write_frames(&frames)
    }

    fn write_frames(&mut self, frames: &[Vec<u8>]) -> StorageResult<()> {
        if self.poisoned {
            return Err(StorageError::WalError(format!(
                "{:?} is unusable after a failed rollback",
                self.path
            )));
        }

        let bytes: usize = frames.iter().map(Vec::len).sum();
        let written = frames
            .iter()
            .try_for_each(|frame| self.writer.write_all(frame))
            .map_err(StorageError::from)
            .and_then(|_| {
                self.bytes_since_sync += bytes;
                self.maybe_sync()
            });

        match written {
            Ok(()) => {
                self.entry_count += frames.len() as u64;
                self.committed_len += bytes as u64;
                Ok(())
            }
            Err(e) => {
                let committed = self.committed_len;
                if let Err(rollback) = self.rollback_to(committed) {
                    tracing::error!(
                        "WAL rollback to {} bytes failed, refusing further appends: {}",
                        committed,
                        rollback
                    );
                    self.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// Drop everything past `len` logical bytes, on disk and in the buffer
    fn rollback_to(&mut self, len: u64) -> StorageResult<()> {
        let fresh = BufWriter::new(self.writer.get_ref().try_clone()?);
        let (_, buffered) = std::mem::replace(&mut self.writer, fresh).into_parts();
        let buffered = buffered.unwrap_or_default();

        let file = self.writer.get_ref();
        let on_disk = file.metadata()?.len();
        if on_disk >= len {
            file.set_len(len)?;
        } else {
            // Earlier acknowledged records were still buffered; keep them.
            let keep = ((len - on_disk) as usize).min(buffered.len());
            self.writer.write_all(&buffered[..keep])?;
        }

        self.bytes_since_sync = 0;
        Ok(())
    }

    fn maybe_sync(&mut self) -> StorageResult<()> {
        match self.sync_mode {
            WalSyncMode::EveryWrite => self.sync()?,
            WalSyncMode::Batched => {
                if self.bytes_since_sync >= self.sync_threshold {
                    self.sync()?;
                }
            }
            WalSyncMode::None => self.writer.flush()?,
        }
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&mut self) -> StorageResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.bytes_since_sync = 0;
        Ok(())
    }

    /// Read all valid records in append order
    pub fn recover(&mut self) -> StorageResult<Vec<WalRecord>> {
        self.writer.flush()?;

        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            match Self::read_entry_from(&mut reader) {
                Ok(Some((record, _))) => records.push(record),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("WAL recovery stopped at entry {}: {}", records.len(), e);
                    break;
                }
            }
        }

        Ok(records)
    }

    /// Read a single entry, returning the record and its framed length
    fn read_entry_from<R: Read>(reader: &mut R) -> StorageResult<Option<(WalRecord, usize)>> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        if len > MAX_RECORD_LEN {
            return Err(StorageError::WalError(format!(
                "Entry length too large: {}",
                len
            )));
        }

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;

        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let stored_crc = u32::from_le_bytes(crc_buf);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&len_buf);
        hasher.update(&data);
        let computed_crc = hasher.finalize();

        if stored_crc != computed_crc {
            return Err(StorageError::Corruption(format!(
                "CRC mismatch: stored={}, computed={}",
                stored_crc, computed_crc
            )));
        }

        let record: WalRecord = bincode::deserialize(&data)?;
        Ok(Some((record, len + 8)))
    }

    /// Truncate the WAL (after a successful checkpoint)
    pub fn truncate(&mut self) -> StorageResult<()> {
        self.sync()?;

        let file = self.writer.get_ref();
        file.set_len(0)?;
        file.sync_all()?;

        self.entry_count = 0;
        self.committed_len = 0;
        self.bytes_since_sync = 0;

        Ok(())
    }

    /// Get the number of entries in the WAL
    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    /// Get the file size
    pub fn file_size(&self) -> StorageResult<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// WAL entry iterator for streaming inspection
pub struct WalIterator {
    reader: BufReader<File>,
}

impl WalIterator {
    pub fn new(path: impl AsRef<Path>) -> StorageResult<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self {
            reader: BufReader::new(file),
        })
    }
}

impl Iterator for WalIterator {
    type Item = StorageResult<WalRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match WriteAheadLog::read_entry_from(&mut self.reader) {
            Ok(Some((record, _))) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
