//! Sealed segment files
//!
//! A checkpoint writes every point appended since the previous checkpoint
//! into one immutable segment covering a contiguous offset range.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "TSAG"               │
//! │   version: u16                          │
//! │   base_offset: u64                      │
//! │   point_count: u32                      │
//! │   min_timestamp: i64                    │
//! │   max_timestamp: i64                    │
//! │   compression: u8                       │
//! │   reserved                              │
//! │   checksum: u32 (bytes 60..64)          │
//! ├─────────────────────────────────────────┤
//! │ BLOCK                                   │
//! │   block_size: u32                       │
//! │   data: [u8; block_size]                │
//! │   block_checksum: u32                   │
//! └─────────────────────────────────────────┘
//! ```

use crate::storage::compression::{compress_block, decompress_block};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{Point, PointOffset, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

const SEGMENT_MAGIC: [u8; 4] = *b"TSAG";

const SEGMENT_VERSION: u16 = 1;

const HEADER_SIZE: usize = 64;

/// Block encoding used inside a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CompressionType {
    /// Plain bincode of the point list
    None = 0,
    #[default]
    Lz4 = 1,
}

impl TryFrom<u8> for CompressionType {
    type Error = StorageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            _ => Err(StorageError::InvalidSegment(format!(
                "Unknown compression type: {}",
                value
            ))),
        }
    }
}

/// Segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub version: u16,
    /// Offset of the first point in this segment
    pub base_offset: PointOffset,
    pub point_count: u32,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
    pub compression: CompressionType,
}

impl SegmentHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..14].copy_from_slice(&self.base_offset.to_le_bytes());
        buf[14..18].copy_from_slice(&self.point_count.to_le_bytes());
        buf[18..26].copy_from_slice(&self.min_timestamp.to_le_bytes());
        buf[26..34].copy_from_slice(&self.max_timestamp.to_le_bytes());
        buf[34] = self.compression as u8;

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> StorageResult<Self> {
        let stored_checksum = u32::from_le_bytes(le_array(&buf[60..64]));
        let computed_checksum = crc32fast::hash(&buf[0..60]);

        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "Header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        if buf[0..4] != SEGMENT_MAGIC {
            return Err(StorageError::InvalidSegment(format!(
                "Invalid magic: {:?}",
                &buf[0..4]
            )));
        }

        let version = u16::from_le_bytes(le_array(&buf[4..6]));
        if version > SEGMENT_VERSION {
            return Err(StorageError::InvalidSegment(format!(
                "Unsupported version: {}",
                version
            )));
        }

        Ok(Self {
            version,
            base_offset: u64::from_le_bytes(le_array(&buf[6..14])),
            point_count: u32::from_le_bytes(le_array(&buf[14..18])),
            min_timestamp: i64::from_le_bytes(le_array(&buf[18..26])),
            max_timestamp: i64::from_le_bytes(le_array(&buf[26..34])),
            compression: CompressionType::try_from(buf[34])?,
        })
    }

    /// Offsets covered by this segment
    pub fn offsets(&self) -> Range<PointOffset> {
        self.base_offset..self.base_offset + self.point_count as u64
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// A sealed segment on disk
#[derive(Debug)]
pub struct Segment {
    pub path: PathBuf,
    pub header: SegmentHeader,
}

impl Segment {
    /// File name for the segment with a given id
    pub fn file_name(id: u32) -> String {
        format!("segment_{:06}.dat", id)
    }

    /// Write `points` (offsets `base_offset..`) as a new segment
    ///
    /// The file is written under a temporary name and renamed into place,
    /// so a crash never leaves a half-written segment under its real name.
    pub fn write(
        path: impl AsRef<Path>,
        base_offset: PointOffset,
        points: &[Point],
        compression: CompressionType,
    ) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if points.is_empty() {
            return Err(StorageError::InvalidSegment(
                "refusing to write an empty segment".into(),
            ));
        }
        let point_count = u32::try_from(points.len()).map_err(|_| {
            StorageError::InvalidSegment(format!("too many points for one segment: {}", points.len()))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (min_timestamp, max_timestamp) = points
            .iter()
            .fold((i64::MAX, i64::MIN), |(min, max), p| {
                (min.min(p.time), max.max(p.time))
            });

        let header = SegmentHeader {
            version: SEGMENT_VERSION,
            base_offset,
            point_count,
            min_timestamp,
            max_timestamp,
            compression,
        };

        let data = match compression {
            CompressionType::Lz4 => compress_block(points)?,
            CompressionType::None => bincode::serialize(points)?,
        };
        let checksum = crc32fast::hash(&data);

        let tmp_path = path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&header.to_bytes())?;
            writer.write_all(&(data.len() as u32).to_le_bytes())?;
            writer.write_all(&data)?;
            writer.write_all(&checksum.to_le_bytes())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &path)?;

        Ok(Self { path, header })
    }

    /// Open an existing segment and validate its header
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufReader::new(File::open(&path)?);

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = SegmentHeader::from_bytes(&header_buf)?;

        Ok(Self { path, header })
    }

    /// Read and decode every point, in offset order
    pub fn read_points(&self) -> StorageResult<Vec<Point>> {
        let mut reader = BufReader::new(File::open(&self.path)?);

        let mut header_buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_buf)?;

        let mut size_buf = [0u8; 4];
        reader.read_exact(&mut size_buf)?;
        let size = u32::from_le_bytes(size_buf);

        let mut data = vec![0u8; size as usize];
        reader.read_exact(&mut data)?;

        let mut checksum_buf = [0u8; 4];
        reader.read_exact(&mut checksum_buf)?;
        let stored_checksum = u32::from_le_bytes(checksum_buf);
        let computed_checksum = crc32fast::hash(&data);

        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "Segment {:?} block checksum mismatch",
                self.path
            )));
        }

        let points: Vec<Point> = match self.header.compression {
            CompressionType::Lz4 => decompress_block(&data)?,
            CompressionType::None => bincode::deserialize(&data)?,
        };

        if points.len() != self.header.point_count as usize {
            return Err(StorageError::Corruption(format!(
                "Segment {:?} holds {} points, header says {}",
                self.path,
                points.len(),
                self.header.point_count
            )));
        }

        Ok(points)
    }

    /// Get segment ID from filename
    pub fn id(&self) -> Option<u32> {
        self.path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.strip_prefix("segment_"))
            .and_then(|s| s.parse().ok())
    }

    pub fn size_bytes(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}
