//! Segment Files - Entry Format, Writer, Reader
//!
//! ## File Layout
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │ Header (16 bytes)                    │
//! │ - magic: "CDCL" (4 bytes)            │
//! │ - version: u8                        │
//! │ - flags: u8                          │
//! │ - reserved: 2 bytes                  │
//! │ - sequence: u64 LE                   │
//! ├──────────────────────────────────────┤
//! │ Entry 0 (one append batch)           │
//! │ - data_length: u32 LE                │
//! │ - first_global_position: u64 LE      │
//! │ - checksum: u32 LE (CRC32)           │
//! │ - data: bincode(Vec<RecordedEvent>)  │
//! ├──────────────────────────────────────┤
//! │ Entry 1 ...                          │
//! └──────────────────────────────────────┘
//! ```
//!
//! One entry holds a whole append batch, so a batch is either fully
//! recovered or not at all. The reader stops at the first corrupted or
//! truncated entry and returns everything written before it.

use super::RecordedEvent;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Segment file magic number
pub const SEGMENT_MAGIC: [u8; 4] = *b"CDCL";
/// Current segment format version
pub const SEGMENT_VERSION: u8 = 1;
/// Header size in bytes
pub const SEGMENT_HEADER_SIZE: usize = 16;
/// Entry overhead: data_length(4) + first_global_position(8) + checksum(4)
pub const SEGMENT_ENTRY_OVERHEAD: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("segment I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("segment corruption: {0}")]
    Corruption(String),
    #[error("cannot encode append batch: {0}")]
    Encode(String),
}

/// One checksummed append batch
#[derive(Debug, Clone)]
pub struct SegmentEntry {
    pub data: Vec<u8>,
    pub first_global_position: u64,
    pub checksum: u32,
}

impl SegmentEntry {
    pub fn from_batch(batch: &[RecordedEvent]) -> Result<Self, SegmentError> {
        debug_assert!(!batch.is_empty(), "Precondition: batch must not be empty");

        let data = bincode::serialize(batch).map_err(|e| SegmentError::Encode(e.to_string()))?;
        if data.len() > u32::MAX as usize {
            return Err(SegmentError::Encode(format!(
                "batch of {} bytes exceeds entry limit",
                data.len()
            )));
        }
        let checksum = crc32fast::hash(&data);

        Ok(SegmentEntry {
            data,
            first_global_position: batch[0].global_position,
            checksum,
        })
    }

    pub fn to_batch(&self) -> Result<Vec<RecordedEvent>, SegmentError> {
        bincode::deserialize(&self.data)
            .map_err(|e| SegmentError::Corruption(format!("deserialize: {}", e)))
    }

    pub fn validate(&self) -> bool {
        crc32fast::hash(&self.data) == self.checksum
    }

    pub fn disk_size(&self) -> usize {
        SEGMENT_ENTRY_OVERHEAD + self.data.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.disk_size());

        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.first_global_position.to_le_bytes());
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf.extend_from_slice(&self.data);

        debug_assert_eq!(
            buf.len(),
            self.disk_size(),
            "Postcondition: encoded size must match expected"
        );

        buf
    }

    /// Decode one entry. Returns None if data is truncated or corrupt.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < SEGMENT_ENTRY_OVERHEAD {
            return None;
        }

        let data_len = u32::from_le_bytes(data[0..4].try_into().ok()?) as usize;
        let first_global_position = u64::from_le_bytes(data[4..12].try_into().ok()?);
        let checksum = u32::from_le_bytes(data[12..16].try_into().ok()?);

        let total_size = SEGMENT_ENTRY_OVERHEAD.checked_add(data_len)?;
        if data.len() < total_size {
            return None; // Truncated entry
        }

        let entry = SegmentEntry {
            data: data[SEGMENT_ENTRY_OVERHEAD..total_size].to_vec(),
            first_global_position,
            checksum,
        };
        if !entry.validate() {
            return None;
        }

        Some((entry, total_size))
    }
}

/// Segment file naming: seg-{sequence:08x}.log
pub fn segment_file_name(sequence: u64) -> String {
    format!("seg-{:08x}.log", sequence)
}

pub fn parse_segment_sequence(name: &str) -> Option<u64> {
    let name = name.strip_prefix("seg-")?.strip_suffix(".log")?;
    u64::from_str_radix(name, 16).ok()
}

/// Segment files in `dir`, sorted by sequence
pub fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, SegmentError> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(sequence) = name.to_str().and_then(parse_segment_sequence) {
            segments.push((sequence, entry.path()));
        }
    }
    segments.sort_by_key(|(sequence, _)| *sequence);
    Ok(segments)
}

// ============================================================================
// Segment Writer
// ============================================================================

/// Writer position to roll back to after a failed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentMark {
    size: u64,
    entry_count: u64,
}

/// Appends entries to a single segment file
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    sequence: u64,
    size: u64,
    entry_count: u64,
}

impl SegmentWriter {
    /// Create the segment file and write its header
    pub fn create(dir: &Path, sequence: u64) -> Result<Self, SegmentError> {
        let path = dir.join(segment_file_name(sequence));
        let mut file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)?;

        let mut header = [0u8; SEGMENT_HEADER_SIZE];
        header[0..4].copy_from_slice(&SEGMENT_MAGIC);
        header[4] = SEGMENT_VERSION;
        header[5] = 0; // flags
        // header[6..8] reserved
        header[8..16].copy_from_slice(&sequence.to_le_bytes());
        file.write_all(&header)?;

        Ok(SegmentWriter {
            file,
            sequence,
            size: SEGMENT_HEADER_SIZE as u64,
            entry_count: 0,
        })
    }

    /// Append one entry (does NOT fsync)
    pub fn append_entry(&mut self, entry: &SegmentEntry) -> Result<(), SegmentError> {
        debug_assert!(entry.validate(), "Precondition: entry checksum must be valid");

        let encoded = entry.encode();
        self.file.write_all(&encoded)?;
        self.size += encoded.len() as u64;
        self.entry_count += 1;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), SegmentError> {
        self.file.sync_data()?;
        Ok(())
    }

    pub fn mark(&self) -> SegmentMark {
        SegmentMark {
            size: self.size,
            entry_count: self.entry_count,
        }
    }

    /// Cut the file back to `mark`, dropping anything written after it
    pub fn truncate_to(&mut self, mark: SegmentMark) -> Result<(), SegmentError> {
        self.file.set_len(mark.size)?;
        self.file.sync_data()?;
        self.size = mark.size;
        self.entry_count = mark.entry_count;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

// ============================================================================
// Segment Reader
// ============================================================================

/// Reads header + entries from a segment file
pub struct SegmentReader {
    data: Vec<u8>,
    sequence: u64,
}

impl SegmentReader {
    /// Read a segment file. Validates the header.
    pub fn open(path: &Path) -> Result<Self, SegmentError> {
        let mut data = Vec::new();
        File::open(path)?.read_to_end(&mut data)?;
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, SegmentError> {
        if data.len() < SEGMENT_HEADER_SIZE {
            return Err(SegmentError::Corruption(
                "segment too short for header".to_string(),
            ));
        }
        if data[0..4] != SEGMENT_MAGIC {
            return Err(SegmentError::Corruption(format!(
                "invalid segment magic: {:?}",
                &data[0..4]
            )));
        }
        let version = data[4];
        if version != SEGMENT_VERSION {
            return Err(SegmentError::Corruption(format!(
                "unsupported segment version: {}",
                version
            )));
        }

        let mut sequence = [0u8; 8];
        sequence.copy_from_slice(&data[8..16]);

        Ok(SegmentReader {
            data,
            sequence: u64::from_le_bytes(sequence),
        })
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// All valid entries, stopping at the first corrupted or truncated one
    pub fn entries(&self) -> Vec<SegmentEntry> {
        let mut entries = Vec::new();
        let mut offset = SEGMENT_HEADER_SIZE;

        while offset < self.data.len() {
            match SegmentEntry::decode(&self.data[offset..]) {
                Some((entry, consumed)) => {
                    entries.push(entry);
                    offset += consumed;
                }
                None => break,
            }
        }

        entries
    }
}
