//! History file layout.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (128 bytes)                                     │
//! │  - Magic: "ASHT" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: u16 (2 bytes)                                   │
//! │  - Provider version: u32 (4 bytes)                           │
//! │  - Block size: u32 (4 bytes)                                 │
//! │  - Max children: u32 (4 bytes)                               │
//! │  - Root sequence number: u32 (4 bytes)                       │
//! │  - Node count: u32 (4 bytes)                                 │
//! │  - Start / end time: i64 + i64 (16 bytes)                    │
//! │  - Attribute section offset: u64 (8 bytes)                   │
//! │  - Attribute section size: u32 (4 bytes)                     │
//! │  - Attribute section CRC32: u32 (4 bytes)                    │
//! │  - Header CRC32 over bytes 0..60: u32 (4 bytes)              │
//! │  - Reserved: 64 bytes                                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Node blocks, block_size bytes each, in sequence order       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Attribute tree section                                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The header is written last. A file whose build was interrupted keeps a
//! zeroed header and is rejected on open.

use crate::attribute::AttributeTree;
use crate::buffer::{SafeBufferReader, SafeBufferWriter};
use crate::error::{Result, StateError};
use crate::history::node::HtNode;
use crate::history::{SequenceNumber, Timestamp};
use lru::LruCache;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Magic bytes for the history file header: "ASHT"
pub const HISTORY_MAGIC: [u8; 4] = *b"ASHT";

/// Current history file format version.
pub const HISTORY_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 128;

const HEADER_CRC_OFFSET: usize = 60;

/// Returns the file offset of node `seq`.
pub fn node_offset(block_size: u32, seq: SequenceNumber) -> u64 {
    HEADER_SIZE as u64 + u64::from(seq) * u64::from(block_size)
}

/// History file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryHeader {
    /// File format version.
    pub version: u16,
    /// Version of the state provider that built the history.
    pub provider_version: u32,
    /// Size of every node block.
    pub block_size: u32,
    /// Maximum number of children per branch node.
    pub max_children: u32,
    /// Sequence number of the root node.
    pub root_seq: SequenceNumber,
    /// Number of node blocks.
    pub node_count: u32,
    /// Start time of the history.
    pub start: Timestamp,
    /// End time of the history.
    pub end: Timestamp,
    /// Offset of the attribute tree section.
    pub attribute_offset: u64,
    /// Size of the attribute tree section.
    pub attribute_size: u32,
    /// CRC32 of the attribute tree section.
    pub attribute_crc32: u32,
}

impl HistoryHeader {
    /// Returns the file offset of node `seq`.
    pub fn node_offset(&self, seq: SequenceNumber) -> u64 {
        node_offset(self.block_size, seq)
    }

    /// Returns where the attribute section must start given the node count.
    pub fn expected_attribute_offset(&self) -> u64 {
        node_offset(self.block_size, self.node_count)
    }

    /// Encodes the header, header checksum included.
    pub fn to_bytes(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut writer = SafeBufferWriter::new(&mut buf);
        writer.put_bytes(&HISTORY_MAGIC)?;
        writer.put_u16(self.version)?;
        writer.put_u16(0)?;
        writer.put_u32(self.provider_version)?;
        writer.put_u32(self.block_size)?;
        writer.put_u32(self.max_children)?;
        writer.put_u32(self.root_seq)?;
        writer.put_u32(self.node_count)?;
        writer.put_i64(self.start)?;
        writer.put_i64(self.end)?;
        writer.put_u64(self.attribute_offset)?;
        writer.put_u32(self.attribute_size)?;
        writer.put_u32(self.attribute_crc32)?;

        let crc = crc32fast::hash(&buf[..HEADER_CRC_OFFSET]);
        buf[HEADER_CRC_OFFSET..HEADER_CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// - `StateError::InvalidMagic` if the magic bytes don't match
    /// - `StateError::UnsupportedVersion` for any other format version
    /// - `StateError::ChecksumMismatch` if the header checksum doesn't match
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StateError::corrupt(format!(
                "file of {} bytes is too small for a history header",
                buf.len()
            )));
        }
        let mut reader = SafeBufferReader::new(&buf[..HEADER_SIZE]);

        let magic = reader.get_array::<4>()?;
        if magic != HISTORY_MAGIC {
            return Err(StateError::InvalidMagic(magic));
        }
        let version = reader.get_u16()?;
        if version != HISTORY_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        reader.skip(2)?;

        let header = Self {
            version,
            provider_version: reader.get_u32()?,
            block_size: reader.get_u32()?,
            max_children: reader.get_u32()?,
            root_seq: reader.get_u32()?,
            node_count: reader.get_u32()?,
            start: reader.get_i64()?,
            end: reader.get_i64()?,
            attribute_offset: reader.get_u64()?,
            attribute_size: reader.get_u32()?,
            attribute_crc32: reader.get_u32()?,
        };

        let stored = reader.get_u32()?;
        let actual = crc32fast::hash(&buf[..HEADER_CRC_OFFSET]);
        if stored != actual {
            return Err(StateError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }
        Ok(header)
    }

    /// Checks the structural fields against each other.
    pub fn validate(&self) -> Result<()> {
        if self.node_count == 0 {
            return Err(StateError::corrupt("history file has no nodes"));
        }
        if self.root_seq >= self.node_count {
            return Err(StateError::corrupt(format!(
                "root node {} out of {} nodes",
                self.root_seq, self.node_count
            )));
        }
        if self.end < self.start {
            return Err(StateError::corrupt(format!(
                "history ends at {} before its start {}",
                self.end, self.start
            )));
        }
        if self.attribute_offset != self.expected_attribute_offset() {
            return Err(StateError::corrupt(format!(
                "attribute section at {} instead of {}",
                self.attribute_offset,
                self.expected_attribute_offset()
            )));
        }
        Ok(())
    }
}

/// Block storage used while the tree is being built.
///
/// Sealed nodes are written once at their fixed offset. Recently sealed
/// nodes stay in an LRU cache so that queries during the build rarely go
/// back to disk.
pub(crate) struct NodeFile {
    file: File,
    block_size: usize,
    cache: LruCache<SequenceNumber, Arc<HtNode>>,
    scratch: Vec<u8>,
}

impl NodeFile {
    /// Creates (or truncates) the file and reserves the header.
    pub(crate) fn create(path: &Path, block_size: usize, cache_capacity: usize) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&[0u8; HEADER_SIZE])?;

        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            file,
            block_size,
            cache: LruCache::new(capacity),
            scratch: vec![0u8; block_size],
        })
    }

    /// Writes a sealed node to its block and caches it.
    pub(crate) fn write_node(&mut self, node: HtNode) -> Result<()> {
        let seq = node.seq();
        node.serialize(&mut self.scratch)?;
        self.file
            .seek(SeekFrom::Start(node_offset(self.block_size as u32, seq)))?;
        self.file.write_all(&self.scratch)?;
        debug!("Wrote node {} [{}, {}]", seq, node.start(), node.end());
        self.cache.put(seq, Arc::new(node));
        Ok(())
    }

    /// Returns a sealed node, from the cache when possible.
    pub(crate) fn read_node(&mut self, seq: SequenceNumber) -> Result<Arc<HtNode>> {
        if let Some(node) = self.cache.get(&seq) {
            return Ok(Arc::clone(node));
        }
        self.file
            .seek(SeekFrom::Start(node_offset(self.block_size as u32, seq)))?;
        self.file.read_exact(&mut self.scratch)?;
        let node = HtNode::deserialize(&self.scratch)?;
        if node.seq() != seq {
            return Err(StateError::corrupt(format!(
                "block {seq} holds node {}",
                node.seq()
            )));
        }
        let node = Arc::new(node);
        self.cache.put(seq, Arc::clone(&node));
        Ok(node)
    }

    /// Appends the attribute tree at `offset` and returns its size and CRC.
    pub(crate) fn write_attributes(&mut self, offset: u64, tree: &AttributeTree) -> Result<(u32, u32)> {
        let mut buf = vec![0u8; tree.encoded_size()];
        let mut writer = SafeBufferWriter::new(&mut buf);
        tree.write_to(&mut writer)?;
        let size = u32::try_from(buf.len())
            .map_err(|_| StateError::InvalidConfig("attribute tree exceeds 4 GiB".to_string()))?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        Ok((size, crc32fast::hash(&buf)))
    }

    /// Writes the final header, syncs and hands the file back.
    pub(crate) fn finish(mut self, header: &HistoryHeader) -> Result<File> {
        let bytes = header.to_bytes()?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&bytes)?;
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(self.file)
    }
}
