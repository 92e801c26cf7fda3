//! Read-only access to a completed history file.

use crate::attribute::{AttributeTree, Quark};
use crate::buffer::SafeBufferReader;
use crate::error::{Result, StateError};
use crate::history::file::HistoryHeader;
use crate::history::interval::StateInterval;
use crate::history::node::{HtNode, COMMON_HEADER_SIZE};
use crate::history::query::{query_full, query_point, NodeHandle, NodeSource, RangeQuery};
use crate::history::{SequenceNumber, TimeRange, Timestamp};
use memmap2::Mmap;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Memory-mapped, immutable history tree.
///
/// Every structural field is validated on open. Nodes are decoded from the
/// mapping on demand, so the reader can be shared between threads without
/// locking.
pub struct HistoryTreeReader {
    path: PathBuf,
    mmap: Mmap,
    header: HistoryHeader,
    attributes: AttributeTree,
}

impl HistoryTreeReader {
    /// Opens a history file.
    ///
    /// # Errors
    ///
    /// - `StateError::InvalidMagic` / `StateError::UnsupportedVersion` if the
    ///   file is not a complete history file of a supported version
    /// - `StateError::ChecksumMismatch` if the header or attribute section
    ///   checksum fails
    /// - `StateError::CorruptFile` for inconsistent layout fields
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file, path.to_path_buf(), None)
    }

    /// Opens a history file built by provider version `provider_version`.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ProviderVersionMismatch` if the file was built by
    /// another version, in addition to the errors of [`open`](Self::open).
    pub fn open_with_version(path: &Path, provider_version: u32) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_file(file, path.to_path_buf(), Some(provider_version))
    }

    pub(crate) fn from_file(file: File, path: PathBuf, provider_version: Option<u32>) -> Result<Self> {
        // SAFETY: history files are never modified once their header is written.
        let mmap = unsafe { Mmap::map(&file)? };

        let header = HistoryHeader::from_bytes(&mmap)?;
        header.validate()?;
        if let Some(expected) = provider_version {
            if header.provider_version != expected {
                return Err(StateError::ProviderVersionMismatch {
                    expected,
                    found: header.provider_version,
                });
            }
        }
        if (header.block_size as usize) < COMMON_HEADER_SIZE {
            return Err(StateError::corrupt(format!(
                "block size {} smaller than a node header",
                header.block_size
            )));
        }

        let attribute_end = header
            .attribute_offset
            .checked_add(u64::from(header.attribute_size))
            .ok_or_else(|| StateError::corrupt("attribute section overflows"))?;
        if attribute_end > mmap.len() as u64 {
            return Err(StateError::corrupt(format!(
                "file truncated: {} bytes, attribute section ends at {}",
                mmap.len(),
                attribute_end
            )));
        }
        let section = &mmap[header.attribute_offset as usize..attribute_end as usize];
        let actual = crc32fast::hash(section);
        if actual != header.attribute_crc32 {
            return Err(StateError::ChecksumMismatch {
                expected: header.attribute_crc32,
                actual,
            });
        }
        let attributes = AttributeTree::read_from(&mut SafeBufferReader::new(section))?;

        debug!(
            "Opened history file {} ({} nodes, {} attributes)",
            path.display(),
            header.node_count,
            attributes.len()
        );
        Ok(Self {
            path,
            mmap,
            header,
            attributes,
        })
    }

    /// Returns the path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file header.
    pub fn header(&self) -> &HistoryHeader {
        &self.header
    }

    /// Returns the attribute tree stored with the history.
    pub fn attributes(&self) -> &AttributeTree {
        &self.attributes
    }

    /// Returns the start time of the history.
    pub fn start(&self) -> Timestamp {
        self.header.start
    }

    /// Returns the end time of the history.
    pub fn end(&self) -> Timestamp {
        self.header.end
    }

    /// Returns the number of nodes.
    pub fn node_count(&self) -> u32 {
        self.header.node_count
    }

    /// Returns the interval of `quark` containing `time`, if any.
    pub fn find_interval(&self, quark: Quark, time: Timestamp) -> Result<Option<StateInterval>> {
        query_point(self, quark, time)
    }

    /// Returns the interval of `quark` containing `time`.
    ///
    /// # Errors
    ///
    /// - `StateError::AttributeNotFound` if the attribute tree has no `quark`
    /// - `StateError::TimeRange` if `time` is outside the history
    /// - `StateError::CorruptFile` if no interval covers `time`
    pub fn query(&self, quark: Quark, time: Timestamp) -> Result<StateInterval> {
        if !self.attributes.contains(quark) {
            return Err(StateError::AttributeNotFound(format!("quark {quark}")));
        }
        self.find_interval(quark, time)?.ok_or_else(|| {
            StateError::corrupt(format!("no interval for quark {quark} at {time}"))
        })
    }

    /// Returns the interval of every attribute at `time`.
    pub fn query_full(&self, time: Timestamp) -> Result<BTreeMap<Quark, StateInterval>> {
        Ok(query_full(self, time)?
            .into_iter()
            .map(|interval| (interval.quark(), interval))
            .collect())
    }

    /// Prepares a range query over `[start, end]`, optionally restricted to
    /// one attribute.
    pub fn query_range(
        &self,
        quark: Option<Quark>,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<RangeQuery<'_, Self>> {
        if let Some(quark) = quark {
            if !self.attributes.contains(quark) {
                return Err(StateError::AttributeNotFound(format!("quark {quark}")));
            }
        }
        RangeQuery::new(self, quark, start, end)
    }
}

impl NodeSource for HistoryTreeReader {
    fn root_seq(&self) -> SequenceNumber {
        self.header.root_seq
    }

    fn time_range(&self) -> TimeRange {
        TimeRange::new(self.header.start, self.header.end)
    }

    fn node(&self, seq: SequenceNumber) -> Result<NodeHandle<'_>> {
        if seq >= self.header.node_count {
            return Err(StateError::corrupt(format!(
                "node {seq} out of {} nodes",
                self.header.node_count
            )));
        }
        let offset = self.header.node_offset(seq) as usize;
        let block = self
            .mmap
            .get(offset..offset + self.header.block_size as usize)
            .ok_or_else(|| StateError::corrupt(format!("node {seq} lies past the end of the file")))?;
        let node = HtNode::deserialize(block)?;
        if node.seq() != seq {
            return Err(StateError::corrupt(format!(
                "block {seq} holds node {}",
                node.seq()
            )));
        }
        Ok(NodeHandle::Owned(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::tree::{HistoryTreeConfig, HistoryTreeWriter};
    use crate::history::value::StateValue;
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn build(path: &Path, provider_version: u32) -> HistoryTreeReader {
        let mut attributes = AttributeTree::new();
        let cpu = attributes.get_or_create(&["CPUs", "0"]);
        let config = HistoryTreeConfig::default()
            .with_block_size(512)
            .with_max_children(4)
            .with_provider_version(provider_version);
        let mut tree = HistoryTreeWriter::create(path, 0, config).unwrap();
        for i in 0..40 {
            let interval = StateInterval::new(i * 5, i * 5 + 4, cpu, StateValue::Int(i as i32)).unwrap();
            tree.insert(interval).unwrap();
        }
        tree.close(199, &attributes).unwrap()
    }

    #[test]
    fn test_reopen_gives_same_answers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.ht");
        let built = build(&path, 0);
        let reopened = HistoryTreeReader::open(&path).unwrap();
        assert_eq!(reopened.header(), built.header());
        let cpu = reopened.attributes().quark(&["CPUs", "0"]).unwrap();
        for t in [0, 4, 5, 77, 199] {
            assert_eq!(reopened.query(cpu, t).unwrap(), built.query(cpu, t).unwrap());
        }
        assert_eq!(reopened.query(cpu, 77).unwrap().value(), &StateValue::Int(15));
        assert!(matches!(reopened.query(99, 5), Err(StateError::AttributeNotFound(_))));
        assert!(matches!(reopened.query(cpu, 200), Err(StateError::TimeRange { .. })));
        assert_eq!(reopened.query_full(12).unwrap().len(), 1);
        let range = reopened.query_range(Some(cpu), 10, 29).unwrap();
        assert_eq!(range.iter().count(), 4);
    }

    #[test]
    fn test_provider_version_is_checked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.ht");
        build(&path, 7);
        assert!(HistoryTreeReader::open_with_version(&path, 7).is_ok());
        assert!(matches!(
            HistoryTreeReader::open_with_version(&path, 8),
            Err(StateError::ProviderVersionMismatch { expected: 8, found: 7 })
        ));
    }

    #[test]
    fn test_corrupted_node_is_reported_on_query() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.ht");
        let root = build(&path, 0).header().root_seq;
        let offset = crate::history::file::node_offset(512, root) + 300;
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&[0xAB; 8]).unwrap();
        drop(file);

        let reader = HistoryTreeReader::open(&path).unwrap();
        let err = reader.query(1, 10).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.ht");
        build(&path, 0);
        let len = std::fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 3)
            .unwrap();
        assert!(HistoryTreeReader::open(&path).err().unwrap().is_corruption());
    }
}
