//! History tree construction.
//!
//! The writer keeps the *latest branch* (root to rightmost leaf) in memory.
//! Every other node is sealed and lives in the file. Intervals must arrive
//! with non-decreasing end times; each one is stored in the deepest node of
//! the latest branch that starts no later than the interval does.
//!
//! When that node is full, the latest branch is split at the current end of
//! the tree: nodes below the deepest ancestor that still has a free child
//! slot are sealed and replaced by empty nodes starting right after the
//! split. If no ancestor has a free slot, a new root is created and the tree
//! grows by one level.

use crate::attribute::AttributeTree;
use crate::error::{Result, StateError};
use crate::history::file::{node_offset, HistoryHeader, NodeFile, HISTORY_VERSION};
use crate::history::interval::{StateInterval, INTERVAL_FIXED_SIZE};
use crate::history::node::{header_size, ChildEntry, HtNode, NodeType};
use crate::history::query::{NodeHandle, NodeSource};
use crate::history::reader::HistoryTreeReader;
use crate::history::{SequenceNumber, TimeRange, Timestamp};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

/// Default node block size: 64 KiB.
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Default maximum number of children per branch node.
pub const DEFAULT_MAX_CHILDREN: usize = 50;

/// Default number of sealed nodes kept in memory during the build.
pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 256;

/// Configuration for a history tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTreeConfig {
    /// Size of every node block in bytes.
    ///
    /// Bounds the size of a single interval. Default: 64 KiB.
    pub block_size: usize,

    /// Maximum number of children of a branch node. Default: 50.
    pub max_children: usize,

    /// Version of the state provider building the history.
    ///
    /// Stored in the file header and checked on reopen. Default: 0.
    pub provider_version: u32,

    /// Number of sealed nodes cached by the writer. Default: 256.
    pub node_cache_capacity: usize,
}

impl Default for HistoryTreeConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_children: DEFAULT_MAX_CHILDREN,
            provider_version: 0,
            node_cache_capacity: DEFAULT_NODE_CACHE_CAPACITY,
        }
    }
}

impl HistoryTreeConfig {
    /// Creates a new configuration with custom block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Creates a new configuration with custom max children.
    pub fn with_max_children(mut self, max_children: usize) -> Self {
        self.max_children = max_children;
        self
    }

    /// Creates a new configuration with custom provider version.
    pub fn with_provider_version(mut self, provider_version: u32) -> Self {
        self.provider_version = provider_version;
        self
    }

    /// Creates a new configuration with custom node cache capacity.
    pub fn with_node_cache_capacity(mut self, capacity: usize) -> Self {
        self.node_cache_capacity = capacity;
        self
    }

    /// Returns the largest serialized interval any node can hold.
    pub fn max_interval_size(&self) -> usize {
        self.block_size
            .saturating_sub(header_size(NodeType::Branch, self.max_children))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidConfig` if a branch node could not hold
    /// two children and one interval.
    pub fn validate(&self) -> Result<()> {
        if self.max_children < 2 {
            return Err(StateError::InvalidConfig(format!(
                "max_children must be at least 2, got {}",
                self.max_children
            )));
        }
        if self.max_children > u32::MAX as usize || self.block_size > u32::MAX as usize {
            return Err(StateError::InvalidConfig(
                "block_size and max_children must fit in 32 bits".to_string(),
            ));
        }
        let minimum = header_size(NodeType::Branch, self.max_children) + INTERVAL_FIXED_SIZE;
        if self.block_size < minimum {
            return Err(StateError::InvalidConfig(format!(
                "block_size {} too small for {} children, need at least {}",
                self.block_size, self.max_children, minimum
            )));
        }
        Ok(())
    }
}

/// Builds a history tree file.
///
/// Call [`close`](Self::close) to seal the tree and get a reader; dropping
/// the writer leaves an unreadable partial file behind.
pub struct HistoryTreeWriter {
    config: HistoryTreeConfig,
    path: PathBuf,
    file: Mutex<NodeFile>,
    start: Timestamp,
    end: Timestamp,
    node_count: u32,
    /// Root first, rightmost leaf last.
    latest_branch: Vec<HtNode>,
}

impl HistoryTreeWriter {
    /// Creates the file at `path` with a single empty leaf as root.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidConfig` for an invalid configuration and
    /// `StateError::Io` if the file cannot be created.
    pub fn create(path: &Path, start: Timestamp, config: HistoryTreeConfig) -> Result<Self> {
        config.validate()?;
        let file = NodeFile::create(path, config.block_size, config.node_cache_capacity)?;
        let root = HtNode::new(
            NodeType::Leaf,
            0,
            None,
            start,
            config.block_size,
            config.max_children,
        );
        info!(
            "Created history tree {} (block size {}, max children {})",
            path.display(),
            config.block_size,
            config.max_children
        );
        Ok(Self {
            config,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            start,
            end: start,
            node_count: 1,
            latest_branch: vec![root],
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HistoryTreeConfig {
        &self.config
    }

    /// Returns the path of the file being built.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the start time of the tree.
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Returns the largest interval end inserted so far.
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Returns the number of nodes allocated so far.
    pub fn node_count(&self) -> u32 {
        self.node_count
    }

    /// Returns the number of levels of the tree.
    pub fn depth(&self) -> usize {
        self.latest_branch.len()
    }

    /// Returns the nodes of the latest branch, root first.
    pub fn latest_branch(&self) -> &[HtNode] {
        &self.latest_branch
    }

    /// Inserts an interval.
    ///
    /// # Errors
    ///
    /// - `StateError::TimeRange` if the interval starts before the tree or
    ///   ends before a previously inserted interval
    /// - `StateError::IntervalTooLarge` if no node could ever hold it
    pub fn insert(&mut self, interval: StateInterval) -> Result<()> {
        if interval.start() < self.start || interval.end() < self.end {
            return Err(StateError::TimeRange {
                time: if interval.start() < self.start {
                    interval.start()
                } else {
                    interval.end()
                },
                start: self.start,
                end: self.end,
            });
        }
        let size = interval.serialized_size();
        let capacity = self.config.max_interval_size();
        if size > capacity {
            return Err(StateError::IntervalTooLarge { size, capacity });
        }

        let end = interval.end();
        let mut index = self.latest_branch.len() - 1;
        loop {
            let node = &self.latest_branch[index];
            if interval.start() < node.start() {
                index = index.checked_sub(1).ok_or_else(|| {
                    StateError::corrupt(format!(
                        "root starts at {} after interval start {}",
                        node.start(),
                        interval.start()
                    ))
                })?;
                continue;
            }
            if node.free_space() < size {
                self.add_sibling_node(index)?;
                index = self.latest_branch.len() - 1;
                continue;
            }
            self.latest_branch[index].add_interval(interval)?;
            break;
        }
        self.end = end;
        Ok(())
    }

    /// Seals the tree at `end`, writes the attribute tree and the header,
    /// and reopens the file for reading.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimeRange` if `end` precedes an inserted
    /// interval, or any I/O error raised while writing.
    pub fn close(mut self, end: Timestamp, attributes: &AttributeTree) -> Result<HistoryTreeReader> {
        if end < self.end {
            return Err(StateError::TimeRange {
                time: end,
                start: self.start,
                end: self.end,
            });
        }
        self.end = end;
        let root_seq = self.root_seq();
        self.seal_from(0, end)?;

        let block_size = self.config.block_size as u32;
        let attribute_offset = node_offset(block_size, self.node_count);
        let mut file = self.file.into_inner().unwrap_or_else(PoisonError::into_inner);
        let (attribute_size, attribute_crc32) = file.write_attributes(attribute_offset, attributes)?;

        let header = HistoryHeader {
            version: HISTORY_VERSION,
            provider_version: self.config.provider_version,
            block_size,
            max_children: self.config.max_children as u32,
            root_seq,
            node_count: self.node_count,
            start: self.start,
            end,
            attribute_offset,
            attribute_size,
            attribute_crc32,
        };
        let file = file.finish(&header)?;
        info!(
            "Closed history tree {} with {} nodes over [{}, {}]",
            self.path.display(),
            header.node_count,
            header.start,
            header.end
        );
        HistoryTreeReader::from_file(file, self.path, None)
    }

    /// Abandons the build and removes the partial file.
    pub fn discard(self) -> Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)?;
        debug!("Removed partial history file {}", self.path.display());
        Ok(())
    }

    fn allocate_seq(&mut self) -> SequenceNumber {
        let seq = self.node_count;
        self.node_count += 1;
        seq
    }

    fn add_sibling_node(&mut self, index: usize) -> Result<()> {
        let split = self.end;
        // New nodes start right after the split, which must be representable.
        let next = split.checked_add(1).ok_or(StateError::TimeRange {
            time: split,
            start: self.start,
            end: Timestamp::MAX - 1,
        })?;
        let depth = self.latest_branch.len();
        let anchor = (0..index)
            .rev()
            .find(|&i| self.latest_branch[i].child_count() < self.config.max_children);

        let Some(anchor) = anchor else {
            return self.add_new_root(split, next);
        };
        debug!(
            "Splitting latest branch below level {} at {} (node {} full)",
            anchor,
            split,
            self.latest_branch[index].seq()
        );
        self.seal_from(anchor + 1, split)?;
        self.open_chain(depth, next)
    }

    fn add_new_root(&mut self, split: Timestamp, next: Timestamp) -> Result<()> {
        let depth = self.latest_branch.len();
        let new_root_seq = self.allocate_seq();
        self.latest_branch[0].set_parent(new_root_seq);
        self.seal_from(1, split)?;

        let mut old_root = self
            .latest_branch
            .pop()
            .ok_or_else(|| StateError::corrupt("latest branch is empty"))?;
        old_root.seal(split)?;
        let old_entry = old_root.child_entry();
        self.write_node(old_root)?;

        let mut root = HtNode::new(
            NodeType::Branch,
            new_root_seq,
            None,
            self.start,
            self.config.block_size,
            self.config.max_children,
        );
        root.link_child(ChildEntry::open(old_entry.seq, old_entry.start))?;
        root.update_child(old_entry)?;
        self.latest_branch.push(root);
        debug!(
            "New root {} at {}, tree depth now {}",
            new_root_seq,
            split,
            depth + 1
        );
        self.open_chain(depth + 1, next)
    }

    /// Seals the nodes of the latest branch from `level` down, deepest
    /// first, and writes them out.
    fn seal_from(&mut self, level: usize, end: Timestamp) -> Result<()> {
        while self.latest_branch.len() > level {
            let Some(mut node) = self.latest_branch.pop() else {
                break;
            };
            node.seal(end)?;
            if let Some(parent) = self.latest_branch.last_mut() {
                parent.update_child(node.child_entry())?;
            }
            self.write_node(node)?;
        }
        Ok(())
    }

    /// Extends the latest branch with empty nodes starting at `start` until
    /// it is `depth` levels deep.
    fn open_chain(&mut self, depth: usize, start: Timestamp) -> Result<()> {
        while self.latest_branch.len() < depth {
            let node_type = if self.latest_branch.len() + 1 == depth {
                NodeType::Leaf
            } else {
                NodeType::Branch
            };
            let seq = self.allocate_seq();
            let parent = self
                .latest_branch
                .last_mut()
                .ok_or_else(|| StateError::corrupt("latest branch is empty"))?;
            parent.link_child(ChildEntry::open(seq, start))?;
            let parent_seq = parent.seq();
            self.latest_branch.push(HtNode::new(
                node_type,
                seq,
                Some(parent_seq),
                start,
                self.config.block_size,
                self.config.max_children,
            ));
        }
        Ok(())
    }

    fn write_node(&mut self, node: HtNode) -> Result<()> {
        self.file
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .write_node(node)
    }
}

impl NodeSource for HistoryTreeWriter {
    fn root_seq(&self) -> SequenceNumber {
        self.latest_branch.first().map_or(0, HtNode::seq)
    }

    fn time_range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }

    fn node(&self, seq: SequenceNumber) -> Result<NodeHandle<'_>> {
        if let Some(node) = self.latest_branch.iter().find(|node| node.seq() == seq) {
            return Ok(NodeHandle::Borrowed(node));
        }
        if seq >= self.node_count {
            return Err(StateError::corrupt(format!(
                "node {seq} requested, {} allocated",
                self.node_count
            )));
        }
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(NodeHandle::Shared(file.read_node(seq)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::query::{query_point, RangeQuery};
    use crate::history::value::StateValue;
    use tempfile::TempDir;

    /// Three long-valued intervals per leaf, two children per branch.
    fn tiny_config() -> HistoryTreeConfig {
        HistoryTreeConfig::default()
            .with_block_size(165)
            .with_max_children(2)
    }

    fn long_interval(start: i64, end: i64, quark: u32) -> StateInterval {
        StateInterval::new(start, end, quark, StateValue::Long(start)).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(HistoryTreeConfig::default().validate().is_ok());
        assert!(tiny_config().validate().is_ok());
        assert!(tiny_config().with_max_children(1).validate().is_err());
        assert!(tiny_config().with_block_size(150).validate().is_err());
        assert_eq!(tiny_config().max_interval_size(), 31);
    }

    #[test]
    fn test_fourth_interval_creates_new_root() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTreeWriter::create(&dir.path().join("ht"), 0, tiny_config()).unwrap();
        for i in 0..3 {
            tree.insert(long_interval(i * 10, i * 10 + 9, 1)).unwrap();
        }
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.node_count(), 1);

        tree.insert(long_interval(30, 39, 1)).unwrap();
        assert_eq!(tree.depth(), 2);
        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.root_seq(), 1);
        let leaf = &tree.latest_branch()[1];
        assert_eq!(leaf.start(), 30);
        assert_eq!(leaf.intervals().len(), 1);

        // Sealed leaf comes back from the node file.
        let first = query_point(&tree, 1, 15).unwrap().unwrap();
        assert_eq!(first.start(), 10);
    }

    #[test]
    fn test_interval_starting_before_leaf_goes_up() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTreeWriter::create(&dir.path().join("ht"), 0, tiny_config()).unwrap();
        for i in 0..4 {
            tree.insert(long_interval(i * 10, i * 10 + 9, 1)).unwrap();
        }
        tree.insert(long_interval(5, 45, 2)).unwrap();
        assert_eq!(tree.latest_branch()[0].intervals().len(), 1);
        assert_eq!(query_point(&tree, 2, 20).unwrap().unwrap().start(), 5);
    }

    #[test]
    fn test_rejects_out_of_order_intervals() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTreeWriter::create(&dir.path().join("ht"), 100, tiny_config()).unwrap();
        assert!(matches!(
            tree.insert(long_interval(50, 150, 1)),
            Err(StateError::TimeRange { time: 50, .. })
        ));
        tree.insert(long_interval(100, 200, 1)).unwrap();
        assert!(matches!(
            tree.insert(long_interval(100, 199, 2)),
            Err(StateError::TimeRange { time: 199, .. })
        ));
    }

    #[test]
    fn test_rejects_oversized_interval() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTreeWriter::create(&dir.path().join("ht"), 0, tiny_config()).unwrap();
        let big = StateInterval::new(0, 1, 1, StateValue::from("way too long for this tree")).unwrap();
        assert!(matches!(
            tree.insert(big),
            Err(StateError::IntervalTooLarge { capacity: 31, .. })
        ));
    }

    #[test]
    fn test_split_at_end_of_time_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTreeWriter::create(&dir.path().join("ht"), 0, tiny_config()).unwrap();
        for quark in 1..=3 {
            tree.insert(long_interval(0, i64::MAX, quark)).unwrap();
        }
        assert!(matches!(
            tree.insert(long_interval(0, i64::MAX, 4)),
            Err(StateError::TimeRange { time: i64::MAX, .. })
        ));
        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(query_point(&tree, 2, 42).unwrap().unwrap().quark(), 2);
    }

    #[test]
    fn test_many_inserts_keep_every_interval_reachable() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTreeWriter::create(&dir.path().join("ht"), 0, tiny_config()).unwrap();
        for i in 0..200 {
            tree.insert(long_interval(i * 10, i * 10 + 9, (i % 3) as u32)).unwrap();
        }
        assert!(tree.depth() > 3);
        for i in 0..200 {
            let found = query_point(&tree, (i % 3) as u32, i * 10 + 4).unwrap().unwrap();
            assert_eq!(found.start(), i * 10);
        }
        let all = RangeQuery::new(&tree, None, 0, 2_000).unwrap();
        let starts: Vec<_> = all.iter().map(|i| i.unwrap().start()).collect();
        assert_eq!(starts, (0..200).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn test_close_produces_readable_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ht");
        let mut tree = HistoryTreeWriter::create(&path, 0, tiny_config()).unwrap();
        for i in 0..10 {
            tree.insert(long_interval(i * 10, i * 10 + 9, 1)).unwrap();
        }
        let reader = tree.close(120, &AttributeTree::new()).unwrap();
        assert_eq!(reader.time_range(), TimeRange::new(0, 120));
        assert_eq!(query_point(&reader, 1, 95).unwrap().unwrap().start(), 90);
        assert!(query_point(&reader, 1, 110).unwrap().is_none());
    }

    #[test]
    fn test_close_before_last_interval_fails() {
        let dir = TempDir::new().unwrap();
        let mut tree = HistoryTreeWriter::create(&dir.path().join("ht"), 0, tiny_config()).unwrap();
        tree.insert(long_interval(0, 99, 1)).unwrap();
        assert!(matches!(
            tree.close(50, &AttributeTree::new()).map(|_| ()),
            Err(StateError::TimeRange { time: 50, .. })
        ));
    }

    #[test]
    fn test_discard_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ht");
        let mut tree = HistoryTreeWriter::create(&path, 0, tiny_config()).unwrap();
        tree.insert(long_interval(0, 9, 1)).unwrap();
        tree.discard().unwrap();
        assert!(!path.exists());
    }
}
