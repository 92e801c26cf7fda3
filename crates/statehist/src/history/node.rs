//! History tree nodes.
//!
//! A node occupies exactly `block_size` bytes on disk. Leaves only hold
//! intervals; branch nodes additionally carry a fixed-capacity child table
//! so that descending into a subtree never requires reading the child first.
//!
//! ## Block Layout
//!
//! ```text
//! Offset  Size  Field
//! 0x00    1     node_type (1 = leaf, 2 = branch)
//! 0x01    1     sealed flag
//! 0x02    4     seq (u32 LE)
//! 0x06    4     parent seq (u32 LE, u32::MAX = root)
//! 0x0A    8     start (i64 LE)
//! 0x12    8     end (i64 LE)
//! 0x1A    4     interval_count (u32 LE)
//! 0x1E    4     intervals_size in bytes (u32 LE)
//! 0x22    8     max_start of the subtree (i64 LE)
//! 0x2A    8     min_end of the subtree (i64 LE)
//! 0x32    4     crc32 of the block with this field zeroed
//! -- branch only --
//! 0x36    4     child_capacity (u32 LE)
//! 0x3A    4     child_count (u32 LE)
//! 0x3E    36*C  child entries (seq, start, end, max_start, min_end)
//! -- all --
//! ...     N     intervals, sorted by start
//! ...     ...   zero padding up to block_size
//! ```

use crate::attribute::Quark;
use crate::buffer::{SafeBufferReader, SafeBufferWriter};
use crate::error::{Result, StateError};
use crate::history::interval::StateInterval;
use crate::history::{SequenceNumber, Timestamp};

/// Parent sequence number stored for the root node.
pub const NO_PARENT: u32 = u32::MAX;

/// Size of the header shared by leaf and branch nodes.
pub const COMMON_HEADER_SIZE: usize = 0x36;

/// Size of one serialized [`ChildEntry`].
pub const CHILD_ENTRY_SIZE: usize = 4 + 8 + 8 + 8 + 8;

const CRC_OFFSET: usize = 0x32;

const CHILD_TABLE_PREFIX: usize = 8;

/// Kind of history tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeType {
    /// Bottom node, holds intervals only.
    Leaf = 1,
    /// Inner node, holds intervals and child pointers.
    Branch = 2,
}

impl NodeType {
    /// Creates a NodeType from its tag byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Leaf),
            2 => Some(Self::Branch),
            _ => None,
        }
    }
}

/// Returns the header size of a node, child table included.
pub fn header_size(node_type: NodeType, max_children: usize) -> usize {
    match node_type {
        NodeType::Leaf => COMMON_HEADER_SIZE,
        NodeType::Branch => COMMON_HEADER_SIZE + CHILD_TABLE_PREFIX + max_children * CHILD_ENTRY_SIZE,
    }
}

/// Pointer from a branch node to one of its children, with the bounds
/// needed to decide whether the child is worth reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEntry {
    /// Sequence number of the child.
    pub seq: SequenceNumber,
    /// Start time of the child.
    pub start: Timestamp,
    /// End time of the child (`Timestamp::MAX` while it is still open).
    pub end: Timestamp,
    /// Latest interval start in the child's subtree.
    pub max_start: Timestamp,
    /// Earliest interval end in the child's subtree.
    pub min_end: Timestamp,
}

impl ChildEntry {
    /// Entry for a child that is still under construction.
    pub fn open(seq: SequenceNumber, start: Timestamp) -> Self {
        Self {
            seq,
            start,
            end: Timestamp::MAX,
            max_start: Timestamp::MAX,
            min_end: Timestamp::MIN,
        }
    }

    /// Returns false if the child's subtree is sealed and holds no interval.
    pub fn has_intervals(&self) -> bool {
        self.max_start >= self.start
    }

    /// Returns true if `time` falls within the child's bounds.
    pub fn contains(&self, time: Timestamp) -> bool {
        self.start <= time && time <= self.end
    }

    /// Returns true if the child's bounds overlap `[start, end]`.
    pub fn intersects(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start <= end && start <= self.end
    }

    fn write_to(&self, writer: &mut SafeBufferWriter<'_>) -> Result<()> {
        writer.put_u32(self.seq)?;
        writer.put_i64(self.start)?;
        writer.put_i64(self.end)?;
        writer.put_i64(self.max_start)?;
        writer.put_i64(self.min_end)
    }

    fn read_from(reader: &mut SafeBufferReader<'_>) -> Result<Self> {
        Ok(Self {
            seq: reader.get_u32()?,
            start: reader.get_i64()?,
            end: reader.get_i64()?,
            max_start: reader.get_i64()?,
            min_end: reader.get_i64()?,
        })
    }
}

/// A history tree node.
///
/// Nodes start under construction and accept intervals (and children, for
/// branches) until [`seal`](Self::seal) is called, after which they are
/// immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct HtNode {
    node_type: NodeType,
    seq: SequenceNumber,
    parent: Option<SequenceNumber>,
    start: Timestamp,
    end: Timestamp,
    sealed: bool,
    block_size: usize,
    child_capacity: usize,
    /// Sorted by start time.
    intervals: Vec<StateInterval>,
    intervals_size: usize,
    children: Vec<ChildEntry>,
    max_start: Timestamp,
    min_end: Timestamp,
}

impl HtNode {
    /// Creates an empty node under construction.
    ///
    /// `max_children` is ignored for leaves.
    pub fn new(
        node_type: NodeType,
        seq: SequenceNumber,
        parent: Option<SequenceNumber>,
        start: Timestamp,
        block_size: usize,
        max_children: usize,
    ) -> Self {
        let child_capacity = match node_type {
            NodeType::Leaf => 0,
            NodeType::Branch => max_children,
        };
        Self {
            node_type,
            seq,
            parent,
            start,
            end: start,
            sealed: false,
            block_size,
            child_capacity,
            intervals: Vec::new(),
            intervals_size: 0,
            children: Vec::with_capacity(child_capacity),
            max_start: Timestamp::MIN,
            min_end: Timestamp::MAX,
        }
    }

    /// Returns the node type.
    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    /// Returns the sequence number.
    pub fn seq(&self) -> SequenceNumber {
        self.seq
    }

    /// Returns the parent's sequence number, `None` for the root.
    pub fn parent(&self) -> Option<SequenceNumber> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: SequenceNumber) {
        self.parent = Some(parent);
    }

    /// Returns the start time.
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Returns the end time: the seal time once sealed, otherwise the latest
    /// interval end seen so far.
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Returns true once the node is immutable.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Returns the block size this node serializes to.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the intervals, sorted by start time.
    pub fn intervals(&self) -> &[StateInterval] {
        &self.intervals
    }

    /// Returns the child table.
    pub fn children(&self) -> &[ChildEntry] {
        &self.children
    }

    /// Returns the number of children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Returns the number of child slots.
    pub fn child_capacity(&self) -> usize {
        self.child_capacity
    }

    /// Returns the sequence number of child `i`.
    pub fn child_seq(&self, i: usize) -> Option<SequenceNumber> {
        self.children.get(i).map(|c| c.seq)
    }

    /// Returns the start time of child `i`.
    pub fn child_start(&self, i: usize) -> Option<Timestamp> {
        self.children.get(i).map(|c| c.start)
    }

    /// Returns the end time of child `i`.
    pub fn child_end(&self, i: usize) -> Option<Timestamp> {
        self.children.get(i).map(|c| c.end)
    }

    /// Returns the latest interval start in the subtree of child `i`.
    pub fn child_max_start(&self, i: usize) -> Option<Timestamp> {
        self.children.get(i).map(|c| c.max_start)
    }

    /// Returns the earliest interval end in the subtree of child `i`.
    pub fn child_min_end(&self, i: usize) -> Option<Timestamp> {
        self.children.get(i).map(|c| c.min_end)
    }

    /// Returns the latest interval start in this node's subtree.
    pub fn max_start(&self) -> Timestamp {
        self.max_start
    }

    /// Returns the earliest interval end in this node's subtree.
    pub fn min_end(&self) -> Timestamp {
        self.min_end
    }

    /// Returns the header size of this node.
    pub fn header_size(&self) -> usize {
        header_size(self.node_type, self.child_capacity)
    }

    /// Returns the number of bytes still available for intervals.
    pub fn free_space(&self) -> usize {
        self.block_size
            .saturating_sub(self.header_size())
            .saturating_sub(self.intervals_size)
    }

    /// Returns the entry describing this node in its parent's child table.
    pub fn child_entry(&self) -> ChildEntry {
        if !self.sealed {
            return ChildEntry::open(self.seq, self.start);
        }
        ChildEntry {
            seq: self.seq,
            start: self.start,
            end: self.end,
            max_start: self.max_start,
            min_end: self.min_end,
        }
    }

    /// Adds an interval, keeping intervals sorted by start.
    ///
    /// # Errors
    ///
    /// - `StateError::NodeSealed` if the node is sealed
    /// - `StateError::TimeRange` if the interval starts before the node
    /// - `StateError::NodeFull` if the interval does not fit the free space
    pub fn add_interval(&mut self, interval: StateInterval) -> Result<()> {
        if self.sealed {
            return Err(StateError::NodeSealed(self.seq));
        }
        if interval.start() < self.start {
            return Err(StateError::TimeRange {
                time: interval.start(),
                start: self.start,
                end: Timestamp::MAX,
            });
        }
        let size = interval.serialized_size();
        let free = self.free_space();
        if size > free {
            return Err(StateError::NodeFull {
                seq: self.seq,
                needed: size,
                free,
            });
        }

        self.max_start = self.max_start.max(interval.start());
        self.min_end = self.min_end.min(interval.end());
        self.end = self.end.max(interval.end());
        let idx = self
            .intervals
            .partition_point(|existing| existing.start() <= interval.start());
        self.intervals.insert(idx, interval);
        self.intervals_size += size;
        Ok(())
    }

    /// Appends a child pointer.
    ///
    /// # Errors
    ///
    /// Returns `StateError::NodeFull` when no child slot is left (always for
    /// leaves) and `StateError::NodeSealed` if the node is sealed.
    pub fn link_child(&mut self, entry: ChildEntry) -> Result<()> {
        if self.sealed {
            return Err(StateError::NodeSealed(self.seq));
        }
        if self.children.len() >= self.child_capacity {
            return Err(StateError::NodeFull {
                seq: self.seq,
                needed: 1,
                free: 0,
            });
        }
        self.children.push(entry);
        Ok(())
    }

    /// Replaces the entry of a child that has just been sealed and folds its
    /// subtree statistics into this node.
    pub fn update_child(&mut self, entry: ChildEntry) -> Result<()> {
        if self.sealed {
            return Err(StateError::NodeSealed(self.seq));
        }
        let slot = self
            .children
            .iter_mut()
            .rev()
            .find(|c| c.seq == entry.seq)
            .ok_or_else(|| {
                StateError::corrupt(format!("node {} has no child {}", self.seq, entry.seq))
            })?;
        *slot = entry;
        if entry.has_intervals() {
            self.max_start = self.max_start.max(entry.max_start);
            self.min_end = self.min_end.min(entry.min_end);
        }
        self.end = self.end.max(entry.end);
        Ok(())
    }

    /// Seals the node at `end`.
    ///
    /// A node opened after the last interval it could hold covers only its
    /// start tick, so the recorded end never precedes the start.
    pub fn seal(&mut self, end: Timestamp) -> Result<()> {
        if self.sealed {
            return Err(StateError::NodeSealed(self.seq));
        }
        self.end = self.end.max(end);
        self.sealed = true;
        Ok(())
    }

    /// Returns the interval of `quark` that contains `time`, if this node
    /// holds it.
    pub fn find_interval(&self, quark: Quark, time: Timestamp) -> Option<&StateInterval> {
        let upto = self.intervals.partition_point(|i| i.start() <= time);
        self.intervals[..upto]
            .iter()
            .find(|i| i.quark() == quark && i.end() >= time)
    }

    /// Returns every interval of this node that contains `time`.
    pub fn intervals_at(&self, time: Timestamp) -> impl Iterator<Item = &StateInterval> + '_ {
        let upto = self.intervals.partition_point(|i| i.start() <= time);
        self.intervals[..upto].iter().filter(move |i| i.end() >= time)
    }

    /// Returns every interval of this node overlapping `[start, end]`.
    pub fn intervals_overlapping(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> impl Iterator<Item = &StateInterval> + '_ {
        let upto = self.intervals.partition_point(|i| i.start() <= end);
        self.intervals[..upto].iter().filter(move |i| i.end() >= start)
    }

    /// Returns the child to descend into for a point query at `time`: the
    /// latest-starting child whose bounds contain `time`.
    pub fn latest_child_at(&self, time: Timestamp) -> Option<&ChildEntry> {
        let upto = self.children.partition_point(|c| c.start <= time);
        self.children[..upto].iter().rev().find(|c| c.end >= time)
    }

    /// Serializes the node into `block`, which must be exactly
    /// `block_size` bytes long.
    pub fn serialize(&self, block: &mut [u8]) -> Result<()> {
        if block.len() != self.block_size {
            return Err(StateError::OutOfBounds {
                position: 0,
                requested: self.block_size,
                limit: block.len(),
            });
        }
        block.fill(0);

        let mut writer = SafeBufferWriter::new(block);
        writer.put_u8(self.node_type as u8)?;
        writer.put_bool(self.sealed)?;
        writer.put_u32(self.seq)?;
        writer.put_u32(self.parent.unwrap_or(NO_PARENT))?;
        writer.put_i64(self.start)?;
        writer.put_i64(self.end)?;
        writer.put_u32(self.intervals.len() as u32)?;
        writer.put_u32(self.intervals_size as u32)?;
        writer.put_i64(self.max_start)?;
        writer.put_i64(self.min_end)?;
        writer.put_u32(0)?;

        if self.node_type == NodeType::Branch {
            writer.put_u32(self.child_capacity as u32)?;
            writer.put_u32(self.children.len() as u32)?;
            for child in &self.children {
                child.write_to(&mut writer)?;
            }
            writer.skip((self.child_capacity - self.children.len()) * CHILD_ENTRY_SIZE)?;
        }

        for interval in &self.intervals {
            interval.write_to(&mut writer)?;
        }

        drop(writer);
        let crc = block_checksum(block);
        let mut writer = SafeBufferWriter::new(block);
        writer.set_position(CRC_OFFSET)?;
        writer.put_u32(crc)
    }

    /// Rebuilds a node from a block written by [`serialize`](Self::serialize).
    ///
    /// # Errors
    ///
    /// Returns `StateError::ChecksumMismatch` if the block checksum does not
    /// match and `StateError::CorruptFile` for inconsistent header fields.
    pub fn deserialize(block: &[u8]) -> Result<Self> {
        if block.len() < COMMON_HEADER_SIZE {
            return Err(StateError::corrupt(format!(
                "node block of {} bytes is smaller than a node header",
                block.len()
            )));
        }
        let mut reader = SafeBufferReader::new(block);
        let tag = reader.get_u8()?;
        let node_type = NodeType::from_u8(tag)
            .ok_or_else(|| StateError::corrupt(format!("unknown node type {tag}")))?;
        let sealed = reader.get_bool()?;
        let seq = reader.get_u32()?;
        let parent = match reader.get_u32()? {
            NO_PARENT => None,
            parent => Some(parent),
        };
        let start = reader.get_i64()?;
        let end = reader.get_i64()?;
        let interval_count = reader.get_u32()? as usize;
        let intervals_size = reader.get_u32()? as usize;
        let max_start = reader.get_i64()?;
        let min_end = reader.get_i64()?;
        let stored_crc = reader.get_u32()?;

        let actual_crc = block_checksum(block);
        if stored_crc != actual_crc {
            return Err(StateError::ChecksumMismatch {
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        let mut child_capacity = 0;
        let mut children = Vec::new();
        if node_type == NodeType::Branch {
            child_capacity = reader.get_u32()? as usize;
            let child_count = reader.get_u32()? as usize;
            if child_count > child_capacity {
                return Err(StateError::corrupt(format!(
                    "node {seq} lists {child_count} children for {child_capacity} slots"
                )));
            }
            let mut table = reader.sub_reader(
                child_capacity
                    .checked_mul(CHILD_ENTRY_SIZE)
                    .ok_or_else(|| StateError::corrupt("child table size overflow"))?,
            )?;
            children.reserve(child_count);
            for _ in 0..child_count {
                children.push(ChildEntry::read_from(&mut table)?);
            }
        }

        let mut section = reader.sub_reader(intervals_size)?;
        let mut intervals = Vec::with_capacity(interval_count.min(intervals_size));
        for _ in 0..interval_count {
            intervals.push(StateInterval::read_from(&mut section)?);
        }
        if section.remaining() != 0 {
            return Err(StateError::corrupt(format!(
                "node {seq} declares {intervals_size} interval bytes, {} unused",
                section.remaining()
            )));
        }

        Ok(Self {
            node_type,
            seq,
            parent,
            start,
            end,
            sealed,
            block_size: block.len(),
            child_capacity,
            intervals,
            intervals_size,
            children,
            max_start,
            min_end,
        })
    }
}

fn block_checksum(block: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&block[..CRC_OFFSET]);
    hasher.update(&block[CRC_OFFSET + 4..]);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::value::StateValue;

    const LONG_INTERVAL_SIZE: usize = 29;

    fn long_interval(start: i64, end: i64, quark: Quark) -> StateInterval {
        StateInterval::new(start, end, quark, StateValue::Long(start)).unwrap()
    }

    fn roundtrip(node: &HtNode) -> HtNode {
        let mut block = vec![0u8; node.block_size()];
        node.serialize(&mut block).unwrap();
        HtNode::deserialize(&block).unwrap()
    }

    #[test]
    fn test_leaf_capacity_is_exact() {
        let block_size = COMMON_HEADER_SIZE + 3 * LONG_INTERVAL_SIZE;
        let mut node = HtNode::new(NodeType::Leaf, 0, None, 0, block_size, 0);
        for q in 1..=3 {
            node.add_interval(long_interval(0, 9, q)).unwrap();
        }
        assert_eq!(node.free_space(), 0);
        assert!(matches!(
            node.add_interval(long_interval(10, 19, 1)),
            Err(StateError::NodeFull { seq: 0, needed: 29, free: 0 })
        ));
    }

    #[test]
    fn test_sealed_node_rejects_intervals() {
        let mut node = HtNode::new(NodeType::Leaf, 4, Some(1), 0, 256, 0);
        node.seal(10).unwrap();
        assert!(matches!(
            node.add_interval(long_interval(0, 5, 1)),
            Err(StateError::NodeSealed(4))
        ));
        assert!(node.seal(20).is_err());
    }

    #[test]
    fn test_interval_before_node_start() {
        let mut node = HtNode::new(NodeType::Leaf, 0, None, 100, 256, 0);
        assert!(matches!(
            node.add_interval(long_interval(50, 150, 1)),
            Err(StateError::TimeRange { time: 50, start: 100, .. })
        ));
    }

    #[test]
    fn test_intervals_kept_sorted_by_start() {
        let mut node = HtNode::new(NodeType::Leaf, 0, None, 0, 1024, 0);
        node.add_interval(long_interval(20, 29, 1)).unwrap();
        node.add_interval(long_interval(0, 29, 2)).unwrap();
        node.add_interval(long_interval(10, 30, 3)).unwrap();
        let starts: Vec<_> = node.intervals().iter().map(|i| i.start()).collect();
        assert_eq!(starts, vec![0, 10, 20]);
        assert_eq!(node.max_start(), 20);
        assert_eq!(node.min_end(), 29);
        assert_eq!(node.find_interval(3, 25).unwrap().start(), 10);
        assert!(node.find_interval(1, 15).is_none());
        assert_eq!(node.intervals_at(29).count(), 3);
        assert_eq!(node.intervals_overlapping(0, 5).count(), 1);
    }

    #[test]
    fn test_roundtrip_empty_leaf() {
        let node = HtNode::new(NodeType::Leaf, 0, None, 0, 128, 0);
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn test_roundtrip_full_branch() {
        let block_size = header_size(NodeType::Branch, 3) + 2 * LONG_INTERVAL_SIZE;
        let mut node = HtNode::new(NodeType::Branch, 7, Some(9), 0, block_size, 3);
        node.add_interval(long_interval(0, 40, 1)).unwrap();
        node.add_interval(long_interval(5, 40, 2)).unwrap();
        for (i, start) in [0i64, 11, 21].iter().enumerate() {
            node.link_child(ChildEntry::open(i as u32, *start)).unwrap();
        }
        node.update_child(ChildEntry {
            seq: 0,
            start: 0,
            end: 10,
            max_start: 4,
            min_end: 3,
        })
        .unwrap();
        assert!(node.link_child(ChildEntry::open(5, 30)).is_err());
        node.seal(40).unwrap();
        assert_eq!(node.free_space(), 0);

        let copy = roundtrip(&node);
        assert_eq!(copy, node);
        assert_eq!(copy.child_end(0), Some(10));
        assert_eq!(copy.child_min_end(0), Some(3));
        assert_eq!(copy.child_max_start(0), Some(4));
        assert_eq!(copy.min_end(), 3);
        assert_eq!(copy.child_start(2), Some(21));
        assert_eq!(copy.child_seq(3), None);
    }

    #[test]
    fn test_roundtrip_typical_leaf_with_strings() {
        let mut node = HtNode::new(NodeType::Leaf, 3, Some(1), 1_000, 4096, 0);
        for i in 0..20 {
            let value = if i % 2 == 0 {
                StateValue::from(format!("thread-{i}"))
            } else {
                StateValue::Double(i as f64 / 3.0)
            };
            let interval = StateInterval::new(1_000 + i, 2_000 + i, i as u32, value).unwrap();
            node.add_interval(interval).unwrap();
        }
        node.seal(5_000).unwrap();
        assert_eq!(roundtrip(&node), node);
    }

    #[test]
    fn test_corrupted_block_is_detected() {
        let mut node = HtNode::new(NodeType::Leaf, 0, None, 0, 256, 0);
        node.add_interval(long_interval(0, 9, 1)).unwrap();
        let mut block = vec![0u8; 256];
        node.serialize(&mut block).unwrap();
        block[COMMON_HEADER_SIZE + 3] ^= 0xFF;
        let err = HtNode::deserialize(&block).unwrap_err();
        assert!(matches!(err, StateError::ChecksumMismatch { .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_latest_child_prefers_later_start() {
        let block_size = header_size(NodeType::Branch, 4) + 64;
        let mut node = HtNode::new(NodeType::Branch, 0, None, 0, block_size, 4);
        let entries = [
            ChildEntry { seq: 1, start: 0, end: 9, max_start: 5, min_end: 2 },
            ChildEntry { seq: 2, start: 10, end: 10, max_start: i64::MIN, min_end: i64::MAX },
            ChildEntry::open(3, 10),
        ];
        for entry in entries {
            node.link_child(entry).unwrap();
        }
        assert_eq!(node.latest_child_at(9).unwrap().seq, 1);
        assert_eq!(node.latest_child_at(10).unwrap().seq, 3);
        assert!(!node.children()[1].has_intervals());
        assert!(node.children()[2].has_intervals());
    }
}
