//! History tree: the on-disk interval index.
//!
//! # Components
//!
//! - [`StateValue`] / [`StateInterval`]: the stored records
//! - [`HtNode`]: fixed-size LEAF/BRANCH node with its serialized form
//! - [`HistoryTreeWriter`]: append-only build phase
//! - [`HistoryTreeReader`]: sealed, memory-mapped query phase
//! - [`NodeSource`] / [`RangeQuery`]: query algorithms shared by both phases
//!
//! Nodes reference each other by [`SequenceNumber`]. A node lives in the
//! file at `HEADER_SIZE + seq * block_size`, so following a child pointer is
//! one offset computation.

pub mod file;
pub mod interval;
pub mod node;
pub mod query;
pub mod reader;
pub mod tree;
pub mod value;

pub use file::{HistoryHeader, HEADER_SIZE, HISTORY_MAGIC, HISTORY_VERSION};
pub use interval::StateInterval;
pub use node::{ChildEntry, HtNode, NodeType};
pub use query::{Cancellation, NodeHandle, NodeSource, RangeQuery, RangeQueryIter, RangeQueryResult};
pub use reader::HistoryTreeReader;
pub use tree::{HistoryTreeConfig, HistoryTreeWriter};
pub use value::{StateValue, ValueType};

/// Timestamp in the caller's resolution (nanoseconds recommended).
pub type Timestamp = i64;

/// Position of a node in the history file.
pub type SequenceNumber = u32;

/// Inclusive time range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// First timestamp of the range.
    pub start: Timestamp,
    /// Last timestamp of the range.
    pub end: Timestamp,
}

impl TimeRange {
    /// Creates a new time range.
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if `time` falls within the range.
    pub fn contains(&self, time: Timestamp) -> bool {
        self.start <= time && time <= self.end
    }

    /// Returns true if the range overlaps `[start, end]`.
    pub fn intersects(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start <= end && start <= self.end
    }

    /// Returns the overlap with `[start, end]`, if any.
    pub fn clamp(&self, start: Timestamp, end: Timestamp) -> Option<Self> {
        let clamped = Self::new(start.max(self.start), end.min(self.end));
        (clamped.start <= clamped.end).then_some(clamped)
    }
}
