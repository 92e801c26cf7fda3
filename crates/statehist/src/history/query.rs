//! Query algorithms over a history tree.
//!
//! The algorithms only need to fetch nodes by sequence number, so they run
//! unchanged against the tree under construction ([`HistoryTreeWriter`]) and
//! the sealed file ([`HistoryTreeReader`]).
//!
//! [`HistoryTreeWriter`]: crate::history::HistoryTreeWriter
//! [`HistoryTreeReader`]: crate::history::HistoryTreeReader

use crate::attribute::Quark;
use crate::error::{Result, StateError};
use crate::history::interval::StateInterval;
use crate::history::node::HtNode;
use crate::history::{SequenceNumber, TimeRange, Timestamp};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

/// A node fetched from a [`NodeSource`].
#[derive(Debug)]
pub enum NodeHandle<'a> {
    /// Node owned by the source (under construction).
    Borrowed(&'a HtNode),
    /// Node decoded for this access.
    Owned(HtNode),
    /// Node shared with a cache.
    Shared(Arc<HtNode>),
}

impl Deref for NodeHandle<'_> {
    type Target = HtNode;

    fn deref(&self) -> &HtNode {
        match self {
            Self::Borrowed(node) => node,
            Self::Owned(node) => node,
            Self::Shared(node) => node,
        }
    }
}

/// Access to the nodes of a history tree.
pub trait NodeSource {
    /// Returns the sequence number of the root node.
    fn root_seq(&self) -> SequenceNumber;

    /// Returns the time range covered by the tree.
    fn time_range(&self) -> TimeRange;

    /// Fetches node `seq`.
    fn node(&self, seq: SequenceNumber) -> Result<NodeHandle<'_>>;
}

/// Cooperative cancellation flag for long-running queries.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// Creates a flag that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    /// Returns true once [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }
}

fn check_time<S: NodeSource + ?Sized>(source: &S, time: Timestamp) -> Result<()> {
    let range = source.time_range();
    if !range.contains(time) {
        return Err(StateError::TimeRange {
            time,
            start: range.start,
            end: range.end,
        });
    }
    Ok(())
}

/// Finds the interval of `quark` that contains `time`.
///
/// Descends from the root, at each level into the latest-starting child
/// that contains `time`. Returns `Ok(None)` if no stored interval matches.
pub fn query_point<S: NodeSource + ?Sized>(
    source: &S,
    quark: Quark,
    time: Timestamp,
) -> Result<Option<StateInterval>> {
    check_time(source, time)?;
    let mut seq = source.root_seq();
    loop {
        let node = source.node(seq)?;
        if let Some(interval) = node.find_interval(quark, time) {
            return Ok(Some(interval.clone()));
        }
        match node.latest_child_at(time) {
            Some(child) if child.has_intervals() => seq = child.seq,
            _ => return Ok(None),
        }
    }
}

/// Returns every stored interval that contains `time`, one per attribute.
pub fn query_full<S: NodeSource + ?Sized>(source: &S, time: Timestamp) -> Result<Vec<StateInterval>> {
    check_time(source, time)?;
    let mut found = Vec::new();
    let mut seq = source.root_seq();
    loop {
        let node = source.node(seq)?;
        found.extend(node.intervals_at(time).cloned());
        match node.latest_child_at(time) {
            Some(child) if child.has_intervals() => seq = child.seq,
            _ => return Ok(found),
        }
    }
}

/// Outcome of a cancellable range query.
#[derive(Debug, Clone, Default)]
pub struct RangeQueryResult {
    /// Intervals found, ordered by start time.
    pub intervals: Vec<StateInterval>,
    /// True if the query stopped early; `intervals` is then a prefix.
    pub cancelled: bool,
}

/// Range query over one attribute or all attributes.
///
/// The query is a description; every call to [`iter`](Self::iter) restarts
/// it from the root.
#[derive(Debug)]
pub struct RangeQuery<'a, S: ?Sized> {
    source: &'a S,
    quark: Option<Quark>,
    range: TimeRange,
}

impl<'a, S: NodeSource + ?Sized> RangeQuery<'a, S> {
    /// Creates a query for intervals overlapping `[start, end]`, restricted
    /// to `quark` when given.
    ///
    /// The range is clamped to the time range of the tree.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimeRange` if `start > end` or if the range does
    /// not overlap the tree at all.
    pub fn new(source: &'a S, quark: Option<Quark>, start: Timestamp, end: Timestamp) -> Result<Self> {
        let covered = source.time_range();
        if start > end {
            return Err(StateError::TimeRange {
                time: end,
                start,
                end: Timestamp::MAX,
            });
        }
        let range = covered.clamp(start, end).ok_or(StateError::TimeRange {
            time: if start > covered.end { start } else { end },
            start: covered.start,
            end: covered.end,
        })?;
        Ok(Self {
            source,
            quark,
            range,
        })
    }

    /// Returns the effective (clamped) range.
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Returns a lazy iterator over the matching intervals.
    pub fn iter(&self) -> RangeQueryIter<'a, S> {
        RangeQueryIter::new(self.source, self.quark, self.range, None)
    }

    /// Returns a lazy iterator that stops once `cancel` is triggered.
    pub fn iter_with_cancel(&self, cancel: Cancellation) -> RangeQueryIter<'a, S> {
        RangeQueryIter::new(self.source, self.quark, self.range, Some(cancel))
    }

    /// Collects the query into a [`RangeQueryResult`].
    ///
    /// # Errors
    ///
    /// Returns the first error raised while reading nodes.
    pub fn run(&self, cancel: Option<Cancellation>) -> Result<RangeQueryResult> {
        let mut iter = RangeQueryIter::new(self.source, self.quark, self.range, cancel);
        let mut intervals = Vec::new();
        for interval in iter.by_ref() {
            intervals.push(interval?);
        }
        Ok(RangeQueryResult {
            intervals,
            cancelled: iter.was_cancelled(),
        })
    }
}

struct Ready {
    interval: StateInterval,
    order: u64,
}

impl Ready {
    fn key(&self) -> (Timestamp, Timestamp, Quark, u64) {
        (
            self.interval.start(),
            self.interval.end(),
            self.interval.quark(),
            self.order,
        )
    }
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Lazy iterator over the results of a [`RangeQuery`].
///
/// Intervals come out ordered by start time. Nodes are only read when the
/// next interval could come from them. A node read failure is yielded once,
/// then the iterator is exhausted.
pub struct RangeQueryIter<'a, S: ?Sized> {
    source: &'a S,
    quark: Option<Quark>,
    range: TimeRange,
    cancel: Option<Cancellation>,
    /// Nodes still to visit, keyed by start time.
    pending: BinaryHeap<Reverse<(Timestamp, SequenceNumber)>>,
    ready: BinaryHeap<Reverse<Ready>>,
    next_order: u64,
    cancelled: bool,
    done: bool,
}

impl<'a, S: NodeSource + ?Sized> RangeQueryIter<'a, S> {
    fn new(source: &'a S, quark: Option<Quark>, range: TimeRange, cancel: Option<Cancellation>) -> Self {
        let mut pending = BinaryHeap::new();
        pending.push(Reverse((Timestamp::MIN, source.root_seq())));
        Self {
            source,
            quark,
            range,
            cancel,
            pending,
            ready: BinaryHeap::new(),
            next_order: 0,
            cancelled: false,
            done: false,
        }
    }

    /// Returns true if the iterator stopped because of cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn visit(&mut self, seq: SequenceNumber) -> Result<()> {
        let node = self.source.node(seq)?;
        for interval in node.intervals_overlapping(self.range.start, self.range.end) {
            if self.quark.map_or(true, |quark| interval.quark() == quark) {
                self.ready.push(Reverse(Ready {
                    interval: interval.clone(),
                    order: self.next_order,
                }));
                self.next_order += 1;
            }
        }
        for child in node.children() {
            if child.has_intervals() && child.intersects(self.range.start, self.range.end) {
                self.pending.push(Reverse((child.start, child.seq)));
            }
        }
        Ok(())
    }
}

impl<S: NodeSource + ?Sized> Iterator for RangeQueryIter<'_, S> {
    type Item = Result<StateInterval>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            let next_node_start = self.pending.peek().map(|Reverse((start, _))| *start);
            if let Some(Reverse(top)) = self.ready.peek() {
                if next_node_start.map_or(true, |start| top.interval.start() <= start) {
                    return self.ready.pop().map(|Reverse(ready)| Ok(ready.interval));
                }
            }

            let Some(Reverse((_, seq))) = self.pending.pop() else {
                self.done = true;
                return None;
            };
            if self.cancel.as_ref().is_some_and(Cancellation::is_cancelled) {
                self.cancelled = true;
                self.done = true;
                return None;
            }
            if let Err(err) = self.visit(seq) {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::node::{header_size, ChildEntry, NodeType};
    use crate::history::value::StateValue;

    struct MemorySource {
        nodes: Vec<HtNode>,
        root: SequenceNumber,
        range: TimeRange,
    }

    impl NodeSource for MemorySource {
        fn root_seq(&self) -> SequenceNumber {
            self.root
        }

        fn time_range(&self) -> TimeRange {
            self.range
        }

        fn node(&self, seq: SequenceNumber) -> Result<NodeHandle<'_>> {
            self.nodes
                .get(seq as usize)
                .map(NodeHandle::Borrowed)
                .ok_or_else(|| StateError::corrupt(format!("no node {seq}")))
        }
    }

    fn interval(start: i64, end: i64, quark: Quark, value: i32) -> StateInterval {
        StateInterval::new(start, end, quark, StateValue::Int(value)).unwrap()
    }

    /// Root [0, 30] holding a long interval, leaves [0, 10] and [11, 30].
    fn two_leaf_tree() -> MemorySource {
        let block = header_size(NodeType::Branch, 4) + 256;
        let mut left = HtNode::new(NodeType::Leaf, 0, Some(2), 0, block, 4);
        left.add_interval(interval(0, 4, 1, 10)).unwrap();
        left.add_interval(interval(0, 9, 2, 20)).unwrap();
        left.add_interval(interval(5, 10, 1, 11)).unwrap();
        left.seal(10).unwrap();

        let mut right = HtNode::new(NodeType::Leaf, 1, Some(2), 11, block, 4);
        right.add_interval(interval(11, 30, 1, 12)).unwrap();
        right.seal(30).unwrap();

        let mut root = HtNode::new(NodeType::Branch, 2, None, 0, block, 4);
        root.add_interval(interval(10, 30, 2, 21)).unwrap();
        root.link_child(ChildEntry::open(0, 0)).unwrap();
        root.update_child(left.child_entry()).unwrap();
        root.link_child(ChildEntry::open(1, 11)).unwrap();
        root.update_child(right.child_entry()).unwrap();
        root.seal(30).unwrap();

        MemorySource {
            nodes: vec![left, right, root],
            root: 2,
            range: TimeRange::new(0, 30),
        }
    }

    #[test]
    fn test_point_query_descends_to_latest_child() {
        let tree = two_leaf_tree();
        assert_eq!(query_point(&tree, 1, 4).unwrap().unwrap().value(), &StateValue::Int(10));
        assert_eq!(query_point(&tree, 1, 10).unwrap().unwrap().value(), &StateValue::Int(11));
        assert_eq!(query_point(&tree, 1, 11).unwrap().unwrap().value(), &StateValue::Int(12));
        assert_eq!(query_point(&tree, 2, 10).unwrap().unwrap().start(), 10);
        assert!(query_point(&tree, 7, 10).unwrap().is_none());
        assert!(matches!(
            query_point(&tree, 1, 31),
            Err(StateError::TimeRange { time: 31, .. })
        ));
    }

    #[test]
    fn test_full_query_returns_one_interval_per_attribute() {
        let tree = two_leaf_tree();
        let mut full = query_full(&tree, 20).unwrap();
        full.sort_by_key(StateInterval::quark);
        let values: Vec<_> = full.iter().map(|i| i.value().clone()).collect();
        assert_eq!(values, vec![StateValue::Int(12), StateValue::Int(21)]);
    }

    #[test]
    fn test_range_query_is_ordered_by_start() {
        let tree = two_leaf_tree();
        let query = RangeQuery::new(&tree, None, 0, 30).unwrap();
        let starts: Vec<_> = query.iter().map(|i| i.unwrap().start()).collect();
        assert_eq!(starts, vec![0, 0, 5, 10, 11]);

        let only_one: Vec<_> = RangeQuery::new(&tree, Some(1), 3, 12)
            .unwrap()
            .iter()
            .map(|i| i.unwrap().start())
            .collect();
        assert_eq!(only_one, vec![0, 5, 11]);
    }

    #[test]
    fn test_range_query_is_restartable_and_clamped() {
        let tree = two_leaf_tree();
        let query = RangeQuery::new(&tree, Some(2), -100, 1_000).unwrap();
        assert_eq!(query.range(), TimeRange::new(0, 30));
        assert_eq!(query.iter().count(), 2);
        assert_eq!(query.iter().count(), 2);

        assert!(RangeQuery::new(&tree, None, 40, 50).is_err());
        assert!(RangeQuery::new(&tree, None, 20, 10).is_err());
    }

    #[test]
    fn test_range_query_stops_when_cancelled() {
        let tree = two_leaf_tree();
        let cancel = Cancellation::new();
        let query = RangeQuery::new(&tree, None, 0, 30).unwrap();
        let mut iter = query.iter_with_cancel(cancel.clone());
        assert!(iter.next().is_some());
        cancel.cancel();
        let rest: Vec<_> = iter.by_ref().collect();
        assert!(iter.was_cancelled());
        assert!(rest.len() < 4);

        let result = query.run(Some(cancel)).unwrap();
        assert!(result.cancelled);
        assert!(result.intervals.is_empty());
    }

    #[test]
    fn test_missing_node_is_reported_once() {
        let mut tree = two_leaf_tree();
        tree.nodes.truncate(2);
        tree.root = 5;
        let mut iter = RangeQuery::new(&tree, None, 0, 30).unwrap().iter();
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }
}
