//! Ongoing (not yet closed) interval of every attribute.

use crate::attribute::{Quark, ROOT_QUARK};
use crate::error::{Result, StateError};
use crate::history::{HistoryTreeWriter, StateInterval, StateValue, Timestamp};

/// Current value and start time of every attribute.
///
/// Attributes that were never written hold `Null` since the start of the
/// state system. The table grows lazily as quarks are written.
#[derive(Debug, Clone)]
pub(crate) struct TransientState {
    start_time: Timestamp,
    values: Vec<StateValue>,
    start_times: Vec<Timestamp>,
}

impl TransientState {
    pub(crate) fn new(start_time: Timestamp) -> Self {
        Self {
            start_time,
            values: Vec::new(),
            start_times: Vec::new(),
        }
    }

    fn ensure(&mut self, quark: Quark) {
        let len = quark as usize + 1;
        if self.values.len() < len {
            self.values.resize(len, StateValue::Null);
            self.start_times.resize(len, self.start_time);
        }
    }

    pub(crate) fn ongoing_value(&self, quark: Quark) -> StateValue {
        self.values.get(quark as usize).cloned().unwrap_or_default()
    }

    pub(crate) fn ongoing_start(&self, quark: Quark) -> Timestamp {
        self.start_times
            .get(quark as usize)
            .copied()
            .unwrap_or(self.start_time)
    }

    /// Returns the ongoing interval of `quark` as if it ended at `end`.
    pub(crate) fn ongoing_interval(&self, quark: Quark, end: Timestamp) -> Result<StateInterval> {
        let start = self.ongoing_start(quark);
        StateInterval::new(start, end.max(start), quark, self.ongoing_value(quark))
    }

    /// Checks that `value` can be stored in `tree` once its interval closes.
    pub(crate) fn check_value_size(tree: &HistoryTreeWriter, value: &StateValue) -> Result<()> {
        let size = StateInterval::serialized_size_with(value);
        let capacity = tree.config().max_interval_size();
        if size > capacity {
            return Err(StateError::IntervalTooLarge { size, capacity });
        }
        Ok(())
    }

    /// Applies changes that all happen at `time`: either every change is
    /// applied or, on error, none is.
    pub(crate) fn apply_changes(
        &mut self,
        tree: &mut HistoryTreeWriter,
        time: Timestamp,
        changes: Vec<(Quark, StateValue)>,
    ) -> Result<()> {
        for (quark, value) in &changes {
            let start = self.ongoing_start(*quark);
            if time < start {
                return Err(StateError::TimeRange {
                    time,
                    start,
                    end: Timestamp::MAX,
                });
            }
            // Closing the ongoing interval writes it at time - 1.
            if time > start && time - 1 < tree.end() {
                return Err(StateError::TimeRange {
                    time: time - 1,
                    start: tree.start(),
                    end: tree.end(),
                });
            }
            Self::check_value_size(tree, value)?;
        }
        for (quark, value) in changes {
            self.process_change(tree, time, quark, value)?;
        }
        Ok(())
    }

    /// Closes the ongoing interval of `quark` right before `time` and starts
    /// a new one holding `value`.
    ///
    /// A change at the start time of the ongoing interval replaces its value
    /// instead of storing an empty interval.
    pub(crate) fn process_change(
        &mut self,
        tree: &mut HistoryTreeWriter,
        time: Timestamp,
        quark: Quark,
        value: StateValue,
    ) -> Result<()> {
        self.ensure(quark);
        let idx = quark as usize;
        let start = self.start_times[idx];
        if time < start {
            return Err(StateError::TimeRange {
                time,
                start,
                end: Timestamp::MAX,
            });
        }
        if time > start {
            let interval = StateInterval::new(start, time - 1, quark, self.values[idx].clone())?;
            tree.insert(interval)?;
            self.start_times[idx] = time;
        }
        self.values[idx] = value;
        Ok(())
    }

    /// Replaces the value of the ongoing interval without closing it.
    pub(crate) fn update_ongoing(&mut self, quark: Quark, value: StateValue) {
        self.ensure(quark);
        self.values[quark as usize] = value;
    }

    /// Closes every ongoing interval at `end`. `quark_count` includes the
    /// root quark, which holds no state.
    ///
    /// Nothing is inserted unless every attribute can be closed at `end`.
    pub(crate) fn close_all(
        &mut self,
        tree: &mut HistoryTreeWriter,
        end: Timestamp,
        quark_count: usize,
    ) -> Result<()> {
        if quark_count > 0 {
            self.ensure(quark_count as Quark - 1);
        }
        if let Some(&latest) = self.start_times.iter().skip(1).max() {
            if end < latest {
                return Err(StateError::TimeRange {
                    time: end,
                    start: latest,
                    end: Timestamp::MAX,
                });
            }
        }
        for quark in 0..quark_count as Quark {
            if quark == ROOT_QUARK {
                continue;
            }
            let interval = self.ongoing_interval(quark, end)?;
            tree.insert(interval)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::query::query_point;
    use crate::history::HistoryTreeConfig;
    use tempfile::TempDir;

    fn tree(dir: &TempDir) -> HistoryTreeWriter {
        let config = HistoryTreeConfig::default().with_block_size(4096);
        HistoryTreeWriter::create(&dir.path().join("ht"), 0, config).unwrap()
    }

    #[test]
    fn test_change_flushes_previous_interval() {
        let dir = TempDir::new().unwrap();
        let mut tree = tree(&dir);
        let mut state = TransientState::new(0);
        state.process_change(&mut tree, 10, 1, StateValue::Int(1)).unwrap();
        state.process_change(&mut tree, 20, 1, StateValue::Int(2)).unwrap();

        let first = query_point(&tree, 1, 5).unwrap().unwrap();
        assert_eq!((first.start(), first.end()), (0, 9));
        assert!(first.value().is_null());
        assert_eq!(query_point(&tree, 1, 15).unwrap().unwrap().value(), &StateValue::Int(1));
        assert_eq!(state.ongoing_start(1), 20);
        assert_eq!(state.ongoing_value(1), StateValue::Int(2));
    }

    #[test]
    fn test_same_timestamp_replaces_value() {
        let dir = TempDir::new().unwrap();
        let mut tree = tree(&dir);
        let mut state = TransientState::new(0);
        state.process_change(&mut tree, 0, 1, StateValue::Int(1)).unwrap();
        state.process_change(&mut tree, 0, 1, StateValue::Int(2)).unwrap();
        assert_eq!(tree.node_count(), 1);
        assert!(tree.latest_branch()[0].intervals().is_empty());
        assert_eq!(state.ongoing_value(1), StateValue::Int(2));
    }

    #[test]
    fn test_backward_write_is_rejected_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let mut tree = tree(&dir);
        let mut state = TransientState::new(0);
        state.process_change(&mut tree, 10, 1, StateValue::Int(2)).unwrap();
        assert!(matches!(
            state.process_change(&mut tree, 5, 1, StateValue::Int(9)),
            Err(StateError::TimeRange { time: 5, start: 10, .. })
        ));
        assert_eq!(state.ongoing_value(1), StateValue::Int(2));
    }

    #[test]
    fn test_failed_batch_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let mut tree = tree(&dir);
        let mut state = TransientState::new(0);
        state.process_change(&mut tree, 10, 1, StateValue::Int(1)).unwrap();
        state.process_change(&mut tree, 15, 2, StateValue::Int(2)).unwrap();
        let written = tree.latest_branch()[0].intervals().len();

        let changes = vec![(1, StateValue::Null), (2, StateValue::Null)];
        assert!(matches!(
            state.apply_changes(&mut tree, 10, changes),
            Err(StateError::TimeRange { time: 10, start: 15, .. })
        ));
        assert_eq!(state.ongoing_value(1), StateValue::Int(1));
        assert_eq!(state.ongoing_value(2), StateValue::Int(2));
        assert_eq!(tree.latest_branch()[0].intervals().len(), written);
    }

    #[test]
    fn test_change_behind_tree_end_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut tree = tree(&dir);
        let mut state = TransientState::new(0);
        state.process_change(&mut tree, 50, 2, StateValue::Int(7)).unwrap();
        assert!(matches!(
            state.apply_changes(&mut tree, 20, vec![(1, StateValue::Int(1))]),
            Err(StateError::TimeRange { time: 19, end: 49, .. })
        ));
        assert_eq!(state.ongoing_value(1), StateValue::Null);
        assert_eq!(state.ongoing_start(1), 0);
    }

    #[test]
    fn test_oversized_value_is_rejected_up_front() {
        let dir = TempDir::new().unwrap();
        let mut tree = tree(&dir);
        let mut state = TransientState::new(0);
        let big = StateValue::from("x".repeat(5_000));
        assert!(matches!(
            state.apply_changes(&mut tree, 0, vec![(1, big)]),
            Err(StateError::IntervalTooLarge { size: 5_023, .. })
        ));
        assert_eq!(state.ongoing_value(1), StateValue::Null);
    }

    #[test]
    fn test_unknown_quarks_are_null_since_start() {
        let state = TransientState::new(-5);
        assert_eq!(state.ongoing_value(42), StateValue::Null);
        let interval = state.ongoing_interval(42, -10).unwrap();
        assert_eq!((interval.start(), interval.end()), (-5, -5));
    }

    #[test]
    fn test_close_all_checks_before_inserting() {
        let dir = TempDir::new().unwrap();
        let mut tree = tree(&dir);
        let mut state = TransientState::new(0);
        state.process_change(&mut tree, 50, 2, StateValue::Int(7)).unwrap();
        let before = tree.latest_branch()[0].intervals().len();
        assert!(state.close_all(&mut tree, 40, 3).is_err());
        assert_eq!(tree.latest_branch()[0].intervals().len(), before);

        state.close_all(&mut tree, 60, 3).unwrap();
        assert_eq!(tree.end(), 60);
        assert_eq!(query_point(&tree, 1, 55).unwrap().unwrap().start(), 0);
        assert_eq!(query_point(&tree, 2, 55).unwrap().unwrap().value(), &StateValue::Int(7));
    }
}
