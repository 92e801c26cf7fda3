//! Single-writer side of a state system.

use crate::attribute::{AttributeTree, Quark};
use crate::error::{Result, StateError};
use crate::history::{HistoryTreeConfig, HistoryTreeWriter, StateValue, Timestamp, ValueType};
use crate::state::system::{BuildState, StateSystem};
use crate::state::transient::TransientState;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLockWriteGuard};
use tracing::info;

/// Builds the history of a [`StateSystem`].
///
/// There is exactly one builder per state system. Writes must come in
/// non-decreasing time order. Readers obtained through
/// [`state_system`](Self::state_system) can query the history while it is
/// being built.
///
/// Dropping the builder without calling
/// [`close_history`](Self::close_history) disposes the state system: the
/// partial file is removed and waiting readers get `StateError::Disposed`.
pub struct StateSystemBuilder {
    system: Arc<StateSystem>,
    finished: bool,
}

impl StateSystemBuilder {
    /// Creates a state system whose history file lives at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidConfig` for an invalid configuration and
    /// `StateError::Io` if the file cannot be created.
    pub fn create(
        path: &Path,
        id: impl Into<String>,
        start_time: Timestamp,
        config: HistoryTreeConfig,
    ) -> Result<Self> {
        let id = id.into();
        let tree = HistoryTreeWriter::create(path, start_time, config)?;
        info!("Building state system {} from {}", id, start_time);
        Ok(Self {
            system: Arc::new(StateSystem::new_building(id, start_time, tree)),
            finished: false,
        })
    }

    /// Returns a handle for querying the state system.
    pub fn state_system(&self) -> Arc<StateSystem> {
        Arc::clone(&self.system)
    }

    fn attributes_mut(&self) -> RwLockWriteGuard<'_, AttributeTree> {
        self.system
            .attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the quark of `path`, creating the attribute if needed.
    pub fn get_or_create_quark<S: AsRef<str>>(&mut self, path: &[S]) -> Quark {
        self.attributes_mut().get_or_create(path)
    }

    /// Returns the quark of `path` below `parent`, creating it if needed.
    pub fn get_or_create_quark_relative<S: AsRef<str>>(
        &mut self,
        parent: Quark,
        path: &[S],
    ) -> Result<Quark> {
        self.attributes_mut().get_or_create_relative(parent, path)
    }

    /// Applies value changes that all happen at `time`, all or nothing.
    fn apply(&mut self, time: Timestamp, changes: Vec<(Quark, StateValue)>) -> Result<()> {
        self.system.write(|state: &mut BuildState| {
            state.transient.apply_changes(&mut state.tree, time, changes)?;
            state.watermark = state.watermark.max(time);
            Ok(())
        })
    }

    fn ongoing(&self, quark: Quark) -> Result<StateValue> {
        self.system.query_ongoing_state(quark)
    }

    /// Sets the value of `quark` from `time` on.
    ///
    /// # Errors
    ///
    /// - `StateError::AttributeNotFound` for an unknown quark
    /// - `StateError::TimeRange` if `time` precedes the start of the current
    ///   value of `quark`, or precedes an earlier write to another attribute
    /// - `StateError::IntervalTooLarge` if `value` could never be stored
    ///
    /// A failed write changes nothing.
    pub fn modify_attribute(
        &mut self,
        time: Timestamp,
        quark: Quark,
        value: impl Into<StateValue>,
    ) -> Result<()> {
        self.system.check_quark(quark)?;
        self.apply(time, vec![(quark, value.into())])
    }

    /// Resolves `path`, creating it if needed, and sets its value from `time` on.
    ///
    /// Returns the quark of `path`.
    pub fn ingest<S: AsRef<str>>(
        &mut self,
        time: Timestamp,
        path: &[S],
        value: impl Into<StateValue>,
    ) -> Result<Quark> {
        let quark = self.get_or_create_quark(path);
        self.modify_attribute(time, quark, value)?;
        Ok(quark)
    }

    /// Adds one to the value of `quark`. A null attribute becomes `Int(1)`.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TypeMismatch` if the value is not numeric.
    pub fn increment_attribute(&mut self, time: Timestamp, quark: Quark) -> Result<()> {
        let next = match self.ongoing(quark)? {
            StateValue::Null => StateValue::Int(1),
            StateValue::Int(v) => StateValue::Int(v.wrapping_add(1)),
            StateValue::Long(v) => StateValue::Long(v.wrapping_add(1)),
            other => {
                return Err(StateError::TypeMismatch {
                    quark,
                    expected: ValueType::Int.name(),
                    found: other.value_type().name(),
                })
            }
        };
        self.apply(time, vec![(quark, next)])
    }

    /// Pushes `value` on the stack attribute `quark`.
    ///
    /// The attribute itself holds the stack depth; the elements are its
    /// children `1`, `2`, ...
    pub fn push_attribute(
        &mut self,
        time: Timestamp,
        quark: Quark,
        value: impl Into<StateValue>,
    ) -> Result<()> {
        let depth = self.ongoing(quark)?.expect_int(quark)?.unwrap_or(0);
        let next = depth.wrapping_add(1);
        let element = self.get_or_create_quark_relative(quark, &[next.to_string()])?;
        self.apply(
            time,
            vec![(element, value.into()), (quark, StateValue::Int(next))],
        )
    }

    /// Pops the top of the stack attribute `quark`.
    ///
    /// Returns the popped value, or `None` if the stack is empty.
    pub fn pop_attribute(&mut self, time: Timestamp, quark: Quark) -> Result<Option<StateValue>> {
        let depth = self.ongoing(quark)?.expect_int(quark)?.unwrap_or(0);
        if depth <= 0 {
            return Ok(None);
        }
        let element = self
            .system
            .read_attributes()
            .quark_relative(quark, &[depth.to_string()])?;
        let popped = self.ongoing(element)?;
        let remaining = match depth - 1 {
            0 => StateValue::Null,
            d => StateValue::Int(d),
        };
        self.apply(time, vec![(element, StateValue::Null), (quark, remaining)])?;
        Ok(Some(popped))
    }

    /// Sets `quark` and every attribute below it to null from `time` on.
    ///
    /// Either the whole subtree is nulled or, on error, none of it.
    pub fn remove_attribute(&mut self, time: Timestamp, quark: Quark) -> Result<()> {
        self.system.check_quark(quark)?;
        let mut targets = vec![quark];
        targets.extend(self.system.read_attributes().sub_attributes(quark, true)?);
        let changes = targets
            .into_iter()
            .map(|q| self.ongoing(q).map(|value| (q, value)))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(q, _)| (q, StateValue::Null))
            .collect();
        self.apply(time, changes)
    }

    /// Replaces the current value of `quark` without starting a new interval.
    pub fn update_ongoing_state(&mut self, quark: Quark, value: impl Into<StateValue>) -> Result<()> {
        self.system.check_quark(quark)?;
        let value = value.into();
        self.system.write(|state: &mut BuildState| {
            TransientState::check_value_size(&state.tree, &value)?;
            state.transient.update_ongoing(quark, value);
            Ok(())
        })
    }

    /// Closes every ongoing interval at `end`, seals the history file and
    /// returns the state system, now queryable without locking.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimeRange` if `end` precedes the latest write.
    /// The state system is disposed on failure.
    pub fn close_history(mut self, end: Timestamp) -> Result<Arc<StateSystem>> {
        self.finished = true;
        self.system.seal(end)?;
        Ok(Arc::clone(&self.system))
    }
}

impl Drop for StateSystemBuilder {
    fn drop(&mut self) {
        if !self.finished {
            self.system.dispose();
        }
    }
}
