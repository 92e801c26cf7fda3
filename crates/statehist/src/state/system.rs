//! Shared, queryable state system.

use crate::attribute::{AttributeTree, Quark};
use crate::error::{Result, StateError};
use crate::history::query::{query_full, query_point, RangeQuery};
use crate::history::{
    Cancellation, HistoryTreeReader, HistoryTreeWriter, RangeQueryResult, StateInterval, StateValue,
    Timestamp,
};
use crate::state::transient::TransientState;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Mutable part of a state system under construction.
pub(crate) struct BuildState {
    pub(crate) tree: HistoryTreeWriter,
    pub(crate) transient: TransientState,
    /// Latest timestamp written so far.
    pub(crate) watermark: Timestamp,
}

pub(crate) enum BuildPhase {
    Building(Box<BuildState>),
    Sealed,
    Disposed,
}

impl BuildState {
    fn check_time(&self, start_time: Timestamp, time: Timestamp) -> Result<()> {
        if time < start_time {
            return Err(StateError::TimeRange {
                time,
                start: start_time,
                end: self.watermark,
            });
        }
        if time > self.watermark {
            return Err(StateError::NotYetAvailable {
                requested: time,
                watermark: self.watermark,
            });
        }
        Ok(())
    }

    fn query_single(&self, start_time: Timestamp, quark: Quark, time: Timestamp) -> Result<StateInterval> {
        self.check_time(start_time, time)?;
        if time >= self.transient.ongoing_start(quark) {
            return self.transient.ongoing_interval(quark, self.watermark);
        }
        query_point(&self.tree, quark, time)?.ok_or_else(|| {
            StateError::corrupt(format!("no interval for quark {quark} at {time}"))
        })
    }

    fn query_full(
        &self,
        start_time: Timestamp,
        time: Timestamp,
        quark_count: usize,
    ) -> Result<BTreeMap<Quark, StateInterval>> {
        self.check_time(start_time, time)?;
        let mut state = BTreeMap::new();
        if time <= self.tree.end() {
            for interval in query_full(&self.tree, time)? {
                state.insert(interval.quark(), interval);
            }
        }
        for quark in 1..quark_count as Quark {
            if time >= self.transient.ongoing_start(quark) {
                state.insert(quark, self.transient.ongoing_interval(quark, self.watermark)?);
            }
        }
        Ok(state)
    }

    fn query_range(
        &self,
        start_time: Timestamp,
        quark: Quark,
        start: Timestamp,
        end: Timestamp,
        cancel: Option<&Cancellation>,
    ) -> Result<RangeQueryResult> {
        if start > end {
            return Err(StateError::TimeRange {
                time: end,
                start,
                end: Timestamp::MAX,
            });
        }
        if end < start_time {
            return Err(StateError::TimeRange {
                time: end,
                start: start_time,
                end: self.watermark,
            });
        }
        if start > self.watermark {
            return Err(StateError::NotYetAvailable {
                requested: start,
                watermark: self.watermark,
            });
        }

        let mut result = RangeQueryResult::default();
        if start <= self.tree.end() && end >= self.tree.start() {
            let query = RangeQuery::new(&self.tree, Some(quark), start, end.min(self.tree.end()))?;
            result = query.run(cancel.cloned())?;
        }
        if result.cancelled || cancel.is_some_and(Cancellation::is_cancelled) {
            result.cancelled = true;
            return Ok(result);
        }
        let ongoing = self.transient.ongoing_interval(quark, self.watermark)?;
        if ongoing.intersects(start, end) {
            result.intervals.push(ongoing);
        }
        Ok(result)
    }

    fn finish(self, end: Timestamp, attributes: &AttributeTree) -> Result<HistoryTreeReader> {
        let BuildState {
            mut tree,
            mut transient,
            ..
        } = self;
        if let Err(err) = transient.close_all(&mut tree, end, attributes.len()) {
            discard(tree);
            return Err(err);
        }
        let path = tree.path().to_path_buf();
        tree.close(end, attributes).map_err(|err| {
            if let Err(remove_err) = std::fs::remove_file(&path) {
                warn!("Failed to remove {}: {}", path.display(), remove_err);
            }
            err
        })
    }
}

fn discard(tree: HistoryTreeWriter) {
    let path = tree.path().to_path_buf();
    if let Err(err) = tree.discard() {
        warn!("Failed to remove partial history file {}: {}", path.display(), err);
    }
}

/// A state system: the attribute tree plus the history of every attribute.
///
/// Shared as `Arc<StateSystem>` between the builder and any number of
/// reader threads. While the history is being built, queries see the
/// written part of the tree plus the ongoing value of every attribute, up
/// to the latest written timestamp. Once sealed, queries go straight to the
/// memory-mapped file without locking.
pub struct StateSystem {
    id: String,
    path: PathBuf,
    start_time: Timestamp,
    pub(crate) attributes: RwLock<AttributeTree>,
    build: Mutex<BuildPhase>,
    progress: Condvar,
    sealed: OnceLock<HistoryTreeReader>,
}

impl StateSystem {
    pub(crate) fn new_building(
        id: String,
        start_time: Timestamp,
        tree: HistoryTreeWriter,
    ) -> Self {
        Self {
            id,
            path: tree.path().to_path_buf(),
            start_time,
            attributes: RwLock::new(AttributeTree::new()),
            build: Mutex::new(BuildPhase::Building(Box::new(BuildState {
                tree,
                transient: TransientState::new(start_time),
                watermark: start_time,
            }))),
            progress: Condvar::new(),
            sealed: OnceLock::new(),
        }
    }

    /// Reopens a completed history file.
    ///
    /// # Errors
    ///
    /// Returns `StateError::ProviderVersionMismatch` if the file was built by
    /// another provider version, or any error of
    /// [`HistoryTreeReader::open`]. Callers usually rebuild the history from
    /// the trace on error.
    pub fn open_existing(
        path: &Path,
        id: impl Into<String>,
        provider_version: u32,
    ) -> Result<Arc<Self>> {
        let reader = HistoryTreeReader::open_with_version(path, provider_version)?;
        let id = id.into();
        info!(
            "Reopened state system {} from {} [{}, {}]",
            id,
            path.display(),
            reader.start(),
            reader.end()
        );
        Ok(Arc::new(Self {
            id,
            path: path.to_path_buf(),
            start_time: reader.start(),
            attributes: RwLock::new(reader.attributes().clone()),
            build: Mutex::new(BuildPhase::Sealed),
            progress: Condvar::new(),
            sealed: OnceLock::from(reader),
        }))
    }

    /// Returns the identifier of the state system.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the path of the history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the start time of the history.
    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Returns the latest queryable timestamp: the watermark while building,
    /// the end time once sealed.
    pub fn current_end_time(&self) -> Result<Timestamp> {
        if let Some(reader) = self.sealed.get() {
            return Ok(reader.end());
        }
        match &*self.lock_build() {
            BuildPhase::Building(state) => Ok(state.watermark),
            BuildPhase::Sealed => self.sealed_reader().map(HistoryTreeReader::end),
            BuildPhase::Disposed => Err(StateError::Disposed),
        }
    }

    /// Returns true once the history is sealed.
    pub fn is_built(&self) -> bool {
        self.sealed.get().is_some()
    }

    /// Returns true if the build was abandoned.
    pub fn is_disposed(&self) -> bool {
        matches!(*self.lock_build(), BuildPhase::Disposed)
    }

    pub(crate) fn lock_build(&self) -> MutexGuard<'_, BuildPhase> {
        self.build.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_attributes(&self) -> RwLockReadGuard<'_, AttributeTree> {
        self.attributes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn sealed_reader(&self) -> Result<&HistoryTreeReader> {
        self.sealed
            .get()
            .ok_or_else(|| StateError::corrupt("sealed state system has no history file"))
    }

    pub(crate) fn check_quark(&self, quark: Quark) -> Result<()> {
        if self.read_attributes().contains(quark) {
            Ok(())
        } else {
            Err(StateError::AttributeNotFound(format!("quark {quark}")))
        }
    }

    /// Runs a write against the build state and wakes up waiting readers.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&mut BuildState) -> Result<T>) -> Result<T> {
        let mut phase = self.lock_build();
        let result = match &mut *phase {
            BuildPhase::Building(state) => f(state.as_mut()),
            BuildPhase::Sealed | BuildPhase::Disposed => Err(StateError::Disposed),
        };
        drop(phase);
        self.progress.notify_all();
        result
    }

    /// Closes every ongoing interval at `end` and swaps the writer for the
    /// sealed reader. Disposes the state system on failure.
    pub(crate) fn seal(&self, end: Timestamp) -> Result<()> {
        let mut phase = self.lock_build();
        let state = match std::mem::replace(&mut *phase, BuildPhase::Disposed) {
            BuildPhase::Building(state) => state,
            other => {
                *phase = other;
                return Err(StateError::Disposed);
            }
        };

        let state = *state;
        let attributes = self.read_attributes();
        let result = state.finish(end, &attributes);
        drop(attributes);
        let outcome = match result {
            Ok(reader) => {
                info!(
                    "State system {} sealed at {} ({} nodes)",
                    self.id,
                    end,
                    reader.node_count()
                );
                // Sealing consumes the builder, the cell is always empty here.
                let _ = self.sealed.set(reader);
                *phase = BuildPhase::Sealed;
                Ok(())
            }
            Err(err) => {
                warn!("State system {} disposed, closing at {} failed: {}", self.id, end, err);
                Err(err)
            }
        };
        drop(phase);
        self.progress.notify_all();
        outcome
    }

    /// Abandons an unfinished build and removes its partial file.
    pub(crate) fn dispose(&self) {
        let mut phase = self.lock_build();
        if let BuildPhase::Building(_) = &*phase {
            if let BuildPhase::Building(state) = std::mem::replace(&mut *phase, BuildPhase::Disposed) {
                warn!("State system {} disposed before its history was closed", self.id);
                let state = *state;
                discard(state.tree);
            }
        }
        drop(phase);
        self.progress.notify_all();
    }

    // Queries

    /// Returns the interval of `quark` that contains `time`.
    ///
    /// # Errors
    ///
    /// - `StateError::AttributeNotFound` for an unknown quark
    /// - `StateError::TimeRange` if `time` is outside the history
    /// - `StateError::NotYetAvailable` if the build has not reached `time`
    /// - `StateError::Disposed` if the build was abandoned
    pub fn query_single_state(&self, time: Timestamp, quark: Quark) -> Result<StateInterval> {
        if let Some(reader) = self.sealed.get() {
            return reader.query(quark, time);
        }
        self.check_quark(quark)?;
        match &*self.lock_build() {
            BuildPhase::Building(state) => state.query_single(self.start_time, quark, time),
            BuildPhase::Sealed => self.sealed_reader()?.query(quark, time),
            BuildPhase::Disposed => Err(StateError::Disposed),
        }
    }

    /// Returns the interval of every attribute at `time`.
    pub fn query_full_state(&self, time: Timestamp) -> Result<BTreeMap<Quark, StateInterval>> {
        if let Some(reader) = self.sealed.get() {
            return reader.query_full(time);
        }
        let phase = self.lock_build();
        match &*phase {
            BuildPhase::Building(state) => {
                let quark_count = self.read_attributes().len();
                state.query_full(self.start_time, time, quark_count)
            }
            BuildPhase::Sealed => self.sealed_reader()?.query_full(time),
            BuildPhase::Disposed => Err(StateError::Disposed),
        }
    }

    /// Returns the intervals of `quark` overlapping `[start, end]`, ordered
    /// by start time.
    pub fn query_history_range(
        &self,
        quark: Quark,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        self.range(quark, start, end, None)
            .map(|result| result.intervals)
    }

    /// Same as [`query_history_range`](Self::query_history_range), stopping
    /// early once `cancel` is triggered.
    pub fn query_history_range_cancellable(
        &self,
        quark: Quark,
        start: Timestamp,
        end: Timestamp,
        cancel: &Cancellation,
    ) -> Result<RangeQueryResult> {
        self.range(quark, start, end, Some(cancel))
    }

    fn range(
        &self,
        quark: Quark,
        start: Timestamp,
        end: Timestamp,
        cancel: Option<&Cancellation>,
    ) -> Result<RangeQueryResult> {
        if let Some(reader) = self.sealed.get() {
            return reader.query_range(Some(quark), start, end)?.run(cancel.cloned());
        }
        self.check_quark(quark)?;
        match &*self.lock_build() {
            BuildPhase::Building(state) => state.query_range(self.start_time, quark, start, end, cancel),
            BuildPhase::Sealed => self
                .sealed_reader()?
                .query_range(Some(quark), start, end)?
                .run(cancel.cloned()),
            BuildPhase::Disposed => Err(StateError::Disposed),
        }
    }

    /// Returns the current value of `quark`: the ongoing value while
    /// building, the final value once sealed.
    pub fn query_ongoing_state(&self, quark: Quark) -> Result<StateValue> {
        if let Some(reader) = self.sealed.get() {
            return reader.query(quark, reader.end()).map(StateInterval::into_value);
        }
        self.check_quark(quark)?;
        match &*self.lock_build() {
            BuildPhase::Building(state) => Ok(state.transient.ongoing_value(quark)),
            BuildPhase::Sealed => {
                let reader = self.sealed_reader()?;
                reader.query(quark, reader.end()).map(StateInterval::into_value)
            }
            BuildPhase::Disposed => Err(StateError::Disposed),
        }
    }

    // Waiting on the build

    /// Blocks until the history is built up to `time`, or sealed.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Disposed` if the build is abandoned.
    pub fn wait_until(&self, time: Timestamp) -> Result<()> {
        let mut phase = self.lock_build();
        loop {
            match &*phase {
                BuildPhase::Building(state) if state.watermark < time => {}
                BuildPhase::Disposed => return Err(StateError::Disposed),
                _ => return Ok(()),
            }
            phase = self
                .progress
                .wait(phase)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_until`](Self::wait_until), giving up after `timeout`.
    ///
    /// Returns `Ok(false)` on timeout.
    pub fn wait_until_timeout(&self, time: Timestamp, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut phase = self.lock_build();
        loop {
            match &*phase {
                BuildPhase::Building(state) if state.watermark < time => {}
                BuildPhase::Disposed => return Err(StateError::Disposed),
                _ => return Ok(true),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            phase = self
                .progress
                .wait_timeout(phase, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Blocks until the history is sealed.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Disposed` if the build is abandoned.
    pub fn wait_until_built(&self) -> Result<()> {
        let mut phase = self.lock_build();
        loop {
            match &*phase {
                BuildPhase::Building(_) => {}
                BuildPhase::Sealed => return Ok(()),
                BuildPhase::Disposed => return Err(StateError::Disposed),
            }
            phase = self
                .progress
                .wait(phase)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    // Attribute lookups

    /// Returns the number of quarks, root included.
    pub fn attribute_count(&self) -> usize {
        self.read_attributes().len()
    }

    /// Looks up the quark of an absolute attribute path.
    pub fn quark<S: AsRef<str>>(&self, path: &[S]) -> Result<Quark> {
        self.read_attributes().quark(path)
    }

    /// Looks up the quark of `path` below `parent`.
    pub fn quark_relative<S: AsRef<str>>(&self, parent: Quark, path: &[S]) -> Result<Quark> {
        self.read_attributes().quark_relative(parent, path)
    }

    /// Returns the `/`-joined path of `quark`.
    pub fn full_path(&self, quark: Quark) -> Result<String> {
        self.read_attributes().full_path(quark)
    }

    /// Returns the children of `quark`, or its whole subtree if `recursive`.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.read_attributes().sub_attributes(quark, recursive)
    }

    /// Returns the quarks matching a path pattern with `*` wildcards.
    pub fn quarks_matching<S: AsRef<str>>(&self, pattern: &[S]) -> Vec<Quark> {
        self.read_attributes().quarks_matching(pattern)
    }
}
