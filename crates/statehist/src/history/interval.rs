//! Immutable state intervals, the unit stored in the history tree.

use crate::attribute::Quark;
use crate::buffer::{SafeBufferReader, SafeBufferWriter};
use crate::error::{Result, StateError};
use crate::history::value::StateValue;
use crate::history::Timestamp;
use std::fmt;

/// Serialized size of an interval without its value payload:
/// start (8) + end (8) + quark (4) + value tag (1).
pub const INTERVAL_FIXED_SIZE: usize = 8 + 8 + 4 + 1;

/// The value an attribute held over the inclusive range `[start, end]`.
#[derive(Debug, Clone, PartialEq)]
pub struct StateInterval {
    start: Timestamp,
    end: Timestamp,
    quark: Quark,
    value: StateValue,
}

impl StateInterval {
    /// Creates an interval.
    ///
    /// # Errors
    ///
    /// Returns `StateError::TimeRange` if `end < start`.
    pub fn new(start: Timestamp, end: Timestamp, quark: Quark, value: StateValue) -> Result<Self> {
        if end < start {
            return Err(StateError::TimeRange {
                time: end,
                start,
                end: Timestamp::MAX,
            });
        }
        Ok(Self {
            start,
            end,
            quark,
            value,
        })
    }

    /// First timestamp covered (inclusive).
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Last timestamp covered (inclusive).
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Attribute this interval belongs to.
    pub fn quark(&self) -> Quark {
        self.quark
    }

    /// Value held during the interval.
    pub fn value(&self) -> &StateValue {
        &self.value
    }

    /// Consumes the interval and returns its value.
    pub fn into_value(self) -> StateValue {
        self.value
    }

    /// Returns true if `time` falls within the interval.
    pub fn contains(&self, time: Timestamp) -> bool {
        self.start <= time && time <= self.end
    }

    /// Returns true if the interval overlaps `[start, end]`.
    pub fn intersects(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start <= end && start <= self.end
    }

    /// Returns the number of bytes [`write_to`](Self::write_to) produces.
    pub fn serialized_size(&self) -> usize {
        Self::serialized_size_with(&self.value)
    }

    /// Returns the serialized size of any interval holding `value`.
    pub fn serialized_size_with(value: &StateValue) -> usize {
        INTERVAL_FIXED_SIZE - 1 + value.serialized_size()
    }

    /// Writes the interval.
    ///
    /// Format: start i64, end i64, quark u32, then the tagged value.
    pub fn write_to(&self, writer: &mut SafeBufferWriter<'_>) -> Result<()> {
        writer.put_i64(self.start)?;
        writer.put_i64(self.end)?;
        writer.put_u32(self.quark)?;
        self.value.write_to(writer)
    }

    /// Reads an interval written by [`write_to`](Self::write_to).
    pub fn read_from(reader: &mut SafeBufferReader<'_>) -> Result<Self> {
        let start = reader.get_i64()?;
        let end = reader.get_i64()?;
        let quark = reader.get_u32()?;
        let value = StateValue::read_from(reader)?;
        if end < start {
            return Err(StateError::corrupt(format!(
                "interval for quark {quark} ends at {end} before its start {start}"
            )));
        }
        Ok(Self {
            start,
            end,
            quark,
            value,
        })
    }
}

impl fmt::Display for StateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}] quark={} value={}",
            self.start, self.end, self.quark, self.value
        )
    }
}
