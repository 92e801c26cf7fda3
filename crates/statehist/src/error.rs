//! Error and Result types for state history operations.

use crate::attribute::Quark;
use crate::history::{SequenceNumber, Timestamp};
use std::io;
use thiserror::Error;

/// A convenience `Result` type for state history operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// The error type for state history operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// A timestamp falls outside the valid range, either because a query
    /// targets a time the history does not cover or because a write goes
    /// back in time.
    #[error("Time {time} outside of valid range [{start}, {end}]")]
    TimeRange {
        /// The offending timestamp.
        time: Timestamp,
        /// Earliest valid timestamp.
        start: Timestamp,
        /// Latest valid timestamp.
        end: Timestamp,
    },

    /// The requested attribute does not exist in the attribute tree.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// A buffer access would read or write outside of its region.
    #[error("Buffer access out of bounds: {requested} bytes at position {position}, limit {limit}")]
    OutOfBounds {
        /// Cursor position at the time of the access.
        position: usize,
        /// Number of bytes requested.
        requested: usize,
        /// Size of the buffer region.
        limit: usize,
    },

    /// The history file or one of its nodes has inconsistent contents.
    #[error("Corrupt history file: {0}")]
    CorruptFile(String),

    /// Invalid magic bytes in the history file header.
    #[error("Invalid magic bytes: expected ASHT, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported history file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the computed one.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// The history file was built by a different state provider version.
    #[error("Provider version mismatch: expected {expected}, found {found}")]
    ProviderVersionMismatch {
        /// Version requested by the caller.
        expected: u32,
        /// Version recorded in the file.
        found: u32,
    },

    /// A node has no room left for the interval or child being added.
    #[error("Node {seq} is full: {needed} bytes needed, {free} free")]
    NodeFull {
        /// Sequence number of the full node.
        seq: SequenceNumber,
        /// Bytes required by the new entry.
        needed: usize,
        /// Bytes (or child slots) still free.
        free: usize,
    },

    /// A sealed node was modified.
    #[error("Node {0} is sealed")]
    NodeSealed(SequenceNumber),

    /// An interval cannot fit in any node of the configured size.
    #[error("Interval of {size} bytes exceeds node capacity of {capacity} bytes")]
    IntervalTooLarge {
        /// Serialized size of the interval.
        size: usize,
        /// Largest interval a branch node can hold.
        capacity: usize,
    },

    /// A state value had an unexpected type for the requested operation.
    #[error("Type mismatch on attribute {quark}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Attribute whose value was inspected.
        quark: Quark,
        /// Expected value type.
        expected: &'static str,
        /// Actual value type.
        found: &'static str,
    },

    /// The history has not been built up to the requested time yet.
    #[error("Time {requested} not yet available, history built up to {watermark}")]
    NotYetAvailable {
        /// Requested timestamp.
        requested: Timestamp,
        /// Time up to which the history is currently built.
        watermark: Timestamp,
    },

    /// The state system was disposed before its history was completed.
    #[error("State system has been disposed")]
    Disposed,

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StateError {
    /// Returns true if this error means the history file cannot be trusted
    /// and must be rebuilt from the trace.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptFile(_)
                | Self::InvalidMagic(_)
                | Self::UnsupportedVersion(_)
                | Self::ChecksumMismatch { .. }
        )
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptFile(msg.into())
    }
}
