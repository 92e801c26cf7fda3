//! StateHist - Alopex State History Storage Engine
//!
//! This crate stores how the attributes of a system (threads, CPUs, locks,
//! ...) change over time, and answers "what was the value of X at time T"
//! and "how did X evolve over [T1, T2]" from a single on-disk file.
//!
//! # Components
//!
//! - [`AttributeTree`]: hierarchical attribute paths mapped to integer quarks
//! - [`SafeBufferReader`] / [`SafeBufferWriter`]: bounds-checked codec
//! - [`HistoryTreeWriter`] / [`HistoryTreeReader`]: append-only interval index
//! - [`StateSystemBuilder`] / [`StateSystem`]: single writer, many readers
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_statehist::{HistoryTreeConfig, StateSystemBuilder};
//!
//! let mut builder = StateSystemBuilder::create(path, "kernel", 0, HistoryTreeConfig::default())?;
//! let status = builder.get_or_create_quark(&["Threads", "42", "Status"]);
//! builder.modify_attribute(0, status, "RUNNING")?;
//! builder.modify_attribute(10, status, "WAIT_CPU")?;
//!
//! // Readers may query the live tail while the history is being built
//! let ss = builder.state_system();
//! ss.wait_until(10)?;
//!
//! let ss = builder.close_history(30)?;
//! assert_eq!(ss.query_single_state(5, status)?.value().as_str(), Some("RUNNING"));
//! ```

#![deny(missing_docs)]

pub mod attribute;
pub mod buffer;
pub mod error;
pub mod history;
pub mod state;

pub use attribute::{AttributeTree, Quark, ROOT_QUARK};
pub use buffer::{SafeBufferReader, SafeBufferWriter};
pub use error::{Result, StateError};
pub use history::{
    Cancellation, HistoryTreeConfig, HistoryTreeReader, HistoryTreeWriter, RangeQuery,
    RangeQueryResult, SequenceNumber, StateInterval, StateValue, TimeRange, Timestamp, ValueType,
};
pub use state::{StateSystem, StateSystemBuilder};
