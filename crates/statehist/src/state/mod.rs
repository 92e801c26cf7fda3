//! State systems: the façade driven by trace analyses.
//!
//! A [`StateSystemBuilder`] turns a stream of `(time, attribute, value)`
//! changes into intervals stored in a history tree, while any number of
//! threads query the shared [`StateSystem`].
//!
//! # Phases
//!
//! - **Building**: one mutex guards the tree writer, the ongoing value of
//!   every attribute and the watermark (latest written time). Each write
//!   wakes up readers blocked in [`StateSystem::wait_until`].
//! - **Sealed**: after [`StateSystemBuilder::close_history`] the history is
//!   immutable and queries read the memory-mapped file without locking.
//! - **Disposed**: the builder was dropped before closing; the partial file is
//!   removed and every query fails with `StateError::Disposed`.

mod builder;
mod system;
mod transient;

pub use builder::StateSystemBuilder;
pub use system::StateSystem;
