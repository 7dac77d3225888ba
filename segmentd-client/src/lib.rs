//! Agent for a process started by a segmentd controller.
//!
//! A worker calls [`bootstrap::run`] with its entry function; the entry
//! registers observers and daemons on the [`Segment`], after which inbound
//! traffic is dispatched until the primary orders a close.

pub mod bootstrap;
pub mod daemon;
mod error;
pub mod segment;

pub use daemon::{DaemonHandle, WorkerDaemon};
pub use error::SegmentError;
pub use segment::{AppMessage, Segment, Termination, WorkerLink};
