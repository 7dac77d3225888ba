//! Primary-side process supervision: a controller keeps a pool of worker
//! segments alive, restarts them according to policy and drains them on
//! shutdown.

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod host;
pub mod observers;
pub mod process;
pub mod restart;
pub mod segment_interface;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ControllerConfig, ControllerOptions, LaunchConfig, LaunchOverride, RestartOptions};
pub use controller::{Controller, ControllerBuilder, ControllerHandle, Termination};
pub use daemon::{DaemonService, ServiceRegistry};
pub use error::SupervisorError;
pub use process::{ChildSpawner, SegmentId, SegmentProcess, Spawner};
pub use restart::{ExitInfo, RestartDecision, RestartPolicy};
pub use segment_interface::{SegmentEvent, SegmentInterface, SegmentLink, SegmentState};
