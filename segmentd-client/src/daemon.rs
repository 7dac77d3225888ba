//! Worker-side halves of daemon services.

use segmentd_protocol::Envelope;

use crate::segment::WorkerLink;

pub trait WorkerDaemon {
    /// Must match the key of the primary-side service.
    fn key(&self) -> &str;

    /// Build the handle that receives this daemon's traffic. `link` sends
    /// back to the primary.
    fn internals(&self, link: WorkerLink) -> Box<dyn DaemonHandle>;
}

pub trait DaemonHandle: Send {
    fn message(&mut self, envelope: &Envelope);
}
