//! Worker processes: identities, the events they produce, and the spawner
//! that starts them.

use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use segmentd_protocol::ipc::unix::{self as ipc_unix, CHILD_IPC_FD};
use segmentd_protocol::{
    spawn_link, Envelope, EnvelopeSender, LinkEvent, SysCall, ENV_IPC_FD, ENV_SEGMENT_EXEC,
    ENV_SEGMENT_ID,
};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::config::LaunchConfig;
use crate::error::{Result, SupervisorError};
use crate::restart::ExitInfo;

/// How long an exited child's link may keep delivering buffered lines before
/// the exit is reported anyway. Bounded because grandchildren can hold the
/// descriptor open.
const LINK_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Identifies one process incarnation of a segment; a restart gets a new one.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(String);

impl SegmentId {
    /// 128 random bits, hex encoded.
    pub fn random() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SegmentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SegmentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SegmentId({})", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// The worker sent SYSTEM/ONLINE.
    Online,
    Message(Envelope),
    /// The IPC channel closed.
    Disconnected,
    Exited(ExitInfo),
    /// The hang-up grace window elapsed.
    EscalationDue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessNotice {
    pub id: SegmentId,
    pub event: ProcessEvent,
}

/// Delivers events for one segment id into the controller's inbox.
#[derive(Clone)]
pub struct EventSink {
    id: SegmentId,
    deliver: Arc<dyn Fn(ProcessNotice) + Send + Sync>,
}

impl EventSink {
    pub fn new(id: SegmentId, deliver: Arc<dyn Fn(ProcessNotice) + Send + Sync>) -> Self {
        Self { id, deliver }
    }

    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    pub fn emit(&self, event: ProcessEvent) {
        (self.deliver)(ProcessNotice {
            id: self.id.clone(),
            event,
        });
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").field("id", &self.id).finish()
    }
}

/// A running (or recently exited) worker process.
pub trait SegmentProcess: Send {
    fn pid(&self) -> Option<u32>;

    fn sender(&self) -> &EnvelopeSender;

    /// Deliver `signal`. Signalling a process that already exited is a no-op.
    fn signal(&self, signal: Signal) -> Result<()>;

    fn is_dead(&self) -> bool;
}

pub trait Spawner: Send {
    /// Start a worker for `id`. Its events must be reported through `events`
    /// in the order they happen, ending with exactly one `Exited`.
    fn spawn(
        &mut self,
        config: &LaunchConfig,
        id: &SegmentId,
        events: EventSink,
    ) -> Result<Box<dyn SegmentProcess>>;
}

/// Spawns real child processes with the channel on fd 3.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChildSpawner;

struct ChildProcess {
    pid: Option<u32>,
    sender: EnvelopeSender,
    exited: Arc<AtomicBool>,
}

impl SegmentProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn sender(&self) -> &EnvelopeSender {
        &self.sender
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.is_dead() {
            return Ok(());
        }
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(err) => Err(SupervisorError::Signal(err)),
        }
    }

    fn is_dead(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

impl Spawner for ChildSpawner {
    fn spawn(
        &mut self,
        config: &LaunchConfig,
        id: &SegmentId,
        events: EventSink,
    ) -> Result<Box<dyn SegmentProcess>> {
        let spawn_error = |source| SupervisorError::Spawn {
            path: config.file.clone(),
            source,
        };

        let (parent_end, child_end) = ipc_unix::channel_pair().map_err(spawn_error)?;

        let mut command = Command::new(&config.file);
        command
            .args(&config.args)
            .envs(&config.env)
            .env(ENV_SEGMENT_ID, id.as_str())
            .env(ENV_SEGMENT_EXEC, &config.file)
            .env(ENV_IPC_FD, CHILD_IPC_FD.to_string())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // Only switch credentials when they differ, so an unprivileged
        // primary can still launch under its own ids.
        if let Some(uid) = config.uid {
            if uid != nix::unistd::geteuid().as_raw() {
                command.uid(uid);
            }
        }
        if let Some(gid) = config.gid {
            if gid != nix::unistd::getegid().as_raw() {
                command.gid(gid);
            }
        }
        ipc_unix::inherit_into(&mut command, &child_end, CHILD_IPC_FD);

        let mut child = command.spawn().map_err(spawn_error)?;
        drop(child_end);
        let pid = child.id();
        debug!(segment_id = %id, ?pid, file = %config.file.display(), "Spawned segment process");

        let (drained_tx, drained_rx) = oneshot::channel::<()>();
        let mut drained_tx = Some(drained_tx);
        let link_events = events.clone();
        let sender = spawn_link(parent_end, move |event| match event {
            LinkEvent::Envelope(envelope) if envelope.is_call(SysCall::Online) => {
                link_events.emit(ProcessEvent::Online)
            }
            LinkEvent::Envelope(envelope) => link_events.emit(ProcessEvent::Message(envelope)),
            LinkEvent::Disconnected => {
                link_events.emit(ProcessEvent::Disconnected);
                if let Some(tx) = drained_tx.take() {
                    let _ = tx.send(());
                }
            }
        });

        let exited = Arc::new(AtomicBool::new(false));
        let exited_flag = exited.clone();
        let segment_id = id.clone();
        tokio::spawn(async move {
            let info = match child.wait().await {
                Ok(status) => ExitInfo::from_status(status),
                Err(err) => {
                    warn!(segment_id = %segment_id, "Failed to wait for segment process: {}", err);
                    ExitInfo::code(-1)
                }
            };
            exited_flag.store(true, Ordering::SeqCst);

            if tokio::time::timeout(LINK_DRAIN_GRACE, drained_rx).await.is_err() {
                debug!(segment_id = %segment_id, "Segment channel still open after exit");
            }
            events.emit(ProcessEvent::Exited(info));
        });

        Ok(Box::new(ChildProcess {
            pid,
            sender,
            exited,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn random_ids_are_128_bit_hex() {
        let ids: HashSet<SegmentId> = (0..64).map(|_| SegmentId::random()).collect();
        assert_eq!(ids.len(), 64);
        for id in ids {
            assert_eq!(id.as_str().len(), 32);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn event_sink_tags_events_with_its_id() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::new(
            SegmentId::from("abc"),
            Arc::new(move |notice| {
                let _ = tx.send(notice);
            }),
        );
        sink.emit(ProcessEvent::Disconnected);

        assert_eq!(
            rx.try_recv().unwrap(),
            ProcessNotice {
                id: SegmentId::from("abc"),
                event: ProcessEvent::Disconnected
            }
        );
    }
}
