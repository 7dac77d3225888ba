use std::collections::HashMap;
use std::env;

use segmentd_protocol::ipc::unix::{self as ipc_unix, CHILD_IPC_FD};
use segmentd_protocol::{
    spawn_link, Envelope, EnvelopeSender, LinkEvent, Payload, SystemCall, ENV_IPC_FD,
    ENV_SEGMENT_EXEC, ENV_SEGMENT_ID,
};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::daemon::{DaemonHandle, WorkerDaemon};
use crate::error::SegmentError;

/// An APPLICATION payload from the primary, with its sender's stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AppMessage {
    pub message: Value,
    pub time: f64,
    pub pid: u32,
}

/// Why the segment stopped; the process exits with `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub code: i32,
    pub reason: String,
}

#[derive(Debug)]
enum Inbound {
    Link(LinkEvent),
    Exit(Termination),
}

/// Cloneable sending side of a segment, handed to observers and daemons.
#[derive(Clone, Debug)]
pub struct WorkerLink {
    sender: EnvelopeSender,
    local: mpsc::UnboundedSender<Inbound>,
}

impl WorkerLink {
    pub fn send(&self, message: Value) -> Result<(), SegmentError> {
        Ok(self.sender.send(Envelope::application(message))?)
    }

    pub fn send_daemon(&self, key: &str, message: Value) -> Result<(), SegmentError> {
        Ok(self.sender.send(Envelope::daemon(key, message))?)
    }

    pub fn syscall(&self, call: SystemCall) -> Result<(), SegmentError> {
        Ok(self.sender.send(Envelope::system(call))?)
    }

    pub fn statistic(&self, realm: &str, data: Value) -> Result<(), SegmentError> {
        self.syscall(SystemCall::Stat {
            realm: realm.to_string(),
            message: data,
        })
    }

    /// Ask the running segment to announce a close and stop.
    pub fn exit(&self, code: i32, reason: &str) {
        let request = Inbound::Exit(Termination {
            code,
            reason: reason.to_string(),
        });
        if self.local.send(request).is_err() {
            debug!("Segment loop already stopped; ignoring exit request");
        }
    }
}

type MessageObserver = dyn FnMut(&WorkerLink, &AppMessage) + Send;
type ExitObserver = dyn FnMut(i32, &str) + Send;

pub struct Segment {
    id: String,
    exec: Option<String>,
    link: WorkerLink,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    daemons: HashMap<String, Box<dyn DaemonHandle>>,
    message_observers: Vec<Box<MessageObserver>>,
    exit_observers: Vec<Box<ExitObserver>>,
}

impl Segment {
    /// Adopt the channel the primary left on the inherited descriptor and
    /// announce readiness. Must run inside a tokio runtime.
    pub fn connect() -> Result<Self, SegmentError> {
        let id = env::var(ENV_SEGMENT_ID).map_err(|_| SegmentError::NotASegment(ENV_SEGMENT_ID))?;
        let exec = env::var(ENV_SEGMENT_EXEC).ok();
        let fd = match env::var(ENV_IPC_FD) {
            Ok(raw) => ipc_unix::parse_fd(&raw)?,
            Err(_) => CHILD_IPC_FD,
        };
        let stream = ipc_unix::from_inherited_fd(fd)?;
        Self::over_stream(id, exec, stream)
    }

    /// Run the segment protocol over an arbitrary stream.
    pub fn over_stream<S>(id: String, exec: Option<String>, stream: S) -> Result<Self, SegmentError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (local, inbound) = mpsc::unbounded_channel();
        let link_tx = local.clone();
        let sender = spawn_link(stream, move |event| {
            let _ = link_tx.send(Inbound::Link(event));
        });

        let segment = Segment {
            id,
            exec,
            link: WorkerLink { sender, local },
            inbound,
            daemons: HashMap::new(),
            message_observers: Vec::new(),
            exit_observers: Vec::new(),
        };
        segment.link.syscall(SystemCall::Online)?;
        info!(segment_id = %segment.id, "Segment online");
        Ok(segment)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The program the primary launched this segment from.
    pub fn exec(&self) -> Option<&str> {
        self.exec.as_deref()
    }

    pub fn link(&self) -> &WorkerLink {
        &self.link
    }

    pub fn attach(&mut self, daemon: &dyn WorkerDaemon) {
        let handle = daemon.internals(self.link.clone());
        debug!(key = daemon.key(), "Attached daemon");
        self.daemons.insert(daemon.key().to_string(), handle);
    }

    pub fn on_message<F>(&mut self, observer: F)
    where
        F: FnMut(&WorkerLink, &AppMessage) + Send + 'static,
    {
        self.message_observers.push(Box::new(observer));
    }

    pub fn on_exit<F>(&mut self, observer: F)
    where
        F: FnMut(i32, &str) + Send + 'static,
    {
        self.exit_observers.push(Box::new(observer));
    }

    pub fn clear_observers(&mut self) {
        self.message_observers.clear();
        self.exit_observers.clear();
    }

    pub fn send(&self, message: Value) -> Result<(), SegmentError> {
        self.link.send(message)
    }

    pub fn send_daemon(&self, key: &str, message: Value) -> Result<(), SegmentError> {
        self.link.send_daemon(key, message)
    }

    pub fn syscall(&self, call: SystemCall) -> Result<(), SegmentError> {
        self.link.syscall(call)
    }

    pub fn statistic(&self, realm: &str, data: Value) -> Result<(), SegmentError> {
        self.link.statistic(realm, data)
    }

    /// Send CLOSE and wait until it has been written to the channel.
    pub async fn announce_exit(&self, code: i32, reason: &str) -> Result<(), SegmentError> {
        Ok(self
            .link
            .sender
            .send_flushed(Envelope::close(code, reason))
            .await?)
    }

    /// Announce the close, run exit observers and end the process.
    pub async fn exit(mut self, code: i32, reason: &str) {
        if let Err(err) = self.announce_exit(code, reason).await {
            warn!("Could not announce exit to the primary: {}", err);
        }
        self.finish(code, reason);
        std::process::exit(code)
    }

    fn finish(&mut self, code: i32, reason: &str) {
        info!(segment_id = %self.id, code, reason, "Segment exiting");
        for observer in self.exit_observers.iter_mut() {
            observer(code, reason);
        }
    }

    /// Handle one envelope from the primary. Returns the termination carried
    /// by a close order.
    pub fn dispatch(&mut self, envelope: Envelope) -> Option<Termination> {
        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Ignoring envelope from primary: {}", err);
                return None;
            }
        };

        match payload {
            Payload::System(SystemCall::Close { code, reason }) => {
                return Some(Termination { code, reason });
            }
            Payload::System(other) => debug!(call = ?other, "Ignoring system call from primary"),
            Payload::Daemon { key, .. } => {
                let Some(handle) = self.daemons.get_mut(&key) else {
                    panic!("primary sent a DAEMON message for unattached daemon `{}`", key);
                };
                handle.message(&envelope);
            }
            Payload::Application(message) => {
                let message = AppMessage {
                    message,
                    time: envelope.time,
                    pid: envelope.pid,
                };
                for observer in self.message_observers.iter_mut() {
                    observer(&self.link, &message);
                }
            }
        }
        None
    }

    /// Dispatch inbound traffic until the primary orders a close, an exit is
    /// requested through a [`WorkerLink`], or the primary goes away. Exit
    /// observers have run when this returns.
    pub async fn run(mut self) -> Termination {
        let termination = loop {
            let Some(inbound) = self.inbound.recv().await else {
                break Termination {
                    code: 0,
                    reason: "segment channel dropped".into(),
                };
            };
            match inbound {
                Inbound::Link(LinkEvent::Envelope(envelope)) => {
                    if let Some(termination) = self.dispatch(envelope) {
                        break termination;
                    }
                }
                Inbound::Link(LinkEvent::Disconnected) => {
                    warn!(segment_id = %self.id, "Primary disconnected");
                    break Termination {
                        code: 0,
                        reason: "primary disconnected".into(),
                    };
                }
                Inbound::Exit(termination) => {
                    let announced = self
                        .announce_exit(termination.code, &termination.reason)
                        .await;
                    if let Err(err) = announced {
                        warn!("Could not announce exit to the primary: {}", err);
                    }
                    break termination;
                }
            }
        };

        self.finish(termination.code, &termination.reason);
        termination
    }
}
