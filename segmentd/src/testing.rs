//! Scripted stand-ins for worker processes.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;
use segmentd_protocol::ipc::Outgoing;
use segmentd_protocol::{Envelope, EnvelopeSender};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::LaunchConfig;
use crate::daemon::DaemonService;
use crate::error::{Result, SupervisorError};
use crate::process::{EventSink, ProcessEvent, ProcessNotice, SegmentId, SegmentProcess, Spawner};
use crate::segment_interface::{SegmentEvent, SegmentInterface, SegmentLink};

pub(crate) fn launch_config() -> LaunchConfig {
    LaunchConfig {
        file: "/usr/local/bin/worker".into(),
        args: Vec::new(),
        env: Default::default(),
        uid: None,
        gid: None,
    }
}

pub(crate) fn sink(id: SegmentId, tx: mpsc::UnboundedSender<ProcessNotice>) -> EventSink {
    EventSink::new(
        id,
        Arc::new(move |notice| {
            let _ = tx.send(notice);
        }),
    )
}

struct FakeProcess {
    pid: u32,
    sender: EnvelopeSender,
    signals: Arc<Mutex<Vec<Signal>>>,
    dead: Arc<AtomicBool>,
}

impl SegmentProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn sender(&self) -> &EnvelopeSender {
        &self.sender
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        self.signals.lock().unwrap().push(signal);
        Ok(())
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }
}

/// Test-side view of a fake process.
#[derive(Clone)]
pub(crate) struct FakeHandle {
    pub id: SegmentId,
    pub launch: LaunchConfig,
    signals: Arc<Mutex<Vec<Signal>>>,
    dead: Arc<AtomicBool>,
    outbox: Arc<Mutex<mpsc::UnboundedReceiver<Outgoing>>>,
    events: Option<EventSink>,
}

impl FakeHandle {
    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().unwrap().clone()
    }

    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    /// Report `event` the way a real process would, through the controller's
    /// inbox.
    pub fn emit(&self, event: ProcessEvent) {
        self.events
            .as_ref()
            .expect("fake process was not created by a spawner")
            .emit(event);
    }

    /// Envelopes written to the process since the last call.
    pub fn sent(&self) -> Vec<Envelope> {
        let mut outbox = self.outbox.lock().unwrap();
        let mut sent = Vec::new();
        while let Ok(outgoing) = outbox.try_recv() {
            sent.push(outgoing.acknowledge());
        }
        sent
    }
}

pub(crate) fn fake_process(
    id: SegmentId,
    launch: LaunchConfig,
    pid: u32,
) -> (Box<dyn SegmentProcess>, FakeHandle) {
    let (sender, outbox) = EnvelopeSender::channel();
    let signals = Arc::new(Mutex::new(Vec::new()));
    let dead = Arc::new(AtomicBool::new(false));
    let process = FakeProcess {
        pid,
        sender,
        signals: signals.clone(),
        dead: dead.clone(),
    };
    let handle = FakeHandle {
        id,
        launch,
        signals,
        dead,
        outbox: Arc::new(Mutex::new(outbox)),
        events: None,
    };
    (Box::new(process), handle)
}

/// Records every spawn; can be told to fail.
#[derive(Clone, Default)]
pub(crate) struct FakeSpawner {
    spawned: Arc<Mutex<Vec<FakeHandle>>>,
    fail: Arc<AtomicBool>,
}

impl FakeSpawner {
    pub fn spawned(&self) -> Vec<FakeHandle> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn handle(&self, id: &SegmentId) -> FakeHandle {
        self.spawned()
            .into_iter()
            .find(|handle| &handle.id == id)
            .unwrap_or_else(|| panic!("no fake process for {}", id))
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Spawner for FakeSpawner {
    fn spawn(
        &mut self,
        config: &LaunchConfig,
        id: &SegmentId,
        events: EventSink,
    ) -> Result<Box<dyn SegmentProcess>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SupervisorError::Spawn {
                path: config.file.clone(),
                source: io::Error::new(io::ErrorKind::NotFound, "scripted spawn failure"),
            });
        }
        let mut spawned = self.spawned.lock().unwrap();
        let pid = 1000 + spawned.len() as u32;
        let (process, mut handle) = fake_process(id.clone(), config.clone(), pid);
        handle.events = Some(events);
        spawned.push(handle);
        Ok(process)
    }
}

/// Appends `key:online:<id>` and `key:message:<id>:<json>` to a shared log.
pub(crate) struct RecordingService {
    key: String,
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingService {
    pub fn new(key: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            key: key.to_string(),
            log,
        }
    }
}

impl DaemonService for RecordingService {
    fn key(&self) -> &str {
        &self.key
    }

    fn online(&self, segment: &SegmentLink) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:online:{}", self.key, segment.id()));
    }

    fn message(&self, segment: &SegmentLink, message: &Value) {
        self.log
            .lock()
            .unwrap()
            .push(format!("{}:message:{}:{}", self.key, segment.id(), message));
    }
}

pub(crate) fn event_log(iface: &mut SegmentInterface) -> Arc<Mutex<Vec<SegmentEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    iface.observe(move |_, event| sink.lock().unwrap().push(event.clone()));
    log
}
