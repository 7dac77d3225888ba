//! The primary-side supervisor.
//!
//! A [`Controller`] owns the segment pool and is driven by a single inbox:
//! process events, hang-up timers, [`ControllerHandle`] commands and upstream
//! envelopes are all handled one at a time by [`Controller::run`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use segmentd_protocol::{Envelope, EnvelopeSender, LinkEvent, Payload, SystemCall, ENV_SEGMENT_ID};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, ControllerOptions, LaunchOverride};
use crate::daemon::{DaemonService, ServiceRegistry};
use crate::error::{Result, SupervisorError};
use crate::observers::Observers;
use crate::process::{ChildSpawner, EventSink, ProcessNotice, SegmentId, Spawner};
use crate::restart::{ExitInfo, RestartDecision};
use crate::segment_interface::{SegmentContext, SegmentInterface, Transition};

/// How the pool finished; the host process exits with `code`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub code: i32,
    pub reason: String,
}

#[derive(Debug)]
pub(crate) enum LoopMessage {
    Process(ProcessNotice),
    Command(Command),
    Upstream(LinkEvent),
}

pub(crate) enum Command {
    Shutdown {
        code: i32,
        reason: String,
    },
    RefreshSegments,
    Attach(Arc<dyn DaemonService>),
    Send {
        id: SegmentId,
        message: Value,
        reply: oneshot::Sender<Result<()>>,
    },
    SegmentIds(oneshot::Sender<Vec<SegmentId>>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Shutdown { code, reason } => f
                .debug_struct("Shutdown")
                .field("code", code)
                .field("reason", reason)
                .finish(),
            Command::RefreshSegments => f.write_str("RefreshSegments"),
            Command::Attach(service) => f.debug_tuple("Attach").field(&service.key()).finish(),
            Command::Send { id, .. } => f.debug_struct("Send").field("id", id).finish(),
            Command::SegmentIds(_) => f.write_str("SegmentIds"),
        }
    }
}

/// Posts commands into a running controller from other tasks or from
/// observers.
#[derive(Clone, Debug)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<LoopMessage>,
}

impl ControllerHandle {
    fn post(&self, command: Command) -> Result<()> {
        self.tx
            .send(LoopMessage::Command(command))
            .map_err(|_| SupervisorError::ControllerGone)
    }

    pub fn shutdown(&self, code: i32, reason: impl Into<String>) -> Result<()> {
        self.post(Command::Shutdown {
            code,
            reason: reason.into(),
        })
    }

    pub fn refresh_segments(&self) -> Result<()> {
        self.post(Command::RefreshSegments)
    }

    pub fn attach(&self, service: Arc<dyn DaemonService>) -> Result<()> {
        self.post(Command::Attach(service))
    }

    pub async fn send(&self, id: SegmentId, message: Value) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.post(Command::Send { id, message, reply })?;
        response.await.map_err(|_| SupervisorError::ControllerGone)?
    }

    pub async fn segment_ids(&self) -> Result<Vec<SegmentId>> {
        let (reply, response) = oneshot::channel();
        self.post(Command::SegmentIds(reply))?;
        response.await.map_err(|_| SupervisorError::ControllerGone)
    }

    pub(crate) fn deliver_upstream(&self, event: LinkEvent) {
        if self.tx.send(LoopMessage::Upstream(event)).is_err() {
            debug!("Controller gone; dropping upstream event");
        }
    }
}

enum ShutdownState {
    Idle,
    /// Waiting for the segments (by serial) that were live when shutdown
    /// began to reach end of life.
    Draining {
        code: i32,
        reason: String,
        pending: HashSet<u64>,
    },
    Finished(Termination),
}

/// Refuse to build a controller inside a worker process.
pub fn ensure_primary(segment_id: Option<String>) -> Result<()> {
    match segment_id {
        Some(id) if !id.is_empty() => Err(SupervisorError::InsideSegment(id)),
        _ => Ok(()),
    }
}

pub struct ControllerBuilder {
    options: ControllerOptions,
    services: Vec<Arc<dyn DaemonService>>,
    spawner: Option<Box<dyn Spawner>>,
    upstream: Option<EnvelopeSender>,
}

impl ControllerBuilder {
    /// Register a daemon service before any segment starts.
    pub fn service(mut self, service: Arc<dyn DaemonService>) -> Self {
        self.services.push(service);
        self
    }

    pub fn spawner(mut self, spawner: impl Spawner + 'static) -> Self {
        self.spawner = Some(Box::new(spawner));
        self
    }

    pub fn upstream(mut self, sender: EnvelopeSender) -> Self {
        self.upstream = Some(sender);
        self
    }

    pub fn build(self) -> Result<Controller> {
        ensure_primary(std::env::var(ENV_SEGMENT_ID).ok())?;
        let config = self.options.resolve()?;

        let mut services = ServiceRegistry::default();
        for service in self.services {
            services.register(service);
        }

        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        debug!(
            segments = config.segments,
            file = %config.launch.file.display(),
            services = ?services,
            "Controller configured"
        );

        Ok(Controller {
            config,
            segments: HashMap::new(),
            services,
            spawner: self.spawner.unwrap_or_else(|| Box::new(ChildSpawner)),
            upstream: self.upstream,
            inbox_tx,
            inbox,
            launch_observers: Observers::default(),
            exit_observers: Observers::default(),
            shutdown: ShutdownState::Idle,
            next_serial: 0,
        })
    }
}

type LaunchObserver = dyn FnMut(&mut SegmentInterface) + Send;
type ExitObserver = dyn FnMut(i32, &str) + Send;

pub struct Controller {
    config: ControllerConfig,
    segments: HashMap<SegmentId, SegmentInterface>,
    services: ServiceRegistry,
    spawner: Box<dyn Spawner>,
    upstream: Option<EnvelopeSender>,
    inbox_tx: mpsc::UnboundedSender<LoopMessage>,
    inbox: mpsc::UnboundedReceiver<LoopMessage>,
    launch_observers: Observers<LaunchObserver>,
    exit_observers: Observers<ExitObserver>,
    shutdown: ShutdownState,
    next_serial: u64,
}

impl Controller {
    pub fn builder(options: ControllerOptions) -> ControllerBuilder {
        ControllerBuilder {
            options,
            services: Vec::new(),
            spawner: None,
            upstream: None,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            tx: self.inbox_tx.clone(),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Called with every newly launched interface, not with restarts.
    pub fn on_launch<F>(&mut self, observer: F)
    where
        F: FnMut(&mut SegmentInterface) + Send + 'static,
    {
        self.launch_observers.push(Box::new(observer));
    }

    /// Called once, with the shutdown code and reason, after the pool drained.
    pub fn on_exit<F>(&mut self, observer: F)
    where
        F: FnMut(i32, &str) + Send + 'static,
    {
        self.exit_observers.push(Box::new(observer));
    }

    pub fn clear_launch_observers(&mut self) {
        self.launch_observers.clear();
    }

    pub fn clear_exit_observers(&mut self) {
        self.exit_observers.clear();
    }

    /// Connect the controller to its own supervisor. Links of segments already
    /// running pick the channel up as well.
    pub fn attach_upstream(&mut self, sender: EnvelopeSender) {
        for iface in self.segments.values_mut() {
            iface.set_upstream(Some(sender.clone()));
        }
        self.upstream = Some(sender);
    }

    pub fn has_upstream(&self) -> bool {
        self.upstream.is_some()
    }

    pub fn segment(&self, id: &SegmentId) -> Option<&SegmentInterface> {
        self.segments.get(id)
    }

    pub fn segment_mut(&mut self, id: &SegmentId) -> Option<&mut SegmentInterface> {
        self.segments.get_mut(id)
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.keys().cloned().collect()
    }

    pub fn for_each<F>(&mut self, mut f: F)
    where
        F: FnMut(&SegmentId, &mut SegmentInterface),
    {
        for (id, iface) in self.segments.iter_mut() {
            f(id, iface);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        !matches!(self.shutdown, ShutdownState::Idle)
    }

    pub fn termination(&self) -> Option<&Termination> {
        match &self.shutdown {
            ShutdownState::Finished(termination) => Some(termination),
            _ => None,
        }
    }

    fn fresh_id(&self) -> SegmentId {
        loop {
            let id = SegmentId::random();
            if !self.segments.contains_key(&id) {
                return id;
            }
        }
    }

    fn event_sink(&self, id: &SegmentId) -> EventSink {
        let tx = self.inbox_tx.clone();
        EventSink::new(
            id.clone(),
            Arc::new(move |notice| {
                let _ = tx.send(LoopMessage::Process(notice));
            }),
        )
    }

    /// Start one segment with the launch configuration merged with
    /// `overrides`. Spawn failures are returned as-is.
    pub fn launch(&mut self, overrides: &LaunchOverride) -> Result<&mut SegmentInterface> {
        let launch = self.config.launch.merged(overrides);
        let id = self.fresh_id();
        let events = self.event_sink(&id);
        let process = self.spawner.spawn(&launch, &id, events.clone())?;

        let serial = self.next_serial;
        self.next_serial += 1;
        let iface = SegmentInterface::new(
            serial,
            id.clone(),
            process,
            events,
            launch,
            self.upstream.clone(),
        );
        info!(segment_id = %id, pid = ?iface.pid(), "Launched segment");

        let iface = self.segments.entry(id).or_insert(iface);
        for observer in self.launch_observers.iter_mut() {
            observer(&mut *iface);
        }
        Ok(iface)
    }

    /// Launch segments until the pool holds the configured count. Returns how
    /// many were started.
    pub fn refresh_segments(&mut self) -> Result<usize> {
        if self.is_shutting_down() {
            debug!("Not refreshing segments during shutdown");
            return Ok(0);
        }
        let missing = self.config.segments.saturating_sub(self.segments.len());
        for _ in 0..missing {
            self.launch(&LaunchOverride::default())?;
        }
        Ok(missing)
    }

    /// Register `service` and tell it about every segment already online.
    pub fn attach(&mut self, service: Arc<dyn DaemonService>) {
        if self.services.register(service.clone()) {
            info!(key = service.key(), "Replaced daemon service");
        } else {
            info!(key = service.key(), "Attached daemon service");
        }
        for iface in self.segments.values() {
            iface.notify_attached(service.as_ref());
        }
    }

    pub fn syscall(&self, call: SystemCall) -> Result<()> {
        match &self.upstream {
            Some(upstream) => Ok(upstream.send(Envelope::system(call))?),
            None => {
                debug!("No upstream supervisor; dropping system call");
                Ok(())
            }
        }
    }

    pub fn statistic(&self, realm: &str, data: Value) -> Result<()> {
        self.syscall(SystemCall::Stat {
            realm: realm.to_string(),
            message: data,
        })
    }

    /// Tell the upstream supervisor this controller is closing and wait for
    /// the notice to be written.
    pub async fn close(&self, code: i32, reason: &str) -> Result<()> {
        match &self.upstream {
            Some(upstream) => Ok(upstream.send_flushed(Envelope::close(code, reason)).await?),
            None => {
                debug!("No upstream supervisor; dropping close notice");
                Ok(())
            }
        }
    }

    /// Close every segment and finish once all of them reached end of life.
    /// Requests made while a shutdown is in progress are ignored.
    pub fn shutdown(&mut self, code: i32, reason: impl Into<String>) {
        let reason = reason.into();
        if self.is_shutting_down() {
            debug!(code, %reason, "Shutdown already in progress; ignoring request");
            return;
        }

        info!(code, %reason, segments = self.segments.len(), "Shutting down segment pool");
        if self.segments.is_empty() {
            self.finish(code, reason);
            return;
        }

        let pending = self.segments.values().map(SegmentInterface::serial).collect();
        for iface in self.segments.values_mut() {
            if let Err(err) = iface.close(code, &reason) {
                warn!(segment_id = %iface.id(), "Failed to send close order: {}", err);
            }
        }
        self.shutdown = ShutdownState::Draining {
            code,
            reason,
            pending,
        };
    }

    /// Finish a pending shutdown if nothing is left to wait for.
    pub fn reconsider_shutdown(&mut self) {
        let (code, reason) = match &self.shutdown {
            ShutdownState::Draining {
                code,
                reason,
                pending,
            } if pending.is_empty() || self.segments.is_empty() => (*code, reason.clone()),
            _ => return,
        };
        self.finish(code, reason);
    }

    fn finish(&mut self, code: i32, reason: String) {
        info!(code, %reason, "Segment pool stopped");
        for observer in self.exit_observers.iter_mut() {
            observer(code, &reason);
        }
        self.shutdown = ShutdownState::Finished(Termination { code, reason });
    }

    /// Launch the pool and handle events until a shutdown completes.
    pub async fn run(mut self) -> Result<Termination> {
        self.refresh_segments()?;
        info!(segments = self.segments.len(), "Segment pool running");

        loop {
            if let Some(termination) = self.termination() {
                return Ok(termination.clone());
            }
            match self.inbox.recv().await {
                Some(message) => self.dispatch(message),
                None => return Err(SupervisorError::ControllerGone),
            }
        }
    }

    /// Handle one inbox message. Returns `false` once finished.
    pub async fn step(&mut self) -> bool {
        if self.termination().is_some() {
            return false;
        }
        match self.inbox.recv().await {
            Some(message) => {
                self.dispatch(message);
                true
            }
            None => false,
        }
    }

    pub(crate) fn dispatch(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Process(notice) => self.handle_process_event(notice),
            LoopMessage::Command(command) => self.handle_command(command),
            LoopMessage::Upstream(LinkEvent::Envelope(envelope)) => self.handle_upstream(envelope),
            LoopMessage::Upstream(LinkEvent::Disconnected) => {
                warn!("Upstream supervisor channel closed");
            }
        }
    }

    fn handle_process_event(&mut self, notice: ProcessNotice) {
        let Some(iface) = self.segments.get_mut(&notice.id) else {
            debug!(
                segment_id = %notice.id,
                event = ?notice.event,
                "Ignoring event for retired segment id"
            );
            return;
        };

        let ctx = SegmentContext {
            services: &self.services,
            upstream: self.upstream.as_ref(),
            restart: &self.config.restart,
        };

        match iface.handle(notice.event, &ctx) {
            Transition::Continue => {}
            Transition::Exited { info, decision } => {
                let Some(iface) = self.segments.remove(&notice.id) else {
                    return;
                };
                match decision {
                    RestartDecision::Restart => self.restart(iface, info),
                    RestartDecision::EndOfLife => self.retire(iface, info),
                }
            }
        }
    }

    fn restart(&mut self, mut iface: SegmentInterface, info: ExitInfo) {
        iface.begin_restart();
        let id = self.fresh_id();
        let events = self.event_sink(&id);

        // Replacements run the base launch configuration; per-launch
        // overrides do not survive a restart.
        match self.spawner.spawn(&self.config.launch, &id, events.clone()) {
            Ok(process) => {
                info!(previous = %iface.id(), segment_id = %id, %info, "Restarting segment");
                iface.rebind(id.clone(), process, events, self.config.launch.clone(), info);
                self.segments.insert(id, iface);
            }
            Err(err) => {
                error!(segment_id = %iface.id(), "Failed to restart segment: {}", err);
                self.retire(iface, info);
            }
        }
    }

    fn retire(&mut self, mut iface: SegmentInterface, info: ExitInfo) {
        iface.retire(info);
        info!(segment_id = %iface.id(), %info, "Segment reached end of life");

        if let ShutdownState::Draining { pending, .. } = &mut self.shutdown {
            pending.remove(&iface.serial());
        }
        self.reconsider_shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Shutdown { code, reason } => self.shutdown(code, reason),
            Command::RefreshSegments => {
                if let Err(err) = self.refresh_segments() {
                    error!("Failed to refresh segment pool: {}", err);
                }
            }
            Command::Attach(service) => self.attach(service),
            Command::Send { id, message, reply } => {
                let result = match self.segments.get(&id) {
                    Some(iface) => iface.send(message),
                    None => Err(SupervisorError::UnknownSegment(id)),
                };
                let _ = reply.send(result);
            }
            Command::SegmentIds(reply) => {
                let _ = reply.send(self.segment_ids());
            }
        }
    }

    fn handle_upstream(&mut self, envelope: Envelope) {
        match envelope.payload() {
            Ok(Payload::System(SystemCall::Close { code, reason })) => {
                info!(code, %reason, "Upstream supervisor requested close");
                self.shutdown(code, reason);
            }
            Ok(other) => debug!(payload = ?other, "Ignoring upstream envelope"),
            Err(err) => warn!("Malformed upstream envelope: {}", err),
        }
    }
}
