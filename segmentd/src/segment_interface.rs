//! Primary-side proxy for one worker segment.
//!
//! A `SegmentInterface` outlives the processes it supervises: when a worker
//! is restarted the same interface is rebound to the replacement, so
//! observers registered on it keep receiving events.

use std::time::Duration;

use nix::sys::signal::Signal;
use segmentd_protocol::{Envelope, EnvelopeSender, Payload, SystemCall};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LaunchConfig;
use crate::daemon::{DaemonService, ServiceRegistry};
use crate::error::Result;
use crate::observers::Observers;
use crate::process::{EventSink, ProcessEvent, SegmentId, SegmentProcess};
use crate::restart::{ExitInfo, RestartDecision, RestartPolicy};

/// Time between SIGHUP and SIGKILL for a segment whose channel closed.
pub const ESCALATION_GRACE: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Launching,
    Online,
    Active,
    Disconnected,
    Exited,
    Restarting,
    EndOfLife,
}

/// Timestamps of the current process incarnation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimes {
    pub launch: Instant,
    pub online: Option<Instant>,
    pub dead: Option<Instant>,
}

impl LifecycleTimes {
    fn started_now() -> Self {
        Self {
            launch: Instant::now(),
            online: None,
            dead: None,
        }
    }

    /// Time between coming online and dying; zero if either is missing.
    pub fn age(&self) -> Duration {
        match (self.online, self.dead) {
            (Some(online), Some(dead)) => dead.saturating_duration_since(online),
            _ => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// The worker announced it is closing.
    Close { code: i32, reason: String },
    Message(Value),
    /// The process exited. Always fires before `Restart` or `EndOfLife`.
    Death(ExitInfo),
    /// A replacement process now backs this interface.
    Restart(ExitInfo),
    EndOfLife(ExitInfo),
}

/// Cloneable handle to the current process of a segment.
///
/// Also carries the controller's upstream channel, so daemon services can
/// report statistics on behalf of the segment.
#[derive(Clone, Debug)]
pub struct SegmentLink {
    id: SegmentId,
    pid: Option<u32>,
    sender: EnvelopeSender,
    upstream: Option<EnvelopeSender>,
}

impl SegmentLink {
    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn send(&self, message: Value) -> Result<()> {
        Ok(self.sender.send(Envelope::application(message))?)
    }

    pub fn send_daemon(&self, key: &str, message: Value) -> Result<()> {
        Ok(self.sender.send(Envelope::daemon(key, message))?)
    }

    pub fn syscall(&self, call: SystemCall) -> Result<()> {
        Ok(self.sender.send(Envelope::system(call))?)
    }

    /// Report `data` under `realm` to the controller's own supervisor. Without
    /// one the statistic is dropped.
    pub fn statistic(&self, realm: &str, data: Value) -> Result<()> {
        match &self.upstream {
            Some(upstream) => Ok(upstream.send(Envelope::stat(realm, data))?),
            None => {
                debug!(segment_id = %self.id, realm, "No upstream supervisor; dropping statistic");
                Ok(())
            }
        }
    }
}

pub(crate) struct SegmentContext<'a> {
    pub services: &'a ServiceRegistry,
    pub upstream: Option<&'a EnvelopeSender>,
    pub restart: &'a RestartPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Continue,
    Exited {
        info: ExitInfo,
        decision: RestartDecision,
    },
}

type SegmentObserver = dyn FnMut(&SegmentLink, &SegmentEvent) + Send;

pub struct SegmentInterface {
    serial: u64,
    id: SegmentId,
    process: Box<dyn SegmentProcess>,
    link: SegmentLink,
    events: EventSink,
    launch: LaunchConfig,
    intentional_close: bool,
    state: SegmentState,
    times: LifecycleTimes,
    escalation: Option<JoinHandle<()>>,
    observers: Observers<SegmentObserver>,
}

fn link_for(
    id: &SegmentId,
    process: &dyn SegmentProcess,
    upstream: Option<EnvelopeSender>,
) -> SegmentLink {
    SegmentLink {
        id: id.clone(),
        pid: process.pid(),
        sender: process.sender().clone(),
        upstream,
    }
}

impl SegmentInterface {
    pub(crate) fn new(
        serial: u64,
        id: SegmentId,
        process: Box<dyn SegmentProcess>,
        events: EventSink,
        launch: LaunchConfig,
        upstream: Option<EnvelopeSender>,
    ) -> Self {
        let link = link_for(&id, process.as_ref(), upstream);
        Self {
            serial,
            id,
            process,
            link,
            events,
            launch,
            intentional_close: false,
            state: SegmentState::Launching,
            times: LifecycleTimes::started_now(),
            escalation: None,
            observers: Observers::default(),
        }
    }

    pub fn id(&self) -> &SegmentId {
        &self.id
    }

    /// Stable across restarts, unlike `id`.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn pid(&self) -> Option<u32> {
        self.link.pid
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    pub fn times(&self) -> &LifecycleTimes {
        &self.times
    }

    pub fn link(&self) -> &SegmentLink {
        &self.link
    }

    pub fn launch_config(&self) -> &LaunchConfig {
        &self.launch
    }

    pub fn is_intentional_close(&self) -> bool {
        self.intentional_close
    }

    pub fn is_online(&self) -> bool {
        self.times.online.is_some()
            && matches!(
                self.state,
                SegmentState::Online | SegmentState::Active | SegmentState::Disconnected
            )
    }

    pub fn observe<F>(&mut self, observer: F)
    where
        F: FnMut(&SegmentLink, &SegmentEvent) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    pub fn clear_observers(&mut self) {
        self.observers.clear();
    }

    pub fn send(&self, message: Value) -> Result<()> {
        self.link.send(message)
    }

    pub fn send_daemon(&self, key: &str, message: Value) -> Result<()> {
        self.link.send_daemon(key, message)
    }

    pub fn syscall(&self, call: SystemCall) -> Result<()> {
        self.link.syscall(call)
    }

    pub fn statistic(&self, realm: &str, data: Value) -> Result<()> {
        self.link.statistic(realm, data)
    }

    pub(crate) fn set_upstream(&mut self, upstream: Option<EnvelopeSender>) {
        self.link.upstream = upstream;
    }

    /// Ask the worker to close. Whatever happens next, its exit is final.
    pub fn close(&mut self, code: i32, reason: &str) -> Result<()> {
        self.intentional_close = true;
        self.link.syscall(SystemCall::Close {
            code,
            reason: reason.to_string(),
        })
    }

    pub fn signal(&self, signal: Signal) -> Result<()> {
        self.process.signal(signal)
    }

    pub(crate) fn notify_attached(&self, service: &dyn DaemonService) {
        if self.is_online() {
            service.online(&self.link);
        }
    }

    pub(crate) fn handle(&mut self, event: ProcessEvent, ctx: &SegmentContext<'_>) -> Transition {
        match event {
            ProcessEvent::Online => self.on_online(ctx),
            ProcessEvent::Message(envelope) => self.on_message(envelope, ctx),
            ProcessEvent::Disconnected => self.on_disconnect(),
            ProcessEvent::EscalationDue => self.on_escalation(),
            ProcessEvent::Exited(info) => return self.on_exit(info, ctx.restart),
        }
        Transition::Continue
    }

    fn emit(&mut self, event: SegmentEvent) {
        for observer in self.observers.iter_mut() {
            observer(&self.link, &event);
        }
    }

    fn on_online(&mut self, ctx: &SegmentContext<'_>) {
        if self.times.online.is_some() {
            debug!(segment_id = %self.id, "Ignoring repeated online notice");
            return;
        }
        if self.state == SegmentState::Launching {
            self.state = SegmentState::Online;
        }
        self.times.online = Some(Instant::now());
        info!(segment_id = %self.id, pid = ?self.link.pid, "Segment online");

        for service in ctx.services.iter() {
            service.online(&self.link);
        }

        if self.state == SegmentState::Online {
            self.state = SegmentState::Active;
        }
    }

    fn on_message(&mut self, envelope: Envelope, ctx: &SegmentContext<'_>) {
        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(segment_id = %self.id, "Ignoring envelope from segment: {}", err);
                return;
            }
        };

        match payload {
            Payload::System(SystemCall::Close { code, reason }) => {
                info!(segment_id = %self.id, code, %reason, "Segment announced close");
                self.intentional_close = true;
                self.emit(SegmentEvent::Close { code, reason });
            }
            Payload::System(SystemCall::Stat { .. }) => match ctx.upstream {
                Some(upstream) => {
                    if let Err(err) = upstream.send(envelope) {
                        warn!(segment_id = %self.id, "Failed to forward STAT upstream: {}", err);
                    }
                }
                None => debug!(segment_id = %self.id, "No upstream supervisor; dropping STAT"),
            },
            // Spawners that pass ONLINE through as a plain message still bring
            // the segment online.
            Payload::System(SystemCall::Online) => self.on_online(ctx),
            Payload::Daemon { key, message } => {
                let Some(service) = ctx.services.get(&key) else {
                    panic!(
                        "segment {} sent a DAEMON message for unregistered service `{}`",
                        self.id, key
                    );
                };
                service.message(&self.link, &message);
            }
            Payload::Application(message) => self.emit(SegmentEvent::Message(message)),
        }
    }

    fn on_disconnect(&mut self) {
        if self.process.is_dead() || self.state == SegmentState::Exited {
            return;
        }
        self.state = SegmentState::Disconnected;
        warn!(
            segment_id = %self.id,
            pid = ?self.link.pid,
            "Segment channel closed; sending SIGHUP"
        );
        if let Err(err) = self.process.signal(Signal::SIGHUP) {
            warn!(segment_id = %self.id, "Failed to send SIGHUP: {}", err);
        }

        if self.escalation.is_none() {
            let events = self.events.clone();
            self.escalation = Some(tokio::spawn(async move {
                tokio::time::sleep(ESCALATION_GRACE).await;
                events.emit(ProcessEvent::EscalationDue);
            }));
        }
    }

    fn on_escalation(&mut self) {
        if self.escalation.take().is_none() {
            return;
        }
        if self.process.is_dead() {
            debug!(segment_id = %self.id, "Segment exited during hang-up grace");
            return;
        }
        warn!(
            segment_id = %self.id,
            pid = ?self.link.pid,
            "Segment survived SIGHUP; sending SIGKILL"
        );
        if let Err(err) = self.process.signal(Signal::SIGKILL) {
            warn!(segment_id = %self.id, "Failed to send SIGKILL: {}", err);
        }
    }

    fn on_exit(&mut self, info: ExitInfo, policy: &RestartPolicy) -> Transition {
        if let Some(timer) = self.escalation.take() {
            timer.abort();
        }
        self.state = SegmentState::Exited;
        self.times.dead = Some(Instant::now());
        let age = self.times.age();

        self.emit(SegmentEvent::Death(info));

        let decision = policy.decide(self.intentional_close, age, info);
        info!(
            segment_id = %self.id,
            pid = ?self.link.pid,
            code = ?info.code,
            signal = ?info.signal,
            age_ms = age.as_millis() as u64,
            ?decision,
            "Segment exited"
        );
        Transition::Exited { info, decision }
    }

    pub(crate) fn begin_restart(&mut self) {
        self.state = SegmentState::Restarting;
    }

    /// Point this interface at a replacement process and announce it.
    pub(crate) fn rebind(
        &mut self,
        id: SegmentId,
        process: Box<dyn SegmentProcess>,
        events: EventSink,
        launch: LaunchConfig,
        previous: ExitInfo,
    ) {
        self.link = link_for(&id, process.as_ref(), self.link.upstream.take());
        self.id = id;
        self.launch = launch;
        self.process = process;
        self.events = events;
        self.intentional_close = false;
        self.times = LifecycleTimes::started_now();
        self.state = SegmentState::Launching;
        self.emit(SegmentEvent::Restart(previous));
    }

    pub(crate) fn retire(&mut self, info: ExitInfo) {
        self.state = SegmentState::EndOfLife;
        self.emit(SegmentEvent::EndOfLife(info));
        self.observers.clear();
    }
}

impl std::fmt::Debug for SegmentInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentInterface")
            .field("serial", &self.serial)
            .field("id", &self.id)
            .field("pid", &self.link.pid)
            .field("state", &self.state)
            .field("intentional_close", &self.intentional_close)
            .finish()
    }
}
