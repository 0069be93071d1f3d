// src/coordinator/device.rs - Per-device worker: the single writer of a device's state
use super::advisory::AdvisoryBridge;
use super::link::{LinkEvent, LinkJob, LinkSupervisor};
use super::ring::{aggregate, TelemetryRing};
use super::SubmitError;
use crate::config::Config;
use crate::gcode::{ModalState, Program};
use crate::job::{JobState, ProgramHandle, ProgramRunner, ProgramStatus, RunnerEvent};
use crate::safety::{Authorization, SafetyState, SafetyValidator};
use crate::tooling::ToolingManager;
use crate::transport::{LinkConnector, Telemetry};
use chrono::{DateTime, Utc};
use modax_shared::{
    AggregatedWindow, CommandKind, CommandOutcome, CommandResult, ControlCommand, Recommendation,
    SafetyStatus,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

const INBOX_DEPTH: usize = 256;
const TELEMETRY_DEPTH: usize = 1024;
const LINK_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

/// Answer to a status query.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub connection: ConnectionState,
    pub last_seen: Option<DateTime<Utc>>,
    pub safety: SafetyStatus,
    pub safety_state: SafetyState,
    pub modal: ModalState,
    pub program: Option<ProgramStatus>,
    pub latest_window: Option<AggregatedWindow>,
    pub recommendation: Option<Recommendation>,
    pub recent_results: Vec<CommandResult>,
    pub warnings: Vec<String>,
}

/// Messages handled by a device worker.
#[derive(Debug)]
pub enum DeviceRequest {
    Execute {
        command: ControlCommand,
        respond_to: oneshot::Sender<CommandResult>,
    },
    Status {
        respond_to: oneshot::Sender<DeviceStatus>,
    },
    StartProgram {
        program: Arc<Program>,
        respond_to: oneshot::Sender<Result<ProgramHandle, SubmitError>>,
    },
    CancelProgram {
        respond_to: oneshot::Sender<bool>,
    },
    /// A dispatched command came back from the link.
    Completed {
        result: CommandResult,
        respond_to: oneshot::Sender<CommandResult>,
    },
    Link(LinkEvent),
    Program(RunnerEvent),
}

/// Handle kept by the coordinator. Dropping it stops the worker and everything it owns.
pub struct DeviceHandle {
    pub requests: mpsc::Sender<DeviceRequest>,
    pub telemetry: mpsc::Sender<Telemetry>,
    worker: JoinHandle<()>,
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

struct ActiveProgram {
    status: ProgramStatus,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct DeviceWorker {
    id: String,
    config: Arc<Config>,
    validator: SafetyValidator,
    status: SafetyStatus,
    ring: TelemetryRing,
    window_started: DateTime<Utc>,
    window_started_at: Instant,
    latest_window: Option<AggregatedWindow>,
    audit: VecDeque<CommandResult>,
    modal: ModalState,
    tooling: ToolingManager,
    link: Option<mpsc::Sender<LinkJob>>,
    link_task: Option<JoinHandle<()>>,
    link_state: ConnectionState,
    link_failure: Option<String>,
    last_seen: Option<DateTime<Utc>>,
    /// Staleness is measured from the later of the last safety frame and the last connect.
    watch_from: Option<Instant>,
    stale: bool,
    program: Option<ActiveProgram>,
    last_program: Option<ProgramStatus>,
    feed_override: watch::Sender<Option<f64>>,
    advisory: Option<AdvisoryBridge>,
    requests: mpsc::WeakSender<DeviceRequest>,
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        if let Some(task) = self.link_task.take() {
            task.abort();
        }
        if let Some(program) = self.program.take() {
            program.task.abort();
        }
    }
}

/// Starts the worker and, with an address, its link supervisor.
pub fn spawn(
    id: &str,
    address: Option<&str>,
    config: Arc<Config>,
    connector: Arc<dyn LinkConnector>,
    advisory: Option<AdvisoryBridge>,
) -> DeviceHandle {
    let (requests_tx, requests_rx) = mpsc::channel(INBOX_DEPTH);
    let (telemetry_tx, telemetry_rx) = mpsc::channel(TELEMETRY_DEPTH);
    let validator = SafetyValidator::new();

    let (link, link_task) = match address {
        Some(address) => {
            let (jobs_tx, jobs_rx) = mpsc::channel(LINK_QUEUE_DEPTH);
            let supervisor = LinkSupervisor {
                device_id: id.to_string(),
                address: address.to_string(),
                connector,
                telemetry: telemetry_tx.clone(),
                worker: requests_tx.clone(),
                jobs: jobs_rx,
                epoch: validator.epoch(),
                config: config.coordinator.clone(),
            };
            (Some(jobs_tx), Some(tokio::spawn(supervisor.run())))
        }
        None => (None, None),
    };

    let worker = DeviceWorker {
        id: id.to_string(),
        validator,
        status: SafetyStatus::UNKNOWN,
        ring: TelemetryRing::new(config.coordinator.ring_capacity),
        window_started: Utc::now(),
        window_started_at: Instant::now(),
        latest_window: None,
        audit: VecDeque::with_capacity(config.coordinator.audit_capacity),
        modal: ModalState::default(),
        tooling: ToolingManager::from_config(&config.tools, &config.coordinates),
        link,
        link_task,
        link_state: ConnectionState::Disconnected,
        link_failure: None,
        last_seen: None,
        watch_from: None,
        stale: false,
        program: None,
        last_program: None,
        feed_override: watch::channel(None).0,
        advisory,
        requests: requests_tx.downgrade(),
        config,
    };
    tracing::info!("Device {} registered", id);
    let handle = tokio::spawn(worker.run(requests_rx, telemetry_rx));
    DeviceHandle { requests: requests_tx, telemetry: telemetry_tx, worker: handle }
}

impl DeviceWorker {
    fn staleness_threshold(&self) -> Duration {
        let c = &self.config.coordinator;
        Duration::from_millis(c.safety_interval_ms * u64::from(c.staleness_factor))
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<DeviceRequest>,
        mut telemetry: mpsc::Receiver<Telemetry>,
    ) {
        let period = Duration::from_secs(self.config.coordinator.window_secs);
        let mut window = tokio::time::interval_at(Instant::now() + period, period);
        window.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let safety_interval = Duration::from_millis(self.config.coordinator.safety_interval_ms);
        let mut staleness = tokio::time::interval(safety_interval);
        staleness.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                Some(frame) = telemetry.recv() => self.ingest(frame),
                request = requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = window.tick() => self.close_window(),
                _ = staleness.tick() => self.check_staleness(),
            }
        }
        tracing::info!("Device worker {} stopped", self.id);
    }

    fn ingest(&mut self, frame: Telemetry) {
        if frame.device_id() != self.id {
            tracing::warn!("Worker {} got telemetry for {}, dropped", self.id, frame.device_id());
            return;
        }
        let now = Instant::now();
        self.last_seen = Some(Utc::now());
        match frame {
            Telemetry::Sensor(sample) => self.ring.push(now, sample),
            Telemetry::Safety(frame) => {
                self.watch_from = Some(now);
                if self.stale {
                    tracing::info!("Telemetry from {} resumed", self.id);
                    self.stale = false;
                }
                self.observe(frame.status);
            }
        }
    }

    fn observe(&mut self, status: SafetyStatus) {
        self.status = status;
        if let Some((from, to)) = self.validator.observe(&status) {
            match &to {
                SafetyState::Safe => tracing::info!("Device {} is SAFE", self.id),
                SafetyState::Unsafe(reasons) => {
                    tracing::warn!("Device {} UNSAFE ({:?}), was {:?}", self.id, reasons, from)
                }
                SafetyState::EstopLatched => {
                    tracing::warn!("Device {} emergency stop latched", self.id)
                }
            }
        }
    }

    fn check_staleness(&mut self) {
        let Some(since) = self.watch_from else {
            return;
        };
        if !self.stale && since.elapsed() > self.staleness_threshold() {
            let silent = since.elapsed();
            tracing::warn!("Telemetry from {} stale for {:?}, forcing UNSAFE", self.id, silent);
            self.stale = true;
            let status = SafetyStatus { stale: true, ..self.status };
            self.observe(status);
        }
    }

    fn close_window(&mut self) {
        let end = Utc::now();
        let samples = self.ring.since(self.window_started_at);
        let summary = aggregate(&self.id, samples, self.window_started, end);
        tracing::debug!("Window for {}: {} samples", self.id, summary.sample_count);
        self.window_started = end;
        self.window_started_at = Instant::now();
        if summary.sample_count > 0 {
            if let Some(advisory) = &self.advisory {
                advisory.publish(summary.clone());
            }
        }
        self.latest_window = Some(summary);
    }

    fn connection_state(&self) -> ConnectionState {
        if self.stale {
            ConnectionState::Degraded
        } else if self.link.is_none() {
            if self.last_seen.is_some() {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            }
        } else {
            self.link_state
        }
    }

    fn handle(&mut self, request: DeviceRequest) {
        match request {
            DeviceRequest::Execute { command, respond_to } => self.execute(command, respond_to),
            DeviceRequest::Completed { result, respond_to } => self.finish(result, respond_to),
            DeviceRequest::Status { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            DeviceRequest::StartProgram { program, respond_to } => {
                let _ = respond_to.send(self.start_program(program));
            }
            DeviceRequest::CancelProgram { respond_to } => {
                let cancelled = match &self.program {
                    Some(active) => active.cancel.send(true).is_ok(),
                    None => false,
                };
                let _ = respond_to.send(cancelled);
            }
            DeviceRequest::Link(LinkEvent::State(state)) => {
                if state == ConnectionState::Connected {
                    self.link_failure = None;
                    self.watch_from = Some(Instant::now());
                }
                self.link_state = state;
            }
            DeviceRequest::Link(LinkEvent::Failed(reason)) => {
                self.link_state = ConnectionState::Degraded;
                self.link_failure = Some(reason);
            }
            DeviceRequest::Program(event) => self.program_event(event),
        }
    }

    fn execute(&mut self, command: ControlCommand, respond_to: oneshot::Sender<CommandResult>) {
        // host-local commands never reach the device; under emergency stop only the reset does
        let latched = self.validator.state() == &SafetyState::EstopLatched;
        let estop = self.status.emergency_stop || latched;
        let local = match command.kind {
            CommandKind::ResetInterlock => true,
            _ => command.kind.is_host_local() && !estop,
        };
        if local {
            let outcome = self.execute_local(&command);
            return self.finish(CommandResult::new(&command, outcome), respond_to);
        }
        let allow = match self.validator.authorize(&command, &self.status) {
            Authorization::Allow(allow) => allow,
            Authorization::Block(reason) => {
                tracing::warn!("Blocked {} for {}: {}", command.kind.name(), self.id, reason);
                let result = CommandResult::new(&command, CommandOutcome::Blocked(reason));
                return self.finish(result, respond_to);
            }
        };
        let sent = match &self.link {
            Some(link) => link.try_send(LinkJob { command, allow, respond_to }),
            None => {
                let outcome = CommandOutcome::Failed("device has no command link".into());
                return self.finish(CommandResult::new(&command, outcome), respond_to);
            }
        };
        let (job, reason) = match sent {
            Ok(()) => return,
            Err(mpsc::error::TrySendError::Full(job)) => (job, "dispatch queue full"),
            Err(mpsc::error::TrySendError::Closed(job)) => (job, "link task stopped"),
        };
        let result = CommandResult::new(&job.command, CommandOutcome::Failed(reason.into()));
        self.finish(result, job.respond_to);
    }

    fn execute_local(&mut self, command: &ControlCommand) -> CommandOutcome {
        match &command.kind {
            CommandKind::ResetInterlock => {
                let reset = self.validator.reset(command.origin, &self.status);
                match reset {
                    Ok(state) => {
                        tracing::info!("Interlock reset on {}, now {:?}", self.id, state);
                        CommandOutcome::Executed
                    }
                    Err(e) => {
                        tracing::warn!("Reset on {} refused: {}", self.id, e);
                        CommandOutcome::Blocked(e.to_string())
                    }
                }
            }
            CommandKind::SetFeedOverride { percent } => {
                let (min, max) = (self.config.motion.override_min, self.config.motion.override_max);
                let applied = self.modal.set_feed_override(*percent, min, max);
                self.feed_override.send_replace(Some(applied));
                CommandOutcome::Executed
            }
            other => CommandOutcome::Failed(format!("{} is not a host command", other.name())),
        }
    }

    /// Records the result in the audit trail and answers the caller.
    fn finish(&mut self, result: CommandResult, respond_to: oneshot::Sender<CommandResult>) {
        tracing::info!(
            "[{}] {} {} -> {:?}",
            self.id,
            result.command_id,
            result.command,
            result.outcome
        );
        if self.audit.len() >= self.config.coordinator.audit_capacity.max(1) {
            self.audit.pop_front();
        }
        self.audit.push_back(result.clone());
        let _ = respond_to.send(result);
    }

    fn start_program(&mut self, program: Arc<Program>) -> Result<ProgramHandle, SubmitError> {
        if self.program.is_some() {
            return Err(SubmitError::Busy(self.id.clone()));
        }
        let Some(requests) = self.requests.upgrade() else {
            return Err(SubmitError::Busy(self.id.clone()));
        };
        let handle = ProgramHandle {
            id: Uuid::new_v4(),
            device_id: self.id.clone(),
            instructions: program.len(),
            source_lines: program.source_lines,
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let runner = ProgramRunner::new(
            &self.id,
            program,
            self.config.interpreter.clone(),
            &self.config.motion,
            ModalState::new_session(&self.modal),
            self.tooling.clone(),
            requests,
            self.feed_override.subscribe(),
            cancel_rx,
        );
        let status = ProgramStatus {
            handle: handle.id,
            state: JobState::Running,
            line: 0,
            segments_dispatched: 0,
        };
        tracing::info!(
            "Program {} started on {} ({} instructions)",
            handle.id,
            self.id,
            handle.instructions
        );
        let task = tokio::spawn(runner.run());
        self.program = Some(ActiveProgram { status, cancel: cancel_tx, task });
        Ok(handle)
    }

    fn program_event(&mut self, event: RunnerEvent) {
        let Some(active) = self.program.as_mut() else {
            return;
        };
        match event {
            RunnerEvent::Progress { line, segments_dispatched, modal } => {
                active.status.line = line;
                active.status.segments_dispatched = segments_dispatched;
                self.modal = *modal;
            }
            RunnerEvent::Finished { state, modal, tooling } => {
                active.status.state = state;
                self.modal = *modal;
                self.tooling = *tooling;
                self.last_program = self.program.take().map(|p| p.status);
            }
        }
    }

    fn snapshot(&self) -> DeviceStatus {
        let mut warnings = Vec::new();
        if self.stale {
            let threshold = self.staleness_threshold();
            warnings.push(format!("telemetry stale: no safety frame within {:?}", threshold));
        }
        if let Some(reason) = &self.link_failure {
            warnings.push(reason.clone());
        }
        if self.validator.state() == &SafetyState::EstopLatched {
            warnings.push("emergency stop latched: operator reset required".to_string());
        }
        DeviceStatus {
            device_id: self.id.clone(),
            connection: self.connection_state(),
            last_seen: self.last_seen,
            safety: self.status,
            safety_state: self.validator.state().clone(),
            modal: self.modal.clone(),
            program: self
                .program
                .as_ref()
                .map(|p| p.status.clone())
                .or_else(|| self.last_program.clone()),
            latest_window: self.latest_window.clone(),
            recommendation: None,
            recent_results: self.audit.iter().cloned().collect(),
            warnings,
        }
    }
}
