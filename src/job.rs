// src/job.rs - Runs one accepted program: interpreter, planner, gated dispatch, in order
use crate::config::{InterpreterConfig, MotionConfig};
use crate::coordinator::device::DeviceRequest;
use crate::gcode::{Action, Interpreter, ModalState, Program, Step};
use crate::motion::{MotionPlanner, PlannedStep};
use crate::tooling::ToolingManager;
use modax_shared::{
    CommandKind, CommandOrigin, CommandOutcome, CommandResult, ControlCommand, CoolantMode,
    SpindleDirection,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Halted { line: usize, reason: String },
    Cancelled,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

/// Returned to the submitter when a program is accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramHandle {
    pub id: Uuid,
    pub device_id: String,
    pub instructions: usize,
    pub source_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramStatus {
    pub handle: Uuid,
    #[serde(flatten)]
    pub state: JobState,
    /// Line of the step being executed.
    pub line: usize,
    pub segments_dispatched: usize,
}

#[derive(Debug)]
pub enum RunnerEvent {
    Progress { line: usize, segments_dispatched: usize, modal: Box<ModalState> },
    Finished { state: JobState, modal: Box<ModalState>, tooling: Box<ToolingManager> },
}

pub struct ProgramRunner {
    device_id: String,
    interpreter: Interpreter,
    planner: MotionPlanner,
    modal: ModalState,
    tooling: ToolingManager,
    device: mpsc::Sender<DeviceRequest>,
    feed_override: watch::Receiver<Option<f64>>,
    override_range: (f64, f64),
    cancel: watch::Receiver<bool>,
    segments: usize,
}

impl ProgramRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device_id: &str,
        program: Arc<Program>,
        limits: InterpreterConfig,
        motion: &MotionConfig,
        modal: ModalState,
        tooling: ToolingManager,
        device: mpsc::Sender<DeviceRequest>,
        feed_override: watch::Receiver<Option<f64>>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let override_range = (motion.override_min, motion.override_max);
        Self {
            device_id: device_id.to_string(),
            interpreter: Interpreter::new(program, limits, override_range),
            planner: MotionPlanner::new(motion),
            modal,
            tooling,
            device,
            feed_override,
            override_range,
            cancel,
            segments: 0,
        }
    }

    pub async fn run(mut self) {
        // machine position confirmed by executed motion
        let mut confirmed = self.modal.position;
        if let Some(percent) = *self.feed_override.borrow_and_update() {
            let (min, max) = self.override_range;
            self.modal.set_feed_override(percent, min, max);
        }

        let state = loop {
            if *self.cancel.borrow() {
                break JobState::Cancelled;
            }
            if self.feed_override.has_changed().unwrap_or(false) {
                if let Some(percent) = *self.feed_override.borrow_and_update() {
                    let (min, max) = self.override_range;
                    self.modal.set_feed_override(percent, min, max);
                }
            }

            let step = match self.interpreter.next_step(&mut self.modal, &mut self.tooling) {
                Ok(Some(step)) => step,
                Ok(None) => break JobState::Completed,
                Err(e) => {
                    tracing::error!("Program on {} halted: {}", self.device_id, e);
                    break JobState::Halted { line: e.line, reason: e.kind.to_string() };
                }
            };
            let line = step.line;
            let end = matches!(step.action, Action::End);

            let commands = match self.commands_for(step) {
                Ok(commands) => commands,
                Err(reason) => {
                    tracing::error!(
                        "Program on {} halted at line {}: {}",
                        self.device_id,
                        line,
                        reason
                    );
                    break JobState::Halted { line, reason };
                }
            };

            let mut halted = None;
            for kind in commands {
                let segment_end = match &kind {
                    CommandKind::Motion { segment } => Some(segment.end),
                    _ => None,
                };
                match self.dispatch(kind).await {
                    Ok(result) if result.is_executed() => {
                        if let Some(end) = segment_end {
                            confirmed = end;
                            self.segments += 1;
                        }
                    }
                    Ok(result) => {
                        let reason = match result.outcome {
                            CommandOutcome::Blocked(r) => format!("blocked: {}", r),
                            CommandOutcome::Failed(r) => format!("failed: {}", r),
                            CommandOutcome::Executed => String::new(),
                        };
                        halted = Some(JobState::Halted { line, reason });
                        break;
                    }
                    Err(state) => {
                        halted = Some(state);
                        break;
                    }
                }
            }
            if let Some(state) = halted {
                break state;
            }

            let progress = RunnerEvent::Progress {
                line,
                segments_dispatched: self.segments,
                modal: Box::new(self.modal.clone()),
            };
            if self.device.send(DeviceRequest::Program(progress)).await.is_err() {
                return;
            }
            if end {
                break JobState::Completed;
            }
        };

        match &state {
            JobState::Completed => {
                let segments = self.segments;
                tracing::info!("Program on {} completed, {} segments", self.device_id, segments)
            }
            JobState::Cancelled => tracing::info!("Program on {} cancelled", self.device_id),
            _ => {}
        }
        self.modal.position = confirmed;
        let finished = RunnerEvent::Finished {
            state,
            modal: Box::new(self.modal),
            tooling: Box::new(self.tooling),
        };
        let _ = self.device.send(DeviceRequest::Program(finished)).await;
    }

    /// Device commands for one interpreter step, planned before any of them is sent.
    fn commands_for(&mut self, step: Step) -> Result<Vec<CommandKind>, String> {
        let Step { action, .. } = step;
        Ok(match action {
            Action::Move(request) => self
                .planner
                .plan_move(&request, &self.modal)
                .map_err(|e| e.kind.to_string())?
                .into_iter()
                .map(|segment| CommandKind::Motion { segment })
                .collect(),
            Action::Cycle(request) => self
                .planner
                .plan_cycle(&request, &self.modal)
                .map_err(|e| e.kind.to_string())?
                .into_iter()
                .map(|planned| match planned {
                    PlannedStep::Segment(segment) => CommandKind::Motion { segment },
                    PlannedStep::Dwell(seconds) => CommandKind::Dwell { seconds },
                    PlannedStep::Spindle { direction, rpm } => spindle_command(direction, rpm),
                })
                .collect(),
            Action::Dwell { seconds } => vec![CommandKind::Dwell { seconds }],
            Action::Spindle { direction, rpm } => vec![spindle_command(direction, rpm)],
            Action::Coolant { mode } => vec![CommandKind::Coolant { mode }],
            Action::ToolChange { tool } => vec![CommandKind::ToolChange { tool }],
            Action::Pause { .. } => vec![CommandKind::ProgramPause],
            Action::End => {
                // M2/M30 leave the spindle stopped and coolant off
                let mut commands = Vec::new();
                if self.modal.spindle != SpindleDirection::Stopped {
                    self.modal.spindle = SpindleDirection::Stopped;
                    commands.push(CommandKind::SpindleStop);
                }
                if self.modal.coolant != CoolantMode::Off {
                    self.modal.coolant = CoolantMode::Off;
                    commands.push(CommandKind::Coolant { mode: CoolantMode::Off });
                }
                commands
            }
        })
    }

    /// Sends one command through the device worker's gate and waits for its result.
    async fn dispatch(&mut self, kind: CommandKind) -> Result<CommandResult, JobState> {
        let command = ControlCommand::new(self.device_id.clone(), CommandOrigin::Program, kind);
        let (respond_to, rx) = oneshot::channel();
        if self.device.send(DeviceRequest::Execute { command, respond_to }).await.is_err() {
            return Err(JobState::Cancelled);
        }
        tokio::select! {
            result = rx => result.map_err(|_| JobState::Cancelled),
            _ = self.cancel.wait_for(|c| *c) => Err(JobState::Cancelled),
        }
    }
}

fn spindle_command(direction: SpindleDirection, rpm: f64) -> CommandKind {
    match direction {
        SpindleDirection::Stopped => CommandKind::SpindleStop,
        direction => CommandKind::Spindle { direction, rpm },
    }
}
