//! Outbound control commands and their outcomes.

use crate::geometry::PathSegment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who asked for a command. Only operators may clear a latched emergency stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandOrigin {
    #[default]
    Operator,
    Program,
    Advisory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpindleDirection {
    Clockwise,
    CounterClockwise,
    Stopped,
}

impl SpindleDirection {
    /// Opposite rotation; a stopped spindle stays stopped.
    pub fn reversed(self) -> Self {
        match self {
            SpindleDirection::Clockwise => SpindleDirection::CounterClockwise,
            SpindleDirection::CounterClockwise => SpindleDirection::Clockwise,
            SpindleDirection::Stopped => SpindleDirection::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoolantMode {
    Mist,
    Flood,
    Off,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    Motion { segment: PathSegment },
    Dwell { seconds: f64 },
    Spindle { direction: SpindleDirection, rpm: f64 },
    SpindleStop,
    Coolant { mode: CoolantMode },
    ToolChange { tool: u32 },
    /// Programmed stop (M0/M1); the device waits for cycle start.
    ProgramPause,
    FeedHold,
    /// Abort all motion.
    Stop,
    /// Host-side: operator feed override in percent.
    SetFeedOverride { percent: f64 },
    /// Host-side: acknowledge and clear a latched emergency stop.
    ResetInterlock,
}

impl CommandKind {
    /// Commands that only ever bring the machine closer to rest.
    pub fn is_safe_direction(&self) -> bool {
        matches!(
            self,
            CommandKind::FeedHold
                | CommandKind::Stop
                | CommandKind::ProgramPause
                | CommandKind::SpindleStop
                | CommandKind::Spindle { direction: SpindleDirection::Stopped, .. }
                | CommandKind::Coolant { mode: CoolantMode::Off }
        )
    }

    /// Commands the host settles itself without sending anything to the device.
    pub fn is_host_local(&self) -> bool {
        matches!(self, CommandKind::SetFeedOverride { .. } | CommandKind::ResetInterlock)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Motion { .. } => "motion",
            CommandKind::Dwell { .. } => "dwell",
            CommandKind::Spindle { .. } => "spindle",
            CommandKind::SpindleStop => "spindle_stop",
            CommandKind::Coolant { .. } => "coolant",
            CommandKind::ToolChange { .. } => "tool_change",
            CommandKind::ProgramPause => "program_pause",
            CommandKind::FeedHold => "feed_hold",
            CommandKind::Stop => "stop",
            CommandKind::SetFeedOverride { .. } => "set_feed_override",
            CommandKind::ResetInterlock => "reset_interlock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub id: Uuid,
    pub device_id: String,
    pub origin: CommandOrigin,
    #[serde(flatten)]
    pub kind: CommandKind,
    pub issued_at: DateTime<Utc>,
}

impl ControlCommand {
    pub fn new(device_id: impl Into<String>, origin: CommandOrigin, kind: CommandKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            origin,
            kind,
            issued_at: Utc::now(),
        }
    }
}

/// Device acknowledgement of a dispatched command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: Uuid,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CommandAck {
    pub fn executed(command_id: Uuid) -> Self {
        Self { command_id, ok: true, reason: None }
    }

    pub fn rejected(command_id: Uuid, reason: impl Into<String>) -> Self {
        Self { command_id, ok: false, reason: Some(reason.into()) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "lowercase")]
pub enum CommandOutcome {
    Executed,
    Blocked(String),
    Failed(String),
}

/// Final outcome of one command. Every command produces exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: Uuid,
    pub device_id: String,
    pub command: String,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
    pub completed_at: DateTime<Utc>,
}

impl CommandResult {
    pub fn new(command: &ControlCommand, outcome: CommandOutcome) -> Self {
        Self {
            command_id: command.id,
            device_id: command.device_id.clone(),
            command: command.kind.name().to_string(),
            outcome,
            completed_at: Utc::now(),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.outcome == CommandOutcome::Executed
    }
}
