//! Interlock state machine and the command gate.
//!
//! `SafetyValidator::authorize` is the only way to obtain an [`Allow`], and the coordinator's
//! dispatch path takes an `Allow` by value. An `Allow` remembers the safety epoch it was
//! issued in; the epoch advances on every transition away from SAFE, so a command queued
//! before an interlock tripped is refused at the link even though it was authorized.
//! Commands that bring the machine to rest survive an epoch change unless the emergency
//! stop latch is set.

use modax_shared::{CommandKind, CommandOrigin, ControlCommand, SafetyStatus};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsafeReason {
    EmergencyStop,
    EnclosureOpen,
    Overload,
    ThermalFault,
    StaleTelemetry,
}

impl fmt::Display for UnsafeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnsafeReason::EmergencyStop => "emergency stop",
            UnsafeReason::EnclosureOpen => "enclosure open",
            UnsafeReason::Overload => "overload",
            UnsafeReason::ThermalFault => "thermal fault",
            UnsafeReason::StaleTelemetry => "telemetry stale",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reasons", rename_all = "snake_case")]
pub enum SafetyState {
    Safe,
    Unsafe(Vec<UnsafeReason>),
    EstopLatched,
}

impl SafetyState {
    pub fn is_safe(&self) -> bool {
        matches!(self, SafetyState::Safe)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyError {
    #[error("interlock reset must come from an operator, not {0:?}")]
    ResetNotPermitted(CommandOrigin),
    #[error("cannot reset while {0} is asserted")]
    InterlockAsserted(UnsafeReason),
}

/// Proof that one command was authorized. Not `Clone`; consumed by dispatch.
#[derive(Debug)]
pub struct Allow {
    command_id: Uuid,
    epoch: u64,
    safe_direction: bool,
}

impl Allow {
    pub fn command_id(&self) -> Uuid {
        self.command_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

#[derive(Debug)]
pub enum Authorization {
    Allow(Allow),
    Block(String),
}

#[derive(Debug, Default)]
struct EpochCell {
    counter: AtomicU64,
    latched: AtomicBool,
}

/// Read side of a validator's epoch, handed to the task that writes to the device.
#[derive(Debug, Clone, Default)]
pub struct SafetyEpoch(Arc<EpochCell>);

impl SafetyEpoch {
    pub fn current(&self) -> u64 {
        self.0.counter.load(Ordering::Acquire)
    }

    pub fn latched(&self) -> bool {
        self.0.latched.load(Ordering::Acquire)
    }

    /// Whether an authorization is still valid. A stale epoch only invalidates commands the
    /// gate would refuse while unsafe, and everything once the latch is set.
    pub fn admits(&self, allow: &Allow) -> bool {
        if self.latched() {
            return false;
        }
        allow.epoch == self.current() || allow.safe_direction
    }

    fn advance(&self, latched: bool) {
        self.0.latched.store(latched, Ordering::Release);
        self.0.counter.fetch_add(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.0.latched.store(false, Ordering::Release);
    }
}

/// Every condition in `status` that makes a device unsafe, in a fixed order.
pub fn unsafe_reasons(status: &SafetyStatus) -> Vec<UnsafeReason> {
    let mut reasons = Vec::new();
    if status.emergency_stop {
        reasons.push(UnsafeReason::EmergencyStop);
    }
    if !status.enclosure_closed {
        reasons.push(UnsafeReason::EnclosureOpen);
    }
    if status.overload_detected {
        reasons.push(UnsafeReason::Overload);
    }
    if !status.thermal_ok {
        reasons.push(UnsafeReason::ThermalFault);
    }
    if status.stale {
        reasons.push(UnsafeReason::StaleTelemetry);
    }
    reasons
}

fn state_for(reasons: Vec<UnsafeReason>) -> SafetyState {
    if reasons.is_empty() {
        SafetyState::Safe
    } else {
        SafetyState::Unsafe(reasons)
    }
}

fn describe(reasons: &[UnsafeReason]) -> String {
    reasons.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
}

#[derive(Debug)]
pub struct SafetyValidator {
    state: SafetyState,
    epoch: SafetyEpoch,
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyValidator {
    /// Starts UNSAFE: nothing is known about the device until telemetry arrives.
    pub fn new() -> Self {
        Self {
            state: SafetyState::Unsafe(unsafe_reasons(&SafetyStatus::UNKNOWN)),
            epoch: SafetyEpoch::default(),
        }
    }

    pub fn state(&self) -> &SafetyState {
        &self.state
    }

    pub fn epoch(&self) -> SafetyEpoch {
        self.epoch.clone()
    }

    fn transition(&mut self, next: SafetyState) -> Option<(SafetyState, SafetyState)> {
        if next == self.state {
            return None;
        }
        if next.is_safe() {
            self.epoch.release();
        } else {
            self.epoch.advance(next == SafetyState::EstopLatched);
        }
        let previous = std::mem::replace(&mut self.state, next.clone());
        Some((previous, next))
    }

    /// Feeds one status snapshot. Pure state transition; returns `(from, to)` on change.
    pub fn observe(&mut self, status: &SafetyStatus) -> Option<(SafetyState, SafetyState)> {
        if status.emergency_stop {
            return self.transition(SafetyState::EstopLatched);
        }
        if self.state == SafetyState::EstopLatched {
            return None;
        }
        let reasons = unsafe_reasons(status);
        self.transition(state_for(reasons))
    }

    /// The gate. Never allows anything while `status` asserts emergency stop or the latch is
    /// set; while UNSAFE only commands that bring the machine to rest pass.
    pub fn authorize(&self, command: &ControlCommand, status: &SafetyStatus) -> Authorization {
        if status.emergency_stop {
            return Authorization::Block("emergency stop asserted".to_string());
        }
        if self.state == SafetyState::EstopLatched {
            let reason = "emergency stop latched, operator reset required";
            return Authorization::Block(reason.to_string());
        }
        if matches!(command.kind, CommandKind::ResetInterlock) {
            return Authorization::Block("interlock reset is not a device command".to_string());
        }
        let mut reasons = match &self.state {
            SafetyState::Unsafe(reasons) => reasons.clone(),
            _ => Vec::new(),
        };
        for reason in unsafe_reasons(status) {
            if !reasons.contains(&reason) {
                reasons.push(reason);
            }
        }
        if !reasons.is_empty() && !command.kind.is_safe_direction() {
            return Authorization::Block(format!("unsafe: {}", describe(&reasons)));
        }
        Authorization::Allow(Allow {
            command_id: command.id,
            epoch: self.epoch.current(),
            safe_direction: command.kind.is_safe_direction(),
        })
    }

    /// Operator acknowledgement of a latched emergency stop.
    pub fn reset(
        &mut self,
        origin: CommandOrigin,
        status: &SafetyStatus,
    ) -> Result<&SafetyState, SafetyError> {
        if origin != CommandOrigin::Operator {
            return Err(SafetyError::ResetNotPermitted(origin));
        }
        if status.emergency_stop {
            return Err(SafetyError::InterlockAsserted(UnsafeReason::EmergencyStop));
        }
        if self.state == SafetyState::EstopLatched {
            let reasons = unsafe_reasons(status);
            self.transition(state_for(reasons));
            tracing::info!("Emergency stop latch reset by operator");
        }
        Ok(&self.state)
    }
}
