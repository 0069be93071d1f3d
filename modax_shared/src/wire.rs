//! JSON-lines framing for the device link: one `DeviceMessage` per line.

use crate::command::{CommandAck, ControlCommand};
use crate::telemetry::{SafetyFrame, SensorSample};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("empty line")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceMessage {
    Sensor(SensorSample),
    Safety(SafetyFrame),
    Ack(CommandAck),
    Command(ControlCommand),
}

impl DeviceMessage {
    /// Device id for telemetry messages.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            DeviceMessage::Sensor(s) => Some(&s.device_id),
            DeviceMessage::Safety(s) => Some(&s.device_id),
            DeviceMessage::Command(c) => Some(&c.device_id),
            DeviceMessage::Ack(_) => None,
        }
    }
}

/// Encodes a message as a single newline-terminated line.
pub fn encode_line(message: &DeviceMessage) -> Result<String, WireError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line(line: &str) -> Result<DeviceMessage, WireError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(WireError::Empty);
    }
    Ok(serde_json::from_str(line)?)
}
