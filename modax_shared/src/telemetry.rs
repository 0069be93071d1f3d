//! Telemetry frames reported by field hardware and the window summaries built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vibration {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub magnitude: f64,
}

impl Vibration {
    pub fn from_axes(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, magnitude: (x * x + y * y + z * z).sqrt() }
    }
}

/// One reading from the sensor channel (nominally 10 Hz).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    /// Device-monotonic timestamp in milliseconds.
    pub timestamp: u64,
    pub device_id: String,
    #[serde(default)]
    pub motor_currents: Vec<f64>,
    #[serde(default)]
    pub vibration: Vibration,
    #[serde(default)]
    pub temperatures: Vec<f64>,
}

/// Interlock snapshot for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub emergency_stop: bool,
    #[serde(rename = "door_closed")]
    pub enclosure_closed: bool,
    pub overload_detected: bool,
    #[serde(rename = "temperature_ok")]
    pub thermal_ok: bool,
    /// Set by the host when the safety channel has gone silent.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

impl SafetyStatus {
    /// All interlocks released.
    pub const NOMINAL: SafetyStatus = SafetyStatus {
        emergency_stop: false,
        enclosure_closed: true,
        overload_detected: false,
        thermal_ok: true,
        stale: false,
    };

    /// Status assumed before the first frame arrives.
    pub const UNKNOWN: SafetyStatus = SafetyStatus {
        emergency_stop: false,
        enclosure_closed: false,
        overload_detected: false,
        thermal_ok: false,
        stale: true,
    };

    pub fn is_safe(&self) -> bool {
        !self.emergency_stop
            && self.enclosure_closed
            && !self.overload_detected
            && self.thermal_ok
            && !self.stale
    }
}

impl Default for SafetyStatus {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

/// One reading from the safety channel (nominally 20 Hz).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyFrame {
    pub timestamp: u64,
    pub device_id: String,
    #[serde(flatten)]
    pub status: SafetyStatus,
}

/// Summary statistics for one telemetry channel over a window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

impl ChannelStats {
    /// Returns `None` for an empty series.
    pub fn from_values<I>(values: I) -> Option<Self>
    where
        I: IntoIterator<Item = f64>,
    {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            count += 1;
            sum += v;
            sum_sq += v * v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            return None;
        }
        let n = count as f64;
        let mean = sum / n;
        let variance = (sum_sq / n - mean * mean).max(0.0);
        Some(Self { mean, min, max, stddev: variance.sqrt() })
    }
}

/// Fixed-period summary of a device's sensor channel, the unit handed to the advisory tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedWindow {
    pub device_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub sample_count: usize,
    pub current: Option<ChannelStats>,
    pub vibration: Option<ChannelStats>,
    pub temperature: Option<ChannelStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_stats() {
        let stats = ChannelStats::from_values([2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        assert!((stats.stddev - 2.0).abs() < 1e-12);
        assert!(ChannelStats::from_values(std::iter::empty()).is_none());
    }

    #[test]
    fn test_safety_frame_wire_names() {
        let json = r#"{"timestamp":12,"device_id":"mill-1","emergency_stop":false,"door_closed":true,"overload_detected":false,"temperature_ok":true}"#;
        let frame: SafetyFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.device_id, "mill-1");
        assert!(frame.status.is_safe());
    }

    #[test]
    fn test_unknown_status_is_unsafe() {
        assert!(!SafetyStatus::default().is_safe());
        let mut status = SafetyStatus::NOMINAL;
        status.stale = true;
        assert!(!status.is_safe());
    }
}
