// src/coordinator/ring.rs - Fixed-capacity sample buffer and window statistics
use chrono::{DateTime, Utc};
use modax_shared::{AggregatedWindow, ChannelStats, SensorSample};
use std::collections::VecDeque;
use tokio::time::Instant;

#[derive(Debug)]
pub struct TelemetryRing {
    entries: VecDeque<(Instant, SensorSample)>,
    capacity: usize,
    overwritten: u64,
}

impl TelemetryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            overwritten: 0,
        }
    }

    /// Appends a sample, overwriting the oldest one when full.
    pub fn push(&mut self, at: Instant, sample: SensorSample) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
            self.overwritten += 1;
        }
        self.entries.push_back((at, sample));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn overwritten(&self) -> u64 {
        self.overwritten
    }

    pub fn latest(&self) -> Option<&SensorSample> {
        self.entries.back().map(|(_, s)| s)
    }

    /// Samples received at or after `from`, oldest first.
    pub fn since(&self, from: Instant) -> impl Iterator<Item = &SensorSample> + Clone {
        self.entries.iter().filter(move |(at, _)| *at >= from).map(|(_, s)| s)
    }
}

/// Summarizes one window. Current and temperature pool every channel of every sample;
/// vibration uses the magnitude.
pub fn aggregate<'a>(
    device_id: &str,
    samples: impl Iterator<Item = &'a SensorSample> + Clone,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> AggregatedWindow {
    AggregatedWindow {
        device_id: device_id.to_string(),
        window_start,
        window_end,
        sample_count: samples.clone().count(),
        current: ChannelStats::from_values(
            samples.clone().flat_map(|s| s.motor_currents.iter().copied()),
        ),
        vibration: ChannelStats::from_values(samples.clone().map(|s| s.vibration.magnitude)),
        temperature: ChannelStats::from_values(
            samples.flat_map(|s| s.temperatures.iter().copied()),
        ),
    }
}
