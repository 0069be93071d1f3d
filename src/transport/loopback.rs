// src/transport/loopback.rs - In-process device: acks everything, may report telemetry
use super::{ConnectivityError, DeviceLink, LinkSession, Telemetry, TelemetrySink};
use async_trait::async_trait;
use modax_shared::{CommandAck, ControlCommand, SafetyFrame, SafetyStatus, SensorSample, Vibration};
use rand::Rng;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub struct LoopbackLink {
    reporter: Option<JoinHandle<()>>,
    _closed: oneshot::Sender<()>,
}

impl LoopbackLink {
    /// `intervals` is `(sensor, safety)`; `None` opens a link that never reports telemetry.
    pub fn open(
        device_id: &str,
        telemetry: TelemetrySink,
        intervals: Option<(Duration, Duration)>,
    ) -> LinkSession {
        let (closed_tx, closed_rx) = oneshot::channel();
        let reporter = intervals.map(|(sensor, safety)| {
            tokio::spawn(report(device_id.to_string(), telemetry, sensor, safety))
        });
        tracing::info!("Opened loopback link for {}", device_id);
        let link = LoopbackLink { reporter, _closed: closed_tx };
        LinkSession { link: Box::new(link), closed: closed_rx }
    }
}

#[async_trait]
impl DeviceLink for LoopbackLink {
    async fn send(
        &self,
        command: &ControlCommand,
        _timeout: Duration,
    ) -> Result<CommandAck, ConnectivityError> {
        tracing::debug!("loopback executed {} ({})", command.kind.name(), command.id);
        Ok(CommandAck::executed(command.id))
    }
}

impl Drop for LoopbackLink {
    fn drop(&mut self) {
        if let Some(reporter) = self.reporter.take() {
            reporter.abort();
        }
    }
}

async fn report(
    device_id: String,
    sink: TelemetrySink,
    sensor_every: Duration,
    safety_every: Duration,
) {
    let started = Instant::now();
    let mut sensor = tokio::time::interval(sensor_every);
    let mut safety = tokio::time::interval(safety_every);
    sensor.set_missed_tick_behavior(MissedTickBehavior::Skip);
    safety.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        let frame = tokio::select! {
            _ = sensor.tick() => {
                Telemetry::Sensor(simulated_sample(&device_id, elapsed_ms(started)))
            }
            _ = safety.tick() => Telemetry::Safety(SafetyFrame {
                timestamp: elapsed_ms(started),
                device_id: device_id.clone(),
                status: SafetyStatus::NOMINAL,
            }),
        };
        if sink.send(frame).await.is_err() {
            break;
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn simulated_sample(device_id: &str, timestamp: u64) -> SensorSample {
    let mut rng = rand::rng();
    let mut noise = |base: f64, spread: f64| base + rng.random_range(-spread..spread);
    SensorSample {
        timestamp,
        device_id: device_id.to_string(),
        motor_currents: vec![noise(2.0, 0.2), noise(2.0, 0.2), noise(1.5, 0.1)],
        vibration: Vibration::from_axes(noise(0.05, 0.02), noise(0.05, 0.02), noise(0.08, 0.02)),
        temperatures: vec![noise(35.0, 0.5)],
    }
}
