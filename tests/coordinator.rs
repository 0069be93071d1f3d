// Coordinator tests on a paused clock: backoff, staleness, windows, audit, lifecycle

use async_trait::async_trait;
use modax::config::Config;
use modax::coordinator::device::ConnectionState;
use modax::coordinator::{CoordinatorError, DeviceCoordinator, SubmitError};
use modax::safety::{SafetyState, UnsafeReason};
use modax::transport::{
    ConnectivityError, DefaultLinkConnector, DeviceLink, LinkConnector, LinkSession, Telemetry,
    TelemetrySink,
};
use modax_shared::{
    CommandAck, CommandKind, CommandOrigin, CommandOutcome, ControlCommand, SafetyFrame,
    SafetyStatus, SensorSample, Vibration,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};

/// Refuses every connection and records when each attempt happened.
#[derive(Default)]
struct Unreachable {
    attempts: Mutex<Vec<Instant>>,
}

impl Unreachable {
    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkConnector for Unreachable {
    async fn connect(
        &self,
        _device_id: &str,
        address: &str,
        _telemetry: TelemetrySink,
    ) -> Result<LinkSession, ConnectivityError> {
        self.attempts.lock().unwrap().push(Instant::now());
        Err(ConnectivityError::Connect {
            address: address.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        })
    }
}

/// Sends loopback addresses to the built-in links and everything else to `Unreachable`.
struct Routed {
    loopback: DefaultLinkConnector,
    refused: Arc<Unreachable>,
}

#[async_trait]
impl LinkConnector for Routed {
    async fn connect(
        &self,
        device_id: &str,
        address: &str,
        telemetry: TelemetrySink,
    ) -> Result<LinkSession, ConnectivityError> {
        if address.starts_with("loopback") {
            self.loopback.connect(device_id, address, telemetry).await
        } else {
            self.refused.connect(device_id, address, telemetry).await
        }
    }
}

/// The first session's writes fail as if the socket broke; later sessions acknowledge.
#[derive(Default)]
struct BrokenThenHealthy {
    sessions: AtomicUsize,
    writes: Arc<Mutex<Vec<(usize, uuid::Uuid)>>>,
    // keeps every session open until the link gives it up
    open: Mutex<Vec<oneshot::Sender<()>>>,
}

struct ScriptedLink {
    session: usize,
    writes: Arc<Mutex<Vec<(usize, uuid::Uuid)>>>,
}

#[async_trait]
impl DeviceLink for ScriptedLink {
    async fn send(
        &self,
        command: &ControlCommand,
        _timeout: Duration,
    ) -> Result<CommandAck, ConnectivityError> {
        self.writes.lock().unwrap().push((self.session, command.id));
        if self.session == 0 {
            let broken = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
            return Err(ConnectivityError::Io(broken));
        }
        Ok(CommandAck::executed(command.id))
    }
}

#[async_trait]
impl LinkConnector for BrokenThenHealthy {
    async fn connect(
        &self,
        _device_id: &str,
        _address: &str,
        _telemetry: TelemetrySink,
    ) -> Result<LinkSession, ConnectivityError> {
        let session = self.sessions.fetch_add(1, Ordering::SeqCst);
        let (tx, closed) = oneshot::channel();
        self.open.lock().unwrap().push(tx);
        let link = ScriptedLink { session, writes: Arc::clone(&self.writes) };
        Ok(LinkSession { link: Box::new(link), closed })
    }
}

fn loopback_coordinator(config: Config) -> DeviceCoordinator {
    let connector = DefaultLinkConnector::from_config(&config.coordinator);
    DeviceCoordinator::new(config, Arc::new(connector), None)
}

fn safety(device: &str, status: SafetyStatus) -> Telemetry {
    Telemetry::Safety(SafetyFrame { timestamp: 0, device_id: device.to_string(), status })
}

fn sensor(device: &str, current: f64) -> Telemetry {
    Telemetry::Sensor(SensorSample {
        timestamp: 0,
        device_id: device.to_string(),
        motor_currents: vec![current],
        vibration: Vibration::from_axes(0.0, 0.0, 0.1),
        temperatures: vec![30.0],
    })
}

fn command(device: &str, kind: CommandKind) -> ControlCommand {
    ControlCommand::new(device, CommandOrigin::Operator, kind)
}

/// Lets the device workers drain their inboxes.
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_delays_double_to_cap() {
    let connector = Arc::new(Unreachable::default());
    let coordinator = DeviceCoordinator::new(Config::default(), connector.clone(), None);
    coordinator.register("mill-1", Some("10.0.0.9:7000")).await.unwrap();
    sleep(Duration::from_secs(200)).await;

    let attempts = connector.attempts();
    let gaps: Vec<u64> = attempts.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
    assert_eq!(&gaps[..8], &[1, 2, 4, 8, 16, 32, 60, 60]);

    let status = coordinator.status("mill-1").await.unwrap();
    assert_eq!(status.connection, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_device_degrades_after_reconnect_bound() {
    let mut config = Config::default();
    config.coordinator.max_reconnect_attempts = 3;
    let coordinator = DeviceCoordinator::new(config, Arc::new(Unreachable::default()), None);
    coordinator.register("mill-1", Some("10.0.0.9:7000")).await.unwrap();
    // attempts at 0s, 1s and 3s
    sleep(Duration::from_millis(3500)).await;

    let status = coordinator.status("mill-1").await.unwrap();
    assert_eq!(status.connection, ConnectionState::Degraded);
    assert!(status.warnings.iter().any(|w| w.contains("abandoned after 3 attempts")));

    // a stop is allowed by the gate but there is no way to deliver it
    let result = coordinator.execute(command("mill-1", CommandKind::FeedHold)).await;
    assert!(matches!(result.outcome, CommandOutcome::Failed(ref r) if r.contains("degraded")));
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_device_does_not_stall_its_neighbour() {
    let mut config = Config::default();
    config.coordinator.max_reconnect_attempts = 3;
    let refused = Arc::new(Unreachable::default());
    let loopback = DefaultLinkConnector::from_config(&config.coordinator);
    let connector = Routed { loopback, refused: refused.clone() };
    let coordinator = DeviceCoordinator::new(config, Arc::new(connector), None);
    coordinator.register("mill-1", Some("10.0.0.9:7000")).await.unwrap();
    coordinator.register("lathe-2", Some("loopback")).await.unwrap();

    // mill-1 is still backing off while lathe-2 works
    sleep(Duration::from_millis(500)).await;
    let mill = coordinator.status("mill-1").await.unwrap();
    assert_eq!(mill.connection, ConnectionState::Disconnected);
    let status = coordinator.status("lathe-2").await.unwrap();
    assert_eq!(status.connection, ConnectionState::Connected);
    assert!(status.safety_state.is_safe());
    let result = coordinator.execute(command("lathe-2", CommandKind::ToolChange { tool: 3 })).await;
    assert!(result.is_executed(), "{:?}", result.outcome);

    sleep(Duration::from_secs(11)).await;
    assert_eq!(refused.attempts().len(), 3);
    let mill = coordinator.status("mill-1").await.unwrap();
    assert_eq!(mill.connection, ConnectionState::Degraded);
    assert!(mill.latest_window.is_none());

    let lathe = coordinator.status("lathe-2").await.unwrap();
    assert_eq!(lathe.connection, ConnectionState::Connected);
    let window = lathe.latest_window.expect("lathe-2 closed a window");
    assert!(window.sample_count > 0);
    let result = coordinator.execute(command("lathe-2", CommandKind::FeedHold)).await;
    assert!(result.is_executed(), "{:?}", result.outcome);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_write_is_retried_once_after_reconnect() {
    let connector = Arc::new(BrokenThenHealthy::default());
    let coordinator = DeviceCoordinator::new(Config::default(), connector.clone(), None);
    coordinator.register("mill-1", Some("10.0.0.9:7000")).await.unwrap();

    let hold = command("mill-1", CommandKind::FeedHold);
    let hold_id = hold.id;
    let result = coordinator.execute(hold).await;
    assert_eq!(result.outcome, CommandOutcome::Executed);
    assert_eq!(*connector.writes.lock().unwrap(), vec![(0, hold_id), (1, hold_id)]);

    let stop = command("mill-1", CommandKind::Stop);
    let stop_id = stop.id;
    assert!(coordinator.execute(stop).await.is_executed());
    assert_eq!(connector.writes.lock().unwrap().last(), Some(&(1, stop_id)));
    assert_eq!(connector.writes.lock().unwrap().len(), 3);
    assert_eq!(connector.sessions.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_deregister_cancels_reconnection() {
    let connector = Arc::new(Unreachable::default());
    let coordinator = DeviceCoordinator::new(Config::default(), connector.clone(), None);
    coordinator.register("mill-1", Some("10.0.0.9:7000")).await.unwrap();
    sleep(Duration::from_secs(2)).await;
    assert_eq!(connector.attempts().len(), 2);

    coordinator.deregister("mill-1").await.unwrap();
    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts().len(), 2);
    assert_eq!(
        coordinator.status("mill-1").await.unwrap_err(),
        CoordinatorError::UnknownDevice("mill-1".into())
    );
    assert!(coordinator.deregister("mill-1").await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_goes_stale_and_recovers() {
    let coordinator = loopback_coordinator(Config::default());
    coordinator.register("lathe-2", Some("loopback:silent")).await.unwrap();
    coordinator.ingest(safety("lathe-2", SafetyStatus::NOMINAL)).await;
    settle().await;

    let status = coordinator.status("lathe-2").await.unwrap();
    assert_eq!(status.connection, ConnectionState::Connected);
    assert!(status.safety_state.is_safe());

    // safety frames every 50ms, stale beyond 150ms
    sleep(Duration::from_millis(250)).await;
    let status = coordinator.status("lathe-2").await.unwrap();
    assert_eq!(status.connection, ConnectionState::Degraded);
    assert_eq!(status.safety_state, SafetyState::Unsafe(vec![UnsafeReason::StaleTelemetry]));
    assert!(status.safety.stale);
    assert!(status.warnings.iter().any(|w| w.starts_with("telemetry stale")));

    let change = command("lathe-2", CommandKind::ToolChange { tool: 2 });
    let blocked = coordinator.execute(change).await;
    assert!(matches!(blocked.outcome, CommandOutcome::Blocked(_)));

    coordinator.ingest(safety("lathe-2", SafetyStatus::NOMINAL)).await;
    settle().await;
    let status = coordinator.status("lathe-2").await.unwrap();
    assert_eq!(status.connection, ConnectionState::Connected);
    assert!(status.safety_state.is_safe());
    assert!(status.warnings.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_device_is_created_on_first_telemetry() {
    let coordinator = loopback_coordinator(Config::default());
    for current in [1.0, 2.0, 3.0] {
        coordinator.ingest(sensor("press-7", current)).await;
    }
    settle().await;
    assert_eq!(coordinator.device_ids().await, vec!["press-7".to_string()]);

    let status = coordinator.status("press-7").await.unwrap();
    assert_eq!(status.connection, ConnectionState::Connected);
    assert!(status.latest_window.is_none());

    // default window is 10s
    sleep(Duration::from_secs(11)).await;
    let window = coordinator.status("press-7").await.unwrap().latest_window.unwrap();
    assert_eq!(window.sample_count, 3);
    assert_eq!(window.current.unwrap().mean, 2.0);
    assert_eq!(window.temperature.unwrap().max, 30.0);

    // a linkless device cannot be commanded
    let result = coordinator.execute(command("press-7", CommandKind::FeedHold)).await;
    assert_eq!(result.outcome, CommandOutcome::Failed("device has no command link".into()));
}

#[tokio::test(start_paused = true)]
async fn test_audit_ring_keeps_latest_results() {
    let mut config = Config::default();
    config.coordinator.audit_capacity = 3;
    let coordinator = loopback_coordinator(config);
    coordinator.register("mill-1", Some("loopback")).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    assert!(coordinator.status("mill-1").await.unwrap().safety_state.is_safe());

    let mut last = None;
    for tool in 1..=5 {
        let result = coordinator.execute(command("mill-1", CommandKind::ToolChange { tool })).await;
        assert!(result.is_executed(), "{:?}", result.outcome);
        last = Some(result.command_id);
    }
    let status = coordinator.status("mill-1").await.unwrap();
    assert_eq!(status.recent_results.len(), 3);
    assert_eq!(status.recent_results.last().map(|r| r.command_id), last);
}

#[tokio::test(start_paused = true)]
async fn test_estop_latch_needs_operator_reset() {
    let coordinator = loopback_coordinator(Config::default());
    coordinator.register("mill-1", Some("loopback:silent")).await.unwrap();
    let estop = SafetyStatus { emergency_stop: true, ..SafetyStatus::NOMINAL };
    coordinator.ingest(safety("mill-1", estop)).await;
    coordinator.ingest(safety("mill-1", SafetyStatus::NOMINAL)).await;
    settle().await;

    let status = coordinator.status("mill-1").await.unwrap();
    assert_eq!(status.safety_state, SafetyState::EstopLatched);
    assert!(status.warnings.iter().any(|w| w.contains("operator reset required")));

    let advisory_reset =
        ControlCommand::new("mill-1", CommandOrigin::Advisory, CommandKind::ResetInterlock);
    let outcome = coordinator.execute(advisory_reset).await.outcome;
    assert!(matches!(outcome, CommandOutcome::Blocked(_)));

    let reset = coordinator.execute(command("mill-1", CommandKind::ResetInterlock)).await;
    assert!(reset.is_executed());
    let result = coordinator.execute(command("mill-1", CommandKind::ToolChange { tool: 4 })).await;
    assert!(result.is_executed(), "{:?}", result.outcome);
}

#[tokio::test]
async fn test_registry_errors() {
    let coordinator = loopback_coordinator(Config::default());
    coordinator.register("mill-1", None).await.unwrap();
    assert_eq!(
        coordinator.register("mill-1", None).await.unwrap_err(),
        CoordinatorError::AlreadyRegistered("mill-1".into())
    );

    let result = coordinator.execute(command("ghost", CommandKind::Stop)).await;
    let unknown =
        matches!(result.outcome, CommandOutcome::Failed(ref r) if r.contains("unknown device"));
    assert!(unknown, "{:?}", result.outcome);
    assert_eq!(
        coordinator.submit_program("ghost", "G0 X1").await.unwrap_err(),
        SubmitError::UnknownDevice("ghost".into())
    );
    assert_eq!(coordinator.cancel_program("mill-1").await, Ok(false));
}
