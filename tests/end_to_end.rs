// End-to-end scenarios: program submission through the gate to a recording device link

use async_trait::async_trait;
use modax::config::Config;
use modax::coordinator::advisory::{
    AdvisoryBridge, AdvisoryClient, AdvisoryError, TcpAdvisoryClient,
};
use modax::coordinator::device::{ConnectionState, DeviceStatus};
use modax::coordinator::{DeviceCoordinator, SubmitError};
use modax::job::JobState;
use modax::safety::{SafetyState, UnsafeReason};
use modax::transport::{
    ConnectivityError, DefaultLinkConnector, DeviceLink, LinkConnector, LinkSession, Telemetry,
    TelemetrySink,
};
use modax_shared::{
    AggregatedWindow, CommandAck, CommandKind, CommandOrigin, CommandOutcome, ControlCommand,
    PathSegment, Point, Recommendation, RecommendationKind, SafetyFrame, SafetyStatus,
    SensorSample, Vibration,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;

type Log = Arc<Mutex<Vec<ControlCommand>>>;

/// Acknowledges every command and keeps a copy of it.
struct RecordingLink {
    log: Log,
    _open: oneshot::Sender<()>,
}

#[async_trait]
impl DeviceLink for RecordingLink {
    async fn send(
        &self,
        command: &ControlCommand,
        _timeout: Duration,
    ) -> Result<CommandAck, ConnectivityError> {
        self.log.lock().unwrap().push(command.clone());
        Ok(CommandAck::executed(command.id))
    }
}

#[derive(Default)]
struct Recorder {
    log: Log,
}

impl Recorder {
    fn segments(&self) -> Vec<PathSegment> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match &c.kind {
                CommandKind::Motion { segment } => Some(segment.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl LinkConnector for Recorder {
    async fn connect(
        &self,
        _device_id: &str,
        _address: &str,
        _telemetry: TelemetrySink,
    ) -> Result<LinkSession, ConnectivityError> {
        let (open, closed) = oneshot::channel();
        let link = RecordingLink { log: Arc::clone(&self.log), _open: open };
        Ok(LinkSession { link: Box::new(link), closed })
    }
}

/// Never answers.
struct Hanging;

#[async_trait]
impl AdvisoryClient for Hanging {
    async fn analyze(
        &self,
        _window: &AggregatedWindow,
    ) -> Result<Option<Recommendation>, AdvisoryError> {
        std::future::pending().await
    }
}

struct ToolWear;

#[async_trait]
impl AdvisoryClient for ToolWear {
    async fn analyze(
        &self,
        window: &AggregatedWindow,
    ) -> Result<Option<Recommendation>, AdvisoryError> {
        let kind = RecommendationKind::ToolWear;
        let note = "spindle current trending up";
        Ok(Some(Recommendation::new(&window.device_id, kind, 0.8, note)))
    }
}

fn relaxed_config() -> Config {
    let mut config = Config::default();
    // frames are pushed by hand in these tests
    config.coordinator.staleness_factor = 10_000;
    config
}

async fn recorded_device(config: Config) -> (DeviceCoordinator, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let coordinator = DeviceCoordinator::new(config, recorder.clone(), None);
    coordinator.register("mill-1", Some("bench-7")).await.unwrap();
    coordinator.ingest(frame("mill-1", SafetyStatus::NOMINAL)).await;
    sleep(Duration::from_millis(1)).await;
    (coordinator, recorder)
}

fn frame(device: &str, status: SafetyStatus) -> Telemetry {
    Telemetry::Safety(SafetyFrame { timestamp: 0, device_id: device.to_string(), status })
}

fn operator(device: &str, kind: CommandKind) -> ControlCommand {
    ControlCommand::new(device, CommandOrigin::Operator, kind)
}

async fn wait_for_program(coordinator: &DeviceCoordinator, id: &str) -> DeviceStatus {
    for _ in 0..500 {
        let status = coordinator.status(id).await.unwrap();
        if status.program.as_ref().is_some_and(|p| p.state.is_finished()) {
            return status;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("program on {} did not finish", id);
}

#[tokio::test(start_paused = true)]
async fn test_override_applies_to_dispatched_segment() {
    let (coordinator, recorder) = recorded_device(relaxed_config()).await;
    let raise = operator("mill-1", CommandKind::SetFeedOverride { percent: 150.0 });
    let set = coordinator.execute(raise).await;
    assert!(set.is_executed());

    let handle = coordinator.submit_program("mill-1", "G21 G90\nG1 X10 F100\nM30").await.unwrap();
    assert_eq!(handle.source_lines, 3);
    let status = wait_for_program(&coordinator, "mill-1").await;
    assert_eq!(status.program.unwrap().state, JobState::Completed);

    let segments = recorder.segments();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].feed, 150.0);
    assert_eq!(segments[0].end, Point::new(10.0, 0.0, 0.0));
    assert_eq!(segments[0].line, 2);
    assert_eq!(status.modal.position, Point::new(10.0, 0.0, 0.0));
}

#[tokio::test(start_paused = true)]
async fn test_program_segments_arrive_in_order() {
    let (coordinator, recorder) = recorded_device(relaxed_config()).await;
    let program = "G91 F500\n#1 = 0\n:NEXT\n#1 = [#1 + 1]\nG1 X1\nIF [#1 LT 5] GOTO NEXT\nM30";
    coordinator.submit_program("mill-1", program).await.unwrap();
    wait_for_program(&coordinator, "mill-1").await;

    let xs: Vec<f64> = recorder.segments().iter().map(|s| s.end.x).collect();
    assert_eq!(xs, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_instruction_rejects_program() {
    let (coordinator, recorder) = recorded_device(relaxed_config()).await;
    let src = "G0 X0\nG1 X5 F100\nG7 X1\nM30";
    let err = coordinator.submit_program("mill-1", src).await.unwrap_err();
    let SubmitError::Parse(errors) = err else {
        panic!("expected parse errors, got {:?}", err);
    };
    assert_eq!(errors[0].line, 3);
    sleep(Duration::from_millis(50)).await;
    assert!(recorder.segments().is_empty());
    assert!(coordinator.status("mill-1").await.unwrap().program.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_geometry_error_halts_at_its_line() {
    let (coordinator, recorder) = recorded_device(relaxed_config()).await;
    let program = "G1 X10 F100\nG2 X20 Y0 I5.5 J0\nG1 X30";
    coordinator.submit_program("mill-1", program).await.unwrap();
    let status = wait_for_program(&coordinator, "mill-1").await;

    let JobState::Halted { line, .. } = status.program.unwrap().state else {
        panic!("expected the program to halt");
    };
    assert_eq!(line, 2);
    assert_eq!(recorder.segments().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_estop_blocks_every_command() {
    let (coordinator, recorder) = recorded_device(relaxed_config()).await;
    let estop = SafetyStatus { emergency_stop: true, ..SafetyStatus::NOMINAL };
    coordinator.ingest(frame("mill-1", estop)).await;
    sleep(Duration::from_millis(1)).await;

    let kinds = [
        CommandKind::ToolChange { tool: 1 },
        CommandKind::Dwell { seconds: 0.5 },
        CommandKind::FeedHold,
        CommandKind::Stop,
        CommandKind::SpindleStop,
        CommandKind::SetFeedOverride { percent: 80.0 },
        CommandKind::ResetInterlock,
    ];
    for kind in kinds {
        let result = coordinator.execute(operator("mill-1", kind)).await;
        let blocked = matches!(result.outcome, CommandOutcome::Blocked(_));
        assert!(blocked, "{} was {:?}", result.command, result.outcome);
    }
    assert!(recorder.log.lock().unwrap().is_empty());

    // a program halts on its first command
    coordinator.submit_program("mill-1", "G1 X10 F100").await.unwrap();
    let status = wait_for_program(&coordinator, "mill-1").await;
    assert!(matches!(status.program.unwrap().state, JobState::Halted { line: 1, .. }));
    assert_eq!(status.safety_state, SafetyState::EstopLatched);
}

#[tokio::test(start_paused = true)]
async fn test_silent_device_becomes_unsafe_and_degraded() {
    let config = Config::default();
    let connector = DefaultLinkConnector::from_config(&config.coordinator);
    let coordinator = DeviceCoordinator::new(config.clone(), Arc::new(connector), None);
    coordinator.ingest(frame("router-3", SafetyStatus::NOMINAL)).await;
    sleep(Duration::from_millis(100)).await;
    assert!(coordinator.status("router-3").await.unwrap().safety_state.is_safe());

    sleep(Duration::from_millis(150)).await;
    let status = coordinator.status("router-3").await.unwrap();
    assert_eq!(status.safety_state, SafetyState::Unsafe(vec![UnsafeReason::StaleTelemetry]));
    assert_eq!(status.connection, ConnectionState::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_advisory_does_not_block_status() {
    let mut config = relaxed_config();
    config.coordinator.window_secs = 1;
    let advisory = AdvisoryBridge::spawn(Arc::new(Hanging), &config.advisory);
    let recorder = Arc::new(Recorder::default());
    let coordinator = DeviceCoordinator::new(config, recorder.clone(), Some(advisory.clone()));
    coordinator.register("mill-1", Some("bench-7")).await.unwrap();
    coordinator.ingest(frame("mill-1", SafetyStatus::NOMINAL)).await;

    for second in 0..4 {
        coordinator
            .ingest(Telemetry::Sensor(SensorSample {
                timestamp: second * 1000,
                device_id: "mill-1".into(),
                motor_currents: vec![2.0],
                vibration: Vibration::default(),
                temperatures: vec![31.0],
            }))
            .await;
        sleep(Duration::from_secs(1)).await;
    }

    let status = coordinator.status("mill-1").await.unwrap();
    assert!(status.recommendation.is_none());
    assert!(status.latest_window.is_some());
    assert!(status.safety_state.is_safe());
    let result = coordinator.execute(operator("mill-1", CommandKind::ToolChange { tool: 2 })).await;
    assert!(result.is_executed());
    assert!(advisory.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_recommendation_is_reported_never_executed() {
    let mut config = relaxed_config();
    config.coordinator.window_secs = 1;
    let advisory = AdvisoryBridge::spawn(Arc::new(ToolWear), &config.advisory);
    let coordinator = DeviceCoordinator::new(config, Arc::new(Recorder::default()), Some(advisory));
    coordinator.register("mill-1", None).await.unwrap();
    coordinator
        .ingest(Telemetry::Sensor(SensorSample {
            timestamp: 0,
            device_id: "mill-1".into(),
            motor_currents: vec![4.5],
            vibration: Vibration::default(),
            temperatures: vec![40.0],
        }))
        .await;
    sleep(Duration::from_millis(1500)).await;

    let status = coordinator.status("mill-1").await.unwrap();
    let recommendation = status.recommendation.unwrap();
    assert_eq!(recommendation.kind, RecommendationKind::ToolWear);
    assert_eq!(recommendation.confidence, 0.8);
    assert!(status.recent_results.is_empty());

    coordinator.deregister("mill-1").await.unwrap();
    coordinator.register("mill-1", None).await.unwrap();
    assert!(coordinator.status("mill-1").await.unwrap().recommendation.is_none());
}

#[tokio::test]
async fn test_tcp_advisory_client_reports_refused_connection() {
    let client = TcpAdvisoryClient::new("127.0.0.1:9");
    let now = chrono::Utc::now();
    let window = AggregatedWindow {
        device_id: "mill-1".into(),
        window_start: now,
        window_end: now,
        sample_count: 0,
        current: None,
        vibration: None,
        temperature: None,
    };
    assert!(matches!(client.analyze(&window).await, Err(AdvisoryError::Unavailable(_))));
}
