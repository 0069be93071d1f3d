// Safety gate properties over every command kind and every reachable status

use modax::safety::{unsafe_reasons, Authorization, SafetyState, SafetyValidator, UnsafeReason};
use modax_shared::{
    CommandKind, CommandOrigin, ControlCommand, CoolantMode, PathSegment, Point, SafetyStatus,
    SegmentKind, SpindleDirection,
};

fn every_kind() -> Vec<CommandKind> {
    let segment = PathSegment {
        kind: SegmentKind::Line,
        start: Point::ORIGIN,
        end: Point::new(1.0, 0.0, 0.0),
        arc: None,
        feed: 100.0,
        rapid: false,
        cutter_comp: None,
        line: 1,
    };
    vec![
        CommandKind::Motion { segment },
        CommandKind::Dwell { seconds: 1.0 },
        CommandKind::Spindle { direction: SpindleDirection::Clockwise, rpm: 1200.0 },
        CommandKind::Spindle { direction: SpindleDirection::Stopped, rpm: 0.0 },
        CommandKind::SpindleStop,
        CommandKind::Coolant { mode: CoolantMode::Flood },
        CommandKind::Coolant { mode: CoolantMode::Off },
        CommandKind::ToolChange { tool: 5 },
        CommandKind::ProgramPause,
        CommandKind::FeedHold,
        CommandKind::Stop,
        CommandKind::SetFeedOverride { percent: 120.0 },
        CommandKind::ResetInterlock,
    ]
}

fn every_status() -> Vec<SafetyStatus> {
    (0..32u8)
        .map(|bits| SafetyStatus {
            emergency_stop: bits & 1 != 0,
            enclosure_closed: bits & 2 != 0,
            overload_detected: bits & 4 != 0,
            thermal_ok: bits & 8 != 0,
            stale: bits & 16 != 0,
        })
        .collect()
}

const ORIGINS: [CommandOrigin; 3] =
    [CommandOrigin::Operator, CommandOrigin::Program, CommandOrigin::Advisory];

#[test]
fn test_estop_never_authorizes() {
    for history in every_status() {
        for status in every_status().into_iter().filter(|s| s.emergency_stop) {
            let mut validator = SafetyValidator::new();
            validator.observe(&history);
            validator.observe(&status);
            for kind in every_kind() {
                for origin in ORIGINS {
                    let command = ControlCommand::new("mill-1", origin, kind.clone());
                    assert!(
                        matches!(validator.authorize(&command, &status), Authorization::Block(_)),
                        "{} from {:?} allowed under {:?}",
                        kind.name(),
                        origin,
                        status
                    );
                }
            }
        }
    }
}

#[test]
fn test_safe_machine_allows_device_commands() {
    let mut validator = SafetyValidator::new();
    validator.observe(&SafetyStatus::NOMINAL);
    for kind in every_kind().into_iter().filter(|k| !matches!(k, CommandKind::ResetInterlock)) {
        let command = ControlCommand::new("mill-1", CommandOrigin::Program, kind);
        let authorization = validator.authorize(&command, &SafetyStatus::NOMINAL);
        assert!(matches!(authorization, Authorization::Allow(_)));
    }
}

#[test]
fn test_unsafe_reasons_are_reported_together() {
    let status =
        SafetyStatus { enclosure_closed: false, thermal_ok: false, ..SafetyStatus::NOMINAL };
    assert_eq!(
        unsafe_reasons(&status),
        vec![UnsafeReason::EnclosureOpen, UnsafeReason::ThermalFault]
    );

    let mut validator = SafetyValidator::new();
    validator.observe(&status);
    let dwell = CommandKind::Dwell { seconds: 2.0 };
    let command = ControlCommand::new("mill-1", CommandOrigin::Operator, dwell);
    let Authorization::Block(reason) = validator.authorize(&command, &status) else {
        panic!("dwell allowed on an unsafe machine");
    };
    assert_eq!(reason, "unsafe: enclosure open, thermal fault");
}

#[test]
fn test_fresh_status_is_checked_before_state_catches_up() {
    // the validator still believes the machine is safe
    let mut validator = SafetyValidator::new();
    validator.observe(&SafetyStatus::NOMINAL);
    let overloaded = SafetyStatus { overload_detected: true, ..SafetyStatus::NOMINAL };
    let change = CommandKind::ToolChange { tool: 1 };
    let command = ControlCommand::new("mill-1", CommandOrigin::Operator, change);
    assert!(matches!(validator.authorize(&command, &overloaded), Authorization::Block(_)));
}

#[test]
fn test_latch_survives_until_reset_and_clear_status() {
    let mut validator = SafetyValidator::new();
    validator.observe(&SafetyStatus { emergency_stop: true, ..SafetyStatus::NOMINAL });
    let open = SafetyStatus { enclosure_closed: false, ..SafetyStatus::NOMINAL };
    validator.observe(&open);
    assert_eq!(validator.state(), &SafetyState::EstopLatched);

    // reset with the enclosure still open lands in UNSAFE, not SAFE
    let state = validator.reset(CommandOrigin::Operator, &open).unwrap().clone();
    assert_eq!(state, SafetyState::Unsafe(vec![UnsafeReason::EnclosureOpen]));
    validator.observe(&SafetyStatus::NOMINAL);
    assert!(validator.state().is_safe());
}
