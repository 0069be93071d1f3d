// src/gcode/modal.rs - Persistent interpretation context for one machining session
use crate::tooling::CoordinateSystemId;
use modax_shared::{CoolantMode, CutterComp, Plane, Point, SpindleDirection};
use serde::Serialize;

pub const MM_PER_INCH: f64 = 25.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    /// G81
    Drill,
    /// G82
    DrillDwell,
    /// G83
    PeckDrill,
    /// G73
    ChipBreakDrill,
    /// G84
    Tap,
    /// G85
    Bore,
}

impl CycleKind {
    pub fn code(&self) -> &'static str {
        match self {
            CycleKind::Drill => "G81",
            CycleKind::DrillDwell => "G82",
            CycleKind::PeckDrill => "G83",
            CycleKind::ChipBreakDrill => "G73",
            CycleKind::Tap => "G84",
            CycleKind::Bore => "G85",
        }
    }

    /// G73 and G83 need a Q peck increment.
    pub fn pecks(&self) -> bool {
        matches!(self, CycleKind::PeckDrill | CycleKind::ChipBreakDrill)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionMode {
    Rapid,
    Linear,
    ArcCw,
    ArcCcw,
    Cycle(CycleKind),
    None,
}

impl MotionMode {
    pub fn is_arc(&self) -> bool {
        matches!(self, MotionMode::ArcCw | MotionMode::ArcCcw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    Millimetres,
    Inches,
}

impl Units {
    /// Factor from programmed length units to millimetres.
    pub fn scale(&self) -> f64 {
        match self {
            Units::Millimetres => 1.0,
            Units::Inches => MM_PER_INCH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMode {
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    PerMinute,
    PerRevolution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMode {
    ExactStop,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetractMode {
    /// G98
    InitialLevel,
    /// G99
    RPlane,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolLengthMode {
    /// G43
    Positive,
    /// G44
    Negative,
    /// G49
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Pause,
    OptionalPause,
    End,
    EndRewind,
}

/// Modal state owned by exactly one session; only the interpreter mutates it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalState {
    pub motion: MotionMode,
    pub plane: Plane,
    pub units: Units,
    pub distance: DistanceMode,
    pub feed_mode: FeedMode,
    /// Programmed feed in programmed units per minute or per revolution.
    pub feed_rate: Option<f64>,
    /// Percent, clamped to the configured override range.
    pub feed_override: f64,
    pub spindle_speed: f64,
    pub spindle: SpindleDirection,
    pub coolant: CoolantMode,
    /// Tool loaded in the spindle.
    pub tool: Option<u32>,
    /// Tool staged by the last T word, loaded by M6.
    pub selected_tool: Option<u32>,
    pub coordinate_system: CoordinateSystemId,
    pub tool_length: ToolLengthMode,
    /// Signed length compensation along Z in millimetres.
    pub tool_length_offset: f64,
    pub cutter_comp: Option<CutterComp>,
    pub path_mode: PathMode,
    pub retract_mode: RetractMode,
    /// Machine-space position after the last planned move.
    pub position: Point,
    /// Z level at the start of the active canned-cycle sequence.
    #[serde(skip)]
    pub cycle_initial_z: Option<f64>,
}

impl Default for ModalState {
    fn default() -> Self {
        Self {
            motion: MotionMode::None,
            plane: Plane::Xy,
            units: Units::Millimetres,
            distance: DistanceMode::Absolute,
            feed_mode: FeedMode::PerMinute,
            feed_rate: None,
            feed_override: 100.0,
            spindle_speed: 0.0,
            spindle: SpindleDirection::Stopped,
            coolant: CoolantMode::Off,
            tool: None,
            selected_tool: None,
            coordinate_system: CoordinateSystemId::G54,
            tool_length: ToolLengthMode::Cancelled,
            tool_length_offset: 0.0,
            cutter_comp: None,
            path_mode: PathMode::ExactStop,
            retract_mode: RetractMode::InitialLevel,
            position: Point::ORIGIN,
            cycle_initial_z: None,
        }
    }
}

impl ModalState {
    /// Fresh modal groups for a new session. Physical facts (loaded tool, position) carry over.
    pub fn new_session(previous: &ModalState) -> Self {
        Self {
            tool: previous.tool,
            position: previous.position,
            ..Self::default()
        }
    }

    /// Sets the feed override, clamping into `[min, max]`. Returns the applied value.
    pub fn set_feed_override(&mut self, percent: f64, min: f64, max: f64) -> f64 {
        let applied = if percent.is_nan() { self.feed_override } else { percent.clamp(min, max) };
        if applied != percent {
            tracing::warn!("Feed override {}% clamped to {}%", percent, applied);
        }
        self.feed_override = applied;
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_clamps() {
        let mut modal = ModalState::default();
        assert_eq!(modal.set_feed_override(175.0, 0.0, 150.0), 150.0);
        assert_eq!(modal.set_feed_override(-5.0, 0.0, 150.0), 0.0);
        assert_eq!(modal.set_feed_override(80.0, 0.0, 150.0), 80.0);
        assert_eq!(modal.feed_override, 80.0);
    }

    #[test]
    fn test_new_session_keeps_physical_state() {
        let mut modal = ModalState::default();
        modal.tool = Some(4);
        modal.units = Units::Inches;
        modal.position = Point::new(1.0, 2.0, 3.0);
        let next = ModalState::new_session(&modal);
        assert_eq!(next.tool, Some(4));
        assert_eq!(next.position, Point::new(1.0, 2.0, 3.0));
        assert_eq!(next.units, Units::Millimetres);
    }
}
