// src/motion/mod.rs - Motion planning: resolved moves in, path segments out

mod arc;
pub mod cycles;
pub mod planner;

pub use planner::MotionPlanner;

use crate::gcode::modal::CycleKind;
use modax_shared::{ArcDirection, PathSegment, Point, SpindleDirection};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Rapid,
    Linear,
    Arc(ArcDirection),
}

/// Arc parameters in millimetres, as programmed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ArcSpec {
    /// I/J/K: center relative to the start point.
    Center(Point),
    /// R: negative selects the arc longer than 180 degrees.
    Radius(f64),
}

/// A move with both endpoints already resolved to machine space.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveRequest {
    pub kind: MoveKind,
    pub start: Point,
    pub end: Point,
    pub arc: Option<ArcSpec>,
    pub line: usize,
}

/// One canned-cycle hole, all levels in machine-space Z.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleRequest {
    pub kind: CycleKind,
    pub start: Point,
    /// Hole position; only X and Y are used.
    pub hole: Point,
    pub r_z: f64,
    pub bottom_z: f64,
    pub retract_z: f64,
    pub peck: Option<f64>,
    pub dwell: Option<f64>,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannedStep {
    Segment(PathSegment),
    Dwell(f64),
    Spindle { direction: SpindleDirection, rpm: f64 },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {kind}")]
pub struct GeometryError {
    pub line: usize,
    pub kind: GeometryErrorKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryErrorKind {
    #[error(
        "arc radius mismatch: start radius {start:.6}, end radius {end:.6}, tolerance {tolerance}"
    )]
    RadiusMismatch { start: f64, end: f64, tolerance: f64 },
    #[error("arc radius {radius} is smaller than half the chord {half_chord:.6}")]
    RadiusTooSmall { radius: f64, half_chord: f64 },
    #[error("arc has zero radius")]
    DegenerateArc,
    #[error("full circle cannot be programmed with R")]
    FullCircleWithRadius,
    #[error("no feed rate programmed")]
    FeedRateUndefined,
    #[error("feed per revolution with the spindle stopped")]
    SpindleStopped,
    #[error("{axis} is not a finite number")]
    NonFinite { axis: char },
    #[error("{axis} = {value:.3} outside soft limits [{min}, {max}]")]
    SoftLimit { axis: char, value: f64, min: f64, max: f64 },
    #[error("canned cycle bottom {bottom:.3} is not below the R plane {r:.3}")]
    InvalidCycleDepth { bottom: f64, r: f64 },
    #[error("canned cycles are only supported in the XY plane")]
    UnsupportedCyclePlane,
    #[error("peck depth {0} must be positive")]
    InvalidPeck(f64),
    #[error("hole needs {pecks} pecks, more than the limit of {max}")]
    TooManyPecks { pecks: f64, max: usize },
    #[error("tapping needs the spindle running")]
    TapWithoutSpindle,
}

/// The planner's error type is the geometry error.
pub type MotionError = GeometryError;
