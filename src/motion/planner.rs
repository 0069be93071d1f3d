// src/motion/planner.rs
use super::arc::build_arc;
use super::{ArcSpec, GeometryError, GeometryErrorKind, MoveKind, MoveRequest};
use crate::config::{MotionConfig, SoftLimits};
use crate::gcode::modal::{FeedMode, ModalState};
use modax_shared::{PathSegment, Point, SegmentKind, SpindleDirection};

/// Moves shorter than this emit no segment.
const MIN_SEGMENT_LENGTH: f64 = 1e-9;

#[derive(Debug, Clone)]
pub struct MotionPlanner {
    /// In programmed units; scaled by the active unit when checking arcs.
    pub(super) arc_tolerance: f64,
    pub(super) rapid_rate: f64,
    override_range: (f64, f64),
    soft_limits: Option<SoftLimits>,
    pub(super) max_pecks_per_hole: usize,
    pub(super) peck_retract: f64,
}

impl Default for MotionPlanner {
    fn default() -> Self {
        Self::new(&MotionConfig::default())
    }
}

impl MotionPlanner {
    pub fn new(config: &MotionConfig) -> Self {
        Self {
            arc_tolerance: config.arc_tolerance,
            rapid_rate: config.rapid_rate,
            override_range: (config.override_min, config.override_max),
            soft_limits: config.soft_limits,
            max_pecks_per_hole: config.max_pecks_per_hole,
            peck_retract: config.peck_retract,
        }
    }

    pub fn rapid_rate(&self) -> f64 {
        self.rapid_rate
    }

    /// Effective feed in mm/min: programmed feed (converted to mm) times the clamped override.
    pub fn effective_feed(&self, modal: &ModalState) -> Result<f64, GeometryErrorKind> {
        let programmed = modal.feed_rate.ok_or(GeometryErrorKind::FeedRateUndefined)?;
        let linear = match modal.feed_mode {
            FeedMode::PerMinute => programmed * modal.units.scale(),
            FeedMode::PerRevolution => {
                if modal.spindle == SpindleDirection::Stopped || modal.spindle_speed <= 0.0 {
                    return Err(GeometryErrorKind::SpindleStopped);
                }
                programmed * modal.units.scale() * modal.spindle_speed
            }
        };
        let (min, max) = self.override_range;
        let percent = modal.feed_override.clamp(min, max);
        Ok(linear * percent / 100.0)
    }

    /// Feed for tapping: tied to the spindle and never overridden.
    pub fn synchronized_feed(&self, modal: &ModalState) -> Result<f64, GeometryErrorKind> {
        if modal.spindle == SpindleDirection::Stopped || modal.spindle_speed <= 0.0 {
            return Err(GeometryErrorKind::TapWithoutSpindle);
        }
        let programmed = modal.feed_rate.ok_or(GeometryErrorKind::FeedRateUndefined)?;
        Ok(match modal.feed_mode {
            FeedMode::PerMinute => programmed * modal.units.scale(),
            FeedMode::PerRevolution => programmed * modal.units.scale() * modal.spindle_speed,
        })
    }

    /// Plans one resolved move. A zero-length line emits nothing; anything else emits one
    /// segment.
    pub fn plan_move(
        &self,
        request: &MoveRequest,
        modal: &ModalState,
    ) -> Result<Vec<PathSegment>, GeometryError> {
        let line = request.line;
        let fail = |kind| GeometryError { line, kind };
        check_finite(&request.start).map_err(fail)?;
        self.check_limits(&request.end).map_err(fail)?;

        let segment = match request.kind {
            MoveKind::Rapid | MoveKind::Linear => {
                if request.start.distance(&request.end) < MIN_SEGMENT_LENGTH
                    && (request.end.a - request.start.a).abs() < MIN_SEGMENT_LENGTH
                {
                    tracing::debug!("line {}: zero-length move skipped", line);
                    return Ok(Vec::new());
                }
                if request.kind == MoveKind::Rapid {
                    self.rapid(request.start, request.end, line)
                } else {
                    let feed = self.effective_feed(modal).map_err(fail)?;
                    self.feed(request.start, request.end, feed, modal, line)
                }
            }
            MoveKind::Arc(direction) => {
                let Some(spec) = request.arc else {
                    return Err(fail(GeometryErrorKind::DegenerateArc));
                };
                match spec {
                    ArcSpec::Radius(r) if !r.is_finite() => {
                        return Err(fail(GeometryErrorKind::NonFinite { axis: 'R' }));
                    }
                    ArcSpec::Center(c) => check_finite(&c).map_err(fail)?,
                    ArcSpec::Radius(_) => {}
                }
                let tolerance = self.arc_tolerance * modal.units.scale();
                let (start, end) = (request.start, request.end);
                let arc =
                    build_arc(start, end, spec, direction, modal.plane, tolerance).map_err(fail)?;
                let feed = self.effective_feed(modal).map_err(fail)?;
                let (_, _, normal) = modal.plane.axes();
                let rise = request.end.axis(normal) - request.start.axis(normal);
                PathSegment {
                    kind: if rise.abs() > tolerance {
                        SegmentKind::Helix
                    } else {
                        SegmentKind::Arc
                    },
                    start: request.start,
                    end: request.end,
                    arc: Some(arc),
                    feed,
                    rapid: false,
                    cutter_comp: modal.cutter_comp,
                    line,
                }
            }
        };
        tracing::debug!(
            "line {}: planned {:?} to [{:.3}, {:.3}, {:.3}] at {:.1} mm/min",
            line,
            segment.kind,
            segment.end.x,
            segment.end.y,
            segment.end.z,
            segment.feed
        );
        Ok(vec![segment])
    }

    pub(super) fn rapid(&self, start: Point, end: Point, line: usize) -> PathSegment {
        PathSegment {
            kind: SegmentKind::Line,
            start,
            end,
            arc: None,
            feed: self.rapid_rate,
            rapid: true,
            cutter_comp: None,
            line,
        }
    }

    pub(super) fn feed(
        &self,
        start: Point,
        end: Point,
        feed: f64,
        modal: &ModalState,
        line: usize,
    ) -> PathSegment {
        PathSegment {
            kind: SegmentKind::Line,
            start,
            end,
            arc: None,
            feed,
            rapid: false,
            cutter_comp: modal.cutter_comp,
            line,
        }
    }

    /// Rejects non-finite coordinates, then anything outside the configured travel.
    pub(super) fn check_limits(&self, point: &Point) -> Result<(), GeometryErrorKind> {
        check_finite(point)?;
        let Some(limits) = &self.soft_limits else {
            return Ok(());
        };
        for (i, axis) in ['X', 'Y', 'Z'].into_iter().enumerate() {
            let value = point.axis(i);
            if value < limits.min[i] || value > limits.max[i] {
                let (min, max) = (limits.min[i], limits.max[i]);
                return Err(GeometryErrorKind::SoftLimit { axis, value, min, max });
            }
        }
        Ok(())
    }
}

fn check_finite(point: &Point) -> Result<(), GeometryErrorKind> {
    let axes = [('X', point.x), ('Y', point.y), ('Z', point.z), ('A', point.a)];
    match axes.into_iter().find(|(_, v)| !v.is_finite()) {
        Some((axis, _)) => Err(GeometryErrorKind::NonFinite { axis }),
        None => Ok(()),
    }
}
