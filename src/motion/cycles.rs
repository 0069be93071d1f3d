// src/motion/cycles.rs - Canned cycles expanded into lines, dwells and spindle changes
use super::{CycleRequest, GeometryError, GeometryErrorKind, MotionPlanner, PlannedStep};
use crate::gcode::modal::{CycleKind, ModalState};
use modax_shared::{Plane, Point, SpindleDirection};

impl MotionPlanner {
    /// Expands one hole: rapid over the hole, rapid to R, the cycle's own descent and
    /// return to R, then rapid out to the retract level.
    ///
    /// G81 feeds down, G82 adds a dwell at the bottom, G73 and G83 peck, G84 taps with the
    /// spindle reversed at the bottom, and G85 feeds back out to R.
    pub fn plan_cycle(
        &self,
        request: &CycleRequest,
        modal: &ModalState,
    ) -> Result<Vec<PlannedStep>, GeometryError> {
        let line = request.line;
        let fail = |kind| GeometryError { line, kind };
        if modal.plane != Plane::Xy {
            return Err(fail(GeometryErrorKind::UnsupportedCyclePlane));
        }
        let levels = [('R', request.r_z), ('Z', request.bottom_z), ('Z', request.retract_z)];
        for (axis, value) in levels {
            if !value.is_finite() {
                return Err(fail(GeometryErrorKind::NonFinite { axis }));
            }
        }
        if request.bottom_z >= request.r_z {
            let (bottom, r) = (request.bottom_z, request.r_z);
            return Err(fail(GeometryErrorKind::InvalidCycleDepth { bottom, r }));
        }
        let feed = match request.kind {
            CycleKind::Tap => self.synchronized_feed(modal),
            _ => self.effective_feed(modal),
        }
        .map_err(fail)?;
        let at = |z: f64| Point { x: request.hole.x, y: request.hole.y, z, a: request.start.a };
        self.check_limits(&at(request.bottom_z)).map_err(fail)?;
        self.check_limits(&at(request.retract_z)).map_err(fail)?;
        let peck = match request.kind {
            CycleKind::PeckDrill | CycleKind::ChipBreakDrill => {
                Some(self.peck_depth(request).map_err(fail)?)
            }
            _ => None,
        };

        let mut steps = Vec::new();
        let mut position = request.start;
        let rapid_to = |steps: &mut Vec<PlannedStep>, position: &mut Point, target: Point| {
            if position.distance(&target) > 0.0 {
                steps.push(PlannedStep::Segment(self.rapid(*position, target, line)));
                *position = target;
            }
        };
        let feed_to = |steps: &mut Vec<PlannedStep>, position: &mut Point, target: Point| {
            steps.push(PlannedStep::Segment(self.feed(*position, target, feed, modal, line)));
            *position = target;
        };

        rapid_to(&mut steps, &mut position, at(request.start.z));
        rapid_to(&mut steps, &mut position, at(request.r_z));

        match request.kind {
            CycleKind::Drill | CycleKind::DrillDwell => {
                feed_to(&mut steps, &mut position, at(request.bottom_z));
                let dwell = request.dwell.filter(|_| request.kind == CycleKind::DrillDwell);
                if let Some(seconds) = dwell {
                    steps.push(PlannedStep::Dwell(seconds));
                }
            }
            CycleKind::PeckDrill => {
                let peck = peck.unwrap_or(request.r_z - request.bottom_z);
                let mut depth = request.r_z;
                loop {
                    rapid_to(&mut steps, &mut position, at(depth));
                    let next = (depth - peck).max(request.bottom_z);
                    feed_to(&mut steps, &mut position, at(next));
                    if next <= request.bottom_z {
                        break;
                    }
                    rapid_to(&mut steps, &mut position, at(request.r_z));
                    depth = next;
                }
            }
            CycleKind::ChipBreakDrill => {
                let peck = peck.unwrap_or(request.r_z - request.bottom_z);
                let mut depth = request.r_z;
                loop {
                    let next = (depth - peck).max(request.bottom_z);
                    feed_to(&mut steps, &mut position, at(next));
                    if next <= request.bottom_z {
                        break;
                    }
                    // back off to break the chip, then keep feeding from there
                    let back_off = (next + self.peck_retract).min(request.r_z);
                    rapid_to(&mut steps, &mut position, at(back_off));
                    depth = next;
                }
            }
            CycleKind::Tap => {
                let rpm = modal.spindle_speed;
                feed_to(&mut steps, &mut position, at(request.bottom_z));
                steps.push(PlannedStep::Spindle { direction: SpindleDirection::Stopped, rpm });
                steps.push(PlannedStep::Spindle { direction: modal.spindle.reversed(), rpm });
                feed_to(&mut steps, &mut position, at(request.r_z));
                steps.push(PlannedStep::Spindle { direction: modal.spindle, rpm });
            }
            CycleKind::Bore => {
                feed_to(&mut steps, &mut position, at(request.bottom_z));
                feed_to(&mut steps, &mut position, at(request.r_z));
            }
        }

        rapid_to(&mut steps, &mut position, at(request.retract_z));
        tracing::debug!(
            "line {}: {} cycle expanded to {} steps",
            line,
            request.kind.code(),
            steps.len()
        );
        Ok(steps)
    }

    /// Peck increment for G73/G83, bounded so one hole cannot expand without limit.
    fn peck_depth(&self, request: &CycleRequest) -> Result<f64, GeometryErrorKind> {
        let depth = request.r_z - request.bottom_z;
        let peck = request.peck.unwrap_or(depth);
        if !peck.is_finite() {
            return Err(GeometryErrorKind::NonFinite { axis: 'Q' });
        }
        if peck <= 0.0 {
            return Err(GeometryErrorKind::InvalidPeck(peck));
        }
        let pecks = (depth / peck).ceil();
        if pecks > self.max_pecks_per_hole as f64 {
            return Err(GeometryErrorKind::TooManyPecks { pecks, max: self.max_pecks_per_hole });
        }
        Ok(peck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: CycleKind) -> CycleRequest {
        CycleRequest {
            kind,
            start: Point::new(0.0, 0.0, 10.0),
            hole: Point::new(5.0, 5.0, 0.0),
            r_z: 2.0,
            bottom_z: -7.0,
            retract_z: 10.0,
            peck: Some(3.0),
            dwell: Some(0.5),
            line: 4,
        }
    }

    fn modal() -> ModalState {
        let mut modal = ModalState::default();
        modal.feed_rate = Some(120.0);
        modal
    }

    fn plan(kind: CycleKind) -> Vec<PlannedStep> {
        MotionPlanner::default().plan_cycle(&request(kind), &modal()).unwrap()
    }

    #[test]
    fn test_drill_sequence() {
        let steps = plan(CycleKind::Drill);
        let ends: Vec<f64> = steps
            .iter()
            .filter_map(|s| match s {
                PlannedStep::Segment(seg) => Some(seg.end.z),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec![10.0, 2.0, -7.0, 10.0]);
    }

    #[test]
    fn test_peck_depths() {
        let steps = plan(CycleKind::PeckDrill);
        let feeds: Vec<f64> = steps
            .iter()
            .filter_map(|s| match s {
                PlannedStep::Segment(seg) if !seg.rapid => Some(seg.end.z),
                _ => None,
            })
            .collect();
        assert_eq!(feeds, vec![-1.0, -4.0, -7.0]);
    }

    #[test]
    fn test_dwell_only_for_g82() {
        assert!(plan(CycleKind::DrillDwell).contains(&PlannedStep::Dwell(0.5)));
        let steps = plan(CycleKind::Drill);
        assert!(!steps.iter().any(|s| matches!(s, PlannedStep::Dwell(_))));
    }
}
