// src/motion/arc.rs - Arc center reconstruction and validation
use super::{ArcSpec, GeometryErrorKind};
use modax_shared::{ArcDirection, ArcGeometry, Plane, Point};
use std::f64::consts::TAU;

/// Builds the arc from `start` to `end` in `plane`, rejecting programmed geometry whose
/// start and end radii differ by `tolerance` or more.
pub(super) fn build_arc(
    start: Point,
    end: Point,
    spec: ArcSpec,
    direction: ArcDirection,
    plane: Plane,
    tolerance: f64,
) -> Result<ArcGeometry, GeometryErrorKind> {
    let (first, second, normal) = plane.axes();
    let s = (start.axis(first), start.axis(second));
    let e = (end.axis(first), end.axis(second));

    let c = match spec {
        ArcSpec::Center(offset) => (s.0 + offset.axis(first), s.1 + offset.axis(second)),
        ArcSpec::Radius(r) => center_from_radius(s, e, r, direction, tolerance)?,
    };

    let start_radius = (s.0 - c.0).hypot(s.1 - c.1);
    let end_radius = (e.0 - c.0).hypot(e.1 - c.1);
    if start_radius < tolerance {
        return Err(GeometryErrorKind::DegenerateArc);
    }
    if (start_radius - end_radius).abs() >= tolerance {
        return Err(GeometryErrorKind::RadiusMismatch {
            start: start_radius,
            end: end_radius,
            tolerance,
        });
    }

    let start_angle = (s.1 - c.1).atan2(s.0 - c.0);
    let end_angle = (e.1 - c.1).atan2(e.0 - c.0);
    let raw = match direction {
        ArcDirection::CounterClockwise => end_angle - start_angle,
        ArcDirection::Clockwise => start_angle - end_angle,
    };
    // coincident endpoints are a full circle
    let mut sweep = raw.rem_euclid(TAU);
    if sweep <= 1e-12 {
        sweep = TAU;
    }

    let mut center = start;
    center.set_axis(first, c.0);
    center.set_axis(second, c.1);
    center.set_axis(normal, start.axis(normal));

    Ok(ArcGeometry { center, radius: start_radius, direction, plane, sweep })
}

fn center_from_radius(
    s: (f64, f64),
    e: (f64, f64),
    r: f64,
    direction: ArcDirection,
    tolerance: f64,
) -> Result<(f64, f64), GeometryErrorKind> {
    let (dx, dy) = (e.0 - s.0, e.1 - s.1);
    let chord = dx.hypot(dy);
    if chord < tolerance {
        return Err(GeometryErrorKind::FullCircleWithRadius);
    }
    let half = chord / 2.0;
    let radius = r.abs();
    if radius < half - tolerance {
        return Err(GeometryErrorKind::RadiusTooSmall { radius, half_chord: half });
    }
    let h = (radius * radius - half * half).max(0.0).sqrt();
    // left normal of the chord
    let (nx, ny) = (-dy / chord, dx / chord);
    let mut side = match direction {
        ArcDirection::CounterClockwise => 1.0,
        ArcDirection::Clockwise => -1.0,
    };
    if r < 0.0 {
        side = -side;
    }
    let mid = (s.0 + dx / 2.0, s.1 + dy / 2.0);
    Ok((mid.0 + side * h * nx, mid.1 + side * h * ny))
}
