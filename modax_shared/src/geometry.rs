//! Machine-space geometry: points, planes and planned path segments.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Mul, Sub};

/// A point in machine space. Linear axes are millimetres, `a` is degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub a: f64,
}

impl Point {
    pub const ORIGIN: Point = Point { x: 0.0, y: 0.0, z: 0.0, a: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z, a: 0.0 }
    }

    pub fn with_a(mut self, a: f64) -> Self {
        self.a = a;
        self
    }

    /// Linear axis by index (0 = X, 1 = Y, 2 = Z).
    pub fn axis(&self, index: usize) -> f64 {
        match index {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    pub fn set_axis(&mut self, index: usize, value: f64) {
        match index {
            0 => self.x = value,
            1 => self.y = value,
            _ => self.z = value,
        }
    }

    /// Euclidean distance over the linear axes.
    pub fn distance(&self, other: &Point) -> f64 {
        let d = *other - *self;
        (d.x * d.x + d.y * d.y + d.z * d.z).sqrt()
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point { x: self.x + rhs.x, y: self.y + rhs.y, z: self.z + rhs.z, a: self.a + rhs.a }
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point { x: self.x - rhs.x, y: self.y - rhs.y, z: self.z - rhs.z, a: self.a - rhs.a }
    }
}

impl Mul<f64> for Point {
    type Output = Point;
    fn mul(self, rhs: f64) -> Point {
        Point { x: self.x * rhs, y: self.y * rhs, z: self.z * rhs, a: self.a * rhs }
    }
}

/// Active interpolation plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    /// G17
    #[default]
    Xy,
    /// G18
    Zx,
    /// G19
    Yz,
}

impl Plane {
    /// Axis indices as (first in-plane, second in-plane, normal).
    pub fn axes(&self) -> (usize, usize, usize) {
        match self {
            Plane::Xy => (0, 1, 2),
            Plane::Zx => (2, 0, 1),
            Plane::Yz => (1, 2, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcDirection {
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Line,
    Arc,
    Helix,
}

/// Circular geometry carried by arc and helix segments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ArcGeometry {
    /// Centre in machine space; the normal-axis coordinate equals the start point's.
    pub center: Point,
    pub radius: f64,
    pub direction: ArcDirection,
    pub plane: Plane,
    /// Swept angle in radians, always positive.
    pub sweep: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompSide {
    Left,
    Right,
}

/// Cutter radius compensation the drive applies to a segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CutterComp {
    pub side: CompSide,
    pub radius: f64,
}

/// A planned, immutable unit of motion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathSegment {
    pub kind: SegmentKind,
    pub start: Point,
    pub end: Point,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arc: Option<ArcGeometry>,
    /// Resolved feed in mm/min.
    pub feed: f64,
    #[serde(default)]
    pub rapid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutter_comp: Option<CutterComp>,
    /// Source line of the instruction that produced this segment.
    pub line: usize,
}

impl PathSegment {
    /// Path length over the linear axes.
    pub fn length(&self) -> f64 {
        match &self.arc {
            None => self.start.distance(&self.end),
            Some(arc) => {
                let (_, _, normal) = arc.plane.axes();
                let planar = arc.radius * arc.sweep;
                let rise = self.end.axis(normal) - self.start.axis(normal);
                (planar * planar + rise * rise).sqrt()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_arithmetic() {
        let p = Point::new(1.0, 2.0, 3.0) + Point::new(1.0, 1.0, 1.0).with_a(90.0);
        assert_eq!(p, Point { x: 2.0, y: 3.0, z: 4.0, a: 90.0 });
        assert_eq!(Point::new(3.0, 4.0, 0.0).distance(&Point::ORIGIN), 5.0);
    }

    #[test]
    fn test_plane_axes() {
        assert_eq!(Plane::Xy.axes(), (0, 1, 2));
        assert_eq!(Plane::Zx.axes(), (2, 0, 1));
        assert_eq!(Plane::Yz.axes(), (1, 2, 0));
    }

    #[test]
    fn test_arc_segment_length() {
        let segment = PathSegment {
            kind: SegmentKind::Arc,
            start: Point::new(10.0, 0.0, 0.0),
            end: Point::new(-10.0, 0.0, 0.0),
            arc: Some(ArcGeometry {
                center: Point::ORIGIN,
                radius: 10.0,
                direction: ArcDirection::CounterClockwise,
                plane: Plane::Xy,
                sweep: std::f64::consts::PI,
            }),
            feed: 100.0,
            rapid: false,
            cutter_comp: None,
            line: 1,
        };
        assert!((segment.length() - 10.0 * std::f64::consts::PI).abs() < 1e-9);
    }
}
