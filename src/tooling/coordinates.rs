// src/tooling/coordinates.rs - Work coordinate systems
use modax_shared::Point;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("coordinate system {0} is not configured")]
    OutOfRange(String),
}

/// G54..G59.3 map to `Standard(1..=9)`; `G54.1 Pn` maps to `Extended(n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CoordinateSystemId {
    Standard(u8),
    Extended(u16),
}

impl CoordinateSystemId {
    pub const G54: CoordinateSystemId = CoordinateSystemId::Standard(1);
    pub const STANDARD_COUNT: u8 = 9;

    /// From a G code scaled by ten (540 = G54, 591 = G59.1).
    pub fn from_gcode(code: i32) -> Option<Self> {
        let index = match code {
            540 => 1,
            550 => 2,
            560 => 3,
            570 => 4,
            580 => 5,
            590 => 6,
            591 => 7,
            592 => 8,
            593 => 9,
            _ => return None,
        };
        Some(CoordinateSystemId::Standard(index))
    }

    /// Parses "G54", "G59.2" or "P12" (extended).
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_uppercase();
        if let Some(n) = name.strip_prefix('P') {
            return n.parse().ok().map(CoordinateSystemId::Extended);
        }
        let code: f64 = name.strip_prefix('G')?.parse().ok()?;
        Self::from_gcode((code * 10.0).round() as i32)
    }
}

impl fmt::Display for CoordinateSystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinateSystemId::Standard(n) if *n <= 6 => write!(f, "G{}", 53 + n),
            CoordinateSystemId::Standard(n) => write!(f, "G59.{}", n - 6),
            CoordinateSystemId::Extended(n) => write!(f, "G54.1 P{}", n),
        }
    }
}

impl Serialize for CoordinateSystemId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Origin offsets in machine space for every configured system, plus the G52 local
/// offset and the G92 shift, both of which apply on top of whichever system is active.
#[derive(Debug, Clone)]
pub struct CoordinateSystems {
    offsets: HashMap<CoordinateSystemId, Point>,
    extended: u16,
    local: Point,
    shift: Point,
}

impl CoordinateSystems {
    pub fn new(extended: u16) -> Self {
        Self { offsets: HashMap::new(), extended, local: Point::ORIGIN, shift: Point::ORIGIN }
    }

    /// Program zero of `id` in machine space.
    pub fn origin(&self, id: CoordinateSystemId) -> Point {
        self.offset(id) + self.local + self.shift
    }

    pub fn local_offset(&self) -> Point {
        self.local
    }

    pub fn set_local_offset(&mut self, local: Point) {
        tracing::debug!("Local offset set to {:?}", local);
        self.local = local;
    }

    pub fn position_shift(&self) -> Point {
        self.shift
    }

    pub fn set_position_shift(&mut self, shift: Point) {
        tracing::debug!("Position shift set to {:?}", shift);
        self.shift = shift;
    }

    /// G92.1
    pub fn clear_position_shift(&mut self) {
        self.shift = Point::ORIGIN;
    }

    pub fn extended_count(&self) -> u16 {
        self.extended
    }

    pub fn validate(&self, id: CoordinateSystemId) -> Result<(), CoordinateError> {
        let ok = match id {
            CoordinateSystemId::Standard(n) => {
                (1..=CoordinateSystemId::STANDARD_COUNT).contains(&n)
            }
            CoordinateSystemId::Extended(n) => n >= 1 && n <= self.extended,
        };
        if ok { Ok(()) } else { Err(CoordinateError::OutOfRange(id.to_string())) }
    }

    pub fn offset(&self, id: CoordinateSystemId) -> Point {
        self.offsets.get(&id).copied().unwrap_or(Point::ORIGIN)
    }

    pub fn set_offset(
        &mut self,
        id: CoordinateSystemId,
        offset: Point,
    ) -> Result<(), CoordinateError> {
        self.validate(id)?;
        tracing::debug!("Work offset {} set to {:?}", id, offset);
        self.offsets.insert(id, offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        assert_eq!(CoordinateSystemId::G54.to_string(), "G54");
        assert_eq!(CoordinateSystemId::Standard(6).to_string(), "G59");
        assert_eq!(CoordinateSystemId::Standard(8).to_string(), "G59.2");
        assert_eq!(CoordinateSystemId::from_name("g59.2"), Some(CoordinateSystemId::Standard(8)));
        assert_eq!(CoordinateSystemId::from_name("P7"), Some(CoordinateSystemId::Extended(7)));
        assert_eq!(CoordinateSystemId::from_name("G53"), None);
    }

    #[test]
    fn test_extended_range() {
        let mut systems = CoordinateSystems::new(4);
        assert!(systems.validate(CoordinateSystemId::Extended(4)).is_ok());
        assert!(systems.set_offset(CoordinateSystemId::Extended(5), Point::ORIGIN).is_err());
        assert!(systems.validate(CoordinateSystemId::Standard(10)).is_err());
    }

    #[test]
    fn test_origin_stacks_local_and_shift() {
        let mut systems = CoordinateSystems::new(4);
        systems.set_offset(CoordinateSystemId::G54, Point::new(100.0, 0.0, 0.0)).unwrap();
        systems.set_local_offset(Point::new(5.0, 5.0, 0.0));
        systems.set_position_shift(Point::new(0.0, 0.0, -2.0));
        assert_eq!(systems.origin(CoordinateSystemId::G54), Point::new(105.0, 5.0, -2.0));
        // both shifts follow the active system
        assert_eq!(systems.origin(CoordinateSystemId::Standard(2)), Point::new(5.0, 5.0, -2.0));
        systems.clear_position_shift();
        assert_eq!(systems.origin(CoordinateSystemId::G54), Point::new(105.0, 5.0, 0.0));
        // the work offset itself is untouched
        assert_eq!(systems.offset(CoordinateSystemId::G54), Point::new(100.0, 0.0, 0.0));
    }
}
