//! Tool table, work coordinate systems, and programmed-to-machine resolution.
//!
//! Machine point = programmed point + active work offset + G52 local offset + G92 shift
//! + tool length compensation, where the compensation is `+length` under G43, `-length`
//! under G44 and zero under G49.
//! Resolution never mutates anything; only the `apply_*`/`select_*` calls touch `ModalState`.

pub mod coordinates;
pub mod tools;

pub use coordinates::{CoordinateError, CoordinateSystemId, CoordinateSystems};
pub use tools::{ToolEntry, ToolError, ToolTable};

use crate::config::{CoordinatesConfig, ToolsConfig};
use crate::gcode::modal::{DistanceMode, ModalState, ToolLengthMode};
use modax_shared::{CompSide, CutterComp, Point};

/// Programmed axis values already converted to millimetres (A in degrees).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AxisTarget {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub a: Option<f64>,
}

impl AxisTarget {
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.z.is_none() && self.a.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ToolingManager {
    pub tools: ToolTable,
    pub coordinates: CoordinateSystems,
}

impl ToolingManager {
    pub fn new(table_size: u32, extended_systems: u16) -> Self {
        Self {
            tools: ToolTable::new(table_size),
            coordinates: CoordinateSystems::new(extended_systems),
        }
    }

    /// Builds the manager from configuration, ignoring entries `Config::validate` would reject.
    pub fn from_config(tools: &ToolsConfig, coordinates: &CoordinatesConfig) -> Self {
        let mut manager = Self::new(tools.table_size, coordinates.extended_systems);
        for entry in &tools.entries {
            let (length, radius) = (Some(entry.length), Some(entry.radius));
            if let Err(e) = manager.tools.set_geometry(entry.number, length, radius) {
                tracing::warn!("Skipping tool entry: {}", e);
                continue;
            }
            if let Some(kind) = &entry.kind {
                let _ = manager.tools.set_kind(entry.number, kind);
            }
        }
        for (name, offset) in &coordinates.offsets {
            let Some(id) = CoordinateSystemId::from_name(name) else {
                tracing::warn!("Unknown coordinate system '{}' in configuration", name);
                continue;
            };
            let [x, y, z] = *offset;
            if let Err(e) = manager.coordinates.set_offset(id, Point::new(x, y, z)) {
                tracing::warn!("Skipping work offset: {}", e);
            }
        }
        manager
    }

    /// Machine position of program zero, tool length included.
    fn program_zero(&self, modal: &ModalState) -> Point {
        let length = Point::new(0.0, 0.0, modal.tool_length_offset);
        self.coordinates.origin(modal.coordinate_system) + length
    }

    /// Resolves a fully specified programmed point to machine space.
    pub fn resolve_point(&self, programmed: Point, modal: &ModalState) -> Point {
        programmed + self.program_zero(modal)
    }

    /// Inverse of `resolve_point`.
    pub fn to_programmed(&self, machine: Point, modal: &ModalState) -> Point {
        machine - self.program_zero(modal)
    }

    /// Resolves the axes named in a block against the current machine position.
    /// Unnamed axes keep their current machine coordinate. `machine_coords` is G53.
    pub fn resolve_target(
        &self,
        target: &AxisTarget,
        modal: &ModalState,
        machine_coords: bool,
    ) -> Point {
        let current = modal.position;
        if machine_coords {
            return Point {
                x: target.x.unwrap_or(current.x),
                y: target.y.unwrap_or(current.y),
                z: target.z.unwrap_or(current.z),
                a: target.a.unwrap_or(current.a),
            };
        }
        match modal.distance {
            DistanceMode::Incremental => Point {
                x: current.x + target.x.unwrap_or(0.0),
                y: current.y + target.y.unwrap_or(0.0),
                z: current.z + target.z.unwrap_or(0.0),
                a: current.a + target.a.unwrap_or(0.0),
            },
            DistanceMode::Absolute => {
                let origin = self.resolve_point(Point::ORIGIN, modal);
                Point {
                    x: target.x.map_or(current.x, |v| v + origin.x),
                    y: target.y.map_or(current.y, |v| v + origin.y),
                    z: target.z.map_or(current.z, |v| v + origin.z),
                    a: target.a.map_or(current.a, |v| v + origin.a),
                }
            }
        }
    }

    /// G52: named axes replace the local offset, a bare G52 cancels it.
    pub fn set_local_offset(&mut self, target: &AxisTarget) {
        if target.is_empty() {
            self.coordinates.set_local_offset(Point::ORIGIN);
            return;
        }
        let current = self.coordinates.local_offset();
        self.coordinates.set_local_offset(Point {
            x: target.x.unwrap_or(current.x),
            y: target.y.unwrap_or(current.y),
            z: target.z.unwrap_or(current.z),
            a: target.a.unwrap_or(current.a),
        });
    }

    /// G92: shifts program zero so the current position reads as `target` on the named axes.
    pub fn set_position_shift(&mut self, modal: &ModalState, target: &AxisTarget) {
        let programmed = self.to_programmed(modal.position, modal);
        let mut shift = self.coordinates.position_shift();
        if let Some(x) = target.x {
            shift.x += programmed.x - x;
        }
        if let Some(y) = target.y {
            shift.y += programmed.y - y;
        }
        if let Some(z) = target.z {
            shift.z += programmed.z - z;
        }
        if let Some(a) = target.a {
            shift.a += programmed.a - a;
        }
        self.coordinates.set_position_shift(shift);
    }

    pub fn select_coordinate_system(
        &self,
        modal: &mut ModalState,
        id: CoordinateSystemId,
    ) -> Result<(), CoordinateError> {
        self.coordinates.validate(id)?;
        modal.coordinate_system = id;
        Ok(())
    }

    pub fn select_tool(&self, modal: &mut ModalState, tool: u32) -> Result<(), ToolError> {
        self.tools.validate(tool)?;
        modal.selected_tool = Some(tool);
        Ok(())
    }

    /// M6: load the staged tool.
    pub fn change_tool(&self, modal: &mut ModalState) -> Result<u32, ToolError> {
        let tool = modal.selected_tool.ok_or(ToolError::NoToolLoaded)?;
        self.tools.validate(tool)?;
        modal.tool = Some(tool);
        Ok(tool)
    }

    /// G43/G44/G49. `h` defaults to the loaded tool.
    pub fn apply_tool_length(
        &self,
        modal: &mut ModalState,
        mode: ToolLengthMode,
        h: Option<u32>,
    ) -> Result<(), ToolError> {
        let offset = match mode {
            ToolLengthMode::Cancelled => 0.0,
            ToolLengthMode::Positive | ToolLengthMode::Negative => {
                let tool = h.or(modal.tool).ok_or(ToolError::NoToolLoaded)?;
                let length = self.tools.get(tool)?.length;
                if mode == ToolLengthMode::Positive { length } else { -length }
            }
        };
        modal.tool_length = mode;
        modal.tool_length_offset = offset;
        Ok(())
    }

    /// G40/G41/G42. Compensation needs a loaded tool; `d` selects the radius entry.
    pub fn apply_cutter_comp(
        &self,
        modal: &mut ModalState,
        side: Option<CompSide>,
        d: Option<u32>,
    ) -> Result<(), ToolError> {
        let Some(side) = side else {
            modal.cutter_comp = None;
            return Ok(());
        };
        let loaded = modal.tool.ok_or(ToolError::NoToolLoaded)?;
        let radius = self.tools.get(d.unwrap_or(loaded))?.radius;
        modal.cutter_comp = Some(CutterComp { side, radius });
        Ok(())
    }
}
