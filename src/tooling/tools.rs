// src/tooling/tools.rs - Tool table
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("tool {tool} outside table 1..{capacity}")]
    OutOfRange { tool: u32, capacity: u32 },
    #[error("no tool loaded in the spindle")]
    NoToolLoaded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolEntry {
    pub number: u32,
    /// Length offset in millimetres.
    pub length: f64,
    /// Radius in millimetres.
    pub radius: f64,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolTable {
    entries: Vec<ToolEntry>,
}

impl ToolTable {
    pub fn new(capacity: u32) -> Self {
        let entries = (1..=capacity)
            .map(|number| ToolEntry {
                number,
                length: 0.0,
                radius: 0.0,
                kind: "generic".to_string(),
            })
            .collect();
        Self { entries }
    }

    pub fn capacity(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn validate(&self, tool: u32) -> Result<(), ToolError> {
        if tool == 0 || tool > self.capacity() {
            return Err(ToolError::OutOfRange { tool, capacity: self.capacity() });
        }
        Ok(())
    }

    pub fn get(&self, tool: u32) -> Result<&ToolEntry, ToolError> {
        self.validate(tool)?;
        Ok(&self.entries[(tool - 1) as usize])
    }

    pub fn set_geometry(
        &mut self,
        tool: u32,
        length: Option<f64>,
        radius: Option<f64>,
    ) -> Result<(), ToolError> {
        self.validate(tool)?;
        let entry = &mut self.entries[(tool - 1) as usize];
        if let Some(length) = length {
            entry.length = length;
        }
        if let Some(radius) = radius {
            entry.radius = radius;
        }
        tracing::debug!("Tool {} geometry: length={} radius={}", tool, entry.length, entry.radius);
        Ok(())
    }

    pub fn set_kind(&mut self, tool: u32, kind: &str) -> Result<(), ToolError> {
        self.validate(tool)?;
        self.entries[(tool - 1) as usize].kind = kind.to_string();
        Ok(())
    }

    pub fn entries(&self) -> &[ToolEntry] {
        &self.entries
    }
}
