// src/gcode/program.rs - Parsed program: a closed set of instruction kinds plus jump tables
use crate::gcode::expr::Expr;
use crate::gcode::modal::{
    CycleKind, DistanceMode, FeedMode, MotionMode, PathMode, RetractMode, StopKind, ToolLengthMode,
    Units,
};
use crate::tooling::CoordinateSystemId;
use modax_shared::{CompSide, CoolantMode, Plane, SpindleDirection};
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxisWords {
    pub x: Option<Expr>,
    pub y: Option<Expr>,
    pub z: Option<Expr>,
    pub a: Option<Expr>,
}

impl AxisWords {
    pub fn is_empty(&self) -> bool {
        self.x.is_none() && self.y.is_none() && self.z.is_none() && self.a.is_none()
    }
}

/// Words a move consumes besides axes. Their meaning depends on the motion mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoveWords {
    pub axes: AxisWords,
    pub i: Option<Expr>,
    pub j: Option<Expr>,
    pub k: Option<Expr>,
    /// Arc radius, or the R plane of a canned cycle.
    pub r: Option<Expr>,
    /// Peck depth.
    pub q: Option<Expr>,
    /// Cycle dwell in seconds.
    pub p: Option<Expr>,
    /// G53 for this block only.
    pub machine_coords: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Label(String),
    Block(u32),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Label(name) => write!(f, "{}", name),
            Target::Block(n) => write!(f, "N{}", n),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    SetFeedMode(FeedMode),
    SetFeedRate(Expr),
    SetSpindleSpeed(Expr),
    SelectTool(Expr),
    ChangeTool,
    Spindle(SpindleDirection),
    Coolant(CoolantMode),
    SetFeedOverride(Expr),
    Dwell(Expr),
    SetPlane(Plane),
    SetUnits(Units),
    SetCutterComp { side: Option<CompSide>, tool: Option<Expr> },
    SetToolLength { mode: ToolLengthMode, tool: Option<Expr> },
    SelectCoordinateSystem(CoordinateSystemId),
    SetPathMode(PathMode),
    SetDistanceMode(DistanceMode),
    SetRetractMode(RetractMode),
    /// G10 L1
    SetToolData { tool: Expr, length: Option<Expr>, radius: Option<Expr> },
    /// G10 L2 / L20
    SetWorkOffset { extended: bool, system: Expr, axes: AxisWords },
    /// G28
    Home { via: AxisWords },
    /// G52; no axes cancels
    SetLocalOffset(AxisWords),
    /// G92
    SetPositionShift(AxisWords),
    /// G92.1
    ClearPositionShift,
    SetMotionMode(MotionMode),
    Move(MoveWords),
    /// M98
    CallSubprogram { program: Expr, repeat: Option<Expr> },
    /// G65, arguments already mapped to local variable numbers
    CallMacro { program: Expr, args: Vec<(u32, Expr)> },
    /// M99
    ReturnFromSubprogram,
    Stop(StopKind),
    Assign { var: u32, value: Expr },
    Label(String),
    Goto(Target),
    IfGoto { condition: Expr, target: Target },
    Gosub(Target),
    Return,
    SubprogramStart(u32),
}

/// One parsed instruction; immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub line: usize,
    pub kind: InstructionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subprogram {
    /// Index of the `SubprogramStart` instruction.
    pub start: usize,
    /// Index of the closing `ReturnFromSubprogram`.
    pub end: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub instructions: Vec<Instruction>,
    pub labels: HashMap<String, usize>,
    pub blocks: HashMap<u32, usize>,
    pub subprograms: HashMap<u32, Subprogram>,
    /// Source lines belonging to the submitted text (library bodies excluded).
    pub source_lines: usize,
}

impl Program {
    pub fn resolve(&self, target: &Target) -> Option<usize> {
        match target {
            Target::Label(name) => self.labels.get(name).copied(),
            Target::Block(n) => self.blocks.get(n).copied(),
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Number of instructions that produce motion.
    pub fn motion_count(&self) -> usize {
        self.instructions
            .iter()
            .filter(|i| matches!(i.kind, InstructionKind::Move(_) | InstructionKind::Home { .. }))
            .count()
    }
}

/// Fanuc G65 argument letters to local variable numbers.
pub fn macro_argument_variable(letter: char) -> Option<u32> {
    Some(match letter {
        'A' => 1,
        'B' => 2,
        'C' => 3,
        'I' => 4,
        'J' => 5,
        'K' => 6,
        'D' => 7,
        'E' => 8,
        'F' => 9,
        'H' => 11,
        'M' => 13,
        'Q' => 17,
        'R' => 18,
        'S' => 19,
        'T' => 20,
        'U' => 21,
        'V' => 22,
        'W' => 23,
        'X' => 24,
        'Y' => 25,
        'Z' => 26,
        _ => return None,
    })
}

impl CycleKind {
    pub fn from_gcode(code: i32) -> Option<Self> {
        match code {
            810 => Some(CycleKind::Drill),
            820 => Some(CycleKind::DrillDwell),
            830 => Some(CycleKind::PeckDrill),
            730 => Some(CycleKind::ChipBreakDrill),
            840 => Some(CycleKind::Tap),
            850 => Some(CycleKind::Bore),
            _ => None,
        }
    }
}
