// src/gcode/interpreter.rs - Executes a parsed program one instruction at a time
//
// The interpreter owns program flow (jumps, calls, variables) and mutates the session's
// ModalState. Everything with a physical effect comes out as a `Step` for the runner.

use crate::config::InterpreterConfig;
use crate::gcode::expr::{EvalError, Expr, VariableSource};
use crate::gcode::modal::{CycleKind, DistanceMode, ModalState, MotionMode, RetractMode, StopKind};
use crate::gcode::program::{AxisWords, InstructionKind, MoveWords, Program, Target};
use crate::motion::{ArcSpec, CycleRequest, MoveKind, MoveRequest};
use crate::tooling::{AxisTarget, CoordinateError, CoordinateSystemId, ToolError, ToolingManager};
use modax_shared::{ArcDirection, CoolantMode, Point, SpindleDirection};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Variables #1..#33 are local to the current macro frame.
const LOCAL_VARIABLES: std::ops::RangeInclusive<u32> = 1..=33;

#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}: {kind}")]
pub struct InterpreterError {
    pub line: usize,
    pub kind: InterpreterErrorKind,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpreterErrorKind {
    #[error("call stack depth limit {0} exceeded")]
    CallDepthExceeded(usize),
    #[error("macro nesting limit {0} exceeded")]
    MacroDepthExceeded(usize),
    #[error("more than {0} blocks executed, program halted")]
    RunawayExecution(u64),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("subprogram O{0} is not defined")]
    UndefinedSubprogram(u32),
    #[error("jump target {0} is not defined")]
    UndefinedTarget(String),
    #[error("return without a matching call")]
    ReturnWithoutCall,
    #[error("{0} does not match the innermost call")]
    MismatchedReturn(&'static str),
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Coordinate(#[from] CoordinateError),
    #[error("invalid value {value} for {letter}")]
    InvalidValue { letter: char, value: f64 },
    #[error("axis words given with no motion mode active")]
    NoMotionMode,
    #[error("circular move needs I/J/K or R")]
    MissingArcParameters,
    #[error("circular move cannot combine I/J/K with R")]
    ConflictingArcParameters,
    #[error("canned cycle needs word {0}")]
    MissingCycleParameter(char),
}

/// Something with a physical effect, in program order.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Move(MoveRequest),
    Cycle(CycleRequest),
    Dwell { seconds: f64 },
    Spindle { direction: SpindleDirection, rpm: f64 },
    Coolant { mode: CoolantMode },
    ToolChange { tool: u32 },
    Pause { optional: bool },
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub line: usize,
    pub action: Action,
}

#[derive(Debug, Clone)]
enum Frame {
    Gosub { return_to: usize },
    Subprogram { return_to: usize, start: usize, remaining: u32 },
    Macro { return_to: usize },
}

/// Canned-cycle words retained between cycle blocks, in programmed units.
#[derive(Debug, Clone, Copy, Default)]
struct CycleWords {
    r: Option<f64>,
    z: Option<f64>,
    q: Option<f64>,
    p: Option<f64>,
}

#[derive(Debug)]
pub struct Interpreter {
    program: Arc<Program>,
    pc: usize,
    frames: Vec<Frame>,
    globals: HashMap<u32, f64>,
    locals: Vec<HashMap<u32, f64>>,
    macro_depth: usize,
    executed: u64,
    limits: InterpreterConfig,
    override_range: (f64, f64),
    cycle: CycleWords,
    pending: VecDeque<Step>,
    finished: bool,
}

impl VariableSource for Interpreter {
    fn get(&self, number: u32) -> Option<f64> {
        if LOCAL_VARIABLES.contains(&number) {
            self.locals.last().and_then(|l| l.get(&number)).copied()
        } else {
            self.globals.get(&number).copied()
        }
    }
}

impl Interpreter {
    pub fn new(
        program: Arc<Program>,
        limits: InterpreterConfig,
        override_range: (f64, f64),
    ) -> Self {
        Self {
            program,
            pc: 0,
            frames: Vec::new(),
            globals: HashMap::new(),
            locals: vec![HashMap::new()],
            macro_depth: 0,
            executed: 0,
            limits,
            override_range,
            cycle: CycleWords::default(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn variable(&self, number: u32) -> Option<f64> {
        self.get(number)
    }

    /// Runs instructions until the next physical step. `None` once the program has ended.
    pub fn next_step(
        &mut self,
        modal: &mut ModalState,
        tooling: &mut ToolingManager,
    ) -> Result<Option<Step>, InterpreterError> {
        loop {
            if let Some(step) = self.pending.pop_front() {
                return Ok(Some(step));
            }
            if self.finished {
                return Ok(None);
            }
            let program = Arc::clone(&self.program);
            let Some(instruction) = program.instructions.get(self.pc) else {
                self.finished = true;
                return Ok(None);
            };
            let line = instruction.line;
            self.executed += 1;
            if self.executed > self.limits.max_executed_blocks {
                let kind = InterpreterErrorKind::RunawayExecution(self.limits.max_executed_blocks);
                return Err(InterpreterError { line, kind });
            }
            self.pc += 1;
            if let Some(action) = self
                .execute(&instruction.kind, line, modal, tooling)
                .map_err(|kind| InterpreterError { line, kind })?
            {
                tracing::debug!("line {}: {:?}", line, action);
                self.pending.push_back(Step { line, action });
            }
        }
    }

    fn execute(
        &mut self,
        kind: &InstructionKind,
        line: usize,
        modal: &mut ModalState,
        tooling: &mut ToolingManager,
    ) -> Result<Option<Action>, InterpreterErrorKind> {
        let scale = modal.units.scale();
        match kind {
            InstructionKind::SetFeedMode(mode) => modal.feed_mode = *mode,
            InstructionKind::SetFeedRate(e) => modal.feed_rate = Some(self.non_negative(e, 'F')?),
            InstructionKind::SetSpindleSpeed(e) => {
                modal.spindle_speed = self.non_negative(e, 'S')?;
                if modal.spindle != SpindleDirection::Stopped {
                    let (direction, rpm) = (modal.spindle, modal.spindle_speed);
                    return Ok(Some(Action::Spindle { direction, rpm }));
                }
            }
            InstructionKind::SelectTool(e) => {
                let tool = self.integer(e, 'T')?;
                tooling.select_tool(modal, tool)?;
            }
            InstructionKind::ChangeTool => {
                let tool = tooling.change_tool(modal)?;
                return Ok(Some(Action::ToolChange { tool }));
            }
            InstructionKind::Spindle(direction) => {
                modal.spindle = *direction;
                let rpm = modal.spindle_speed;
                return Ok(Some(Action::Spindle { direction: *direction, rpm }));
            }
            InstructionKind::Coolant(mode) => {
                modal.coolant = *mode;
                return Ok(Some(Action::Coolant { mode: *mode }));
            }
            InstructionKind::SetFeedOverride(e) => {
                let percent = self.value(e)?;
                let (min, max) = self.override_range;
                modal.set_feed_override(percent, min, max);
            }
            InstructionKind::Dwell(e) => {
                return Ok(Some(Action::Dwell { seconds: self.non_negative(e, 'P')? }));
            }
            InstructionKind::SetPlane(plane) => modal.plane = *plane,
            InstructionKind::SetUnits(units) => modal.units = *units,
            InstructionKind::SetCutterComp { side, tool } => {
                let d = tool.as_ref().map(|e| self.integer(e, 'D')).transpose()?;
                tooling.apply_cutter_comp(modal, *side, d)?;
            }
            InstructionKind::SetToolLength { mode, tool } => {
                let h = tool.as_ref().map(|e| self.integer(e, 'H')).transpose()?;
                tooling.apply_tool_length(modal, *mode, h)?;
            }
            InstructionKind::SelectCoordinateSystem(id) => {
                tooling.select_coordinate_system(modal, *id)?
            }
            InstructionKind::SetPathMode(mode) => modal.path_mode = *mode,
            InstructionKind::SetDistanceMode(mode) => modal.distance = *mode,
            InstructionKind::SetRetractMode(mode) => modal.retract_mode = *mode,
            InstructionKind::SetToolData { tool, length, radius } => {
                let tool = self.integer(tool, 'P')?;
                let length = self.scaled(length, scale)?;
                let radius = match radius {
                    Some(e) => Some(self.non_negative(e, 'R')? * scale),
                    None => None,
                };
                tooling.tools.set_geometry(tool, length, radius)?;
            }
            InstructionKind::SetWorkOffset { extended, system, axes } => {
                let n = self.integer(system, 'P')?;
                let value = n as f64;
                let invalid = |_| InterpreterErrorKind::InvalidValue { letter: 'P', value };
                let id = if *extended {
                    CoordinateSystemId::Extended(u16::try_from(n).map_err(invalid)?)
                } else {
                    CoordinateSystemId::Standard(u8::try_from(n).map_err(invalid)?)
                };
                let target = self.axis_target(axes, scale)?;
                let current = tooling.coordinates.offset(id);
                let offset = Point {
                    x: target.x.unwrap_or(current.x),
                    y: target.y.unwrap_or(current.y),
                    z: target.z.unwrap_or(current.z),
                    a: target.a.unwrap_or(current.a),
                };
                tooling.coordinates.set_offset(id, offset)?;
            }
            InstructionKind::Home { via } => self.home(via, line, scale, modal, tooling)?,
            InstructionKind::SetLocalOffset(axes) => {
                let target = self.axis_target(axes, scale)?;
                tooling.set_local_offset(&target);
            }
            InstructionKind::SetPositionShift(axes) => {
                let target = self.axis_target(axes, scale)?;
                tooling.set_position_shift(modal, &target);
            }
            InstructionKind::ClearPositionShift => tooling.coordinates.clear_position_shift(),
            InstructionKind::SetMotionMode(mode) => {
                if !matches!(mode, MotionMode::Cycle(_)) {
                    modal.cycle_initial_z = None;
                    self.cycle = CycleWords::default();
                }
                modal.motion = *mode;
            }
            InstructionKind::Move(words) => {
                return self.motion(words, line, scale, modal, tooling).map(Some);
            }
            InstructionKind::CallSubprogram { program, repeat } => {
                let n = self.integer(program, 'P')?;
                let repeat = match repeat {
                    Some(e) => self.integer(e, 'L')?,
                    None => 1,
                };
                let start = self.subprogram_start(n)?;
                if repeat == 0 {
                    return Ok(None);
                }
                let return_to = self.pc;
                self.push_frame(Frame::Subprogram { return_to, start, remaining: repeat - 1 })?;
                self.pc = start;
            }
            InstructionKind::CallMacro { program, args } => {
                let n = self.integer(program, 'P')?;
                let start = self.subprogram_start(n)?;
                let max_depth = self.limits.max_macro_depth;
                if self.macro_depth >= max_depth {
                    return Err(InterpreterErrorKind::MacroDepthExceeded(max_depth));
                }
                let mut frame_locals = HashMap::new();
                for (var, value) in args {
                    frame_locals.insert(*var, self.value(value)?);
                }
                self.push_frame(Frame::Macro { return_to: self.pc })?;
                self.locals.push(frame_locals);
                self.macro_depth += 1;
                self.pc = start;
            }
            InstructionKind::ReturnFromSubprogram => match self.frames.pop() {
                Some(Frame::Subprogram { return_to, start, remaining }) => {
                    if remaining > 0 {
                        let remaining = remaining - 1;
                        self.frames.push(Frame::Subprogram { return_to, start, remaining });
                        self.pc = start;
                    } else {
                        self.pc = return_to;
                    }
                }
                Some(Frame::Macro { return_to }) => {
                    self.locals.pop();
                    self.macro_depth -= 1;
                    self.pc = return_to;
                }
                Some(frame @ Frame::Gosub { .. }) => {
                    self.frames.push(frame);
                    return Err(InterpreterErrorKind::MismatchedReturn("M99"));
                }
                None => return Err(InterpreterErrorKind::ReturnWithoutCall),
            },
            InstructionKind::Stop(kind) => {
                return Ok(Some(match kind {
                    StopKind::Pause => Action::Pause { optional: false },
                    StopKind::OptionalPause => Action::Pause { optional: true },
                    StopKind::End | StopKind::EndRewind => {
                        self.finished = true;
                        Action::End
                    }
                }));
            }
            InstructionKind::Assign { var, value } => {
                let v = self.value(value)?;
                if LOCAL_VARIABLES.contains(var) {
                    if let Some(frame) = self.locals.last_mut() {
                        frame.insert(*var, v);
                    }
                } else {
                    self.globals.insert(*var, v);
                }
            }
            InstructionKind::Label(_) => {}
            InstructionKind::Goto(target) => self.pc = self.resolve(target)?,
            InstructionKind::IfGoto { condition, target } => {
                if self.value(condition)? != 0.0 {
                    self.pc = self.resolve(target)?;
                }
            }
            InstructionKind::Gosub(target) => {
                let to = self.resolve(target)?;
                self.push_frame(Frame::Gosub { return_to: self.pc })?;
                self.pc = to;
            }
            InstructionKind::Return => match self.frames.pop() {
                Some(Frame::Gosub { return_to }) => self.pc = return_to,
                Some(frame) => {
                    self.frames.push(frame);
                    return Err(InterpreterErrorKind::MismatchedReturn("RETURN"));
                }
                None => return Err(InterpreterErrorKind::ReturnWithoutCall),
            },
            InstructionKind::SubprogramStart(n) => {
                // reached by falling through: definitions are skipped, not run
                if let Some(sub) = self.program.subprograms.get(n) {
                    self.pc = sub.end + 1;
                }
            }
        }
        Ok(None)
    }

    fn push_frame(&mut self, frame: Frame) -> Result<(), InterpreterErrorKind> {
        if self.frames.len() >= self.limits.max_call_depth {
            return Err(InterpreterErrorKind::CallDepthExceeded(self.limits.max_call_depth));
        }
        self.frames.push(frame);
        Ok(())
    }

    fn resolve(&self, target: &Target) -> Result<usize, InterpreterErrorKind> {
        self.program
            .resolve(target)
            .ok_or_else(|| InterpreterErrorKind::UndefinedTarget(target.to_string()))
    }

    /// First instruction after the `O` label.
    fn subprogram_start(&self, number: u32) -> Result<usize, InterpreterErrorKind> {
        match self.program.subprograms.get(&number) {
            Some(sub) => Ok(sub.start + 1),
            None => Err(InterpreterErrorKind::UndefinedSubprogram(number)),
        }
    }

    fn value(&self, e: &Expr) -> Result<f64, InterpreterErrorKind> {
        Ok(e.eval(self)?)
    }

    fn non_negative(&self, e: &Expr, letter: char) -> Result<f64, InterpreterErrorKind> {
        let value = self.value(e)?;
        if value < 0.0 || !value.is_finite() {
            return Err(InterpreterErrorKind::InvalidValue { letter, value });
        }
        Ok(value)
    }

    fn integer(&self, e: &Expr, letter: char) -> Result<u32, InterpreterErrorKind> {
        let value = self.value(e)?;
        let rounded = value.round();
        if (value - rounded).abs() > 1e-6 || rounded < 0.0 || rounded > u32::MAX as f64 {
            return Err(InterpreterErrorKind::InvalidValue { letter, value });
        }
        Ok(rounded as u32)
    }

    /// An optional linear word in millimetres.
    fn scaled(&self, e: &Option<Expr>, scale: f64) -> Result<Option<f64>, InterpreterErrorKind> {
        match e {
            Some(e) => Ok(Some(self.value(e)? * scale)),
            None => Ok(None),
        }
    }

    fn axis_target(
        &self,
        axes: &AxisWords,
        scale: f64,
    ) -> Result<AxisTarget, InterpreterErrorKind> {
        Ok(AxisTarget {
            x: self.scaled(&axes.x, scale)?,
            y: self.scaled(&axes.y, scale)?,
            z: self.scaled(&axes.z, scale)?,
            a: self.scaled(&axes.a, 1.0)?,
        })
    }

    /// G28: rapid through the optional intermediate point, then to machine zero on the named axes.
    fn home(
        &mut self,
        via: &AxisWords,
        line: usize,
        scale: f64,
        modal: &mut ModalState,
        tooling: &ToolingManager,
    ) -> Result<(), InterpreterErrorKind> {
        let target = self.axis_target(via, scale)?;
        let start = modal.position;
        let home = if target.is_empty() {
            Point::ORIGIN
        } else {
            let intermediate = tooling.resolve_target(&target, modal, false);
            self.pending.push_back(Step {
                line,
                action: Action::Move(MoveRequest {
                    kind: MoveKind::Rapid,
                    start,
                    end: intermediate,
                    arc: None,
                    line,
                }),
            });
            Point {
                x: if target.x.is_some() { 0.0 } else { intermediate.x },
                y: if target.y.is_some() { 0.0 } else { intermediate.y },
                z: if target.z.is_some() { 0.0 } else { intermediate.z },
                a: if target.a.is_some() { 0.0 } else { intermediate.a },
            }
        };
        let from = self.pending.back().and_then(|s| match &s.action {
            Action::Move(m) => Some(m.end),
            _ => None,
        });
        self.pending.push_back(Step {
            line,
            action: Action::Move(MoveRequest {
                kind: MoveKind::Rapid,
                start: from.unwrap_or(start),
                end: home,
                arc: None,
                line,
            }),
        });
        modal.position = home;
        Ok(())
    }

    fn motion(
        &mut self,
        words: &MoveWords,
        line: usize,
        scale: f64,
        modal: &mut ModalState,
        tooling: &ToolingManager,
    ) -> Result<Action, InterpreterErrorKind> {
        let start = modal.position;
        let kind = match modal.motion {
            MotionMode::None => return Err(InterpreterErrorKind::NoMotionMode),
            MotionMode::Cycle(_) => return self.cycle(words, line, scale, modal, tooling),
            MotionMode::Rapid => MoveKind::Rapid,
            MotionMode::Linear => MoveKind::Linear,
            MotionMode::ArcCw => MoveKind::Arc(ArcDirection::Clockwise),
            MotionMode::ArcCcw => MoveKind::Arc(ArcDirection::CounterClockwise),
        };
        let target = self.axis_target(&words.axes, scale)?;
        let end = tooling.resolve_target(&target, modal, words.machine_coords);
        let arc = match kind {
            MoveKind::Arc(_) => {
                let centre = [&words.i, &words.j, &words.k];
                let has_centre = centre.iter().any(|w| w.is_some());
                match (has_centre, &words.r) {
                    (true, Some(_)) => return Err(InterpreterErrorKind::ConflictingArcParameters),
                    (false, None) => return Err(InterpreterErrorKind::MissingArcParameters),
                    (false, Some(r)) => Some(ArcSpec::Radius(self.value(r)? * scale)),
                    (true, None) => {
                        let offset = |w: &Option<Expr>| -> Result<f64, InterpreterErrorKind> {
                            Ok(self.scaled(w, scale)?.unwrap_or(0.0))
                        };
                        let (i, j, k) = (offset(&words.i)?, offset(&words.j)?, offset(&words.k)?);
                        Some(ArcSpec::Center(Point::new(i, j, k)))
                    }
                }
            }
            _ => None,
        };
        modal.position = end;
        Ok(Action::Move(MoveRequest { kind, start, end, arc, line }))
    }

    fn cycle(
        &mut self,
        words: &MoveWords,
        line: usize,
        scale: f64,
        modal: &mut ModalState,
        tooling: &ToolingManager,
    ) -> Result<Action, InterpreterErrorKind> {
        let MotionMode::Cycle(kind) = modal.motion else {
            return Err(InterpreterErrorKind::NoMotionMode);
        };
        let opt = |w: &Option<Expr>| w.as_ref().map(|e| self.value(e)).transpose();
        let (r, z, q, p) = (opt(&words.r)?, opt(&words.axes.z)?, opt(&words.q)?, opt(&words.p)?);
        self.cycle.r = r.or(self.cycle.r);
        self.cycle.z = z.or(self.cycle.z);
        self.cycle.q = q.or(self.cycle.q);
        self.cycle.p = p.or(self.cycle.p);
        let r = self.cycle.r.ok_or(InterpreterErrorKind::MissingCycleParameter('R'))? * scale;
        let z = self.cycle.z.ok_or(InterpreterErrorKind::MissingCycleParameter('Z'))? * scale;
        let peck = match kind {
            CycleKind::PeckDrill | CycleKind::ChipBreakDrill => {
                let q = self.cycle.q.ok_or(InterpreterErrorKind::MissingCycleParameter('Q'))?;
                let q = q * scale;
                if q <= 0.0 {
                    return Err(InterpreterErrorKind::InvalidValue { letter: 'Q', value: q });
                }
                Some(q)
            }
            _ => None,
        };
        let dwell = match kind {
            CycleKind::DrillDwell => Some(self.cycle.p.unwrap_or(0.0).max(0.0)),
            _ => None,
        };

        let start = modal.position;
        let initial_z = *modal.cycle_initial_z.get_or_insert(start.z);
        let xy = AxisTarget {
            x: self.scaled(&words.axes.x, scale)?,
            y: self.scaled(&words.axes.y, scale)?,
            z: None,
            a: None,
        };
        let hole = tooling.resolve_target(&xy, modal, false);
        let (r_z, bottom_z) = match modal.distance {
            DistanceMode::Absolute => {
                let origin_z = tooling.resolve_point(Point::ORIGIN, modal).z;
                (origin_z + r, origin_z + z)
            }
            DistanceMode::Incremental => (initial_z + r, initial_z + r + z),
        };
        let retract_z = match modal.retract_mode {
            RetractMode::InitialLevel => initial_z.max(r_z),
            RetractMode::RPlane => r_z,
        };
        modal.position = Point { x: hole.x, y: hole.y, z: retract_z, a: start.a };
        Ok(Action::Cycle(CycleRequest {
            kind,
            start,
            hole,
            r_z,
            bottom_z,
            retract_z,
            peck,
            dwell,
            line,
        }))
    }
}
