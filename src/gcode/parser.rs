//! Line-oriented program parser with span-tracked diagnostics.
//!
//! Every line is lexed into words or a flow statement, words are grouped into typed
//! instructions in execution order, and whole-program checks (subprogram nesting,
//! jump targets, literal tool and coordinate ranges) run afterwards. Any error rejects
//! the program; all errors found are reported, sorted by line.

use crate::config::Config;
use crate::gcode::expr::{parse_expr, Expr, ExprError};
use crate::gcode::modal::{
    CycleKind, DistanceMode, FeedMode, MotionMode, PathMode, RetractMode, StopKind, ToolLengthMode,
    Units,
};
use crate::gcode::program::{
    macro_argument_variable, AxisWords, Instruction, InstructionKind, MoveWords, Program,
    Subprogram, Target,
};
use crate::tooling::CoordinateSystemId;
use modax_shared::{CompSide, CoolantMode, Plane, SpindleDirection};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Clone, PartialEq, Error)]
#[error("line {line}, column {column}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    /// A whole-line error, reported at column 1.
    fn at_line(line: usize, kind: ParseErrorKind) -> Self {
        Self { line, column: 1, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseErrorKind {
    #[error("unknown code {0}")]
    UnknownCode(String),
    #[error("malformed number '{0}'")]
    MalformedNumber(String),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error("{first} and {second} are both in the {group} modal group")]
    ModalConflict { group: &'static str, first: String, second: String },
    #[error("word {0} appears twice in one block")]
    DuplicateWord(char),
    #[error("word {0} is not supported")]
    UnsupportedWord(char),
    #[error("word {0} is not used by any code in this block")]
    UnusedWord(char),
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("unclosed comment")]
    UnclosedComment,
    #[error("{0} code requires a literal value")]
    NonLiteralCode(char),
    #[error("{code} requires word {letter}")]
    MissingWord { code: String, letter: char },
    #[error("circular move needs I/J/K or R")]
    MissingArcParameters,
    #[error("circular move cannot combine I/J/K with R")]
    ConflictingArcParameters,
    #[error("tool {tool} outside table 1..{capacity}")]
    ToolOutOfRange { tool: f64, capacity: u32 },
    #[error("coordinate system {0} is not configured")]
    CoordinateSystemOutOfRange(String),
    #[error("invalid statement '{0}'")]
    InvalidStatement(String),
    #[error("subprogram O{0} has no closing M99")]
    UnterminatedSubprogram(u32),
    #[error("subprogram O{0} opened inside another subprogram")]
    NestedSubprogram(u32),
    #[error("subprogram O{0} defined twice")]
    DuplicateSubprogram(u32),
    #[error("M99 outside a subprogram")]
    ReturnOutsideSubprogram,
    #[error("label {0} defined twice")]
    DuplicateLabel(String),
    #[error("jump target {0} is not defined")]
    UndefinedTarget(String),
    #[error("subprogram O{0} is not defined")]
    UndefinedSubprogram(u32),
    #[error("read error: {0}")]
    Io(String),
}

/// Static limits the parser checks literal values against.
#[derive(Debug, Clone)]
pub struct ParserConfig {
    pub tool_capacity: u32,
    pub extended_systems: u16,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self { tool_capacity: 24, extended_systems: 48 }
    }
}

impl ParserConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tool_capacity: config.tools.table_size,
            extended_systems: config.coordinates.extended_systems,
        }
    }
}

/// Parses a whole program. No partial acceptance: any error rejects it.
pub fn parse_program(src: &str, config: &ParserConfig) -> Result<Program, Vec<ParseError>> {
    assemble(src, config, &HashSet::new())
}

/// Parses a program, linking in library subprograms it calls and does not define itself.
pub fn parse_program_with_library(
    src: &str,
    config: &ParserConfig,
    library: &BTreeMap<u32, String>,
) -> Result<Program, Vec<ParseError>> {
    let external: HashSet<u32> = library.keys().copied().collect();
    let main = assemble(src, config, &external)?;

    let mut needed = BTreeSet::new();
    let mut pending: Vec<u32> = match main.called_subprograms() {
        Some(called) => called.into_iter().collect(),
        // a computed call could reach any library entry
        None => library.keys().copied().collect(),
    };
    while let Some(n) = pending.pop() {
        if main.subprograms.contains_key(&n) || !needed.insert(n) {
            continue;
        }
        let Some(body) = library.get(&n) else { continue };
        let linked = assemble(body, config, &external)?;
        match linked.called_subprograms() {
            Some(called) => pending.extend(called),
            None => pending.extend(library.keys().copied()),
        }
    }
    if needed.is_empty() {
        return Ok(main);
    }

    let mut combined = src.to_string();
    if !combined.is_empty() && !combined.ends_with('\n') {
        combined.push('\n');
    }
    for n in &needed {
        if let Some(body) = library.get(n) {
            combined.push_str(body);
            combined.push('\n');
        }
    }
    let mut program = assemble(&combined, config, &HashSet::new())?;
    program.source_lines = main.source_lines;
    Ok(program)
}

/// Reads a program text stream to the end, then parses it.
pub async fn parse_stream<R>(
    reader: R,
    config: &ParserConfig,
    library: &BTreeMap<u32, String>,
) -> Result<Program, Vec<ParseError>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut src = String::new();
    let mut count = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                count += 1;
                src.push_str(&line);
                src.push('\n');
            }
            Ok(None) => break,
            Err(e) => {
                let kind = ParseErrorKind::Io(e.to_string());
                return Err(vec![ParseError::at_line(count + 1, kind)]);
            }
        }
    }
    parse_program_with_library(&src, config, library)
}

impl Program {
    /// Literal subprogram numbers called by M98/G65, or `None` if any call is computed.
    pub fn called_subprograms(&self) -> Option<BTreeSet<u32>> {
        let mut called = BTreeSet::new();
        for instruction in &self.instructions {
            let program = match &instruction.kind {
                InstructionKind::CallSubprogram { program, .. }
                | InstructionKind::CallMacro { program, .. } => program,
                _ => continue,
            };
            called.insert(literal_u32(program)?);
        }
        Some(called)
    }
}

fn assemble(
    src: &str,
    config: &ParserConfig,
    external: &HashSet<u32>,
) -> Result<Program, Vec<ParseError>> {
    let mut program = Program::default();
    let mut errors = Vec::new();
    let mut open: Option<(u32, usize, usize)> = None;
    let mut jumps: Vec<(Target, usize)> = Vec::new();
    let mut calls: Vec<(u32, usize)> = Vec::new();

    for (index, raw) in src.lines().enumerate() {
        let line = index + 1;
        program.source_lines = line;
        let parsed = match parse_line(raw, line, config) {
            Ok(parsed) => parsed,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        if let Some(n) = parsed.block_number {
            program.blocks.entry(n).or_insert(program.instructions.len());
        }
        for kind in parsed.instructions {
            let at = program.instructions.len();
            match &kind {
                InstructionKind::SubprogramStart(n) => {
                    if let Some((outer, _, _)) = open {
                        tracing::debug!("O{} opened inside O{}", n, outer);
                        let kind = ParseErrorKind::NestedSubprogram(*n);
                        errors.push(ParseError::at_line(line, kind));
                    } else if program.subprograms.contains_key(n) {
                        let kind = ParseErrorKind::DuplicateSubprogram(*n);
                        errors.push(ParseError::at_line(line, kind));
                    } else {
                        open = Some((*n, at, line));
                    }
                }
                InstructionKind::ReturnFromSubprogram => match open.take() {
                    Some((n, start, _)) => {
                        program.subprograms.insert(n, Subprogram { start, end: at });
                    }
                    None => {
                        let kind = ParseErrorKind::ReturnOutsideSubprogram;
                        errors.push(ParseError::at_line(line, kind));
                    }
                },
                InstructionKind::Label(name) => {
                    if program.labels.insert(name.clone(), at).is_some() {
                        let kind = ParseErrorKind::DuplicateLabel(name.clone());
                        errors.push(ParseError::at_line(line, kind));
                    }
                }
                InstructionKind::Goto(target)
                | InstructionKind::Gosub(target)
                | InstructionKind::IfGoto { target, .. } => {
                    jumps.push((target.clone(), line));
                }
                InstructionKind::CallSubprogram { program: p, .. }
                | InstructionKind::CallMacro { program: p, .. } => {
                    if let Some(n) = literal_u32(p) {
                        calls.push((n, line));
                    }
                }
                _ => {}
            }
            program.instructions.push(Instruction { line, kind });
        }
    }

    if let Some((n, _, line)) = open {
        errors.push(ParseError::at_line(line, ParseErrorKind::UnterminatedSubprogram(n)));
    }
    for (target, line) in jumps {
        if program.resolve(&target).is_none() {
            let kind = ParseErrorKind::UndefinedTarget(target.to_string());
            errors.push(ParseError::at_line(line, kind));
        }
    }
    for (n, line) in calls {
        if !program.subprograms.contains_key(&n) && !external.contains(&n) {
            errors.push(ParseError::at_line(line, ParseErrorKind::UndefinedSubprogram(n)));
        }
    }

    if errors.is_empty() {
        Ok(program)
    } else {
        errors.sort_by_key(|e| (e.line, e.column));
        Err(errors)
    }
}

fn literal_u32(expr: &Expr) -> Option<u32> {
    let v = expr.as_literal()?;
    (v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f64).then_some(v as u32)
}

struct ParsedLine {
    block_number: Option<u32>,
    instructions: Vec<InstructionKind>,
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: usize,
}

impl Cursor {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(|c| c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn column(&self) -> usize {
        self.pos + 1
    }

    fn rest(&self) -> String {
        self.chars[self.pos..].iter().collect::<String>().trim().to_string()
    }

    fn error(&self, column: usize, kind: ParseErrorKind) -> ParseError {
        ParseError { line: self.line, column, kind }
    }

    fn digits(&mut self) -> String {
        let mut s = String::new();
        while let Some(c) = self.peek().filter(|c| c.is_ascii_digit()) {
            s.push(c);
            self.pos += 1;
        }
        s
    }
}

/// Blanks comments (keeping columns) and upper-cases the rest.
fn strip_comments(raw: &str, line: usize) -> Result<Vec<char>, ParseError> {
    let mut out = Vec::with_capacity(raw.len());
    let mut comment_start = None;
    for (i, c) in raw.chars().enumerate() {
        match (comment_start, c) {
            (Some(_), ')') => {
                comment_start = None;
                out.push(' ');
            }
            (Some(_), _) => out.push(' '),
            (None, '(') => {
                comment_start = Some(i);
                out.push(' ');
            }
            (None, ';') => break,
            (None, c) => out.push(c.to_ascii_uppercase()),
        }
    }
    match comment_start {
        Some(i) => Err(ParseError { line, column: i + 1, kind: ParseErrorKind::UnclosedComment }),
        None => Ok(out),
    }
}

fn parse_line(raw: &str, line: usize, config: &ParserConfig) -> Result<ParsedLine, ParseError> {
    let mut cur = Cursor { chars: strip_comments(raw, line)?, pos: 0, line };
    cur.skip_ws();

    let mut block_number = None;
    if cur.peek() == Some('N') && cur.chars.get(cur.pos + 1).is_some_and(|c| c.is_ascii_digit()) {
        cur.bump();
        let column = cur.column();
        let digits = cur.digits();
        let number =
            digits.parse().map_err(|_| cur.error(column, ParseErrorKind::MalformedNumber(digits)))?;
        block_number = Some(number);
        cur.skip_ws();
    }

    let instructions = match cur.peek() {
        None => Vec::new(),
        Some(_) => match parse_statement(&mut cur)? {
            Some(statement) => vec![statement],
            None => parse_block(&mut cur, config)?,
        },
    };
    Ok(ParsedLine { block_number, instructions })
}

fn parse_target(text: &str) -> Option<Target> {
    let text = text.trim();
    let digits = text.strip_prefix('N').unwrap_or(text);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return digits.parse().ok().map(Target::Block);
    }
    is_identifier(text).then(|| Target::Label(text.to_string()))
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Finds the `]` matching the `[` at `open`.
fn matching_bracket(text: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in text.iter().enumerate().skip(open) {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Flow statements own their whole line. Returns `None` for an ordinary block.
fn parse_statement(cur: &mut Cursor) -> Result<Option<InstructionKind>, ParseError> {
    let column = cur.column();
    let rest = cur.rest();
    let invalid = |cur: &Cursor| cur.error(column, ParseErrorKind::InvalidStatement(rest.clone()));

    if let Some(name) = rest.strip_prefix(':') {
        let name = name.trim();
        if !is_identifier(name) {
            return Err(invalid(cur));
        }
        return Ok(Some(InstructionKind::Label(name.to_string())));
    }
    if let Some(target) = rest.strip_prefix("GOTO") {
        let target = parse_target(target).ok_or_else(|| invalid(cur))?;
        return Ok(Some(InstructionKind::Goto(target)));
    }
    if let Some(target) = rest.strip_prefix("GOSUB") {
        let target = parse_target(target).ok_or_else(|| invalid(cur))?;
        return Ok(Some(InstructionKind::Gosub(target)));
    }
    if rest == "RETURN" {
        return Ok(Some(InstructionKind::Return));
    }
    if let Some(after_if) = rest.strip_prefix("IF") {
        let chars: Vec<char> = after_if.trim_start().chars().collect();
        if chars.first() != Some(&'[') {
            return Err(invalid(cur));
        }
        let unclosed = || cur.error(column, ExprError::Unclosed.into());
        let close = matching_bracket(&chars, 0).ok_or_else(unclosed)?;
        let inner: String = chars[1..close].iter().collect();
        let condition = parse_expr(&inner).map_err(|e| cur.error(column, e.into()))?;
        let tail: String = chars[close + 1..].iter().collect();
        let target = tail
            .trim()
            .strip_prefix("GOTO")
            .and_then(parse_target)
            .ok_or_else(|| invalid(cur))?;
        return Ok(Some(InstructionKind::IfGoto { condition, target }));
    }
    if cur.peek() == Some('#') {
        cur.bump();
        let digits = cur.digits();
        let malformed = || ParseErrorKind::MalformedNumber(format!("#{digits}"));
        let var = digits.parse().map_err(|_| cur.error(column, malformed()))?;
        cur.skip_ws();
        if cur.bump() != Some('=') {
            return Err(invalid(cur));
        }
        let value = parse_expr(&cur.rest()).map_err(|e| cur.error(column, e.into()))?;
        return Ok(Some(InstructionKind::Assign { var, value }));
    }
    if let Some(number) = rest.strip_prefix('O') {
        let number = number.trim();
        return match number.parse() {
            Ok(n) if number.chars().all(|c| c.is_ascii_digit()) => {
                Ok(Some(InstructionKind::SubprogramStart(n)))
            }
            _ => Err(invalid(cur)),
        };
    }
    Ok(None)
}

struct Word {
    letter: char,
    value: Expr,
    column: usize,
}

fn read_value(cur: &mut Cursor, letter: char) -> Result<Expr, ParseError> {
    cur.skip_ws();
    let column = cur.column();
    match cur.peek() {
        Some('[') => {
            let close = matching_bracket(&cur.chars, cur.pos)
                .ok_or_else(|| cur.error(column, ExprError::Unclosed.into()))?;
            let inner: String = cur.chars[cur.pos + 1..close].iter().collect();
            cur.pos = close + 1;
            parse_expr(&inner).map_err(|e| cur.error(column, e.into()))
        }
        Some('#') => {
            cur.bump();
            let digits = cur.digits();
            let malformed = || ParseErrorKind::MalformedNumber(format!("#{digits}"));
            digits.parse().map(Expr::Var).map_err(|_| cur.error(column, malformed()))
        }
        Some('-') if matches!(cur.chars.get(cur.pos + 1), Some('#') | Some('[')) => {
            cur.bump();
            Ok(Expr::Neg(Box::new(read_value(cur, letter)?)))
        }
        Some(c) if c.is_ascii_digit() || matches!(c, '.' | '+' | '-') => {
            let mut text = String::new();
            text.push(c);
            cur.bump();
            while let Some(d) = cur.peek().filter(|d| d.is_ascii_digit() || *d == '.') {
                text.push(d);
                cur.bump();
            }
            let malformed = || ParseErrorKind::MalformedNumber(format!("{letter}{text}"));
            text.parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(Expr::Number)
                .ok_or_else(|| cur.error(column, malformed()))
        }
        _ => Err(cur.error(column, ParseErrorKind::MalformedNumber(letter.to_string()))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum GAction {
    Motion(MotionMode),
    Plane(Plane),
    Distance(DistanceMode),
    FeedMode(FeedMode),
    Units(Units),
    CutterComp(Option<CompSide>),
    ToolLength(ToolLengthMode),
    Coordinate(Option<CoordinateSystemId>),
    Path(PathMode),
    Retract(RetractMode),
    Dwell,
    Data,
    Home,
    LocalOffset,
    PositionShift,
    ClearShift,
    Machine,
    MacroCall,
}

impl GAction {
    /// G code scaled by ten: 591 is G59.1.
    fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => GAction::Motion(MotionMode::Rapid),
            10 => GAction::Motion(MotionMode::Linear),
            20 => GAction::Motion(MotionMode::ArcCw),
            30 => GAction::Motion(MotionMode::ArcCcw),
            40 => GAction::Dwell,
            100 => GAction::Data,
            170 => GAction::Plane(Plane::Xy),
            180 => GAction::Plane(Plane::Zx),
            190 => GAction::Plane(Plane::Yz),
            200 => GAction::Units(Units::Inches),
            210 => GAction::Units(Units::Millimetres),
            280 => GAction::Home,
            520 => GAction::LocalOffset,
            400 => GAction::CutterComp(None),
            410 => GAction::CutterComp(Some(CompSide::Left)),
            420 => GAction::CutterComp(Some(CompSide::Right)),
            430 => GAction::ToolLength(ToolLengthMode::Positive),
            440 => GAction::ToolLength(ToolLengthMode::Negative),
            490 => GAction::ToolLength(ToolLengthMode::Cancelled),
            530 => GAction::Machine,
            541 => GAction::Coordinate(None),
            610 => GAction::Path(PathMode::ExactStop),
            640 => GAction::Path(PathMode::Continuous),
            650 => GAction::MacroCall,
            800 => GAction::Motion(MotionMode::None),
            900 => GAction::Distance(DistanceMode::Absolute),
            910 => GAction::Distance(DistanceMode::Incremental),
            920 => GAction::PositionShift,
            921 => GAction::ClearShift,
            940 => GAction::FeedMode(FeedMode::PerMinute),
            950 => GAction::FeedMode(FeedMode::PerRevolution),
            980 => GAction::Retract(RetractMode::InitialLevel),
            990 => GAction::Retract(RetractMode::RPlane),
            c => match (CoordinateSystemId::from_gcode(c), CycleKind::from_gcode(c)) {
                (Some(id), _) => GAction::Coordinate(Some(id)),
                (_, Some(kind)) => GAction::Motion(MotionMode::Cycle(kind)),
                _ => return None,
            },
        })
    }

    fn group(&self) -> &'static str {
        match self {
            GAction::Motion(_) => "motion",
            GAction::Plane(_) => "plane",
            GAction::Distance(_) => "distance",
            GAction::FeedMode(_) => "feed mode",
            GAction::Units(_) => "units",
            GAction::CutterComp(_) => "cutter compensation",
            GAction::ToolLength(_) => "tool length",
            GAction::Coordinate(_) => "coordinate system",
            GAction::Path(_) => "path control",
            GAction::Retract(_) => "cycle return",
            GAction::Dwell
            | GAction::Data
            | GAction::Home
            | GAction::LocalOffset
            | GAction::PositionShift
            | GAction::ClearShift
            | GAction::Machine
            | GAction::MacroCall => "non-modal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum MAction {
    Stop(StopKind),
    ToolChange,
    Spindle(SpindleDirection),
    Coolant(CoolantMode),
    CallSubprogram,
    Return,
    FeedOverride,
}

impl MAction {
    fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => MAction::Stop(StopKind::Pause),
            1 => MAction::Stop(StopKind::OptionalPause),
            2 => MAction::Stop(StopKind::End),
            30 => MAction::Stop(StopKind::EndRewind),
            3 => MAction::Spindle(SpindleDirection::Clockwise),
            4 => MAction::Spindle(SpindleDirection::CounterClockwise),
            5 => MAction::Spindle(SpindleDirection::Stopped),
            6 => MAction::ToolChange,
            7 => MAction::Coolant(CoolantMode::Mist),
            8 => MAction::Coolant(CoolantMode::Flood),
            9 => MAction::Coolant(CoolantMode::Off),
            98 => MAction::CallSubprogram,
            99 => MAction::Return,
            220 => MAction::FeedOverride,
            _ => return None,
        })
    }

    fn group(&self) -> &'static str {
        match self {
            MAction::Stop(_) => "stop",
            MAction::ToolChange => "tool change",
            MAction::Spindle(_) => "spindle",
            MAction::Coolant(_) => "coolant",
            MAction::CallSubprogram | MAction::Return => "subprogram",
            MAction::FeedOverride => "override",
        }
    }
}

fn g_name(code: i32) -> String {
    if code % 10 == 0 { format!("G{}", code / 10) } else { format!("G{}.{}", code / 10, code % 10) }
}

const PARAMETER_LETTERS: &str = "FSTDHPQRLXYZAIJK";

/// Collected words of one block, consumed as instructions claim them.
struct Block<'c> {
    cur: &'c Cursor,
    g: Vec<(i32, GAction, usize)>,
    m: Vec<(i32, MAction, usize)>,
    params: BTreeMap<char, (Expr, usize)>,
}

impl Block<'_> {
    fn take(&mut self, letter: char) -> Option<Expr> {
        self.params.remove(&letter).map(|(e, _)| e)
    }

    fn has(&self, letter: char) -> bool {
        self.params.contains_key(&letter)
    }

    fn require(&mut self, letter: char, code: String, column: usize) -> Result<Expr, ParseError> {
        let missing = ParseErrorKind::MissingWord { code, letter };
        self.take(letter).ok_or_else(|| self.cur.error(column, missing))
    }

    fn axes(&mut self) -> AxisWords {
        AxisWords { x: self.take('X'), y: self.take('Y'), z: self.take('Z'), a: self.take('A') }
    }

    fn action(&self, pred: impl Fn(&GAction) -> bool) -> Option<(i32, GAction, usize)> {
        self.g.iter().copied().find(|(_, a, _)| pred(a))
    }

    fn m_action(&self, pred: impl Fn(&MAction) -> bool) -> Option<(i32, MAction, usize)> {
        self.m.iter().copied().find(|(_, a, _)| pred(a))
    }
}

fn check_tool(
    cur: &Cursor,
    expr: &Expr,
    column: usize,
    config: &ParserConfig,
) -> Result<(), ParseError> {
    if let Some(v) = expr.as_literal() {
        let capacity = config.tool_capacity;
        if v.fract() != 0.0 || v < 1.0 || v > capacity as f64 {
            return Err(cur.error(column, ParseErrorKind::ToolOutOfRange { tool: v, capacity }));
        }
    }
    Ok(())
}

fn parse_block(
    cur: &mut Cursor,
    config: &ParserConfig,
) -> Result<Vec<InstructionKind>, ParseError> {
    let mut words = Vec::new();
    loop {
        cur.skip_ws();
        let column = cur.column();
        let Some(letter) = cur.bump() else { break };
        if !letter.is_ascii_alphabetic() {
            return Err(cur.error(column, ParseErrorKind::UnexpectedCharacter(letter)));
        }
        let value = read_value(cur, letter)?;
        words.push(Word { letter, value, column });
    }

    let is_macro_call = words.iter().any(|w| w.letter == 'G' && w.value.as_literal() == Some(65.0));
    let mut block = Block { cur, g: Vec::new(), m: Vec::new(), params: BTreeMap::new() };

    for word in words {
        let is_code = word.letter == 'G' || (word.letter == 'M' && !is_macro_call);
        if is_code {
            let non_literal =
                || cur.error(word.column, ParseErrorKind::NonLiteralCode(word.letter));
            let v = word.value.as_literal().ok_or_else(non_literal)?;
            let scaled = (v * 10.0).round();
            let unknown = || {
                let code = format!("{}{}", word.letter, v);
                cur.error(word.column, ParseErrorKind::UnknownCode(code))
            };
            if (v * 10.0 - scaled).abs() > 1e-6 || v < 0.0 {
                return Err(unknown());
            }
            if word.letter == 'G' {
                let code = scaled as i32;
                let action = GAction::from_code(code).ok_or_else(unknown)?;
                let same_group = block.g.iter().find(|(_, a, _)| a.group() == action.group());
                if let Some((other, _, _)) = same_group {
                    return Err(cur.error(word.column, ParseErrorKind::ModalConflict {
                        group: action.group(),
                        first: g_name(*other),
                        second: g_name(code),
                    }));
                }
                block.g.push((code, action, word.column));
            } else {
                if v.fract() != 0.0 {
                    return Err(unknown());
                }
                let code = v as i32;
                let action = MAction::from_code(code).ok_or_else(unknown)?;
                let same_group = block.m.iter().find(|(_, a, _)| a.group() == action.group());
                if let Some((other, _, _)) = same_group {
                    return Err(cur.error(word.column, ParseErrorKind::ModalConflict {
                        group: action.group(),
                        first: format!("M{}", other),
                        second: format!("M{}", code),
                    }));
                }
                block.m.push((code, action, word.column));
            }
            continue;
        }
        if !is_macro_call && !PARAMETER_LETTERS.contains(word.letter) {
            return Err(cur.error(word.column, ParseErrorKind::UnsupportedWord(word.letter)));
        }
        if block.params.contains_key(&word.letter) {
            return Err(cur.error(word.column, ParseErrorKind::DuplicateWord(word.letter)));
        }
        block.params.insert(word.letter, (word.value, word.column));
    }

    if is_macro_call {
        macro_call(block)
    } else {
        machine_block(block, config)
    }
}

/// G65 P<n> with letter arguments bound to local variables.
fn macro_call(mut block: Block<'_>) -> Result<Vec<InstructionKind>, ParseError> {
    let cur = block.cur;
    let (_, _, column) = block.g[0];
    if let Some((code, _, col)) = block.g.iter().find(|(c, _, _)| *c != 650) {
        let reason = format!("{} cannot share a block with G65", g_name(*code));
        return Err(cur.error(*col, ParseErrorKind::InvalidStatement(reason)));
    }
    let program = block.require('P', "G65".into(), column)?;
    let mut args = Vec::new();
    for (letter, (value, col)) in std::mem::take(&mut block.params) {
        let unused = || cur.error(col, ParseErrorKind::UnusedWord(letter));
        let var = macro_argument_variable(letter).ok_or_else(unused)?;
        args.push((var, value));
    }
    Ok(vec![InstructionKind::CallMacro { program, args }])
}

/// Groups a block's words into instructions in execution order.
fn machine_block(
    mut block: Block<'_>,
    config: &ParserConfig,
) -> Result<Vec<InstructionKind>, ParseError> {
    let cur = block.cur;
    let mut out = Vec::new();

    let feed_mode = block.action(|a| matches!(a, GAction::FeedMode(_)));
    if let Some((_, GAction::FeedMode(mode), _)) = feed_mode {
        out.push(InstructionKind::SetFeedMode(mode));
    }
    if let Some(f) = block.take('F') {
        out.push(InstructionKind::SetFeedRate(f));
    }
    let override_code = block.m_action(|a| *a == MAction::FeedOverride);
    if override_code.is_none() {
        if let Some(s) = block.take('S') {
            out.push(InstructionKind::SetSpindleSpeed(s));
        }
    }
    if let Some((t, col)) = block.params.remove(&'T') {
        check_tool(cur, &t, col, config)?;
        out.push(InstructionKind::SelectTool(t));
    }
    if block.m_action(|a| *a == MAction::ToolChange).is_some() {
        out.push(InstructionKind::ChangeTool);
    }
    let spindle = block.m_action(|a| matches!(a, MAction::Spindle(_)));
    if let Some((_, MAction::Spindle(dir), _)) = spindle {
        out.push(InstructionKind::Spindle(dir));
    }
    let coolant = block.m_action(|a| matches!(a, MAction::Coolant(_)));
    if let Some((_, MAction::Coolant(mode), _)) = coolant {
        out.push(InstructionKind::Coolant(mode));
    }
    if let Some((_, _, col)) = override_code {
        out.push(InstructionKind::SetFeedOverride(block.require('S', "M220".into(), col)?));
    }
    if let Some((_, _, col)) = block.action(|a| *a == GAction::Dwell) {
        out.push(InstructionKind::Dwell(block.require('P', "G4".into(), col)?));
    }
    if let Some((_, GAction::Plane(plane), _)) = block.action(|a| matches!(a, GAction::Plane(_))) {
        out.push(InstructionKind::SetPlane(plane));
    }
    if let Some((_, GAction::Units(units), _)) = block.action(|a| matches!(a, GAction::Units(_))) {
        out.push(InstructionKind::SetUnits(units));
    }
    let cutter_comp = block.action(|a| matches!(a, GAction::CutterComp(_)));
    if let Some((_, GAction::CutterComp(side), _)) = cutter_comp {
        let tool = match side {
            Some(_) => checked_tool(cur, block.params.remove(&'D'), config)?,
            None => None,
        };
        out.push(InstructionKind::SetCutterComp { side, tool });
    }
    let tool_length = block.action(|a| matches!(a, GAction::ToolLength(_)));
    if let Some((_, GAction::ToolLength(mode), _)) = tool_length {
        let tool = match mode {
            ToolLengthMode::Cancelled => None,
            _ => checked_tool(cur, block.params.remove(&'H'), config)?,
        };
        out.push(InstructionKind::SetToolLength { mode, tool });
    }
    let coordinate = block.action(|a| matches!(a, GAction::Coordinate(_)));
    if let Some((_, GAction::Coordinate(id), col)) = coordinate {
        let id = match id {
            Some(id) => id,
            None => {
                let p = block.require('P', "G54.1".into(), col)?;
                match literal_u32(&p) {
                    Some(n) if n >= 1 && n <= config.extended_systems as u32 => {
                        CoordinateSystemId::Extended(n as u16)
                    }
                    Some(n) => {
                        let name = format!("G54.1 P{n}");
                        let kind = ParseErrorKind::CoordinateSystemOutOfRange(name);
                        return Err(cur.error(col, kind));
                    }
                    None => return Err(cur.error(col, ParseErrorKind::NonLiteralCode('P'))),
                }
            }
        };
        out.push(InstructionKind::SelectCoordinateSystem(id));
    }
    if let Some((_, GAction::Path(mode), _)) = block.action(|a| matches!(a, GAction::Path(_))) {
        out.push(InstructionKind::SetPathMode(mode));
    }
    let distance = block.action(|a| matches!(a, GAction::Distance(_)));
    if let Some((_, GAction::Distance(mode), _)) = distance {
        out.push(InstructionKind::SetDistanceMode(mode));
    }
    let retract = block.action(|a| matches!(a, GAction::Retract(_)));
    if let Some((_, GAction::Retract(mode), _)) = retract {
        out.push(InstructionKind::SetRetractMode(mode));
    }
    if let Some((_, _, col)) = block.action(|a| *a == GAction::Data) {
        out.push(tool_or_offset_data(&mut block, col, config)?);
    }
    if block.action(|a| *a == GAction::Home).is_some() {
        out.push(InstructionKind::Home { via: block.axes() });
    }
    if block.action(|a| *a == GAction::LocalOffset).is_some() {
        out.push(InstructionKind::SetLocalOffset(block.axes()));
    }
    if let Some((_, _, col)) = block.action(|a| *a == GAction::PositionShift) {
        let axes = block.axes();
        if axes.is_empty() {
            let missing = ParseErrorKind::MissingWord { code: "G92".into(), letter: 'X' };
            return Err(cur.error(col, missing));
        }
        out.push(InstructionKind::SetPositionShift(axes));
    }
    if block.action(|a| *a == GAction::ClearShift).is_some() {
        out.push(InstructionKind::ClearPositionShift);
    }
    if let Some((_, _, col)) = block.m_action(|a| *a == MAction::CallSubprogram) {
        let program = block.require('P', "M98".into(), col)?;
        let repeat = block.take('L');
        out.push(InstructionKind::CallSubprogram { program, repeat });
    }

    let explicit_motion = block.action(|a| matches!(a, GAction::Motion(_)));
    if let Some((_, GAction::Motion(mode), _)) = explicit_motion {
        out.push(InstructionKind::SetMotionMode(mode));
    }
    let explicit_mode = explicit_motion.and_then(|(_, a, _)| match a {
        GAction::Motion(m) => Some(m),
        _ => None,
    });
    let has_axes = ['X', 'Y', 'Z', 'A'].iter().any(|l| block.has(*l));
    let has_centre = ['I', 'J', 'K'].iter().any(|l| block.has(*l));
    if has_axes || (explicit_mode.is_some_and(|m| m.is_arc()) && has_centre) {
        let column = explicit_motion.map_or(1, |(_, _, c)| c);
        if let Some(mode) = explicit_mode {
            validate_explicit_move(&block, mode, column)?;
        }
        let machine_coords = block.action(|a| *a == GAction::Machine).is_some();
        out.push(InstructionKind::Move(MoveWords {
            axes: block.axes(),
            i: block.take('I'),
            j: block.take('J'),
            k: block.take('K'),
            r: block.take('R'),
            q: block.take('Q'),
            p: block.take('P'),
            machine_coords,
        }));
    } else if let Some((_, _, col)) = block.action(|a| *a == GAction::Machine) {
        return Err(cur.error(col, ParseErrorKind::MissingWord { code: "G53".into(), letter: 'X' }));
    }

    if block.m_action(|a| *a == MAction::Return).is_some() {
        out.push(InstructionKind::ReturnFromSubprogram);
    }
    if let Some((_, MAction::Stop(kind), _)) = block.m_action(|a| matches!(a, MAction::Stop(_))) {
        out.push(InstructionKind::Stop(kind));
    }

    if let Some((letter, (_, col))) = block.params.iter().next() {
        return Err(cur.error(*col, ParseErrorKind::UnusedWord(*letter)));
    }
    Ok(out)
}

fn validate_explicit_move(
    block: &Block<'_>,
    mode: MotionMode,
    column: usize,
) -> Result<(), ParseError> {
    let cur = block.cur;
    match mode {
        MotionMode::ArcCw | MotionMode::ArcCcw => {
            let centre = ['I', 'J', 'K'].iter().any(|l| block.has(*l));
            match (centre, block.has('R')) {
                (false, false) => Err(cur.error(column, ParseErrorKind::MissingArcParameters)),
                (true, true) => Err(cur.error(column, ParseErrorKind::ConflictingArcParameters)),
                _ => Ok(()),
            }
        }
        MotionMode::Cycle(kind) => {
            let mut required = vec!['Z', 'R'];
            if kind.pecks() {
                required.push('Q');
            }
            match required.into_iter().find(|l| !block.has(*l)) {
                Some(letter) => {
                    let code = kind.code().into();
                    Err(cur.error(column, ParseErrorKind::MissingWord { code, letter }))
                }
                None => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

/// The tool word as given, after checking a literal number against the table.
fn checked_tool(
    cur: &Cursor,
    word: Option<(Expr, usize)>,
    config: &ParserConfig,
) -> Result<Option<Expr>, ParseError> {
    let Some((tool, column)) = word else {
        return Ok(None);
    };
    check_tool(cur, &tool, column, config)?;
    Ok(Some(tool))
}

/// G10 L1 (tool table) and G10 L2/L20 (work offsets).
fn tool_or_offset_data(
    block: &mut Block<'_>,
    column: usize,
    config: &ParserConfig,
) -> Result<InstructionKind, ParseError> {
    let cur = block.cur;
    let l = block.require('L', "G10".into(), column)?;
    let p_column = block.params.get(&'P').map_or(column, |(_, c)| *c);
    let p = block.require('P', "G10".into(), column)?;
    match l.as_literal() {
        Some(l) if l == 1.0 => {
            check_tool(cur, &p, p_column, config)?;
            let (length, radius) = (block.take('Z'), block.take('R'));
            Ok(InstructionKind::SetToolData { tool: p, length, radius })
        }
        Some(l) if l == 2.0 || l == 20.0 => {
            let extended = l == 20.0;
            let max = if extended {
                config.extended_systems as u32
            } else {
                CoordinateSystemId::STANDARD_COUNT as u32
            };
            if let Some(n) = literal_u32(&p) {
                if n < 1 || n > max {
                    let name = if extended {
                        format!("G54.1 P{n}")
                    } else {
                        format!("G10 L2 P{n}")
                    };
                    let kind = ParseErrorKind::CoordinateSystemOutOfRange(name);
                    return Err(cur.error(p_column, kind));
                }
            }
            Ok(InstructionKind::SetWorkOffset { extended, system: p, axes: block.axes() })
        }
        Some(l) => Err(cur.error(column, ParseErrorKind::UnknownCode(format!("G10 L{l}")))),
        None => Err(cur.error(column, ParseErrorKind::NonLiteralCode('L'))),
    }
}
