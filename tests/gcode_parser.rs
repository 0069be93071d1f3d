// Tests for the program parser: instruction shapes, static validation and whole-program rejection

use modax::gcode::parser::ParseErrorKind;
use modax::gcode::program::{InstructionKind, Target};
use modax::gcode::{parse_program, parse_stream, ParserConfig};
use std::collections::BTreeMap;

fn parse(src: &str) -> Result<modax::gcode::Program, Vec<modax::gcode::ParseError>> {
    parse_program(src, &ParserConfig::default())
}

fn kinds(src: &str) -> Vec<InstructionKind> {
    parse(src).unwrap().instructions.into_iter().map(|i| i.kind).collect()
}

#[test]
fn test_block_is_split_in_execution_order() {
    let kinds = kinds("N10 G1 X10 Y5 F200 S1200 M3");
    assert!(matches!(kinds[0], InstructionKind::SetFeedRate(_)));
    assert!(matches!(kinds[1], InstructionKind::SetSpindleSpeed(_)));
    assert!(matches!(kinds[2], InstructionKind::Spindle(_)));
    assert!(matches!(kinds[3], InstructionKind::SetMotionMode(_)));
    assert!(matches!(kinds[4], InstructionKind::Move(_)));
    assert_eq!(kinds.len(), 5);
}

#[test]
fn test_case_and_comments_are_ignored() {
    let program = parse("g0 x1 (rapid over) y2 ; trailing\n(only a comment)\n").unwrap();
    assert_eq!(program.instructions.len(), 2);
    assert_eq!(program.source_lines, 2);
    assert_eq!(program.motion_count(), 1);
}

#[test]
fn test_block_numbers_resolve_as_targets() {
    let program = parse("N5 G0 X0\nN10 G0 X1\nGOTO N10").unwrap();
    assert_eq!(program.resolve(&Target::Block(10)), Some(2));
}

#[test]
fn test_unknown_code_rejects_whole_program_with_line() {
    let errors = parse("G0 X0\nG1 X1 F100\nG7 X3\nG1 X4").unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line, 3);
    assert_eq!(errors[0].kind, ParseErrorKind::UnknownCode("G7".into()));
}

#[test]
fn test_every_error_is_collected() {
    let errors = parse("G1 X1.2.3\nM77\nG0 X0\nGOTO NOWHERE").unwrap_err();
    let lines: Vec<usize> = errors.iter().map(|e| e.line).collect();
    assert_eq!(lines, vec![1, 2, 4]);
    assert!(matches!(errors[2].kind, ParseErrorKind::UndefinedTarget(_)));
}

#[test]
fn test_modal_group_conflict() {
    let errors = parse("G0 G1 X10").unwrap_err();
    assert!(matches!(errors[0].kind, ParseErrorKind::ModalConflict { group: "motion", .. }));
    let errors = parse("M3 M4").unwrap_err();
    assert!(matches!(errors[0].kind, ParseErrorKind::ModalConflict { group: "spindle", .. }));
    assert!(parse("G90 G91").is_err());
    // different groups share a block freely
    assert!(parse("G17 G21 G90 G94 G54 G0 X0").is_ok());
}

#[test]
fn test_arc_words_are_checked() {
    let missing = parse("G2 X10 Y0").unwrap_err();
    assert_eq!(missing[0].kind, ParseErrorKind::MissingArcParameters);
    let both = parse("G3 X10 Y0 I5 R5").unwrap_err();
    assert_eq!(both[0].kind, ParseErrorKind::ConflictingArcParameters);
    assert!(parse("G2 X10 Y0 I5 J0 F100").is_ok());
}

#[test]
fn test_tool_and_coordinate_ranges() {
    let errors = parse("T25 M6").unwrap_err();
    assert!(matches!(errors[0].kind, ParseErrorKind::ToolOutOfRange { capacity: 24, .. }));
    assert!(parse("T24 M6").is_ok());
    let errors = parse("G54.1 P49").unwrap_err();
    assert!(matches!(errors[0].kind, ParseErrorKind::CoordinateSystemOutOfRange(_)));
    assert!(parse("G54.1 P48").is_ok());
    let small = ParserConfig { tool_capacity: 4, extended_systems: 2 };
    assert!(parse_program("T5", &small).is_err());
}

#[test]
fn test_unused_and_duplicate_words() {
    assert_eq!(parse("G4 P1 Q2").unwrap_err()[0].kind, ParseErrorKind::UnusedWord('Q'));
    assert_eq!(parse("G0 X1 X2").unwrap_err()[0].kind, ParseErrorKind::DuplicateWord('X'));
    assert_eq!(parse("G0 B1").unwrap_err()[0].kind, ParseErrorKind::UnsupportedWord('B'));
}

#[test]
fn test_unclosed_comment_column() {
    let errors = parse("G0 X1\nG1 (never closed X2").unwrap_err();
    assert_eq!((errors[0].line, errors[0].column), (2, 4));
}

#[test]
fn test_flow_statements() {
    let kinds = kinds(":TOP\n#100 = [#100 + 1]\nIF [#100 LT 3] GOTO TOP\nGOSUB TOP\nRETURN");
    assert!(matches!(&kinds[0], InstructionKind::Label(name) if name == "TOP"));
    assert!(matches!(kinds[1], InstructionKind::Assign { var: 100, .. }));
    let jump = &kinds[2];
    assert!(matches!(jump, InstructionKind::IfGoto { target: Target::Label(l), .. } if l == "TOP"));
    assert!(matches!(kinds[3], InstructionKind::Gosub(_)));
    assert!(matches!(kinds[4], InstructionKind::Return));
}

#[test]
fn test_subprogram_structure() {
    let program = parse("M98 P100 L2\nM30\nO100\nG91 G0 X1\nM99").unwrap();
    let sub = program.subprograms[&100];
    assert_eq!((sub.start, sub.end), (2, 6));

    let errors = parse("O200\nG0 X1").unwrap_err();
    assert_eq!(errors[0].kind, ParseErrorKind::UnterminatedSubprogram(200));
    let errors = parse("M98 P300").unwrap_err();
    assert_eq!(errors[0].kind, ParseErrorKind::UndefinedSubprogram(300));
    assert_eq!(parse("M99").unwrap_err()[0].kind, ParseErrorKind::ReturnOutsideSubprogram);
}

#[test]
fn test_macro_call_binds_letter_arguments() {
    let kinds = kinds("G65 P9000 A1 X2.5 Z-3\nM30\nO9000\nM99");
    let InstructionKind::CallMacro { args, .. } = &kinds[0] else {
        panic!("expected a macro call, got {:?}", kinds[0]);
    };
    let vars: Vec<u32> = args.iter().map(|(v, _)| *v).collect();
    assert_eq!(vars, vec![1, 24, 26]);
}

#[test]
fn test_canned_cycle_requires_words() {
    let errors = parse("G83 X1 Y1 Z-5 R1").unwrap_err();
    assert!(matches!(errors[0].kind, ParseErrorKind::MissingWord { letter: 'Q', .. }));
    assert!(parse("G99 G81 X1 Y1 Z-5 R1 F100\nX2\nG80").is_ok());
    let errors = parse("G73 X1 Y1 Z-5 R1").unwrap_err();
    assert_eq!(errors[0].kind, ParseErrorKind::MissingWord { code: "G73".into(), letter: 'Q' });
    assert!(parse("G84 X1 Y1 Z-5 R1 F1.25\nG85 X2 Z-8 R1").is_ok());
}

#[test]
fn test_overflowing_literal_is_malformed() {
    let digits = "9".repeat(400);
    let errors = parse(&format!("G0 X1\nG1 X{digits} F100")).unwrap_err();
    assert_eq!(errors[0].line, 2);
    assert!(matches!(errors[0].kind, ParseErrorKind::MalformedNumber(_)));
    // inside an expression too
    assert!(parse(&format!("G1 X[{digits} + 1] F100")).is_err());
}

#[test]
fn test_offset_shift_codes() {
    let kinds = kinds("G52 X10 Y5\nG52\nG92 X0 Y0\nG92.1");
    assert!(matches!(kinds[0], InstructionKind::SetLocalOffset(_)));
    assert!(matches!(&kinds[1], InstructionKind::SetLocalOffset(axes) if axes.is_empty()));
    assert!(matches!(kinds[2], InstructionKind::SetPositionShift(_)));
    assert!(matches!(kinds[3], InstructionKind::ClearPositionShift));
    let errors = parse("G92").unwrap_err();
    assert_eq!(errors[0].kind, ParseErrorKind::MissingWord { code: "G92".into(), letter: 'X' });
    // both are non-modal codes
    let errors = parse("G52 G92 X1").unwrap_err();
    assert!(matches!(errors[0].kind, ParseErrorKind::ModalConflict { .. }));
}

#[test]
fn test_tool_data_and_work_offsets() {
    let kinds = kinds("G10 L1 P3 Z42.5 R2\nG10 L2 P2 X100 Y50");
    assert!(matches!(kinds[0], InstructionKind::SetToolData { .. }));
    assert!(matches!(kinds[1], InstructionKind::SetWorkOffset { extended: false, .. }));
    assert!(parse("G10 L2 P10 X0").is_err());
    assert!(parse("G10 L7 P1").is_err());
}

#[tokio::test]
async fn test_parse_stream_matches_text() {
    let text = "G21 G90\nG0 X0 Y0\nG1 X10 F100\nM30\n";
    let library = BTreeMap::new();
    let streamed =
        parse_stream(text.as_bytes(), &ParserConfig::default(), &library).await.unwrap();
    let direct = parse(text).unwrap();
    assert_eq!(streamed.instructions, direct.instructions);
}
