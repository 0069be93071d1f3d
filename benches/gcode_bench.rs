// Benchmark for program parsing and interpretation
// Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use modax::config::InterpreterConfig;
use modax::gcode::{parse_program, Interpreter, ModalState, ParserConfig};
use modax::tooling::ToolingManager;
use std::sync::Arc;

fn straight_lines(count: usize) -> String {
    let mut gcode = String::from("G21 G90 F1500\n");
    for i in 0..count {
        gcode.push_str(&format!("G1 X{} Y{}\n", i % 300, i % 200));
    }
    gcode.push_str("M30\n");
    gcode
}

fn bench_parser(c: &mut Criterion) {
    let gcode = straight_lines(10_000);
    c.bench_function("parse 10k G1 lines", |b| {
        b.iter(|| {
            let program = parse_program(&gcode, &ParserConfig::default()).unwrap();
            assert_eq!(program.motion_count(), 10_000);
        });
    });
}

fn bench_interpreter(c: &mut Criterion) {
    let config = ParserConfig::default();
    let program = Arc::new(parse_program(&straight_lines(10_000), &config).unwrap());
    c.bench_function("interpret 10k G1 lines", |b| {
        b.iter(|| {
            let limits = InterpreterConfig::default();
            let mut interpreter = Interpreter::new(Arc::clone(&program), limits, (0.0, 150.0));
            let mut modal = ModalState::default();
            let mut tooling = ToolingManager::new(24, 48);
            let mut steps = 0;
            while let Some(_step) = interpreter.next_step(&mut modal, &mut tooling).unwrap() {
                steps += 1;
            }
            assert_eq!(steps, 10_001);
        });
    });

    // a loop with variable arithmetic, 5000 passes
    let looped = "#100 = 0\n:TOP\n#100 = [#100 + 1]\nG1 X[#100 MOD 50] F900\n\
                  IF [#100 LT 5000] GOTO TOP\nM30";
    let program = Arc::new(parse_program(looped, &config).unwrap());
    c.bench_function("interpret 5k loop passes", |b| {
        b.iter(|| {
            let limits = InterpreterConfig::default();
            let mut interpreter = Interpreter::new(Arc::clone(&program), limits, (0.0, 150.0));
            let mut modal = ModalState::default();
            let mut tooling = ToolingManager::new(24, 48);
            while interpreter.next_step(&mut modal, &mut tooling).unwrap().is_some() {}
        });
    });
}

criterion_group!(benches, bench_parser, bench_interpreter);
criterion_main!(benches);
