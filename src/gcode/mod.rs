// src/gcode/mod.rs - Program language: parsing, macros and interpretation
pub mod expr;
pub mod interpreter;
pub mod macros;
pub mod modal;
pub mod parser;
pub mod program;

pub use interpreter::{Action, Interpreter, InterpreterError, InterpreterErrorKind, Step};
pub use macros::{MacroError, MacroLibrary};
pub use modal::ModalState;
pub use parser::{parse_program, parse_program_with_library, parse_stream, ParseError, ParserConfig};
pub use program::Program;
