// src/gcode/macros.rs
use crate::gcode::parser::{parse_program_with_library, ParseError, ParserConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared library of O-number subprograms, callable from any submitted program with M98 or G65.
///
/// Bodies are stored wrapped as `O<n> ... M99` and validated when defined, so a later
/// submission only links text that already parsed cleanly. A subprogram defined inside a
/// submitted program shadows the library entry with the same number.
///
/// # Example
/// ```rust
/// use modax::gcode::macros::MacroLibrary;
/// use modax::gcode::parser::ParserConfig;
/// let rt = tokio::runtime::Runtime::new().unwrap();
/// rt.block_on(async {
///     let library = MacroLibrary::new(ParserConfig::default());
///     library.define(9000, "G91 G0 Z5\nG90").await.unwrap();
///     assert_eq!(library.list().await, vec![9000]);
/// });
/// ```
#[derive(Debug, Clone)]
pub struct MacroLibrary {
    subprograms: Arc<RwLock<BTreeMap<u32, String>>>,
    config: ParserConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum MacroError {
    #[error("subprogram O{0} not found")]
    NotFound(u32),
    #[error("subprogram O{number} does not parse: {}", first_error(.errors))]
    Invalid { number: u32, errors: Vec<ParseError> },
}

impl MacroLibrary {
    pub fn new(config: ParserConfig) -> Self {
        Self { subprograms: Arc::new(RwLock::new(BTreeMap::new())), config }
    }

    /// Define or replace subprogram `number`. `body` excludes the `O` line and the closing M99.
    pub async fn define(&self, number: u32, body: &str) -> Result<(), MacroError> {
        let text = format!("O{}\n{}\nM99", number, body.trim_end());
        let library = self.snapshot().await;
        let mut externals = library.clone();
        externals.remove(&number);
        if let Err(errors) = parse_with(&text, &self.config, &externals) {
            return Err(MacroError::Invalid { number, errors });
        }
        let mut subprograms = self.subprograms.write().await;
        subprograms.insert(number, text);
        tracing::info!("Defined subprogram: O{}", number);
        Ok(())
    }

    /// Full stored text of a subprogram.
    pub async fn get(&self, number: u32) -> Result<String, MacroError> {
        let subprograms = self.subprograms.read().await;
        subprograms.get(&number).cloned().ok_or(MacroError::NotFound(number))
    }

    /// List all defined subprogram numbers
    pub async fn list(&self) -> Vec<u32> {
        let subprograms = self.subprograms.read().await;
        subprograms.keys().copied().collect()
    }

    pub async fn delete(&self, number: u32) -> Result<(), MacroError> {
        let mut subprograms = self.subprograms.write().await;
        if subprograms.remove(&number).is_some() {
            tracing::info!("Deleted subprogram: O{}", number);
            Ok(())
        } else {
            Err(MacroError::NotFound(number))
        }
    }

    /// Copy of the library used to link one submission.
    pub async fn snapshot(&self) -> BTreeMap<u32, String> {
        self.subprograms.read().await.clone()
    }
}

fn first_error(errors: &[ParseError]) -> String {
    errors.first().map(|e| e.to_string()).unwrap_or_default()
}

fn parse_with(
    text: &str,
    config: &ParserConfig,
    library: &BTreeMap<u32, String>,
) -> Result<(), Vec<ParseError>> {
    parse_program_with_library(text, config, library).map(|_| ())
}

// All test code lives in tests/gcode_macros.rs
