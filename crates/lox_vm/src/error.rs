//! Compile-time and run-time error taxonomies.
//!
//! Kept as two separate `thiserror` enums (rather than one flat error
//! type) because callers need to distinguish `CompileError` from
//! `RuntimeError` to pick the right process exit code (§6): 65 vs 70.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("[line {line}] Error{at}: {message}")]
pub struct CompileError {
    pub line: u32,
    /// Rendered as `" at 'tok'"`, `" at end"`, or empty, matching the
    /// classic `error_at` format.
    pub at: String,
    pub message: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    /// `[line L] in <name|script>`, innermost frame first.
    pub trace: Vec<String>,
}

#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile(Vec<CompileError>),
    #[error("runtime error")]
    Runtime(RuntimeError),
}

/// The coarse three-way result the CLI and embedders switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretResult {
    Ok,
    CompileError,
    RuntimeError,
}

impl From<&InterpretError> for InterpretResult {
    fn from(e: &InterpretError) -> Self {
        match e {
            InterpretError::Compile(_) => InterpretResult::CompileError,
            InterpretError::Runtime(_) => InterpretResult::RuntimeError,
        }
    }
}
