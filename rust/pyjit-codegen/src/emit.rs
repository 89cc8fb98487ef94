//! Object file emission.
//!
//! Converts a finished Cranelift object module into a native object file (.o).

use std::path::Path;

use cranelift_object::ObjectModule;
use pyjit_bytecode::{BytecodeError, Opcode, VerifyError};
use thiserror::Error;

/// Errors that can occur while lowering bytecode or emitting code.
///
/// None of these describe execution-time failures of generated code; those
/// surface as the null sentinel plus the runtime's pending-error flag.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("target error: {0}")]
    Target(String),

    #[error("lowering error: {0}")]
    Lowering(String),

    #[error("layout error: {0}")]
    Layout(String),

    #[error("instruction {pc}: no lowering rule for {op}")]
    UnsupportedOpcode { pc: usize, op: Opcode },

    #[error("instruction {pc} ({op}): lowering moved the stack by {actual}, expected {expected}")]
    StackEffect {
        pc: usize,
        op: Opcode,
        expected: i32,
        actual: i64,
    },

    #[error(transparent)]
    Bytecode(#[from] BytecodeError),

    #[error("bytecode rejected: {0}")]
    Verify(#[from] VerifyError),

    #[error("emission error: {0}")]
    Emission(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Finish the module and return the raw object file bytes.
pub fn emit_object(module: ObjectModule) -> Result<Vec<u8>, CodegenError> {
    let product = module.finish();
    let bytes = product
        .emit()
        .map_err(|e| CodegenError::Emission(format!("failed to emit object file: {e}")))?;
    Ok(bytes)
}

/// Finish the module and write the object file to disk.
pub fn emit_to_file(module: ObjectModule, path: &Path) -> Result<(), CodegenError> {
    let bytes = emit_object(module)?;
    std::fs::write(path, &bytes)?;
    Ok(())
}
