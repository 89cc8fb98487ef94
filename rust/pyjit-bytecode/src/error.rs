use thiserror::Error;

use crate::opcode::Opcode;

#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error("{op} {arg}: {reason}")]
    InvalidArgument {
        op: Opcode,
        arg: u32,
        reason: &'static str,
    },
    #[error("unknown comparison operator {0}")]
    UnknownComparison(u32),
    #[error("malformed code unit: {0}")]
    Json(#[from] serde_json::Error),
}
