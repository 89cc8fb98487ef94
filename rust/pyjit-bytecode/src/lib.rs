//! Bytecode vocabulary of the stack-machine interpreter: opcodes, decoded
//! instructions, code units and a stack-depth verifier.

pub mod code;
pub mod compare;
pub mod error;
pub mod opcode;
pub mod verify;

pub use code::{CodeUnit, Instruction};
pub use compare::CompareOp;
pub use error::BytecodeError;
pub use opcode::{call_operands, JumpKind, Opcode};
pub use verify::{verify, StackProfile, VerifyError};
