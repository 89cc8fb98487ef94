//! Native code generation for stack-machine bytecode via Cranelift.
//!
//! Each code unit is lowered, one instruction at a time, into a function
//! `(frame) -> result` that manipulates the interpreter's own value stack and
//! reference counts and calls back into the object runtime for everything
//! else.

pub mod aot;
pub mod blocks;
pub mod config;
pub mod context;
pub mod driver;
pub mod emit;
pub mod function;
pub mod jit;
pub mod layout;
pub mod lower;
pub mod refcount;
pub mod runtime;
pub mod stack;

pub use aot::{compile_object, compile_units, render_ir, CompiledObject};
pub use config::{CodegenSettings, JitConfig, OptLevel, UnsupportedOpcodePolicy};
pub use driver::{lower_code_unit, LoweredFunction, LoweringSession, OpcodeTrace};
pub use emit::CodegenError;
pub use function::LoweringStats;
pub use jit::{CompiledEntry, JitEngine, JitError, JitStats};
pub use layout::{LayoutRegistry, RuntimeFeatures, RuntimeOffsets, TargetDataLayout};
pub use runtime::{RuntimeFn, RuntimeGlobal, RuntimeSymbols};
