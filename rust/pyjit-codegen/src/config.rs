//! Compiler configuration, loaded from TOML.
//!
//! ```toml
//! [runtime]
//! trace_refs = false
//!
//! [codegen]
//! opt_level = "speed"
//! unsupported = "emit_abort"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::emit::CodegenError;
use crate::layout::RuntimeFeatures;

// ---------------------------------------------------------------------------
// Optimisation level
// ---------------------------------------------------------------------------

/// Optimisation level handed to Cranelift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    /// No optimisation (fastest compile, slowest code).
    None,
    /// Optimise for execution speed.
    #[default]
    Speed,
    /// Optimise for both speed and code size.
    SpeedAndSize,
}

impl OptLevel {
    /// Value of Cranelift's `opt_level` setting.
    pub fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// What the driver does with an opcode that has no lowering rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnsupportedOpcodePolicy {
    /// Fail the compilation of the whole code unit.
    #[default]
    Reject,
    /// Compile a call that prints the opcode name and aborts the process.
    EmitAbort,
}

// ---------------------------------------------------------------------------
// Codegen settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodegenSettings {
    pub opt_level: OptLevel,
    /// Optional target triple (e.g. `"x86_64-unknown-linux-gnu"`).
    /// If `None`, the host platform is used.
    pub target: Option<String>,
    /// Run the bytecode verifier before lowering.
    pub verify: bool,
    /// Keep a copy of each function's IR before it is handed to the backend.
    pub retain_ir: bool,
    pub unsupported: UnsupportedOpcodePolicy,
}

impl Default for CodegenSettings {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Speed,
            target: None,
            verify: true,
            retain_ir: false,
            unsupported: UnsupportedOpcodePolicy::Reject,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// How the target runtime was built. Must match it exactly.
    pub runtime: RuntimeFeatures,
    pub codegen: CodegenSettings,
}

impl JitConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, CodegenError> {
        toml::from_str(content).map_err(|e| CodegenError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, CodegenError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| CodegenError::Config(format!("{}: {e}", path.display())))
    }
}
