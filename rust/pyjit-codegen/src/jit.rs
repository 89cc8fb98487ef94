//! In-process compilation of code units to callable native entry points.
//!
//! A `JitEngine` owns one Cranelift JIT module and one lowering session, so
//! the Layout Registry and the runtime declarations are shared by every
//! function it compiles. Runtime symbols are bound to process addresses
//! when the engine is created.

use std::collections::HashMap;
use std::ffi::c_void;

use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::FuncId;
use pyjit_bytecode::CodeUnit;
use tracing::{debug, info};

use crate::config::JitConfig;
use crate::driver::{lower_code_unit, FunctionVisibility, LoweredFunction, LoweringSession};
use crate::emit::CodegenError;
use crate::function::LoweringStats;
use crate::runtime::{RuntimeFn, RuntimeSymbols};

/// Native signature of a compiled code unit: frame in, owned result out,
/// null on a pending exception.
pub type CompiledEntry = unsafe extern "C" fn(*mut c_void) -> *mut c_void;

/// Entry points the generated code may call that the C library provides.
const HOST_SYMBOLS: [RuntimeFn; 2] = [RuntimeFn::Puts, RuntimeFn::Abort];

// ---------------------------------------------------------------------------
// Errors and stats
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error(transparent)]
    Compile(#[from] CodegenError),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("JIT module error: {0}")]
    Module(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitStats {
    /// Code units lowered and finalized by this engine.
    pub functions_compiled: u64,
    /// Compile requests answered from the cache.
    pub cache_hits: u64,
    /// Entry points currently cached.
    pub cache_size: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct CompiledFunction {
    entry: CompiledEntry,
    stats: LoweringStats,
}

// SAFETY: The entry point refers to finalized, immutable code owned by the
// engine's JIT module. Moving the handle between threads does not touch it.
unsafe impl Send for CompiledFunction {}

pub struct JitEngine {
    config: JitConfig,
    symbols: RuntimeSymbols,
    module: JITModule,
    session: LoweringSession,
    cache: HashMap<String, CompiledFunction>,
    functions_compiled: u64,
    cache_hits: u64,
}

impl JitEngine {
    /// Create an engine for the host. A configured target triple is ignored:
    /// JIT code always runs in this process.
    pub fn new(config: &JitConfig, symbols: RuntimeSymbols) -> Result<Self, JitError> {
        let mut config = config.clone();
        if let Some(target) = config.codegen.target.take() {
            debug!(%target, "JIT compiles for the host; ignoring configured target");
        }
        let module = new_module(&config, &symbols)?;
        let session = LoweringSession::new(&config)?.with_visibility(FunctionVisibility::Anonymous);
        Ok(Self {
            config,
            symbols,
            module,
            session,
            cache: HashMap::new(),
            functions_compiled: 0,
            cache_hits: 0,
        })
    }

    /// Compile `unit`, or return its cached entry point.
    pub fn compile(&mut self, unit: &CodeUnit) -> Result<CompiledEntry, JitError> {
        if let Some(compiled) = self.cache.get(&unit.name) {
            self.cache_hits += 1;
            return Ok(compiled.entry);
        }
        let lowered = self.lower(unit)?;
        self.finalize(&[lowered])?;
        self.entry_point(&unit.name)
            .ok_or_else(|| JitError::FunctionNotFound(unit.name.clone()))
    }

    /// Compile every unit not already cached, finalizing them as one batch.
    /// Returns how many were newly compiled.
    pub fn compile_all(&mut self, units: &[CodeUnit]) -> Result<usize, JitError> {
        let mut batch: Vec<LoweredFunction> = Vec::new();
        for unit in units {
            let queued = batch.iter().any(|l| l.name == unit.name);
            if queued || self.cache.contains_key(&unit.name) {
                self.cache_hits += 1;
                continue;
            }
            batch.push(self.lower(unit)?);
        }
        let count = batch.len();
        self.finalize(&batch)?;
        Ok(count)
    }

    pub fn entry_point(&self, name: &str) -> Option<CompiledEntry> {
        self.cache.get(name).map(|c| c.entry)
    }

    pub fn is_compiled(&self, name: &str) -> bool {
        self.cache.contains_key(name)
    }

    /// What lowering `name` emitted, for a cached function.
    pub fn lowering_stats(&self, name: &str) -> Option<&LoweringStats> {
        self.cache.get(name).map(|c| &c.stats)
    }

    /// Drop the cached entry point for `name` so the next `compile`
    /// lowers it again. The old code stays mapped until the engine drops.
    pub fn invalidate(&mut self, name: &str) -> bool {
        self.cache.remove(name).is_some()
    }

    pub fn stats(&self) -> JitStats {
        JitStats {
            functions_compiled: self.functions_compiled,
            cache_hits: self.cache_hits,
            cache_size: self.cache.len(),
        }
    }

    pub fn session(&self) -> &LoweringSession {
        &self.session
    }

    fn lower(&mut self, unit: &CodeUnit) -> Result<LoweredFunction, JitError> {
        let lowered = lower_code_unit(&mut self.module, &mut self.session, unit)?;
        let unresolved = self.unresolved_symbols();
        if !unresolved.is_empty() {
            // Already defined functions would fail to link; start over with
            // a fresh module. Cached entry points stay valid.
            self.reset_module()?;
            return Err(JitError::Module(format!(
                "{} references unregistered runtime symbols: {}",
                unit.name,
                unresolved.join(", ")
            )));
        }
        Ok(lowered)
    }

    fn finalize(&mut self, batch: &[LoweredFunction]) -> Result<(), JitError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.module
            .finalize_definitions()
            .map_err(|e| JitError::Module(format!("finalize failed: {e}")))?;
        for lowered in batch {
            let entry = self.finalized_entry(lowered.func_id);
            self.cache.insert(
                lowered.name.clone(),
                CompiledFunction {
                    entry,
                    stats: lowered.stats,
                },
            );
        }
        self.functions_compiled += batch.len() as u64;
        info!(
            functions = batch.len(),
            cached = self.cache.len(),
            "finalized JIT batch"
        );
        Ok(())
    }

    fn finalized_entry(&self, func_id: FuncId) -> CompiledEntry {
        let code = self.module.get_finalized_function(func_id);
        // SAFETY: Every lowered function is defined with the signature
        // `(ptr) -> ptr` in the platform's default calling convention.
        unsafe { std::mem::transmute::<*const u8, CompiledEntry>(code) }
    }

    fn unresolved_symbols(&self) -> Vec<&'static str> {
        self.session
            .imports()
            .imported_names()
            .into_iter()
            .filter(|name| self.symbols.get(name).is_none())
            .filter(|name| !HOST_SYMBOLS.iter().any(|f| f.name() == *name))
            .collect()
    }

    fn reset_module(&mut self) -> Result<(), JitError> {
        self.module = new_module(&self.config, &self.symbols)?;
        self.session =
            LoweringSession::new(&self.config)?.with_visibility(FunctionVisibility::Anonymous);
        Ok(())
    }
}

fn new_module(config: &JitConfig, symbols: &RuntimeSymbols) -> Result<JITModule, JitError> {
    let opt_level = config.codegen.opt_level.as_setting();
    let mut builder = JITBuilder::with_flags(
        &[("opt_level", opt_level)],
        cranelift_module::default_libcall_names(),
    )
    .map_err(|e| JitError::Module(format!("JITBuilder creation failed: {e}")))?;
    for (name, address) in symbols.iter() {
        builder.symbol(name, address);
    }
    Ok(JITModule::new(builder))
}
