//! Compilation context: ISA selection and module creation.

use std::sync::Arc;

use cranelift_codegen::isa::{self, TargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_object::{ObjectBuilder, ObjectModule};
use target_lexicon::Triple;

use crate::config::{CodegenSettings, OptLevel};
use crate::emit::CodegenError;

/// Parse `settings.target`, falling back to the host.
pub fn target_triple(settings: &CodegenSettings) -> Result<Triple, CodegenError> {
    match settings.target.as_deref() {
        Some(text) => text
            .parse()
            .map_err(|e| CodegenError::Target(format!("invalid target triple: {e}"))),
        None => Ok(Triple::host()),
    }
}

/// Shared Cranelift flags for object and JIT modules.
pub fn flag_builder(opt_level: OptLevel) -> Result<settings::Builder, CodegenError> {
    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", opt_level.as_setting())
        .map_err(|e| CodegenError::Target(format!("failed to set opt_level: {e}")))?;
    Ok(flag_builder)
}

/// Build the ISA for the configured target and optimisation level.
pub fn build_isa(settings: &CodegenSettings) -> Result<Arc<dyn TargetIsa>, CodegenError> {
    let triple = target_triple(settings)?;
    let flags = settings::Flags::new(flag_builder(settings.opt_level)?);
    let isa_builder = if settings.target.is_none() {
        cranelift_native::builder()
            .map_err(|e| CodegenError::Target(format!("failed to create ISA builder: {e}")))?
    } else {
        isa::lookup(triple.clone())
            .map_err(|e| CodegenError::Target(format!("unsupported target {triple}: {e}")))?
    };
    isa_builder
        .finish(flags)
        .map_err(|e| CodegenError::Target(format!("failed to build ISA: {e}")))
}

/// Holds the Cranelift state for one ahead-of-time compilation session.
pub struct CodegenContext {
    pub isa: Arc<dyn TargetIsa>,
    pub module: ObjectModule,
}

impl CodegenContext {
    pub fn new(settings: &CodegenSettings) -> Result<Self, CodegenError> {
        let isa = build_isa(settings)?;
        let obj_builder = ObjectBuilder::new(
            isa.clone(),
            "pyjit_module",
            cranelift_module::default_libcall_names(),
        )
        .map_err(|e| CodegenError::Target(format!("failed to create ObjectBuilder: {e}")))?;
        let module = ObjectModule::new(obj_builder);
        Ok(Self { isa, module })
    }

    /// Return the pointer type for the current target (e.g. I64 on 64-bit).
    pub fn pointer_type(&self) -> cranelift_codegen::ir::Type {
        self.isa.pointer_type()
    }
}
