//! AOT (Ahead-Of-Time) compilation to native object files.
//!
//! Every code unit becomes an exported `(frame) -> result` function named
//! after the unit. Runtime entry points and globals are left as undefined
//! symbols for the system linker.

use cranelift_codegen::ir::{ExternalName, Function, GlobalValueData, UserExternalName};
use cranelift_module::{DataId, FuncId, Module};
use cranelift_object::ObjectModule;
use pyjit_bytecode::CodeUnit;

use crate::config::JitConfig;
use crate::context::CodegenContext;
use crate::driver::{lower_code_unit, FunctionVisibility, LoweredFunction, LoweringSession};
use crate::emit::CodegenError;

/// An object module together with what was lowered into it.
pub struct CompiledObject {
    pub module: ObjectModule,
    /// One entry per unit, in input order.
    pub functions: Vec<LoweredFunction>,
}

/// Lower `units` into one object module for the configured target.
pub fn compile_units(config: &JitConfig, units: &[CodeUnit]) -> Result<CompiledObject, CodegenError> {
    let CodegenContext { mut module, .. } = CodegenContext::new(&config.codegen)?;
    let mut session = LoweringSession::new(config)?.with_visibility(FunctionVisibility::Exported);
    let functions = units
        .iter()
        .map(|unit| lower_code_unit(&mut module, &mut session, unit))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(CompiledObject { module, functions })
}

/// Lower `units` into an object module ready for `emit::emit_object`.
pub fn compile_object(config: &JitConfig, units: &[CodeUnit]) -> Result<ObjectModule, CodegenError> {
    compile_units(config, units).map(|compiled| compiled.module)
}

/// Cranelift IR text for one unit, as handed to the backend, followed by
/// the symbol each external function and global reference resolves to.
pub fn render_ir(config: &JitConfig, unit: &CodeUnit) -> Result<String, CodegenError> {
    let mut config = config.clone();
    config.codegen.retain_ir = true;
    let compiled = compile_units(&config, std::slice::from_ref(unit))?;
    let func = compiled
        .functions
        .first()
        .and_then(|lowered| lowered.ir.as_ref())
        .ok_or_else(|| CodegenError::Lowering(format!("no IR retained for {}", unit.name)))?;

    let mut text = func.display().to_string();
    for (func_ref, data) in func.dfg.ext_funcs.iter() {
        if let Some(name) = symbol_name(func, &compiled.module, &data.name) {
            text.push_str(&format!("; {func_ref} = {name}\n"));
        }
    }
    for (gv, data) in func.global_values.iter() {
        if let GlobalValueData::Symbol { name, .. } = data {
            if let Some(name) = symbol_name(func, &compiled.module, name) {
                text.push_str(&format!("; {gv} = {name}\n"));
            }
        }
    }
    Ok(text)
}

/// Resolve a module reference back to its declared name. Anonymous
/// declarations have none.
fn symbol_name<M: Module>(func: &Function, module: &M, name: &ExternalName) -> Option<String> {
    let ExternalName::User(user) = name else {
        return None;
    };
    let UserExternalName { namespace, index } = func.params.user_named_funcs().get(*user)?.clone();
    let declarations = module.declarations();
    match namespace {
        0 => declarations.get_function_decl(FuncId::from_u32(index)).name.clone(),
        1 => declarations.get_data_decl(DataId::from_u32(index)).name.clone(),
        _ => None,
    }
}
