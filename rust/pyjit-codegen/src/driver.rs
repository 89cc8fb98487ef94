//! Lowering driver: turns one [`CodeUnit`] into one defined Cranelift
//! function, instruction by instruction.

use std::collections::BTreeMap;

use cranelift_codegen::ir::{AbiParam, Block, Function, UserFuncName};
use cranelift_codegen::print_errors::pretty_verifier_error;
use cranelift_codegen::verifier::verify_function;
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_module::{FuncId, Linkage, Module};
use pyjit_bytecode::{verify, CodeUnit, Opcode};
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::{JitConfig, UnsupportedOpcodePolicy};
use crate::context::target_triple;
use crate::emit::CodegenError;
use crate::function::{FunctionLowering, LoweringStats};
use crate::layout::{LayoutRegistry, RuntimeOffsets, TargetDataLayout};
use crate::lower::JumpTargets;
use crate::runtime::RuntimeImports;

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// How lowered functions are declared in the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionVisibility {
    /// Exported under the code unit's name.
    Exported,
    /// Unnamed, reachable only through the returned [`FuncId`].
    Anonymous,
}

/// State shared by every function lowered into one module: layouts,
/// resolved offsets and the runtime declarations already made.
pub struct LoweringSession {
    config: JitConfig,
    layouts: LayoutRegistry,
    offsets: RuntimeOffsets,
    imports: RuntimeImports,
    visibility: FunctionVisibility,
}

impl LoweringSession {
    pub fn new(config: &JitConfig) -> Result<Self, CodegenError> {
        let triple = target_triple(&config.codegen)?;
        let target = TargetDataLayout::from_triple(&triple)?;
        let mut layouts = LayoutRegistry::new(target, config.runtime);
        let offsets = RuntimeOffsets::resolve(&mut layouts)?;
        Ok(Self {
            config: config.clone(),
            layouts,
            offsets,
            imports: RuntimeImports::new(),
            visibility: FunctionVisibility::Exported,
        })
    }

    pub fn with_visibility(mut self, visibility: FunctionVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn layouts(&mut self) -> &mut LayoutRegistry {
        &mut self.layouts
    }

    pub fn offsets(&self) -> RuntimeOffsets {
        self.offsets
    }

    pub fn imports(&self) -> &RuntimeImports {
        &self.imports
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What lowering one instruction emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpcodeTrace {
    pub pc: usize,
    pub op: Opcode,
    pub arg: u32,
    pub stack_delta: i64,
    pub pushes: u64,
    pub pops: u64,
    pub acquires: u64,
    pub releases: u64,
    pub conditional_releases: u64,
}

impl OpcodeTrace {
    fn new(pc: usize, op: Opcode, arg: u32, stats: &LoweringStats) -> Self {
        Self {
            pc,
            op,
            arg,
            stack_delta: stats.stack_delta(),
            pushes: stats.pushes,
            pops: stats.pops,
            acquires: stats.acquires,
            releases: stats.releases,
            conditional_releases: stats.conditional_releases,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoweredFunction {
    pub name: String,
    pub func_id: FuncId,
    pub trace: Vec<OpcodeTrace>,
    pub stats: LoweringStats,
    /// The function as handed to the backend, when `retain_ir` is set.
    pub ir: Option<Function>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Lower `unit` into `module` as `(frame: ptr) -> ptr` and define it.
pub fn lower_code_unit<M: Module + ?Sized>(
    module: &mut M,
    session: &mut LoweringSession,
    unit: &CodeUnit,
) -> Result<LoweredFunction, CodegenError> {
    let settings = session.config.codegen.clone();
    if settings.verify {
        let profile = verify(unit)?;
        debug!(
            function = %unit.name,
            max_depth = profile.max_depth,
            reachable = profile.reachable(),
            "bytecode verified"
        );
    }
    if settings.unsupported == UnsupportedOpcodePolicy::Reject {
        if let Some((pc, inst)) = unit
            .instructions
            .iter()
            .enumerate()
            .find(|(_, inst)| !inst.op.is_supported())
        {
            return Err(CodegenError::UnsupportedOpcode { pc, op: inst.op });
        }
    }

    let ptr = module.target_config().pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr));
    sig.returns.push(AbiParam::new(ptr));
    let func_id = match session.visibility {
        FunctionVisibility::Exported => module
            .declare_function(&unit.name, Linkage::Export, &sig)
            .map_err(|e| CodegenError::Lowering(format!("declare {}: {e}", unit.name)))?,
        FunctionVisibility::Anonymous => module
            .declare_anonymous_function(&sig)
            .map_err(|e| CodegenError::Lowering(format!("declare {}: {e}", unit.name)))?,
    };

    let mut func = Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);
    let mut fb_ctx = FunctionBuilderContext::new();
    let (trace, stats) = {
        let builder = FunctionBuilder::new(&mut func, &mut fb_ctx);
        let mut lowering = FunctionLowering::new(
            builder,
            &mut *module,
            &mut session.imports,
            session.offsets,
            session.config.runtime,
            &unit.name,
        )?;
        let trace = lower_body(&mut lowering, unit)?;
        let stats = lowering.finish();
        (trace, stats)
    };

    let isa = module.isa();
    if let Err(errors) = verify_function(&func, isa) {
        return Err(CodegenError::Lowering(format!(
            "{} failed IR verification:\n{}",
            unit.name,
            pretty_verifier_error(&func, None, errors)
        )));
    }
    let ir = settings.retain_ir.then(|| func.clone());

    let mut ctx = Context::for_function(func);
    module
        .define_function(func_id, &mut ctx)
        .map_err(|e| CodegenError::Lowering(format!("define {}: {e:?}", unit.name)))?;

    debug!(
        function = %unit.name,
        instructions = unit.len(),
        pushes = stats.pushes,
        pops = stats.pops,
        acquires = stats.acquires,
        releases = stats.releases,
        runtime_calls = stats.runtime_calls,
        "function lowered"
    );

    Ok(LoweredFunction {
        name: unit.name.clone(),
        func_id,
        trace,
        stats,
        ir,
    })
}

fn lower_body<M: Module + ?Sized>(
    lowering: &mut FunctionLowering<'_, M>,
    unit: &CodeUnit,
) -> Result<Vec<OpcodeTrace>, CodegenError> {
    let len = unit.len();
    let mut blocks: BTreeMap<usize, Block> = BTreeMap::new();
    for pc in unit.block_starts() {
        if pc > len {
            return Err(CodegenError::Lowering(format!(
                "{}: jump target {pc} outside the code unit",
                unit.name
            )));
        }
        blocks.insert(pc, lowering.builder.create_block());
    }
    // A branch in the last instruction still needs somewhere to fall.
    if unit.instructions.last().is_some_and(|inst| inst.op.branches()) {
        blocks
            .entry(len)
            .or_insert_with(|| lowering.builder.create_block());
    }

    let mut trace = Vec::with_capacity(len);
    for (pc, inst) in unit.instructions.iter().enumerate() {
        if let Some(&block) = blocks.get(&pc) {
            lowering.fallthrough(block);
        }
        lowering.pc = pc as i64;

        let jumps = if inst.op.branches() {
            let target = unit.jump_target(pc).and_then(|t| blocks.get(&t).copied());
            let fallthrough = blocks.get(&(pc + 1)).copied();
            match (target, fallthrough) {
                (Some(target), Some(fallthrough)) => Some(JumpTargets { target, fallthrough }),
                _ => {
                    return Err(CodegenError::Lowering(format!(
                        "{}: instruction {pc} ({}) has no resolvable target",
                        unit.name, inst.op
                    )))
                }
            }
        } else {
            None
        };

        let before = lowering.stats();
        lowering.lower_instruction(*inst, jumps)?;
        let emitted = lowering.stats().since(&before);

        if inst.op.is_supported() {
            let expected = inst.op.stack_effect(inst.arg)?;
            if emitted.stack_delta() != i64::from(expected) {
                return Err(CodegenError::StackEffect {
                    pc,
                    op: inst.op,
                    expected,
                    actual: emitted.stack_delta(),
                });
            }
        }
        trace!(
            function = lowering.name(),
            pc,
            op = %inst.op,
            arg = inst.arg,
            delta = emitted.stack_delta(),
            acquires = emitted.acquires,
            releases = emitted.releases,
            "instruction lowered"
        );
        trace.push(OpcodeTrace::new(pc, inst.op, inst.arg, &emitted));
    }

    if let Some(&end) = blocks.get(&len) {
        lowering.fallthrough(end);
    }
    lowering.close_open_block();
    Ok(trace)
}
