//! Compilation context for one function body.
//!
//! A [`FunctionLowering`] owns the Cranelift builder for the function under
//! construction, the scoped pointer variables resolved at entry, and the
//! unified return block. The emulated value stack, reference counting and
//! block management live in sibling modules as further `impl` blocks.

use std::collections::HashMap;

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    types, AbiParam, Block, FuncRef, GlobalValue, InstBuilder, MemFlags, SigRef, Signature,
    StackSlot, StackSlotData, StackSlotKind, Type as ClifType, Value,
};
use cranelift_frontend::{FunctionBuilder, Variable};
use cranelift_module::Module;

use crate::emit::CodegenError;
use crate::layout::{RuntimeFeatures, RuntimeOffsets};
use crate::runtime::{RuntimeFn, RuntimeGlobal, RuntimeImports};

/// What the lowering of an instruction (or a whole function) emitted.
///
/// Counts are logical: a runtime loop that pops `n` values counts `n` pops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoweringStats {
    pub pushes: u64,
    pub pops: u64,
    pub acquires: u64,
    pub releases: u64,
    pub conditional_releases: u64,
    pub runtime_calls: u64,
}

impl LoweringStats {
    pub fn stack_delta(&self) -> i64 {
        self.pushes as i64 - self.pops as i64
    }

    /// Counts accumulated since `earlier`.
    pub fn since(&self, earlier: &LoweringStats) -> LoweringStats {
        LoweringStats {
            pushes: self.pushes - earlier.pushes,
            pops: self.pops - earlier.pops,
            acquires: self.acquires - earlier.acquires,
            releases: self.releases - earlier.releases,
            conditional_releases: self.conditional_releases - earlier.conditional_releases,
            runtime_calls: self.runtime_calls - earlier.runtime_calls,
        }
    }
}

/// Variables defined in the entry block and read everywhere else.
struct Scope {
    frame: Variable,
    stack_pointer: Variable,
    retval: Variable,
    consts: Variable,
    names: Variable,
    fastlocals: Variable,
    freevars: Variable,
    globals: Variable,
    builtins: Variable,
}

pub struct FunctionLowering<'a, M: Module + ?Sized> {
    pub(crate) builder: FunctionBuilder<'a>,
    module: &'a mut M,
    imports: &'a mut RuntimeImports,
    pub(crate) offsets: RuntimeOffsets,
    pub(crate) features: RuntimeFeatures,
    pub(crate) ptr: ClifType,
    name: String,
    scope: Scope,
    pub(crate) return_block: Block,
    func_refs: HashMap<RuntimeFn, FuncRef>,
    global_values: HashMap<RuntimeGlobal, GlobalValue>,
    name_string: Option<GlobalValue>,
    iternext_sig: Option<SigRef>,
    call_slot: Option<StackSlot>,
    pub(crate) stats: LoweringStats,
    /// Bytecode index being lowered; -1 while building the prologue.
    pub(crate) pc: i64,
}

impl<'a, M: Module + ?Sized> FunctionLowering<'a, M> {
    /// Emit the entry block and the unified return block, leaving the
    /// builder positioned at the start of the body.
    ///
    /// The function's signature must be `(frame: ptr) -> ptr`.
    pub fn new(
        mut builder: FunctionBuilder<'a>,
        module: &'a mut M,
        imports: &'a mut RuntimeImports,
        offsets: RuntimeOffsets,
        features: RuntimeFeatures,
        name: &str,
    ) -> Result<Self, CodegenError> {
        let ptr = module.target_config().pointer_type();

        let mut next_var = 0u32;
        let mut declare = |builder: &mut FunctionBuilder<'a>| {
            let var = Variable::from_u32(next_var);
            next_var += 1;
            builder.declare_var(var, ptr);
            var
        };
        let scope = Scope {
            frame: declare(&mut builder),
            stack_pointer: declare(&mut builder),
            retval: declare(&mut builder),
            consts: declare(&mut builder),
            names: declare(&mut builder),
            fastlocals: declare(&mut builder),
            freevars: declare(&mut builder),
            globals: declare(&mut builder),
            builtins: declare(&mut builder),
        };

        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        let frame = builder
            .block_params(entry)
            .first()
            .copied()
            .ok_or_else(|| CodegenError::Lowering("function takes no frame argument".into()))?;
        let return_block = builder.create_block();
        let body = builder.create_block();

        let mut this = Self {
            builder,
            module,
            imports,
            offsets,
            features,
            ptr,
            name: name.to_string(),
            scope,
            return_block,
            func_refs: HashMap::new(),
            global_values: HashMap::new(),
            name_string: None,
            iternext_sig: None,
            call_slot: None,
            stats: LoweringStats::default(),
            pc: -1,
        };

        this.load_scope(frame);
        this.builder.ins().jump(body, &[]);
        this.fill_return_block()?;
        this.builder.switch_to_block(body);
        this.stats = LoweringStats::default();
        Ok(this)
    }

    fn load_scope(&mut self, frame: Value) {
        let ptr = self.ptr;
        let off = self.offsets;
        let flags = MemFlags::trusted();
        let b = &mut self.builder;

        b.def_var(self.scope.frame, frame);
        let stack_top = b.ins().load(ptr, flags, frame, off.frame_stacktop);
        b.def_var(self.scope.stack_pointer, stack_top);
        let null = b.ins().iconst(ptr, 0);
        b.def_var(self.scope.retval, null);

        let code = b.ins().load(ptr, flags, frame, off.frame_code);
        let consts_tuple = b.ins().load(ptr, flags, code, off.code_consts);
        let consts = b.ins().iadd_imm(consts_tuple, i64::from(off.tuple_item));
        b.def_var(self.scope.consts, consts);
        let names_tuple = b.ins().load(ptr, flags, code, off.code_names);
        let names = b.ins().iadd_imm(names_tuple, i64::from(off.tuple_item));
        b.def_var(self.scope.names, names);

        let fastlocals = b.ins().iadd_imm(frame, i64::from(off.frame_localsplus));
        b.def_var(self.scope.fastlocals, fastlocals);
        let mut nlocals = b.ins().load(types::I32, flags, code, off.code_nlocals);
        if ptr != types::I32 {
            nlocals = b.ins().sextend(ptr, nlocals);
        }
        let cells_offset = b.ins().imul_imm(nlocals, i64::from(ptr.bytes()));
        let freevars = b.ins().iadd(fastlocals, cells_offset);
        b.def_var(self.scope.freevars, freevars);

        let globals = b.ins().load(ptr, flags, frame, off.frame_globals);
        b.def_var(self.scope.globals, globals);
        let builtins = b.ins().load(ptr, flags, frame, off.frame_builtins);
        b.def_var(self.scope.builtins, builtins);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> LoweringStats {
        self.stats
    }

    /// Seal and finalize the function. The builder must not be positioned in
    /// an open block.
    pub fn finish(self) -> LoweringStats {
        let stats = self.stats;
        let mut builder = self.builder;
        builder.seal_all_blocks();
        builder.finalize();
        stats
    }

    // -----------------------------------------------------------------------
    // Scoped pointers
    // -----------------------------------------------------------------------

    pub(crate) fn frame(&mut self) -> Value {
        self.builder.use_var(self.scope.frame)
    }

    pub(crate) fn stack_pointer(&mut self) -> Value {
        self.builder.use_var(self.scope.stack_pointer)
    }

    pub(crate) fn set_stack_pointer(&mut self, sp: Value) {
        self.builder.def_var(self.scope.stack_pointer, sp);
    }

    pub(crate) fn set_retval(&mut self, value: Value) {
        self.builder.def_var(self.scope.retval, value);
    }

    pub(crate) fn retval(&mut self) -> Value {
        self.builder.use_var(self.scope.retval)
    }

    pub(crate) fn globals(&mut self) -> Value {
        self.builder.use_var(self.scope.globals)
    }

    pub(crate) fn builtins(&mut self) -> Value {
        self.builder.use_var(self.scope.builtins)
    }

    fn slot_offset(&self, index: u32) -> i64 {
        i64::from(index) * i64::from(self.ptr.bytes())
    }

    /// Borrowed `co_consts[index]`.
    pub(crate) fn const_at(&mut self, index: u32) -> Value {
        let base = self.builder.use_var(self.scope.consts);
        self.load_slot(base, index)
    }

    /// Borrowed `co_names[index]`.
    pub(crate) fn name_at(&mut self, index: u32) -> Value {
        let base = self.builder.use_var(self.scope.names);
        self.load_slot(base, index)
    }

    /// Address of fast local `index`.
    pub(crate) fn local_addr(&mut self, index: u32) -> Value {
        let base = self.builder.use_var(self.scope.fastlocals);
        let offset = self.slot_offset(index);
        self.builder.ins().iadd_imm(base, offset)
    }

    /// The cell object of free variable `index`.
    pub(crate) fn cell_at(&mut self, index: u32) -> Value {
        let base = self.builder.use_var(self.scope.freevars);
        self.load_slot(base, index)
    }

    fn load_slot(&mut self, base: Value, index: u32) -> Value {
        let addr = {
            let offset = self.slot_offset(index);
            self.builder.ins().iadd_imm(base, offset)
        };
        self.builder
            .ins()
            .load(self.ptr, MemFlags::trusted(), addr, 0)
    }

    // -----------------------------------------------------------------------
    // Constants and runtime references
    // -----------------------------------------------------------------------

    pub(crate) fn null(&mut self) -> Value {
        self.builder.ins().iconst(self.ptr, 0)
    }

    pub(crate) fn int_const(&mut self, value: i64) -> Value {
        self.builder.ins().iconst(types::I32, value)
    }

    pub(crate) fn ssize_const(&mut self, value: i64) -> Value {
        self.builder.ins().iconst(self.ptr, value)
    }

    pub(crate) fn pc_const(&mut self) -> Value {
        let pc = self.pc.clamp(i64::from(i32::MIN), i64::from(i32::MAX));
        self.int_const(pc)
    }

    fn func_ref(&mut self, function: RuntimeFn) -> Result<FuncRef, CodegenError> {
        if let Some(func_ref) = self.func_refs.get(&function) {
            return Ok(*func_ref);
        }
        let id = self.imports.function(&mut *self.module, function)?;
        let func_ref = self.module.declare_func_in_func(id, self.builder.func);
        self.func_refs.insert(function, func_ref);
        Ok(func_ref)
    }

    /// Call a runtime entry point that returns a value.
    pub(crate) fn call(
        &mut self,
        function: RuntimeFn,
        args: &[Value],
    ) -> Result<Value, CodegenError> {
        let func_ref = self.func_ref(function)?;
        let inst = self.builder.ins().call(func_ref, args);
        self.stats.runtime_calls += 1;
        self.builder
            .inst_results(inst)
            .first()
            .copied()
            .ok_or_else(|| {
                CodegenError::Lowering(format!("{} returns nothing", function.name()))
            })
    }

    /// Call a runtime entry point for its side effects only.
    pub(crate) fn call_void(
        &mut self,
        function: RuntimeFn,
        args: &[Value],
    ) -> Result<(), CodegenError> {
        let func_ref = self.func_ref(function)?;
        self.builder.ins().call(func_ref, args);
        self.stats.runtime_calls += 1;
        Ok(())
    }

    /// Call through `tp_iternext`-shaped function pointer: `(ptr) -> ptr`.
    pub(crate) fn call_unary_slot(
        &mut self,
        callee: Value,
        arg: Value,
    ) -> Result<Value, CodegenError> {
        let sig_ref = match self.iternext_sig {
            Some(sig) => sig,
            None => {
                let mut sig = Signature::new(self.module.isa().default_call_conv());
                sig.params.push(AbiParam::new(self.ptr));
                sig.returns.push(AbiParam::new(self.ptr));
                let sig = self.builder.import_signature(sig);
                self.iternext_sig = Some(sig);
                sig
            }
        };
        let inst = self.builder.ins().call_indirect(sig_ref, callee, &[arg]);
        self.stats.runtime_calls += 1;
        self.builder
            .inst_results(inst)
            .first()
            .copied()
            .ok_or_else(|| CodegenError::Lowering("indirect call returned nothing".into()))
    }

    /// Address of a runtime global.
    pub(crate) fn global_addr(&mut self, global: RuntimeGlobal) -> Result<Value, CodegenError> {
        let gv = match self.global_values.get(&global) {
            Some(gv) => *gv,
            None => {
                let id = self.imports.global(&mut *self.module, global)?;
                let gv = self.module.declare_data_in_func(id, self.builder.func);
                self.global_values.insert(global, gv);
                gv
            }
        };
        Ok(self.builder.ins().global_value(self.ptr, gv))
    }

    /// Value of a pointer-sized runtime global variable.
    pub(crate) fn load_global(&mut self, global: RuntimeGlobal) -> Result<Value, CodegenError> {
        let addr = self.global_addr(global)?;
        Ok(self.builder.ins().load(self.ptr, MemFlags::trusted(), addr, 0))
    }

    /// Address of a NUL-terminated string constant.
    pub(crate) fn c_string(&mut self, text: &str) -> Result<Value, CodegenError> {
        let id = self.imports.c_string(&mut *self.module, text)?;
        let gv = self.module.declare_data_in_func(id, self.builder.func);
        Ok(self.builder.ins().global_value(self.ptr, gv))
    }

    /// Address of this function's name as a C string.
    pub(crate) fn function_name_string(&mut self) -> Result<Value, CodegenError> {
        let gv = match self.name_string {
            Some(gv) => gv,
            None => {
                let id = self.imports.c_string(&mut *self.module, &self.name)?;
                let gv = self.module.declare_data_in_func(id, self.builder.func);
                self.name_string = Some(gv);
                gv
            }
        };
        Ok(self.builder.ins().global_value(self.ptr, gv))
    }

    /// Pointer-sized slot whose address is handed to call dispatch.
    pub(crate) fn call_slot(&mut self) -> StackSlot {
        if let Some(slot) = self.call_slot {
            return slot;
        }
        let align_shift = self.ptr.bytes().trailing_zeros() as u8;
        let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            self.ptr.bytes(),
            align_shift,
        ));
        self.call_slot = Some(slot);
        slot
    }

    // -----------------------------------------------------------------------
    // Failure tests
    // -----------------------------------------------------------------------

    /// Null result: error return. Continues on the non-null path.
    pub(crate) fn check_null(&mut self, value: Value) {
        let ok = self.builder.create_block();
        let failed = self.builder.create_block();
        self.builder.ins().brif(value, ok, &[], failed, &[]);
        self.builder.switch_to_block(failed);
        self.error_return();
        self.builder.switch_to_block(ok);
    }

    /// Nonzero status: error return. Continues on the zero path.
    pub(crate) fn check_nonzero(&mut self, status: Value) {
        let ok = self.builder.create_block();
        let failed = self.builder.create_block();
        self.builder.ins().brif(status, failed, &[], ok, &[]);
        self.builder.switch_to_block(failed);
        self.error_return();
        self.builder.switch_to_block(ok);
    }

    /// Negative status: error return. Continues on the non-negative path.
    pub(crate) fn check_negative(&mut self, status: Value) {
        let is_error = self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedLessThan, status, 0);
        self.check_nonzero(is_error);
    }

    /// Emit an always-taken exit that runs `emit` and then returns the
    /// error sentinel, leaving the builder in a structurally reachable but
    /// never executed block so later instructions still lower.
    pub(crate) fn diverge(
        &mut self,
        emit: impl FnOnce(&mut Self) -> Result<(), CodegenError>,
    ) -> Result<(), CodegenError> {
        let exit = self.builder.create_block();
        let dead = self.builder.create_block();
        let taken = self.builder.ins().iconst(types::I8, 1);
        self.builder.ins().brif(taken, exit, &[], dead, &[]);
        self.builder.switch_to_block(exit);
        emit(self)?;
        self.error_return();
        self.builder.switch_to_block(dead);
        Ok(())
    }
}
