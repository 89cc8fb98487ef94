//! Call dispatch. The runtime pops the callable and its arguments itself,
//! moving the stack pointer through a temporary whose address it receives.

use cranelift_codegen::ir::{InstBuilder, Value};
use cranelift_module::Module;
use pyjit_bytecode::call_operands;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;
use crate::runtime::RuntimeFn;

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    pub(super) fn call_function(&mut self, arg: u32) -> Result<(), CodegenError> {
        let result = self.dispatch_call(RuntimeFn::CallFunction, arg)?;
        self.stats.pops += u64::from(call_operands(arg).unsigned_abs()) + 1;
        self.check_null(result);
        self.push(result);
        Ok(())
    }

    /// Consumes the callable, the positional and keyword operands, the
    /// `*args` and `**kwargs` objects, and leaves the result on the stack
    /// itself. A nonzero status is failure.
    pub(super) fn call_function_var_kw(&mut self, arg: u32) -> Result<(), CodegenError> {
        let status = self.dispatch_call(RuntimeFn::CallFunctionVarKw, arg)?;
        self.stats.pops += u64::from(call_operands(arg).unsigned_abs()) + 3;
        self.stats.pushes += 1;
        self.check_nonzero(status);
        Ok(())
    }

    fn dispatch_call(&mut self, entry: RuntimeFn, arg: u32) -> Result<Value, CodegenError> {
        let oparg = i32::try_from(arg)
            .map_err(|_| CodegenError::Lowering(format!("call argument {arg} out of range")))?;
        let slot = self.call_slot();
        let sp = self.stack_pointer();
        self.builder.ins().stack_store(sp, slot, 0);
        let slot_addr = self.builder.ins().stack_addr(self.ptr, slot, 0);
        let oparg = self.int_const(i64::from(oparg));
        let result = self.call(entry, &[slot_addr, oparg])?;
        let new_sp = self.builder.ins().stack_load(self.ptr, slot, 0);
        self.set_stack_pointer(new_sp);
        Ok(result)
    }
}
