//! Jumps, truthiness, returns and raises.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, InstBuilder, Value};
use cranelift_module::Module;
use pyjit_bytecode::Opcode;

use super::JumpTargets;
use crate::emit::CodegenError;
use crate::function::FunctionLowering;
use crate::runtime::{RuntimeFn, RuntimeGlobal};

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    /// Truthiness of a borrowed `value` as an `i8` flag. The `True` and
    /// `False` singletons are recognised by address; anything else goes
    /// through the runtime, whose negative result is an error return.
    pub(crate) fn is_truthy(&mut self, value: Value) -> Result<Value, CodegenError> {
        let not_true = self.builder.create_block();
        let not_false = self.builder.create_block();
        let done = self.builder.create_block();
        let result = self.builder.append_block_param(done, types::I8);

        let py_true = self.global_addr(RuntimeGlobal::True)?;
        let is_true = self.builder.ins().icmp(IntCC::Equal, value, py_true);
        self.builder
            .ins()
            .brif(is_true, done, &[is_true], not_true, &[]);

        self.builder.switch_to_block(not_true);
        let py_false = self.global_addr(RuntimeGlobal::False)?;
        let is_false = self.builder.ins().icmp(IntCC::Equal, value, py_false);
        // `is_true` is known false on this edge.
        self.builder
            .ins()
            .brif(is_false, done, &[is_true], not_false, &[]);

        self.builder.switch_to_block(not_false);
        let status = self.call(RuntimeFn::IsTrue, &[value])?;
        self.check_negative(status);
        let nonzero = self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedGreaterThan, status, 0);
        self.builder.ins().jump(done, &[nonzero]);

        self.builder.switch_to_block(done);
        Ok(result)
    }

    pub(super) fn jump_absolute(&mut self, jumps: JumpTargets) {
        self.builder.ins().jump(jumps.target, &[]);
    }

    /// The tested value stays on the stack until truthiness is known, so a
    /// failing test leaves it for the return block to drain.
    pub(super) fn pop_jump_if(
        &mut self,
        jump_if_true: bool,
        jumps: JumpTargets,
    ) -> Result<(), CodegenError> {
        let tested = self.peek();
        let truthy = self.is_truthy(tested)?;
        let popped = self.pop();
        self.release(popped)?;
        let (on_true, on_false) = if jump_if_true {
            (jumps.target, jumps.fallthrough)
        } else {
            (jumps.fallthrough, jumps.target)
        };
        self.builder.ins().brif(truthy, on_true, &[], on_false, &[]);
        Ok(())
    }

    /// Jump with the tested value kept; pop and release it only when
    /// falling through.
    pub(super) fn jump_if_or_pop(
        &mut self,
        jump_if_true: bool,
        jumps: JumpTargets,
    ) -> Result<(), CodegenError> {
        let tested = self.peek();
        let truthy = self.is_truthy(tested)?;
        let pop_path = self.builder.create_block();
        let (on_true, on_false) = if jump_if_true {
            (jumps.target, pop_path)
        } else {
            (pop_path, jumps.target)
        };
        self.builder.ins().brif(truthy, on_true, &[], on_false, &[]);

        self.builder.switch_to_block(pop_path);
        let popped = self.pop();
        self.release(popped)?;
        self.builder.ins().jump(jumps.fallthrough, &[]);
        Ok(())
    }

    /// The popped value's reference becomes the function's result.
    pub(super) fn return_top(&mut self) {
        let value = self.pop();
        self.return_value(value);
    }

    /// `raise [type [, inst [, tb]]]`. The runtime consumes all three
    /// references; absent ones are null.
    pub(super) fn raise_varargs(&mut self, count: u32) -> Result<(), CodegenError> {
        if count > 3 {
            return Err(CodegenError::Lowering(format!(
                "RAISE_VARARGS takes at most 3 operands, not {count}"
            )));
        }
        let traceback = if count >= 3 { self.pop() } else { self.null() };
        let instance = if count >= 2 { self.pop() } else { self.null() };
        let exc_type = if count >= 1 { self.pop() } else { self.null() };
        self.diverge(|this| {
            this.call_void(RuntimeFn::DoRaise, &[exc_type, instance, traceback])
        })
    }

    /// Print the opcode's name and abort the process if this code is ever
    /// reached.
    pub(super) fn abort_undefined(&mut self, op: Opcode) -> Result<(), CodegenError> {
        let message = format!("Undefined opcode: {}", op.name());
        self.diverge(|this| {
            let text = this.c_string(&message)?;
            this.call(RuntimeFn::Puts, &[text])?;
            this.call_void(RuntimeFn::Abort, &[])
        })
    }
}
