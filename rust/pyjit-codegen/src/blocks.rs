//! Control-Flow Block Manager.
//!
//! Every exit from a lowered function goes through one return block, which
//! drains whatever is left on the value stack before returning.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{Block, InstBuilder, MemFlags, Value};
use cranelift_module::Module;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    /// Build the unified return block. Leaves the builder in a filled block;
    /// the caller repositions it.
    pub(crate) fn fill_return_block(&mut self) -> Result<(), CodegenError> {
        let pop_loop = self.builder.create_block();
        let pop_stack = self.builder.create_block();
        let do_return = self.builder.create_block();

        self.builder.switch_to_block(self.return_block);
        let frame = self.frame();
        let stack_bottom =
            self.builder
                .ins()
                .load(self.ptr, MemFlags::trusted(), frame, self.offsets.frame_valuestack);
        self.builder.ins().jump(pop_loop, &[]);

        self.builder.switch_to_block(pop_loop);
        let sp = self.stack_pointer();
        let drained = self
            .builder
            .ins()
            .icmp(IntCC::UnsignedLessThanOrEqual, sp, stack_bottom);
        self.builder.ins().brif(drained, do_return, &[], pop_stack, &[]);

        self.builder.switch_to_block(pop_stack);
        let leftover = self.pop();
        self.release_if_present(leftover)?;
        self.builder.ins().jump(pop_loop, &[]);

        self.builder.switch_to_block(do_return);
        let retval = self.retval();
        self.builder.ins().return_(&[retval]);
        Ok(())
    }

    /// Whether the block under construction already ends in a terminator.
    pub(crate) fn is_terminated(&self) -> bool {
        let Some(block) = self.builder.current_block() else {
            return true;
        };
        let func = &self.builder.func;
        func.layout
            .last_inst(block)
            .is_some_and(|inst| func.dfg.insts[inst].opcode().is_terminator())
    }

    /// Continue in `next`, branching to it first unless the current block is
    /// already terminated.
    pub fn fallthrough(&mut self, next: Block) {
        if !self.is_terminated() {
            self.builder.ins().jump(next, &[]);
        }
        self.builder.switch_to_block(next);
    }

    /// Store `value` as the result and leave through the return block.
    pub(crate) fn return_value(&mut self, value: Value) {
        self.set_retval(value);
        self.builder.ins().jump(self.return_block, &[]);
    }

    /// Leave through the return block with the null sentinel. The runtime's
    /// pending-error flag is left as the failing call set it.
    pub(crate) fn error_return(&mut self) {
        let null = self.null();
        self.return_value(null);
    }

    /// Close the body: a block still open after the last instruction falls
    /// off the end, which is an error return.
    pub fn close_open_block(&mut self) {
        if !self.is_terminated() {
            self.error_return();
        }
    }
}
