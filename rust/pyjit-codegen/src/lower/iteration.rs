//! Iterator protocol.

use cranelift_codegen::ir::{InstBuilder, MemFlags};
use cranelift_module::Module;

use super::JumpTargets;
use crate::emit::CodegenError;
use crate::function::FunctionLowering;
use crate::runtime::{RuntimeFn, RuntimeGlobal};

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    pub(super) fn get_iter(&mut self) -> Result<(), CodegenError> {
        let object = self.pop();
        let iterator = self.call(RuntimeFn::GetIter, &[object])?;
        self.release(object)?;
        self.check_null(iterator);
        self.push(iterator);
        Ok(())
    }

    /// Advance the iterator through its type's `tp_iternext` slot.
    ///
    /// A null result with no pending error, or with a pending
    /// `StopIteration` (which is cleared), ends the loop: the iterator is
    /// released and control goes to the target. Any other error is
    /// propagated. Otherwise the iterator and the new value are pushed.
    pub(super) fn for_iter(&mut self, jumps: JumpTargets) -> Result<(), CodegenError> {
        let flags = MemFlags::trusted();
        let iterator = self.pop();
        let iter_type = self
            .builder
            .ins()
            .load(self.ptr, flags, iterator, self.offsets.ob_type);
        let iternext = self
            .builder
            .ins()
            .load(self.ptr, flags, iter_type, self.offsets.tp_iternext);
        let next = self.call_unary_slot(iternext, iterator)?;

        let got_next = self.builder.create_block();
        let next_null = self.builder.create_block();
        let pending_error = self.builder.create_block();
        let clear_error = self.builder.create_block();
        let propagate = self.builder.create_block();
        let exhausted = self.builder.create_block();
        self.builder.ins().brif(next, got_next, &[], next_null, &[]);

        self.builder.switch_to_block(next_null);
        let occurred = self.call(RuntimeFn::ErrOccurred, &[])?;
        self.builder
            .ins()
            .brif(occurred, pending_error, &[], exhausted, &[]);

        self.builder.switch_to_block(pending_error);
        let stop_iteration = self.load_global(RuntimeGlobal::StopIteration)?;
        let matches = self.call(RuntimeFn::ErrExceptionMatches, &[stop_iteration])?;
        self.builder
            .ins()
            .brif(matches, clear_error, &[], propagate, &[]);

        self.builder.switch_to_block(propagate);
        self.release(iterator)?;
        self.error_return();

        self.builder.switch_to_block(clear_error);
        self.call_void(RuntimeFn::ErrClear, &[])?;
        self.builder.ins().jump(exhausted, &[]);

        self.builder.switch_to_block(exhausted);
        self.release(iterator)?;
        self.builder.ins().jump(jumps.target, &[]);

        self.builder.switch_to_block(got_next);
        self.push(iterator);
        self.push(next);
        Ok(())
    }
}
