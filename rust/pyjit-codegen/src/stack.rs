//! Value Stack Emulator.
//!
//! The interpreter's operand stack lives in the frame's value-stack storage;
//! lowering only moves a pointer over it. Depth is never tracked here: the
//! stack-pointer variable is the single source of truth.

use cranelift_codegen::ir::{InstBuilder, MemFlags, Value};
use cranelift_module::Module;

use crate::function::FunctionLowering;

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    /// Store an owned `value` at the stack pointer and advance it one slot.
    pub(crate) fn push(&mut self, value: Value) {
        let sp = self.stack_pointer();
        self.builder.ins().store(MemFlags::trusted(), value, sp, 0);
        let slot = i64::from(self.ptr.bytes());
        let new_sp = self.builder.ins().iadd_imm(sp, slot);
        self.set_stack_pointer(new_sp);
        self.stats.pushes += 1;
    }

    /// Retreat one slot and load the former top. The caller owns the result.
    pub(crate) fn pop(&mut self) -> Value {
        self.stats.pops += 1;
        self.pop_uncounted()
    }

    /// A pop emitted once but executed a statically known number of times;
    /// the caller accounts for it in the statistics.
    pub(crate) fn pop_uncounted(&mut self) -> Value {
        let sp = self.stack_pointer();
        let slot = i64::from(self.ptr.bytes());
        let new_sp = self.builder.ins().iadd_imm(sp, -slot);
        let top = self
            .builder
            .ins()
            .load(self.ptr, MemFlags::trusted(), new_sp, 0);
        self.set_stack_pointer(new_sp);
        top
    }

    /// Load the top of the stack without moving the pointer. Borrowed.
    pub(crate) fn peek(&mut self) -> Value {
        let sp = self.stack_pointer();
        let slot = self.ptr.bytes() as i32;
        self.builder
            .ins()
            .load(self.ptr, MemFlags::trusted(), sp, -slot)
    }

    /// Address `count` slots above the stack pointer.
    pub(crate) fn slot_above(&mut self, count: u32) -> Value {
        let sp = self.stack_pointer();
        let offset = i64::from(count) * i64::from(self.ptr.bytes());
        self.builder.ins().iadd_imm(sp, offset)
    }

    /// Claim `count` values that something else wrote above the pointer.
    pub(crate) fn advance(&mut self, count: u32) {
        let new_sp = self.slot_above(count);
        self.set_stack_pointer(new_sp);
        self.stats.pushes += u64::from(count);
    }
}
