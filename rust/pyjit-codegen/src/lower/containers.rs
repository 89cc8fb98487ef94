//! Container construction, mutation and unpacking.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{InstBuilder, MemFlags, Value};
use cranelift_module::Module;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;
use crate::runtime::RuntimeFn;

/// Where a freshly created sequence keeps its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemStorage {
    /// Inline array at the end of the object.
    Inline,
    /// Separately allocated array behind a pointer field.
    Indirect,
}

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    pub(super) fn list_append(&mut self) -> Result<(), CodegenError> {
        let item = self.pop();
        let list = self.pop();
        let status = self.call(RuntimeFn::ListAppend, &[list, item])?;
        self.release(list)?;
        self.release(item)?;
        self.check_nonzero(status);
        Ok(())
    }

    /// The dictionary stays on the stack for the next `STORE_MAP`.
    pub(super) fn store_map(&mut self) -> Result<(), CodegenError> {
        let key = self.pop();
        let value = self.pop();
        let dict = self.pop();
        self.push(dict);
        let status = self.call(RuntimeFn::DictSetItem, &[dict, key, value])?;
        self.release(value)?;
        self.release(key)?;
        self.check_nonzero(status);
        Ok(())
    }

    /// `obj[key] = value`
    pub(super) fn store_subscr(&mut self) -> Result<(), CodegenError> {
        let key = self.pop();
        let object = self.pop();
        let value = self.pop();
        let status = self.call(RuntimeFn::SetItem, &[object, key, value])?;
        self.release(value)?;
        self.release(object)?;
        self.release(key)?;
        self.check_nonzero(status);
        Ok(())
    }

    pub(super) fn delete_subscr(&mut self) -> Result<(), CodegenError> {
        let key = self.pop();
        let object = self.pop();
        let status = self.call(RuntimeFn::DelItem, &[object, key])?;
        self.release(object)?;
        self.release(key)?;
        self.check_nonzero(status);
        Ok(())
    }

    pub(super) fn build_tuple(&mut self, size: u32) -> Result<(), CodegenError> {
        self.build_sequence(size, RuntimeFn::TupleNew, ItemStorage::Inline)
    }

    pub(super) fn build_list(&mut self, size: u32) -> Result<(), CodegenError> {
        self.build_sequence(size, RuntimeFn::ListNew, ItemStorage::Indirect)
    }

    /// Create an empty sequence of `size` items and fill it from the top of
    /// the stack, last item first. Ownership of each popped value moves into
    /// the sequence.
    fn build_sequence(
        &mut self,
        size: u32,
        create: RuntimeFn,
        storage: ItemStorage,
    ) -> Result<(), CodegenError> {
        let length = self.ssize_const(i64::from(size));
        let sequence = self.call(create, &[length])?;
        self.check_null(sequence);

        let loop_head = self.builder.create_block();
        let remaining = self.builder.append_block_param(loop_head, self.ptr);
        let loop_body = self.builder.create_block();
        let done = self.builder.create_block();
        self.builder.ins().jump(loop_head, &[length]);

        self.builder.switch_to_block(loop_head);
        let finished = self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedLessThanOrEqual, remaining, 0);
        self.builder.ins().brif(finished, done, &[], loop_body, &[]);

        self.builder.switch_to_block(loop_body);
        let item = self.pop_uncounted();
        let index = self.builder.ins().iadd_imm(remaining, -1);
        self.set_item(storage, sequence, index, item);
        self.builder.ins().jump(loop_head, &[index]);

        self.builder.switch_to_block(done);
        self.stats.pops += u64::from(size);
        self.push(sequence);
        Ok(())
    }

    /// Store straight into the item array, bypassing the runtime's setters.
    fn set_item(&mut self, storage: ItemStorage, sequence: Value, index: Value, item: Value) {
        let flags = MemFlags::trusted();
        let scaled = self
            .builder
            .ins()
            .imul_imm(index, i64::from(self.ptr.bytes()));
        let (base, offset) = match storage {
            ItemStorage::Inline => (sequence, self.offsets.tuple_item),
            ItemStorage::Indirect => {
                let items = self
                    .builder
                    .ins()
                    .load(self.ptr, flags, sequence, self.offsets.list_item);
                (items, 0)
            }
        };
        let slot = self.builder.ins().iadd(base, scaled);
        self.builder.ins().store(flags, item, slot, offset);
    }

    pub(super) fn build_map(&mut self, size: u32) -> Result<(), CodegenError> {
        let presized = self.ssize_const(i64::from(size));
        let dict = self.call(RuntimeFn::DictNewPresized, &[presized])?;
        self.check_null(dict);
        self.push(dict);
        Ok(())
    }

    /// The runtime writes the `count` items below `sp + count` itself and
    /// reports success as nonzero.
    pub(super) fn unpack_sequence(&mut self, count: u32) -> Result<(), CodegenError> {
        let count_arg = i64::from(count);
        if count_arg > i64::from(i32::MAX) {
            return Err(CodegenError::Lowering(format!(
                "cannot unpack {count} values"
            )));
        }
        let iterable = self.pop();
        let end = self.slot_above(count);
        let count_value = self.int_const(count_arg);
        let unpacked = self.call(RuntimeFn::UnpackIterable, &[iterable, count_value, end])?;
        self.release(iterable)?;

        let success = self.builder.create_block();
        let failure = self.builder.create_block();
        self.builder.ins().brif(unpacked, success, &[], failure, &[]);

        self.builder.switch_to_block(failure);
        self.error_return();

        self.builder.switch_to_block(success);
        self.advance(count);
        Ok(())
    }
}
