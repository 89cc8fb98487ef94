//! Constants, fast locals, globals, closure cells and attributes.

use cranelift_codegen::ir::{InstBuilder, MemFlags, Value};
use cranelift_module::Module;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;
use crate::runtime::RuntimeFn;

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    pub(super) fn load_const(&mut self, index: u32) -> Result<(), CodegenError> {
        let value = self.const_at(index);
        self.acquire(value)?;
        self.push(value);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fast locals
    // -----------------------------------------------------------------------

    pub(super) fn load_fast(&mut self, index: u32) -> Result<(), CodegenError> {
        let addr = self.local_addr(index);
        let value = self
            .builder
            .ins()
            .load(self.ptr, MemFlags::trusted(), addr, 0);

        let unbound = self.builder.create_block();
        let bound = self.builder.create_block();
        self.builder.ins().brif(value, bound, &[], unbound, &[]);

        self.builder.switch_to_block(unbound);
        self.raise_unbound_local(index)?;
        self.error_return();

        self.builder.switch_to_block(bound);
        self.acquire(value)?;
        self.push(value);
        Ok(())
    }

    pub(super) fn store_fast(&mut self, index: u32) -> Result<(), CodegenError> {
        let value = self.pop();
        self.set_local(index, value)
    }

    pub(super) fn delete_fast(&mut self, index: u32) -> Result<(), CodegenError> {
        let null = self.null();
        self.set_local(index, null)
    }

    /// Overwrite a local slot, dropping the reference it held before.
    fn set_local(&mut self, index: u32, value: Value) -> Result<(), CodegenError> {
        let addr = self.local_addr(index);
        let flags = MemFlags::trusted();
        let previous = self.builder.ins().load(self.ptr, flags, addr, 0);
        self.builder.ins().store(flags, value, addr, 0);
        self.release_if_present(previous)
    }

    fn raise_unbound_local(&mut self, index: u32) -> Result<(), CodegenError> {
        let frame = self.frame();
        let index = self.int_const(i64::from(index));
        self.call_void(RuntimeFn::RaiseForUnboundLocal, &[frame, index])
    }

    // -----------------------------------------------------------------------
    // Globals
    // -----------------------------------------------------------------------

    /// Globals first, then builtins. Dictionary lookups return borrowed
    /// references.
    pub(super) fn load_global_name(&mut self, index: u32) -> Result<(), CodegenError> {
        let name = self.name_at(index);
        let found = self.builder.create_block();
        let found_value = self.builder.append_block_param(found, self.ptr);
        let global_missing = self.builder.create_block();
        let builtin_missing = self.builder.create_block();

        let globals = self.globals();
        let global = self.call(RuntimeFn::DictGetItem, &[globals, name])?;
        self.builder
            .ins()
            .brif(global, found, &[global], global_missing, &[]);

        self.builder.switch_to_block(global_missing);
        let builtins = self.builtins();
        let builtin = self.call(RuntimeFn::DictGetItem, &[builtins, name])?;
        self.builder
            .ins()
            .brif(builtin, found, &[builtin], builtin_missing, &[]);

        self.builder.switch_to_block(builtin_missing);
        self.raise_global_name_error(name)?;
        self.error_return();

        self.builder.switch_to_block(found);
        self.acquire(found_value)?;
        self.push(found_value);
        Ok(())
    }

    pub(super) fn store_global(&mut self, index: u32) -> Result<(), CodegenError> {
        let name = self.name_at(index);
        let value = self.pop();
        let globals = self.globals();
        let status = self.call(RuntimeFn::DictSetItem, &[globals, name, value])?;
        self.release(value)?;
        self.check_nonzero(status);
        Ok(())
    }

    pub(super) fn delete_global(&mut self, index: u32) -> Result<(), CodegenError> {
        let name = self.name_at(index);
        let globals = self.globals();
        let status = self.call(RuntimeFn::DictDelItem, &[globals, name])?;

        let failed = self.builder.create_block();
        let deleted = self.builder.create_block();
        self.builder.ins().brif(status, failed, &[], deleted, &[]);

        self.builder.switch_to_block(failed);
        self.raise_global_name_error(name)?;
        self.error_return();

        self.builder.switch_to_block(deleted);
        Ok(())
    }

    fn raise_global_name_error(&mut self, name: Value) -> Result<(), CodegenError> {
        let frame = self.frame();
        self.call_void(RuntimeFn::RaiseForGlobalNameError, &[frame, name])
    }

    // -----------------------------------------------------------------------
    // Closure cells
    // -----------------------------------------------------------------------

    /// `PyCell_Get` returns a new reference, pushed as is.
    pub(super) fn load_deref(&mut self, index: u32) -> Result<(), CodegenError> {
        let cell = self.cell_at(index);
        let value = self.call(RuntimeFn::CellGet, &[cell])?;

        let failed_load = self.builder.create_block();
        let unbound = self.builder.create_block();
        let failed = self.builder.create_block();
        let loaded = self.builder.create_block();
        self.builder.ins().brif(value, loaded, &[], failed_load, &[]);

        self.builder.switch_to_block(failed_load);
        let pending = self.call(RuntimeFn::ErrOccurred, &[])?;
        self.builder.ins().brif(pending, failed, &[], unbound, &[]);

        self.builder.switch_to_block(unbound);
        self.raise_unbound_local(index)?;
        self.error_return();

        self.builder.switch_to_block(failed);
        self.error_return();

        self.builder.switch_to_block(loaded);
        self.push(value);
        Ok(())
    }

    pub(super) fn store_deref(&mut self, index: u32) -> Result<(), CodegenError> {
        let value = self.pop();
        let cell = self.cell_at(index);
        let status = self.call(RuntimeFn::CellSet, &[cell, value])?;
        self.release(value)?;
        self.check_nonzero(status);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    pub(super) fn load_attr(&mut self, index: u32) -> Result<(), CodegenError> {
        let name = self.name_at(index);
        let object = self.pop();
        let result = self.call(RuntimeFn::GetAttr, &[object, name])?;
        self.release(object)?;
        self.check_null(result);
        self.push(result);
        Ok(())
    }

    pub(super) fn store_attr(&mut self, index: u32) -> Result<(), CodegenError> {
        let name = self.name_at(index);
        let object = self.pop();
        let value = self.pop();
        let status = self.call(RuntimeFn::SetAttr, &[object, name, value])?;
        self.release(value)?;
        self.release(object)?;
        self.check_nonzero(status);
        Ok(())
    }

    /// Deleting is setting the attribute to null.
    pub(super) fn delete_attr(&mut self, index: u32) -> Result<(), CodegenError> {
        let name = self.name_at(index);
        let object = self.pop();
        let null = self.null();
        let status = self.call(RuntimeFn::SetAttr, &[object, name, null])?;
        self.release(object)?;
        self.check_nonzero(status);
        Ok(())
    }
}
