//! Reference-Count Manager.
//!
//! Counts are adjusted with plain loads and stores; the runtime is
//! single-threaded.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{InstBuilder, MemFlags, Value};
use cranelift_module::Module;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;
use crate::layout::RuntimeFeatures;
use crate::runtime::{RuntimeFn, RuntimeGlobal};

/// Which reference-counting sequences are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefcountPolicy {
    /// Increment, decrement, deallocate at zero.
    Plain,
    /// Additionally maintain `_Py_RefTotal` and report counts that go negative.
    Debug,
}

impl RefcountPolicy {
    pub fn for_features(features: RuntimeFeatures) -> Self {
        if features.ref_debug {
            RefcountPolicy::Debug
        } else {
            RefcountPolicy::Plain
        }
    }
}

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    pub(crate) fn refcount_policy(&self) -> RefcountPolicy {
        RefcountPolicy::for_features(self.features)
    }

    /// Take one more reference to a non-null `object`.
    pub(crate) fn acquire(&mut self, object: Value) -> Result<(), CodegenError> {
        if self.refcount_policy() == RefcountPolicy::Debug {
            self.adjust_ref_total(1)?;
        }
        self.add_to_refcnt(object, 1);
        self.stats.acquires += 1;
        Ok(())
    }

    /// Drop one reference to a non-null `object`, deallocating it at zero.
    pub(crate) fn release(&mut self, object: Value) -> Result<(), CodegenError> {
        self.emit_release(object)?;
        self.stats.releases += 1;
        Ok(())
    }

    /// As [`release`](Self::release), skipped when `object` is null.
    pub(crate) fn release_if_present(&mut self, object: Value) -> Result<(), CodegenError> {
        let present = self.builder.create_block();
        let done = self.builder.create_block();
        self.builder.ins().brif(object, present, &[], done, &[]);

        self.builder.switch_to_block(present);
        self.emit_release(object)?;
        self.builder.ins().jump(done, &[]);

        self.builder.switch_to_block(done);
        self.stats.conditional_releases += 1;
        Ok(())
    }

    fn emit_release(&mut self, object: Value) -> Result<(), CodegenError> {
        let policy = self.refcount_policy();
        if policy == RefcountPolicy::Debug {
            self.adjust_ref_total(-1)?;
        }
        let new_refcnt = self.add_to_refcnt(object, -1);

        let dealloc = self.builder.create_block();
        let tail = self.builder.create_block();
        let still_referenced = match policy {
            RefcountPolicy::Plain => tail,
            RefcountPolicy::Debug => self.builder.create_block(),
        };
        self.builder
            .ins()
            .brif(new_refcnt, still_referenced, &[], dealloc, &[]);

        if policy == RefcountPolicy::Debug {
            self.builder.switch_to_block(still_referenced);
            let negative = self.builder.create_block();
            let below_zero = self
                .builder
                .ins()
                .icmp_imm(IntCC::SignedLessThan, new_refcnt, 0);
            self.builder.ins().brif(below_zero, negative, &[], tail, &[]);

            self.builder.switch_to_block(negative);
            let function_name = self.function_name_string()?;
            let pc = self.pc_const();
            self.call_void(RuntimeFn::NegativeRefcount, &[function_name, pc, object])?;
            self.builder.ins().jump(tail, &[]);
        }

        self.builder.switch_to_block(dealloc);
        self.call_void(RuntimeFn::WrapDealloc, &[object])?;
        self.builder.ins().jump(tail, &[]);

        self.builder.switch_to_block(tail);
        Ok(())
    }

    /// `object->ob_refcnt += delta`, returning the new count.
    fn add_to_refcnt(&mut self, object: Value, delta: i64) -> Value {
        let offset = self.offsets.ob_refcnt;
        let flags = MemFlags::trusted();
        let old = self.builder.ins().load(self.ptr, flags, object, offset);
        let new = self.builder.ins().iadd_imm(old, delta);
        self.builder.ins().store(flags, new, object, offset);
        new
    }

    fn adjust_ref_total(&mut self, delta: i64) -> Result<(), CodegenError> {
        let addr = self.global_addr(RuntimeGlobal::RefTotal)?;
        let flags = MemFlags::trusted();
        let old = self.builder.ins().load(self.ptr, flags, addr, 0);
        let new = self.builder.ins().iadd_imm(old, delta);
        self.builder.ins().store(flags, new, addr, 0);
        Ok(())
    }
}
