//! Slice objects and the old-style `seq[start:stop]` opcodes.
//!
//! A bound the opcode variant omits is passed as null.

use cranelift_codegen::ir::Value;
use cranelift_module::Module;
use pyjit_bytecode::Opcode;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;
use crate::runtime::RuntimeFn;

/// Which bounds a slice opcode takes from the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SliceBounds {
    pub start: bool,
    pub stop: bool,
}

impl SliceBounds {
    pub(crate) fn of(op: Opcode) -> Result<Self, CodegenError> {
        let (start, stop) = match op {
            Opcode::SliceNone | Opcode::StoreSliceNone | Opcode::DeleteSliceNone => (false, false),
            Opcode::SliceLeft | Opcode::StoreSliceLeft | Opcode::DeleteSliceLeft => (true, false),
            Opcode::SliceRight | Opcode::StoreSliceRight | Opcode::DeleteSliceRight => {
                (false, true)
            }
            Opcode::SliceBoth | Opcode::StoreSliceBoth | Opcode::DeleteSliceBoth => (true, true),
            _ => {
                return Err(CodegenError::Lowering(format!(
                    "{op} is not a slice opcode"
                )))
            }
        };
        Ok(SliceBounds { start, stop })
    }
}

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    /// Pop `stop`, then `start`, then the sequence.
    fn pop_slice_operands(&mut self, bounds: SliceBounds) -> (Value, Value, Value) {
        let stop = if bounds.stop { self.pop() } else { self.null() };
        let start = if bounds.start { self.pop() } else { self.null() };
        let sequence = self.pop();
        (sequence, start, stop)
    }

    pub(super) fn slice(&mut self, op: Opcode) -> Result<(), CodegenError> {
        let (sequence, start, stop) = self.pop_slice_operands(SliceBounds::of(op)?);
        let result = self.call(RuntimeFn::ApplySlice, &[sequence, start, stop])?;
        self.release_if_present(stop)?;
        self.release_if_present(start)?;
        self.release(sequence)?;
        self.check_null(result);
        self.push(result);
        Ok(())
    }

    pub(super) fn store_slice(&mut self, op: Opcode) -> Result<(), CodegenError> {
        let (sequence, start, stop) = self.pop_slice_operands(SliceBounds::of(op)?);
        let source = self.pop();
        self.assign_slice(sequence, start, stop, source)
    }

    pub(super) fn delete_slice(&mut self, op: Opcode) -> Result<(), CodegenError> {
        let (sequence, start, stop) = self.pop_slice_operands(SliceBounds::of(op)?);
        let source = self.null();
        self.assign_slice(sequence, start, stop, source)
    }

    /// Assigning a null source deletes the slice.
    fn assign_slice(
        &mut self,
        sequence: Value,
        start: Value,
        stop: Value,
        source: Value,
    ) -> Result<(), CodegenError> {
        let status = self.call(RuntimeFn::AssignSlice, &[sequence, start, stop, source])?;
        self.release_if_present(source)?;
        self.release_if_present(stop)?;
        self.release_if_present(start)?;
        self.release(sequence)?;
        self.check_nonzero(status);
        Ok(())
    }

    /// `BUILD_SLICE 2` leaves the step null.
    pub(super) fn build_slice(&mut self, arity: u32) -> Result<(), CodegenError> {
        let step = match arity {
            2 => self.null(),
            3 => self.pop(),
            _ => {
                return Err(CodegenError::Lowering(format!(
                    "BUILD_SLICE takes 2 or 3 operands, not {arity}"
                )))
            }
        };
        let stop = self.pop();
        let start = self.pop();
        let slice = self.call(RuntimeFn::SliceNew, &[start, stop, step])?;
        self.release(start)?;
        self.release(stop)?;
        self.release_if_present(step)?;
        self.check_null(slice);
        self.push(slice);
        Ok(())
    }
}
