//! Opcode Lowering Engine: one rule per opcode, selected by a single
//! exhaustive match.
//!
//! Every rule leaves the builder in the block where the next instruction
//! continues. Rules that end in an unconditional transfer leave it in a
//! filled block, and the driver switches to the next block start.

mod calls;
mod compare;
mod containers;
mod control;
mod iteration;
mod names;
mod numeric;
mod shuffle;
mod slices;

use cranelift_codegen::ir::Block;
use cranelift_module::Module;
use pyjit_bytecode::{Instruction, Opcode};
use tracing::debug;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;

pub use numeric::{binary_entry_point, unary_entry_point};

/// Blocks a control-transfer rule branches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpTargets {
    pub target: Block,
    pub fallthrough: Block,
}

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    /// Emit the IR for one instruction.
    ///
    /// `jumps` must be present for opcodes that branch. Opcodes without a
    /// rule are lowered to a diagnostic abort; rejecting them is the
    /// driver's decision.
    pub fn lower_instruction(
        &mut self,
        inst: Instruction,
        jumps: Option<JumpTargets>,
    ) -> Result<(), CodegenError> {
        let arg = inst.arg;
        let jumps = || {
            jumps.ok_or_else(|| {
                CodegenError::Lowering(format!("{} lowered without jump targets", inst.op))
            })
        };

        match inst.op {
            Opcode::PopTop => self.pop_top(),
            Opcode::RotTwo => self.rotate(2),
            Opcode::RotThree => self.rotate(3),
            Opcode::RotFour => self.rotate(4),
            Opcode::DupTop => self.duplicate(1),
            Opcode::DupTopTwo => self.duplicate(2),
            Opcode::DupTopThree => self.duplicate(3),

            Opcode::UnaryNot => self.unary_not(),
            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryConvert
            | Opcode::UnaryInvert => self.unary_op(inst.op),

            Opcode::BinaryPower | Opcode::InplacePower => self.power_op(inst.op),
            Opcode::BinaryMultiply
            | Opcode::BinaryDivide
            | Opcode::BinaryTrueDivide
            | Opcode::BinaryFloorDivide
            | Opcode::BinaryModulo
            | Opcode::BinaryAdd
            | Opcode::BinarySubtract
            | Opcode::BinarySubscr
            | Opcode::BinaryLshift
            | Opcode::BinaryRshift
            | Opcode::BinaryAnd
            | Opcode::BinaryXor
            | Opcode::BinaryOr
            | Opcode::InplaceMultiply
            | Opcode::InplaceDivide
            | Opcode::InplaceTrueDivide
            | Opcode::InplaceFloorDivide
            | Opcode::InplaceModulo
            | Opcode::InplaceAdd
            | Opcode::InplaceSubtract
            | Opcode::InplaceLshift
            | Opcode::InplaceRshift
            | Opcode::InplaceAnd
            | Opcode::InplaceXor
            | Opcode::InplaceOr => self.binary_op(inst.op),

            Opcode::SliceNone
            | Opcode::SliceLeft
            | Opcode::SliceRight
            | Opcode::SliceBoth => self.slice(inst.op),
            Opcode::StoreSliceNone
            | Opcode::StoreSliceLeft
            | Opcode::StoreSliceRight
            | Opcode::StoreSliceBoth => self.store_slice(inst.op),
            Opcode::DeleteSliceNone
            | Opcode::DeleteSliceLeft
            | Opcode::DeleteSliceRight
            | Opcode::DeleteSliceBoth => self.delete_slice(inst.op),
            Opcode::BuildSlice => self.build_slice(arg),

            Opcode::ListAppend => self.list_append(),
            Opcode::StoreMap => self.store_map(),
            Opcode::StoreSubscr => self.store_subscr(),
            Opcode::DeleteSubscr => self.delete_subscr(),
            Opcode::BuildTuple => self.build_tuple(arg),
            Opcode::BuildList => self.build_list(arg),
            Opcode::BuildMap => self.build_map(arg),
            Opcode::UnpackSequence => self.unpack_sequence(arg),

            Opcode::LoadAttr => self.load_attr(arg),
            Opcode::StoreAttr => self.store_attr(arg),
            Opcode::DeleteAttr => self.delete_attr(arg),

            Opcode::GetIter => self.get_iter(),
            Opcode::ForIter => self.for_iter(jumps()?),

            Opcode::LoadConst => self.load_const(arg),
            Opcode::LoadFast => self.load_fast(arg),
            Opcode::StoreFast => self.store_fast(arg),
            Opcode::DeleteFast => self.delete_fast(arg),
            Opcode::LoadGlobal => self.load_global_name(arg),
            Opcode::StoreGlobal => self.store_global(arg),
            Opcode::DeleteGlobal => self.delete_global(arg),
            Opcode::LoadDeref => self.load_deref(arg),
            Opcode::StoreDeref => self.store_deref(arg),

            Opcode::CompareOp => self.compare_op(arg),

            Opcode::JumpForward | Opcode::JumpAbsolute => {
                self.jump_absolute(jumps()?);
                Ok(())
            }
            Opcode::PopJumpIfFalse => self.pop_jump_if(false, jumps()?),
            Opcode::PopJumpIfTrue => self.pop_jump_if(true, jumps()?),
            Opcode::JumpIfFalseOrPop => self.jump_if_or_pop(false, jumps()?),
            Opcode::JumpIfTrueOrPop => self.jump_if_or_pop(true, jumps()?),
            Opcode::SetupLoop | Opcode::PopBlock => {
                debug!(pc = self.pc, op = %inst.op, "block stack opcode lowered as no-op");
                Ok(())
            }
            Opcode::ReturnValue => {
                self.return_top();
                Ok(())
            }
            Opcode::RaiseVarargs => self.raise_varargs(arg),

            Opcode::CallFunction => self.call_function(arg),
            Opcode::CallFunctionVarKw => self.call_function_var_kw(arg),

            Opcode::SetupExcept
            | Opcode::SetupFinally
            | Opcode::EndFinally
            | Opcode::WithCleanup
            | Opcode::BreakLoop
            | Opcode::ContinueLoop
            | Opcode::YieldValue
            | Opcode::LoadName
            | Opcode::StoreName
            | Opcode::DeleteName
            | Opcode::ImportName
            | Opcode::ImportFrom
            | Opcode::MakeFunction
            | Opcode::MakeClosure
            | Opcode::LoadClosure
            | Opcode::CallFunctionVar
            | Opcode::CallFunctionKw => {
                debug!(pc = self.pc, op = %inst.op, "no lowering rule, emitting abort");
                self.abort_undefined(inst.op)
            }
        }
    }
}
