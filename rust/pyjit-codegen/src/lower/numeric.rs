//! Numeric and generic object operators, each one runtime call.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::InstBuilder;
use cranelift_module::Module;
use pyjit_bytecode::Opcode;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;
use crate::runtime::{RuntimeFn, RuntimeGlobal};

/// The runtime entry point implementing a two-operand opcode.
pub fn binary_entry_point(op: Opcode) -> Option<RuntimeFn> {
    let function = match op {
        Opcode::BinaryPower => RuntimeFn::NumberPower,
        Opcode::BinaryMultiply => RuntimeFn::NumberMultiply,
        Opcode::BinaryDivide => RuntimeFn::NumberDivide,
        Opcode::BinaryTrueDivide => RuntimeFn::NumberTrueDivide,
        Opcode::BinaryFloorDivide => RuntimeFn::NumberFloorDivide,
        Opcode::BinaryModulo => RuntimeFn::NumberRemainder,
        Opcode::BinaryAdd => RuntimeFn::NumberAdd,
        Opcode::BinarySubtract => RuntimeFn::NumberSubtract,
        Opcode::BinarySubscr => RuntimeFn::GetItem,
        Opcode::BinaryLshift => RuntimeFn::NumberLshift,
        Opcode::BinaryRshift => RuntimeFn::NumberRshift,
        Opcode::BinaryAnd => RuntimeFn::NumberAnd,
        Opcode::BinaryXor => RuntimeFn::NumberXor,
        Opcode::BinaryOr => RuntimeFn::NumberOr,
        Opcode::InplacePower => RuntimeFn::InPlacePower,
        Opcode::InplaceMultiply => RuntimeFn::InPlaceMultiply,
        Opcode::InplaceDivide => RuntimeFn::InPlaceDivide,
        Opcode::InplaceTrueDivide => RuntimeFn::InPlaceTrueDivide,
        Opcode::InplaceFloorDivide => RuntimeFn::InPlaceFloorDivide,
        Opcode::InplaceModulo => RuntimeFn::InPlaceRemainder,
        Opcode::InplaceAdd => RuntimeFn::InPlaceAdd,
        Opcode::InplaceSubtract => RuntimeFn::InPlaceSubtract,
        Opcode::InplaceLshift => RuntimeFn::InPlaceLshift,
        Opcode::InplaceRshift => RuntimeFn::InPlaceRshift,
        Opcode::InplaceAnd => RuntimeFn::InPlaceAnd,
        Opcode::InplaceXor => RuntimeFn::InPlaceXor,
        Opcode::InplaceOr => RuntimeFn::InPlaceOr,
        _ => return None,
    };
    Some(function)
}

/// The runtime entry point implementing a one-operand opcode.
/// `UNARY_NOT` is lowered through truthiness and has none.
pub fn unary_entry_point(op: Opcode) -> Option<RuntimeFn> {
    match op {
        Opcode::UnaryPositive => Some(RuntimeFn::NumberPositive),
        Opcode::UnaryNegative => Some(RuntimeFn::NumberNegative),
        Opcode::UnaryInvert => Some(RuntimeFn::NumberInvert),
        Opcode::UnaryConvert => Some(RuntimeFn::Repr),
        _ => None,
    }
}

fn no_entry_point(op: Opcode) -> CodegenError {
    CodegenError::Lowering(format!("{op} has no runtime operator"))
}

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    pub(super) fn binary_op(&mut self, op: Opcode) -> Result<(), CodegenError> {
        let function = binary_entry_point(op).ok_or_else(|| no_entry_point(op))?;
        let rhs = self.pop();
        let lhs = self.pop();
        let result = self.call(function, &[lhs, rhs])?;
        self.release(lhs)?;
        self.release(rhs)?;
        self.check_null(result);
        self.push(result);
        Ok(())
    }

    /// Power takes a third "modulus" operand, always `None` here.
    pub(super) fn power_op(&mut self, op: Opcode) -> Result<(), CodegenError> {
        let function = binary_entry_point(op).ok_or_else(|| no_entry_point(op))?;
        let rhs = self.pop();
        let lhs = self.pop();
        let none = self.global_addr(RuntimeGlobal::None)?;
        let result = self.call(function, &[lhs, rhs, none])?;
        self.release(lhs)?;
        self.release(rhs)?;
        self.check_null(result);
        self.push(result);
        Ok(())
    }

    pub(super) fn unary_op(&mut self, op: Opcode) -> Result<(), CodegenError> {
        let function = unary_entry_point(op).ok_or_else(|| no_entry_point(op))?;
        let value = self.pop();
        let result = self.call(function, &[value])?;
        self.release(value)?;
        self.check_null(result);
        self.push(result);
        Ok(())
    }

    pub(super) fn unary_not(&mut self) -> Result<(), CodegenError> {
        let value = self.pop();
        let status = self.call(RuntimeFn::IsTrue, &[value])?;
        self.release(value)?;
        self.check_negative(status);

        let truthy = self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedGreaterThan, status, 0);
        let if_truthy = self.global_addr(RuntimeGlobal::False)?;
        let if_falsy = self.global_addr(RuntimeGlobal::True)?;
        let result = self.builder.ins().select(truthy, if_truthy, if_falsy);
        self.acquire(result)?;
        self.push(result);
        Ok(())
    }
}
