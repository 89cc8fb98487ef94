//! `COMPARE_OP`.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{InstBuilder, Value};
use cranelift_module::Module;
use pyjit_bytecode::CompareOp;

use crate::emit::CodegenError;
use crate::function::FunctionLowering;
use crate::runtime::{RuntimeFn, RuntimeGlobal};

impl<M: Module + ?Sized> FunctionLowering<'_, M> {
    pub(super) fn compare_op(&mut self, arg: u32) -> Result<(), CodegenError> {
        let op = CompareOp::from_arg(arg)?;
        let rhs = self.pop();
        let lhs = self.pop();

        if op.is_rich() {
            return self.rich_compare(lhs, rhs, op);
        }
        let flag = match op {
            CompareOp::Is | CompareOp::IsNot => {
                let cc = if op == CompareOp::Is {
                    IntCC::Equal
                } else {
                    IntCC::NotEqual
                };
                let flag = self.builder.ins().icmp(cc, lhs, rhs);
                self.release(lhs)?;
                self.release(rhs)?;
                flag
            }
            CompareOp::In => self.container_contains(rhs, lhs)?,
            CompareOp::NotIn => {
                let contained = self.container_contains(rhs, lhs)?;
                self.builder.ins().icmp_imm(IntCC::Equal, contained, 0)
            }
            CompareOp::ExcMatch => self.exception_matches(lhs, rhs)?,
            _ => {
                return Err(CodegenError::Lowering(format!(
                    "unhandled comparison {op}"
                )))
            }
        };
        self.push_bool(flag)
    }

    /// The runtime result is already a boolean object and owned.
    fn rich_compare(&mut self, lhs: Value, rhs: Value, op: CompareOp) -> Result<(), CodegenError> {
        let code = self.int_const(i64::from(op.code()));
        let result = self.call(RuntimeFn::RichCompare, &[lhs, rhs, code])?;
        self.release(lhs)?;
        self.release(rhs)?;
        self.check_null(result);
        self.push(result);
        Ok(())
    }

    /// `item in container` as an `i8` flag. Negative is an error.
    fn container_contains(&mut self, container: Value, item: Value) -> Result<Value, CodegenError> {
        let status = self.call(RuntimeFn::SequenceContains, &[container, item])?;
        self.release(item)?;
        self.release(container)?;
        self.check_negative(status);
        Ok(self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedGreaterThan, status, 0))
    }

    /// Zero from the runtime is treated as failure.
    fn exception_matches(&mut self, exc: Value, exc_type: Value) -> Result<Value, CodegenError> {
        let status = self.call(RuntimeFn::CheckedExceptionMatches, &[exc, exc_type])?;
        self.release(exc_type)?;
        self.release(exc)?;
        self.check_null(status);
        Ok(self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedGreaterThan, status, 0))
    }

    /// Push `True` or `False` for an `i8` flag.
    fn push_bool(&mut self, flag: Value) -> Result<(), CodegenError> {
        let py_true = self.global_addr(RuntimeGlobal::True)?;
        let py_false = self.global_addr(RuntimeGlobal::False)?;
        let boxed = self.builder.ins().select(flag, py_true, py_false);
        self.acquire(boxed)?;
        self.push(boxed);
        Ok(())
    }
}
