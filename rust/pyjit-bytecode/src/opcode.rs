//! Opcodes of the stack-machine interpreter.
//!
//! The textual form of every opcode is the interpreter's own
//! SCREAMING_SNAKE_CASE name (`LOAD_FAST`, `BINARY_ADD`, ...). It is used by
//! serde, `Display` and `FromStr` alike, so a code unit serialized as JSON
//! reads like a disassembly listing.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::BytecodeError;

/// How a branching opcode encodes its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpKind {
    /// The argument is the index of the target instruction.
    Absolute,
    /// The target is `pc + 1 + arg`.
    Relative,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // Stack shuffling
    PopTop,
    RotTwo,
    RotThree,
    RotFour,
    DupTop,
    DupTopTwo,
    DupTopThree,

    // Unary operators
    UnaryPositive,
    UnaryNegative,
    UnaryNot,
    UnaryConvert,
    UnaryInvert,

    ListAppend,

    // Binary operators
    BinaryPower,
    BinaryMultiply,
    BinaryDivide,
    BinaryTrueDivide,
    BinaryFloorDivide,
    BinaryModulo,
    BinaryAdd,
    BinarySubtract,
    BinarySubscr,
    BinaryLshift,
    BinaryRshift,
    BinaryAnd,
    BinaryXor,
    BinaryOr,

    // In-place operators
    InplacePower,
    InplaceMultiply,
    InplaceDivide,
    InplaceTrueDivide,
    InplaceFloorDivide,
    InplaceModulo,
    InplaceAdd,
    InplaceSubtract,
    InplaceLshift,
    InplaceRshift,
    InplaceAnd,
    InplaceXor,
    InplaceOr,

    // Slicing: NONE = seq[:], LEFT = seq[start:], RIGHT = seq[:stop], BOTH = seq[start:stop]
    SliceNone,
    SliceLeft,
    SliceRight,
    SliceBoth,
    StoreSliceNone,
    StoreSliceLeft,
    StoreSliceRight,
    StoreSliceBoth,
    DeleteSliceNone,
    DeleteSliceLeft,
    DeleteSliceRight,
    DeleteSliceBoth,

    // Containers and attributes
    StoreMap,
    StoreSubscr,
    DeleteSubscr,
    StoreAttr,
    DeleteAttr,
    LoadAttr,
    BuildTuple,
    BuildList,
    BuildMap,
    BuildSlice,
    UnpackSequence,

    // Iteration
    GetIter,
    ForIter,

    // Names
    LoadConst,
    LoadFast,
    StoreFast,
    DeleteFast,
    LoadGlobal,
    StoreGlobal,
    DeleteGlobal,
    LoadDeref,
    StoreDeref,

    CompareOp,

    // Control flow
    JumpForward,
    JumpAbsolute,
    PopJumpIfFalse,
    PopJumpIfTrue,
    JumpIfFalseOrPop,
    JumpIfTrueOrPop,
    SetupLoop,
    PopBlock,
    ReturnValue,
    RaiseVarargs,

    // Calls
    CallFunction,
    CallFunctionVarKw,

    // Known to the interpreter, not lowered.
    SetupExcept,
    SetupFinally,
    EndFinally,
    WithCleanup,
    BreakLoop,
    ContinueLoop,
    YieldValue,
    LoadName,
    StoreName,
    DeleteName,
    ImportName,
    ImportFrom,
    MakeFunction,
    MakeClosure,
    LoadClosure,
    CallFunctionVar,
    CallFunctionKw,
}

impl Opcode {
    /// The interpreter name of this opcode, e.g. `"LOAD_FAST"`.
    pub fn name(self) -> &'static str {
        self.into()
    }

    /// Whether the argument carries meaning for this opcode.
    pub fn has_argument(self) -> bool {
        self.jump_kind().is_some()
            || matches!(
                self,
                Opcode::LoadConst
                    | Opcode::LoadFast
                    | Opcode::StoreFast
                    | Opcode::DeleteFast
                    | Opcode::LoadGlobal
                    | Opcode::StoreGlobal
                    | Opcode::DeleteGlobal
                    | Opcode::LoadDeref
                    | Opcode::StoreDeref
                    | Opcode::LoadAttr
                    | Opcode::StoreAttr
                    | Opcode::DeleteAttr
                    | Opcode::CompareOp
                    | Opcode::BuildTuple
                    | Opcode::BuildList
                    | Opcode::BuildMap
                    | Opcode::BuildSlice
                    | Opcode::UnpackSequence
                    | Opcode::RaiseVarargs
                    | Opcode::CallFunction
                    | Opcode::CallFunctionVarKw
                    | Opcode::CallFunctionVar
                    | Opcode::CallFunctionKw
                    | Opcode::LoadName
                    | Opcode::StoreName
                    | Opcode::DeleteName
                    | Opcode::ImportName
                    | Opcode::ImportFrom
                    | Opcode::MakeFunction
                    | Opcode::MakeClosure
                    | Opcode::LoadClosure
                    | Opcode::SetupExcept
                    | Opcode::SetupFinally
            )
    }

    /// Whether the lowering engine has a rule for this opcode.
    pub fn is_supported(self) -> bool {
        !matches!(
            self,
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
                | Opcode::CallFunctionKw
        )
    }

    /// Target encoding of opcodes that transfer control to a static target.
    pub fn jump_kind(self) -> Option<JumpKind> {
        match self {
            Opcode::JumpForward | Opcode::ForIter | Opcode::SetupLoop => Some(JumpKind::Relative),
            Opcode::JumpAbsolute
            | Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::JumpIfFalseOrPop
            | Opcode::JumpIfTrueOrPop
            | Opcode::ContinueLoop => Some(JumpKind::Absolute),
            _ => None,
        }
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::ReturnValue
                | Opcode::RaiseVarargs
                | Opcode::JumpForward
                | Opcode::JumpAbsolute
                | Opcode::ContinueLoop
                | Opcode::BreakLoop
        )
    }

    /// Branches to its target on one path and falls through on the other.
    pub fn is_conditional_jump(self) -> bool {
        matches!(
            self,
            Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::JumpIfFalseOrPop
                | Opcode::JumpIfTrueOrPop
                | Opcode::ForIter
        )
    }

    /// Whether control can reach the argument's target through this opcode.
    pub fn branches(self) -> bool {
        self.is_conditional_jump()
            || matches!(
                self,
                Opcode::JumpForward | Opcode::JumpAbsolute | Opcode::ContinueLoop
            )
    }

    /// Net change of the value stack depth on the fall-through path.
    pub fn stack_effect(self, arg: u32) -> Result<i32, BytecodeError> {
        let effect = match self {
            Opcode::PopTop => -1,
            Opcode::RotTwo | Opcode::RotThree | Opcode::RotFour => 0,
            Opcode::DupTop => 1,
            Opcode::DupTopTwo => 2,
            Opcode::DupTopThree => 3,

            Opcode::UnaryPositive
            | Opcode::UnaryNegative
            | Opcode::UnaryNot
            | Opcode::UnaryConvert
            | Opcode::UnaryInvert => 0,

            Opcode::ListAppend => -2,

            Opcode::BinaryPower
            | Opcode::BinaryMultiply
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
            | Opcode::InplacePower
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
            | Opcode::InplaceOr => -1,

            Opcode::SliceNone => 0,
            Opcode::SliceLeft | Opcode::SliceRight => -1,
            Opcode::SliceBoth => -2,
            Opcode::StoreSliceNone => -2,
            Opcode::StoreSliceLeft | Opcode::StoreSliceRight => -3,
            Opcode::StoreSliceBoth => -4,
            Opcode::DeleteSliceNone => -1,
            Opcode::DeleteSliceLeft | Opcode::DeleteSliceRight => -2,
            Opcode::DeleteSliceBoth => -3,

            Opcode::StoreMap => -2,
            Opcode::StoreSubscr => -3,
            Opcode::DeleteSubscr => -2,
            Opcode::StoreAttr => -2,
            Opcode::DeleteAttr => -1,
            Opcode::LoadAttr => 0,
            Opcode::BuildTuple | Opcode::BuildList => 1 - to_i32(self, arg)?,
            Opcode::BuildMap => 1,
            Opcode::BuildSlice => match arg {
                2 => -1,
                3 => -2,
                _ => return Err(invalid(self, arg, "slice arity must be 2 or 3")),
            },
            Opcode::UnpackSequence => to_i32(self, arg)? - 1,

            Opcode::GetIter => 0,
            Opcode::ForIter => 1,

            Opcode::LoadConst | Opcode::LoadFast | Opcode::LoadGlobal | Opcode::LoadDeref => 1,
            Opcode::StoreFast | Opcode::StoreGlobal | Opcode::StoreDeref => -1,
            Opcode::DeleteFast | Opcode::DeleteGlobal => 0,

            Opcode::CompareOp => {
                crate::CompareOp::from_arg(arg)?;
                -1
            }

            Opcode::JumpForward | Opcode::JumpAbsolute => 0,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => -1,
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => -1,
            Opcode::SetupLoop | Opcode::PopBlock => 0,
            Opcode::ReturnValue => -1,
            Opcode::RaiseVarargs => match arg {
                0..=3 => -(arg as i32),
                _ => return Err(invalid(self, arg, "raise takes at most 3 operands")),
            },

            Opcode::CallFunction => -call_operands(arg),
            Opcode::CallFunctionVarKw => -call_operands(arg) - 2,
            Opcode::CallFunctionVar | Opcode::CallFunctionKw => -call_operands(arg) - 1,

            Opcode::SetupExcept | Opcode::SetupFinally => 0,
            Opcode::EndFinally | Opcode::WithCleanup => -1,
            Opcode::BreakLoop | Opcode::ContinueLoop => 0,
            Opcode::YieldValue => 0,
            Opcode::LoadName | Opcode::ImportFrom | Opcode::LoadClosure => 1,
            Opcode::StoreName | Opcode::ImportName => -1,
            Opcode::DeleteName => 0,
            Opcode::MakeFunction => -to_i32(self, arg)?,
            Opcode::MakeClosure => -to_i32(self, arg)? - 1,
        };
        Ok(effect)
    }

    /// Net change of the stack depth when the branch is taken.
    ///
    /// `None` for opcodes that never branch.
    pub fn jump_stack_effect(self, arg: u32) -> Result<Option<i32>, BytecodeError> {
        let effect = match self {
            Opcode::JumpForward | Opcode::JumpAbsolute | Opcode::ContinueLoop => 0,
            Opcode::PopJumpIfFalse | Opcode::PopJumpIfTrue => -1,
            // The tested value stays on the stack when jumping.
            Opcode::JumpIfFalseOrPop | Opcode::JumpIfTrueOrPop => 0,
            // Exhausted iterator is popped.
            Opcode::ForIter => -1,
            _ => {
                self.stack_effect(arg)?;
                return Ok(None);
            }
        };
        Ok(Some(effect))
    }
}

/// Positional plus keyword-pair operands of a call: `arg = npos | (nkw << 8)`.
/// The callable itself is consumed as well; the result is pushed.
pub fn call_operands(arg: u32) -> i32 {
    let positional = (arg & 0xff) as i32;
    let keywords = ((arg >> 8) & 0xff) as i32;
    positional + 2 * keywords
}

fn to_i32(op: Opcode, arg: u32) -> Result<i32, BytecodeError> {
    i32::try_from(arg).map_err(|_| invalid(op, arg, "argument does not fit a stack depth"))
}

fn invalid(op: Opcode, arg: u32, reason: &'static str) -> BytecodeError {
    BytecodeError::InvalidArgument { op, arg, reason }
}
