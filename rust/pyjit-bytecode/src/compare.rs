use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::BytecodeError;

/// Argument of `COMPARE_OP`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum CompareOp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
    In = 6,
    NotIn = 7,
    Is = 8,
    IsNot = 9,
    ExcMatch = 10,
}

impl CompareOp {
    pub fn from_arg(arg: u32) -> Result<Self, BytecodeError> {
        let op = match arg {
            0 => CompareOp::Lt,
            1 => CompareOp::Le,
            2 => CompareOp::Eq,
            3 => CompareOp::Ne,
            4 => CompareOp::Gt,
            5 => CompareOp::Ge,
            6 => CompareOp::In,
            7 => CompareOp::NotIn,
            8 => CompareOp::Is,
            9 => CompareOp::IsNot,
            10 => CompareOp::ExcMatch,
            _ => return Err(BytecodeError::UnknownComparison(arg)),
        };
        Ok(op)
    }

    /// The six ordering comparisons, whose code goes to the runtime unchanged.
    pub fn is_rich(self) -> bool {
        (self as u32) <= CompareOp::Ge as u32
    }

    pub fn code(self) -> u32 {
        self as u32
    }
}
