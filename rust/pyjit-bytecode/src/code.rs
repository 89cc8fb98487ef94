use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::opcode::{JumpKind, Opcode};
use crate::BytecodeError;

/// One decoded instruction. Jump arguments address instruction indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Opcode,
    #[serde(default)]
    pub arg: u32,
}

impl Instruction {
    pub fn new(op: Opcode, arg: u32) -> Self {
        Self { op, arg }
    }
}

impl From<Opcode> for Instruction {
    fn from(op: Opcode) -> Self {
        Self { op, arg: 0 }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.arg == 0 && !self.op.has_argument() {
            write!(f, "{}", self.op)
        } else {
            write!(f, "{} {}", self.op, self.arg)
        }
    }
}

/// A single function body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: String,
    pub instructions: Vec<Instruction>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(CodeUnit),
    Many(Vec<CodeUnit>),
}

impl CodeUnit {
    pub fn new(name: impl Into<String>, instructions: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            instructions,
        }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Instruction index targeted by the instruction at `pc`, if it names one.
    ///
    /// The result is not range-checked; see [`crate::verify`].
    pub fn jump_target(&self, pc: usize) -> Option<usize> {
        let inst = self.instructions.get(pc)?;
        let arg = usize::try_from(inst.arg).ok()?;
        match inst.op.jump_kind()? {
            JumpKind::Absolute => Some(arg),
            JumpKind::Relative => pc.checked_add(1)?.checked_add(arg),
        }
    }

    /// Indices that begin a basic block: every branch target plus the
    /// instruction following a terminator or conditional jump.
    pub fn block_starts(&self) -> BTreeSet<usize> {
        let mut starts = BTreeSet::new();
        for (pc, inst) in self.instructions.iter().enumerate() {
            if inst.op.branches() {
                if let Some(target) = self.jump_target(pc) {
                    starts.insert(target);
                }
            }
            if (inst.op.is_terminator() || inst.op.is_conditional_jump())
                && pc + 1 < self.instructions.len()
            {
                starts.insert(pc + 1);
            }
        }
        starts
    }

    pub fn from_json(json: &str) -> Result<Self, BytecodeError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parses either a single code unit or an array of them.
    pub fn load_all(json: &str) -> Result<Vec<Self>, BytecodeError> {
        match serde_json::from_str::<OneOrMany>(json)? {
            OneOrMany::One(unit) => Ok(vec![unit]),
            OneOrMany::Many(units) => Ok(units),
        }
    }

    pub fn to_json(&self) -> Result<String, BytecodeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl fmt::Display for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.name)?;
        let starts = self.block_starts();
        for (pc, inst) in self.instructions.iter().enumerate() {
            let marker = if starts.contains(&pc) { ">>" } else { "  " };
            writeln!(f, "{marker} {pc:4} {inst}")?;
        }
        Ok(())
    }
}
