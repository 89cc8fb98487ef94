//! Static stack-depth analysis of a code unit.

use thiserror::Error;

use crate::code::CodeUnit;
use crate::opcode::Opcode;
use crate::BytecodeError;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("code unit has no instructions")]
    Empty,
    #[error("instruction {pc} jumps to {target}, outside the code unit")]
    JumpOutOfRange { pc: usize, target: usize },
    #[error("instruction {pc} ({op}) underflows the value stack at depth {depth}")]
    Underflow { pc: usize, op: Opcode, depth: u32 },
    #[error("instruction {pc} is reached with stack depth {found}, expected {expected}")]
    DepthMismatch {
        pc: usize,
        expected: u32,
        found: u32,
    },
    #[error("instruction {pc} falls off the end of the code unit")]
    FallsOffEnd { pc: usize },
    #[error("instruction {pc}: {source}")]
    BadArgument {
        pc: usize,
        #[source]
        source: BytecodeError,
    },
}

/// Stack depth entering each instruction; `None` for unreachable ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackProfile {
    pub depths: Vec<Option<u32>>,
    pub max_depth: u32,
}

impl StackProfile {
    pub fn depth_at(&self, pc: usize) -> Option<u32> {
        self.depths.get(pc).copied().flatten()
    }

    pub fn reachable(&self) -> usize {
        self.depths.iter().filter(|d| d.is_some()).count()
    }
}

pub fn verify(unit: &CodeUnit) -> Result<StackProfile, VerifyError> {
    let len = unit.len();
    if len == 0 {
        return Err(VerifyError::Empty);
    }

    // Arguments and targets are checked for every instruction, reachable or not.
    for (pc, inst) in unit.instructions.iter().enumerate() {
        inst.op
            .stack_effect(inst.arg)
            .map_err(|source| VerifyError::BadArgument { pc, source })?;
        if inst.op.branches() {
            match unit.jump_target(pc) {
                Some(target) if target < len => {}
                target => {
                    return Err(VerifyError::JumpOutOfRange {
                        pc,
                        target: target.unwrap_or(usize::MAX),
                    })
                }
            }
        }
    }

    let mut depths: Vec<Option<u32>> = vec![None; len];
    let mut max_depth = 0u32;
    let mut worklist = vec![(0usize, 0u32)];

    while let Some((pc, depth)) = worklist.pop() {
        match depths[pc] {
            Some(expected) if expected == depth => continue,
            Some(expected) => {
                return Err(VerifyError::DepthMismatch {
                    pc,
                    expected,
                    found: depth,
                })
            }
            None => depths[pc] = Some(depth),
        }
        max_depth = max_depth.max(depth);

        let inst = unit.instructions[pc];
        let apply = |effect: i32| -> Result<u32, VerifyError> {
            let next = i64::from(depth) + i64::from(effect);
            u32::try_from(next).map_err(|_| VerifyError::Underflow {
                pc,
                op: inst.op,
                depth,
            })
        };

        if inst.op.branches() {
            let effect = inst
                .op
                .jump_stack_effect(inst.arg)
                .map_err(|source| VerifyError::BadArgument { pc, source })?
                .unwrap_or(0);
            let taken = apply(effect)?;
            max_depth = max_depth.max(taken);
            if let Some(target) = unit.jump_target(pc) {
                worklist.push((target, taken));
            }
        }

        let effect = inst
            .op
            .stack_effect(inst.arg)
            .map_err(|source| VerifyError::BadArgument { pc, source })?;
        let next = apply(effect)?;
        if !inst.op.is_terminator() {
            max_depth = max_depth.max(next);
            if pc + 1 == len {
                return Err(VerifyError::FallsOffEnd { pc });
            }
            worklist.push((pc + 1, next));
        }
    }

    Ok(StackProfile { depths, max_depth })
}
