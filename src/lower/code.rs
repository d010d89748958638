//! Decoded code units: the translator's input.
//!
//! A `CodeUnit` is what a bytecode decoder hands over for one function: metadata pools
//! plus an instruction list whose jump targets are already resolved to instruction
//! indices. The static stack-depth pass lives here because both the translator and
//! the simulated host (which sizes the value stack) need it.

use super::opcode::{Opcode, OperandKind};
use crate::core::{TranslateError, TranslateResult};
use std::collections::BTreeSet;
use std::fmt;

/// A constant-pool entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Const {
    None,
    True,
    False,
    Int(i64),
    Str(String),
    Tuple(Vec<Const>),
}

impl fmt::Display for Const {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Const::None => f.write_str("None"),
            Const::True => f.write_str("True"),
            Const::False => f.write_str("False"),
            Const::Int(v) => write!(f, "{}", v),
            Const::Str(s) => write!(f, "{:?}", s),
            Const::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// One decoded instruction. Its offset is its index in `CodeUnit::instrs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub opcode: Opcode,
    pub arg: Option<i32>,
    /// Resolved jump target for jump-carrying opcodes.
    pub target: Option<usize>,
}

impl Instr {
    pub fn new(opcode: Opcode, arg: Option<i32>) -> Self {
        Self {
            opcode,
            arg,
            target: None,
        }
    }

    pub fn jump(opcode: Opcode, target: usize) -> Self {
        Self {
            opcode,
            arg: None,
            target: Some(target),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeUnit {
    pub name: String,
    pub argcount: usize,
    /// Local variable names; the first `argcount` are the parameters.
    pub varnames: Vec<String>,
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    pub names: Vec<String>,
    pub consts: Vec<Const>,
    pub stacksize: usize,
    pub flags: u32,
    pub instrs: Vec<Instr>,
}

/// Result of the static stack-depth pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthMap {
    /// Depth on entry to each instruction; `None` when unreachable.
    pub depths: Vec<Option<usize>>,
    /// Depth on entry to the position just past the last instruction, if reachable.
    pub past_end: Option<usize>,
    pub max_depth: usize,
}

impl CodeUnit {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn nlocals(&self) -> usize {
        self.varnames.len()
    }

    /// Cells followed by free variables, as indexed by the deref opcodes.
    pub fn ncells(&self) -> usize {
        self.cellvars.len() + self.freevars.len()
    }

    pub fn cell_name(&self, index: usize) -> Option<&str> {
        self.cellvars
            .iter()
            .chain(self.freevars.iter())
            .nth(index)
            .map(String::as_str)
    }

    pub fn push(&mut self, opcode: Opcode, arg: Option<i32>) -> usize {
        self.instrs.push(Instr::new(opcode, arg));
        self.instrs.len() - 1
    }

    pub fn push_jump(&mut self, opcode: Opcode, target: usize) -> usize {
        self.instrs.push(Instr::jump(opcode, target));
        self.instrs.len() - 1
    }

    /// Index of `name` in the name pool, appending it if new.
    pub fn name_index(&mut self, name: &str) -> usize {
        match self.names.iter().position(|n| n == name) {
            Some(i) => i,
            None => {
                self.names.push(name.to_string());
                self.names.len() - 1
            }
        }
    }

    pub fn const_index(&mut self, value: Const) -> usize {
        match self.consts.iter().position(|c| *c == value) {
            Some(i) => i,
            None => {
                self.consts.push(value);
                self.consts.len() - 1
            }
        }
    }

    /// Instruction indices that begin a basic block.
    pub fn block_starts(&self) -> BTreeSet<usize> {
        let mut starts = BTreeSet::new();
        if self.instrs.is_empty() {
            return starts;
        }
        starts.insert(0);
        for (i, instr) in self.instrs.iter().enumerate() {
            if let Some(target) = instr.target {
                if target < self.instrs.len() {
                    starts.insert(target);
                }
            }
            if instr.opcode.is_control_transfer() && i + 1 < self.instrs.len() {
                starts.insert(i + 1);
            }
        }
        starts
    }

    /// Check operands and opcode support for every instruction, reachable or not.
    pub fn validate(&self) -> TranslateResult<()> {
        let len = self.instrs.len();
        for (offset, instr) in self.instrs.iter().enumerate() {
            let op = instr.opcode;
            if !op.is_supported() {
                return Err(TranslateError::UnsupportedOpcode {
                    opcode: op.name(),
                    offset,
                });
            }
            let bad = |reason: String| TranslateError::BadOperand {
                opcode: op.name(),
                offset,
                reason,
            };
            let index_in = |pool: usize, what: &str| -> TranslateResult<()> {
                match instr.arg {
                    Some(a) if a >= 0 && (a as usize) < pool => Ok(()),
                    Some(a) => Err(bad(format!("{} index {} out of range ({})", what, a, pool))),
                    None => Err(bad(format!("missing {} index", what))),
                }
            };
            match op.operand_kind() {
                OperandKind::None => {}
                OperandKind::Const => index_in(self.consts.len(), "constant")?,
                OperandKind::Name => index_in(self.names.len(), "name")?,
                OperandKind::Local => index_in(self.nlocals(), "local")?,
                OperandKind::Cell => index_in(self.ncells(), "cell")?,
                OperandKind::Jump => match instr.target {
                    Some(target) if target < len => {}
                    Some(target) => {
                        return Err(TranslateError::BadJumpTarget {
                            offset,
                            target,
                            len,
                        })
                    }
                    None => return Err(bad("missing jump target".to_string())),
                },
                OperandKind::Count | OperandKind::Compare | OperandKind::CallArgs => {
                    if instr.arg.is_none() {
                        return Err(bad("missing operand".to_string()));
                    }
                }
            }
            if op.stack_effect(instr.arg).is_none() {
                return Err(bad(format!("operand {:?} out of range", instr.arg)));
            }
        }
        Ok(())
    }

    /// Forward dataflow over the instruction stream computing the static stack depth at
    /// every reachable instruction.
    pub fn static_depths(&self) -> TranslateResult<DepthMap> {
        self.validate()?;
        let len = self.instrs.len();
        let mut depths: Vec<Option<usize>> = vec![None; len];
        let mut past_end = None;
        let mut max_depth = 0;
        let mut worklist = Vec::new();

        let flow = |to: usize,
                        depth: usize,
                        depths: &mut Vec<Option<usize>>,
                        past_end: &mut Option<usize>,
                        worklist: &mut Vec<usize>|
         -> TranslateResult<()> {
            let slot = if to == len {
                past_end
            } else {
                &mut depths[to]
            };
            match *slot {
                None => {
                    *slot = Some(depth);
                    if to < len {
                        worklist.push(to);
                    }
                    Ok(())
                }
                Some(recorded) if recorded == depth => Ok(()),
                Some(recorded) => Err(TranslateError::StackDepthMismatch {
                    block: format!("L{}", to),
                    recorded,
                    arriving: depth,
                }),
            }
        };

        if len > 0 {
            flow(0, 0, &mut depths, &mut past_end, &mut worklist)?;
        }
        while let Some(offset) = worklist.pop() {
            let instr = &self.instrs[offset];
            let depth = depths[offset].unwrap_or(0);
            let effect = instr
                .opcode
                .stack_effect(instr.arg)
                .ok_or_else(|| TranslateError::BadOperand {
                    opcode: instr.opcode.name(),
                    offset,
                    reason: "operand out of range".to_string(),
                })?;
            if depth < effect.pops {
                return Err(TranslateError::StackUnderflow {
                    opcode: instr.opcode.name(),
                    offset,
                    needed: effect.pops,
                    depth,
                });
            }
            let after = depth - effect.pops + effect.pushes;
            max_depth = max_depth.max(depth).max(after);

            if effect.falls_through {
                flow(offset + 1, after, &mut depths, &mut past_end, &mut worklist)?;
            }
            if let (Some(delta), Some(target)) = (effect.on_branch, instr.target) {
                let on_branch = depth as isize + delta;
                max_depth = max_depth.max(on_branch as usize);
                flow(target, on_branch as usize, &mut depths, &mut past_end, &mut worklist)?;
            }
            // The loop exit is reached at the depth the loop was entered with.
            if instr.opcode == Opcode::SetupLoop {
                if let Some(target) = instr.target {
                    flow(target, depth, &mut depths, &mut past_end, &mut worklist)?;
                }
            }
        }

        Ok(DepthMap {
            depths,
            past_end,
            max_depth,
        })
    }

    /// Maximum static stack depth.
    pub fn compute_stacksize(&self) -> TranslateResult<usize> {
        Ok(self.static_depths()?.max_depth)
    }
}
