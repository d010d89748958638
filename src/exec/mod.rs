// This module interprets translated IR so that generated code can be exercised without
// a native backend. Every SSA value is a 64-bit word: pointers are addresses into the
// host's Memory, i32 values are kept sign-extended and i1 values are 0 or 1. Calls to
// named externs and indirect calls through function pointers are forwarded to a Host,
// which also resolves the addresses of data symbols. Phi nodes are evaluated in parallel
// on block entry using the values live at the end of the predecessor. A step limit
// bounds runaway loops.

//! IR interpreter.

pub mod memory;

pub use memory::Memory;

use crate::ir::{
    BinOp, BlockId, CmpPred, ExternKind, Function, InstKind, Module, Operand, StrId, Terminator,
    Ty,
};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    #[error("no function named `{0}`")]
    UnknownFunction(String),

    #[error("expected {expected} arguments, given {given}")]
    ArgumentCount { expected: usize, given: usize },

    #[error("access to {size} bytes at {addr:#x} is out of bounds")]
    BadAddress { addr: u64, size: u64 },

    #[error("use of undefined value %{0}")]
    UndefinedValue(u32),

    #[error("block `{0}` has no terminator")]
    Unterminated(String),

    #[error("reached unreachable in block `{0}`")]
    Unreachable(String),

    #[error("phi in `{block}` has no incoming value for `{from}`")]
    MissingPhiEdge { block: String, from: String },

    #[error("step limit of {0} exceeded")]
    StepLimit(usize),

    #[error("`{0}` is not a function")]
    NotCallable(String),

    #[error("host error in {symbol}: {message}")]
    Host { symbol: String, message: String },
}

pub type ExecResult<T> = Result<T, ExecError>;

/// The runtime the generated code calls into.
pub trait Host {
    fn memory(&self) -> &Memory;
    fn memory_mut(&mut self) -> &mut Memory;
    /// Address of a data symbol.
    fn global_address(&mut self, name: &str) -> ExecResult<u64>;
    /// Call a named external function; the result of a void call is ignored.
    fn call_extern(&mut self, name: &str, args: &[u64]) -> ExecResult<u64>;
    /// Call through a function pointer.
    fn call_pointer(&mut self, addr: u64, args: &[u64]) -> ExecResult<u64>;
}

pub const DEFAULT_STEP_LIMIT: usize = 1_000_000;

/// Narrow a raw word to the representation of `ty`.
fn normalize(ty: Ty, value: u64) -> u64 {
    match ty {
        Ty::I1 => value & 1,
        Ty::I32 => value as u32 as i32 as i64 as u64,
        Ty::I64 | Ty::Ptr => value,
    }
}

pub struct Machine<'m> {
    module: &'m Module,
    step_limit: usize,
    strings: HashMap<StrId, u64>,
    steps: usize,
}

struct Frame<'f> {
    func: &'f Function,
    values: Vec<Option<u64>>,
}

impl Frame<'_> {
    fn get(&self, op: &Operand) -> Option<u64> {
        match op {
            Operand::Value(id) => self.values.get(id.index()).copied().flatten(),
            _ => None,
        }
    }
}

impl<'m> Machine<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            step_limit: DEFAULT_STEP_LIMIT,
            strings: HashMap::new(),
            steps: 0,
        }
    }

    pub fn with_step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    /// Instructions executed by the last `run`.
    pub fn steps(&self) -> usize {
        self.steps
    }

    fn operand(&mut self, host: &mut dyn Host, frame: &Frame<'_>, op: &Operand) -> ExecResult<u64> {
        match op {
            Operand::Value(id) => frame.get(op).ok_or(ExecError::UndefinedValue(id.0)),
            Operand::Const(ty, v) => Ok(normalize(*ty, *v as u64)),
            Operand::Null => Ok(0),
            Operand::Extern(id) => host.global_address(&self.module.extern_decl(*id).name),
            Operand::Str(id) => {
                if let Some(&addr) = self.strings.get(id) {
                    return Ok(addr);
                }
                let addr = host.memory_mut().alloc_cstr(self.module.string(*id));
                self.strings.insert(*id, addr);
                Ok(addr)
            }
        }
    }

    /// Run `name` with the given arguments and return its result word.
    pub fn run(&mut self, host: &mut dyn Host, name: &str, args: &[u64]) -> ExecResult<u64> {
        let func = self
            .module
            .function(name)
            .ok_or_else(|| ExecError::UnknownFunction(name.to_string()))?;
        if func.params.len() != args.len() {
            return Err(ExecError::ArgumentCount {
                expected: func.params.len(),
                given: args.len(),
            });
        }
        self.steps = 0;

        let mut frame = Frame {
            func,
            values: vec![None; func.value_types.len()],
        };
        for (i, (&arg, &ty)) in args.iter().zip(&func.params).enumerate() {
            frame.values[i] = Some(normalize(ty, arg));
        }

        let mut current = BlockId(0);
        let mut previous: Option<BlockId> = None;
        loop {
            let block = frame.func.block(current);
            log::trace!("exec {}: enter {}", func.name, block.name);

            // Phis read the values live at the end of the predecessor.
            let mut phi_values = Vec::new();
            for inst in &block.insts {
                let InstKind::Phi { incoming, .. } = &inst.kind else {
                    break;
                };
                let from = previous.ok_or_else(|| ExecError::MissingPhiEdge {
                    block: block.name.clone(),
                    from: "<entry>".to_string(),
                })?;
                let (value, _) = incoming.iter().find(|(_, b)| *b == from).ok_or_else(|| {
                    ExecError::MissingPhiEdge {
                        block: block.name.clone(),
                        from: frame.func.block(from).name.clone(),
                    }
                })?;
                phi_values.push((inst.result, self.operand(host, &frame, value)?));
            }
            for (result, value) in phi_values {
                if let Some(id) = result {
                    frame.values[id.index()] = Some(value);
                }
            }

            for inst in &block.insts {
                self.steps += 1;
                if self.steps > self.step_limit {
                    return Err(ExecError::StepLimit(self.step_limit));
                }
                let value = match &inst.kind {
                    InstKind::Phi { .. } => continue,
                    InstKind::Alloca { ty } => Some(host.memory_mut().alloc(ty.size().max(8), 8)),
                    InstKind::Load { ty, ptr } => {
                        let addr = self.operand(host, &frame, ptr)?;
                        Some(host.memory().read(addr, *ty)?)
                    }
                    InstKind::Store { value, ptr } => {
                        let ty = self.operand_type(&frame, value);
                        let v = self.operand(host, &frame, value)?;
                        let addr = self.operand(host, &frame, ptr)?;
                        host.memory_mut().write(addr, ty, v)?;
                        None
                    }
                    InstKind::PtrAdd { base, index, scale } => {
                        let base = self.operand(host, &frame, base)?;
                        let index = self.operand(host, &frame, index)? as i64;
                        Some(base.wrapping_add(index.wrapping_mul(*scale as i64) as u64))
                    }
                    InstKind::Binary { op, ty, lhs, rhs } => {
                        let l = self.operand(host, &frame, lhs)? as i64;
                        let r = self.operand(host, &frame, rhs)? as i64;
                        let raw = match op {
                            BinOp::Add => l.wrapping_add(r),
                            BinOp::Sub => l.wrapping_sub(r),
                        };
                        Some(normalize(*ty, raw as u64))
                    }
                    InstKind::Icmp { pred, lhs, rhs } => {
                        let l = self.operand(host, &frame, lhs)?;
                        let r = self.operand(host, &frame, rhs)?;
                        let (sl, sr) = (l as i64, r as i64);
                        let holds = match pred {
                            CmpPred::Eq => l == r,
                            CmpPred::Ne => l != r,
                            CmpPred::Slt => sl < sr,
                            CmpPred::Sle => sl <= sr,
                            CmpPred::Sgt => sl > sr,
                            CmpPred::Sge => sl >= sr,
                            CmpPred::Ult => l < r,
                            CmpPred::Ule => l <= r,
                        };
                        Some(holds as u64)
                    }
                    InstKind::Select {
                        cond,
                        then_value,
                        else_value,
                    } => {
                        let c = self.operand(host, &frame, cond)?;
                        let chosen = if c & 1 == 1 { then_value } else { else_value };
                        Some(self.operand(host, &frame, chosen)?)
                    }
                    InstKind::Call { callee, args } => {
                        let decl = self.module.extern_decl(*callee);
                        let ret = match &decl.kind {
                            ExternKind::Function(sig) => sig.ret,
                            ExternKind::Data => return Err(ExecError::NotCallable(decl.name.clone())),
                        };
                        let mut words = Vec::with_capacity(args.len());
                        for arg in args {
                            words.push(self.operand(host, &frame, arg)?);
                        }
                        let result = host.call_extern(&decl.name, &words)?;
                        ret.map(|ty| normalize(ty, result))
                    }
                    InstKind::CallIndirect { callee, sig, args } => {
                        let target = self.operand(host, &frame, callee)?;
                        let mut words = Vec::with_capacity(args.len());
                        for arg in args {
                            words.push(self.operand(host, &frame, arg)?);
                        }
                        let result = host.call_pointer(target, &words)?;
                        sig.ret.map(|ty| normalize(ty, result))
                    }
                };
                if let (Some(id), Some(v)) = (inst.result, value) {
                    frame.values[id.index()] = Some(v);
                }
            }

            let next = match &block.term {
                None => return Err(ExecError::Unterminated(block.name.clone())),
                Some(Terminator::Unreachable) => return Err(ExecError::Unreachable(block.name.clone())),
                Some(Terminator::Ret(value)) => {
                    let result = self.operand(host, &frame, value)?;
                    log::debug!("exec {}: returned {:#x} after {} steps", func.name, result, self.steps);
                    return Ok(result);
                }
                Some(Terminator::Br(target)) => *target,
                Some(Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                }) => {
                    if self.operand(host, &frame, cond)? & 1 == 1 {
                        *then_block
                    } else {
                        *else_block
                    }
                }
            };
            previous = Some(current);
            current = next;
        }
    }

    fn operand_type(&self, frame: &Frame<'_>, op: &Operand) -> Ty {
        match op {
            Operand::Value(id) => frame.func.value_type(*id).unwrap_or(Ty::Ptr),
            Operand::Const(ty, _) => *ty,
            Operand::Null | Operand::Extern(_) | Operand::Str(_) => Ty::Ptr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IrBuilder, Signature};

    struct NullHost {
        memory: Memory,
        calls: Vec<(String, Vec<u64>)>,
    }

    impl Host for NullHost {
        fn memory(&self) -> &Memory {
            &self.memory
        }
        fn memory_mut(&mut self) -> &mut Memory {
            &mut self.memory
        }
        fn global_address(&mut self, _name: &str) -> ExecResult<u64> {
            Ok(0x10)
        }
        fn call_extern(&mut self, name: &str, args: &[u64]) -> ExecResult<u64> {
            self.calls.push((name.to_string(), args.to_vec()));
            Ok(u32::MAX as u64)
        }
        fn call_pointer(&mut self, _addr: u64, _args: &[u64]) -> ExecResult<u64> {
            Ok(0)
        }
    }

    fn host() -> NullHost {
        NullHost {
            memory: Memory::new(),
            calls: Vec::new(),
        }
    }

    #[test]
    fn test_countdown_loop_with_phi() {
        // Sum 3 + 2 + 1 with a counted loop.
        let module_fn = {
            let mut b = IrBuilder::new("sum", &[Ty::I64], Ty::I64);
            let entry = b.create_block("entry");
            let head = b.create_block("head");
            let body = b.create_block("body");
            let done = b.create_block("done");
            b.position_at_end(entry);
            b.br(head).unwrap();

            b.position_at_end(head);
            let n = b.phi(Ty::I64).unwrap();
            let acc = b.phi(Ty::I64).unwrap();
            b.add_incoming(n, b.param(0), entry).unwrap();
            b.add_incoming(acc, Operand::i64(0), entry).unwrap();
            let stop = b.icmp(CmpPred::Sle, Operand::Value(n), Operand::i64(0)).unwrap();
            b.cond_br(stop, done, body).unwrap();

            b.position_at_end(body);
            let acc2 = b.add(Ty::I64, Operand::Value(acc), Operand::Value(n)).unwrap();
            let n2 = b.sub(Ty::I64, Operand::Value(n), Operand::i64(1)).unwrap();
            b.add_incoming(n, n2, body).unwrap();
            b.add_incoming(acc, acc2, body).unwrap();
            b.br(head).unwrap();

            b.position_at_end(done);
            b.ret(Operand::Value(acc)).unwrap();
            b.finish()
        };
        let mut module = Module::new("m");
        module.add_function(module_fn);

        let mut host = host();
        let mut machine = Machine::new(&module);
        assert_eq!(machine.run(&mut host, "sum", &[3]).unwrap(), 6);
    }

    #[test]
    fn test_i32_call_result_sign_extended() {
        let mut module = Module::new("m");
        let callee = module
            .declare_function("status", Signature::new(&[], Some(Ty::I32)))
            .unwrap();
        let mut b = IrBuilder::new("f", &[], Ty::I64);
        let entry = b.create_block("entry");
        let neg = b.create_block("neg");
        let other = b.create_block("other");
        b.position_at_end(entry);
        let status = b.call(callee, Some(Ty::I32), vec![]).unwrap().unwrap();
        let is_neg = b.icmp(CmpPred::Slt, status, Operand::i32(0)).unwrap();
        b.cond_br(is_neg, neg, other).unwrap();
        b.position_at_end(neg);
        b.ret(Operand::i64(1)).unwrap();
        b.position_at_end(other);
        b.ret(Operand::i64(0)).unwrap();
        module.add_function(b.finish());

        let mut host = host();
        let result = Machine::new(&module).run(&mut host, "f", &[]).unwrap();
        assert_eq!(result, 1);
        assert_eq!(host.calls.len(), 1);
    }

    #[test]
    fn test_step_limit() {
        let mut b = IrBuilder::new("spin", &[], Ty::Ptr);
        let entry = b.create_block("entry");
        b.position_at_end(entry);
        b.alloca(Ty::Ptr).unwrap();
        b.br(entry).unwrap();
        let mut module = Module::new("m");
        module.add_function(b.finish());

        let mut host = host();
        let err = Machine::new(&module)
            .with_step_limit(100)
            .run(&mut host, "spin", &[])
            .unwrap_err();
        assert_eq!(err, ExecError::StepLimit(100));
    }
}
