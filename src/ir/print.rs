//! Deterministic textual form of the IR.
//!
//! ```text
//! declare ptr @PyNumber_Add(ptr, ptr)
//! extern @_Py_NoneStruct
//! string $0 = "add"
//!
//! define ptr @add(ptr %0) {
//! entry:
//!   %1 = alloca ptr
//!   ...
//! }
//! ```

use super::{ExternKind, Function, Inst, InstKind, Module, Operand, Terminator};
use std::fmt::{self, Write};

impl Module {
    pub fn print(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = write_module(&mut out, self);
        out
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_module(f, self)
    }
}

pub fn print_function(module: &Module, func: &Function) -> String {
    let mut out = String::new();
    let _ = write_function(&mut out, module, func);
    out
}

fn write_module(out: &mut impl Write, module: &Module) -> fmt::Result {
    writeln!(out, "; module {}", module.name)?;
    for decl in module.externs() {
        match &decl.kind {
            ExternKind::Function(sig) => {
                let ret = sig.ret.map(|t| t.name()).unwrap_or("void");
                let params: Vec<&str> = sig.params.iter().map(|t| t.name()).collect();
                writeln!(out, "declare {} @{}({})", ret, decl.name, params.join(", "))?;
            }
            ExternKind::Data => writeln!(out, "extern @{}", decl.name)?,
        }
    }
    for (i, s) in module.strings().iter().enumerate() {
        writeln!(out, "string ${} = {:?}", i, s)?;
    }
    for func in module.functions() {
        writeln!(out)?;
        write_function(out, module, func)?;
    }
    Ok(())
}

fn write_function(out: &mut impl Write, module: &Module, func: &Function) -> fmt::Result {
    let params: Vec<String> = func
        .params
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{} %{}", t.name(), i))
        .collect();
    writeln!(out, "define {} @{}({}) {{", func.ret.name(), func.name, params.join(", "))?;
    for block in &func.blocks {
        writeln!(out, "{}:", block.name)?;
        for inst in &block.insts {
            write!(out, "  ")?;
            write_inst(out, module, func, inst)?;
            writeln!(out)?;
        }
        write!(out, "  ")?;
        match &block.term {
            Some(term) => write_term(out, module, func, term)?,
            None => write!(out, "<unterminated>")?,
        }
        writeln!(out)?;
    }
    writeln!(out, "}}")
}

fn operand(module: &Module, func: &Function, op: &Operand) -> String {
    match op {
        Operand::Value(id) if id.index() < func.value_types.len() => format!("%{}", id.0),
        Operand::Value(id) => format!("%{}<undef>", id.0),
        Operand::Const(ty, v) => format!("{} {}", ty.name(), v),
        Operand::Null => "null".to_string(),
        Operand::Extern(id) => format!("@{}", module.extern_decl(*id).name),
        Operand::Str(id) => format!("${}", id.0),
    }
}

fn operands(module: &Module, func: &Function, ops: &[Operand]) -> String {
    ops.iter()
        .map(|op| operand(module, func, op))
        .collect::<Vec<_>>()
        .join(", ")
}

fn block_label(func: &Function, id: &super::BlockId) -> String {
    func.blocks
        .get(id.index())
        .map(|b| b.name.clone())
        .unwrap_or_else(|| format!("<bad block {}>", id.0))
}

fn write_inst(out: &mut impl Write, module: &Module, func: &Function, inst: &Inst) -> fmt::Result {
    if let Some(result) = inst.result {
        write!(out, "%{} = ", result.0)?;
    }
    let op = |o: &Operand| operand(module, func, o);
    match &inst.kind {
        InstKind::Alloca { ty } => write!(out, "alloca {}", ty.name()),
        InstKind::Load { ty, ptr } => write!(out, "load {}, {}", ty.name(), op(ptr)),
        InstKind::Store { value, ptr } => write!(out, "store {}, {}", op(value), op(ptr)),
        InstKind::PtrAdd { base, index, scale } => {
            write!(out, "ptradd {}, {} x {}", op(base), op(index), scale)
        }
        InstKind::Binary { op: bin, ty, lhs, rhs } => {
            let name = match bin {
                super::BinOp::Add => "add",
                super::BinOp::Sub => "sub",
            };
            write!(out, "{} {} {}, {}", name, ty.name(), op(lhs), op(rhs))
        }
        InstKind::Icmp { pred, lhs, rhs } => {
            write!(out, "icmp {} {}, {}", pred.name(), op(lhs), op(rhs))
        }
        InstKind::Select {
            cond,
            then_value,
            else_value,
        } => write!(out, "select {}, {}, {}", op(cond), op(then_value), op(else_value)),
        InstKind::Call { callee, args } => {
            let decl = module.extern_decl(*callee);
            let ret = match &decl.kind {
                ExternKind::Function(sig) => sig.ret.map(|t| t.name()).unwrap_or("void"),
                ExternKind::Data => "?",
            };
            write!(out, "call {} @{}({})", ret, decl.name, operands(module, func, args))
        }
        InstKind::CallIndirect { callee, sig, args } => {
            let ret = sig.ret.map(|t| t.name()).unwrap_or("void");
            write!(out, "call_indirect {} {}({})", ret, op(callee), operands(module, func, args))
        }
        InstKind::Phi { ty, incoming } => {
            let arms: Vec<String> = incoming
                .iter()
                .map(|(v, b)| format!("[{}, {}]", op(v), block_label(func, b)))
                .collect();
            write!(out, "phi {} {}", ty.name(), arms.join(", "))
        }
    }
}

fn write_term(out: &mut impl Write, module: &Module, func: &Function, term: &Terminator) -> fmt::Result {
    match term {
        Terminator::Br(target) => write!(out, "br {}", block_label(func, target)),
        Terminator::CondBr {
            cond,
            then_block,
            else_block,
        } => write!(
            out,
            "condbr {}, {}, {}",
            operand(module, func, cond),
            block_label(func, then_block),
            block_label(func, else_block)
        ),
        Terminator::Ret(value) => write!(out, "ret {}", operand(module, func, value)),
        Terminator::Unreachable => write!(out, "unreachable"),
    }
}
