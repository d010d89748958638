// This module defines the control-flow-graph IR produced by the translator. Values are
// in SSA form and typed with a deliberately small set of machine types (i1, i32, i64 and
// an untyped pointer); everything the host runtime owns is reached through pointer
// arithmetic on a base address plus a layout offset. A Function is a list of basic
// blocks, each a straight-line instruction list closed by exactly one terminator. A
// Module owns the functions together with the external declarations they reference: bridge
// entry points and host globals are declared once per module under their symbol name,
// which makes the module the per-compilation-unit partition of the entry-point cache.
// Interned C strings (used for diagnostics) are also module-owned. The builder, printer
// and verifier live in the submodules.

//! CFG intermediate representation.

pub mod builder;
pub mod print;
pub mod verify;

pub use builder::IrBuilder;
pub use verify::verify_function;

use crate::core::{TranslateError, TranslateResult};
use std::collections::HashMap;

/// Machine-level value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ty {
    I1,
    I32,
    I64,
    Ptr,
}

impl Ty {
    /// Bytes occupied in memory.
    pub const fn size(self) -> u64 {
        match self {
            Ty::I1 => 1,
            Ty::I32 => 4,
            Ty::I64 | Ty::Ptr => 8,
        }
    }

    pub const fn is_integer(self) -> bool {
        !matches!(self, Ty::Ptr)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Ty::I1 => "i1",
            Ty::I32 => "i32",
            Ty::I64 => "i64",
            Ty::Ptr => "ptr",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl ValueId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Value(ValueId),
    Const(Ty, i64),
    /// The null pointer.
    Null,
    /// Address of an external symbol.
    Extern(ExternId),
    /// Address of an interned NUL-terminated string.
    Str(StrId),
}

impl Operand {
    pub const fn i1(v: bool) -> Self {
        Operand::Const(Ty::I1, v as i64)
    }

    pub const fn i32(v: i32) -> Self {
        Operand::Const(Ty::I32, v as i64)
    }

    pub const fn i64(v: i64) -> Self {
        Operand::Const(Ty::I64, v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpPred {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
}

impl CmpPred {
    pub const fn name(self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Slt => "slt",
            CmpPred::Sle => "sle",
            CmpPred::Sgt => "sgt",
            CmpPred::Sge => "sge",
            CmpPred::Ult => "ult",
            CmpPred::Ule => "ule",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
}

/// Call signature; `ret == None` is a void call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub params: Vec<Ty>,
    pub ret: Option<Ty>,
}

impl Signature {
    pub fn new(params: &[Ty], ret: Option<Ty>) -> Self {
        Self {
            params: params.to_vec(),
            ret,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    /// One stack slot of `ty`; yields its address.
    Alloca { ty: Ty },
    Load { ty: Ty, ptr: Operand },
    Store { value: Operand, ptr: Operand },
    /// `base + index * scale`, index sign-extended.
    PtrAdd {
        base: Operand,
        index: Operand,
        scale: u64,
    },
    Binary {
        op: BinOp,
        ty: Ty,
        lhs: Operand,
        rhs: Operand,
    },
    Icmp {
        pred: CmpPred,
        lhs: Operand,
        rhs: Operand,
    },
    Select {
        cond: Operand,
        then_value: Operand,
        else_value: Operand,
    },
    Call { callee: ExternId, args: Vec<Operand> },
    CallIndirect {
        callee: Operand,
        sig: Signature,
        args: Vec<Operand>,
    },
    Phi {
        ty: Ty,
        incoming: Vec<(Operand, BlockId)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Operand,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret(Operand),
    Unreachable,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(target) => vec![*target],
            Terminator::CondBr {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Ret(_) | Terminator::Unreachable => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
    pub term: Option<Terminator>,
}

impl Block {
    pub fn is_terminated(&self) -> bool {
        self.term.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    pub name: String,
    /// Parameter values are `ValueId(0..params.len())`.
    pub params: Vec<Ty>,
    pub ret: Ty,
    pub blocks: Vec<Block>,
    /// Type of every value, indexed by `ValueId`.
    pub value_types: Vec<Ty>,
}

impl Function {
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_named(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .map(|i| BlockId(i as u32))
    }

    pub fn value_type(&self, id: ValueId) -> Option<Ty> {
        self.value_types.get(id.index()).copied()
    }

    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    /// Predecessor lists, indexed by block.
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (i, block) in self.blocks.iter().enumerate() {
            if let Some(term) = &block.term {
                for succ in term.successors() {
                    if let Some(list) = preds.get_mut(succ.index()) {
                        if !list.contains(&BlockId(i as u32)) {
                            list.push(BlockId(i as u32));
                        }
                    }
                }
            }
        }
        preds
    }

    /// Names of all external functions called directly.
    pub fn called_externs(&self, module: &Module) -> Vec<String> {
        let mut names = Vec::new();
        for block in &self.blocks {
            for inst in &block.insts {
                if let InstKind::Call { callee, .. } = &inst.kind {
                    let name = &module.extern_decl(*callee).name;
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
            }
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternKind {
    Function(Signature),
    /// A data symbol; the operand is its address.
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternDecl {
    pub name: String,
    pub kind: ExternKind,
}

/// A translation unit: functions plus the symbols they reference.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    externs: Vec<ExternDecl>,
    extern_index: HashMap<String, ExternId>,
    strings: Vec<String>,
    string_index: HashMap<String, StrId>,
    functions: Vec<Function>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Declare (or look up) an external function.
    pub fn declare_function(&mut self, name: &str, sig: Signature) -> TranslateResult<ExternId> {
        self.declare(name, ExternKind::Function(sig))
    }

    /// Declare (or look up) an external data symbol.
    pub fn declare_data(&mut self, name: &str) -> TranslateResult<ExternId> {
        self.declare(name, ExternKind::Data)
    }

    fn declare(&mut self, name: &str, kind: ExternKind) -> TranslateResult<ExternId> {
        if let Some(&id) = self.extern_index.get(name) {
            if self.externs[id.0 as usize].kind != kind {
                return Err(TranslateError::ExternConflict {
                    name: name.to_string(),
                });
            }
            return Ok(id);
        }

        let id = ExternId(self.externs.len() as u32);
        log::debug!("module {}: declaring extern {}", self.name, name);
        self.externs.push(ExternDecl {
            name: name.to_string(),
            kind,
        });
        self.extern_index.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn extern_decl(&self, id: ExternId) -> &ExternDecl {
        &self.externs[id.0 as usize]
    }

    pub fn externs(&self) -> &[ExternDecl] {
        &self.externs
    }

    pub fn lookup_extern(&self, name: &str) -> Option<ExternId> {
        self.extern_index.get(name).copied()
    }

    pub fn intern_str(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.string_index.get(s) {
            return id;
        }
        let id = StrId(self.strings.len() as u32);
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), id);
        id
    }

    pub fn string(&self, id: StrId) -> &str {
        &self.strings[id.0 as usize]
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn add_function(&mut self, function: Function) -> usize {
        self.functions.push(function);
        self.functions.len() - 1
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extern_dedup() {
        let mut module = Module::new("m");
        let sig = Signature::new(&[Ty::Ptr, Ty::Ptr], Some(Ty::Ptr));
        let a = module.declare_function("PyNumber_Add", sig.clone()).unwrap();
        let b = module.declare_function("PyNumber_Add", sig).unwrap();
        assert_eq!(a, b);
        assert_eq!(module.externs().len(), 1);

        let conflict = module.declare_data("PyNumber_Add");
        assert!(matches!(conflict, Err(TranslateError::ExternConflict { .. })));
    }

    #[test]
    fn test_string_interning() {
        let mut module = Module::new("m");
        let a = module.intern_str("f");
        let b = module.intern_str("f");
        let c = module.intern_str("g");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(module.string(c), "g");
    }
}
