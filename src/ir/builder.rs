//! Basic-block builder.
//!
//! `IrBuilder` owns the function under construction and an insertion point. It enforces
//! the one structural rule the translator relies on: nothing is ever appended to a block
//! that already has a terminator. `fall_through_to` stitches an open block to the next
//! one and is a no-op branch-wise when the current block already ended.

use super::{
    BinOp, Block, BlockId, CmpPred, ExternId, Function, Inst, InstKind, Operand, Signature,
    Terminator, Ty, ValueId,
};
use crate::core::{TranslateError, TranslateResult};
use std::collections::HashMap;

pub struct IrBuilder {
    func: Function,
    current: Option<BlockId>,
    name_counts: HashMap<String, usize>,
}

impl IrBuilder {
    pub fn new(name: &str, params: &[Ty], ret: Ty) -> Self {
        Self {
            func: Function {
                name: name.to_string(),
                params: params.to_vec(),
                ret,
                blocks: Vec::new(),
                value_types: params.to_vec(),
            },
            current: None,
            name_counts: HashMap::new(),
        }
    }

    pub fn param(&self, index: usize) -> Operand {
        Operand::Value(ValueId(index as u32))
    }

    pub fn function(&self) -> &Function {
        &self.func
    }

    pub fn finish(self) -> Function {
        self.func
    }

    /// Append a new, empty block. Duplicate names get a numeric suffix.
    pub fn create_block(&mut self, name: &str) -> BlockId {
        let count = self.name_counts.entry(name.to_string()).or_insert(0);
        let unique = if *count == 0 {
            name.to_string()
        } else {
            format!("{}.{}", name, count)
        };
        *count += 1;

        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(Block {
            name: unique,
            insts: Vec::new(),
            term: None,
        });
        id
    }

    pub fn block_count(&self) -> usize {
        self.func.blocks.len()
    }

    pub fn block_name(&self, id: BlockId) -> &str {
        &self.func.blocks[id.index()].name
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    pub fn current_block(&self) -> TranslateResult<BlockId> {
        self.current.ok_or(TranslateError::NoInsertPoint)
    }

    /// Whether the current block already has a terminator.
    pub fn is_terminated(&self) -> bool {
        match self.current {
            Some(id) => self.func.blocks[id.index()].is_terminated(),
            None => true,
        }
    }

    pub fn is_block_terminated(&self, id: BlockId) -> bool {
        self.func.blocks[id.index()].is_terminated()
    }

    fn open_block(&mut self) -> TranslateResult<&mut Block> {
        let id = self.current_block()?;
        let block = &mut self.func.blocks[id.index()];
        if block.is_terminated() {
            return Err(TranslateError::EmitIntoTerminated {
                block: block.name.clone(),
            });
        }
        Ok(block)
    }

    fn emit(&mut self, kind: InstKind, ty: Option<Ty>) -> TranslateResult<Option<Operand>> {
        self.open_block()?;
        let result = ty.map(|ty| {
            let id = ValueId(self.func.value_types.len() as u32);
            self.func.value_types.push(ty);
            id
        });
        self.open_block()?.insts.push(Inst { result, kind });
        Ok(result.map(Operand::Value))
    }

    fn emit_value(&mut self, kind: InstKind, ty: Ty) -> TranslateResult<Operand> {
        self.emit(kind, Some(ty))?
            .ok_or(TranslateError::NoInsertPoint)
    }

    fn terminate(&mut self, term: Terminator) -> TranslateResult<()> {
        let block = self.open_block()?;
        block.term = Some(term);
        Ok(())
    }

    pub fn alloca(&mut self, ty: Ty) -> TranslateResult<Operand> {
        self.emit_value(InstKind::Alloca { ty }, Ty::Ptr)
    }

    pub fn load(&mut self, ty: Ty, ptr: Operand) -> TranslateResult<Operand> {
        self.emit_value(InstKind::Load { ty, ptr }, ty)
    }

    pub fn store(&mut self, value: Operand, ptr: Operand) -> TranslateResult<()> {
        self.emit(InstKind::Store { value, ptr }, None).map(|_| ())
    }

    pub fn ptradd(&mut self, base: Operand, index: Operand, scale: u64) -> TranslateResult<Operand> {
        self.emit_value(InstKind::PtrAdd { base, index, scale }, Ty::Ptr)
    }

    /// Address of the field `offset` bytes past `base`.
    pub fn field_addr(&mut self, base: Operand, offset: u64) -> TranslateResult<Operand> {
        self.ptradd(base, Operand::i64(offset as i64), 1)
    }

    /// Load a `ty` field at `base + offset`.
    pub fn load_field(&mut self, ty: Ty, base: Operand, offset: u64) -> TranslateResult<Operand> {
        let addr = self.field_addr(base, offset)?;
        self.load(ty, addr)
    }

    pub fn add(&mut self, ty: Ty, lhs: Operand, rhs: Operand) -> TranslateResult<Operand> {
        self.emit_value(
            InstKind::Binary {
                op: BinOp::Add,
                ty,
                lhs,
                rhs,
            },
            ty,
        )
    }

    pub fn sub(&mut self, ty: Ty, lhs: Operand, rhs: Operand) -> TranslateResult<Operand> {
        self.emit_value(
            InstKind::Binary {
                op: BinOp::Sub,
                ty,
                lhs,
                rhs,
            },
            ty,
        )
    }

    pub fn icmp(&mut self, pred: CmpPred, lhs: Operand, rhs: Operand) -> TranslateResult<Operand> {
        self.emit_value(InstKind::Icmp { pred, lhs, rhs }, Ty::I1)
    }

    pub fn is_null(&mut self, value: Operand) -> TranslateResult<Operand> {
        self.icmp(CmpPred::Eq, value, Operand::Null)
    }

    pub fn select(
        &mut self,
        ty: Ty,
        cond: Operand,
        then_value: Operand,
        else_value: Operand,
    ) -> TranslateResult<Operand> {
        self.emit_value(
            InstKind::Select {
                cond,
                then_value,
                else_value,
            },
            ty,
        )
    }

    /// Direct call; returns the result operand unless `ret` is void.
    pub fn call(
        &mut self,
        callee: ExternId,
        ret: Option<Ty>,
        args: Vec<Operand>,
    ) -> TranslateResult<Option<Operand>> {
        self.emit(InstKind::Call { callee, args }, ret)
    }

    pub fn call_indirect(
        &mut self,
        callee: Operand,
        sig: Signature,
        args: Vec<Operand>,
    ) -> TranslateResult<Option<Operand>> {
        let ret = sig.ret;
        self.emit(InstKind::CallIndirect { callee, sig, args }, ret)
    }

    /// Start a phi in the current block; it must precede all other instructions.
    pub fn phi(&mut self, ty: Ty) -> TranslateResult<ValueId> {
        let block = self.open_block()?;
        if block
            .insts
            .iter()
            .any(|inst| !matches!(inst.kind, InstKind::Phi { .. }))
        {
            let name = block.name.clone();
            return Err(TranslateError::Verify {
                function: self.func.name.clone(),
                reason: format!("phi after non-phi instruction in block {}", name),
            });
        }
        let value = self.emit_value(
            InstKind::Phi {
                ty,
                incoming: Vec::new(),
            },
            ty,
        )?;
        match value {
            Operand::Value(id) => Ok(id),
            _ => Err(TranslateError::NoInsertPoint),
        }
    }

    pub fn add_incoming(&mut self, phi: ValueId, value: Operand, from: BlockId) -> TranslateResult<()> {
        for block in &mut self.func.blocks {
            for inst in &mut block.insts {
                if inst.result == Some(phi) {
                    if let InstKind::Phi { incoming, .. } = &mut inst.kind {
                        incoming.push((value, from));
                        return Ok(());
                    }
                }
            }
        }
        Err(TranslateError::Verify {
            function: self.func.name.clone(),
            reason: format!("value %{} is not a phi", phi.0),
        })
    }

    pub fn br(&mut self, target: BlockId) -> TranslateResult<()> {
        self.terminate(Terminator::Br(target))
    }

    pub fn cond_br(&mut self, cond: Operand, then_block: BlockId, else_block: BlockId) -> TranslateResult<()> {
        self.terminate(Terminator::CondBr {
            cond,
            then_block,
            else_block,
        })
    }

    pub fn ret(&mut self, value: Operand) -> TranslateResult<()> {
        self.terminate(Terminator::Ret(value))
    }

    pub fn unreachable(&mut self) -> TranslateResult<()> {
        self.terminate(Terminator::Unreachable)
    }

    /// Branch to `next` if the current block is still open, then continue in `next`.
    pub fn fall_through_to(&mut self, next: BlockId) -> TranslateResult<()> {
        if !self.is_terminated() {
            self.br(next)?;
        }
        self.position_at_end(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_into_terminated_block() {
        let mut b = IrBuilder::new("f", &[Ty::Ptr], Ty::Ptr);
        let entry = b.create_block("entry");
        b.position_at_end(entry);
        b.ret(Operand::Null).unwrap();

        let err = b.load(Ty::Ptr, b.param(0)).unwrap_err();
        assert_eq!(
            err,
            TranslateError::EmitIntoTerminated {
                block: "entry".to_string()
            }
        );
        // The failed emission must not leak a value number.
        assert_eq!(b.function().value_types.len(), 1);
    }

    #[test]
    fn test_fall_through_only_branches_when_open() {
        let mut b = IrBuilder::new("f", &[Ty::Ptr], Ty::Ptr);
        let entry = b.create_block("entry");
        let next = b.create_block("next");
        let last = b.create_block("last");

        b.position_at_end(entry);
        b.fall_through_to(next).unwrap();
        assert_eq!(b.function().block(entry).term, Some(Terminator::Br(next)));

        b.br(last).unwrap();
        b.fall_through_to(last).unwrap();
        assert_eq!(b.function().block(next).term, Some(Terminator::Br(last)));
        assert_eq!(b.current_block().unwrap(), last);
        assert!(!b.is_terminated());
    }

    #[test]
    fn test_block_names_are_unique() {
        let mut b = IrBuilder::new("f", &[], Ty::Ptr);
        let a = b.create_block("decref");
        let c = b.create_block("decref");
        let d = b.create_block("decref");
        assert_eq!(b.block_name(a), "decref");
        assert_eq!(b.block_name(c), "decref.1");
        assert_eq!(b.block_name(d), "decref.2");
    }

    #[test]
    fn test_phi_incoming() {
        let mut b = IrBuilder::new("f", &[], Ty::I64);
        let entry = b.create_block("entry");
        let head = b.create_block("head");
        b.position_at_end(entry);
        b.br(head).unwrap();
        b.position_at_end(head);
        let phi = b.phi(Ty::I64).unwrap();
        b.add_incoming(phi, Operand::i64(3), entry).unwrap();
        b.ret(Operand::Value(phi)).unwrap();

        let func = b.finish();
        match &func.block(head).insts[0].kind {
            InstKind::Phi { incoming, .. } => assert_eq!(incoming, &vec![(Operand::i64(3), entry)]),
            other => panic!("expected phi, got {:?}", other),
        }
    }
}
