//! Structural and type checks over a finished function.

use super::{ExternKind, Function, InstKind, Module, Operand, Terminator, Ty};
use crate::core::{TranslateError, TranslateResult};

struct Verifier<'a> {
    module: &'a Module,
    func: &'a Function,
}

/// Check that every block is terminated, every branch target exists, phi incoming
/// blocks are predecessors and operand types agree with their uses.
pub fn verify_function(module: &Module, func: &Function) -> TranslateResult<()> {
    let verifier = Verifier { module, func };
    verifier.run()
}

impl Verifier<'_> {
    fn fail<T>(&self, reason: String) -> TranslateResult<T> {
        Err(TranslateError::Verify {
            function: self.func.name.clone(),
            reason,
        })
    }

    fn ty_of(&self, op: &Operand, at: &str) -> TranslateResult<Ty> {
        match op {
            Operand::Value(id) => match self.func.value_type(*id) {
                Some(ty) => Ok(ty),
                None => self.fail(format!("{}: undefined value %{}", at, id.0)),
            },
            Operand::Const(ty, _) => Ok(*ty),
            Operand::Null | Operand::Extern(_) | Operand::Str(_) => Ok(Ty::Ptr),
        }
    }

    fn expect(&self, op: &Operand, want: Ty, at: &str) -> TranslateResult<()> {
        let got = self.ty_of(op, at)?;
        if got != want {
            return self.fail(format!("{}: expected {}, found {}", at, want.name(), got.name()));
        }
        Ok(())
    }

    fn check_block_id(&self, id: &super::BlockId, at: &str) -> TranslateResult<()> {
        if id.index() >= self.func.blocks.len() {
            return self.fail(format!("{}: branch to missing block {}", at, id.0));
        }
        Ok(())
    }

    fn run(&self) -> TranslateResult<()> {
        if self.func.blocks.is_empty() {
            return self.fail("function has no blocks".to_string());
        }
        let preds = self.func.predecessors();

        for (index, block) in self.func.blocks.iter().enumerate() {
            let at = &block.name;
            let mut seen_non_phi = false;

            for inst in &block.insts {
                if let Some(result) = inst.result {
                    if self.func.value_type(result).is_none() {
                        return self.fail(format!("{}: result %{} has no type", at, result.0));
                    }
                }
                match &inst.kind {
                    InstKind::Phi { ty, incoming } => {
                        if seen_non_phi {
                            return self.fail(format!("{}: phi after non-phi", at));
                        }
                        for (value, from) in incoming {
                            self.check_block_id(from, at)?;
                            self.expect(value, *ty, at)?;
                            if !preds[index].contains(from) {
                                return self.fail(format!(
                                    "{}: phi incoming block {} is not a predecessor",
                                    at,
                                    self.func.block(*from).name
                                ));
                            }
                        }
                        for pred in &preds[index] {
                            if !incoming.iter().any(|(_, from)| from == pred) {
                                return self.fail(format!(
                                    "{}: phi lacks an incoming value for {}",
                                    at,
                                    self.func.block(*pred).name
                                ));
                            }
                        }
                        continue;
                    }
                    _ => seen_non_phi = true,
                }

                match &inst.kind {
                    InstKind::Phi { .. } | InstKind::Alloca { .. } => {}
                    InstKind::Load { ptr, .. } => self.expect(ptr, Ty::Ptr, at)?,
                    InstKind::Store { value, ptr } => {
                        self.ty_of(value, at)?;
                        self.expect(ptr, Ty::Ptr, at)?;
                    }
                    InstKind::PtrAdd { base, index, .. } => {
                        self.expect(base, Ty::Ptr, at)?;
                        let ty = self.ty_of(index, at)?;
                        if !matches!(ty, Ty::I32 | Ty::I64) {
                            return self.fail(format!("{}: ptradd index must be i32 or i64", at));
                        }
                    }
                    InstKind::Binary { ty, lhs, rhs, .. } => {
                        if !ty.is_integer() {
                            return self.fail(format!("{}: arithmetic on {}", at, ty.name()));
                        }
                        self.expect(lhs, *ty, at)?;
                        self.expect(rhs, *ty, at)?;
                    }
                    InstKind::Icmp { lhs, rhs, .. } => {
                        let ty = self.ty_of(lhs, at)?;
                        self.expect(rhs, ty, at)?;
                    }
                    InstKind::Select {
                        cond,
                        then_value,
                        else_value,
                    } => {
                        self.expect(cond, Ty::I1, at)?;
                        let ty = self.ty_of(then_value, at)?;
                        self.expect(else_value, ty, at)?;
                    }
                    InstKind::Call { callee, args } => {
                        let decl = self.module.extern_decl(*callee);
                        let sig = match &decl.kind {
                            ExternKind::Function(sig) => sig,
                            ExternKind::Data => {
                                return self.fail(format!("{}: call to data symbol {}", at, decl.name))
                            }
                        };
                        if sig.params.len() != args.len() {
                            return self.fail(format!(
                                "{}: {} takes {} arguments, given {}",
                                at,
                                decl.name,
                                sig.params.len(),
                                args.len()
                            ));
                        }
                        for (arg, want) in args.iter().zip(&sig.params) {
                            self.expect(arg, *want, at)?;
                        }
                        if inst.result.is_some() != sig.ret.is_some() {
                            return self.fail(format!("{}: result of {} mismatches its signature", at, decl.name));
                        }
                    }
                    InstKind::CallIndirect { callee, sig, args } => {
                        self.expect(callee, Ty::Ptr, at)?;
                        if sig.params.len() != args.len() {
                            return self.fail(format!("{}: indirect call arity mismatch", at));
                        }
                        for (arg, want) in args.iter().zip(&sig.params) {
                            self.expect(arg, *want, at)?;
                        }
                    }
                }
            }

            match &block.term {
                None => return self.fail(format!("block {} is not terminated", at)),
                Some(Terminator::Br(target)) => self.check_block_id(target, at)?,
                Some(Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                }) => {
                    self.expect(cond, Ty::I1, at)?;
                    self.check_block_id(then_block, at)?;
                    self.check_block_id(else_block, at)?;
                }
                Some(Terminator::Ret(value)) => self.expect(value, self.func.ret, at)?,
                Some(Terminator::Unreachable) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{CmpPred, IrBuilder, Signature};

    #[test]
    fn test_unterminated_block_rejected() {
        let module = Module::new("m");
        let mut b = IrBuilder::new("f", &[Ty::Ptr], Ty::Ptr);
        let entry = b.create_block("entry");
        b.position_at_end(entry);
        b.load(Ty::Ptr, b.param(0)).unwrap();
        let err = verify_function(&module, &b.finish()).unwrap_err();
        assert!(err.to_string().contains("not terminated"));
    }

    #[test]
    fn test_call_arity_checked() {
        let mut module = Module::new("m");
        let clear = module
            .declare_function("PyErr_Clear", Signature::new(&[], None))
            .unwrap();
        let mut b = IrBuilder::new("f", &[Ty::Ptr], Ty::Ptr);
        let entry = b.create_block("entry");
        b.position_at_end(entry);
        b.call(clear, None, vec![Operand::Null]).unwrap();
        b.ret(Operand::Null).unwrap();
        let err = verify_function(&module, &b.finish()).unwrap_err();
        assert!(err.to_string().contains("takes 0 arguments"));
    }

    #[test]
    fn test_condbr_needs_i1() {
        let module = Module::new("m");
        let mut b = IrBuilder::new("f", &[Ty::Ptr], Ty::Ptr);
        let entry = b.create_block("entry");
        let exit = b.create_block("exit");
        b.position_at_end(entry);
        b.cond_br(Operand::i32(1), exit, exit).unwrap();
        b.position_at_end(exit);
        b.ret(Operand::Null).unwrap();
        assert!(verify_function(&module, &b.finish()).is_err());
    }

    #[test]
    fn test_phi_predecessors() {
        let module = Module::new("m");
        let mut b = IrBuilder::new("f", &[Ty::Ptr], Ty::Ptr);
        let entry = b.create_block("entry");
        let left = b.create_block("left");
        let join = b.create_block("join");

        b.position_at_end(entry);
        let c = b.icmp(CmpPred::Eq, b.param(0), Operand::Null).unwrap();
        b.cond_br(c, left, join).unwrap();
        b.position_at_end(left);
        b.br(join).unwrap();
        b.position_at_end(join);
        let phi = b.phi(Ty::Ptr).unwrap();
        b.add_incoming(phi, Operand::Null, left).unwrap();
        b.ret(Operand::Value(phi)).unwrap();

        // Missing the edge from entry.
        let err = verify_function(&module, &b.finish()).unwrap_err();
        assert!(err.to_string().contains("lacks an incoming value for entry"));
    }
}
