//! Unary, binary and comparison operators.

use super::opcode::CmpOp;
use super::owned::Owned;
use super::translator::FunctionTranslator;
use crate::bridge::{EntryPoint, HostGlobal};
use crate::core::{TranslateError, TranslateResult};
use crate::ir::{CmpPred, Operand, Ty};

impl FunctionTranslator<'_, '_> {
    /// Pop rhs then lhs, call `ep`, release both, push the result.
    pub(super) fn binary(&mut self, ep: EntryPoint) -> TranslateResult<()> {
        let rhs = self.pop()?;
        let lhs = self.pop()?;
        let mut args = vec![lhs.operand(), rhs.operand()];
        if matches!(ep, EntryPoint::NumberPower | EntryPoint::NumberInPlacePower) {
            args.push(self.global(HostGlobal::NoneStruct)?);
        }
        self.call_and_push(ep, args, vec![lhs, rhs])
    }

    pub(super) fn unary(&mut self, ep: EntryPoint) -> TranslateResult<()> {
        let value = self.pop()?;
        self.call_and_push(ep, vec![value.operand()], vec![value])
    }

    /// Push `True` when `cond` holds, `False` otherwise.
    fn push_bool(&mut self, cond: Operand) -> TranslateResult<()> {
        let true_obj = self.global(HostGlobal::TrueStruct)?;
        let false_obj = self.global(HostGlobal::ZeroStruct)?;
        let result = self.b.select(Ty::Ptr, cond, true_obj, false_obj)?;
        self.incref(result)?;
        self.push(Owned::new(result))
    }

    pub(super) fn unary_not(&mut self) -> TranslateResult<()> {
        let value = self.pop()?;
        let status = self.call_value(EntryPoint::ObjectIsTrue, vec![value.operand()])?;
        self.release(value)?;
        self.check_result(EntryPoint::ObjectIsTrue, status)?;
        let is_false = self.b.icmp(CmpPred::Eq, status, Operand::i32(0))?;
        self.push_bool(is_false)
    }

    pub(super) fn compare_op(&mut self) -> TranslateResult<()> {
        let arg = self.arg();
        let op = CmpOp::from_arg(arg).ok_or_else(|| TranslateError::BadOperand {
            opcode: "COMPARE_OP",
            offset: self.offset,
            reason: format!("unknown comparison {}", arg),
        })?;
        let rhs = self.pop()?;
        let lhs = self.pop()?;

        match op {
            CmpOp::Is | CmpOp::IsNot => {
                let pred = if op == CmpOp::Is { CmpPred::Eq } else { CmpPred::Ne };
                let cond = self.b.icmp(pred, lhs.operand(), rhs.operand())?;
                self.release_all(vec![lhs, rhs])?;
                self.push_bool(cond)
            }
            CmpOp::In | CmpOp::NotIn => {
                let ep = EntryPoint::SequenceContains;
                let status = self.call_value(ep, vec![rhs.operand(), lhs.operand()])?;
                self.release_all(vec![lhs, rhs])?;
                self.check_result(ep, status)?;
                let pred = if op == CmpOp::In { CmpPred::Ne } else { CmpPred::Eq };
                let cond = self.b.icmp(pred, status, Operand::i32(0))?;
                self.push_bool(cond)
            }
            CmpOp::ExcMatch => {
                let ep = EntryPoint::CheckedExceptionMatches;
                let status = self.call_value(ep, vec![lhs.operand(), rhs.operand()])?;
                self.release_all(vec![lhs, rhs])?;
                self.check_result(ep, status)?;
                let cond = self.b.icmp(CmpPred::Ne, status, Operand::i32(0))?;
                self.push_bool(cond)
            }
            CmpOp::Lt | CmpOp::Le | CmpOp::Eq | CmpOp::Ne | CmpOp::Gt | CmpOp::Ge => {
                let args = vec![lhs.operand(), rhs.operand(), Operand::i32(arg)];
                self.call_and_push(EntryPoint::ObjectRichCompare, args, vec![lhs, rhs])
            }
        }
    }
}
