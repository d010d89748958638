//! Control transfer: truth tests, conditional jumps, iteration, calls, return and raise.

use super::owned::Owned;
use super::translator::FunctionTranslator;
use crate::bridge::{EntryPoint, HostGlobal};
use crate::core::TranslateResult;
use crate::ir::{CmpPred, Operand, Signature, Ty};

impl FunctionTranslator<'_, '_> {
    /// Truth test of `value`, yielding an `i1`. The singletons are recognized without a
    /// call. A popped value passed as `owned` is released on the failure path; a peeked
    /// one is still on the stack there and the exit block drains it.
    pub(super) fn is_true(&mut self, value: Operand, owned: Option<Owned>) -> TranslateResult<Operand> {
        let true_obj = self.global(HostGlobal::TrueStruct)?;
        let false_obj = self.global(HostGlobal::ZeroStruct)?;

        let entry = self.b.current_block()?;
        let not_true = self.b.create_block("IsTrue_not_true");
        let call_block = self.b.create_block("IsTrue_call");
        let end = self.b.create_block("IsTrue_end");

        let is_true_obj = self.b.icmp(CmpPred::Eq, value, true_obj)?;
        self.b.cond_br(is_true_obj, end, not_true)?;

        self.b.position_at_end(not_true);
        let is_false_obj = self.b.icmp(CmpPred::Eq, value, false_obj)?;
        self.b.cond_br(is_false_obj, end, call_block)?;

        self.b.position_at_end(call_block);
        let result = self.call_value(EntryPoint::ObjectIsTrue, vec![value])?;
        self.check_result_with(EntryPoint::ObjectIsTrue, result, move |t| match owned {
            Some(value) => t.release(value),
            None => Ok(()),
        })?;
        let nonzero = self.b.icmp(CmpPred::Sgt, result, Operand::i32(0))?;
        let success = self.b.current_block()?;
        self.b.br(end)?;

        self.b.position_at_end(end);
        let phi = self.b.phi(Ty::I1)?;
        self.b.add_incoming(phi, Operand::i1(true), entry)?;
        self.b.add_incoming(phi, Operand::i1(false), not_true)?;
        self.b.add_incoming(phi, nonzero, success)?;
        Ok(Operand::Value(phi))
    }

    pub(super) fn pop_jump_if(&mut self, jump_when: bool) -> TranslateResult<()> {
        let value = self.pop()?;
        let (on_failure, keep) = value.diverge();
        let truth = self.is_true(keep.operand(), Some(on_failure))?;
        self.release(keep)?;

        let target = self.target_block()?;
        let next = self.next_block();
        if jump_when {
            self.b.cond_br(truth, target, next)
        } else {
            self.b.cond_br(truth, next, target)
        }
    }

    /// Jump with the tested value still on the stack, or pop it and fall through.
    pub(super) fn jump_if_or_pop(&mut self, jump_when: bool) -> TranslateResult<()> {
        let value = self.peek(1)?;
        let truth = self.is_true(value, None)?;

        let target = self.target_block()?;
        let next = self.next_block();
        let pop_block = self.b.create_block(if jump_when {
            "JUMP_IF_TRUE_OR_POP_pop"
        } else {
            "JUMP_IF_FALSE_OR_POP_pop"
        });
        if jump_when {
            self.b.cond_br(truth, target, pop_block)?;
        } else {
            self.b.cond_br(truth, pop_block, target)?;
        }

        self.b.position_at_end(pop_block);
        let value = self.pop()?;
        self.release(value)?;
        self.b.br(next)
    }

    pub(super) fn get_iter(&mut self) -> TranslateResult<()> {
        let object = self.pop()?;
        self.call_and_push(EntryPoint::ObjectGetIter, vec![object.operand()], vec![object])
    }

    /// Call the iterator's `tp_iternext` slot. Null with no pending error, or with a
    /// pending StopIteration, ends the loop; any other pending error propagates.
    pub(super) fn for_iter(&mut self) -> TranslateResult<()> {
        let iter = self.pop()?;
        let iter_op = iter.operand();
        let ty = self.b.load_field(Ty::Ptr, iter_op, self.layout.ob_type)?;
        let iternext = self.b.load_field(Ty::Ptr, ty, self.layout.tp_iternext)?;
        let next = self
            .b
            .call_indirect(iternext, Signature::new(&[Ty::Ptr], Some(Ty::Ptr)), vec![iter_op])?
            .unwrap_or(Operand::Null);

        let got_null = self.b.create_block("FOR_ITER_null");
        let check_stop = self.b.create_block("FOR_ITER_check_stop");
        let clear_err = self.b.create_block("FOR_ITER_clear_err");
        let propagate = self.b.create_block("FOR_ITER_propagate");
        let iter_ended = self.b.create_block("FOR_ITER_ended");
        let got_next = self.b.create_block("FOR_ITER_got_next");
        let is_null = self.b.is_null(next)?;
        self.b.cond_br(is_null, got_null, got_next)?;

        let (for_error, rest) = iter.diverge();
        let (for_exit, for_loop) = rest.diverge();

        self.b.position_at_end(got_null);
        let pending = self.call_value(EntryPoint::ErrOccurred, vec![])?;
        let no_error = self.b.is_null(pending)?;
        self.b.cond_br(no_error, iter_ended, check_stop)?;

        self.b.position_at_end(check_stop);
        let stop_addr = self.global(HostGlobal::StopIteration)?;
        let stop_type = self.b.load(Ty::Ptr, stop_addr)?;
        let matches = self.call_value(EntryPoint::ErrExceptionMatches, vec![stop_type])?;
        let is_stop = self.b.icmp(CmpPred::Ne, matches, Operand::i32(0))?;
        self.b.cond_br(is_stop, clear_err, propagate)?;

        self.b.position_at_end(clear_err);
        self.call(EntryPoint::ErrClear, vec![])?;
        self.b.br(iter_ended)?;

        self.b.position_at_end(propagate);
        self.release(for_error)?;
        self.return_null()?;

        self.b.position_at_end(iter_ended);
        self.release(for_exit)?;
        let exit = self.target_block()?;
        self.b.br(exit)?;

        self.b.position_at_end(got_next);
        self.push(for_loop)?;
        self.push(Owned::new(next))
    }

    pub(super) fn return_value(&mut self) -> TranslateResult<()> {
        let value = self.pop()?;
        self.b.store(value.transfer(), self.slots.retval_addr)?;
        let exit = self.return_block();
        self.b.br(exit)
    }

    /// `_PyEval_DoRaise` steals all three references; missing ones are null.
    pub(super) fn raise_varargs(&mut self) -> TranslateResult<()> {
        let count = self.arg_index();
        let traceback = if count >= 3 { self.pop()? } else { Owned::absent() };
        let instance = if count >= 2 { self.pop()? } else { Owned::absent() };
        let exc_type = if count >= 1 { self.pop()? } else { Owned::absent() };

        self.call(
            EntryPoint::DoRaise,
            vec![exc_type.transfer(), instance.transfer(), traceback.transfer()],
        )?;
        self.return_null()
    }

    /// The helper pops the callable and its arguments through the stack-pointer slot.
    pub(super) fn call_function(&mut self) -> TranslateResult<()> {
        let oparg = Operand::i32(self.arg());
        let sp_addr = self.slots.sp_addr;
        self.call_and_push(EntryPoint::CallFunction, vec![sp_addr, oparg], vec![])
    }

    /// The helper pops its operands and pushes the result itself.
    pub(super) fn call_function_var_kw(&mut self) -> TranslateResult<()> {
        let oparg = Operand::i32(self.arg());
        let sp_addr = self.slots.sp_addr;
        self.call_and_check(EntryPoint::CallFunctionVarKw, vec![sp_addr, oparg], vec![])
    }
}
