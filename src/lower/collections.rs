//! Container construction, subscripts, slicing and unpacking.

use super::owned::Owned;
use super::translator::FunctionTranslator;
use crate::bridge::EntryPoint;
use crate::core::TranslateResult;
use crate::ir::{CmpPred, Operand, Ty};

impl FunctionTranslator<'_, '_> {
    /// Allocate a tuple or list of the declared size and fill it from the stack in a
    /// generated loop, highest index first. Item stores steal the popped references.
    pub(super) fn build_sequence(&mut self, ep: EntryPoint) -> TranslateResult<()> {
        let count = self.arg() as i64;
        let seq = self.call_value(ep, vec![Operand::i64(count)])?;
        self.check_result(ep, seq)?;

        let label = if ep == EntryPoint::TupleNew { "BUILD_TUPLE" } else { "BUILD_LIST" };
        let preamble = self.b.current_block()?;
        let loop_start = self.b.create_block(&format!("{}_loop_start", label));
        let body = self.b.create_block(&format!("{}_loop_body", label));
        let end = self.b.create_block(&format!("{}_loop_end", label));
        self.b.br(loop_start)?;

        self.b.position_at_end(loop_start);
        let remaining = self.b.phi(Ty::I64)?;
        self.b.add_incoming(remaining, Operand::i64(count), preamble)?;
        let done = self
            .b
            .icmp(CmpPred::Sle, Operand::Value(remaining), Operand::i64(0))?;
        self.b.cond_br(done, end, body)?;

        self.b.position_at_end(body);
        let item = self.pop()?;
        let index = self.b.sub(Ty::I64, Operand::Value(remaining), Operand::i64(1))?;
        let items = if ep == EntryPoint::TupleNew {
            self.b.field_addr(seq, self.layout.tuple_item)?
        } else {
            self.b.load_field(Ty::Ptr, seq, self.layout.list_item)?
        };
        let slot = self.b.ptradd(items, index, 8)?;
        self.b.store(item.transfer(), slot)?;
        let body_end = self.b.current_block()?;
        self.b.add_incoming(remaining, index, body_end)?;
        self.b.br(loop_start)?;

        self.b.position_at_end(end);
        self.push(Owned::new(seq))
    }

    pub(super) fn build_map(&mut self) -> TranslateResult<()> {
        let hint = Operand::i64(self.arg() as i64);
        self.call_and_push(EntryPoint::DictNewPresized, vec![hint], vec![])
    }

    /// `BUILD_SLICE 2|3`; a missing step is passed as null.
    pub(super) fn build_slice(&mut self) -> TranslateResult<()> {
        let step = if self.arg() == 3 { self.pop()? } else { Owned::absent() };
        let stop = self.pop()?;
        let start = self.pop()?;
        let args = vec![start.operand(), stop.operand(), step.operand()];
        self.call_and_push(EntryPoint::SliceNew, args, vec![start, stop, step])
    }

    /// The dict stays on the stack; key and value are released after the store.
    pub(super) fn store_map(&mut self) -> TranslateResult<()> {
        let key = self.pop()?;
        let value = self.pop()?;
        let dict = self.pop()?;
        let args = vec![dict.operand(), key.operand(), value.operand()];
        self.push(dict)?;
        self.call_and_check(EntryPoint::DictSetItem, args, vec![value, key])
    }

    pub(super) fn list_append(&mut self) -> TranslateResult<()> {
        let item = self.pop()?;
        let list = self.pop()?;
        let args = vec![list.operand(), item.operand()];
        self.call_and_check(EntryPoint::ListAppend, args, vec![list, item])
    }

    pub(super) fn store_subscr(&mut self) -> TranslateResult<()> {
        let key = self.pop()?;
        let container = self.pop()?;
        let value = self.pop()?;
        let args = vec![container.operand(), key.operand(), value.operand()];
        self.call_and_check(EntryPoint::ObjectSetItem, args, vec![value, container, key])
    }

    pub(super) fn delete_subscr(&mut self) -> TranslateResult<()> {
        let key = self.pop()?;
        let container = self.pop()?;
        let args = vec![container.operand(), key.operand()];
        self.call_and_check(EntryPoint::ObjectDelItem, args, vec![container, key])
    }

    fn pop_slice_bounds(&mut self, has_start: bool, has_stop: bool) -> TranslateResult<(Owned, Owned)> {
        let stop = if has_stop { self.pop_nullable()? } else { Owned::absent() };
        let start = if has_start { self.pop_nullable()? } else { Owned::absent() };
        Ok((start, stop))
    }

    /// `SLICE+k`: `seq[start:stop]` with either bound possibly missing.
    pub(super) fn slice(&mut self, has_start: bool, has_stop: bool) -> TranslateResult<()> {
        let (start, stop) = self.pop_slice_bounds(has_start, has_stop)?;
        let seq = self.pop()?;
        let args = vec![seq.operand(), start.operand(), stop.operand()];
        self.call_and_push(EntryPoint::ApplySlice, args, vec![seq, start, stop])
    }

    /// `STORE_SLICE+k` (with a value) and `DELETE_SLICE+k` (value null).
    pub(super) fn assign_slice(&mut self, has_start: bool, has_stop: bool, store: bool) -> TranslateResult<()> {
        let (start, stop) = self.pop_slice_bounds(has_start, has_stop)?;
        let seq = self.pop()?;
        let value = if store { self.pop()? } else { Owned::absent() };
        let args = vec![seq.operand(), start.operand(), stop.operand(), value.operand()];
        self.call_and_check(EntryPoint::AssignSlice, args, vec![seq, start, stop, value])
    }

    /// The helper writes the items downward from `sp + count`, first item on top, and
    /// returns non-zero on success. The stack pointer moves only once it succeeded.
    pub(super) fn unpack_sequence(&mut self) -> TranslateResult<()> {
        let count = self.arg();
        let iterable = self.pop()?;
        let sp = self.b.load(Ty::Ptr, self.slots.sp_addr)?;
        let dst = self.b.ptradd(sp, Operand::i64(count as i64), 8)?;
        let args = vec![iterable.operand(), Operand::i32(count), dst];
        self.call_and_check(EntryPoint::UnpackIterable, args, vec![iterable])?;
        self.b.store(dst, self.slots.sp_addr)
    }
}
