//! Constants, locals, cells, globals and attributes.

use super::owned::Owned;
use super::translator::FunctionTranslator;
use crate::bridge::EntryPoint;
use crate::core::TranslateResult;
use crate::ir::{Operand, Ty};

impl FunctionTranslator<'_, '_> {
    fn name_operand(&mut self) -> TranslateResult<Operand> {
        let index = Operand::i64(self.arg_index() as i64);
        let addr = self.b.ptradd(self.slots.names, index, 8)?;
        self.b.load(Ty::Ptr, addr)
    }

    pub(super) fn load_const(&mut self) -> TranslateResult<()> {
        let index = Operand::i64(self.arg_index() as i64);
        let addr = self.b.ptradd(self.slots.consts, index, 8)?;
        let value = self.b.load(Ty::Ptr, addr)?;
        self.incref(value)?;
        self.push(Owned::new(value))
    }

    pub(super) fn load_fast(&mut self) -> TranslateResult<()> {
        let index = self.arg_index();
        let addr = self.local_addr(index)?;
        let value = self.b.load(Ty::Ptr, addr)?;

        let unbound = self.b.create_block("LOAD_FAST_unbound");
        let bound = self.b.create_block("LOAD_FAST_bound");
        let is_null = self.b.is_null(value)?;
        self.b.cond_br(is_null, unbound, bound)?;

        self.b.position_at_end(unbound);
        let frame = self.slots.frame;
        self.call(
            EntryPoint::RaiseForUnboundLocal,
            vec![frame, Operand::i32(index as i32)],
        )?;
        self.return_null()?;

        self.b.position_at_end(bound);
        self.incref(value)?;
        self.push(Owned::new(value))
    }

    pub(super) fn store_fast(&mut self) -> TranslateResult<()> {
        let value = self.pop()?;
        let index = self.arg_index();
        self.set_local(index, value)
    }

    pub(super) fn load_closure(&mut self) -> TranslateResult<()> {
        let index = self.arg_index();
        let addr = self.cell_addr(index)?;
        let cell = self.b.load(Ty::Ptr, addr)?;
        self.incref(cell)?;
        self.push(Owned::new(cell))
    }

    /// `PyCell_Get` returns a new reference, or null both for an empty cell and on
    /// error; the pending-error state tells them apart.
    pub(super) fn load_deref(&mut self) -> TranslateResult<()> {
        let index = self.arg_index();
        let addr = self.cell_addr(index)?;
        let cell = self.b.load(Ty::Ptr, addr)?;
        let value = self.call_value(EntryPoint::CellGet, vec![cell])?;

        let null = self.b.create_block("LOAD_DEREF_null");
        let unbound = self.b.create_block("LOAD_DEREF_unbound");
        let failed = self.b.create_block("LOAD_DEREF_error");
        let got = self.b.create_block("LOAD_DEREF_got");
        let is_null = self.b.is_null(value)?;
        self.b.cond_br(is_null, null, got)?;

        self.b.position_at_end(null);
        let pending = self.call_value(EntryPoint::ErrOccurred, vec![])?;
        let no_error = self.b.is_null(pending)?;
        self.b.cond_br(no_error, unbound, failed)?;

        self.b.position_at_end(unbound);
        let frame = self.slots.frame;
        self.call(
            EntryPoint::RaiseForUnboundFreeVar,
            vec![frame, Operand::i32(index as i32)],
        )?;
        self.return_null()?;

        self.b.position_at_end(failed);
        self.return_null()?;

        self.b.position_at_end(got);
        self.push(Owned::new(value))
    }

    pub(super) fn store_deref(&mut self) -> TranslateResult<()> {
        let value = self.pop()?;
        let index = self.arg_index();
        let addr = self.cell_addr(index)?;
        let cell = self.b.load(Ty::Ptr, addr)?;
        self.call_and_check(EntryPoint::CellSet, vec![cell, value.operand()], vec![value])
    }

    /// Globals first, then builtins; both lookups return borrowed references.
    pub(super) fn load_global(&mut self) -> TranslateResult<()> {
        let name = self.name_operand()?;
        let globals = self.slots.globals;
        let builtins = self.slots.builtins;

        let from_globals = self.call_value(EntryPoint::DictGetItem, vec![globals, name])?;
        let lookup_block = self.b.current_block()?;
        let try_builtins = self.b.create_block("LOAD_GLOBAL_builtins");
        let not_found = self.b.create_block("LOAD_GLOBAL_not_found");
        let found = self.b.create_block("LOAD_GLOBAL_found");
        let missing = self.b.is_null(from_globals)?;
        self.b.cond_br(missing, try_builtins, found)?;

        self.b.position_at_end(try_builtins);
        let from_builtins = self.call_value(EntryPoint::DictGetItem, vec![builtins, name])?;
        let missing = self.b.is_null(from_builtins)?;
        self.b.cond_br(missing, not_found, found)?;

        self.b.position_at_end(not_found);
        let frame = self.slots.frame;
        self.call(EntryPoint::RaiseForGlobalNameError, vec![frame, name])?;
        self.return_null()?;

        self.b.position_at_end(found);
        let phi = self.b.phi(Ty::Ptr)?;
        self.b.add_incoming(phi, from_globals, lookup_block)?;
        self.b.add_incoming(phi, from_builtins, try_builtins)?;
        let value = Operand::Value(phi);
        self.incref(value)?;
        self.push(Owned::new(value))
    }

    pub(super) fn store_global(&mut self) -> TranslateResult<()> {
        let value = self.pop()?;
        let name = self.name_operand()?;
        let globals = self.slots.globals;
        self.call_and_check(
            EntryPoint::DictSetItem,
            vec![globals, name, value.operand()],
            vec![value],
        )
    }

    /// A failed delete means the name was not bound; report it as such.
    pub(super) fn delete_global(&mut self) -> TranslateResult<()> {
        let name = self.name_operand()?;
        let globals = self.slots.globals;
        let status = self.call_value(EntryPoint::DictDelItem, vec![globals, name])?;
        let frame = self.slots.frame;
        self.check_result_with(EntryPoint::DictDelItem, status, move |t| {
            t.call(EntryPoint::RaiseForGlobalNameError, vec![frame, name])
                .map(|_| ())
        })
    }

    pub(super) fn load_attr(&mut self) -> TranslateResult<()> {
        let object = self.pop()?;
        let name = self.name_operand()?;
        self.call_and_push(
            EntryPoint::ObjectGetAttr,
            vec![object.operand(), name],
            vec![object],
        )
    }

    pub(super) fn store_attr(&mut self) -> TranslateResult<()> {
        let object = self.pop()?;
        let value = self.pop()?;
        let name = self.name_operand()?;
        self.call_and_check(
            EntryPoint::ObjectSetAttr,
            vec![object.operand(), name, value.operand()],
            vec![object, value],
        )
    }

    pub(super) fn delete_attr(&mut self) -> TranslateResult<()> {
        let object = self.pop()?;
        let name = self.name_operand()?;
        self.call_and_check(
            EntryPoint::ObjectSetAttr,
            vec![object.operand(), name, Operand::Null],
            vec![object],
        )
    }
}
