//! Reference-count manipulation emitted inline.
//!
//! `IncRef` and `DecRef` work on the refcount word at the header offset. With
//! `ref_debug` set, the host's global reference total is adjusted as well and a count
//! that drops below zero is reported through `_Py_NegativeRefcount` (with the
//! function name and bytecode offset) instead of being left to corrupt the heap.
//! Reaching zero calls the host's deallocation wrapper.

use super::owned::Owned;
use super::translator::FunctionTranslator;
use crate::bridge::{EntryPoint, HostGlobal};
use crate::core::TranslateResult;
use crate::ir::{CmpPred, Operand, Ty};

impl FunctionTranslator<'_, '_> {
    fn adjust_ref_total(&mut self, increment: bool) -> TranslateResult<()> {
        if !self.config.ref_debug {
            return Ok(());
        }
        let total_addr = self.global(HostGlobal::RefTotal)?;
        let total = self.b.load(Ty::I64, total_addr)?;
        let updated = if increment {
            self.b.add(Ty::I64, total, Operand::i64(1))?
        } else {
            self.b.sub(Ty::I64, total, Operand::i64(1))?
        };
        self.b.store(updated, total_addr)
    }

    pub(super) fn incref(&mut self, object: Operand) -> TranslateResult<()> {
        self.adjust_ref_total(true)?;
        let addr = self.b.field_addr(object, self.layout.ob_refcnt)?;
        let count = self.b.load(Ty::I64, addr)?;
        let count = self.b.add(Ty::I64, count, Operand::i64(1))?;
        self.b.store(count, addr)
    }

    /// Take a new reference to an owned value.
    pub(super) fn dup(&mut self, value: &Owned) -> TranslateResult<Owned> {
        self.incref(value.operand())?;
        Ok(Owned::new(value.operand()))
    }

    pub(super) fn decref(&mut self, object: Operand) -> TranslateResult<()> {
        self.adjust_ref_total(false)?;
        let addr = self.b.field_addr(object, self.layout.ob_refcnt)?;
        let count = self.b.load(Ty::I64, addr)?;
        let count = self.b.sub(Ty::I64, count, Operand::i64(1))?;
        self.b.store(count, addr)?;

        let dealloc = self.b.create_block("dealloc");
        let end = self.b.create_block("decref_end");
        let nonzero = self.b.icmp(CmpPred::Ne, count, Operand::i64(0))?;

        if self.config.ref_debug {
            let check = self.b.create_block("check_refcnt");
            let negative = self.b.create_block("negative_refcount");
            self.b.cond_br(nonzero, check, dealloc)?;

            self.b.position_at_end(check);
            let is_negative = self.b.icmp(CmpPred::Slt, count, Operand::i64(0))?;
            self.b.cond_br(is_negative, negative, end)?;

            self.b.position_at_end(negative);
            let args = vec![
                Operand::Str(self.func_name),
                Operand::i32(self.offset as i32),
                object,
            ];
            self.call(EntryPoint::NegativeRefcount, args)?;
            self.b.br(end)?;
        } else {
            self.b.cond_br(nonzero, end, dealloc)?;
        }

        self.b.position_at_end(dealloc);
        self.call(EntryPoint::WrapDealloc, vec![object])?;
        self.b.br(end)?;

        self.b.position_at_end(end);
        Ok(())
    }

    /// `DecRef` guarded by a null check.
    pub(super) fn xdecref(&mut self, object: Operand) -> TranslateResult<()> {
        let decref = self.b.create_block("xdecref");
        let end = self.b.create_block("xdecref_end");
        let is_null = self.b.is_null(object)?;
        self.b.cond_br(is_null, end, decref)?;

        self.b.position_at_end(decref);
        self.decref(object)?;
        self.b.br(end)?;

        self.b.position_at_end(end);
        Ok(())
    }

    /// Give up an owned reference.
    pub(super) fn release(&mut self, value: Owned) -> TranslateResult<()> {
        if value.is_absent() {
            let _ = value.transfer();
            Ok(())
        } else if value.is_nullable() {
            self.xdecref(value.transfer())
        } else {
            self.decref(value.transfer())
        }
    }

    pub(super) fn release_all(&mut self, values: Vec<Owned>) -> TranslateResult<()> {
        for value in values {
            self.release(value)?;
        }
        Ok(())
    }
}
