//! Value-stack and locals model over the host frame.
//!
//! The generated function keeps the stack pointer in a dedicated slot so that bridge
//! helpers that manipulate the stack themselves (calls, unpacking) can read and write
//! it through its address. Push and pop always go through that slot.

use super::owned::Owned;
use super::translator::FunctionTranslator;
use crate::core::TranslateResult;
use crate::ir::{IrBuilder, Operand, Ty};
use crate::layout::HostLayout;

const SLOT: u64 = 8;

/// Addresses computed once in the entry block.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlots {
    pub frame: Operand,
    /// Slot holding the current stack pointer.
    pub sp_addr: Operand,
    /// Slot holding the value returned through the exit block.
    pub retval_addr: Operand,
    /// First item of `co_names`.
    pub names: Operand,
    /// First item of `co_consts`.
    pub consts: Operand,
    pub fastlocals: Operand,
    /// Cells followed by free variables, right after the fast locals.
    pub freevars: Operand,
    pub globals: Operand,
    pub builtins: Operand,
}

impl FrameSlots {
    /// Emit the prologue into the builder's current block.
    pub fn emit(b: &mut IrBuilder, layout: &HostLayout) -> TranslateResult<Self> {
        let frame = b.param(0);

        let sp_addr = b.alloca(Ty::Ptr)?;
        let retval_addr = b.alloca(Ty::Ptr)?;
        b.store(Operand::Null, retval_addr)?;
        let stacktop = b.load_field(Ty::Ptr, frame, layout.frame_stacktop)?;
        b.store(stacktop, sp_addr)?;

        let code = b.load_field(Ty::Ptr, frame, layout.frame_code)?;
        let names_tuple = b.load_field(Ty::Ptr, code, layout.code_names)?;
        let names = b.field_addr(names_tuple, layout.tuple_item)?;
        let consts_tuple = b.load_field(Ty::Ptr, code, layout.code_consts)?;
        let consts = b.field_addr(consts_tuple, layout.tuple_item)?;

        let fastlocals = b.field_addr(frame, layout.frame_localsplus)?;
        let nlocals = b.load_field(Ty::I32, code, layout.code_nlocals)?;
        let freevars = b.ptradd(fastlocals, nlocals, SLOT)?;

        let globals = b.load_field(Ty::Ptr, frame, layout.frame_globals)?;
        let builtins = b.load_field(Ty::Ptr, frame, layout.frame_builtins)?;

        Ok(Self {
            frame,
            sp_addr,
            retval_addr,
            names,
            consts,
            fastlocals,
            freevars,
            globals,
            builtins,
        })
    }
}

impl FunctionTranslator<'_, '_> {
    /// Store `value` at the stack pointer and advance it; the stack takes the reference.
    pub(super) fn push(&mut self, value: Owned) -> TranslateResult<()> {
        let sp_addr = self.slots.sp_addr;
        let sp = self.b.load(Ty::Ptr, sp_addr)?;
        self.b.store(value.transfer(), sp)?;
        let next = self.b.ptradd(sp, Operand::i64(1), SLOT)?;
        self.b.store(next, sp_addr)
    }

    /// Retreat the stack pointer and load the value there; the caller owns it.
    pub(super) fn pop(&mut self) -> TranslateResult<Owned> {
        Ok(Owned::new(self.pop_raw()?))
    }

    /// Pop a value that may be null, such as an optional slice bound.
    pub(super) fn pop_nullable(&mut self) -> TranslateResult<Owned> {
        Ok(Owned::nullable(self.pop_raw()?))
    }

    fn pop_raw(&mut self) -> TranslateResult<Operand> {
        let sp_addr = self.slots.sp_addr;
        let sp = self.b.load(Ty::Ptr, sp_addr)?;
        let prev = self.b.ptradd(sp, Operand::i64(-1), SLOT)?;
        let value = self.b.load(Ty::Ptr, prev)?;
        self.b.store(prev, sp_addr)?;
        Ok(value)
    }

    /// Load the `depth`-th value from the top (1 is the top) without popping it. The
    /// stack keeps the reference.
    pub(super) fn peek(&mut self, depth: i64) -> TranslateResult<Operand> {
        let sp = self.b.load(Ty::Ptr, self.slots.sp_addr)?;
        let addr = self.b.ptradd(sp, Operand::i64(-depth), SLOT)?;
        self.b.load(Ty::Ptr, addr)
    }

    pub(super) fn local_addr(&mut self, index: usize) -> TranslateResult<Operand> {
        self.b
            .ptradd(self.slots.fastlocals, Operand::i64(index as i64), SLOT)
    }

    pub(super) fn cell_addr(&mut self, index: usize) -> TranslateResult<Operand> {
        self.b
            .ptradd(self.slots.freevars, Operand::i64(index as i64), SLOT)
    }

    /// Store `value` into local `index`, then release what the slot held.
    pub(super) fn set_local(&mut self, index: usize, value: Owned) -> TranslateResult<()> {
        let addr = self.local_addr(index)?;
        let old = self.b.load(Ty::Ptr, addr)?;
        self.b.store(value.transfer(), addr)?;
        self.release(Owned::nullable(old))
    }
}
