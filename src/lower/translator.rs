// This module drives the translation of one code unit. The driver validates the unit,
// runs the static stack-depth pass, creates one IR block per bytecode block start
// (named L<offset>), emits the frame prologue into the entry block and then walks the
// instructions once in program order, dispatching each opcode to its handler through an
// exhaustive match. Handlers live in sibling modules and share the helpers defined here:
// bridge-call emission with per-entry-point failure checking (check_result), the
// null-return path that every failure takes, and lazy creation of the canonical exit
// block. The exit block is completed last: it drains whatever is left on the value stack
// (releasing each entry) and returns the result slot. Unreachable bytecode is not
// lowered; its blocks end in `unreachable`. Translation statistics go to the
// CompilationSession and per-function scratch maps live in its arena.

//! Per-function opcode translator.

use super::code::{CodeUnit, DepthMap};
use super::frame::FrameSlots;
use super::opcode::Opcode;
use super::owned::Owned;
use crate::bridge::{EntryPoint, FailurePolicy, HostGlobal};
use crate::core::{ArenaMap, CompilationSession, TranslateError, TranslateResult, TranslatorConfig};
use crate::ir::{verify_function, BlockId, CmpPred, IrBuilder, Module, Operand, StrId, Ty};
use crate::layout::HostLayout;

/// Summary of one successful translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub name: String,
    /// Static stack depth on entry to each instruction (`None` if unreachable).
    pub depths: Vec<Option<usize>>,
    pub max_depth: usize,
    pub blocks: usize,
    pub instructions: usize,
}

/// Translates code units into functions of a [`Module`].
pub struct Translator {
    config: TranslatorConfig,
    layout: HostLayout,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> Self {
        let layout = HostLayout::new(config.layout_options());
        Self { config, layout }
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    /// Translate `unit` into a new function `fn(frame: ptr) -> ptr` in `module`.
    pub fn translate<'arena>(
        &self,
        session: &CompilationSession<'arena>,
        module: &mut Module,
        unit: &CodeUnit,
    ) -> TranslateResult<Translation> {
        session.set_current_function(&unit.name);
        let result = self.translate_inner(session, module, unit);

        match &result {
            Ok(translation) => {
                session.record_function_translated(&translation.name, translation.blocks);
                log::info!(
                    "translated {} ({} bytecodes, {} blocks, {} instructions)",
                    translation.name,
                    unit.instrs.len(),
                    translation.blocks,
                    translation.instructions
                );
            }
            Err(err) => {
                session.record_rejected();
                let name = session.current_function().unwrap_or("<unknown>");
                log::warn!("rejected {}: {}", name, err);
            }
        }
        session.clear_function_state();
        result
    }

    fn translate_inner<'arena>(
        &self,
        session: &CompilationSession<'arena>,
        module: &mut Module,
        unit: &CodeUnit,
    ) -> TranslateResult<Translation> {
        let depth_map = unit.static_depths()?;

        let mut b = IrBuilder::new(&unit.name, &[Ty::Ptr], Ty::Ptr);
        let entry = b.create_block("entry");
        b.position_at_end(entry);
        let slots = FrameSlots::emit(&mut b, &self.layout)?;

        let mut block_at: ArenaMap<'arena, usize, BlockId> = session.new_map();
        for start in unit.block_starts() {
            block_at.insert(start, b.create_block(&format!("L{}", start)));
        }

        let func_name = module.intern_str(&unit.name);
        let mut ft = FunctionTranslator {
            config: &self.config,
            layout: &self.layout,
            session,
            module,
            unit,
            b,
            slots,
            func_name,
            block_at,
            return_block: None,
            past_end: None,
            offset: 0,
        };
        ft.run(&depth_map)?;
        let func = ft.finish()?;

        if self.config.verify {
            verify_function(module, &func)?;
        }

        let translation = Translation {
            name: func.name.clone(),
            depths: depth_map.depths,
            max_depth: depth_map.max_depth,
            blocks: func.blocks.len(),
            instructions: func.inst_count(),
        };
        module.add_function(func);
        Ok(translation)
    }
}

/// State for translating a single code unit.
pub(super) struct FunctionTranslator<'t, 'arena> {
    pub(super) config: &'t TranslatorConfig,
    pub(super) layout: &'t HostLayout,
    session: &'t CompilationSession<'arena>,
    module: &'t mut Module,
    pub(super) unit: &'t CodeUnit,
    pub(super) b: IrBuilder,
    pub(super) slots: FrameSlots,
    /// Function name as an interned C string, for diagnostics.
    pub(super) func_name: StrId,
    block_at: ArenaMap<'arena, usize, BlockId>,
    return_block: Option<BlockId>,
    past_end: Option<BlockId>,
    /// Offset of the instruction being lowered.
    pub(super) offset: usize,
}

impl FunctionTranslator<'_, '_> {
    fn run(&mut self, depth_map: &DepthMap) -> TranslateResult<()> {
        let first = match self.block_at.get(&0) {
            Some(&block) => block,
            None => self.past_end_block(),
        };
        self.b.br(first)?;

        let mut lowering = false;
        for offset in 0..self.unit.instrs.len() {
            self.offset = offset;
            let depth = depth_map.depths[offset];

            if let Some(&block) = self.block_at.get(&offset) {
                if lowering {
                    self.b.fall_through_to(block)?;
                } else {
                    self.b.position_at_end(block);
                }
                lowering = depth.is_some();
                match depth {
                    Some(depth) => log::debug!("{}: block L{} at depth {}", self.unit.name, offset, depth),
                    None => {
                        log::debug!("{}: block L{} is unreachable", self.unit.name, offset);
                        self.b.unreachable()?;
                    }
                }
            }
            if !lowering {
                continue;
            }

            let instr = self.unit.instrs[offset];
            log::trace!(
                "{}: {:>4} {} {:?} depth {:?}",
                self.unit.name,
                offset,
                instr.opcode,
                instr.arg.or(instr.target.map(|t| t as i32)),
                depth
            );
            self.session.record_opcode(instr.opcode.name());
            self.lower(instr.opcode)?;
        }

        if lowering && !self.b.is_terminated() {
            log::warn!("{}: control falls off the end of the bytecode", self.unit.name);
            let past_end = self.past_end_block();
            self.b.fall_through_to(past_end)?;
        }
        Ok(())
    }

    fn finish(mut self) -> TranslateResult<crate::ir::Function> {
        if let Some(past_end) = self.past_end {
            self.b.position_at_end(past_end);
            if !self.b.is_terminated() {
                self.b.unreachable()?;
            }
        }
        if let Some(return_block) = self.return_block {
            self.emit_exit(return_block)?;
        }
        Ok(self.b.finish())
    }

    /// Fill in the canonical exit: drain the stack down to its base, then return the
    /// result slot.
    fn emit_exit(&mut self, return_block: BlockId) -> TranslateResult<()> {
        let pop_loop = self.b.create_block("pop_loop");
        let pop_stack = self.b.create_block("pop_stack");
        let do_return = self.b.create_block("do_return");

        self.b.position_at_end(return_block);
        let bottom = self
            .b
            .load_field(Ty::Ptr, self.slots.frame, self.layout.frame_valuestack)?;
        self.b.br(pop_loop)?;

        self.b.position_at_end(pop_loop);
        let sp = self.b.load(Ty::Ptr, self.slots.sp_addr)?;
        let empty = self.b.icmp(CmpPred::Ule, sp, bottom)?;
        self.b.cond_br(empty, do_return, pop_stack)?;

        self.b.position_at_end(pop_stack);
        let value = self.pop_nullable()?;
        self.release(value)?;
        self.b.br(pop_loop)?;

        self.b.position_at_end(do_return);
        let retval = self.b.load(Ty::Ptr, self.slots.retval_addr)?;
        self.b.ret(retval)
    }

    fn past_end_block(&mut self) -> BlockId {
        match self.past_end {
            Some(block) => block,
            None => {
                let block = self.b.create_block("past_end");
                self.past_end = Some(block);
                block
            }
        }
    }

    pub(super) fn return_block(&mut self) -> BlockId {
        match self.return_block {
            Some(block) => block,
            None => {
                let block = self.b.create_block("return_block");
                self.return_block = Some(block);
                block
            }
        }
    }

    /// Block holding the jump target of the current instruction.
    pub(super) fn target_block(&self) -> TranslateResult<BlockId> {
        let instr = &self.unit.instrs[self.offset];
        instr
            .target
            .and_then(|target| self.block_at.get(&target).copied())
            .ok_or_else(|| TranslateError::BadJumpTarget {
                offset: self.offset,
                target: instr.target.unwrap_or(usize::MAX),
                len: self.unit.instrs.len(),
            })
    }

    /// Block that follows the current instruction.
    pub(super) fn next_block(&mut self) -> BlockId {
        match self.block_at.get(&(self.offset + 1)) {
            Some(&block) => block,
            None => self.past_end_block(),
        }
    }

    /// Operand of the current instruction (validated before lowering starts).
    pub(super) fn arg(&self) -> i32 {
        self.unit.instrs[self.offset].arg.unwrap_or(0)
    }

    pub(super) fn arg_index(&self) -> usize {
        self.arg().max(0) as usize
    }

    pub(super) fn global(&mut self, global: HostGlobal) -> TranslateResult<Operand> {
        Ok(Operand::Extern(self.module.declare_data(global.name())?))
    }

    /// Emit a call to a bridge entry point.
    pub(super) fn call(&mut self, ep: EntryPoint, args: Vec<Operand>) -> TranslateResult<Option<Operand>> {
        let desc = ep.desc();
        let callee = self.module.declare_function(desc.name, desc.signature())?;
        self.session.record_bridge_call(desc.name);
        self.b.call(callee, desc.ret, args)
    }

    /// Emit a call to a bridge entry point that returns a value.
    pub(super) fn call_value(&mut self, ep: EntryPoint, args: Vec<Operand>) -> TranslateResult<Operand> {
        self.call(ep, args)?.ok_or_else(|| TranslateError::Verify {
            function: self.unit.name.clone(),
            reason: format!("{} returns void", ep),
        })
    }

    /// Store null in the result slot and leave through the exit block.
    pub(super) fn return_null(&mut self) -> TranslateResult<()> {
        self.b.store(Operand::Null, self.slots.retval_addr)?;
        let exit = self.return_block();
        self.b.br(exit)
    }

    /// Branch to a failure exit when `result` signals failure under `ep`'s convention.
    pub(super) fn check_result(&mut self, ep: EntryPoint, result: Operand) -> TranslateResult<()> {
        self.check_result_with(ep, result, |_| Ok(()))
    }

    /// Like [`check_result`](Self::check_result), running `on_failure` on the failure
    /// path before returning null.
    pub(super) fn check_result_with<F>(&mut self, ep: EntryPoint, result: Operand, on_failure: F) -> TranslateResult<()>
    where
        F: FnOnce(&mut Self) -> TranslateResult<()>,
    {
        let failed = match ep.policy() {
            FailurePolicy::NullOnFailure => self.b.is_null(result)?,
            FailurePolicy::NonZeroOnFailure => self.b.icmp(CmpPred::Ne, result, Operand::i32(0))?,
            FailurePolicy::NegativeOnFailure => self.b.icmp(CmpPred::Slt, result, Operand::i32(0))?,
            FailurePolicy::NonZeroOnSuccess => self.b.icmp(CmpPred::Eq, result, Operand::i32(0))?,
            FailurePolicy::Infallible => {
                return Err(TranslateError::UncheckedEntryPoint { name: ep.name() });
            }
        };

        let failure = self.b.create_block(&format!("{}_failure", ep.name()));
        let success = self.b.create_block(&format!("{}_success", ep.name()));
        self.b.cond_br(failed, failure, success)?;

        self.b.position_at_end(failure);
        on_failure(self)?;
        self.return_null()?;

        self.b.position_at_end(success);
        Ok(())
    }

    /// Call a null-on-failure entry point, check it and push the new reference.
    pub(super) fn call_and_push(&mut self, ep: EntryPoint, args: Vec<Operand>, operands: Vec<Owned>) -> TranslateResult<()> {
        let result = self.call_value(ep, args)?;
        self.release_all(operands)?;
        self.check_result(ep, result)?;
        self.push(Owned::new(result))
    }

    /// Call a status-returning entry point, release its operands and check it.
    pub(super) fn call_and_check(&mut self, ep: EntryPoint, args: Vec<Operand>, operands: Vec<Owned>) -> TranslateResult<()> {
        let result = self.call_value(ep, args)?;
        self.release_all(operands)?;
        self.check_result(ep, result)
    }

    fn lower(&mut self, opcode: Opcode) -> TranslateResult<()> {
        use Opcode::*;
        match opcode {
            Nop | SetupLoop | PopBlock => Ok(()),
            PopTop => self.pop_top(),
            RotTwo => self.rot_two(),
            RotThree => self.rot_three(),
            RotFour => self.rot_four(),
            DupTop => self.dup_top(),
            DupTopX => {
                let count = self.arg_index();
                self.dup_topx(count)
            }

            UnaryPositive => self.unary(EntryPoint::NumberPositive),
            UnaryNegative => self.unary(EntryPoint::NumberNegative),
            UnaryConvert => self.unary(EntryPoint::ObjectRepr),
            UnaryInvert => self.unary(EntryPoint::NumberInvert),
            UnaryNot => self.unary_not(),

            BinaryPower => self.binary(EntryPoint::NumberPower),
            BinaryMultiply => self.binary(EntryPoint::NumberMultiply),
            BinaryDivide => self.binary(EntryPoint::NumberDivide),
            BinaryModulo => self.binary(EntryPoint::NumberRemainder),
            BinaryAdd => self.binary(EntryPoint::NumberAdd),
            BinarySubtract => self.binary(EntryPoint::NumberSubtract),
            BinarySubscr => self.binary(EntryPoint::ObjectGetItem),
            BinaryFloorDivide => self.binary(EntryPoint::NumberFloorDivide),
            BinaryTrueDivide => self.binary(EntryPoint::NumberTrueDivide),
            BinaryLshift => self.binary(EntryPoint::NumberLshift),
            BinaryRshift => self.binary(EntryPoint::NumberRshift),
            BinaryAnd => self.binary(EntryPoint::NumberAnd),
            BinaryXor => self.binary(EntryPoint::NumberXor),
            BinaryOr => self.binary(EntryPoint::NumberOr),
            InplacePower => self.binary(EntryPoint::NumberInPlacePower),
            InplaceMultiply => self.binary(EntryPoint::NumberInPlaceMultiply),
            InplaceDivide => self.binary(EntryPoint::NumberInPlaceDivide),
            InplaceModulo => self.binary(EntryPoint::NumberInPlaceRemainder),
            InplaceAdd => self.binary(EntryPoint::NumberInPlaceAdd),
            InplaceSubtract => self.binary(EntryPoint::NumberInPlaceSubtract),
            InplaceFloorDivide => self.binary(EntryPoint::NumberInPlaceFloorDivide),
            InplaceTrueDivide => self.binary(EntryPoint::NumberInPlaceTrueDivide),
            InplaceLshift => self.binary(EntryPoint::NumberInPlaceLshift),
            InplaceRshift => self.binary(EntryPoint::NumberInPlaceRshift),
            InplaceAnd => self.binary(EntryPoint::NumberInPlaceAnd),
            InplaceXor => self.binary(EntryPoint::NumberInPlaceXor),
            InplaceOr => self.binary(EntryPoint::NumberInPlaceOr),
            CompareOp => self.compare_op(),

            Slice0 => self.slice(false, false),
            Slice1 => self.slice(true, false),
            Slice2 => self.slice(false, true),
            Slice3 => self.slice(true, true),
            StoreSlice0 => self.assign_slice(false, false, true),
            StoreSlice1 => self.assign_slice(true, false, true),
            StoreSlice2 => self.assign_slice(false, true, true),
            StoreSlice3 => self.assign_slice(true, true, true),
            DeleteSlice0 => self.assign_slice(false, false, false),
            DeleteSlice1 => self.assign_slice(true, false, false),
            DeleteSlice2 => self.assign_slice(false, true, false),
            DeleteSlice3 => self.assign_slice(true, true, false),

            StoreSubscr => self.store_subscr(),
            DeleteSubscr => self.delete_subscr(),
            StoreMap => self.store_map(),
            ListAppend => self.list_append(),
            BuildTuple => self.build_sequence(EntryPoint::TupleNew),
            BuildList => self.build_sequence(EntryPoint::ListNew),
            BuildMap => self.build_map(),
            BuildSlice => self.build_slice(),
            UnpackSequence => self.unpack_sequence(),

            GetIter => self.get_iter(),
            ForIter => self.for_iter(),
            ReturnValue => self.return_value(),
            RaiseVarargs => self.raise_varargs(),
            JumpForward | JumpAbsolute => {
                let target = self.target_block()?;
                self.b.br(target)
            }
            PopJumpIfFalse => self.pop_jump_if(false),
            PopJumpIfTrue => self.pop_jump_if(true),
            JumpIfFalseOrPop => self.jump_if_or_pop(false),
            JumpIfTrueOrPop => self.jump_if_or_pop(true),

            LoadConst => self.load_const(),
            LoadFast => self.load_fast(),
            StoreFast => self.store_fast(),
            DeleteFast => {
                let index = self.arg_index();
                self.set_local(index, Owned::absent())
            }
            LoadClosure => self.load_closure(),
            LoadDeref => self.load_deref(),
            StoreDeref => self.store_deref(),
            LoadGlobal => self.load_global(),
            StoreGlobal => self.store_global(),
            DeleteGlobal => self.delete_global(),
            LoadAttr => self.load_attr(),
            StoreAttr => self.store_attr(),
            DeleteAttr => self.delete_attr(),

            CallFunction => self.call_function(),
            CallFunctionVarKw => self.call_function_var_kw(),

            SetupExcept | SetupFinally | EndFinally | BreakLoop | ContinueLoop | WithCleanup
            | YieldValue | LoadName | StoreName | DeleteName | ImportName | ImportFrom
            | MakeFunction | MakeClosure | CallFunctionVar | CallFunctionKw | PrintItem
            | PrintNewline | ExtendedArg => Err(TranslateError::UnsupportedOpcode {
                opcode: opcode.name(),
                offset: self.offset,
            }),
        }
    }
}
