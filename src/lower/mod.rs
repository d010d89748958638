// This module lowers decoded bytecode into the CFG IR. The input model (CodeUnit, Instr,
// Const) and the closed Opcode table with per-opcode stack effects come first; the
// static depth pass over them rejects malformed units before any IR is built. The
// translator itself is split by concern: translator.rs holds the driver, the bridge-call
// helpers and the exhaustive opcode dispatch; frame.rs the value-stack and locals
// primitives over the host frame; refcount.rs the inline reference-count sequences;
// owned.rs the build-time ownership wrapper; and names/arith/flow/collections/stack
// the opcode handlers grouped by what they touch.

//! Bytecode input model and the opcode translator.

pub mod code;
pub mod opcode;
pub mod owned;

mod arith;
mod collections;
mod flow;
mod frame;
mod names;
mod refcount;
mod stack;
mod translator;

pub use code::{CodeUnit, Const, DepthMap, Instr};
pub use frame::FrameSlots;
pub use opcode::{CmpOp, Opcode, OpcodeInfo, OperandKind, StackEffect};
pub use owned::Owned;
pub use translator::{Translation, Translator};
