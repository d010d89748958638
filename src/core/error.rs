// This module defines the error types for the stackjit translator using the thiserror
// crate. TranslateError covers every internal consistency failure the translator can
// detect: unknown or unsupported opcodes, malformed operands, static stack underflow or
// depth disagreement at a block boundary, emission into an already-terminated block,
// layout self-check mismatches and verifier failures. None of these are recoverable at
// translation time; they abort the translation of the current code unit. Failures of the
// *generated* code (host-reported errors, unbound names, iterator exhaustion) are not
// represented here: they are lowered into IR branches that return the null sentinel.

//! Error types for the translator.

use thiserror::Error;

/// Internal consistency errors raised while translating one code unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    #[error("unknown opcode `{name}`")]
    UnknownOpcode { name: String },

    #[error("opcode {opcode} at offset {offset} is not supported by the translator")]
    UnsupportedOpcode { opcode: &'static str, offset: usize },

    #[error("opcode {opcode} at offset {offset}: {reason}")]
    BadOperand {
        opcode: &'static str,
        offset: usize,
        reason: String,
    },

    #[error("opcode {opcode} at offset {offset} pops {needed} values but the stack holds {depth}")]
    StackUnderflow {
        opcode: &'static str,
        offset: usize,
        needed: usize,
        depth: usize,
    },

    #[error("stack depth mismatch entering block `{block}`: recorded {recorded}, arriving with {arriving}")]
    StackDepthMismatch {
        block: String,
        recorded: usize,
        arriving: usize,
    },

    #[error("jump at offset {offset} targets {target}, outside the code unit ({len} instructions)")]
    BadJumpTarget {
        offset: usize,
        target: usize,
        len: usize,
    },

    #[error("attempted to emit into terminated block `{block}`")]
    EmitIntoTerminated { block: String },

    #[error("no insertion point set")]
    NoInsertPoint,

    #[error("entry point {name} has no failure convention to check")]
    UncheckedEntryPoint { name: &'static str },

    #[error("external symbol `{name}` redeclared with a different type")]
    ExternConflict { name: String },

    #[error("layout mismatch for {field}: descriptor says {expected}, host reports {actual}")]
    LayoutMismatch {
        field: &'static str,
        expected: u64,
        actual: u64,
    },

    #[error("verification of `{function}` failed: {reason}")]
    Verify { function: String, reason: String },
}

/// Result type alias for translation operations.
pub type TranslateResult<T> = Result<T, TranslateError>;
