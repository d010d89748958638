//! Textual bytecode listings.
//!
//! A listing holds one or more code units:
//!
//! ```text
//! ; sum the items of a sequence
//! code total(seq) {
//!     .locals acc, x
//!     LOAD_CONST 0
//!     STORE_FAST acc
//!     LOAD_FAST seq
//!     GET_ITER
//! top:
//!     FOR_ITER done
//!     STORE_FAST x
//!     LOAD_FAST acc
//!     LOAD_FAST x
//!     INPLACE_ADD
//!     STORE_FAST acc
//!     JUMP_ABSOLUTE top
//! done:
//!     LOAD_FAST acc
//!     RETURN_VALUE
//! }
//! ```
//!
//! `LOAD_CONST` takes a literal (`None`, `True`, `False`, integers, double-quoted
//! strings with escapes, parenthesized tuples). Global and attribute names are
//! interned into the name pool as they appear. Locals and cells may be given by name or
//! index, jumps by label, and `COMPARE_OP` by its symbol (`<`, `not in`, `is not`, ...).

mod parser;

pub use parser::parse_module;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

pub type ParseResult<T> = Result<T, ParseError>;
