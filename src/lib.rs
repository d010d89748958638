//! stackjit - lowering stack bytecode to a CFG IR.
//!
//! stackjit translates one function at a time from a stack-machine bytecode (the
//! CPython 2 instruction set) into a small SSA control-flow-graph IR. The generated code
//! operates directly on the host's activation frame, calls named host entry points for
//! every semantic operation, and carries the host's reference-counting discipline on
//! every path, including failure paths.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use stackjit::core::{CompilationSession, TranslatorConfig};
//! use stackjit::ir::Module;
//! use stackjit::lower::Translator;
//!
//! let units = stackjit::asm::parse_module(source)?;
//! let arena = Bump::new();
//! let session = CompilationSession::new(&arena);
//! let translator = Translator::new(TranslatorConfig::default());
//! let mut module = Module::new("demo");
//! for unit in &units {
//!     translator.translate(&session, &mut module, unit)?;
//! }
//! println!("{}", module);
//! ```
//!
//! # Architecture
//!
//! - [`core`] - Errors, configuration and the compilation session
//! - [`layout`] - Versioned host object-layout descriptor
//! - [`ir`] - CFG IR, builder, printer and verifier
//! - [`bridge`] - Host entry points and their failure conventions
//! - [`lower`] - Bytecode model and the opcode translator
//! - [`asm`] - Textual bytecode listings
//! - [`exec`] - IR interpreter
//! - [`sim`] - Simulated host runtime for instrumented execution

pub mod core;
pub mod layout;
pub mod ir;
pub mod bridge;
pub mod lower;
pub mod asm;
pub mod exec;
pub mod sim;

pub use crate::core::{CompilationSession, TranslateError, TranslateResult, TranslatorConfig};
pub use crate::ir::Module;
pub use crate::lower::{CodeUnit, Translator};
