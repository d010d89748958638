// This module is the hub for the translator's shared infrastructure: the error taxonomy
// for internal consistency failures, the translator configuration (debug reference
// accounting and the host build options that change object layouts), and the
// per-compilation-unit session that owns the bump arena and collects statistics. The
// subsystems (layout, ir, bridge, lower) depend on these pieces and on nothing else in
// common, so they are gathered here and re-exported under short names.

//! Core translator infrastructure.
//!
//! # Key Components
//!
//! ## Errors (`error`)
//! - `TranslateError` for every internal consistency violation
//! - `TranslateResult<T>` alias used throughout the crate
//!
//! ## Configuration (`config`)
//! - `TranslatorConfig` with builder-style setters
//! - Environment overrides through `TranslatorConfig::from_env`
//!
//! ## Session Management (`session`)
//! - Arena-based scratch allocation using `bumpalo`
//! - Translation statistics with a printable report

pub mod config;
pub mod error;
pub mod session;

pub use config::TranslatorConfig;
pub use error::{TranslateError, TranslateResult};
pub use session::{ArenaMap, CompilationSession, SessionStats};
