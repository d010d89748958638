// This module provides arena-based session management using the bumpalo crate. A
// CompilationSession owns nothing but a reference to the arena plus statistics; the
// translator's per-function map from bytecode offset to block is a hashbrown map
// allocated in that arena, so a whole batch of translations is torn down by dropping
// one Bump. The session also interns the name of the function being translated and
// accumulates SessionStats: functions translated, opcodes by mnemonic, blocks created,
// bridge calls emitted and the largest function seen. The statistics have a Display
// report used by the CLI's --stats flag.

//! Arena-based translation session management.
//!
//! All scratch data for a batch of translations lives in one `Bump`. The session
//! lifetime `'arena` ties arena-allocated maps to it.

use bumpalo::Bump;
use hashbrown::{DefaultHashBuilder, HashMap, HashSet};
use std::cell::RefCell;
use std::fmt;

/// A hashbrown map allocated in the session arena.
pub type ArenaMap<'arena, K, V> = HashMap<K, V, DefaultHashBuilder, &'arena Bump>;

/// Arena-backed translation session.
pub struct CompilationSession<'arena> {
    /// Arena allocator for scratch data.
    arena: &'arena Bump,

    /// Session statistics.
    stats: RefCell<SessionStats>,

    /// Interned strings.
    interned_strings: RefCell<HashSet<&'arena str, DefaultHashBuilder, &'arena Bump>>,

    /// Function currently being translated.
    current_function: RefCell<Option<&'arena str>>,
}

impl<'arena> CompilationSession<'arena> {
    /// Create a new session over the given arena.
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
            interned_strings: RefCell::new(HashSet::new_in(arena)),
            current_function: RefCell::new(None),
        }
    }

    /// Create an empty map whose storage lives in the arena.
    pub fn new_map<K, V>(&self) -> ArenaMap<'arena, K, V> {
        HashMap::new_in(self.arena)
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned: &'arena str = self.arena.alloc_str(s);
        strings.insert(interned);
        interned
    }

    /// Set the function currently being translated.
    pub fn set_current_function(&self, name: &str) {
        let name = self.intern_str(name);
        *self.current_function.borrow_mut() = Some(name);
    }

    /// Name of the function currently being translated, if any.
    pub fn current_function(&self) -> Option<&'arena str> {
        *self.current_function.borrow()
    }

    /// Forget per-function state after a translation finishes.
    pub fn clear_function_state(&self) {
        *self.current_function.borrow_mut() = None;
    }

    /// Record that a function was translated.
    pub fn record_function_translated(&self, name: &str, blocks: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_translated += 1;
        stats.blocks_created += blocks;

        if stats.largest_function_blocks < blocks {
            stats.largest_function_blocks = blocks;
            stats.largest_function_name = name.to_string();
        }
    }

    /// Record the translation of one bytecode instruction.
    pub fn record_opcode(&self, mnemonic: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.opcodes_translated += 1;
        *stats
            .opcode_counts
            .entry(mnemonic.to_string())
            .or_insert(0) += 1;
    }

    /// Record an emitted call to a bridge entry point.
    pub fn record_bridge_call(&self, name: &str) {
        self.stats.borrow_mut().bridge_calls += 1;
        log::trace!("bridge call emitted: {}", name);
    }

    /// Record a translation that was rejected.
    pub fn record_rejected(&self) {
        self.stats.borrow_mut().functions_rejected += 1;
    }

    /// Get a copy of the session statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Translation session statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    /// Number of functions translated.
    pub functions_translated: usize,

    /// Number of functions whose translation failed.
    pub functions_rejected: usize,

    /// Number of bytecode instructions translated.
    pub opcodes_translated: usize,

    /// Count of each opcode translated.
    pub opcode_counts: std::collections::HashMap<String, usize>,

    /// IR blocks created across all functions.
    pub blocks_created: usize,

    /// Bridge calls emitted.
    pub bridge_calls: usize,

    /// Block count of the largest function.
    pub largest_function_blocks: usize,

    /// Name of the largest function.
    pub largest_function_name: String,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Translation Session Statistics:")?;
        writeln!(f, "  Functions translated: {}", self.functions_translated)?;
        writeln!(f, "  Functions rejected: {}", self.functions_rejected)?;
        writeln!(f, "  Opcodes translated: {}", self.opcodes_translated)?;
        writeln!(f, "  Blocks created: {}", self.blocks_created)?;
        writeln!(f, "  Bridge calls emitted: {}", self.bridge_calls)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} blocks)",
                self.largest_function_name, self.largest_function_blocks
            )?;
        }

        if !self.opcode_counts.is_empty() {
            writeln!(f, "  Opcode breakdown:")?;
            let mut sorted: Vec<_> = self.opcode_counts.iter().collect();
            sorted.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

            for (opcode, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}
