// This module holds TranslatorConfig, the small set of build-mode switches that change
// what the translator emits. ref_debug adds the process-wide reference total bookkeeping
// and negative-count diagnostics around every IncRef/DecRef; trace_refs and count_allocs
// select the host object layout variant (extra link words in every object header, extra
// statistics slots at the tail of type objects); verify runs the IR verifier after each
// function. Defaults match a release host. from_env() applies STACKJIT_* environment
// overrides so tests and the CLI can flip modes without code changes.

//! Translator configuration.

use crate::layout::LayoutOptions;

/// Environment variable enabling debug reference bookkeeping.
pub const ENV_REF_DEBUG: &str = "STACKJIT_REF_DEBUG";
/// Environment variable selecting the trace-refs object header.
pub const ENV_TRACE_REFS: &str = "STACKJIT_TRACE_REFS";
/// Environment variable selecting the count-allocs type object tail.
pub const ENV_COUNT_ALLOCS: &str = "STACKJIT_COUNT_ALLOCS";
/// Environment variable toggling IR verification.
pub const ENV_VERIFY: &str = "STACKJIT_VERIFY";

/// Switches controlling code emission and the assumed host layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslatorConfig {
    /// Maintain `_Py_RefTotal` and report negative reference counts.
    pub ref_debug: bool,
    /// Host objects carry the two trace-refs link words.
    pub trace_refs: bool,
    /// Host type objects carry the count-allocs statistics tail.
    pub count_allocs: bool,
    /// Run the IR verifier on every translated function.
    pub verify: bool,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            ref_debug: false,
            trace_refs: false,
            count_allocs: false,
            verify: true,
        }
    }
}

impl TranslatorConfig {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(on) = env_flag(ENV_REF_DEBUG) {
            config.ref_debug = on;
        }
        if let Some(on) = env_flag(ENV_TRACE_REFS) {
            config.trace_refs = on;
        }
        if let Some(on) = env_flag(ENV_COUNT_ALLOCS) {
            config.count_allocs = on;
        }
        if let Some(on) = env_flag(ENV_VERIFY) {
            config.verify = on;
        }
        log::debug!("translator config from environment: {:?}", config);
        config
    }

    pub fn with_ref_debug(mut self, on: bool) -> Self {
        self.ref_debug = on;
        self
    }

    pub fn with_trace_refs(mut self, on: bool) -> Self {
        self.trace_refs = on;
        self
    }

    pub fn with_count_allocs(mut self, on: bool) -> Self {
        self.count_allocs = on;
        self
    }

    pub fn with_verify(mut self, on: bool) -> Self {
        self.verify = on;
        self
    }

    /// Layout variant implied by this configuration.
    pub fn layout_options(&self) -> LayoutOptions {
        LayoutOptions {
            trace_refs: self.trace_refs,
            count_allocs: self.count_allocs,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    parse_flag(&raw).or_else(|| {
        log::warn!("ignoring {}={:?}: expected a boolean", name, raw);
        None
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_verify_only() {
        let config = TranslatorConfig::default();
        assert!(!config.ref_debug);
        assert!(!config.trace_refs);
        assert!(!config.count_allocs);
        assert!(config.verify);
    }

    #[test]
    fn test_builder_setters() {
        let config = TranslatorConfig::default()
            .with_ref_debug(true)
            .with_trace_refs(true)
            .with_verify(false);
        assert!(config.ref_debug);
        assert!(config.trace_refs);
        assert!(!config.count_allocs);
        assert!(!config.verify);

        let options = config.layout_options();
        assert!(options.trace_refs);
        assert!(!options.count_allocs);
    }

    #[test]
    fn test_parse_flag() {
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag(" ON "), Some(true));
        assert_eq!(parse_flag("no"), Some(false));
        assert_eq!(parse_flag(""), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
