//! Host layout variants: the translator and the host must agree on every offset, and
//! generated code must run unchanged under each build variant.

use bumpalo::Bump;
use stackjit::asm::parse_module;
use stackjit::core::{CompilationSession, TranslateError, TranslatorConfig};
use stackjit::ir::Module;
use stackjit::layout::LayoutProbe;
use stackjit::lower::Translator;
use stackjit::sim::SimRuntime;

const SWAP_SUM: &str = r#"
code swap_sum(t) {
    .locals a, b
    LOAD_FAST t
    UNPACK_SEQUENCE 2
    STORE_FAST a
    STORE_FAST b
    LOAD_FAST b
    LOAD_FAST a
    BUILD_LIST 2
    LOAD_FAST a
    LOAD_FAST b
    BINARY_ADD
    BUILD_TUPLE 2
    RETURN_VALUE
}
"#;

fn variants() -> Vec<TranslatorConfig> {
    let base = TranslatorConfig::default().with_verify(true);
    let mut configs = Vec::new();
    for ref_debug in [false, true] {
        for trace_refs in [false, true] {
            for count_allocs in [false, true] {
                configs.push(
                    base.with_ref_debug(ref_debug)
                        .with_trace_refs(trace_refs)
                        .with_count_allocs(count_allocs),
                );
            }
        }
    }
    configs
}

#[test]
fn test_translator_layout_matches_host() {
    let _ = env_logger::builder().is_test(true).try_init();
    for config in variants() {
        let translator = Translator::new(config);
        let sim = SimRuntime::new(&config).unwrap();
        let probe = LayoutProbe::from_layout(sim.layout());
        assert_eq!(translator.layout().validate(&probe), Ok(()), "{:?}", config);
        assert_eq!(translator.layout().version, sim.layout().version);
    }
}

#[test]
fn test_variant_mismatch_detected() {
    let plain = Translator::new(TranslatorConfig::default());
    let sim = SimRuntime::new(&TranslatorConfig::default().with_trace_refs(true)).unwrap();
    let err = plain
        .layout()
        .validate(&LayoutProbe::from_layout(sim.layout()))
        .unwrap_err();
    assert_eq!(
        err,
        TranslateError::LayoutMismatch {
            field: "sizeof(PyObject)",
            expected: 16,
            actual: 32,
        }
    );

    // count-allocs only changes the type object tail.
    let sim = SimRuntime::new(&TranslatorConfig::default().with_count_allocs(true)).unwrap();
    let err = plain
        .layout()
        .validate(&LayoutProbe::from_layout(sim.layout()))
        .unwrap_err();
    assert!(
        matches!(err, TranslateError::LayoutMismatch { field: "sizeof(PyTypeObject)", .. }),
        "{:?}",
        err
    );
}

#[test]
fn test_same_results_under_every_variant() {
    let _ = env_logger::builder().is_test(true).try_init();
    let unit = parse_module(SWAP_SUM).unwrap().remove(0);
    for config in variants() {
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut module = Module::new("layout_test");
        Translator::new(config)
            .translate(&session, &mut module, &unit)
            .unwrap();

        let mut sim = SimRuntime::new(&config).unwrap();
        let globals = sim.new_dict().unwrap();
        let items = vec![sim.new_int(4).unwrap(), sim.new_int(9).unwrap()];
        let pair = sim.new_tuple(items).unwrap();
        let outcome = sim.run_unit(&module, &unit, globals, &[pair]).unwrap();
        sim.release(pair).unwrap();
        sim.release(globals).unwrap();

        assert_eq!(outcome.error, None, "{:?}", config);
        assert_eq!(outcome.result.as_deref(), Some("([9, 4], 13)"), "{:?}", config);
        assert!(outcome.balance.is_balanced(), "{:?}: {}", config, outcome.balance);
        assert!(sim.violations().is_empty(), "{:?}: {:?}", config, sim.violations());
    }
}
