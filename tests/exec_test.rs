//! Execute translated code units on the simulated host.
//!
//! Every run checks the result or the pending error, and that the reference counts of
//! all objects alive before the frame was built are unchanged once the frame and the
//! result have been released.

use bumpalo::Bump;
use stackjit::asm::parse_module;
use stackjit::core::{CompilationSession, TranslatorConfig};
use stackjit::ir::Module;
use stackjit::lower::{CodeUnit, Translator};
use stackjit::sim::{RunOutcome, SimRuntime};

fn config() -> TranslatorConfig {
    TranslatorConfig::default()
        .with_ref_debug(true)
        .with_verify(true)
}

fn translate(source: &str) -> (Module, CodeUnit) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut units = parse_module(source).unwrap();
    let unit = units.remove(0);
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let translator = Translator::new(config());
    let mut module = Module::new("exec_test");
    translator.translate(&session, &mut module, &unit).unwrap();
    (module, unit)
}

/// Run the first unit of `source`. `setup` prepares the host and returns the
/// arguments, which it owns; they are released after the run.
fn run_with<F>(source: &str, setup: F) -> (SimRuntime, RunOutcome)
where
    F: FnOnce(&mut SimRuntime) -> Vec<u64>,
{
    let (module, unit) = translate(source);
    let mut sim = SimRuntime::new(&config()).unwrap();
    let globals = sim.new_dict().unwrap();
    let args = setup(&mut sim);
    let outcome = sim.run_unit(&module, &unit, globals, &args).unwrap();
    for arg in args {
        sim.release(arg).unwrap();
    }
    sim.release(globals).unwrap();
    assert!(sim.violations().is_empty(), "violations: {:?}", sim.violations());
    (sim, outcome)
}

fn run_ints(source: &str, args: &[i64]) -> RunOutcome {
    run_with(source, |sim| args.iter().map(|&v| sim.new_int(v).unwrap()).collect()).1
}

fn int_tuple(sim: &mut SimRuntime, values: &[i64]) -> u64 {
    let items = values.iter().map(|&v| sim.new_int(v).unwrap()).collect();
    sim.new_tuple(items).unwrap()
}

fn assert_balanced(outcome: &RunOutcome) {
    assert!(outcome.balance.is_balanced(), "{}", outcome.balance);
}

fn error_of(outcome: &RunOutcome) -> (String, String) {
    assert_eq!(outcome.result, None);
    let err = outcome.error.clone().expect("an error should be pending");
    (err.name, err.message)
}

const ADD: &str = r#"
code add(a, b) {
    LOAD_FAST a
    LOAD_FAST b
    BINARY_ADD
    RETURN_VALUE
}
"#;

#[test]
fn test_add_returns_sum() {
    let outcome = run_ints(ADD, &[2, 40]);
    assert_eq!(outcome.result.as_deref(), Some("42"));
    assert_eq!(outcome.error, None);
    assert_balanced(&outcome);
}

#[test]
fn test_add_failure_releases_operands() {
    let (sim, outcome) = run_with(ADD, |sim| {
        sim.fail_next("PyNumber_Add").unwrap();
        vec![sim.new_int(1).unwrap(), sim.new_int(2).unwrap()]
    });
    assert_eq!(error_of(&outcome).0, "SimulatedFailure");
    assert_eq!(sim.call_count("PyNumber_Add"), 1);
    assert_balanced(&outcome);
}

#[test]
fn test_type_error_propagates() {
    let (_, outcome) = run_with(ADD, |sim| vec![sim.new_int(1).unwrap(), sim.new_str("x").unwrap()]);
    assert_eq!(
        error_of(&outcome),
        (
            "TypeError".to_string(),
            "unsupported operand type(s) for +: 'int' and 'str'".to_string()
        )
    );
    assert_balanced(&outcome);
}

const TICK_LOOP: &str = r#"
code tick_each(seq) {
    .locals x
    LOAD_FAST seq
    GET_ITER
top:
    FOR_ITER done
    STORE_FAST x
    LOAD_GLOBAL tick
    CALL_FUNCTION 0
    POP_TOP
    JUMP_ABSOLUTE top
done:
    LOAD_CONST None
    RETURN_VALUE
}
"#;

#[test]
fn test_for_iter_runs_three_times() {
    let (sim, outcome) = run_with(TICK_LOOP, |sim| vec![int_tuple(sim, &[1, 2, 3])]);
    assert_eq!(outcome.result.as_deref(), Some("None"));
    assert_eq!(sim.ticks(), 3);
    assert_eq!(sim.call_count("tp_iternext"), 4);
    assert_balanced(&outcome);
}

#[test]
fn test_for_iter_clears_stop_iteration() {
    let (sim, outcome) = run_with(TICK_LOOP, |sim| {
        let seq = int_tuple(sim, &[1, 2]);
        let iter = sim.new_iter(seq, true).unwrap();
        sim.release(seq).unwrap();
        vec![iter]
    });
    assert_eq!(outcome.result.as_deref(), Some("None"));
    assert_eq!(outcome.error, None);
    assert_eq!(sim.ticks(), 2);
    assert_eq!(sim.call_count("PyErr_Clear"), 1);
    assert_balanced(&outcome);
}

#[test]
fn test_for_iter_propagates_iterator_error() {
    let (sim, outcome) = run_with(TICK_LOOP, |sim| {
        sim.fail_next("tp_iternext").unwrap();
        vec![int_tuple(sim, &[1, 2, 3])]
    });
    assert_eq!(error_of(&outcome).0, "SimulatedFailure");
    assert_eq!(sim.ticks(), 0);
    assert_balanced(&outcome);
}

const TOTAL: &str = r#"
code total(seq) {
    .locals acc, x
    LOAD_CONST 0
    STORE_FAST acc
    LOAD_FAST seq
    GET_ITER
top:
    FOR_ITER done
    STORE_FAST x
    LOAD_FAST acc
    LOAD_FAST x
    INPLACE_ADD
    STORE_FAST acc
    JUMP_ABSOLUTE top
done:
    LOAD_FAST acc
    RETURN_VALUE
}
"#;

#[test]
fn test_accumulating_loop() {
    let (_, outcome) = run_with(TOTAL, |sim| {
        let items = [1, 2, 3, 4].iter().map(|&v| sim.new_int(v).unwrap()).collect();
        vec![sim.new_list(items).unwrap()]
    });
    assert_eq!(outcome.result.as_deref(), Some("10"));
    assert_balanced(&outcome);
}

#[test]
fn test_loop_failure_mid_iteration_drains_stack() {
    let (_, outcome) = run_with(TOTAL, |sim| {
        let a = sim.new_int(1).unwrap();
        let b = sim.new_str("two").unwrap();
        vec![sim.new_tuple(vec![a, b]).unwrap()]
    });
    assert_eq!(error_of(&outcome).0, "TypeError");
    assert_balanced(&outcome);
}

const SWAP: &str = r#"
code swap(pair) {
    .locals a, b
    LOAD_FAST pair
    UNPACK_SEQUENCE 2
    STORE_FAST a
    STORE_FAST b
    LOAD_FAST b
    LOAD_FAST a
    BUILD_TUPLE 2
    RETURN_VALUE
}
"#;

#[test]
fn test_unpack_sequence_order() {
    let (_, outcome) = run_with(SWAP, |sim| vec![int_tuple(sim, &[1, 2])]);
    assert_eq!(outcome.result.as_deref(), Some("(2, 1)"));
    assert_balanced(&outcome);
}

#[test]
fn test_unpack_sequence_length_mismatch() {
    let (_, outcome) = run_with(SWAP, |sim| vec![int_tuple(sim, &[1, 2, 3])]);
    assert_eq!(
        error_of(&outcome),
        ("ValueError".to_string(), "too many values to unpack".to_string())
    );
    assert_balanced(&outcome);
}

#[test]
fn test_unpack_sequence_zero() {
    let source = r#"
code empty(t) {
    LOAD_FAST t
    UNPACK_SEQUENCE 0
    LOAD_CONST 7
    RETURN_VALUE
}
"#;
    let (_, outcome) = run_with(source, |sim| vec![sim.new_tuple(vec![]).unwrap()]);
    assert_eq!(outcome.result.as_deref(), Some("7"));
    assert_balanced(&outcome);
}

#[test]
fn test_missing_global_raises_name_error() {
    let source = r#"
code f() {
    LOAD_GLOBAL nope
    RETURN_VALUE
}
"#;
    let outcome = run_ints(source, &[]);
    assert_eq!(
        error_of(&outcome),
        ("NameError".to_string(), "global name 'nope' is not defined".to_string())
    );
    assert_balanced(&outcome);
}

#[test]
fn test_unbound_local() {
    let source = r#"
code f() {
    .locals x
    LOAD_FAST x
    RETURN_VALUE
}
"#;
    let outcome = run_ints(source, &[]);
    assert_eq!(
        error_of(&outcome),
        (
            "UnboundLocalError".to_string(),
            "local variable 'x' referenced before assignment".to_string()
        )
    );
    assert_balanced(&outcome);
}

#[test]
fn test_branch_on_comparison() {
    let source = r#"
code max(a, b) {
    LOAD_FAST a
    LOAD_FAST b
    COMPARE_OP >
    POP_JUMP_IF_FALSE other
    LOAD_FAST a
    RETURN_VALUE
other:
    LOAD_FAST b
    RETURN_VALUE
}
"#;
    for args in [[3, 9], [9, 3]] {
        let outcome = run_ints(source, &args);
        assert_eq!(outcome.result.as_deref(), Some("9"));
        assert_balanced(&outcome);
    }
}

#[test]
fn test_builtin_call_and_subscript() {
    let source = r#"
code f(a, b) {
    LOAD_GLOBAL len
    LOAD_FAST a
    LOAD_FAST b
    BUILD_LIST 2
    DUP_TOP
    STORE_FAST a
    CALL_FUNCTION 1
    LOAD_FAST a
    LOAD_CONST -1
    BINARY_SUBSCR
    BUILD_TUPLE 2
    RETURN_VALUE
}
"#;
    let outcome = run_ints(source, &[5, 6]);
    assert_eq!(outcome.result.as_deref(), Some("(2, 6)"));
    assert_balanced(&outcome);
}

#[test]
fn test_cell_store_and_load() {
    let source = r#"
code f() {
    .cellvars c
    LOAD_CONST 5
    STORE_DEREF c
    LOAD_DEREF c
    RETURN_VALUE
}
"#;
    let outcome = run_ints(source, &[]);
    assert_eq!(outcome.result.as_deref(), Some("5"));
    assert_balanced(&outcome);
}

#[test]
fn test_unbound_free_variable() {
    let source = r#"
code f() {
    .freevars g
    LOAD_DEREF g
    RETURN_VALUE
}
"#;
    let outcome = run_ints(source, &[]);
    assert_eq!(
        error_of(&outcome),
        (
            "NameError".to_string(),
            "free variable 'g' referenced before assignment in enclosing scope".to_string()
        )
    );
    assert_balanced(&outcome);
}

#[test]
fn test_attribute_roundtrip() {
    let source = r#"
code f(obj) {
    LOAD_CONST 3
    LOAD_FAST obj
    STORE_ATTR x
    LOAD_FAST obj
    LOAD_ATTR x
    RETURN_VALUE
}
"#;
    let (_, outcome) = run_with(source, |sim| vec![sim.new_namespace("o").unwrap()]);
    assert_eq!(outcome.result.as_deref(), Some("3"));

    let missing = r#"
code f(obj) {
    LOAD_FAST obj
    LOAD_ATTR y
    RETURN_VALUE
}
"#;
    let (_, outcome) = run_with(missing, |sim| vec![sim.new_namespace("o").unwrap()]);
    assert_eq!(
        error_of(&outcome),
        (
            "AttributeError".to_string(),
            "'namespace' object has no attribute 'y'".to_string()
        )
    );
    assert_balanced(&outcome);
}

#[test]
fn test_raise_varargs() {
    let source = r#"
code f() {
    LOAD_GLOBAL KeyError
    LOAD_CONST "boom"
    RAISE_VARARGS 2
}
"#;
    let outcome = run_ints(source, &[]);
    assert_eq!(
        error_of(&outcome),
        ("KeyError".to_string(), "boom".to_string())
    );
    assert_balanced(&outcome);
}

#[test]
fn test_runs_without_ref_debug() {
    let (module, unit) = {
        let _ = env_logger::builder().is_test(true).try_init();
        let unit = parse_module(ADD).unwrap().remove(0);
        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut module = Module::new("plain");
        Translator::new(TranslatorConfig::default())
            .translate(&session, &mut module, &unit)
            .unwrap();
        (module, unit)
    };
    assert!(module.lookup_extern("_Py_RefTotal").is_none());

    let mut sim = SimRuntime::new(&TranslatorConfig::default()).unwrap();
    let globals = sim.new_dict().unwrap();
    let args = vec![sim.new_int(20).unwrap(), sim.new_int(22).unwrap()];
    let outcome = sim.run_unit(&module, &unit, globals, &args).unwrap();
    assert_eq!(outcome.result.as_deref(), Some("42"));
    assert!(outcome.balance.is_balanced(), "{}", outcome.balance);
}

const EITHER: &str = r#"
code either(a, b) {
    LOAD_FAST a
    JUMP_IF_TRUE_OR_POP done
    LOAD_FAST b
done:
    RETURN_VALUE
}
"#;

const BOTH: &str = r#"
code both(a, b) {
    LOAD_FAST a
    JUMP_IF_FALSE_OR_POP done
    LOAD_FAST b
done:
    RETURN_VALUE
}
"#;

#[test]
fn test_jump_or_pop_keeps_deciding_value() {
    for (source, args, expect) in [
        (EITHER, [0, 7], "7"),
        (EITHER, [3, 7], "3"),
        (BOTH, [0, 7], "0"),
        (BOTH, [3, 7], "7"),
    ] {
        let outcome = run_ints(source, &args);
        assert_eq!(outcome.result.as_deref(), Some(expect), "{:?}", args);
        assert_balanced(&outcome);
    }
}

#[test]
fn test_jump_or_pop_truth_failure_drains_peeked_value() {
    for source in [EITHER, BOTH] {
        let (sim, outcome) = run_with(source, |sim| {
            sim.fail_next("PyObject_IsTrue").unwrap();
            vec![sim.new_int(3).unwrap(), sim.new_int(7).unwrap()]
        });
        assert_eq!(error_of(&outcome).0, "SimulatedFailure");
        assert_eq!(sim.call_count("PyObject_IsTrue"), 1);
        assert_balanced(&outcome);
    }
}

#[test]
fn test_truth_of_singletons_needs_no_call() {
    let source = r#"
code f() {
    LOAD_CONST True
    JUMP_IF_FALSE_OR_POP done
    LOAD_CONST False
    JUMP_IF_TRUE_OR_POP done
    LOAD_CONST 5
done:
    RETURN_VALUE
}
"#;
    let (sim, outcome) = run_with(source, |_| Vec::new());
    assert_eq!(outcome.result.as_deref(), Some("5"));
    assert_eq!(sim.call_count("PyObject_IsTrue"), 0);
    assert_balanced(&outcome);
}

#[test]
fn test_identity_and_containment() {
    let source = r#"
code f(a, s) {
    LOAD_FAST a
    LOAD_FAST a
    COMPARE_OP is
    LOAD_FAST a
    LOAD_FAST s
    COMPARE_OP is not
    LOAD_CONST 99
    LOAD_FAST s
    COMPARE_OP not in
    LOAD_FAST a
    LOAD_FAST s
    COMPARE_OP not in
    BUILD_TUPLE 4
    RETURN_VALUE
}
"#;
    let (sim, outcome) = run_with(source, |sim| {
        let items = vec![sim.new_int(6).unwrap(), sim.new_int(3).unwrap()];
        vec![sim.new_int(6).unwrap(), sim.new_list(items).unwrap()]
    });
    assert_eq!(outcome.result.as_deref(), Some("(True, True, True, False)"));
    assert_eq!(sim.call_count("PySequence_Contains"), 2);
    assert_eq!(sim.call_count("PyObject_RichCompare"), 0);
    assert_balanced(&outcome);
}

#[test]
fn test_exception_match() {
    let source = r#"
code f() {
    LOAD_GLOBAL KeyError
    LOAD_GLOBAL KeyError
    COMPARE_OP exc_match
    LOAD_GLOBAL KeyError
    LOAD_GLOBAL ValueError
    LOAD_GLOBAL TypeError
    BUILD_TUPLE 2
    COMPARE_OP exc_match
    BUILD_TUPLE 2
    RETURN_VALUE
}
"#;
    let outcome = run_ints(source, &[]);
    assert_eq!(outcome.result.as_deref(), Some("(True, False)"));
    assert_balanced(&outcome);

    let not_a_class = r#"
code f() {
    LOAD_GLOBAL KeyError
    LOAD_CONST 1
    COMPARE_OP exc_match
    RETURN_VALUE
}
"#;
    let outcome = run_ints(not_a_class, &[]);
    assert_eq!(
        error_of(&outcome),
        (
            "TypeError".to_string(),
            "catching classes that do not inherit from BaseException is not allowed".to_string()
        )
    );
    assert_balanced(&outcome);
}

#[test]
fn test_slices_with_either_bound() {
    let source = r#"
code f(t) {
    LOAD_FAST t
    LOAD_CONST 1
    SLICE+1
    LOAD_FAST t
    LOAD_CONST 2
    SLICE+2
    LOAD_FAST t
    LOAD_CONST 1
    LOAD_CONST -1
    SLICE+3
    BUILD_TUPLE 3
    RETURN_VALUE
}
"#;
    let (_, outcome) = run_with(source, |sim| vec![int_tuple(sim, &[1, 2, 3, 4])]);
    assert_eq!(outcome.result.as_deref(), Some("((2, 3, 4), (1, 2), (2, 3))"));
    assert_balanced(&outcome);
}

/// Apply `body` to a fresh list `s = [1, 2, 3, 4]` and return it. `v` is `(8, 9)`.
fn assign_slice(body: &str) -> RunOutcome {
    let source = format!(
        r#"
code f(v) {{
    .locals s
    LOAD_CONST 1
    LOAD_CONST 2
    LOAD_CONST 3
    LOAD_CONST 4
    BUILD_LIST 4
    STORE_FAST s
{}
    LOAD_FAST s
    RETURN_VALUE
}}
"#,
        body
    );
    run_with(&source, |sim| vec![int_tuple(sim, &[8, 9])]).1
}

#[test]
fn test_store_and_delete_slice() {
    let cases = [
        ("LOAD_FAST v\n LOAD_FAST s\n STORE_SLICE+0", "[8, 9]"),
        ("LOAD_FAST v\n LOAD_FAST s\n LOAD_CONST 3\n STORE_SLICE+1", "[1, 2, 3, 8, 9]"),
        ("LOAD_FAST v\n LOAD_FAST s\n LOAD_CONST 1\n STORE_SLICE+2", "[8, 9, 2, 3, 4]"),
        ("LOAD_FAST v\n LOAD_FAST s\n LOAD_CONST 1\n LOAD_CONST 3\n STORE_SLICE+3", "[1, 8, 9, 4]"),
        ("LOAD_FAST s\n DELETE_SLICE+0", "[]"),
        ("LOAD_FAST s\n LOAD_CONST 2\n DELETE_SLICE+1", "[1, 2]"),
        ("LOAD_FAST s\n LOAD_CONST 1\n DELETE_SLICE+2", "[2, 3, 4]"),
        ("LOAD_FAST s\n LOAD_CONST 1\n LOAD_CONST 3\n DELETE_SLICE+3", "[1, 4]"),
    ];
    for (body, expect) in cases {
        let outcome = assign_slice(body);
        assert_eq!(outcome.error, None, "{}", body);
        assert_eq!(outcome.result.as_deref(), Some(expect), "{}", body);
        assert_balanced(&outcome);
    }
}

#[test]
fn test_load_closure_pushes_the_cell() {
    let source = r#"
code f() {
    .cellvars c
    LOAD_CONST 5
    STORE_DEREF c
    LOAD_CLOSURE c
    LOAD_CLOSURE c
    COMPARE_OP is
    LOAD_DEREF c
    BUILD_TUPLE 2
    RETURN_VALUE
}
"#;
    let outcome = run_ints(source, &[]);
    assert_eq!(outcome.result.as_deref(), Some("(True, 5)"));
    assert_balanced(&outcome);
}

#[test]
fn test_delete_fast_unbinds_local() {
    let keep = r#"
code f(a) {
    LOAD_FAST a
    DELETE_FAST a
    RETURN_VALUE
}
"#;
    let outcome = run_ints(keep, &[4]);
    assert_eq!(outcome.result.as_deref(), Some("4"));
    assert_balanced(&outcome);

    let reload = r#"
code f(a) {
    DELETE_FAST a
    LOAD_FAST a
    RETURN_VALUE
}
"#;
    let outcome = run_ints(reload, &[4]);
    assert_eq!(
        error_of(&outcome),
        (
            "UnboundLocalError".to_string(),
            "local variable 'a' referenced before assignment".to_string()
        )
    );
    assert_balanced(&outcome);
}
