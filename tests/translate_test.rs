//! Translation tests: listings are parsed, translated and checked through the printed
//! module and the function structure.

use bumpalo::Bump;
use stackjit::asm::parse_module;
use stackjit::core::{CompilationSession, TranslateError, TranslateResult, TranslatorConfig};
use stackjit::ir::{Module, Terminator};
use stackjit::lower::{Translation, Translator};

const ADD: &str = r#"
code add(a, b) {
    LOAD_FAST a
    LOAD_FAST b
    BINARY_ADD
    RETURN_VALUE
}
"#;

const MAX: &str = r#"
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

fn translate_with(source: &str, config: TranslatorConfig) -> (Module, TranslateResult<Translation>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let units = parse_module(source).unwrap();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new("test");
    let result = Translator::new(config).translate(&session, &mut module, &units[0]);
    (module, result)
}

fn translate(source: &str) -> Module {
    let (module, result) = translate_with(source, TranslatorConfig::default().with_verify(true));
    result.unwrap();
    module
}

fn translate_err(source: &str) -> TranslateError {
    let (module, result) = translate_with(source, TranslatorConfig::default());
    assert!(module.functions().is_empty());
    result.unwrap_err()
}

#[test]
fn test_add_declares_bridge_and_function() {
    let module = translate(ADD);
    let text = module.print();
    assert!(text.contains("declare ptr @PyNumber_Add(ptr, ptr)"), "{}", text);
    assert!(text.contains("define ptr @add(ptr %0) {"), "{}", text);
    assert!(text.contains("string $0 = \"add\""), "{}", text);

    let func = module.function("add").unwrap();
    assert_eq!(func.called_externs(&module).iter().filter(|n| *n == "PyNumber_Add").count(), 1);
}

#[test]
fn test_single_exit_block() {
    let module = translate(MAX);
    let func = module.function("max").unwrap();
    let rets = func
        .blocks
        .iter()
        .filter(|b| matches!(b.term, Some(Terminator::Ret(_))))
        .count();
    assert_eq!(rets, 1);
    assert!(func.block_named("return_block").is_some());
    assert!(func.block_named("pop_loop").is_some());
}

#[test]
fn test_bytecode_blocks_named_by_offset() {
    let module = translate(MAX);
    let func = module.function("max").unwrap();
    assert!(func.block_named("entry").is_some());
    assert!(func.block_named("L0").is_some());
    assert!(func.block_named("L4").is_some());
    assert!(func.block_named("L6").is_some());
}

#[test]
fn test_entry_points_declared_once() {
    let module = translate(
        r#"
code sum3(a, b, c) {
    LOAD_FAST a
    LOAD_FAST b
    BINARY_ADD
    LOAD_FAST c
    BINARY_ADD
    RETURN_VALUE
}
"#,
    );
    let count = module
        .externs()
        .iter()
        .filter(|decl| decl.name == "PyNumber_Add")
        .count();
    assert_eq!(count, 1);
}

#[test]
fn test_ref_debug_adjusts_total() {
    let (module, result) = translate_with(ADD, TranslatorConfig::default().with_ref_debug(true).with_verify(true));
    result.unwrap();
    assert!(module.lookup_extern("_Py_RefTotal").is_some());
    assert!(module.lookup_extern("_Py_NegativeRefcount").is_some());

    let plain = translate(ADD);
    assert!(plain.lookup_extern("_Py_RefTotal").is_none());
    assert!(plain.lookup_extern("_Py_NegativeRefcount").is_none());
}

#[test]
fn test_unreachable_code_not_lowered() {
    let module = translate(
        r#"
code f() {
    LOAD_CONST 1
    RETURN_VALUE
    LOAD_CONST 2
    BINARY_ADD
    RETURN_VALUE
}
"#,
    );
    let func = module.function("f").unwrap();
    let dead = func.block_named("L2").unwrap();
    let block = &func.blocks[dead.0 as usize];
    assert!(block.insts.is_empty());
    assert!(matches!(block.term, Some(Terminator::Unreachable)));
    assert!(module.lookup_extern("PyNumber_Add").is_none());
}

#[test]
fn test_translation_reports_depths() {
    let (_, result) = translate_with(MAX, TranslatorConfig::default());
    let translation = result.unwrap();
    assert_eq!(translation.name, "max");
    assert_eq!(translation.max_depth, 2);
    assert_eq!(
        translation.depths,
        vec![Some(0), Some(1), Some(2), Some(1), Some(0), Some(1), Some(0), Some(1)]
    );
}

#[test]
fn test_unsupported_opcode_rejected() {
    let err = translate_err(
        r#"
code f() {
    LOAD_CONST None
    YIELD_VALUE
    RETURN_VALUE
}
"#,
    );
    assert_eq!(
        err,
        TranslateError::UnsupportedOpcode {
            opcode: "YIELD_VALUE",
            offset: 1
        }
    );
}

#[test]
fn test_compare_operand_out_of_range() {
    let err = translate_err(
        r#"
code f(a, b) {
    LOAD_FAST a
    LOAD_FAST b
    COMPARE_OP 11
    RETURN_VALUE
}
"#,
    );
    assert!(
        matches!(err, TranslateError::BadOperand { opcode: "COMPARE_OP", offset: 2, .. }),
        "{:?}",
        err
    );
}

#[test]
fn test_static_underflow_rejected() {
    let err = translate_err(
        r#"
code f() {
    POP_TOP
    LOAD_CONST None
    RETURN_VALUE
}
"#,
    );
    assert_eq!(
        err,
        TranslateError::StackUnderflow {
            opcode: "POP_TOP",
            offset: 0,
            needed: 1,
            depth: 0
        }
    );
}

#[test]
fn test_depth_mismatch_at_join_rejected() {
    let err = translate_err(
        r#"
code f(a) {
    LOAD_FAST a
    POP_JUMP_IF_FALSE join
    LOAD_CONST 1
join:
    LOAD_CONST None
    RETURN_VALUE
}
"#,
    );
    assert!(
        matches!(err, TranslateError::StackDepthMismatch { ref block, .. } if block == "L3"),
        "{:?}",
        err
    );
}

#[test]
fn test_session_statistics() {
    let _ = env_logger::builder().is_test(true).try_init();
    let units = parse_module(&format!("{}\n{}\ncode bad() {{\n  YIELD_VALUE\n}}\n", ADD, MAX)).unwrap();
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let mut module = Module::new("stats");
    let translator = Translator::new(TranslatorConfig::default());
    for unit in &units {
        let _ = translator.translate(&session, &mut module, unit);
        assert!(session.current_function().is_none());
    }

    let stats = session.stats();
    assert_eq!(stats.functions_translated, 2);
    assert_eq!(stats.functions_rejected, 1);
    assert_eq!(stats.opcode_counts.get("BINARY_ADD"), Some(&1));
    assert_eq!(stats.opcode_counts.get("LOAD_FAST"), Some(&6));
    assert!(stats.bridge_calls > 0);
    assert_eq!(module.functions().len(), 2);
    assert!(stats.to_string().contains("Functions rejected: 1"));
}
