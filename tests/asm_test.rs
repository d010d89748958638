//! Listing parser tests covering whole files with several code units.

use stackjit::asm::parse_module;
use stackjit::lower::{CmpOp, Const, Opcode};

const LISTING: &str = r#"
; two units in one file

code total(seq) {
    .locals acc, x
    LOAD_CONST 0
    STORE_FAST acc
    SETUP_LOOP done
    LOAD_FAST seq
    GET_ITER
top:
    FOR_ITER exit
    STORE_FAST x
    LOAD_FAST acc
    LOAD_FAST x
    INPLACE_ADD
    STORE_FAST acc
    JUMP_ABSOLUTE top
exit:
    POP_BLOCK
done:   LOAD_FAST acc
    RETURN_VALUE
}

code closure() {
    .cellvars counter
    .freevars outer
    LOAD_DEREF outer        ; free variables follow the cells
    STORE_DEREF counter
    LOAD_CONST ("a", -1, (True, False))
    RETURN_VALUE
}
"#;

#[test]
fn test_parse_listing_with_two_units() {
    let _ = env_logger::builder().is_test(true).try_init();
    let units = parse_module(LISTING).unwrap();
    assert_eq!(units.len(), 2);

    let total = &units[0];
    assert_eq!(total.name, "total");
    assert_eq!(total.argcount, 1);
    assert_eq!(total.varnames, vec!["seq", "acc", "x"]);
    assert_eq!(total.instrs.len(), 15);
    assert_eq!(total.instrs[2].opcode, Opcode::SetupLoop);
    assert_eq!(total.instrs[2].target, Some(13));
    assert_eq!(total.instrs[5].opcode, Opcode::ForIter);
    assert_eq!(total.instrs[5].target, Some(12));
    assert_eq!(total.instrs[11].target, Some(5));
    assert_eq!(total.instrs[13].opcode, Opcode::LoadFast);
    // The iterator plus two operands.
    assert_eq!(total.stacksize, 3);

    let closure = &units[1];
    assert_eq!(closure.cellvars, vec!["counter"]);
    assert_eq!(closure.freevars, vec!["outer"]);
    assert_eq!(closure.instrs[0].arg, Some(1));
    assert_eq!(closure.instrs[1].arg, Some(0));
    assert_eq!(
        closure.consts,
        vec![Const::Tuple(vec![
            Const::Str("a".to_string()),
            Const::Int(-1),
            Const::Tuple(vec![Const::True, Const::False]),
        ])]
    );
}

#[test]
fn test_compare_symbols() {
    let units = parse_module(
        r#"
code f(a, b) {
    LOAD_FAST a
    LOAD_FAST b
    COMPARE_OP is not
    LOAD_FAST a
    COMPARE_OP >=
    LOAD_FAST b
    COMPARE_OP 2
    RETURN_VALUE
}
"#,
    )
    .unwrap();
    let f = &units[0];
    assert_eq!(f.instrs[2].arg, Some(CmpOp::IsNot.arg()));
    assert_eq!(f.instrs[4].arg, Some(CmpOp::Ge.arg()));
    assert_eq!(f.instrs[6].arg, Some(CmpOp::Eq.arg()));
}

#[test]
fn test_constants_are_pooled() {
    let units = parse_module(
        "code f() {\n LOAD_CONST 1\n LOAD_CONST 1\n BINARY_ADD\n LOAD_CONST None\n POP_TOP\n RETURN_VALUE\n}\n",
    )
    .unwrap();
    let f = &units[0];
    assert_eq!(f.consts, vec![Const::Int(1), Const::None]);
    assert_eq!(f.instrs[0].arg, f.instrs[1].arg);
}

#[test]
fn test_errors_carry_line_numbers() {
    let err = parse_module("code f() {\n  LOAD_FAST y\n}\n").unwrap_err();
    assert_eq!(err.line, 2);
    assert!(err.message.contains("unknown local `y`"), "{}", err);

    let err = parse_module("code f() {\n  LOAD_CONST 1\n  RETURN_VALUE\n").unwrap_err();
    assert!(err.message.contains("unterminated code unit"), "{}", err);

    let err = parse_module("code f() {\n}\ncode f() {\n}\n").unwrap_err();
    assert_eq!(err.line, 4);
    assert!(err.message.contains("duplicate code unit `f`"), "{}", err);

    let err = parse_module("code f() {\n\n  POP_TOP extra\n}\n").unwrap_err();
    assert_eq!(err.line, 3);
    assert!(err.message.contains("unexpected text after POP_TOP"), "{}", err);

    let err = parse_module("code f() {\n .bogus\n}\n").unwrap_err();
    assert!(err.message.contains("unknown directive .bogus"), "{}", err);

    let err = parse_module("func f() {\n}\n").unwrap_err();
    assert_eq!(err.line, 1);
}

#[test]
fn test_unsupported_opcodes_still_parse() {
    let units = parse_module("code g() {\n  LOAD_CONST None\n  YIELD_VALUE\n  RETURN_VALUE\n}\n").unwrap();
    assert_eq!(units[0].instrs[1].opcode, Opcode::YieldValue);
    assert!(!Opcode::YieldValue.is_supported());
    assert_eq!(units[0].stacksize, 0);
}
