//! Property tests: random straight-line opcode sequences are tracked by a symbolic stack
//! model, then checked against the static depth pass and against actual execution.

use bumpalo::Bump;
use proptest::prelude::*;
use stackjit::core::{CompilationSession, TranslatorConfig};
use stackjit::ir::Module;
use stackjit::lower::{CodeUnit, Const, Opcode, Translator};
use stackjit::sim::SimRuntime;

const ARG: i64 = 7;

#[derive(Debug, Clone, Copy)]
enum Step {
    Const(i64),
    LoadArg,
    Pop,
    Dup,
    DupX(usize),
    RotTwo,
    RotThree,
    RotFour,
    Add,
    Sub,
    Xor,
    Negative,
    Invert,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (-100i64..100).prop_map(Step::Const),
        2 => Just(Step::LoadArg),
        1 => Just(Step::Pop),
        1 => Just(Step::Dup),
        1 => (1usize..=5).prop_map(Step::DupX),
        1 => Just(Step::RotTwo),
        1 => Just(Step::RotThree),
        1 => Just(Step::RotFour),
        1 => Just(Step::Add),
        1 => Just(Step::Sub),
        1 => Just(Step::Xor),
        1 => Just(Step::Negative),
        1 => Just(Step::Invert),
    ]
}

/// A unit built from the applicable steps, the depth before each instruction, and the
/// values left on the stack.
struct Program {
    unit: CodeUnit,
    depths: Vec<usize>,
    stack: Vec<i64>,
}

fn build(steps: &[Step]) -> Program {
    let mut unit = CodeUnit::new("prop");
    unit.varnames = vec!["x".to_string()];
    unit.argcount = 1;
    let mut depths = Vec::new();
    let mut stack: Vec<i64> = Vec::new();

    for &step in steps {
        let needed = match step {
            Step::Const(_) | Step::LoadArg => 0,
            Step::Pop | Step::Dup | Step::Negative | Step::Invert => 1,
            Step::RotTwo | Step::Add | Step::Sub | Step::Xor => 2,
            Step::RotThree => 3,
            Step::RotFour => 4,
            Step::DupX(n) => n,
        };
        if stack.len() < needed {
            continue;
        }
        depths.push(stack.len());
        let len = stack.len();
        match step {
            Step::Const(v) => {
                let index = unit.const_index(Const::Int(v));
                unit.push(Opcode::LoadConst, Some(index as i32));
                stack.push(v);
            }
            Step::LoadArg => {
                unit.push(Opcode::LoadFast, Some(0));
                stack.push(ARG);
            }
            Step::Pop => {
                unit.push(Opcode::PopTop, None);
                stack.pop();
            }
            Step::Dup => {
                unit.push(Opcode::DupTop, None);
                stack.push(stack[len - 1]);
            }
            Step::DupX(n) => {
                unit.push(Opcode::DupTopX, Some(n as i32));
                stack.extend_from_within(len - n..);
            }
            Step::RotTwo => {
                unit.push(Opcode::RotTwo, None);
                stack.swap(len - 1, len - 2);
            }
            Step::RotThree => {
                unit.push(Opcode::RotThree, None);
                stack[len - 3..].rotate_right(1);
            }
            Step::RotFour => {
                unit.push(Opcode::RotFour, None);
                stack[len - 4..].rotate_right(1);
            }
            Step::Add | Step::Sub | Step::Xor => {
                let (opcode, f): (Opcode, fn(i64, i64) -> i64) = match step {
                    Step::Add => (Opcode::BinaryAdd, |a, b| a + b),
                    Step::Sub => (Opcode::BinarySubtract, |a, b| a - b),
                    _ => (Opcode::BinaryXor, |a, b| a ^ b),
                };
                unit.push(opcode, None);
                let rhs = stack.pop().unwrap();
                let lhs = stack.pop().unwrap();
                stack.push(f(lhs, rhs));
            }
            Step::Negative => {
                unit.push(Opcode::UnaryNegative, None);
                stack[len - 1] = -stack[len - 1];
            }
            Step::Invert => {
                unit.push(Opcode::UnaryInvert, None);
                stack[len - 1] = !stack[len - 1];
            }
        }
    }

    depths.push(stack.len());
    unit.push(Opcode::BuildTuple, Some(stack.len() as i32));
    depths.push(1);
    unit.push(Opcode::ReturnValue, None);
    unit.stacksize = unit.compute_stacksize().unwrap_or(0);
    Program {
        unit,
        depths,
        stack,
    }
}

fn tuple_repr(values: &[i64]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    match parts.len() {
        1 => format!("({},)", parts[0]),
        _ => format!("({})", parts.join(", ")),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_static_depths_follow_stack_effects(steps in prop::collection::vec(step(), 0..40)) {
        let program = build(&steps);
        let map = program.unit.static_depths().unwrap();
        let expected: Vec<Option<usize>> = program.depths.iter().copied().map(Some).collect();
        prop_assert_eq!(map.depths, expected);
        let max = program.depths.iter().copied().max().unwrap_or(0).max(1);
        prop_assert!(map.max_depth >= max);
    }

    #[test]
    fn prop_execution_matches_symbolic_stack(steps in prop::collection::vec(step(), 0..40)) {
        let _ = env_logger::builder().is_test(true).try_init();
        let program = build(&steps);
        let config = TranslatorConfig::default().with_ref_debug(true).with_verify(true);

        let arena = Bump::new();
        let session = CompilationSession::new(&arena);
        let mut module = Module::new("prop");
        Translator::new(config)
            .translate(&session, &mut module, &program.unit)
            .unwrap();

        let mut sim = SimRuntime::new(&config).unwrap();
        let globals = sim.new_dict().unwrap();
        let arg = sim.new_int(ARG).unwrap();
        let outcome = sim.run_unit(&module, &program.unit, globals, &[arg]).unwrap();

        prop_assert_eq!(outcome.error, None);
        prop_assert_eq!(outcome.result, Some(tuple_repr(&program.stack)));
        prop_assert!(outcome.balance.is_balanced(), "{}", outcome.balance);
        prop_assert!(sim.violations().is_empty());
    }
}
