use proptest::{
    prelude::{any, prop},
    test_runner::{Config, TestCaseError, TestRunner},
};
use vigil_ast::{Module, Stmt};
use vigil_instrument::{GuardKind, RuleSet, Transformer};
use vigil_parse::{parse_module, render_module};

const TYPES: [&str; 4] = ["int", "str", "np.ndarray", "list[int]"];

/// A function with `n` parameters (annotation chosen per entry, `None` = unannotated),
/// `assigns` single-name assignments and a final `return`.
fn function_source(params: &[Option<usize>], assigns: usize) -> String {
    let sig: Vec<String> = params
        .iter()
        .enumerate()
        .map(|(i, ann)| match ann {
            Some(t) => format!("p{i}: {}", TYPES[*t % TYPES.len()]),
            None => format!("p{i}"),
        })
        .collect();
    let mut src = format!("def f({}) -> int:\n", sig.join(", "));
    for i in 0..assigns {
        src.push_str(&format!("    v{i} = p0 if p0 else {i}\n"));
    }
    src.push_str("    return 1\n");
    src
}

fn function_body(module: &Module) -> &[Stmt] {
    match &module.body[0] {
        Stmt::FunctionDef(f) => f.body.as_slice(),
        _ => &[],
    }
}

fn assert_message(stmt: &Stmt) -> Option<String> {
    let Stmt::Assert(a) = stmt else {
        return None;
    };
    a.msg.as_ref().map(vigil_parse::render_expr)
}

#[test]
fn guard_layout_matches_signature_and_body() {
    let mut runner = TestRunner::new(Config {
        cases: 128,
        ..Config::default()
    });
    let strategy = (
        prop::collection::vec(prop::option::of(any::<usize>()), 1..5),
        0usize..4,
    );
    runner
        .run(&strategy, |(params, assigns)| {
            let src = function_source(&params, assigns);
            let module = parse_module(&src).map_err(|e| TestCaseError::fail(format!("{e}")))?;
            let rules = RuleSet::default();
            let out = Transformer::new(&rules).transform_module(module);
            let body = function_body(&out.module);

            // One leading guard per parameter, in declaration order.
            for i in 0..params.len() {
                let msg = assert_message(&body[i])
                    .ok_or_else(|| TestCaseError::fail(format!("stmt {i} is not a guard")))?;
                if !msg.starts_with(&format!("'p{i} should")) {
                    return Err(TestCaseError::fail(format!("guard {i} out of order: {msg}")));
                }
            }

            // Each assignment is immediately followed by its guard.
            for i in 0..assigns {
                let at = params.len() + 2 * i;
                if !matches!(body[at], Stmt::Assign(_)) {
                    return Err(TestCaseError::fail(format!("stmt {at} is not the assignment")));
                }
                let msg = assert_message(&body[at + 1]).unwrap_or_default();
                if msg != format!("'v{i} should not be None after assignment'") {
                    return Err(TestCaseError::fail(format!("unexpected guard after assignment: {msg}")));
                }
            }

            // Postcondition immediately before the return, nothing after it.
            let n = body.len();
            if n != params.len() + 2 * assigns + 2 || !matches!(body[n - 1], Stmt::Return(_)) {
                return Err(TestCaseError::fail(format!("unexpected body layout:\n{}", render_module(&out.module))));
            }
            if assert_message(&body[n - 2]).as_deref() != Some("'Return value should be of type int'") {
                return Err(TestCaseError::fail("postcondition missing".to_string()));
            }

            let expected_type_checks = params
                .iter()
                .filter(|p| p.is_some_and(|t| t % TYPES.len() != 3))
                .count();
            let type_checks = out
                .insertions
                .iter()
                .filter(|i| i.kind == GuardKind::ParamType)
                .count();
            if type_checks != expected_type_checks {
                return Err(TestCaseError::fail(format!(
                    "expected {expected_type_checks} type checks, found {type_checks}"
                )));
            }
            Ok(())
        })
        .expect("guard layout property");
}

#[test]
fn unannotated_params_never_get_type_checks() {
    let mut runner = TestRunner::new(Config {
        cases: 64,
        ..Config::default()
    });
    runner
        .run(&(1usize..6), |n| {
            let params = vec![None; n];
            let module = parse_module(&function_source(&params, 0))
                .map_err(|e| TestCaseError::fail(format!("{e}")))?;
            let rules = RuleSet::default();
            let out = Transformer::new(&rules).transform_module(module);
            let not_none = out
                .insertions
                .iter()
                .filter(|i| i.kind == GuardKind::ParamNotNone)
                .count();
            if not_none != n || out.insertions.iter().any(|i| i.kind == GuardKind::ParamType) {
                return Err(TestCaseError::fail(format!("bad guards for {n} params")));
            }
            Ok(())
        })
        .expect("not-none property");
}

#[test]
fn second_pass_doubles_guards() {
    let mut runner = TestRunner::new(Config {
        cases: 64,
        ..Config::default()
    });
    let strategy = (
        prop::collection::vec(prop::option::of(any::<usize>()), 1..4),
        0usize..3,
    );
    runner
        .run(&strategy, |(params, assigns)| {
            let rules = RuleSet::default();
            let transformer = Transformer::new(&rules);
            let src = function_source(&params, assigns);
            let once = transformer
                .transform_module(parse_module(&src).map_err(|e| TestCaseError::fail(format!("{e}")))?);
            let twice = transformer.transform_module(once.module.clone());

            // Every guard is derived again; the inserted asserts earn none of their own.
            let first = once.insertions.len();
            let second = twice.insertions.len();
            if second != params.len() + assigns + 1 {
                return Err(TestCaseError::fail(format!("second pass added {second} guards")));
            }
            let body_len = |m: &Module| function_body(m).len();
            if body_len(&twice.module) != body_len(&once.module) + params.len() + assigns + 1 {
                return Err(TestCaseError::fail("second pass left body unchanged".to_string()));
            }
            if first != params.len() + assigns + 1 {
                return Err(TestCaseError::fail(format!("first pass added {first} guards")));
            }
            Ok(())
        })
        .expect("non-idempotence property");
}
