use proptest::{
    prelude::{any, prop},
    test_runner::{Config, TestCaseError, TestRunner},
};
use vigil_ast::{ExprKind, Param, PatternKind, Stmt, TypeParamKind};
use vigil_parse::{MAX_NESTING, parse_expr, parse_module, render_module};

#[test]
fn function_signature_keeps_parameter_kinds() {
    let module = parse_module("def f(a, b: int = 1, /, *args: str, c, **kw) -> bool:\n    return True\n")
        .expect("function should parse");
    let Stmt::FunctionDef(f) = &module.body[0] else {
        panic!("expected function");
    };
    assert_eq!(f.name.node, "f");
    assert!(matches!(f.params[0], Param::Named(_)));
    assert!(matches!(f.params[2], Param::PositionalOnlyMarker(_)));
    assert!(matches!(f.params[3], Param::VarPositional(_)));
    assert!(matches!(f.params[5], Param::VarKeyword(_)));
    assert!(f.returns.is_some());
}

#[test]
fn elif_chain_nests_in_orelse() {
    let module = parse_module("if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n").unwrap();
    let Stmt::If(outer) = &module.body[0] else {
        panic!("expected if");
    };
    let [Stmt::If(inner)] = outer.orelse.as_slice() else {
        panic!("expected elif as nested if");
    };
    assert_eq!(inner.orelse.len(), 1);
}

#[test]
fn semicolons_split_simple_statements() {
    let module = parse_module("a = 1; b = 2;\n").unwrap();
    assert_eq!(module.body.len(), 2);
}

#[test]
fn chained_assignment_keeps_all_targets() {
    let module = parse_module("a = b = c\n").unwrap();
    let Stmt::Assign(assign) = &module.body[0] else {
        panic!("expected assignment");
    };
    assert_eq!(assign.targets.len(), 2);
    assert_eq!(assign.value.as_name(), Some("c"));
}

#[test]
fn comparison_chains_are_kept_whole() {
    let expr = parse_expr("a < b <= c is not d not in e").unwrap();
    let ExprKind::Compare { ops, .. } = expr.kind else {
        panic!("expected comparison");
    };
    assert_eq!(ops.len(), 4);
}

#[test]
fn missing_colon_is_a_parse_error() {
    let err = parse_module("def f(x)\n    return x\n").expect_err("expected parse error");
    assert!(err.message.contains("Colon"), "unexpected error message: {}", err.message);
}

#[test]
fn unexpected_indent_is_rejected() {
    let err = parse_module("x = 1\n    y = 2\n").expect_err("expected parse error");
    assert!(err.message.contains("unexpected indent"));
}

#[test]
fn missing_block_is_rejected() {
    let err = parse_module("if x:\ny = 1\n").expect_err("expected parse error");
    assert!(err.message.contains("indented block"));
}

#[test]
fn try_without_handlers_is_rejected() {
    let err = parse_module("try:\n    pass\nx = 1\n").expect_err("expected parse error");
    assert!(err.message.contains("'except' or 'finally'"));
}

#[test]
fn lex_errors_surface_as_parse_errors() {
    let err = parse_module("x = $\n").expect_err("expected parse error");
    assert!(err.message.contains("unexpected character"));
}

#[test]
fn from_import_span_ends_at_last_name() {
    for src in ["from a import *\n", "from . import (b, c as d)\n", "from a.b import c, d as e\n"] {
        let module = parse_module(src).unwrap();
        let Stmt::ImportFrom(s) = &module.body[0] else {
            panic!("expected from-import");
        };
        assert_eq!(s.span.offset(), 0);
        assert_eq!(s.span.offset() + s.span.len(), src.len() - 1, "span of {src:?}");
    }
    parse_module("from a import ()\n").expect_err("empty name list");
}

#[test]
fn match_statement_parses_cases_and_patterns() {
    let src = "match point:\n    case (0, 0):\n        pass\n    case Point(x=0, y=y) if y > 0:\n        pass\n    case {\"x\": x, **rest}:\n        pass\n    case [1, *others] | None:\n        pass\n    case _:\n        pass\n";
    let module = parse_module(src).expect("match should parse");
    let Stmt::Match(m) = &module.body[0] else {
        panic!("expected match");
    };
    assert_eq!(m.subject.as_name(), Some("point"));
    assert_eq!(m.cases.len(), 5);
    assert!(matches!(&m.cases[0].pattern.kind, PatternKind::Sequence(elts) if elts.len() == 2));
    assert!(matches!(&m.cases[1].pattern.kind, PatternKind::Class { keywords, .. } if keywords.len() == 2));
    assert!(m.cases[1].guard.is_some());
    assert!(matches!(&m.cases[2].pattern.kind, PatternKind::Mapping { rest: Some(_), .. }));
    assert!(matches!(&m.cases[3].pattern.kind, PatternKind::Or(alts) if alts.len() == 2));
    assert!(matches!(
        m.cases[4].pattern.kind,
        PatternKind::As {
            pattern: None,
            name: None
        }
    ));
}

#[test]
fn match_and_type_stay_ordinary_names() {
    let module = parse_module("match = re.match(p, s)\nmatch(x)\nmatch.group(1)\ntype = 3\nprint(type(x))\n").unwrap();
    assert_eq!(module.body.len(), 5);
    assert!(matches!(&module.body[0], Stmt::Assign(_)));
    assert!(matches!(&module.body[1], Stmt::Expr(_)));
    assert!(matches!(&module.body[3], Stmt::Assign(_)));
}

#[test]
fn match_without_case_block_is_rejected() {
    let err = parse_module("match x:\n    y = 1\n").expect_err("expected parse error");
    assert!(err.message.contains("expected"), "unexpected error message: {}", err.message);
}

#[test]
fn exception_group_handlers_are_marked() {
    let module = parse_module("try:\n    run()\nexcept* ValueError as eg:\n    pass\nexcept* (KeyError, TypeError):\n    pass\n").unwrap();
    let Stmt::Try(t) = &module.body[0] else {
        panic!("expected try");
    };
    assert!(t.is_star);
    assert_eq!(t.handlers.len(), 2);
    assert_eq!(t.handlers[0].name.as_ref().map(|n| n.node.as_str()), Some("eg"));
}

#[test]
fn mixed_except_forms_are_rejected() {
    let err = parse_module("try:\n    pass\nexcept ValueError:\n    pass\nexcept* KeyError:\n    pass\n")
        .expect_err("expected parse error");
    assert!(err.message.contains("except*"));
    parse_module("try:\n    pass\nexcept*:\n    pass\n").expect_err("except* needs a type");
}

#[test]
fn parenthesized_with_items_are_split() {
    let module = parse_module("with (open(a) as f, open(b) as g,):\n    pass\n").unwrap();
    let Stmt::With(w) = &module.body[0] else {
        panic!("expected with");
    };
    assert_eq!(w.items.len(), 2);
    assert!(w.items.iter().all(|item| item.var.is_some()));

    let module = parse_module("with (a, b) as c:\n    pass\n").unwrap();
    let Stmt::With(w) = &module.body[0] else {
        panic!("expected with");
    };
    assert_eq!(w.items.len(), 1);
    assert!(matches!(w.items[0].context.kind, ExprKind::Tuple(_)));
}

#[test]
fn type_parameters_and_aliases_parse() {
    let module = parse_module("type Vec2[T: float = float] = tuple[T, T]\ndef f[T, *Ts, **P](x: T) -> T:\n    return x\nclass C[T]:\n    pass\n").unwrap();
    let Stmt::TypeAlias(alias) = &module.body[0] else {
        panic!("expected type alias");
    };
    assert_eq!(alias.name.node, "Vec2");
    assert!(alias.type_params[0].bound.is_some());
    assert!(alias.type_params[0].default.is_some());

    let Stmt::FunctionDef(f) = &module.body[1] else {
        panic!("expected function");
    };
    let kinds: Vec<_> = f.type_params.iter().map(|p| p.kind).collect();
    assert_eq!(
        kinds,
        vec![TypeParamKind::TypeVar, TypeParamKind::TypeVarTuple, TypeParamKind::ParamSpec]
    );

    let Stmt::ClassDef(c) = &module.body[2] else {
        panic!("expected class");
    };
    assert_eq!(c.type_params.len(), 1);
}

#[test]
fn excessive_nesting_is_a_parse_error() {
    let depth = MAX_NESTING * 10;
    let src = format!("x = {}1{}\n", "(".repeat(depth), ")".repeat(depth));
    // Runs with the stack size the binary's main thread gets.
    let err = std::thread::Builder::new()
        .stack_size(8 * 1024 * 1024)
        .spawn(move || parse_module(&src).expect_err("expected parse error"))
        .unwrap()
        .join()
        .unwrap();
    assert!(err.message.contains("too many nested"), "unexpected error message: {}", err.message);

    let ok = format!("x = {}1{}\n", "(".repeat(MAX_NESTING / 2), ")".repeat(MAX_NESTING / 2));
    parse_module(&ok).expect("moderate nesting parses");
}

#[test]
fn long_docstrings_parse_on_a_small_stack() {
    let doc = "A line mentioning 'quoted' and \"double\" text with a \\\\ escape.\n".repeat(2000);
    let src = format!(
        "class Op:\n    \"\"\"{doc}\"\"\"\n\n    def f(self, x):\n        if x:\n            return [{{'k': (x, [x])}}]\n        return None\n"
    );
    let parsed = std::thread::Builder::new()
        .stack_size(1024 * 1024)
        .spawn(move || parse_module(&src).map(|m| m.body.len()))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(parsed.unwrap(), 1);
}

#[test]
fn long_elif_chains_parse_and_render() {
    let mut src = String::from("if x == 0:\n    pass\n");
    for i in 1..500 {
        src.push_str(&format!("elif x == {i}:\n    pass\n"));
    }
    src.push_str("else:\n    y = 1\n");
    let module = parse_module(&src).unwrap();
    assert_eq!(module.body.len(), 1);
    assert_eq!(render_module(&module), src);
}

#[test]
fn error_span_points_at_offending_token() {
    let src = "x = (1, 2\ny = 3\n";
    let err = parse_module(src).expect_err("expected parse error");
    let offset: usize = err.span.offset();
    assert!(offset >= src.find('y').unwrap_or(0));
}

fn module_from_ops(ops: &[u32]) -> String {
    let a = ops.first().copied().unwrap_or(0) % 50;
    let b = ops.get(1).copied().unwrap_or(1) % 50;
    let c = ops.get(2).copied().unwrap_or(2) % 3;
    let cond = ["a < b", "not a", "a is None or b"][c as usize];
    format!(
        "def f{a}(a: int, b={b}):\n    total = a * {a} + b ** 2 - (a - b)\n    if {cond}:\n        return [x for x in range(total) if x % {b}]\n    try:\n        v = d[a:b]\n    except Exception as e:\n        v = None\n    return v\n"
    )
}

#[test]
fn rendered_modules_reparse_to_the_same_tree_shape() {
    let mut runner = TestRunner::new(Config {
        cases: 64,
        ..Config::default()
    });
    runner
        .run(&prop::collection::vec(any::<u32>(), 3), |ops| {
            let src = module_from_ops(&ops);
            let module = parse_module(&src).map_err(|e| TestCaseError::fail(format!("{e}")))?;
            let rendered = render_module(&module);
            let reparsed =
                parse_module(&rendered).map_err(|e| TestCaseError::fail(format!("{e}\n{rendered}")))?;
            if render_module(&reparsed) != rendered {
                return Err(TestCaseError::fail(format!("render is not stable:\n{rendered}")));
            }
            Ok(())
        })
        .expect("render round trip");
}
