use vigil_instrument::{RuleConfig, RuleSet, Transformer};
use vigil_parse::{parse_module, render_module};

fn instrument_with(rules: &RuleSet, src: &str) -> String {
    let module = parse_module(src).expect("source should parse");
    let out = Transformer::new(rules).transform_module(module);
    let rendered = render_module(&out.module);
    parse_module(&rendered).expect("instrumented output should parse");
    rendered
}

fn instrument(src: &str) -> String {
    instrument_with(&RuleSet::default(), src)
}

#[test]
fn typed_function_gets_type_checks() {
    assert_eq!(
        instrument("def f(x: int) -> int:\n    return x + 1\n"),
        "def f(x: int) -> int:\n    assert isinstance(x, int), 'x should be of type int'\n    assert isinstance(x + 1, int), 'Return value should be of type int'\n    return x + 1\n"
    );
}

#[test]
fn untyped_function_gets_not_none_checks() {
    assert_eq!(
        instrument("def g(y):\n    return y\n"),
        "def g(y):\n    assert y is not None, 'y should not be None'\n    assert y is not None, 'Return value should not be None'\n    return y\n"
    );
}

#[test]
fn second_run_adds_a_second_layer() {
    let once = instrument("def g(y):\n    return y\n");
    let twice = instrument(&once);
    assert_eq!(
        twice,
        "def g(y):\n    assert y is not None, 'y should not be None'\n    assert y is not None, 'y should not be None'\n    assert y is not None, 'Return value should not be None'\n    assert y is not None, 'Return value should not be None'\n    return y\n"
    );
}

#[test]
fn only_catch_all_handlers_are_contained() {
    let src = "def h(path):\n    try:\n        data = load(path)\n    except FileNotFoundError:\n        data = None\n    except Exception as exc:\n        log(exc)\n    return data\n";
    assert_eq!(
        instrument(src),
        "def h(path):\n    assert path is not None, 'path should not be None'\n    try:\n        data = load(path)\n        assert data is not None, 'data should not be None after assignment'\n    except FileNotFoundError:\n        data = None\n        assert data is not None, 'data should not be None after assignment'\n    except Exception as exc:\n        log(exc)\n        assert False, 'Unhandled exception occurred'\n    assert data is not None, 'Return value should not be None'\n    return data\n"
    );
}

#[test]
fn bare_except_counts_when_configured() {
    let rules = RuleSet::new(RuleConfig {
        bare_except_is_catch_all: true,
        ..RuleConfig::default()
    });
    let out = instrument_with(&rules, "try:\n    run()\nexcept:\n    pass\n");
    assert!(out.ends_with("    pass\n    assert False, 'Unhandled exception occurred'\n"));
}

#[test]
fn other_statement_shapes_pass_through() {
    let src = "import os\n\nclass C(Base):\n    count: int = 0\n\n    @property\n    def size(self):\n        self.n += 1\n        a, b = pair\n        return a\n\nx = y = 0\n";
    let out = instrument(src);
    assert!(!out.contains("count should"));
    assert!(!out.contains("self should"));
    assert!(!out.contains("Return value"));
    assert!(!out.contains("x should"));
    assert_eq!(out.matches("assert").count(), 0);
}

#[test]
fn docstring_follows_parameter_guards() {
    let out = instrument("def f(a):\n    \"\"\"Doc.\"\"\"\n    return a\n");
    assert!(out.starts_with(
        "def f(a):\n    assert a is not None, 'a should not be None'\n    \"\"\"Doc.\"\"\"\n"
    ));
}

#[test]
fn returned_expression_is_copied_into_guard() {
    let out = instrument("def f(x):\n    return x['k']\n");
    assert!(out.contains("assert x['k'] is not None, 'Return value should not be None'\n"));
}
