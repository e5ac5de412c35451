#![forbid(unsafe_code)]

use std::fmt;

use vigil_ast::{
    AssertStmt, AssignStmt, CallArg, CmpOp, Constant, ExceptHandler, Expr, ExprKind, FunctionDef,
    Param, ReturnStmt, Span, Stmt,
};

/// Knobs for the guard rules. Defaults match a plain `crosshair` run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleConfig {
    /// Handler types treated as catch-all (matched against a bare name).
    pub catch_all: Vec<String>,
    /// Whether a bare `except:` counts as catch-all.
    pub bare_except_is_catch_all: bool,
    /// Annotations that never produce an `isinstance` check.
    pub opaque_types: Vec<String>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            catch_all: vec!["Exception".to_string()],
            bare_except_is_catch_all: false,
            opaque_types: vec!["Any".to_string()],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GuardKind {
    ParamType,
    ParamNotNone,
    ReturnType,
    ReturnNotNone,
    Assignment,
    Handler,
}

impl GuardKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GuardKind::ParamType => "param-type",
            GuardKind::ParamNotNone => "param-not-none",
            GuardKind::ReturnType => "return-type",
            GuardKind::ReturnNotNone => "return-not-none",
            GuardKind::Assignment => "assignment",
            GuardKind::Handler => "handler",
        }
    }
}

impl fmt::Display for GuardKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synthesized `assert <test>, '<message>'` not yet spliced into a body.
#[derive(Clone, Debug, PartialEq)]
pub struct Assertion {
    pub test: Expr,
    pub message: String,
    pub kind: GuardKind,
    /// Span of the node the guard was derived from.
    pub anchor: Span,
}

impl Assertion {
    pub fn into_stmt(self) -> Stmt {
        let msg = Expr::str_value(self.anchor, &self.message);
        Stmt::Assert(AssertStmt {
            span: self.anchor,
            test: self.test,
            msg: Some(msg),
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct RuleSet {
    config: RuleConfig,
}

impl RuleSet {
    pub fn new(config: RuleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RuleConfig {
        &self.config
    }

    /// Decorators may rewrite the signature, so decorated functions get no
    /// function-level guards.
    pub fn guards_function(&self, f: &FunctionDef) -> bool {
        f.decorators.is_empty()
    }

    /// One guard per named parameter, in declaration order.
    pub fn param_guards(&self, f: &FunctionDef) -> Vec<Assertion> {
        if !self.guards_function(f) {
            return Vec::new();
        }

        let mut guards = Vec::new();
        for p in &f.params {
            let Param::Named(np) = p else {
                continue;
            };
            let name = &np.name.node;
            let param = Expr::name(np.name.span, name.clone());
            let guard = match np.annotation.as_ref().and_then(|ann| self.simple_type(ann)) {
                Some((ann, ty)) => Assertion {
                    test: isinstance(param, ann.clone()),
                    message: format!("{name} should be of type {ty}"),
                    kind: GuardKind::ParamType,
                    anchor: np.span,
                },
                None => Assertion {
                    test: is_not_none(param),
                    message: format!("{name} should not be None"),
                    kind: GuardKind::ParamNotNone,
                    anchor: np.span,
                },
            };
            guards.push(guard);
        }
        guards
    }

    /// Guard for `last` when it is `return <value>`.
    pub fn postcondition(&self, f: &FunctionDef, last: &Stmt) -> Option<Assertion> {
        if !self.guards_function(f) {
            return None;
        }
        let Stmt::Return(ReturnStmt {
            span,
            value: Some(value),
        }) = last
        else {
            return None;
        };

        let guard = match f.returns.as_ref().and_then(|ann| self.simple_type(ann)) {
            Some((ann, ty)) => Assertion {
                test: isinstance(value.clone(), ann.clone()),
                message: format!("Return value should be of type {ty}"),
                kind: GuardKind::ReturnType,
                anchor: *span,
            },
            None => Assertion {
                test: is_not_none(value.clone()),
                message: "Return value should not be None".to_string(),
                kind: GuardKind::ReturnNotNone,
                anchor: *span,
            },
        };
        Some(guard)
    }

    /// `name = value` with exactly one bare-name target.
    pub fn assignment_guard(&self, assign: &AssignStmt) -> Option<Assertion> {
        let [target] = assign.targets.as_slice() else {
            return None;
        };
        let name = target.as_name()?;
        Some(Assertion {
            test: is_not_none(Expr::name(target.span, name)),
            message: format!("{name} should not be None after assignment"),
            kind: GuardKind::Assignment,
            anchor: assign.span,
        })
    }

    /// Always-failing guard for catch-all handlers.
    pub fn handler_guard(&self, handler: &ExceptHandler) -> Option<Assertion> {
        let catch_all = match &handler.ty {
            Some(ty) => ty
                .as_name()
                .is_some_and(|name| self.config.catch_all.iter().any(|c| c == name)),
            None => self.config.bare_except_is_catch_all,
        };
        if !catch_all {
            return None;
        }
        Some(Assertion {
            test: Expr::constant(handler.span, Constant::False),
            message: "Unhandled exception occurred".to_string(),
            kind: GuardKind::Handler,
            anchor: handler.span,
        })
    }

    /// A bare or dotted name that is not opaque, with its dotted text.
    fn simple_type<'e>(&self, ann: &'e Expr) -> Option<(&'e Expr, String)> {
        let ty = dotted_name(ann)?;
        let last = ty.rsplit('.').next().unwrap_or(&ty);
        let opaque = self
            .config
            .opaque_types
            .iter()
            .any(|o| *o == ty || o == last);
        if opaque { None } else { Some((ann, ty)) }
    }
}

fn dotted_name(expr: &Expr) -> Option<String> {
    match &expr.kind {
        ExprKind::Name(id) => Some(id.clone()),
        ExprKind::Attribute { value, attr } => {
            let mut base = dotted_name(value)?;
            base.push('.');
            base.push_str(&attr.node);
            Some(base)
        }
        _ => None,
    }
}

fn isinstance(value: Expr, ty: Expr) -> Expr {
    let span = value.span;
    Expr::new(
        span,
        ExprKind::Call {
            func: Box::new(Expr::name(span, "isinstance")),
            args: vec![CallArg::Positional(value), CallArg::Positional(ty)],
        },
    )
}

fn is_not_none(value: Expr) -> Expr {
    let span = value.span;
    Expr::new(
        span,
        ExprKind::Compare {
            left: Box::new(value),
            ops: vec![(CmpOp::IsNot, Expr::constant(span, Constant::None))],
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_parse::{parse_module, render_expr};

    fn first_function(src: &str) -> FunctionDef {
        match parse_module(src).unwrap().body.remove(0) {
            Stmt::FunctionDef(f) => f,
            other => panic!("expected function, got {other:?}"),
        }
    }

    fn rendered(guards: &[Assertion]) -> Vec<(String, String)> {
        guards
            .iter()
            .map(|g| (render_expr(&g.test), g.message.clone()))
            .collect()
    }

    #[test]
    fn annotated_params_get_type_checks_in_order() {
        let f = first_function("def f(a: int, b: np.ndarray, c):\n    pass\n");
        let guards = RuleSet::default().param_guards(&f);
        assert_eq!(
            rendered(&guards),
            vec![
                ("isinstance(a, int)".to_string(), "a should be of type int".to_string()),
                (
                    "isinstance(b, np.ndarray)".to_string(),
                    "b should be of type np.ndarray".to_string()
                ),
                ("c is not None".to_string(), "c should not be None".to_string()),
            ]
        );
    }

    #[test]
    fn complex_annotations_fall_back_to_not_none() {
        let f = first_function(
            "def f(a: list[int], b: Optional[str], c: 'Fwd', d: Any, e: typing.Any):\n    pass\n",
        );
        let guards = RuleSet::default().param_guards(&f);
        assert_eq!(guards.len(), 5);
        assert!(guards.iter().all(|g| g.kind == GuardKind::ParamNotNone));
    }

    #[test]
    fn variadics_and_markers_are_skipped() {
        let f = first_function("def f(a, /, b, *args, c, **kw):\n    pass\n");
        let guards = RuleSet::default().param_guards(&f);
        let names: Vec<_> = guards.iter().map(|g| g.message.clone()).collect();
        assert_eq!(
            names,
            vec![
                "a should not be None",
                "b should not be None",
                "c should not be None"
            ]
        );
    }

    #[test]
    fn decorated_functions_get_no_function_guards() {
        let f = first_function("@cache\ndef f(a: int) -> int:\n    return a\n");
        let rules = RuleSet::default();
        assert!(rules.param_guards(&f).is_empty());
        assert!(rules.postcondition(&f, &f.body[0]).is_none());
    }

    #[test]
    fn postcondition_embeds_returned_expression() {
        let f = first_function("def f(x) -> int:\n    return x + 1\n");
        let g = RuleSet::default().postcondition(&f, &f.body[0]).unwrap();
        assert_eq!(render_expr(&g.test), "isinstance(x + 1, int)");
        assert_eq!(g.message, "Return value should be of type int");
    }

    #[test]
    fn postcondition_skips_bare_return_and_other_statements() {
        let f = first_function("def f():\n    x = 1\n    return\n");
        let rules = RuleSet::default();
        assert!(rules.postcondition(&f, &f.body[0]).is_none());
        assert!(rules.postcondition(&f, &f.body[1]).is_none());
    }

    #[test]
    fn assignment_guard_only_for_single_bare_name() {
        let module = parse_module("a = f()\nb, c = t\nd.e = 1\nx[0] = 1\ny = z = 2\n").unwrap();
        let rules = RuleSet::default();
        let guards: Vec<_> = module
            .body
            .iter()
            .map(|s| match s {
                Stmt::Assign(a) => rules.assignment_guard(a),
                _ => None,
            })
            .collect();
        assert_eq!(guards.iter().filter(|g| g.is_some()).count(), 1);
        let g = guards[0].as_ref().unwrap();
        assert_eq!(render_expr(&g.test), "a is not None");
        assert_eq!(g.message, "a should not be None after assignment");
    }

    fn handlers(src: &str) -> Vec<ExceptHandler> {
        match parse_module(src).unwrap().body.remove(0) {
            Stmt::Try(t) => t.handlers,
            other => panic!("expected try, got {other:?}"),
        }
    }

    #[test]
    fn handler_guard_matches_catch_all_names_only() {
        let hs = handlers(
            "try:\n    pass\nexcept ValueError:\n    pass\nexcept (Exception, KeyError):\n    pass\nexcept builtins.Exception:\n    pass\nexcept Exception as e:\n    pass\nexcept:\n    pass\n",
        );
        let rules = RuleSet::default();
        let hits: Vec<bool> = hs.iter().map(|h| rules.handler_guard(h).is_some()).collect();
        assert_eq!(hits, vec![false, false, false, true, false]);
    }

    #[test]
    fn handler_guard_follows_configuration() {
        let hs = handlers("try:\n    pass\nexcept BaseException:\n    pass\nexcept:\n    pass\n");
        let rules = RuleSet::new(RuleConfig {
            catch_all: vec!["BaseException".to_string()],
            bare_except_is_catch_all: true,
            ..RuleConfig::default()
        });
        assert!(hs.iter().all(|h| rules.handler_guard(h).is_some()));
        let g = rules.handler_guard(&hs[0]).unwrap();
        assert_eq!(render_expr(&g.test), "False");
        assert_eq!(g.message, "Unhandled exception occurred");
    }
}
