#![forbid(unsafe_code)]

use std::mem;

use vigil_ast::{ExceptHandler, FunctionDef, Module, Span, Stmt};

use crate::rules::{Assertion, GuardKind, RuleSet};

/// Record of one spliced guard.
#[derive(Clone, Debug, PartialEq)]
pub struct Insertion {
    pub kind: GuardKind,
    /// Dotted path of enclosing classes and functions; `None` at module level.
    pub scope: Option<String>,
    pub anchor: Span,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instrumented {
    pub module: Module,
    pub insertions: Vec<Insertion>,
}

/// Single depth-first rewrite that splices Rule Set guards into every body.
///
/// Running it twice on its own output adds a second layer of guards.
pub struct Transformer<'r> {
    rules: &'r RuleSet,
}

struct Scope {
    names: Vec<String>,
    insertions: Vec<Insertion>,
}

impl Scope {
    fn record(&mut self, guard: Assertion) -> Stmt {
        let scope = if self.names.is_empty() {
            None
        } else {
            Some(self.names.join("."))
        };
        self.insertions.push(Insertion {
            kind: guard.kind,
            scope,
            anchor: guard.anchor,
            message: guard.message.clone(),
        });
        guard.into_stmt()
    }
}

impl<'r> Transformer<'r> {
    pub fn new(rules: &'r RuleSet) -> Self {
        Self { rules }
    }

    pub fn transform_module(&self, module: Module) -> Instrumented {
        let mut scope = Scope {
            names: Vec::new(),
            insertions: Vec::new(),
        };
        let body = self.transform_body(module.body, &mut scope);
        Instrumented {
            module: Module { body },
            insertions: scope.insertions,
        }
    }

    fn transform_body(&self, body: Vec<Stmt>, scope: &mut Scope) -> Vec<Stmt> {
        let mut out = Vec::with_capacity(body.len());
        for stmt in body {
            out.extend(self.transform_stmt(stmt, scope));
        }
        out
    }

    fn transform_stmt(&self, stmt: Stmt, scope: &mut Scope) -> Vec<Stmt> {
        match stmt {
            Stmt::FunctionDef(f) => vec![Stmt::FunctionDef(self.transform_function(f, scope))],
            Stmt::ClassDef(mut c) => {
                scope.names.push(c.name.node.clone());
                c.body = self.transform_body(mem::take(&mut c.body), scope);
                scope.names.pop();
                vec![Stmt::ClassDef(c)]
            }
            Stmt::Assign(a) => {
                let guard = self.rules.assignment_guard(&a);
                let mut out = vec![Stmt::Assign(a)];
                if let Some(g) = guard {
                    out.push(scope.record(g));
                }
                out
            }
            Stmt::If(mut s) => {
                s.body = self.transform_body(mem::take(&mut s.body), scope);
                s.orelse = self.transform_body(mem::take(&mut s.orelse), scope);
                vec![Stmt::If(s)]
            }
            Stmt::While(mut s) => {
                s.body = self.transform_body(mem::take(&mut s.body), scope);
                s.orelse = self.transform_body(mem::take(&mut s.orelse), scope);
                vec![Stmt::While(s)]
            }
            Stmt::For(mut s) => {
                s.body = self.transform_body(mem::take(&mut s.body), scope);
                s.orelse = self.transform_body(mem::take(&mut s.orelse), scope);
                vec![Stmt::For(s)]
            }
            Stmt::With(mut s) => {
                s.body = self.transform_body(mem::take(&mut s.body), scope);
                vec![Stmt::With(s)]
            }
            Stmt::Try(mut t) => {
                t.body = self.transform_body(mem::take(&mut t.body), scope);
                t.handlers = mem::take(&mut t.handlers)
                    .into_iter()
                    .map(|h| self.transform_handler(h, scope))
                    .collect();
                t.orelse = self.transform_body(mem::take(&mut t.orelse), scope);
                t.finalbody = self.transform_body(mem::take(&mut t.finalbody), scope);
                vec![Stmt::Try(t)]
            }
            Stmt::Match(mut m) => {
                for case in &mut m.cases {
                    case.body = self.transform_body(mem::take(&mut case.body), scope);
                }
                vec![Stmt::Match(m)]
            }
            other => vec![other],
        }
    }

    fn transform_function(&self, mut f: FunctionDef, scope: &mut Scope) -> FunctionDef {
        scope.names.push(f.name.node.clone());

        let param_guards: Vec<Stmt> = self
            .rules
            .param_guards(&f)
            .into_iter()
            .map(|g| scope.record(g))
            .collect();
        let mut body = self.transform_body(mem::take(&mut f.body), scope);
        let post = body.last().and_then(|last| self.rules.postcondition(&f, last));

        let mut out = Vec::with_capacity(param_guards.len() + body.len() + 1);
        out.extend(param_guards);
        match (post, body.pop()) {
            (Some(guard), Some(ret)) => {
                out.extend(body);
                out.push(scope.record(guard));
                out.push(ret);
            }
            (_, last) => {
                out.extend(body);
                out.extend(last);
            }
        }
        f.body = out;

        scope.names.pop();
        f
    }

    fn transform_handler(&self, mut h: ExceptHandler, scope: &mut Scope) -> ExceptHandler {
        h.body = self.transform_body(mem::take(&mut h.body), scope);
        if let Some(g) = self.rules.handler_guard(&h) {
            h.body.push(scope.record(g));
        }
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_parse::{parse_module, render_module};

    fn instrument(src: &str) -> Instrumented {
        let rules = RuleSet::default();
        Transformer::new(&rules).transform_module(parse_module(src).unwrap())
    }

    #[test]
    fn function_guards_wrap_the_body() {
        let out = instrument("def f(x: int) -> int:\n    return x + 1\n");
        assert_eq!(
            render_module(&out.module),
            "def f(x: int) -> int:\n    assert isinstance(x, int), 'x should be of type int'\n    assert isinstance(x + 1, int), 'Return value should be of type int'\n    return x + 1\n"
        );
        let kinds: Vec<_> = out.insertions.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![GuardKind::ParamType, GuardKind::ReturnType]);
        assert!(out.insertions.iter().all(|i| i.scope.as_deref() == Some("f")));
    }

    #[test]
    fn assignment_guard_follows_assignment() {
        let out = instrument("def g(y):\n    z = y * 2\n    return z\n");
        assert_eq!(
            render_module(&out.module),
            "def g(y):\n    assert y is not None, 'y should not be None'\n    z = y * 2\n    assert z is not None, 'z should not be None after assignment'\n    assert z is not None, 'Return value should not be None'\n    return z\n"
        );
    }

    #[test]
    fn nested_bodies_are_recursed() {
        let out = instrument(
            "class A:\n    limit = 3\n    def m(self):\n        for i in r:\n            if i:\n                v = i\n            else:\n                w = 0\n        while c:\n            with ctx:\n                u = 1\n",
        );
        let scopes: Vec<_> = out
            .insertions
            .iter()
            .map(|i| (i.kind, i.scope.clone().unwrap_or_default()))
            .collect();
        assert_eq!(
            scopes,
            vec![
                (GuardKind::Assignment, "A".to_string()),
                (GuardKind::ParamNotNone, "A.m".to_string()),
                (GuardKind::Assignment, "A.m".to_string()),
                (GuardKind::Assignment, "A.m".to_string()),
                (GuardKind::Assignment, "A.m".to_string()),
            ]
        );
    }

    #[test]
    fn handler_guard_appended_after_transformed_body() {
        let out = instrument("try:\n    a = 1\nexcept Exception:\n    b = 2\nfinally:\n    c = 3\n");
        assert_eq!(
            render_module(&out.module),
            "try:\n    a = 1\n    assert a is not None, 'a should not be None after assignment'\nexcept Exception:\n    b = 2\n    assert b is not None, 'b should not be None after assignment'\n    assert False, 'Unhandled exception occurred'\nfinally:\n    c = 3\n    assert c is not None, 'c should not be None after assignment'\n"
        );
        assert!(out.insertions.iter().all(|i| i.scope.is_none()));
    }

    #[test]
    fn match_cases_and_exception_groups_are_recursed() {
        let out = instrument(
            "match cmd:\n    case [x]:\n        y = x\n    case _:\n        pass\ntry:\n    run()\nexcept* Exception:\n    z = 0\n",
        );
        assert_eq!(
            render_module(&out.module),
            "match cmd:\n    case [x]:\n        y = x\n        assert y is not None, 'y should not be None after assignment'\n    case _:\n        pass\ntry:\n    run()\nexcept* Exception:\n    z = 0\n    assert z is not None, 'z should not be None after assignment'\n    assert False, 'Unhandled exception occurred'\n"
        );
    }

    #[test]
    fn postcondition_sees_transformed_body() {
        // The body ends in an `if`, so no postcondition applies even though a branch returns.
        let out = instrument("def f(a):\n    if a:\n        return 1\n");
        assert_eq!(out.insertions.len(), 1);

        // A trailing assignment gains a guard, which then is the last statement.
        let out = instrument("def f():\n    x = 1\n");
        let kinds: Vec<_> = out.insertions.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![GuardKind::Assignment]);
    }

    #[test]
    fn decorated_function_body_still_recursed() {
        let out = instrument("@dec\ndef f(a: int) -> int:\n    b = a\n    return b\n");
        let kinds: Vec<_> = out.insertions.iter().map(|i| i.kind).collect();
        assert_eq!(kinds, vec![GuardKind::Assignment]);
    }

    #[test]
    fn nested_function_gets_its_own_guards() {
        let out = instrument("def outer(a):\n    def inner(b):\n        return b\n    return inner\n");
        let scopes: Vec<_> = out
            .insertions
            .iter()
            .map(|i| i.scope.clone().unwrap_or_default())
            .collect();
        assert_eq!(scopes, vec!["outer", "outer.inner", "outer.inner", "outer"]);
    }
}
