#![forbid(unsafe_code)]

use vigil_ast::{
    BinOp, BoolOp, CallArg, ClassDef, Comprehension, Constant, ExceptHandler, Expr, ExprKind,
    ForStmt, FunctionDef, IfStmt, MatchStmt, Module, NamedParam, Param, Pattern, PatternKind, Stmt,
    TryStmt, TypeParam, TypeParamKind, UnaryOp, WhileStmt,
};

const INDENT: &str = "    ";

/// Render a module back to Python source.
///
/// Output is normalized (tuples parenthesized, one statement per line) and is
/// not byte-identical to the input; it parses back to the same tree.
pub fn render_module(module: &Module) -> String {
    let mut out = String::new();
    let mut prev_was_def = false;
    for (i, stmt) in module.body.iter().enumerate() {
        let is_def = matches!(stmt, Stmt::FunctionDef(_) | Stmt::ClassDef(_));
        if i > 0 && (is_def || prev_was_def) {
            out.push('\n');
        }
        prev_was_def = is_def;
        fmt_stmt(&mut out, 0, stmt);
    }
    out
}

pub fn render_stmt(stmt: &Stmt) -> String {
    let mut out = String::new();
    fmt_stmt(&mut out, 0, stmt);
    out
}

pub fn render_expr(expr: &Expr) -> String {
    let mut out = String::new();
    fmt_expr(&mut out, expr, Prec::Lowest);
    out
}

fn fmt_stmt(out: &mut String, indent: usize, stmt: &Stmt) {
    match stmt {
        Stmt::FunctionDef(f) => fmt_function(out, indent, f),
        Stmt::ClassDef(c) => fmt_class(out, indent, c),
        Stmt::Return(s) => {
            indent_line(out, indent);
            out.push_str("return");
            if let Some(v) = &s.value {
                out.push(' ');
                fmt_expr(out, v, Prec::Lowest);
            }
            out.push('\n');
        }
        Stmt::Assign(s) => {
            indent_line(out, indent);
            for t in &s.targets {
                fmt_expr(out, t, Prec::Lowest);
                out.push_str(" = ");
            }
            fmt_stmt_expr(out, &s.value);
            out.push('\n');
        }
        Stmt::AugAssign(s) => {
            indent_line(out, indent);
            fmt_expr(out, &s.target, Prec::Lowest);
            out.push(' ');
            out.push_str(s.op.symbol());
            out.push_str("= ");
            fmt_stmt_expr(out, &s.value);
            out.push('\n');
        }
        Stmt::AnnAssign(s) => {
            indent_line(out, indent);
            fmt_expr(out, &s.target, Prec::Lowest);
            out.push_str(": ");
            fmt_expr(out, &s.annotation, Prec::Test);
            if let Some(v) = &s.value {
                out.push_str(" = ");
                fmt_stmt_expr(out, v);
            }
            out.push('\n');
        }
        Stmt::If(s) => fmt_if(out, indent, s),
        Stmt::While(s) => fmt_while(out, indent, s),
        Stmt::For(s) => fmt_for(out, indent, s),
        Stmt::With(s) => {
            indent_line(out, indent);
            if s.is_async {
                out.push_str("async ");
            }
            out.push_str("with ");
            for (i, item) in s.items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                fmt_expr(out, &item.context, Prec::Test);
                if let Some(var) = &item.var {
                    out.push_str(" as ");
                    fmt_expr(out, var, Prec::Lowest);
                }
            }
            out.push_str(":\n");
            fmt_body(out, indent + 1, &s.body);
        }
        Stmt::Try(s) => fmt_try(out, indent, s),
        Stmt::Match(s) => fmt_match(out, indent, s),
        Stmt::Raise(s) => {
            indent_line(out, indent);
            out.push_str("raise");
            if let Some(exc) = &s.exc {
                out.push(' ');
                fmt_expr(out, exc, Prec::Test);
            }
            if let Some(cause) = &s.cause {
                out.push_str(" from ");
                fmt_expr(out, cause, Prec::Test);
            }
            out.push('\n');
        }
        Stmt::Assert(s) => {
            indent_line(out, indent);
            out.push_str("assert ");
            fmt_expr(out, &s.test, Prec::Test);
            if let Some(msg) = &s.msg {
                out.push_str(", ");
                fmt_expr(out, msg, Prec::Test);
            }
            out.push('\n');
        }
        Stmt::Import(s) => {
            indent_line(out, indent);
            out.push_str("import ");
            fmt_aliases(out, &s.names);
            out.push('\n');
        }
        Stmt::ImportFrom(s) => {
            indent_line(out, indent);
            out.push_str("from ");
            for _ in 0..s.level {
                out.push('.');
            }
            if let Some(m) = &s.module {
                out.push_str(m);
            }
            out.push_str(" import ");
            fmt_aliases(out, &s.names);
            out.push('\n');
        }
        Stmt::Global(s) | Stmt::Nonlocal(s) => {
            indent_line(out, indent);
            out.push_str(if matches!(stmt, Stmt::Global(_)) {
                "global "
            } else {
                "nonlocal "
            });
            for (i, n) in s.names.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&n.node);
            }
            out.push('\n');
        }
        Stmt::Delete(s) => {
            indent_line(out, indent);
            out.push_str("del ");
            fmt_expr_list(out, &s.targets, Prec::BitOr);
            out.push('\n');
        }
        Stmt::TypeAlias(s) => {
            indent_line(out, indent);
            out.push_str("type ");
            out.push_str(&s.name.node);
            fmt_type_params(out, &s.type_params);
            out.push_str(" = ");
            fmt_expr(out, &s.value, Prec::Test);
            out.push('\n');
        }
        Stmt::Pass(_) => {
            indent_line(out, indent);
            out.push_str("pass\n");
        }
        Stmt::Break(_) => {
            indent_line(out, indent);
            out.push_str("break\n");
        }
        Stmt::Continue(_) => {
            indent_line(out, indent);
            out.push_str("continue\n");
        }
        Stmt::Expr(e) => {
            indent_line(out, indent);
            fmt_stmt_expr(out, e);
            out.push('\n');
        }
    }
}

fn fmt_function(out: &mut String, indent: usize, f: &FunctionDef) {
    fmt_decorators(out, indent, &f.decorators);
    indent_line(out, indent);
    if f.is_async {
        out.push_str("async ");
    }
    out.push_str("def ");
    out.push_str(&f.name.node);
    fmt_type_params(out, &f.type_params);
    out.push('(');
    fmt_params(out, &f.params, true);
    out.push(')');
    if let Some(ret) = &f.returns {
        out.push_str(" -> ");
        fmt_expr(out, ret, Prec::Test);
    }
    out.push_str(":\n");
    fmt_body(out, indent + 1, &f.body);
}

fn fmt_class(out: &mut String, indent: usize, c: &ClassDef) {
    fmt_decorators(out, indent, &c.decorators);
    indent_line(out, indent);
    out.push_str("class ");
    out.push_str(&c.name.node);
    fmt_type_params(out, &c.type_params);
    if !c.bases.is_empty() {
        out.push('(');
        fmt_call_args(out, &c.bases);
        out.push(')');
    }
    out.push_str(":\n");
    fmt_body(out, indent + 1, &c.body);
}

fn fmt_type_params(out: &mut String, params: &[TypeParam]) {
    if params.is_empty() {
        return;
    }
    out.push('[');
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(match p.kind {
            TypeParamKind::TypeVar => "",
            TypeParamKind::TypeVarTuple => "*",
            TypeParamKind::ParamSpec => "**",
        });
        out.push_str(&p.name.node);
        if let Some(bound) = &p.bound {
            out.push_str(": ");
            fmt_expr(out, bound, Prec::Test);
        }
        if let Some(default) = &p.default {
            out.push_str(" = ");
            fmt_expr(out, default, Prec::Test);
        }
    }
    out.push(']');
}

fn fmt_decorators(out: &mut String, indent: usize, decorators: &[Expr]) {
    for d in decorators {
        indent_line(out, indent);
        out.push('@');
        fmt_expr(out, d, Prec::Lowest);
        out.push('\n');
    }
}

fn fmt_params(out: &mut String, params: &[Param], annotations: bool) {
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match p {
            Param::Named(np) => fmt_named_param(out, np, annotations),
            Param::VarPositional(np) => {
                out.push('*');
                fmt_named_param(out, np, annotations);
            }
            Param::VarKeyword(np) => {
                out.push_str("**");
                fmt_named_param(out, np, annotations);
            }
            Param::PositionalOnlyMarker(_) => out.push('/'),
            Param::KeywordOnlyMarker(_) => out.push('*'),
        }
    }
}

fn fmt_named_param(out: &mut String, p: &NamedParam, annotations: bool) {
    out.push_str(&p.name.node);
    let annotation = p.annotation.as_ref().filter(|_| annotations);
    if let Some(ann) = annotation {
        out.push_str(": ");
        fmt_expr(out, ann, Prec::Test);
    }
    if let Some(d) = &p.default {
        out.push_str(if annotation.is_some() { " = " } else { "=" });
        fmt_expr(out, d, Prec::Test);
    }
}

fn fmt_if(out: &mut String, indent: usize, mut s: &IfStmt) {
    let mut keyword = "if";
    loop {
        indent_line(out, indent);
        out.push_str(keyword);
        out.push(' ');
        fmt_expr(out, &s.test, Prec::Test);
        out.push_str(":\n");
        fmt_body(out, indent + 1, &s.body);

        match s.orelse.as_slice() {
            [] => return,
            [Stmt::If(elif)] => {
                s = elif;
                keyword = "elif";
            }
            orelse => return fmt_else(out, indent, orelse),
        }
    }
}

fn fmt_while(out: &mut String, indent: usize, s: &WhileStmt) {
    indent_line(out, indent);
    out.push_str("while ");
    fmt_expr(out, &s.test, Prec::Test);
    out.push_str(":\n");
    fmt_body(out, indent + 1, &s.body);
    if !s.orelse.is_empty() {
        fmt_else(out, indent, &s.orelse);
    }
}

fn fmt_for(out: &mut String, indent: usize, s: &ForStmt) {
    indent_line(out, indent);
    if s.is_async {
        out.push_str("async ");
    }
    out.push_str("for ");
    fmt_expr(out, &s.target, Prec::Lowest);
    out.push_str(" in ");
    fmt_expr(out, &s.iter, Prec::Lowest);
    out.push_str(":\n");
    fmt_body(out, indent + 1, &s.body);
    if !s.orelse.is_empty() {
        fmt_else(out, indent, &s.orelse);
    }
}

fn fmt_try(out: &mut String, indent: usize, s: &TryStmt) {
    indent_line(out, indent);
    out.push_str("try:\n");
    fmt_body(out, indent + 1, &s.body);
    for h in &s.handlers {
        fmt_handler(out, indent, h, s.is_star);
    }
    if !s.orelse.is_empty() {
        fmt_else(out, indent, &s.orelse);
    }
    if !s.finalbody.is_empty() {
        indent_line(out, indent);
        out.push_str("finally:\n");
        fmt_body(out, indent + 1, &s.finalbody);
    }
}

fn fmt_handler(out: &mut String, indent: usize, h: &ExceptHandler, is_star: bool) {
    indent_line(out, indent);
    out.push_str(if is_star { "except*" } else { "except" });
    if let Some(ty) = &h.ty {
        out.push(' ');
        fmt_expr(out, ty, Prec::Test);
        if let Some(name) = &h.name {
            out.push_str(" as ");
            out.push_str(&name.node);
        }
    }
    out.push_str(":\n");
    fmt_body(out, indent + 1, &h.body);
}

fn fmt_match(out: &mut String, indent: usize, s: &MatchStmt) {
    indent_line(out, indent);
    out.push_str("match ");
    fmt_expr(out, &s.subject, Prec::Lowest);
    out.push_str(":\n");
    for case in &s.cases {
        indent_line(out, indent + 1);
        out.push_str("case ");
        fmt_pattern(out, &case.pattern);
        if let Some(guard) = &case.guard {
            out.push_str(" if ");
            fmt_expr(out, guard, Prec::Lowest);
        }
        out.push_str(":\n");
        fmt_body(out, indent + 2, &case.body);
    }
}

fn fmt_pattern(out: &mut String, p: &Pattern) {
    match &p.kind {
        PatternKind::Value(v) => fmt_expr(out, v, Prec::Lowest),
        PatternKind::Singleton(c) => fmt_constant(out, *c),
        PatternKind::Sequence(elts) => {
            out.push('[');
            fmt_pattern_list(out, elts);
            out.push(']');
        }
        PatternKind::Star(name) => {
            out.push('*');
            out.push_str(name.as_ref().map_or("_", |n| n.node.as_str()));
        }
        PatternKind::Mapping { keys, patterns, rest } => {
            out.push('{');
            for (i, (k, v)) in keys.iter().zip(patterns).enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                fmt_expr(out, k, Prec::Lowest);
                out.push_str(": ");
                fmt_pattern(out, v);
            }
            if let Some(rest) = rest {
                if !keys.is_empty() {
                    out.push_str(", ");
                }
                out.push_str("**");
                out.push_str(&rest.node);
            }
            out.push('}');
        }
        PatternKind::Class { cls, patterns, keywords } => {
            fmt_expr(out, cls, Prec::Primary);
            out.push('(');
            fmt_pattern_list(out, patterns);
            for (i, (name, v)) in keywords.iter().enumerate() {
                if i > 0 || !patterns.is_empty() {
                    out.push_str(", ");
                }
                out.push_str(&name.node);
                out.push('=');
                fmt_pattern(out, v);
            }
            out.push(')');
        }
        PatternKind::As { pattern, name } => {
            if let Some(inner) = pattern {
                fmt_pattern_operand(out, inner);
                out.push_str(" as ");
            }
            out.push_str(name.as_ref().map_or("_", |n| n.node.as_str()));
        }
        PatternKind::Or(alternatives) => {
            for (i, alt) in alternatives.iter().enumerate() {
                if i > 0 {
                    out.push_str(" | ");
                }
                fmt_pattern_operand(out, alt);
            }
        }
    }
}

/// Operand of `|` or `as`: a nested `as` or `|` needs its own parentheses.
fn fmt_pattern_operand(out: &mut String, p: &Pattern) {
    let grouped = matches!(
        p.kind,
        PatternKind::Or(_) | PatternKind::As { pattern: Some(_), .. }
    );
    if grouped {
        out.push('(');
        fmt_pattern(out, p);
        out.push(')');
    } else {
        fmt_pattern(out, p);
    }
}

fn fmt_pattern_list(out: &mut String, patterns: &[Pattern]) {
    for (i, p) in patterns.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        fmt_pattern(out, p);
    }
}

fn fmt_else(out: &mut String, indent: usize, body: &[Stmt]) {
    indent_line(out, indent);
    out.push_str("else:\n");
    fmt_body(out, indent + 1, body);
}

fn fmt_body(out: &mut String, indent: usize, body: &[Stmt]) {
    if body.is_empty() {
        indent_line(out, indent);
        out.push_str("pass\n");
        return;
    }
    for stmt in body {
        fmt_stmt(out, indent, stmt);
    }
}

fn fmt_aliases(out: &mut String, names: &[vigil_ast::Alias]) {
    for (i, a) in names.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&a.name);
        if let Some(asname) = &a.asname {
            out.push_str(" as ");
            out.push_str(&asname.node);
        }
    }
}

/// Statement-level expressions and assignment values may hold a bare `yield`.
fn fmt_stmt_expr(out: &mut String, expr: &Expr) {
    match &expr.kind {
        ExprKind::Yield(_) | ExprKind::YieldFrom(_) => fmt_yield(out, expr),
        _ => fmt_expr(out, expr, Prec::Lowest),
    }
}

fn fmt_yield(out: &mut String, expr: &Expr) {
    match &expr.kind {
        ExprKind::Yield(None) => out.push_str("yield"),
        ExprKind::Yield(Some(v)) => {
            out.push_str("yield ");
            fmt_expr(out, v, Prec::Lowest);
        }
        ExprKind::YieldFrom(v) => {
            out.push_str("yield from ");
            fmt_expr(out, v, Prec::Test);
        }
        _ => fmt_expr(out, expr, Prec::Lowest),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Lowest,
    Lambda,
    Test,
    Or,
    And,
    Not,
    Cmp,
    BitOr,
    BitXor,
    BitAnd,
    Shift,
    Arith,
    Term,
    Unary,
    Power,
    Await,
    Primary,
}

impl Prec {
    fn tighter(self) -> Prec {
        match self {
            Prec::Lowest => Prec::Lambda,
            Prec::Lambda => Prec::Test,
            Prec::Test => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::Not,
            Prec::Not => Prec::Cmp,
            Prec::Cmp => Prec::BitOr,
            Prec::BitOr => Prec::BitXor,
            Prec::BitXor => Prec::BitAnd,
            Prec::BitAnd => Prec::Shift,
            Prec::Shift => Prec::Arith,
            Prec::Arith => Prec::Term,
            Prec::Term => Prec::Unary,
            Prec::Unary => Prec::Power,
            Prec::Power => Prec::Await,
            Prec::Await | Prec::Primary => Prec::Primary,
        }
    }
}

fn bin_prec(op: BinOp) -> Prec {
    match op {
        BinOp::BitOr => Prec::BitOr,
        BinOp::BitXor => Prec::BitXor,
        BinOp::BitAnd => Prec::BitAnd,
        BinOp::LShift | BinOp::RShift => Prec::Shift,
        BinOp::Add | BinOp::Sub => Prec::Arith,
        BinOp::Mul | BinOp::MatMul | BinOp::Div | BinOp::FloorDiv | BinOp::Mod => Prec::Term,
        BinOp::Pow => Prec::Power,
    }
}

fn expr_prec(expr: &Expr) -> Prec {
    match &expr.kind {
        ExprKind::Lambda { .. } => Prec::Lambda,
        ExprKind::IfExp { .. } => Prec::Test,
        ExprKind::BoolOp { op: BoolOp::Or, .. } => Prec::Or,
        ExprKind::BoolOp { op: BoolOp::And, .. } => Prec::And,
        ExprKind::Unary { op: UnaryOp::Not, .. } => Prec::Not,
        ExprKind::Unary { .. } => Prec::Unary,
        ExprKind::Compare { .. } => Prec::Cmp,
        ExprKind::Binary { op, .. } => bin_prec(*op),
        ExprKind::Await(_) => Prec::Await,
        ExprKind::Starred(_) => Prec::BitOr,
        _ => Prec::Primary,
    }
}

fn needs_parens(parent: Prec, child: Prec) -> bool {
    child < parent
}

fn fmt_expr(out: &mut String, expr: &Expr, parent_prec: Prec) {
    let prec = expr_prec(expr);
    if needs_parens(parent_prec, prec) {
        out.push('(');
        fmt_expr(out, expr, Prec::Lowest);
        out.push(')');
        return;
    }

    match &expr.kind {
        ExprKind::Name(id) => out.push_str(id),
        ExprKind::Number(n) => out.push_str(n),
        ExprKind::Constant(c) => fmt_constant(out, *c),
        ExprKind::Str(pieces) => {
            for (i, p) in pieces.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push_str(p);
            }
        }
        ExprKind::Tuple(elts) => {
            out.push('(');
            fmt_expr_list(out, elts, Prec::Test);
            if elts.len() == 1 {
                out.push(',');
            }
            out.push(')');
        }
        ExprKind::List(elts) => {
            out.push('[');
            fmt_expr_list(out, elts, Prec::Test);
            out.push(']');
        }
        ExprKind::Set(elts) => {
            if elts.is_empty() {
                out.push_str("set()");
            } else {
                out.push('{');
                fmt_expr_list(out, elts, Prec::Test);
                out.push('}');
            }
        }
        ExprKind::Dict(items) => {
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                match &item.key {
                    Some(k) => {
                        fmt_expr(out, k, Prec::Test);
                        out.push_str(": ");
                        fmt_expr(out, &item.value, Prec::Test);
                    }
                    None => {
                        out.push_str("**");
                        fmt_expr(out, &item.value, Prec::BitOr);
                    }
                }
            }
            out.push('}');
        }
        ExprKind::ListComp { elt, generators } => {
            out.push('[');
            fmt_expr(out, elt, Prec::Test);
            fmt_comprehensions(out, generators);
            out.push(']');
        }
        ExprKind::SetComp { elt, generators } => {
            out.push('{');
            fmt_expr(out, elt, Prec::Test);
            fmt_comprehensions(out, generators);
            out.push('}');
        }
        ExprKind::GeneratorExp { elt, generators } => {
            out.push('(');
            fmt_expr(out, elt, Prec::Test);
            fmt_comprehensions(out, generators);
            out.push(')');
        }
        ExprKind::DictComp {
            key,
            value,
            generators,
        } => {
            out.push('{');
            fmt_expr(out, key, Prec::Test);
            out.push_str(": ");
            fmt_expr(out, value, Prec::Test);
            fmt_comprehensions(out, generators);
            out.push('}');
        }
        ExprKind::Attribute { value, attr } => {
            // `1.real` would lex as a float.
            if matches!(value.kind, ExprKind::Number(_)) {
                out.push('(');
                fmt_expr(out, value, Prec::Lowest);
                out.push(')');
            } else {
                fmt_expr(out, value, Prec::Primary);
            }
            out.push('.');
            out.push_str(&attr.node);
        }
        ExprKind::Subscript { value, index } => {
            fmt_expr(out, value, Prec::Primary);
            out.push('[');
            match &index.kind {
                ExprKind::Tuple(elts) if !elts.is_empty() => {
                    fmt_expr_list(out, elts, Prec::Test);
                    if elts.len() == 1 {
                        out.push(',');
                    }
                }
                _ => fmt_expr(out, index, Prec::Test),
            }
            out.push(']');
        }
        ExprKind::Slice { lower, upper, step } => {
            if let Some(l) = lower {
                fmt_expr(out, l, Prec::Test);
            }
            out.push(':');
            if let Some(u) = upper {
                fmt_expr(out, u, Prec::Test);
            }
            if let Some(s) = step {
                out.push(':');
                fmt_expr(out, s, Prec::Test);
            }
        }
        ExprKind::Call { func, args } => {
            fmt_expr(out, func, Prec::Primary);
            out.push('(');
            fmt_call_args(out, args);
            out.push(')');
        }
        ExprKind::Starred(inner) => {
            out.push('*');
            fmt_expr(out, inner, Prec::BitOr);
        }
        ExprKind::Unary { op, operand } => {
            let (text, operand_prec) = match op {
                UnaryOp::Not => ("not ", Prec::Not),
                UnaryOp::Neg => ("-", Prec::Unary),
                UnaryOp::Pos => ("+", Prec::Unary),
                UnaryOp::Invert => ("~", Prec::Unary),
            };
            out.push_str(text);
            fmt_expr(out, operand, operand_prec);
        }
        ExprKind::Binary { left, op, right } => {
            let p = bin_prec(*op);
            // `**` binds right-to-left; everything else left-to-right.
            let (lp, rp) = if *op == BinOp::Pow {
                (p.tighter(), Prec::Unary)
            } else {
                (p, p.tighter())
            };
            fmt_expr(out, left, lp);
            out.push(' ');
            out.push_str(op.symbol());
            out.push(' ');
            fmt_expr(out, right, rp);
        }
        ExprKind::BoolOp { op, values } => {
            let (sep, p) = match op {
                BoolOp::Or => (" or ", Prec::Or),
                BoolOp::And => (" and ", Prec::And),
            };
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(sep);
                }
                fmt_expr(out, v, p.tighter());
            }
        }
        ExprKind::Compare { left, ops } => {
            fmt_expr(out, left, Prec::BitOr);
            for (op, rhs) in ops {
                out.push(' ');
                out.push_str(op.symbol());
                out.push(' ');
                fmt_expr(out, rhs, Prec::BitOr);
            }
        }
        ExprKind::IfExp { test, body, orelse } => {
            fmt_expr(out, body, Prec::Or);
            out.push_str(" if ");
            fmt_expr(out, test, Prec::Or);
            out.push_str(" else ");
            fmt_expr(out, orelse, Prec::Test);
        }
        ExprKind::Lambda { params, body } => {
            out.push_str("lambda");
            if !params.is_empty() {
                out.push(' ');
                fmt_params(out, params, false);
            }
            out.push_str(": ");
            fmt_expr(out, body, Prec::Test);
        }
        ExprKind::NamedExpr { target, value } => {
            out.push('(');
            out.push_str(&target.node);
            out.push_str(" := ");
            fmt_expr(out, value, Prec::Test);
            out.push(')');
        }
        ExprKind::Await(inner) => {
            out.push_str("await ");
            fmt_expr(out, inner, Prec::Primary);
        }
        ExprKind::Yield(_) | ExprKind::YieldFrom(_) => {
            out.push('(');
            fmt_yield(out, expr);
            out.push(')');
        }
    }
}

fn fmt_constant(out: &mut String, c: Constant) {
    out.push_str(match c {
        Constant::None => "None",
        Constant::True => "True",
        Constant::False => "False",
        Constant::Ellipsis => "...",
    });
}

fn fmt_expr_list(out: &mut String, exprs: &[Expr], prec: Prec) {
    for (i, e) in exprs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        fmt_expr(out, e, prec);
    }
}

fn fmt_call_args(out: &mut String, args: &[CallArg]) {
    for (i, a) in args.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        match a {
            CallArg::Positional(e) => fmt_expr(out, e, Prec::Test),
            CallArg::Keyword { name, value } => {
                out.push_str(&name.node);
                out.push('=');
                fmt_expr(out, value, Prec::Test);
            }
            CallArg::Starred(e) => {
                out.push('*');
                fmt_expr(out, e, Prec::Test);
            }
            CallArg::DoubleStarred(e) => {
                out.push_str("**");
                fmt_expr(out, e, Prec::Test);
            }
        }
    }
}

fn fmt_comprehensions(out: &mut String, generators: &[Comprehension]) {
    for g in generators {
        out.push_str(if g.is_async { " async for " } else { " for " });
        fmt_expr(out, &g.target, Prec::Lowest);
        out.push_str(" in ");
        fmt_expr(out, &g.iter, Prec::Or);
        for cond in &g.ifs {
            out.push_str(" if ");
            fmt_expr(out, cond, Prec::Or);
        }
    }
}

fn indent_line(out: &mut String, indent: usize) {
    for _ in 0..indent {
        out.push_str(INDENT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_idempotent(src: &str) {
        let module = crate::parse_module(src).unwrap();
        let rendered1 = render_module(&module);
        let module2 = crate::parse_module(&rendered1).unwrap();
        let rendered2 = render_module(&module2);
        assert_eq!(rendered1, rendered2);
    }

    fn render(src: &str) -> String {
        render_module(&crate::parse_module(src).unwrap())
    }

    #[test]
    fn render_roundtrip_basic() {
        is_idempotent(
            "import os.path as p\nfrom ..pkg import (a, b as c,)\n\nx: int = 1 + 2 * 3\ndef f(a, /, b: int = 2, *args, c, **kw) -> int:\n    return a if b else -c ** 2\n",
        );
    }

    #[test]
    fn render_roundtrip_compound_statements() {
        is_idempotent(
            "class A(B, metaclass=M):\n    @staticmethod\n    def g():\n        try:\n            pass\n        except (KeyError, ValueError) as e:\n            raise RuntimeError('x') from e\n        except:\n            pass\n        else:\n            x = 1\n        finally:\n            y = 2\n\nfor i, j in enumerate(xs):\n    if i:\n        continue\n    elif j:\n        break\n    else:\n        pass\nelse:\n    pass\nwhile True:\n    with open(p) as fh, lock:\n        del a[1:2, ::3], b.c\n",
        );
    }

    #[test]
    fn render_roundtrip_expressions() {
        is_idempotent(
            "y = [x for x in range(10) if x % 2 if x > 3]\nz = {k: v for k, v in d.items()}\ns = {*a, 1}\ng = sum(x for x in xs)\nl = lambda a, *b, c=1: (a, b, c)\nw = (n := len(a)) > 10\nq = not a in b and c is not None or d not in e\nt = a[1:, :2] + b[...] @ c\nasync def co():\n    await f()\n    r = yield\n    yield from g()\n",
        );
    }

    #[test]
    fn render_keeps_string_literal_text() {
        assert_eq!(
            render("x = r'\\d+' 'b'\ny = f\"{a!r}\"\n"),
            "x = r'\\d+' 'b'\ny = f\"{a!r}\"\n"
        );
    }

    #[test]
    fn render_parenthesizes_by_precedence() {
        assert_eq!(render("x = (a + b) * c\n"), "x = (a + b) * c\n");
        assert_eq!(render("x = a - (b - c)\n"), "x = a - (b - c)\n");
        assert_eq!(render("x = (-2) ** 2\n"), "x = (-2) ** 2\n");
        assert_eq!(render("x = 2 ** -1\n"), "x = 2 ** -1\n");
        assert_eq!(render("x = a, b\n"), "x = (a, b)\n");
        assert_eq!(render("x = (1,)\n"), "x = (1,)\n");
        assert_eq!(render("x = (1).real\n"), "x = (1).real\n");
        assert_eq!(render("f((yield))\n"), "f((yield))\n");
    }

    #[test]
    fn render_roundtrip_match_statements() {
        is_idempotent(
            "match command.split():\n    case [action]:\n        pass\n    case [\"go\", direction] | [\"move\", direction]:\n        go(direction)\n    case Point(x=0, y=0) as origin if origin:\n        pass\n    case {\"k\": -1, **rest}:\n        pass\n    case (1 + 2j) | None | Color.RED:\n        pass\n    case [1, *_, (a | b) as c]:\n        pass\n    case _:\n        pass\n",
        );
    }

    #[test]
    fn render_match_normalizes_sequence_patterns() {
        assert_eq!(
            render("match p:\n    case a, *rest:\n        pass\n    case (x,) if x > 0:\n        pass\n"),
            "match p:\n    case [a, *rest]:\n        pass\n    case [x] if x > 0:\n        pass\n"
        );
    }

    #[test]
    fn render_roundtrip_type_params_and_exception_groups() {
        is_idempotent(
            "type Pair[T] = tuple[T, T]\ndef first[T: (int, str), *Ts, **P](x: T) -> T:\n    return x\nclass Box[T = int]:\n    pass\ntry:\n    pass\nexcept* (ValueError, TypeError) as eg:\n    pass\n",
        );
    }

    #[test]
    fn render_flattens_parenthesized_with_items() {
        assert_eq!(
            render("with (open(a) as f, lock,):\n    pass\n"),
            "with open(a) as f, lock:\n    pass\n"
        );
        assert_eq!(render("with (a, b) as c:\n    pass\n"), "with (a, b) as c:\n    pass\n");
    }

    #[test]
    fn render_separates_top_level_definitions() {
        assert_eq!(
            render("import a\ndef f():\n    pass\nx = 1\n"),
            "import a\n\ndef f():\n    pass\n\nx = 1\n"
        );
    }
}
