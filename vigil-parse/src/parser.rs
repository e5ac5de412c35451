#![forbid(unsafe_code)]

use std::mem;

use vigil_ast::{
    Alias, AnnAssignStmt, AssertStmt, AssignStmt, AugAssignStmt, BinOp, BoolOp, CallArg, ClassDef,
    CmpOp, Comprehension, Constant, DeleteStmt, DictItem, ExceptHandler, Expr, ExprKind, ForStmt,
    FunctionDef, Ident, IfStmt, ImportFromStmt, ImportStmt, MatchCase, MatchStmt, Module, NamedParam,
    NamesStmt, Param, Pattern, PatternKind, RaiseStmt, ReturnStmt, Span, Stmt, TryStmt, TypeAliasStmt,
    TypeParam, TypeParamKind, UnaryOp, WhileStmt, WithItem, WithStmt, span_between,
};
use vigil_lex::{Token, TokenKind};

use crate::error::ParseError;

/// Blocks and expressions nested deeper than this are rejected instead of exhausting the stack.
pub const MAX_NESTING: usize = 100;

pub struct Parser<'a> {
    tokens: &'a [Token],
    idx: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            idx: 0,
            depth: 0,
        }
    }

    pub fn parse_module(&mut self) -> Result<Module, ParseError> {
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.at(TokenKind::Eof) {
                break;
            }
            body.extend(self.parse_stmt()?);
        }
        Ok(Module { body })
    }

    pub fn parse_expr_eof(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_testlist_star_expr()?;
        self.skip_newlines();
        if !self.at(TokenKind::Eof) {
            return Err(self.error_here("expected end of input"));
        }
        Ok(expr)
    }

    /// Parse one statement line. A line of `;`-separated simple statements yields several.
    fn parse_stmt(&mut self) -> Result<Vec<Stmt>, ParseError> {
        match self.peek_kind() {
            Some(TokenKind::KwDef) => {
                let start = self.current_span();
                Ok(vec![Stmt::FunctionDef(self.parse_function_def(
                    Vec::new(),
                    false,
                    start,
                )?)])
            }
            Some(TokenKind::KwAsync) => {
                let start = self.expect(TokenKind::KwAsync)?.span;
                match self.peek_kind() {
                    Some(TokenKind::KwDef) => Ok(vec![Stmt::FunctionDef(self.parse_function_def(
                        Vec::new(),
                        true,
                        start,
                    )?)]),
                    Some(TokenKind::KwFor) => Ok(vec![Stmt::For(self.parse_for_stmt(true, start)?)]),
                    Some(TokenKind::KwWith) => Ok(vec![Stmt::With(self.parse_with_stmt(true, start)?)]),
                    _ => Err(self.error_here("expected 'def', 'for' or 'with' after 'async'")),
                }
            }
            Some(TokenKind::At) => Ok(vec![self.parse_decorated()?]),
            Some(TokenKind::KwClass) => {
                let start = self.current_span();
                Ok(vec![Stmt::ClassDef(self.parse_class_def(Vec::new(), start)?)])
            }
            Some(TokenKind::KwIf) => Ok(vec![Stmt::If(self.parse_if_stmt()?)]),
            Some(TokenKind::KwWhile) => Ok(vec![Stmt::While(self.parse_while_stmt()?)]),
            Some(TokenKind::KwFor) => {
                let start = self.current_span();
                Ok(vec![Stmt::For(self.parse_for_stmt(false, start)?)])
            }
            Some(TokenKind::KwTry) => Ok(vec![Stmt::Try(self.parse_try_stmt()?)]),
            Some(TokenKind::KwWith) => {
                let start = self.current_span();
                Ok(vec![Stmt::With(self.parse_with_stmt(false, start)?)])
            }
            Some(TokenKind::Name(_)) if self.at_soft_keyword("match") => match self.try_parse_match()? {
                Some(m) => Ok(vec![Stmt::Match(m)]),
                None => self.parse_simple_stmts(),
            },
            Some(TokenKind::Indent) => Err(self.error_here("unexpected indent")),
            Some(TokenKind::Dedent) => Err(self.error_here("unexpected dedent")),
            _ => self.parse_simple_stmts(),
        }
    }

    fn parse_simple_stmts(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = vec![self.parse_small_stmt()?];
        while self.at(TokenKind::Semi) {
            self.next();
            if self.at(TokenKind::Newline) || self.at(TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_small_stmt()?);
        }
        self.expect_newline_or_eof()?;
        Ok(stmts)
    }

    /// Body after a `:`; either an indented block or simple statements on the same line.
    fn parse_suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.nested(Self::parse_suite_body)
    }

    fn parse_suite_body(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if !self.at(TokenKind::Newline) {
            return self.parse_simple_stmts();
        }
        self.next();
        let indent = self.expect(TokenKind::Indent).map_err(|e| ParseError {
            message: "expected an indented block".to_string(),
            span: e.span,
        })?;

        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            if self.at(TokenKind::Dedent) {
                self.next();
                return Ok(body);
            }
            if self.at(TokenKind::Eof) {
                return Err(ParseError {
                    message: "unterminated block; expected dedent".to_string(),
                    span: indent.span,
                });
            }
            body.extend(self.parse_stmt()?);
        }
    }

    fn parse_decorated(&mut self) -> Result<Stmt, ParseError> {
        let start = self.current_span();
        let mut decorators = Vec::new();
        while self.at(TokenKind::At) {
            self.next();
            decorators.push(self.parse_named_expr()?);
            self.expect(TokenKind::Newline)?;
            self.skip_newlines();
        }
        match self.peek_kind() {
            Some(TokenKind::KwDef) => Ok(Stmt::FunctionDef(self.parse_function_def(decorators, false, start)?)),
            Some(TokenKind::KwAsync) => {
                self.next();
                if !self.at(TokenKind::KwDef) {
                    return Err(self.error_here("expected 'def' after 'async'"));
                }
                Ok(Stmt::FunctionDef(self.parse_function_def(decorators, true, start)?))
            }
            Some(TokenKind::KwClass) => Ok(Stmt::ClassDef(self.parse_class_def(decorators, start)?)),
            _ => Err(self.error_here("expected function or class definition after decorator")),
        }
    }

    fn parse_function_def(
        &mut self,
        decorators: Vec<Expr>,
        is_async: bool,
        start: Span,
    ) -> Result<FunctionDef, ParseError> {
        self.expect(TokenKind::KwDef)?;
        let name = self.expect_name()?;
        let type_params = self.parse_type_params()?;
        self.expect(TokenKind::LParen)?;
        let params = self.parse_params(true, TokenKind::RParen)?;
        self.expect(TokenKind::RParen)?;
        let returns = if self.at(TokenKind::Arrow) {
            self.next();
            Some(self.parse_test()?)
        } else {
            None
        };
        let colon = self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        Ok(FunctionDef {
            span: join(start, body_end(colon.span, &body)),
            decorators,
            is_async,
            name,
            type_params,
            params,
            returns,
            body,
        })
    }

    /// Parameter list up to (not including) `close`. Lambdas pass `annotations = false`.
    fn parse_params(&mut self, annotations: bool, close: TokenKind) -> Result<Vec<Param>, ParseError> {
        let mut params = Vec::new();
        while !self.at(close.clone()) {
            if self.at(TokenKind::Slash) {
                let slash = self.expect(TokenKind::Slash)?;
                params.push(Param::PositionalOnlyMarker(slash.span));
            } else if self.at(TokenKind::Star) {
                let star = self.expect(TokenKind::Star)?;
                if self.at(TokenKind::Comma) || self.at(close.clone()) {
                    params.push(Param::KeywordOnlyMarker(star.span));
                } else {
                    let mut p = self.parse_named_param(annotations, false)?;
                    p.span = join(star.span, p.span);
                    params.push(Param::VarPositional(p));
                }
            } else if self.at(TokenKind::DoubleStar) {
                let stars = self.expect(TokenKind::DoubleStar)?;
                let mut p = self.parse_named_param(annotations, false)?;
                p.span = join(stars.span, p.span);
                params.push(Param::VarKeyword(p));
            } else {
                params.push(Param::Named(self.parse_named_param(annotations, true)?));
            }

            if self.at(TokenKind::Comma) {
                self.next();
                continue;
            }
            break;
        }
        Ok(params)
    }

    fn parse_named_param(&mut self, annotations: bool, allow_default: bool) -> Result<NamedParam, ParseError> {
        let name = self.expect_name()?;
        let mut end = name.span;
        let annotation = if annotations && self.at(TokenKind::Colon) {
            self.next();
            let ann = self.parse_test()?;
            end = ann.span;
            Some(ann)
        } else {
            None
        };
        let default = if allow_default && self.at(TokenKind::Eq) {
            self.next();
            let d = self.parse_test()?;
            end = d.span;
            Some(d)
        } else {
            None
        };
        Ok(NamedParam {
            span: join(name.span, end),
            name,
            annotation,
            default,
        })
    }

    fn parse_class_def(&mut self, decorators: Vec<Expr>, start: Span) -> Result<ClassDef, ParseError> {
        self.expect(TokenKind::KwClass)?;
        let name = self.expect_name()?;
        let type_params = self.parse_type_params()?;
        let bases = if self.at(TokenKind::LParen) {
            self.next();
            let args = self.parse_call_args()?;
            self.expect(TokenKind::RParen)?;
            args
        } else {
            Vec::new()
        };
        let colon = self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        Ok(ClassDef {
            span: join(start, body_end(colon.span, &body)),
            decorators,
            name,
            type_params,
            bases,
            body,
        })
    }

    fn parse_if_stmt(&mut self) -> Result<IfStmt, ParseError> {
        // `elif` branches are collected flat and folded into nested `orelse` from the back.
        let mut branches = Vec::new();
        loop {
            let start = self.expect_any()?;
            let test = self.parse_named_expr()?;
            let colon = self.expect(TokenKind::Colon)?;
            let body = self.parse_suite()?;
            let end = body_end(colon.span, &body);
            branches.push((start.span, test, body, end));
            if !self.at(TokenKind::KwElif) {
                break;
            }
        }

        let mut orelse = self.parse_else_suite()?;
        loop {
            let Some((start, test, body, end)) = branches.pop() else {
                return Err(self.error_here("expected `if`"));
            };
            let stmt = IfStmt {
                span: join(start, body_end(end, &orelse)),
                test,
                body,
                orelse,
            };
            if branches.is_empty() {
                return Ok(stmt);
            }
            orelse = vec![Stmt::If(stmt)];
        }
    }

    fn parse_else_suite(&mut self) -> Result<Vec<Stmt>, ParseError> {
        if !self.at(TokenKind::KwElse) {
            return Ok(Vec::new());
        }
        self.next();
        self.expect(TokenKind::Colon)?;
        self.parse_suite()
    }

    fn parse_while_stmt(&mut self) -> Result<WhileStmt, ParseError> {
        let start = self.expect(TokenKind::KwWhile)?;
        let test = self.parse_named_expr()?;
        let colon = self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        let orelse = self.parse_else_suite()?;
        let end = body_end(body_end(colon.span, &body), &orelse);
        Ok(WhileStmt {
            span: join(start.span, end),
            test,
            body,
            orelse,
        })
    }

    fn parse_for_stmt(&mut self, is_async: bool, start: Span) -> Result<ForStmt, ParseError> {
        self.expect(TokenKind::KwFor)?;
        let target = self.parse_target_list()?;
        self.expect(TokenKind::KwIn)?;
        let iter = self.parse_testlist_star_expr()?;
        let colon = self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        let orelse = self.parse_else_suite()?;
        let end = body_end(body_end(colon.span, &body), &orelse);
        Ok(ForStmt {
            span: join(start, end),
            is_async,
            target,
            iter,
            body,
            orelse,
        })
    }

    fn parse_with_stmt(&mut self, is_async: bool, start: Span) -> Result<WithStmt, ParseError> {
        self.expect(TokenKind::KwWith)?;
        let items = match self.try_parse_paren_with_items() {
            Some(items) => items,
            None => {
                let mut items = vec![self.parse_with_item()?];
                while self.at(TokenKind::Comma) {
                    self.next();
                    items.push(self.parse_with_item()?);
                }
                items
            }
        };
        let colon = self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        Ok(WithStmt {
            span: join(start, body_end(colon.span, &body)),
            is_async,
            items,
            body,
        })
    }

    fn parse_with_item(&mut self) -> Result<WithItem, ParseError> {
        let context = self.parse_test()?;
        let var = if self.at(TokenKind::KwAs) {
            self.next();
            Some(self.parse_star_or_bitor()?)
        } else {
            None
        };
        Ok(WithItem { context, var })
    }

    /// `with (a as b, c):`. Rewinds when the parenthesis turns out to open the first
    /// context expression, as in `with (a, b) as c:` or `with (yield x):`.
    fn try_parse_paren_with_items(&mut self) -> Option<Vec<WithItem>> {
        if !self.at(TokenKind::LParen) {
            return None;
        }
        let save = self.idx;
        self.next();
        let mut items = Vec::new();
        while !self.at(TokenKind::RParen) {
            let Ok(item) = self.parse_with_item() else {
                self.idx = save;
                return None;
            };
            items.push(item);
            if !self.at(TokenKind::Comma) {
                break;
            }
            self.next();
        }
        if items.is_empty() || !self.at(TokenKind::RParen) || !matches!(self.peek_kind_n(1), Some(TokenKind::Colon)) {
            self.idx = save;
            return None;
        }
        self.next();
        Some(items)
    }

    fn parse_try_stmt(&mut self) -> Result<TryStmt, ParseError> {
        let start = self.expect(TokenKind::KwTry)?;
        let colon = self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        let mut end = body_end(colon.span, &body);

        let mut handlers = Vec::new();
        let mut is_star = false;
        while self.at(TokenKind::KwExcept) {
            let except = self.expect(TokenKind::KwExcept)?;
            let star = self.at(TokenKind::Star);
            if star {
                self.next();
            }
            if handlers.is_empty() {
                is_star = star;
            } else if star != is_star {
                return Err(ParseError {
                    message: "cannot have both 'except' and 'except*' on the same 'try'".to_string(),
                    span: except.span,
                });
            }
            let ty = if self.at(TokenKind::Colon) {
                if star {
                    return Err(self.error_here("expected exception type after 'except*'"));
                }
                None
            } else {
                Some(self.parse_test()?)
            };
            let name = if ty.is_some() && self.at(TokenKind::KwAs) {
                self.next();
                Some(self.expect_name()?)
            } else {
                None
            };
            let colon = self.expect(TokenKind::Colon)?;
            let hbody = self.parse_suite()?;
            end = body_end(colon.span, &hbody);
            handlers.push(ExceptHandler {
                span: join(except.span, end),
                ty,
                name,
                body: hbody,
            });
        }

        let orelse = if handlers.is_empty() {
            Vec::new()
        } else {
            self.parse_else_suite()?
        };
        end = body_end(end, &orelse);

        let finalbody = if self.at(TokenKind::KwFinally) {
            self.next();
            self.expect(TokenKind::Colon)?;
            self.parse_suite()?
        } else {
            Vec::new()
        };
        end = body_end(end, &finalbody);

        if handlers.is_empty() && finalbody.is_empty() {
            return Err(ParseError {
                message: "expected 'except' or 'finally' block".to_string(),
                span: self.current_span(),
            });
        }

        Ok(TryStmt {
            span: join(start.span, end),
            is_star,
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    fn at_soft_keyword(&self, kw: &str) -> bool {
        matches!(self.peek_kind(), Some(TokenKind::Name(n)) if n == kw)
    }

    /// `match` is only a keyword when a subject, `:`, and an indented `case` follow.
    /// Anything else rewinds and is parsed as an ordinary statement.
    fn try_parse_match(&mut self) -> Result<Option<MatchStmt>, ParseError> {
        let save = self.idx;
        let kw = self.expect_any()?;
        let subject = match self.parse_match_subject() {
            Ok(subject) if self.at_case_block() => subject,
            _ => {
                self.idx = save;
                return Ok(None);
            }
        };
        self.expect(TokenKind::Colon)?;
        self.expect(TokenKind::Newline)?;
        self.expect(TokenKind::Indent)?;

        let mut cases = Vec::new();
        loop {
            self.skip_newlines();
            if self.at(TokenKind::Dedent) {
                self.next();
                break;
            }
            if !self.at_soft_keyword("case") {
                return Err(self.error_here("expected 'case' block"));
            }
            cases.push(self.parse_match_case()?);
        }

        let end = cases.last().map_or(kw.span, |c| c.span);
        Ok(Some(MatchStmt {
            span: join(kw.span, end),
            subject,
            cases,
        }))
    }

    fn at_case_block(&self) -> bool {
        self.at(TokenKind::Colon)
            && matches!(self.peek_kind_n(1), Some(TokenKind::Newline))
            && matches!(self.peek_kind_n(2), Some(TokenKind::Indent))
            && matches!(self.peek_kind_n(3), Some(TokenKind::Name(n)) if n == "case")
    }

    fn parse_match_subject(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_star_or_named()?;
        if !self.at(TokenKind::Comma) {
            if matches!(first.kind, ExprKind::Starred(_)) {
                return Err(ParseError {
                    message: "starred match subject must be part of a tuple".to_string(),
                    span: first.span,
                });
            }
            return Ok(first);
        }
        let start = first.span;
        let mut end = first.span;
        let mut elts = vec![first];
        while self.at(TokenKind::Comma) {
            end = self.expect(TokenKind::Comma)?.span;
            if !self.starts_expr() {
                break;
            }
            let e = self.parse_star_or_named()?;
            end = e.span;
            elts.push(e);
        }
        Ok(Expr::new(join(start, end), ExprKind::Tuple(elts)))
    }

    fn parse_match_case(&mut self) -> Result<MatchCase, ParseError> {
        let kw = self.expect_any()?;
        let pattern = self.parse_case_patterns()?;
        let guard = if self.at(TokenKind::KwIf) {
            self.next();
            Some(self.parse_named_expr()?)
        } else {
            None
        };
        let colon = self.expect(TokenKind::Colon)?;
        let body = self.parse_suite()?;
        Ok(MatchCase {
            span: join(kw.span, body_end(colon.span, &body)),
            pattern,
            guard,
            body,
        })
    }

    /// `case a, *rest:` is an open sequence; a single pattern is returned as is.
    fn parse_case_patterns(&mut self) -> Result<Pattern, ParseError> {
        let first = self.parse_maybe_star_pattern()?;
        if !self.at(TokenKind::Comma) {
            if matches!(first.kind, PatternKind::Star(_)) {
                return Err(ParseError {
                    message: "star pattern must be inside a sequence".to_string(),
                    span: first.span,
                });
            }
            return Ok(first);
        }
        let start = first.span;
        let mut end = first.span;
        let mut elts = vec![first];
        while self.at(TokenKind::Comma) {
            end = self.expect(TokenKind::Comma)?.span;
            if self.at(TokenKind::Colon) || self.at(TokenKind::KwIf) {
                break;
            }
            let p = self.parse_maybe_star_pattern()?;
            end = p.span;
            elts.push(p);
        }
        Ok(Pattern {
            span: join(start, end),
            kind: PatternKind::Sequence(elts),
        })
    }

    fn parse_maybe_star_pattern(&mut self) -> Result<Pattern, ParseError> {
        if !self.at(TokenKind::Star) {
            return self.parse_pattern();
        }
        let star = self.expect(TokenKind::Star)?;
        let name = self.expect_name()?;
        let span = join(star.span, name.span);
        let name = (name.node != "_").then_some(name);
        Ok(Pattern {
            span,
            kind: PatternKind::Star(name),
        })
    }

    fn parse_pattern(&mut self) -> Result<Pattern, ParseError> {
        let pattern = self.parse_or_pattern()?;
        if !self.at(TokenKind::KwAs) {
            return Ok(pattern);
        }
        self.next();
        let name = self.expect_name()?;
        if name.node == "_" {
            return Err(ParseError {
                message: "cannot use '_' as a target".to_string(),
                span: name.span,
            });
        }
        Ok(Pattern {
            span: join(pattern.span, name.span),
            kind: PatternKind::As {
                pattern: Some(Box::new(pattern)),
                name: Some(name),
            },
        })
    }

    fn parse_or_pattern(&mut self) -> Result<Pattern, ParseError> {
        let first = self.parse_closed_pattern()?;
        if !self.at(TokenKind::Pipe) {
            return Ok(first);
        }
        let mut alternatives = vec![first];
        while self.at(TokenKind::Pipe) {
            self.next();
            alternatives.push(self.parse_closed_pattern()?);
        }
        let span = join(alternatives[0].span, alternatives[alternatives.len() - 1].span);
        Ok(Pattern {
            span,
            kind: PatternKind::Or(alternatives),
        })
    }

    fn parse_closed_pattern(&mut self) -> Result<Pattern, ParseError> {
        self.nested(Self::parse_pattern_atom)
    }

    fn parse_pattern_atom(&mut self) -> Result<Pattern, ParseError> {
        let span = self.current_span();
        let singleton = match self.peek_kind() {
            Some(TokenKind::KwNone) => Some(Constant::None),
            Some(TokenKind::KwTrue) => Some(Constant::True),
            Some(TokenKind::KwFalse) => Some(Constant::False),
            _ => None,
        };
        if let Some(c) = singleton {
            self.next();
            return Ok(Pattern {
                span,
                kind: PatternKind::Singleton(c),
            });
        }

        match self.peek_kind() {
            Some(TokenKind::String(_)) => {
                let value = self.parse_atom()?;
                Ok(Pattern {
                    span: value.span,
                    kind: PatternKind::Value(value),
                })
            }
            Some(TokenKind::Number(_) | TokenKind::Minus) => {
                let value = self.parse_number_pattern()?;
                Ok(Pattern {
                    span: value.span,
                    kind: PatternKind::Value(value),
                })
            }
            Some(TokenKind::Name(_)) => self.parse_name_pattern(),
            Some(TokenKind::LParen) => self.parse_group_pattern(),
            Some(TokenKind::LBracket) => self.parse_list_pattern(),
            Some(TokenKind::LBrace) => self.parse_mapping_pattern(),
            _ => Err(self.error_here("expected pattern")),
        }
    }

    /// `-1`, `1.5`, `1 + 2j`, `-1 - 2j`.
    fn parse_number_pattern(&mut self) -> Result<Expr, ParseError> {
        let mut value = if self.at(TokenKind::Minus) {
            let minus = self.expect(TokenKind::Minus)?;
            let n = self.parse_number_literal()?;
            Expr::new(
                join(minus.span, n.span),
                ExprKind::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(n),
                },
            )
        } else {
            self.parse_number_literal()?
        };
        let op = match self.peek_kind() {
            Some(TokenKind::Plus) => Some(BinOp::Add),
            Some(TokenKind::Minus) => Some(BinOp::Sub),
            _ => None,
        };
        if let Some(op) = op {
            self.next();
            let imag = self.parse_number_literal()?;
            value = Expr::new(
                join(value.span, imag.span),
                ExprKind::Binary {
                    left: Box::new(value),
                    op,
                    right: Box::new(imag),
                },
            );
        }
        Ok(value)
    }

    fn parse_number_literal(&mut self) -> Result<Expr, ParseError> {
        let tok = self.expect_any()?;
        match tok.kind {
            TokenKind::Number(text) => Ok(Expr::new(tok.span, ExprKind::Number(text))),
            _ => Err(ParseError {
                message: "expected number".to_string(),
                span: tok.span,
            }),
        }
    }

    /// Capture, wildcard, dotted value, or class pattern.
    fn parse_name_pattern(&mut self) -> Result<Pattern, ParseError> {
        let first = self.expect_name()?;
        let mut value = Expr::name(first.span, first.node.clone());
        let mut dotted = false;
        while self.at(TokenKind::Dot) {
            self.next();
            let attr = self.expect_name()?;
            value = Expr::new(
                join(value.span, attr.span),
                ExprKind::Attribute {
                    value: Box::new(value),
                    attr,
                },
            );
            dotted = true;
        }
        if self.at(TokenKind::LParen) {
            return self.parse_class_pattern(value);
        }

        let span = value.span;
        let kind = if dotted {
            PatternKind::Value(value)
        } else if first.node == "_" {
            PatternKind::As {
                pattern: None,
                name: None,
            }
        } else {
            PatternKind::As {
                pattern: None,
                name: Some(first),
            }
        };
        Ok(Pattern { span, kind })
    }

    fn parse_class_pattern(&mut self, cls: Expr) -> Result<Pattern, ParseError> {
        self.expect(TokenKind::LParen)?;
        let mut patterns = Vec::new();
        let mut keywords = Vec::new();
        while !self.at(TokenKind::RParen) {
            if matches!(self.peek_kind(), Some(TokenKind::Name(_)))
                && matches!(self.peek_kind_n(1), Some(TokenKind::Eq))
            {
                let name = self.expect_name()?;
                self.next();
                keywords.push((name, self.parse_pattern()?));
            } else if !keywords.is_empty() {
                return Err(self.error_here("positional patterns follow keyword patterns"));
            } else {
                patterns.push(self.parse_pattern()?);
            }
            if !self.at(TokenKind::Comma) {
                break;
            }
            self.next();
        }
        let rparen = self.expect(TokenKind::RParen)?;
        Ok(Pattern {
            span: join(cls.span, rparen.span),
            kind: PatternKind::Class {
                cls,
                patterns,
                keywords,
            },
        })
    }

    /// `(p)` is a group; `()` and `(p,)` are sequences.
    fn parse_group_pattern(&mut self) -> Result<Pattern, ParseError> {
        let lparen = self.expect(TokenKind::LParen)?;
        let mut elts = Vec::new();
        if !self.at(TokenKind::RParen) {
            let first = self.parse_maybe_star_pattern()?;
            if self.at(TokenKind::RParen) && !matches!(first.kind, PatternKind::Star(_)) {
                self.next();
                return Ok(first);
            }
            elts.push(first);
            while self.at(TokenKind::Comma) {
                self.next();
                if self.at(TokenKind::RParen) {
                    break;
                }
                elts.push(self.parse_maybe_star_pattern()?);
            }
        }
        let rparen = self.expect(TokenKind::RParen)?;
        Ok(Pattern {
            span: join(lparen.span, rparen.span),
            kind: PatternKind::Sequence(elts),
        })
    }

    fn parse_list_pattern(&mut self) -> Result<Pattern, ParseError> {
        let lbracket = self.expect(TokenKind::LBracket)?;
        let mut elts = Vec::new();
        while !self.at(TokenKind::RBracket) {
            elts.push(self.parse_maybe_star_pattern()?);
            if !self.at(TokenKind::Comma) {
                break;
            }
            self.next();
        }
        let rbracket = self.expect(TokenKind::RBracket)?;
        Ok(Pattern {
            span: join(lbracket.span, rbracket.span),
            kind: PatternKind::Sequence(elts),
        })
    }

    fn parse_mapping_pattern(&mut self) -> Result<Pattern, ParseError> {
        let lbrace = self.expect(TokenKind::LBrace)?;
        let mut keys = Vec::new();
        let mut patterns = Vec::new();
        let mut rest = None;
        while !self.at(TokenKind::RBrace) {
            if rest.is_some() {
                return Err(self.error_here("'**' pattern must come last"));
            }
            if self.at(TokenKind::DoubleStar) {
                self.next();
                rest = Some(self.expect_name()?);
            } else {
                keys.push(self.parse_mapping_key()?);
                self.expect(TokenKind::Colon)?;
                patterns.push(self.parse_pattern()?);
            }
            if !self.at(TokenKind::Comma) {
                break;
            }
            self.next();
        }
        let rbrace = self.expect(TokenKind::RBrace)?;
        Ok(Pattern {
            span: join(lbrace.span, rbrace.span),
            kind: PatternKind::Mapping { keys, patterns, rest },
        })
    }

    fn parse_mapping_key(&mut self) -> Result<Expr, ParseError> {
        let key = self.parse_closed_pattern()?;
        match key.kind {
            PatternKind::Value(value) => Ok(value),
            PatternKind::Singleton(c) => Ok(Expr::constant(key.span, c)),
            _ => Err(ParseError {
                message: "mapping pattern keys must be literals or dotted names".to_string(),
                span: key.span,
            }),
        }
    }

    /// `type X = ...` and `type X[T] = ...`; `type` stays a plain name everywhere else.
    fn at_type_alias(&self) -> bool {
        self.at_soft_keyword("type")
            && matches!(self.peek_kind_n(1), Some(TokenKind::Name(_)))
            && matches!(self.peek_kind_n(2), Some(TokenKind::Eq | TokenKind::LBracket))
    }

    fn parse_type_alias(&mut self) -> Result<TypeAliasStmt, ParseError> {
        let kw = self.expect_any()?;
        let name = self.expect_name()?;
        let type_params = self.parse_type_params()?;
        self.expect(TokenKind::Eq)?;
        let value = self.parse_test()?;
        Ok(TypeAliasStmt {
            span: join(kw.span, value.span),
            name,
            type_params,
            value,
        })
    }

    /// Optional `[T: bound = default, *Ts, **P]` after a function, class, or alias name.
    fn parse_type_params(&mut self) -> Result<Vec<TypeParam>, ParseError> {
        let mut params = Vec::new();
        if !self.at(TokenKind::LBracket) {
            return Ok(params);
        }
        let lbracket = self.expect(TokenKind::LBracket)?;
        while !self.at(TokenKind::RBracket) {
            params.push(self.parse_type_param()?);
            if !self.at(TokenKind::Comma) {
                break;
            }
            self.next();
        }
        let rbracket = self.expect(TokenKind::RBracket)?;
        if params.is_empty() {
            return Err(ParseError {
                message: "type parameter list cannot be empty".to_string(),
                span: join(lbracket.span, rbracket.span),
            });
        }
        Ok(params)
    }

    fn parse_type_param(&mut self) -> Result<TypeParam, ParseError> {
        let start = self.current_span();
        let kind = match self.peek_kind() {
            Some(TokenKind::Star) => TypeParamKind::TypeVarTuple,
            Some(TokenKind::DoubleStar) => TypeParamKind::ParamSpec,
            _ => TypeParamKind::TypeVar,
        };
        if kind != TypeParamKind::TypeVar {
            self.next();
        }
        let name = self.expect_name()?;
        let mut end = name.span;
        let bound = if kind == TypeParamKind::TypeVar && self.at(TokenKind::Colon) {
            self.next();
            let bound = self.parse_test()?;
            end = bound.span;
            Some(bound)
        } else {
            None
        };
        let default = if self.at(TokenKind::Eq) {
            self.next();
            let default = self.parse_star_or_test()?;
            end = default.span;
            Some(default)
        } else {
            None
        };
        Ok(TypeParam {
            span: join(start, end),
            kind,
            name,
            bound,
            default,
        })
    }

    fn parse_small_stmt(&mut self) -> Result<Stmt, ParseError> {
        let start = self.current_span();
        match self.peek_kind() {
            Some(TokenKind::Name(_)) if self.at_type_alias() => Ok(Stmt::TypeAlias(self.parse_type_alias()?)),
            Some(TokenKind::KwPass) => {
                self.next();
                Ok(Stmt::Pass(start))
            }
            Some(TokenKind::KwBreak) => {
                self.next();
                Ok(Stmt::Break(start))
            }
            Some(TokenKind::KwContinue) => {
                self.next();
                Ok(Stmt::Continue(start))
            }
            Some(TokenKind::KwReturn) => {
                self.next();
                let value = if self.at_stmt_end() {
                    None
                } else {
                    Some(self.parse_testlist_star_expr()?)
                };
                let span = value.as_ref().map_or(start, |v| join(start, v.span));
                Ok(Stmt::Return(ReturnStmt { span, value }))
            }
            Some(TokenKind::KwRaise) => {
                self.next();
                let mut span = start;
                let exc = if self.at_stmt_end() {
                    None
                } else {
                    let e = self.parse_test()?;
                    span = join(start, e.span);
                    Some(e)
                };
                let cause = if exc.is_some() && self.at(TokenKind::KwFrom) {
                    self.next();
                    let c = self.parse_test()?;
                    span = join(start, c.span);
                    Some(c)
                } else {
                    None
                };
                Ok(Stmt::Raise(RaiseStmt { span, exc, cause }))
            }
            Some(TokenKind::KwGlobal) | Some(TokenKind::KwNonlocal) => {
                let kw = self.expect_any()?;
                let mut names = vec![self.expect_name()?];
                while self.at(TokenKind::Comma) {
                    self.next();
                    names.push(self.expect_name()?);
                }
                let end = names.last().map_or(kw.span, |n| n.span);
                let stmt = NamesStmt {
                    span: join(kw.span, end),
                    names,
                };
                if kw.kind == TokenKind::KwGlobal {
                    Ok(Stmt::Global(stmt))
                } else {
                    Ok(Stmt::Nonlocal(stmt))
                }
            }
            Some(TokenKind::KwDel) => {
                self.next();
                let mut targets = vec![self.parse_star_or_bitor()?];
                while self.at(TokenKind::Comma) {
                    self.next();
                    if !self.starts_expr() {
                        break;
                    }
                    targets.push(self.parse_star_or_bitor()?);
                }
                let end = targets.last().map_or(start, |t| t.span);
                Ok(Stmt::Delete(DeleteStmt {
                    span: join(start, end),
                    targets,
                }))
            }
            Some(TokenKind::KwAssert) => {
                self.next();
                let test = self.parse_test()?;
                let mut end = test.span;
                let msg = if self.at(TokenKind::Comma) {
                    self.next();
                    let m = self.parse_test()?;
                    end = m.span;
                    Some(m)
                } else {
                    None
                };
                Ok(Stmt::Assert(AssertStmt {
                    span: join(start, end),
                    test,
                    msg,
                }))
            }
            Some(TokenKind::KwImport) => {
                self.next();
                let mut names = vec![self.parse_dotted_alias()?];
                while self.at(TokenKind::Comma) {
                    self.next();
                    names.push(self.parse_dotted_alias()?);
                }
                let end = names.last().map_or(start, |a| a.span);
                Ok(Stmt::Import(ImportStmt {
                    span: join(start, end),
                    names,
                }))
            }
            Some(TokenKind::KwFrom) => Ok(Stmt::ImportFrom(self.parse_import_from()?)),
            _ => self.parse_expr_stmt(),
        }
    }

    fn parse_import_from(&mut self) -> Result<ImportFromStmt, ParseError> {
        let start = self.expect(TokenKind::KwFrom)?;
        let mut level = 0usize;
        loop {
            match self.peek_kind() {
                Some(TokenKind::Dot) => level += 1,
                Some(TokenKind::Ellipsis) => level += 3,
                _ => break,
            }
            self.next();
        }
        let module = if self.at(TokenKind::KwImport) {
            None
        } else {
            Some(self.parse_dotted_name()?.node)
        };
        if level == 0 && module.is_none() {
            return Err(self.error_here("expected module name"));
        }
        self.expect(TokenKind::KwImport)?;

        let mut names = Vec::new();
        let end;
        if self.at(TokenKind::Star) {
            let star = self.expect(TokenKind::Star)?;
            end = star.span;
            names.push(Alias {
                span: star.span,
                name: "*".to_string(),
                asname: None,
            });
        } else if self.at(TokenKind::LParen) {
            self.next();
            while !self.at(TokenKind::RParen) {
                names.push(self.parse_name_alias()?);
                if self.at(TokenKind::Comma) {
                    self.next();
                    continue;
                }
                break;
            }
            end = self.expect(TokenKind::RParen)?.span;
        } else {
            loop {
                let alias = self.parse_name_alias()?;
                let alias_span = alias.span;
                names.push(alias);
                if self.at(TokenKind::Comma) {
                    self.next();
                    continue;
                }
                end = alias_span;
                break;
            }
        }
        if names.is_empty() {
            return Err(ParseError {
                message: "expected at least one imported name".to_string(),
                span: end,
            });
        }

        Ok(ImportFromStmt {
            span: join(start.span, end),
            level,
            module,
            names,
        })
    }

    fn parse_dotted_name(&mut self) -> Result<Ident, ParseError> {
        let first = self.expect_name()?;
        let mut span = first.span;
        let mut path = first.node;
        while self.at(TokenKind::Dot) {
            self.next();
            let part = self.expect_name()?;
            path.push('.');
            path.push_str(&part.node);
            span = join(span, part.span);
        }
        Ok(Ident::new(span, path))
    }

    fn parse_dotted_alias(&mut self) -> Result<Alias, ParseError> {
        let name = self.parse_dotted_name()?;
        self.finish_alias(name)
    }

    fn parse_name_alias(&mut self) -> Result<Alias, ParseError> {
        let name = self.expect_name()?;
        self.finish_alias(name)
    }

    fn finish_alias(&mut self, name: Ident) -> Result<Alias, ParseError> {
        let asname = if self.at(TokenKind::KwAs) {
            self.next();
            Some(self.expect_name()?)
        } else {
            None
        };
        let end = asname.as_ref().map_or(name.span, |a| a.span);
        Ok(Alias {
            span: join(name.span, end),
            name: name.node,
            asname,
        })
    }

    fn parse_expr_stmt(&mut self) -> Result<Stmt, ParseError> {
        let first = if self.at(TokenKind::KwYield) {
            self.parse_yield_expr()?
        } else {
            self.parse_testlist_star_expr()?
        };

        if self.at(TokenKind::Colon) {
            self.next();
            let annotation = self.parse_test()?;
            let mut end = annotation.span;
            let value = if self.at(TokenKind::Eq) {
                self.next();
                let v = self.parse_assign_value()?;
                end = v.span;
                Some(v)
            } else {
                None
            };
            return Ok(Stmt::AnnAssign(AnnAssignStmt {
                span: join(first.span, end),
                target: first,
                annotation,
                value,
            }));
        }

        if let Some(TokenKind::AugAssign(op)) = self.peek_kind() {
            let op = aug_op(op).ok_or_else(|| self.error_here("unknown augmented assignment operator"))?;
            self.next();
            let value = self.parse_assign_value()?;
            return Ok(Stmt::AugAssign(AugAssignStmt {
                span: join(first.span, value.span),
                target: first,
                op,
                value,
            }));
        }

        if self.at(TokenKind::Eq) {
            let mut exprs = vec![first];
            while self.at(TokenKind::Eq) {
                self.next();
                exprs.push(self.parse_assign_value()?);
            }
            let Some(value) = exprs.pop() else {
                return Err(self.error_here("expected assignment value"));
            };
            let span = join(exprs[0].span, value.span);
            return Ok(Stmt::Assign(AssignStmt {
                span,
                targets: exprs,
                value,
            }));
        }

        Ok(Stmt::Expr(first))
    }

    fn parse_assign_value(&mut self) -> Result<Expr, ParseError> {
        if self.at(TokenKind::KwYield) {
            self.parse_yield_expr()
        } else {
            self.parse_testlist_star_expr()
        }
    }

    fn parse_yield_expr(&mut self) -> Result<Expr, ParseError> {
        let kw = self.expect(TokenKind::KwYield)?;
        if self.at(TokenKind::KwFrom) {
            self.next();
            let value = self.parse_test()?;
            return Ok(Expr::new(join(kw.span, value.span), ExprKind::YieldFrom(Box::new(value))));
        }
        if self.starts_expr() {
            let value = self.parse_testlist_star_expr()?;
            return Ok(Expr::new(
                join(kw.span, value.span),
                ExprKind::Yield(Some(Box::new(value))),
            ));
        }
        Ok(Expr::new(kw.span, ExprKind::Yield(None)))
    }

    /// Comma-separated expressions; more than one (or a trailing comma) forms a tuple.
    pub fn parse_testlist_star_expr(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_star_or_test()?;
        if !self.at(TokenKind::Comma) {
            return Ok(first);
        }
        let start = first.span;
        let mut end = first.span;
        let mut elts = vec![first];
        while self.at(TokenKind::Comma) {
            end = self.expect(TokenKind::Comma)?.span;
            if !self.starts_expr() {
                break;
            }
            let e = self.parse_star_or_test()?;
            end = e.span;
            elts.push(e);
        }
        Ok(Expr::new(join(start, end), ExprKind::Tuple(elts)))
    }

    /// Assignment-like target list (`for` targets, comprehension targets).
    fn parse_target_list(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_star_or_bitor()?;
        if !self.at(TokenKind::Comma) {
            return Ok(first);
        }
        let start = first.span;
        let mut end = first.span;
        let mut elts = vec![first];
        while self.at(TokenKind::Comma) {
            end = self.expect(TokenKind::Comma)?.span;
            if !self.starts_expr() {
                break;
            }
            let e = self.parse_star_or_bitor()?;
            end = e.span;
            elts.push(e);
        }
        Ok(Expr::new(join(start, end), ExprKind::Tuple(elts)))
    }

    fn parse_star_or_test(&mut self) -> Result<Expr, ParseError> {
        if self.at(TokenKind::Star) {
            let star = self.expect(TokenKind::Star)?;
            let inner = self.parse_bitor()?;
            return Ok(Expr::new(join(star.span, inner.span), ExprKind::Starred(Box::new(inner))));
        }
        self.parse_test()
    }

    fn parse_star_or_named(&mut self) -> Result<Expr, ParseError> {
        if self.at(TokenKind::Star) {
            return self.parse_star_or_test();
        }
        self.parse_named_expr()
    }

    fn parse_star_or_bitor(&mut self) -> Result<Expr, ParseError> {
        if self.at(TokenKind::Star) {
            let star = self.expect(TokenKind::Star)?;
            let inner = self.parse_bitor()?;
            return Ok(Expr::new(join(star.span, inner.span), ExprKind::Starred(Box::new(inner))));
        }
        self.parse_bitor()
    }

    fn parse_named_expr(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek_kind(), Some(TokenKind::Name(_)))
            && matches!(self.peek_kind_n(1), Some(TokenKind::Walrus))
        {
            let target = self.expect_name()?;
            self.expect(TokenKind::Walrus)?;
            let value = self.parse_test()?;
            return Ok(Expr::new(
                join(target.span, value.span),
                ExprKind::NamedExpr {
                    target,
                    value: Box::new(value),
                },
            ));
        }
        self.parse_test()
    }

    pub fn parse_test(&mut self) -> Result<Expr, ParseError> {
        if self.at(TokenKind::KwLambda) {
            return self.parse_lambda();
        }
        let body = self.parse_or()?;
        if !self.at(TokenKind::KwIf) {
            return Ok(body);
        }
        self.next();
        let test = self.parse_or()?;
        self.expect(TokenKind::KwElse)?;
        let orelse = self.parse_test()?;
        Ok(Expr::new(
            join(body.span, orelse.span),
            ExprKind::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            },
        ))
    }

    fn parse_lambda(&mut self) -> Result<Expr, ParseError> {
        let kw = self.expect(TokenKind::KwLambda)?;
        let params = self.parse_params(false, TokenKind::Colon)?;
        self.expect(TokenKind::Colon)?;
        let body = self.parse_test()?;
        Ok(Expr::new(
            join(kw.span, body.span),
            ExprKind::Lambda {
                params,
                body: Box::new(body),
            },
        ))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        self.parse_bool_chain(TokenKind::KwOr, BoolOp::Or, Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        self.parse_bool_chain(TokenKind::KwAnd, BoolOp::And, Self::parse_not)
    }

    fn parse_bool_chain(
        &mut self,
        kw: TokenKind,
        op: BoolOp,
        operand: fn(&mut Self) -> Result<Expr, ParseError>,
    ) -> Result<Expr, ParseError> {
        let first = operand(self)?;
        if !self.at(kw.clone()) {
            return Ok(first);
        }
        let mut values = vec![first];
        while self.at(kw.clone()) {
            self.next();
            values.push(operand(self)?);
        }
        let span = join(values[0].span, values[values.len() - 1].span);
        Ok(Expr::new(span, ExprKind::BoolOp { op, values }))
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.at(TokenKind::KwNot) {
            let kw = self.expect(TokenKind::KwNot)?;
            let operand = self.nested(Self::parse_not)?;
            return Ok(Expr::new(
                join(kw.span, operand.span),
                ExprKind::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                },
            ));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Lt) => CmpOp::Lt,
                Some(TokenKind::Gt) => CmpOp::Gt,
                Some(TokenKind::Le) => CmpOp::LtE,
                Some(TokenKind::Ge) => CmpOp::GtE,
                Some(TokenKind::EqEq) => CmpOp::Eq,
                Some(TokenKind::Neq) => CmpOp::NotEq,
                Some(TokenKind::KwIn) => CmpOp::In,
                Some(TokenKind::KwNot) if matches!(self.peek_kind_n(1), Some(TokenKind::KwIn)) => {
                    self.next();
                    CmpOp::NotIn
                }
                Some(TokenKind::KwIs) => {
                    if matches!(self.peek_kind_n(1), Some(TokenKind::KwNot)) {
                        self.next();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.next();
            ops.push((op, self.parse_bitor()?));
        }
        if ops.is_empty() {
            return Ok(left);
        }
        let end = ops[ops.len() - 1].1.span;
        Ok(Expr::new(
            join(left.span, end),
            ExprKind::Compare {
                left: Box::new(left),
                ops,
            },
        ))
    }

    /// Binary operator at the cursor and its binding power (higher binds tighter).
    fn binary_op(&self) -> Option<(BinOp, u8)> {
        let op = match self.peek_kind()? {
            TokenKind::Pipe => (BinOp::BitOr, 1),
            TokenKind::Caret => (BinOp::BitXor, 2),
            TokenKind::Amp => (BinOp::BitAnd, 3),
            TokenKind::LShift => (BinOp::LShift, 4),
            TokenKind::RShift => (BinOp::RShift, 4),
            TokenKind::Plus => (BinOp::Add, 5),
            TokenKind::Minus => (BinOp::Sub, 5),
            TokenKind::Star => (BinOp::Mul, 6),
            TokenKind::Slash => (BinOp::Div, 6),
            TokenKind::DoubleSlash => (BinOp::FloorDiv, 6),
            TokenKind::Percent => (BinOp::Mod, 6),
            TokenKind::At => (BinOp::MatMul, 6),
            _ => return None,
        };
        Some(op)
    }

    /// Precedence climbing over the left-associative operators from `|` down to `*`.
    fn parse_binary(&mut self, min_power: u8) -> Result<Expr, ParseError> {
        let mut left = self.parse_factor()?;
        while let Some((op, power)) = self.binary_op().filter(|&(_, p)| p >= min_power) {
            self.next();
            let right = self.parse_binary(power + 1)?;
            left = Expr::new(
                join(left.span, right.span),
                ExprKind::Binary {
                    left: Box::new(left),
                    op,
                    right: Box::new(right),
                },
            );
        }
        Ok(left)
    }

    fn parse_bitor(&mut self) -> Result<Expr, ParseError> {
        self.parse_binary(1)
    }

    /// Every expression level passes through here, so this is where nesting is bounded.
    fn parse_factor(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::parse_unary)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek_kind() {
            Some(TokenKind::Plus) => Some(UnaryOp::Pos),
            Some(TokenKind::Minus) => Some(UnaryOp::Neg),
            Some(TokenKind::Tilde) => Some(UnaryOp::Invert),
            _ => None,
        };
        let Some(op) = op else {
            return self.parse_power();
        };
        let tok = self.expect_any()?;
        let operand = self.parse_factor()?;
        Ok(Expr::new(
            join(tok.span, operand.span),
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
        ))
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = if self.at(TokenKind::KwAwait) {
            let kw = self.expect(TokenKind::KwAwait)?;
            let inner = self.parse_primary()?;
            Expr::new(join(kw.span, inner.span), ExprKind::Await(Box::new(inner)))
        } else {
            self.parse_primary()?
        };
        if !self.at(TokenKind::DoubleStar) {
            return Ok(base);
        }
        self.next();
        let exponent = self.parse_factor()?;
        Ok(Expr::new(
            join(base.span, exponent.span),
            ExprKind::Binary {
                left: Box::new(base),
                op: BinOp::Pow,
                right: Box::new(exponent),
            },
        ))
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_atom()?;
        loop {
            match self.peek_kind() {
                Some(TokenKind::LParen) => {
                    self.next();
                    let args = self.parse_call_args()?;
                    let rparen = self.expect(TokenKind::RParen)?;
                    expr = Expr::new(
                        join(expr.span, rparen.span),
                        ExprKind::Call {
                            func: Box::new(expr),
                            args,
                        },
                    );
                }
                Some(TokenKind::LBracket) => {
                    self.next();
                    let index = self.parse_subscript_list()?;
                    let rbracket = self.expect(TokenKind::RBracket)?;
                    expr = Expr::new(
                        join(expr.span, rbracket.span),
                        ExprKind::Subscript {
                            value: Box::new(expr),
                            index: Box::new(index),
                        },
                    );
                }
                Some(TokenKind::Dot) => {
                    self.next();
                    let attr = self.expect_name()?;
                    expr = Expr::new(
                        join(expr.span, attr.span),
                        ExprKind::Attribute {
                            value: Box::new(expr),
                            attr,
                        },
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<CallArg>, ParseError> {
        let mut args = Vec::new();
        while !self.at(TokenKind::RParen) {
            let arg = match self.peek_kind() {
                Some(TokenKind::Star) => {
                    self.next();
                    CallArg::Starred(self.parse_test()?)
                }
                Some(TokenKind::DoubleStar) => {
                    self.next();
                    CallArg::DoubleStarred(self.parse_test()?)
                }
                Some(TokenKind::Name(_)) if matches!(self.peek_kind_n(1), Some(TokenKind::Eq)) => {
                    let name = self.expect_name()?;
                    self.expect(TokenKind::Eq)?;
                    CallArg::Keyword {
                        name,
                        value: self.parse_test()?,
                    }
                }
                _ => {
                    let value = self.parse_named_expr()?;
                    if self.at_comp_for() {
                        // Bare generator argument: `f(x for x in xs)`.
                        let generators = self.parse_comp_for()?;
                        let span = join(value.span, self.prev_span());
                        CallArg::Positional(Expr::new(
                            span,
                            ExprKind::GeneratorExp {
                                elt: Box::new(value),
                                generators,
                            },
                        ))
                    } else {
                        CallArg::Positional(value)
                    }
                }
            };
            args.push(arg);
            if self.at(TokenKind::Comma) {
                self.next();
                continue;
            }
            break;
        }
        Ok(args)
    }

    fn parse_subscript_list(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_slice_item()?;
        if !self.at(TokenKind::Comma) {
            return Ok(first);
        }
        let start = first.span;
        let mut end = first.span;
        let mut elts = vec![first];
        while self.at(TokenKind::Comma) {
            end = self.expect(TokenKind::Comma)?.span;
            if self.at(TokenKind::RBracket) {
                break;
            }
            let e = self.parse_slice_item()?;
            end = e.span;
            elts.push(e);
        }
        Ok(Expr::new(join(start, end), ExprKind::Tuple(elts)))
    }

    fn parse_slice_item(&mut self) -> Result<Expr, ParseError> {
        let start = self.current_span();
        let lower = if self.at(TokenKind::Colon) {
            None
        } else {
            Some(self.parse_star_or_named()?)
        };
        if !self.at(TokenKind::Colon) {
            return lower.ok_or_else(|| self.error_here("expected subscript"));
        }
        let mut end = self.expect(TokenKind::Colon)?.span;
        let upper = if self.starts_expr() {
            let e = self.parse_test()?;
            end = e.span;
            Some(Box::new(e))
        } else {
            None
        };
        let step = if self.at(TokenKind::Colon) {
            end = self.expect(TokenKind::Colon)?.span;
            if self.starts_expr() {
                let e = self.parse_test()?;
                end = e.span;
                Some(Box::new(e))
            } else {
                None
            }
        } else {
            None
        };
        Ok(Expr::new(
            join(start, end),
            ExprKind::Slice {
                lower: lower.map(Box::new),
                upper,
                step,
            },
        ))
    }

    fn at_comp_for(&self) -> bool {
        self.at(TokenKind::KwFor)
            || (self.at(TokenKind::KwAsync) && matches!(self.peek_kind_n(1), Some(TokenKind::KwFor)))
    }

    fn parse_comp_for(&mut self) -> Result<Vec<Comprehension>, ParseError> {
        let mut generators = Vec::new();
        while self.at_comp_for() {
            let is_async = if self.at(TokenKind::KwAsync) {
                self.next();
                true
            } else {
                false
            };
            self.expect(TokenKind::KwFor)?;
            let target = self.parse_target_list()?;
            self.expect(TokenKind::KwIn)?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.at(TokenKind::KwIf) {
                self.next();
                ifs.push(self.parse_or()?);
            }
            generators.push(Comprehension {
                is_async,
                target,
                iter,
                ifs,
            });
        }
        Ok(generators)
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let Some(tok) = self.tokens.get(self.idx).cloned() else {
            return Err(self.error_here("unexpected end of input"));
        };
        match tok.kind {
            TokenKind::Name(id) => {
                self.next();
                Ok(Expr::name(tok.span, id))
            }
            TokenKind::Number(text) => {
                self.next();
                Ok(Expr::new(tok.span, ExprKind::Number(text)))
            }
            TokenKind::String(_) => {
                let mut pieces = Vec::new();
                let mut span = tok.span;
                while let Some(TokenKind::String(s)) = self.peek_kind() {
                    pieces.push(s.clone());
                    span = join(span, self.current_span());
                    self.next();
                }
                Ok(Expr::new(span, ExprKind::Str(pieces)))
            }
            TokenKind::KwNone => {
                self.next();
                Ok(Expr::constant(tok.span, Constant::None))
            }
            TokenKind::KwTrue => {
                self.next();
                Ok(Expr::constant(tok.span, Constant::True))
            }
            TokenKind::KwFalse => {
                self.next();
                Ok(Expr::constant(tok.span, Constant::False))
            }
            TokenKind::Ellipsis => {
                self.next();
                Ok(Expr::constant(tok.span, Constant::Ellipsis))
            }
            TokenKind::LParen => self.parse_paren_atom(),
            TokenKind::LBracket => self.parse_list_atom(),
            TokenKind::LBrace => self.parse_brace_atom(),
            _ => Err(ParseError {
                message: "expected expression".to_string(),
                span: tok.span,
            }),
        }
    }

    fn parse_paren_atom(&mut self) -> Result<Expr, ParseError> {
        let lparen = self.expect(TokenKind::LParen)?;
        if self.at(TokenKind::RParen) {
            let rparen = self.expect(TokenKind::RParen)?;
            return Ok(Expr::new(join(lparen.span, rparen.span), ExprKind::Tuple(Vec::new())));
        }
        if self.at(TokenKind::KwYield) {
            let inner = self.parse_yield_expr()?;
            let rparen = self.expect(TokenKind::RParen)?;
            return Ok(Expr::new(join(lparen.span, rparen.span), inner.kind));
        }

        let first = self.parse_star_or_named()?;
        if self.at_comp_for() {
            let generators = self.parse_comp_for()?;
            let rparen = self.expect(TokenKind::RParen)?;
            return Ok(Expr::new(
                join(lparen.span, rparen.span),
                ExprKind::GeneratorExp {
                    elt: Box::new(first),
                    generators,
                },
            ));
        }
        if !self.at(TokenKind::Comma) {
            let rparen = self.expect(TokenKind::RParen)?;
            return Ok(Expr::new(join(lparen.span, rparen.span), first.kind));
        }
        let elts = self.parse_elements_after_first(first, TokenKind::RParen)?;
        let rparen = self.expect(TokenKind::RParen)?;
        Ok(Expr::new(join(lparen.span, rparen.span), ExprKind::Tuple(elts)))
    }

    fn parse_list_atom(&mut self) -> Result<Expr, ParseError> {
        let lbracket = self.expect(TokenKind::LBracket)?;
        if self.at(TokenKind::RBracket) {
            let rbracket = self.expect(TokenKind::RBracket)?;
            return Ok(Expr::new(join(lbracket.span, rbracket.span), ExprKind::List(Vec::new())));
        }
        let first = self.parse_star_or_named()?;
        if self.at_comp_for() {
            let generators = self.parse_comp_for()?;
            let rbracket = self.expect(TokenKind::RBracket)?;
            return Ok(Expr::new(
                join(lbracket.span, rbracket.span),
                ExprKind::ListComp {
                    elt: Box::new(first),
                    generators,
                },
            ));
        }
        let elts = self.parse_elements_after_first(first, TokenKind::RBracket)?;
        let rbracket = self.expect(TokenKind::RBracket)?;
        Ok(Expr::new(join(lbracket.span, rbracket.span), ExprKind::List(elts)))
    }

    fn parse_brace_atom(&mut self) -> Result<Expr, ParseError> {
        let lbrace = self.expect(TokenKind::LBrace)?;
        if self.at(TokenKind::RBrace) {
            let rbrace = self.expect(TokenKind::RBrace)?;
            return Ok(Expr::new(join(lbrace.span, rbrace.span), ExprKind::Dict(Vec::new())));
        }

        let first_item = if self.at(TokenKind::DoubleStar) {
            self.next();
            DictItem {
                key: None,
                value: self.parse_bitor()?,
            }
        } else {
            let first = self.parse_star_or_named()?;
            if !self.at(TokenKind::Colon) {
                // Set display or set comprehension.
                if self.at_comp_for() {
                    let generators = self.parse_comp_for()?;
                    let rbrace = self.expect(TokenKind::RBrace)?;
                    return Ok(Expr::new(
                        join(lbrace.span, rbrace.span),
                        ExprKind::SetComp {
                            elt: Box::new(first),
                            generators,
                        },
                    ));
                }
                let elts = self.parse_elements_after_first(first, TokenKind::RBrace)?;
                let rbrace = self.expect(TokenKind::RBrace)?;
                return Ok(Expr::new(join(lbrace.span, rbrace.span), ExprKind::Set(elts)));
            }
            self.next();
            let value = self.parse_test()?;
            if self.at_comp_for() {
                let generators = self.parse_comp_for()?;
                let rbrace = self.expect(TokenKind::RBrace)?;
                return Ok(Expr::new(
                    join(lbrace.span, rbrace.span),
                    ExprKind::DictComp {
                        key: Box::new(first),
                        value: Box::new(value),
                        generators,
                    },
                ));
            }
            DictItem {
                key: Some(first),
                value,
            }
        };

        let mut items = vec![first_item];
        while self.at(TokenKind::Comma) {
            self.next();
            if self.at(TokenKind::RBrace) {
                break;
            }
            if self.at(TokenKind::DoubleStar) {
                self.next();
                items.push(DictItem {
                    key: None,
                    value: self.parse_bitor()?,
                });
                continue;
            }
            let key = self.parse_test()?;
            self.expect(TokenKind::Colon)?;
            let value = self.parse_test()?;
            items.push(DictItem {
                key: Some(key),
                value,
            });
        }
        let rbrace = self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(join(lbrace.span, rbrace.span), ExprKind::Dict(items)))
    }

    fn parse_elements_after_first(&mut self, first: Expr, close: TokenKind) -> Result<Vec<Expr>, ParseError> {
        let mut elts = vec![first];
        while self.at(TokenKind::Comma) {
            self.next();
            if self.at(close.clone()) {
                break;
            }
            elts.push(self.parse_star_or_named()?);
        }
        Ok(elts)
    }

    fn starts_expr(&self) -> bool {
        matches!(
            self.peek_kind(),
            Some(
                TokenKind::Name(_)
                    | TokenKind::Number(_)
                    | TokenKind::String(_)
                    | TokenKind::KwNone
                    | TokenKind::KwTrue
                    | TokenKind::KwFalse
                    | TokenKind::Ellipsis
                    | TokenKind::LParen
                    | TokenKind::LBracket
                    | TokenKind::LBrace
                    | TokenKind::Minus
                    | TokenKind::Plus
                    | TokenKind::Tilde
                    | TokenKind::KwNot
                    | TokenKind::KwLambda
                    | TokenKind::KwAwait
                    | TokenKind::Star
            )
        )
    }

    fn at_stmt_end(&self) -> bool {
        self.at(TokenKind::Newline) || self.at(TokenKind::Semi) || self.at(TokenKind::Eof)
    }

    fn skip_newlines(&mut self) {
        while self.at(TokenKind::Newline) {
            self.next();
        }
    }

    fn expect_newline_or_eof(&mut self) -> Result<(), ParseError> {
        if self.at(TokenKind::Newline) {
            self.next();
            Ok(())
        } else if self.at(TokenKind::Eof) {
            Ok(())
        } else {
            Err(self.error_here("expected end of line"))
        }
    }

    fn expect_name(&mut self) -> Result<Ident, ParseError> {
        let tok = self.expect_any()?;
        match tok.kind {
            TokenKind::Name(name) => Ok(Ident {
                span: tok.span,
                node: name,
            }),
            _ => Err(ParseError {
                message: "expected identifier".to_string(),
                span: tok.span,
            }),
        }
    }

    fn expect(&mut self, expected: TokenKind) -> Result<Token, ParseError> {
        let tok = self.expect_any()?;
        if mem::discriminant(&tok.kind) == mem::discriminant(&expected) {
            Ok(tok)
        } else {
            Err(ParseError {
                message: format!("expected {expected:?}, found {:?}", tok.kind),
                span: tok.span,
            })
        }
    }

    fn expect_any(&mut self) -> Result<Token, ParseError> {
        self.next().ok_or_else(|| ParseError {
            message: "unexpected end of input".to_string(),
            span: span_between(0, 0),
        })
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind()
            .is_some_and(|k| mem::discriminant(k) == mem::discriminant(&kind))
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.idx)?.clone();
        self.idx += 1;
        Some(tok)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.tokens.get(self.idx).map(|t| &t.kind)
    }

    fn peek_kind_n(&self, n: usize) -> Option<&TokenKind> {
        self.tokens.get(self.idx + n).map(|t| &t.kind)
    }

    fn current_span(&self) -> Span {
        self.tokens
            .get(self.idx)
            .or_else(|| self.tokens.last())
            .map_or_else(|| span_between(0, 0), |t| t.span)
    }

    fn prev_span(&self) -> Span {
        self.idx
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or_else(|| span_between(0, 0), |t| t.span)
    }

    fn error_here(&self, message: &str) -> ParseError {
        ParseError {
            message: message.to_string(),
            span: self.current_span(),
        }
    }

    fn nested<T>(&mut self, f: fn(&mut Self) -> Result<T, ParseError>) -> Result<T, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(self.error_here("too many nested blocks or expressions"));
        }
        self.depth += 1;
        let out = f(self);
        self.depth -= 1;
        out
    }
}

fn aug_op(text: &str) -> Option<BinOp> {
    Some(match text {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "@" => BinOp::MatMul,
        "/" => BinOp::Div,
        "//" => BinOp::FloorDiv,
        "%" => BinOp::Mod,
        "**" => BinOp::Pow,
        "<<" => BinOp::LShift,
        ">>" => BinOp::RShift,
        "|" => BinOp::BitOr,
        "^" => BinOp::BitXor,
        "&" => BinOp::BitAnd,
        _ => return None,
    })
}

fn body_end(fallback: Span, body: &[Stmt]) -> Span {
    body.last().map_or(fallback, Stmt::span)
}

fn join(a: Span, b: Span) -> Span {
    let start = a.offset().min(b.offset());
    let end = (a.offset() + a.len()).max(b.offset() + b.len());
    span_between(start, end)
}
