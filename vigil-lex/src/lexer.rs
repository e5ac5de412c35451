#![forbid(unsafe_code)]
#![allow(unused_assignments)]

use logos::Logos;
use miette::Diagnostic;
use thiserror::Error;
use vigil_ast::{Span, span_between};

use crate::token::{Token, TokenKind};

#[derive(Debug, Error, Diagnostic)]
#[error("lex error: {message}")]
#[diagnostic(code(vigil::lex))]
#[allow(unused_assignments)]
pub struct LexError {
    pub message: String,
    #[label]
    pub span: Span,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\f\r]+")]
#[logos(skip r"#[^\n]*")]
#[logos(skip r"\\\r?\n")]
enum RawToken {
    #[token("False")]
    KwFalse,
    #[token("None")]
    KwNone,
    #[token("True")]
    KwTrue,
    #[token("and")]
    KwAnd,
    #[token("as")]
    KwAs,
    #[token("assert")]
    KwAssert,
    #[token("async")]
    KwAsync,
    #[token("await")]
    KwAwait,
    #[token("break")]
    KwBreak,
    #[token("class")]
    KwClass,
    #[token("continue")]
    KwContinue,
    #[token("def")]
    KwDef,
    #[token("del")]
    KwDel,
    #[token("elif")]
    KwElif,
    #[token("else")]
    KwElse,
    #[token("except")]
    KwExcept,
    #[token("finally")]
    KwFinally,
    #[token("for")]
    KwFor,
    #[token("from")]
    KwFrom,
    #[token("global")]
    KwGlobal,
    #[token("if")]
    KwIf,
    #[token("import")]
    KwImport,
    #[token("in")]
    KwIn,
    #[token("is")]
    KwIs,
    #[token("lambda")]
    KwLambda,
    #[token("nonlocal")]
    KwNonlocal,
    #[token("not")]
    KwNot,
    #[token("or")]
    KwOr,
    #[token("pass")]
    KwPass,
    #[token("raise")]
    KwRaise,
    #[token("return")]
    KwReturn,
    #[token("try")]
    KwTry,
    #[token("while")]
    KwWhile,
    #[token("with")]
    KwWith,
    #[token("yield")]
    KwYield,

    #[token("+=", aug_op)]
    #[token("-=", aug_op)]
    #[token("*=", aug_op)]
    #[token("/=", aug_op)]
    #[token("//=", aug_op)]
    #[token("%=", aug_op)]
    #[token("@=", aug_op)]
    #[token("&=", aug_op)]
    #[token("|=", aug_op)]
    #[token("^=", aug_op)]
    #[token(">>=", aug_op)]
    #[token("<<=", aug_op)]
    #[token("**=", aug_op)]
    AugAssign(String),

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    DoubleStar,
    #[token("/")]
    Slash,
    #[token("//")]
    DoubleSlash,
    #[token("%")]
    Percent,
    #[token("@")]
    At,
    #[token("<<")]
    LShift,
    #[token(">>")]
    RShift,
    #[token("&")]
    Amp,
    #[token("|")]
    Pipe,
    #[token("^")]
    Caret,
    #[token("~")]
    Tilde,
    #[token(":=")]
    Walrus,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("==")]
    EqEq,
    #[token("!=")]
    Neq,
    #[token("->")]
    Arrow,
    #[token("...")]
    Ellipsis,
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,
    #[token(";")]
    Semi,
    #[token("=")]
    Eq,

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,

    #[regex(r"\r?\n")]
    Newline,

    #[regex(r"[0-9][0-9_]*", raw)]
    #[regex(r"0[xX][0-9a-fA-F_]+", raw)]
    #[regex(r"0[oO][0-7_]+", raw)]
    #[regex(r"0[bB][01_]+", raw)]
    #[regex(r"[0-9][0-9_]*\.[0-9_]*([eE][+-]?[0-9][0-9_]*)?[jJ]?", raw)]
    #[regex(r"\.[0-9][0-9_]*([eE][+-]?[0-9][0-9_]*)?[jJ]?", raw)]
    #[regex(r"[0-9][0-9_]*[eE][+-]?[0-9][0-9_]*[jJ]?", raw)]
    #[regex(r"[0-9][0-9_]*[jJ]", raw)]
    Number(String),

    // Literals keep their prefix and quotes; escapes are not interpreted.
    #[regex(r#"([rRuUbBfF]|[bB][rR]|[rR][bB]|[fF][rR]|[rR][fF])?["']"#, string_literal)]
    String(String),

    #[regex(r"[_\p{XID_Start}]\p{XID_Continue}*", raw)]
    Name(String),

    #[token("\u{feff}")]
    Bom,
}

fn raw(lex: &mut logos::Lexer<RawToken>) -> String {
    lex.slice().to_string()
}

/// Scans to the closing quote after the prefix and opening quote have matched.
/// Long docstrings stay a flat loop here instead of a chain of automaton states.
fn string_literal(lex: &mut logos::Lexer<RawToken>) -> Option<String> {
    let quote = *lex.slice().as_bytes().last()?;
    let rest = lex.remainder().as_bytes();
    let triple = rest.starts_with(&[quote, quote]);
    let mut i = if triple { 2 } else { 0 };
    while i < rest.len() {
        match rest[i] {
            b'\\' if rest[i + 1..].starts_with(b"\r\n") => i += 3,
            b'\\' => i += 2,
            b'\n' if !triple => return None,
            b if b == quote && !triple => {
                lex.bump(i + 1);
                return Some(lex.slice().to_string());
            }
            b if b == quote && rest[i..].starts_with(&[quote, quote, quote]) => {
                lex.bump(i + 3);
                return Some(lex.slice().to_string());
            }
            _ => i += 1,
        }
    }
    None
}

fn aug_op(lex: &mut logos::Lexer<RawToken>) -> String {
    let s = lex.slice();
    s[..s.len() - 1].to_string()
}

/// Column of `offset` within its physical line, with tabs advancing to the next multiple of 8.
fn indent_width(src: &str, offset: usize) -> usize {
    let line_start = src[..offset].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let mut col = 0usize;
    for ch in src[line_start..offset].chars() {
        match ch {
            '\t' => col = (col / 8 + 1) * 8,
            '\x0c' => col = 0,
            '\u{feff}' => {}
            _ => col += 1,
        }
    }
    col
}

pub struct Lexer<'a> {
    src: &'a str,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src }
    }

    /// Tokenize into a logical-line stream with `Indent`/`Dedent` markers.
    ///
    /// Newlines inside brackets are implicit line joins and are dropped. Blank and
    /// comment-only lines never produce tokens.
    pub fn lex(&self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        let mut indent_stack: Vec<usize> = vec![0];
        let mut depth = 0usize;
        let mut at_line_start = true;

        let mut lex = RawToken::lexer(self.src);
        while let Some(raw) = lex.next() {
            let range = lex.span();
            let span = span_between(range.start, range.end);

            let raw = match raw {
                Ok(r) => r,
                Err(_) => {
                    let slice = lex.slice();
                    let message = if slice.ends_with(['"', '\'']) {
                        "unterminated string literal"
                    } else {
                        "unexpected character"
                    };
                    return Err(LexError {
                        message: message.to_string(),
                        span,
                    });
                }
            };

            // A byte order mark is only allowed as the first character of the file.
            if raw == RawToken::Bom {
                if range.start == 0 {
                    continue;
                }
                return Err(LexError {
                    message: "invalid non-printable character U+FEFF".to_string(),
                    span,
                });
            }

            if raw == RawToken::Newline {
                if depth == 0 && !at_line_start {
                    tokens.push(Token {
                        kind: TokenKind::Newline,
                        span,
                    });
                    at_line_start = true;
                }
                continue;
            }

            if at_line_start {
                let width = indent_width(self.src, range.start);
                let line_span = span_between(range.start - width.min(range.start), range.start);
                let current = *indent_stack.last().unwrap_or(&0);
                if width > current {
                    indent_stack.push(width);
                    tokens.push(Token {
                        kind: TokenKind::Indent,
                        span: line_span,
                    });
                } else if width < current {
                    while let Some(&top) = indent_stack.last() {
                        if top <= width {
                            break;
                        }
                        indent_stack.pop();
                        tokens.push(Token {
                            kind: TokenKind::Dedent,
                            span: line_span,
                        });
                    }
                    if *indent_stack.last().unwrap_or(&usize::MAX) != width {
                        return Err(LexError {
                            message: "unindent does not match any outer indentation level".to_string(),
                            span: line_span,
                        });
                    }
                }
                at_line_start = false;
            }

            let kind = match raw {
                RawToken::KwFalse => TokenKind::KwFalse,
                RawToken::KwNone => TokenKind::KwNone,
                RawToken::KwTrue => TokenKind::KwTrue,
                RawToken::KwAnd => TokenKind::KwAnd,
                RawToken::KwAs => TokenKind::KwAs,
                RawToken::KwAssert => TokenKind::KwAssert,
                RawToken::KwAsync => TokenKind::KwAsync,
                RawToken::KwAwait => TokenKind::KwAwait,
                RawToken::KwBreak => TokenKind::KwBreak,
                RawToken::KwClass => TokenKind::KwClass,
                RawToken::KwContinue => TokenKind::KwContinue,
                RawToken::KwDef => TokenKind::KwDef,
                RawToken::KwDel => TokenKind::KwDel,
                RawToken::KwElif => TokenKind::KwElif,
                RawToken::KwElse => TokenKind::KwElse,
                RawToken::KwExcept => TokenKind::KwExcept,
                RawToken::KwFinally => TokenKind::KwFinally,
                RawToken::KwFor => TokenKind::KwFor,
                RawToken::KwFrom => TokenKind::KwFrom,
                RawToken::KwGlobal => TokenKind::KwGlobal,
                RawToken::KwIf => TokenKind::KwIf,
                RawToken::KwImport => TokenKind::KwImport,
                RawToken::KwIn => TokenKind::KwIn,
                RawToken::KwIs => TokenKind::KwIs,
                RawToken::KwLambda => TokenKind::KwLambda,
                RawToken::KwNonlocal => TokenKind::KwNonlocal,
                RawToken::KwNot => TokenKind::KwNot,
                RawToken::KwOr => TokenKind::KwOr,
                RawToken::KwPass => TokenKind::KwPass,
                RawToken::KwRaise => TokenKind::KwRaise,
                RawToken::KwReturn => TokenKind::KwReturn,
                RawToken::KwTry => TokenKind::KwTry,
                RawToken::KwWhile => TokenKind::KwWhile,
                RawToken::KwWith => TokenKind::KwWith,
                RawToken::KwYield => TokenKind::KwYield,

                RawToken::AugAssign(op) => TokenKind::AugAssign(op),

                RawToken::Plus => TokenKind::Plus,
                RawToken::Minus => TokenKind::Minus,
                RawToken::Star => TokenKind::Star,
                RawToken::DoubleStar => TokenKind::DoubleStar,
                RawToken::Slash => TokenKind::Slash,
                RawToken::DoubleSlash => TokenKind::DoubleSlash,
                RawToken::Percent => TokenKind::Percent,
                RawToken::At => TokenKind::At,
                RawToken::LShift => TokenKind::LShift,
                RawToken::RShift => TokenKind::RShift,
                RawToken::Amp => TokenKind::Amp,
                RawToken::Pipe => TokenKind::Pipe,
                RawToken::Caret => TokenKind::Caret,
                RawToken::Tilde => TokenKind::Tilde,
                RawToken::Walrus => TokenKind::Walrus,
                RawToken::Lt => TokenKind::Lt,
                RawToken::Gt => TokenKind::Gt,
                RawToken::Le => TokenKind::Le,
                RawToken::Ge => TokenKind::Ge,
                RawToken::EqEq => TokenKind::EqEq,
                RawToken::Neq => TokenKind::Neq,
                RawToken::Arrow => TokenKind::Arrow,
                RawToken::Ellipsis => TokenKind::Ellipsis,
                RawToken::Dot => TokenKind::Dot,
                RawToken::Comma => TokenKind::Comma,
                RawToken::Colon => TokenKind::Colon,
                RawToken::Semi => TokenKind::Semi,
                RawToken::Eq => TokenKind::Eq,

                RawToken::LParen => {
                    depth += 1;
                    TokenKind::LParen
                }
                RawToken::LBracket => {
                    depth += 1;
                    TokenKind::LBracket
                }
                RawToken::LBrace => {
                    depth += 1;
                    TokenKind::LBrace
                }
                RawToken::RParen => {
                    depth = depth.saturating_sub(1);
                    TokenKind::RParen
                }
                RawToken::RBracket => {
                    depth = depth.saturating_sub(1);
                    TokenKind::RBracket
                }
                RawToken::RBrace => {
                    depth = depth.saturating_sub(1);
                    TokenKind::RBrace
                }

                RawToken::Number(s) => TokenKind::Number(s),
                RawToken::String(s) => TokenKind::String(s),
                RawToken::Name(s) => TokenKind::Name(s),

                RawToken::Newline | RawToken::Bom => unreachable!("handled above"),
            };

            tokens.push(Token { kind, span });
        }

        let end = self.src.len();
        if !at_line_start {
            tokens.push(Token {
                kind: TokenKind::Newline,
                span: span_between(end, end),
            });
        }

        // Close open indents.
        while indent_stack.len() > 1 {
            indent_stack.pop();
            tokens.push(Token {
                kind: TokenKind::Dedent,
                span: span_between(end, end),
            });
        }

        tokens.push(Token {
            kind: TokenKind::Eof,
            span: span_between(end, end),
        });

        Ok(tokens)
    }
}
