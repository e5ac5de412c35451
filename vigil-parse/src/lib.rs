#![forbid(unsafe_code)]

mod error;
mod fmt;
mod parser;

use vigil_ast::{Expr, Module};
use vigil_lex::Lexer;

pub use error::ParseError;
pub use fmt::{render_expr, render_module, render_stmt};
pub use parser::{MAX_NESTING, Parser};

pub fn parse_module(src: &str) -> Result<Module, ParseError> {
    let tokens = Lexer::new(src).lex()?;
    let mut parser = Parser::new(&tokens);
    parser.parse_module()
}

pub fn parse_expr(src: &str) -> Result<Expr, ParseError> {
    let tokens = Lexer::new(src).lex()?;
    let mut parser = Parser::new(&tokens);
    parser.parse_expr_eof()
}
