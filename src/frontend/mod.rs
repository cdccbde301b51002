pub mod ast;
mod lexer;
mod parser;

pub use lexer::{Lexer, Span, Token, TokenError, TokenKind};
pub use parser::{ParseError, Parser};

use crate::error::Error;

pub fn parse(source: &str) -> Result<Vec<ast::Stmt>, Error> {
    let chars = source.chars().collect::<Vec<_>>();
    let mut lexer = Lexer::new(&chars);
    let tokens = lexer.lex()?;
    let parser = Parser::new(tokens);

    Ok(parser.parse()?)
}
