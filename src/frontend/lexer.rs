use std::{
    fmt::Display,
    num::{ParseFloatError, ParseIntError},
};

use serde::Serialize;

use crate::error::{IntoSpanned, SpannedError};

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct Span {
    pub offset: u32,
    pub line: u32,
}

impl Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}", self.line)
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

#[derive(Debug, PartialEq, Clone)]
pub enum TokenKind {
    Ident(String),
    Keyword(String),
    Punct(&'static str),
    NullLit,
    BoolLit(bool),
    IntLit(i64),
    FloatLit(f64),
    StringLit(String),
    CharLit(char),
}

impl TokenKind {
    pub fn at(self, span: Span) -> Token {
        Token { kind: self, span }
    }
}

impl Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ident(name) => write!(f, "{name}"),
            Self::Keyword(name) => write!(f, "{name}"),
            Self::Punct(punct) => write!(f, "{punct}"),
            Self::NullLit => write!(f, "null"),
            Self::BoolLit(true) => write!(f, "true"),
            Self::BoolLit(false) => write!(f, "false"),
            Self::IntLit(value) => write!(f, "{value}"),
            Self::FloatLit(value) => write!(f, "{value}"),
            Self::StringLit(value) => write!(f, "\"{value}\""),
            Self::CharLit(value) => write!(f, "'{value}'"),
        }
    }
}

fn is_term(c: &char) -> bool {
    matches!(c, '_' | 'a'..='z' | 'A'..='Z' | '0'..='9')
}

fn is_keyword(s: &str) -> bool {
    matches!(
        s,
        "var"
            | "if"
            | "else"
            | "while"
            | "for"
            | "in"
            | "return"
            | "break"
            | "continue"
            | "throw"
            | "try"
            | "catch"
            | "finally"
            | "switch"
            | "module"
            | "pub"
            | "pro"
            | "pri"
            | "class"
            | "struct"
            | "static"
            | "using"
            | "out"
            | "this"
    )
}

const PUNCT3: [&str; 1] = ["..."];

const PUNCT2: [&str; 15] = [
    "&&", "||", "!=", "==", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "<<", ">>", "=>", "**",
];

const PUNCT1: [&str; 25] = [
    "+", "-", "*", "/", "%", "{", "}", "[", "]", "(", ")", ":", ";", ".", ",", "&", "|", "^",
    "~", "!", "=", "<", ">", "?", "@",
];

#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("failed to parse float: {0}")]
    ParseFloat(#[from] ParseFloatError),
    #[error("failed to parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("invalid escape sequence at: {0}")]
    InvalidEscapeSequence(char),
    #[error("invalid character literal")]
    InvalidCharLiteral,
    #[error("unexpected EOF")]
    UnexpectedEof,
    #[error("invalid input at: {0}")]
    InvalidInput(char),
}

pub type TokenError = SpannedError<ErrorKind>;

pub struct Lexer<'a> {
    offset: usize,
    line: u32,
    source: &'a [char],
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a [char]) -> Self {
        Self {
            offset: 0,
            line: 1,
            source,
        }
    }

    fn cur(&self) -> Option<char> {
        self.source.get(self.offset).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.offset + 1).copied()
    }

    fn advance(&mut self) {
        if self.cur() == Some('\n') {
            self.line += 1;
        }

        self.offset += 1;
    }

    fn next(&mut self) -> Option<char> {
        let c = self.cur();
        self.advance();
        c
    }

    fn span(&self) -> Span {
        Span {
            offset: self.offset as u32,
            line: self.line,
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.source.get(self.offset + i) == Some(&c))
    }

    fn term(&mut self) -> Token {
        let span = self.span();
        let mut term = String::new();

        while let Some(c) = self.cur() {
            if !is_term(&c) {
                break;
            }

            self.advance();
            term.push(c);
        }

        match term.as_str() {
            "null" => TokenKind::NullLit,
            "true" => TokenKind::BoolLit(true),
            "false" => TokenKind::BoolLit(false),
            name if is_keyword(name) => TokenKind::Keyword(term),
            _ => TokenKind::Ident(term),
        }
        .at(span)
    }

    fn number(&mut self) -> Result<Token, TokenError> {
        let mut dot = false;
        let span = self.span();
        let mut num = String::new();

        while let Some(c) = self.cur() {
            match c {
                '_' => {}
                '.' if !dot && matches!(self.peek(), Some(c) if c.is_ascii_digit()) => {
                    dot = true;
                    num.push('.');
                }
                c if c.is_ascii_digit() => num.push(c),
                _ => break,
            }

            self.advance();
        }

        if dot {
            let f = num.parse().map_err(|e| ErrorKind::ParseFloat(e).at(span))?;
            Ok(TokenKind::FloatLit(f).at(span))
        } else {
            let i = num.parse().map_err(|e| ErrorKind::ParseInt(e).at(span))?;
            Ok(TokenKind::IntLit(i).at(span))
        }
    }

    fn escape(&mut self) -> Result<char, TokenError> {
        match self.next() {
            Some('n') => Ok('\n'),
            Some('r') => Ok('\r'),
            Some('t') => Ok('\t'),
            Some('0') => Ok('\0'),
            Some('\\') => Ok('\\'),
            Some('"') => Ok('"'),
            Some('\'') => Ok('\''),
            Some(c) => Err(ErrorKind::InvalidEscapeSequence(c).at(self.span())),
            None => Err(ErrorKind::UnexpectedEof.at(self.span())),
        }
    }

    fn string(&mut self, span: Span) -> Result<Token, TokenError> {
        let mut s = String::new();

        loop {
            match self.next() {
                Some('"') => break,
                Some('\\') => s.push(self.escape()?),
                Some(c) => s.push(c),
                None => return Err(ErrorKind::UnexpectedEof.at(self.span())),
            }
        }

        Ok(TokenKind::StringLit(s).at(span))
    }

    fn char(&mut self, span: Span) -> Result<Token, TokenError> {
        let c = match self.next() {
            Some('\\') => self.escape()?,
            Some('\'') => return Err(ErrorKind::InvalidCharLiteral.at(span)),
            Some(c) => c,
            None => return Err(ErrorKind::UnexpectedEof.at(self.span())),
        };

        if self.next() != Some('\'') {
            return Err(ErrorKind::InvalidCharLiteral.at(span));
        }

        Ok(TokenKind::CharLit(c).at(span))
    }

    fn skip_comment(&mut self) -> Result<bool, TokenError> {
        if self.starts_with("//") {
            while let Some(c) = self.cur() {
                if c == '\n' {
                    break;
                }
                self.advance();
            }
            return Ok(true);
        }

        if self.starts_with("/*") {
            let span = self.span();
            self.advance();
            self.advance();

            while !self.starts_with("*/") {
                if self.next().is_none() {
                    return Err(ErrorKind::UnexpectedEof.at(span));
                }
            }

            self.advance();
            self.advance();
            return Ok(true);
        }

        Ok(false)
    }

    fn punct(&mut self) -> Option<&'static str> {
        let punct = PUNCT3
            .iter()
            .chain(PUNCT2.iter())
            .chain(PUNCT1.iter())
            .find(|p| self.starts_with(p))
            .copied()?;

        for _ in 0..punct.len() {
            self.advance();
        }

        Some(punct)
    }

    pub fn lex(&mut self) -> Result<Vec<Token>, TokenError> {
        let mut tokens = vec![];

        while let Some(cur) = self.cur() {
            let span = self.span();

            if cur.is_whitespace() {
                self.advance();
            } else if self.skip_comment()? {
                continue;
            } else if matches!(cur, '_' | 'a'..='z' | 'A'..='Z') {
                tokens.push(self.term());
            } else if cur.is_ascii_digit() {
                tokens.push(self.number()?);
            } else if cur == '"' {
                self.advance();
                tokens.push(self.string(span)?);
            } else if cur == '\'' {
                self.advance();
                tokens.push(self.char(span)?);
            } else if let Some(punct) = self.punct() {
                tokens.push(TokenKind::Punct(punct).at(span));
            } else {
                return Err(ErrorKind::InvalidInput(cur).at(span));
            }
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(source: &str) -> Vec<TokenKind> {
        let chars = source.chars().collect::<Vec<_>>();
        Lexer::new(&chars)
            .lex()
            .expect("lex failed")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_var_decl() {
        assert_eq!(
            lex("var a = 42;"),
            vec![
                TokenKind::Keyword("var".into()),
                TokenKind::Ident("a".into()),
                TokenKind::Punct("="),
                TokenKind::IntLit(42),
                TokenKind::Punct(";"),
            ]
        );
    }

    #[test]
    fn test_longest_punct_wins() {
        assert_eq!(
            lex("a <= b << c => ... **"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Punct("<="),
                TokenKind::Ident("b".into()),
                TokenKind::Punct("<<"),
                TokenKind::Ident("c".into()),
                TokenKind::Punct("=>"),
                TokenKind::Punct("..."),
                TokenKind::Punct("**"),
            ]
        );
    }

    #[test]
    fn test_literals_and_comments() {
        assert_eq!(
            lex("// comment\n3.14 'a' \"x\\n\" /* block */ null true"),
            vec![
                TokenKind::FloatLit(3.14),
                TokenKind::CharLit('a'),
                TokenKind::StringLit("x\n".into()),
                TokenKind::NullLit,
                TokenKind::BoolLit(true),
            ]
        );
    }

    #[test]
    fn test_line_tracking() {
        let chars = "a\n\nb".chars().collect::<Vec<_>>();
        let tokens = Lexer::new(&chars).lex().unwrap();

        assert_eq!(tokens[0].span.line, 1);
        assert_eq!(tokens[1].span.line, 3);
    }

    #[test]
    fn test_invalid_input() {
        let chars = "var #".chars().collect::<Vec<_>>();
        let err = Lexer::new(&chars).lex().unwrap_err();

        assert!(matches!(err.kind, ErrorKind::InvalidInput('#')));
    }
}
