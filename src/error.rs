use std::fmt::{Debug, Display};

use crate::{
    backend::{CompileErrors, ZroError},
    frontend::{ParseError, Span, TokenError},
    runtime::RuntimeError,
};

pub trait IntoSpanned {
    fn at(self, span: Span) -> SpannedError<Self>
    where
        Self: Sized + Display;
}

impl<T: Display> IntoSpanned for T {
    fn at(self, span: Span) -> SpannedError<Self>
    where
        Self: Sized + Display,
    {
        SpannedError { kind: self, span }
    }
}

#[derive(Debug, Clone)]
pub struct SpannedError<T: Display> {
    pub kind: T,
    pub span: Span,
}

impl<T: Display> Display for SpannedError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.kind.fmt(f)
    }
}

impl<T: Display + Debug> std::error::Error for SpannedError<T> {}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
    #[error("TokenError: {0}")]
    Lex(#[from] TokenError),
    #[error("ParseError: {0}")]
    Parse(#[from] ParseError),
    #[error("CompileError: {0}")]
    Compile(#[from] CompileErrors),
    #[error("BinaryError: {0}")]
    Zro(#[from] ZroError),
    #[error("SerializeError: {0}")]
    Serialize(#[from] ron::Error),
    #[error("RuntimeError: {0}")]
    Runtime(#[from] RuntimeError),
}

impl Error {
    pub fn span(&self) -> Span {
        match self {
            Error::IO(_) | Error::Zro(_) | Error::Serialize(_) => Span::default(),
            Error::Lex(e) => e.span,
            Error::Parse(e) => e.span,
            Error::Compile(e) => e.span(),
            Error::Runtime(e) => Span {
                offset: 0,
                line: e.line.unwrap_or_default(),
            },
        }
    }
}
