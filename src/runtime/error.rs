use std::fmt::{Debug, Display};

use crate::backend::Op;

use super::{gc::Handle, value::Value, value::ValueType};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid stack operand: {0}")]
    InvalidOperand(i64),
    #[error("invalid constant index: {0}")]
    InvalidConstant(usize),
    #[error("invalid child function index: {0}")]
    InvalidChild(usize),
    #[error("invalid closure value index: {0}")]
    InvalidClosureIndex(usize),
    #[error("invalid instruction: {0:?}")]
    InvalidInstruction(Op),
    #[error("type mismatch in {op:?}: {left} and {right}")]
    TypeMismatch {
        op: Op,
        left: ValueType,
        right: ValueType,
    },
    #[error("stale object reference: {0}")]
    StaleHandle(Handle),
    #[error("corrupted call frame: {0}")]
    FrameCorrupted(&'static str),
    #[error("out of memory")]
    MemoryError,
    #[error("stack overflow")]
    StackOverflow,
    #[error("uncaught exception")]
    Thrown(Value),
    #[error("cannot call non-function: {0}")]
    NotCallable(ValueType),
    #[error("unsupported operation: {left} {op} {right}")]
    UnsupportedOp {
        left: ValueType,
        right: ValueType,
        op: &'static str,
    },
    #[error("unsupported operation: {op}{ty}")]
    UnsupportedUnaryOp { ty: ValueType, op: &'static str },
    #[error("division by zero")]
    DivisionByZero,
    #[error("index out of bounds: {0}")]
    IndexOutOfBounds(i128),
    #[error("no such member '{key}' in {ty}")]
    InvalidKey { ty: ValueType, key: String },
    #[error("cannot convert {from} to {to}")]
    ConversionFailed { from: ValueType, to: &'static str },
    #[error("interrupted")]
    Interrupted,
    #[error("panic: {0}")]
    Panic(String),
}

impl ErrorKind {
    pub fn at(self, line: u32) -> RuntimeError {
        RuntimeError {
            kind: self,
            line: Some(line),
            trace: None,
        }
    }

    /// Invariant violations: the engine never hands these to script handlers.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::InvalidOperand(_)
                | ErrorKind::InvalidConstant(_)
                | ErrorKind::InvalidChild(_)
                | ErrorKind::InvalidClosureIndex(_)
                | ErrorKind::InvalidInstruction(_)
                | ErrorKind::TypeMismatch { .. }
                | ErrorKind::StaleHandle(_)
                | ErrorKind::FrameCorrupted(_)
                | ErrorKind::Panic(_)
        )
    }
}

#[derive(Default, Clone)]
pub struct Call {
    pub line: Option<u32>,
    pub name: String,
}

impl Call {
    pub fn new(line: Option<u32>, name: impl Into<String>) -> Self {
        Self {
            line,
            name: name.into(),
        }
    }
}

impl Display for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}(..) at line {line}", self.name),
            None => write!(f, "{}(..)", self.name),
        }
    }
}

impl Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Call{{")?;
        Display::fmt(&self, f)?;
        write!(f, "}}")
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub line: Option<u32>,
    pub trace: Option<Vec<Call>>,
}

impl RuntimeError {
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

impl From<ErrorKind> for RuntimeError {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            line: None,
            trace: None,
        }
    }
}

impl Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.kind, f)
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ErrorKind::InvalidConstant(3).is_fatal());
        assert!(ErrorKind::StaleHandle(Handle::default()).is_fatal());
        assert!(!ErrorKind::DivisionByZero.is_fatal());
        assert!(!ErrorKind::Thrown(Value::Null).is_fatal());
        assert!(!ErrorKind::StackOverflow.is_fatal());
    }
}
