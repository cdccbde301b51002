use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::value::Value;

/// Closed set of operator hooks a prototype or a value type may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MetaMethod {
    Constructor,
    Destructor,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Less,
    LessEqual,
    Equal,
    ShiftLeft,
    ShiftRight,
    BitwiseNot,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ToString,
    ToBool,
    ToInt,
    ToUInt,
    ToFloat,
    Call,
    Close,
}

impl MetaMethod {
    pub const COUNT: usize = MetaMethod::Close as usize + 1;

    const NAMES: [&'static str; Self::COUNT] = [
        "constructor",
        "destructor",
        "add",
        "sub",
        "mul",
        "div",
        "mod",
        "pow",
        "neg",
        "less",
        "lessEqual",
        "equal",
        "shiftLeft",
        "shiftRight",
        "bitwiseNot",
        "bitwiseAnd",
        "bitwiseOr",
        "bitwiseXor",
        "toString",
        "toBool",
        "toInt",
        "toUInt",
        "toFloat",
        "call",
        "close",
    ];

    pub fn name(&self) -> &'static str {
        Self::NAMES[*self as usize]
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .position(|n| *n == name)
            .and_then(|idx| Self::try_from(idx as u8).ok())
    }
}

/// Fixed-size table indexed by [`MetaMethod`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MetaTable([Option<Value>; MetaMethod::COUNT]);

impl MetaTable {
    pub fn get(&self, meta: MetaMethod) -> Option<Value> {
        self.0[meta as usize]
    }

    pub fn set(&mut self, meta: MetaMethod, value: Value) {
        self.0[meta as usize] = Some(value);
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.0.iter().flatten().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        assert_eq!(MetaMethod::from_name("toString"), Some(MetaMethod::ToString));
        assert_eq!(MetaMethod::from_name("close"), Some(MetaMethod::Close));
        assert_eq!(MetaMethod::Constructor.name(), "constructor");
        assert_eq!(MetaMethod::from_name("nope"), None);
    }
}
