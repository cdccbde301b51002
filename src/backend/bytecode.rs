use std::fmt::Display;

use bytes::{Buf, BufMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::Serialize;

/// Argument count meaning "every value between the callee and the stack top".
pub const ARGS_TO_TOP: u16 = u16::MAX;
/// Expected result count meaning "keep all results".
pub const MULTIPLE_RESULTS: u16 = u16::MAX;

#[derive(FromPrimitive, IntoPrimitive)]
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Op {
    Nop,
    GetStack,
    SetStack,
    GetConstant,
    GetClosure,
    SetClosure,
    GetValue,
    SetValue,
    GetPrototype,
    ToBool,
    ToInt,
    ToUInt,
    ToFloat,
    ToString,
    Add,
    AddInt,
    AddFloat,
    AddString,
    Sub,
    SubInt,
    SubFloat,
    Mul,
    MulSigned,
    MulUnsigned,
    MulFloat,
    Div,
    DivSigned,
    DivUnsigned,
    DivFloat,
    Mod,
    ModSigned,
    ModUnsigned,
    ModFloat,
    Pow,
    PowSigned,
    PowUnsigned,
    PowFloat,
    Neg,
    ShiftLeft,
    ShiftLeftInt,
    ShiftRight,
    ShiftRightInt,
    LogicalNot,
    LogicalAnd,
    LogicalOr,
    LogicalEqual,
    LogicalNotEqual,
    LogicalGreater,
    LogicalGreaterSigned,
    LogicalGreaterUnsigned,
    LogicalGreaterFloat,
    LogicalLess,
    LogicalLessSigned,
    LogicalLessUnsigned,
    LogicalLessFloat,
    LogicalGreaterEqual,
    LogicalGreaterEqualSigned,
    LogicalGreaterEqualUnsigned,
    LogicalGreaterEqualFloat,
    LogicalLessEqual,
    LogicalLessEqualSigned,
    LogicalLessEqualUnsigned,
    LogicalLessEqualFloat,
    BitwiseNot,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    FunctionCall,
    FunctionTailCall,
    FunctionReturn,
    Jump,
    JumpIf,
    JumpIfNot,
    CreateClosure,
    CreateObject,
    CreateArray,
    Try,
    EndTry,
    Throw,
    Catch,
    MarkToBeClosed,
    CloseScope,
    #[default]
    Invalid,
}

/// Number of opcodes, including `Invalid`.
pub const OP_COUNT: usize = Op::Invalid as usize + 1;

pub trait Serializable {
    fn serialize(&self, buff: &mut impl BufMut);
    fn deserialize(buff: impl Buf) -> Self;
}

/// One fixed-width instruction.
///
/// Layout of the encoded word: opcode (16) > extra (16) > operand (32). The
/// operand is read as a single `i32`, as two `u16` halves or as four bytes
/// depending on the opcode. `extra` is the destination slot for every
/// instruction that produces a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Instruction {
    pub op: Op,
    pub extra: u16,
    pub operand: u32,
}

impl Instruction {
    pub fn new(op: Op, extra: u16) -> Self {
        Self {
            op,
            extra,
            operand: 0,
        }
    }

    pub fn with_i32(op: Op, extra: u16, value: i32) -> Self {
        Self {
            op,
            extra,
            operand: value as u32,
        }
    }

    pub fn with_u16x2(op: Op, extra: u16, a: u16, b: u16) -> Self {
        Self {
            op,
            extra,
            operand: (a as u32) | ((b as u32) << 16),
        }
    }

    pub fn with_u8x4(op: Op, extra: u16, bytes: [u8; 4]) -> Self {
        Self {
            op,
            extra,
            operand: u32::from_le_bytes(bytes),
        }
    }

    pub fn i32(&self) -> i32 {
        self.operand as i32
    }

    pub fn u16x2(&self) -> (u16, u16) {
        (self.operand as u16, (self.operand >> 16) as u16)
    }

    pub fn u8x4(&self) -> [u8; 4] {
        self.operand.to_le_bytes()
    }

    pub fn encode(&self) -> u64 {
        u16::from(self.op) as u64 | (self.extra as u64) << 16 | (self.operand as u64) << 32
    }

    pub fn decode(word: u64) -> Self {
        Self {
            op: Op::from(word as u16),
            extra: (word >> 16) as u16,
            operand: (word >> 32) as u32,
        }
    }

    pub fn is_return(&self) -> bool {
        self.op == Op::FunctionReturn
    }
}

impl Serializable for Instruction {
    fn serialize(&self, buff: &mut impl BufMut) {
        buff.put_u64_le(self.encode());
    }

    fn deserialize(mut buff: impl Buf) -> Self {
        Self::decode(buff.get_u64_le())
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.op {
            Op::Nop | Op::EndTry | Op::Invalid => write!(f, "{:?}", self.op),
            Op::Jump | Op::Try => write!(f, "{:?} {:+}", self.op, self.i32()),
            Op::Throw | Op::Catch | Op::CreateObject | Op::MarkToBeClosed | Op::CloseScope => {
                write!(f, "{:?} {}", self.op, self.extra)
            }
            Op::GetStack
            | Op::SetStack
            | Op::GetConstant
            | Op::GetClosure
            | Op::SetClosure
            | Op::GetPrototype
            | Op::ToBool
            | Op::ToInt
            | Op::ToUInt
            | Op::ToFloat
            | Op::ToString
            | Op::Neg
            | Op::LogicalNot
            | Op::BitwiseNot
            | Op::JumpIf
            | Op::JumpIfNot
            | Op::CreateClosure => write!(f, "{:?} {} {}", self.op, self.extra, self.i32()),
            _ => {
                let (a, b) = self.u16x2();
                write!(f, "{:?} {} {} {}", self.op, self.extra, a, b)
            }
        }
    }
}

/// A compile-time constant.
///
/// Equality is the runtime's: scalars and strings compare by content, floats
/// by bit pattern so the pool never holds two indistinguishable entries.
#[derive(Debug, Clone, Serialize)]
pub enum Const {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
}

impl PartialEq for Const {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Const::Null, Const::Null) => true,
            (Const::Bool(a), Const::Bool(b)) => a == b,
            (Const::Int(a), Const::Int(b)) => a == b,
            (Const::UInt(a), Const::UInt(b)) => a == b,
            (Const::Float(a), Const::Float(b)) => a.to_bits() == b.to_bits(),
            (Const::Str(a), Const::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Const {}

impl Display for Const {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Const::Null => write!(f, "null"),
            Const::Bool(b) => write!(f, "{b}"),
            Const::Int(i) => write!(f, "{i}"),
            Const::UInt(u) => write!(f, "{u}u"),
            Const::Float(n) => write!(f, "{n:?}"),
            Const::Str(s) => write!(f, "{s:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_i32() {
        let instr = Instruction::with_i32(Op::Jump, 0, -3);
        assert_eq!(instr.op, Op::Jump);
        assert_eq!(instr.i32(), -3);

        let instr = Instruction::with_i32(Op::GetConstant, 7, 2394);
        assert_eq!(instr.extra, 7);
        assert_eq!(instr.i32(), 2394);
    }

    #[test]
    fn test_with_u16x2() {
        let instr = Instruction::with_u16x2(Op::FunctionCall, 4, 2, MULTIPLE_RESULTS);
        assert_eq!(instr.u16x2(), (2, MULTIPLE_RESULTS));
    }

    #[test]
    fn test_word_layout() {
        let instr = Instruction::with_u8x4(Op::Add, 0x0102, [1, 2, 3, 4]);
        let word = instr.encode();

        assert_eq!(word & 0xffff, u16::from(Op::Add) as u64);
        assert_eq!((word >> 16) & 0xffff, 0x0102);
        assert_eq!(Instruction::decode(word), instr);
        assert_eq!(instr.u8x4(), [1, 2, 3, 4]);
    }

    #[test]
    fn test_unknown_opcode_decodes_invalid() {
        assert_eq!(Instruction::decode(0xfff0).op, Op::Invalid);
    }

    #[test]
    fn test_const_float_equality_is_bitwise() {
        assert_eq!(Const::Float(0.5), Const::Float(0.5));
        assert_ne!(Const::Float(0.0), Const::Float(-0.0));
        assert_ne!(Const::Int(1), Const::Float(1.0));
    }
}
