use std::cmp::Ordering;

use crate::backend::Op;

use super::{
    error::{ErrorKind, RuntimeError},
    gc::{Gc, HeapData},
    meta::MetaMethod,
    value::{Value, ValueType},
};

/// Binary operators shared by the generic and the specialised opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
}

impl Arith {
    pub fn symbol(&self) -> &'static str {
        match self {
            Arith::Add => "+",
            Arith::Sub => "-",
            Arith::Mul => "*",
            Arith::Div => "/",
            Arith::Mod => "%",
            Arith::Pow => "**",
            Arith::Shl => "<<",
            Arith::Shr => ">>",
            Arith::BitAnd => "&",
            Arith::BitOr => "|",
            Arith::BitXor => "^",
        }
    }

    pub fn meta(&self) -> MetaMethod {
        match self {
            Arith::Add => MetaMethod::Add,
            Arith::Sub => MetaMethod::Sub,
            Arith::Mul => MetaMethod::Mul,
            Arith::Div => MetaMethod::Div,
            Arith::Mod => MetaMethod::Mod,
            Arith::Pow => MetaMethod::Pow,
            Arith::Shl => MetaMethod::ShiftLeft,
            Arith::Shr => MetaMethod::ShiftRight,
            Arith::BitAnd => MetaMethod::BitwiseAnd,
            Arith::BitOr => MetaMethod::BitwiseOr,
            Arith::BitXor => MetaMethod::BitwiseXor,
        }
    }

    fn is_bitwise(&self) -> bool {
        matches!(
            self,
            Arith::Shl | Arith::Shr | Arith::BitAnd | Arith::BitOr | Arith::BitXor
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum Num {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

fn num(value: Value) -> Option<Num> {
    match value {
        Value::Int8(_) | Value::Int16(_) | Value::Int32(_) | Value::Int64(_) => {
            value.as_i64().map(Num::Signed)
        }
        Value::UInt8(_) | Value::UInt16(_) | Value::UInt32(_) | Value::UInt64(_) => {
            value.as_u64().map(Num::Unsigned)
        }
        Value::Float32(f) => Some(Num::Float(f as f64)),
        Value::Float64(f) => Some(Num::Float(f)),
        _ => None,
    }
}

macro_rules! int_arith {
    ($op:expr, $lhs:expr, $rhs:expr, $variant:ident) => {{
        let (lhs, rhs) = ($lhs, $rhs);

        match $op {
            Arith::Add => Value::$variant(lhs.wrapping_add(rhs)),
            Arith::Sub => Value::$variant(lhs.wrapping_sub(rhs)),
            Arith::Mul => Value::$variant(lhs.wrapping_mul(rhs)),
            Arith::Div | Arith::Mod if rhs == 0 => return Err(ErrorKind::DivisionByZero.into()),
            Arith::Div => Value::$variant(lhs.wrapping_div(rhs)),
            Arith::Mod => Value::$variant(lhs.wrapping_rem(rhs)),
            Arith::Shl => Value::$variant(lhs.wrapping_shl(rhs as u32)),
            Arith::Shr => Value::$variant(lhs.wrapping_shr(rhs as u32)),
            Arith::BitAnd => Value::$variant(lhs & rhs),
            Arith::BitOr => Value::$variant(lhs | rhs),
            Arith::BitXor => Value::$variant(lhs ^ rhs),
            Arith::Pow => {
                if (rhs as i128) < 0 {
                    Value::Float64((lhs as f64).powf(rhs as f64))
                } else {
                    Value::$variant(lhs.wrapping_pow(rhs.min(u32::MAX as _) as u32))
                }
            }
        }
    }};
}

fn float_arith(op: Arith, lhs: f64, rhs: f64) -> Option<Value> {
    Some(Value::Float64(match op {
        Arith::Add => lhs + rhs,
        Arith::Sub => lhs - rhs,
        Arith::Mul => lhs * rhs,
        Arith::Div => lhs / rhs,
        Arith::Mod => lhs % rhs,
        Arith::Pow => lhs.powf(rhs),
        _ => return None,
    }))
}

/// Numeric arithmetic of the generic opcodes. `None` means the operands have
/// no built-in meaning for `op` and metamethods should be consulted.
pub fn arith(op: Arith, lhs: Value, rhs: Value) -> Result<Option<Value>, RuntimeError> {
    let (Some(l), Some(r)) = (num(lhs), num(rhs)) else {
        return Ok(None);
    };

    Ok(Some(match (l, r) {
        (Num::Float(_), _) | (_, Num::Float(_)) => {
            if op.is_bitwise() {
                return Ok(None);
            }

            let (Some(l), Some(r)) = (lhs.as_f64(), rhs.as_f64()) else {
                return Ok(None);
            };

            return Ok(float_arith(op, l, r));
        }
        (Num::Unsigned(l), Num::Unsigned(r)) => int_arith!(op, l, r, UInt64),
        _ => {
            let (Some(l), Some(r)) = (lhs.as_i64(), rhs.as_i64()) else {
                return Ok(None);
            };

            int_arith!(op, l, r, Int64)
        }
    }))
}

fn mismatch(op: Op, lhs: Value, rhs: Value) -> RuntimeError {
    ErrorKind::TypeMismatch {
        op,
        left: lhs.ty(),
        right: rhs.ty(),
    }
    .into()
}

/// `ADD_INT`, `SUB_INT`, `SHIFT_*_INT`: any integer widths.
pub fn arith_int(op: Op, arith: Arith, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    match (num(lhs), num(rhs)) {
        (Some(Num::Unsigned(l)), Some(Num::Unsigned(r))) => Ok(int_arith!(arith, l, r, UInt64)),
        (Some(Num::Signed(_) | Num::Unsigned(_)), Some(Num::Signed(_) | Num::Unsigned(_))) => {
            let (l, r) = (lhs.as_i64().unwrap_or_default(), rhs.as_i64().unwrap_or_default());
            Ok(int_arith!(arith, l, r, Int64))
        }
        _ => Err(mismatch(op, lhs, rhs)),
    }
}

pub fn arith_signed(op: Op, arith: Arith, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    match (num(lhs), num(rhs)) {
        (Some(Num::Signed(l)), Some(Num::Signed(r))) => Ok(int_arith!(arith, l, r, Int64)),
        _ => Err(mismatch(op, lhs, rhs)),
    }
}

pub fn arith_unsigned(
    op: Op,
    arith: Arith,
    lhs: Value,
    rhs: Value,
) -> Result<Value, RuntimeError> {
    match (num(lhs), num(rhs)) {
        (Some(Num::Unsigned(l)), Some(Num::Unsigned(r))) => Ok(int_arith!(arith, l, r, UInt64)),
        _ => Err(mismatch(op, lhs, rhs)),
    }
}

pub fn arith_float(op: Op, arith: Arith, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    match (num(lhs), num(rhs)) {
        (Some(Num::Float(l)), Some(Num::Float(r))) => {
            float_arith(arith, l, r).ok_or_else(|| mismatch(op, lhs, rhs))
        }
        _ => Err(mismatch(op, lhs, rhs)),
    }
}

/// Ordering of two numbers or two strings; `None` when they are unordered.
pub fn compare(gc: &Gc, lhs: Value, rhs: Value) -> Result<Option<Ordering>, RuntimeError> {
    match (num(lhs), num(rhs)) {
        (Some(Num::Float(_)), Some(_)) | (Some(_), Some(Num::Float(_))) => {
            Ok(lhs.as_f64().zip(rhs.as_f64()).and_then(|(l, r)| l.partial_cmp(&r)))
        }
        (Some(_), Some(_)) => Ok(lhs.as_i128().zip(rhs.as_i128()).map(|(l, r)| l.cmp(&r))),
        _ => match (lhs, rhs) {
            (Value::Str(l), Value::Str(r)) => Ok(Some(gc.string(l)?.cmp(gc.string(r)?))),
            _ => Ok(None),
        },
    }
}

/// Ordering for the specialised compare opcodes, which check operand kinds.
pub fn compare_typed(
    op: Op,
    lhs: Value,
    rhs: Value,
    check: fn(&ValueType) -> bool,
) -> Result<Option<Ordering>, RuntimeError> {
    if !check(&lhs.ty()) || !check(&rhs.ty()) {
        return Err(mismatch(op, lhs, rhs));
    }

    Ok(match (num(lhs), num(rhs)) {
        (Some(Num::Float(l)), Some(Num::Float(r))) => l.partial_cmp(&r),
        _ => lhs.as_i128().zip(rhs.as_i128()).map(|(l, r)| l.cmp(&r)),
    })
}

/// Built-in equality: numbers by value across widths, strings by identity
/// (they are interned), everything else by identity.
pub fn equals(lhs: Value, rhs: Value) -> bool {
    match (num(lhs), num(rhs)) {
        (Some(Num::Float(_)), Some(_)) | (Some(_), Some(Num::Float(_))) => {
            lhs.as_f64() == rhs.as_f64()
        }
        (Some(_), Some(_)) => lhs.as_i128() == rhs.as_i128(),
        _ => lhs == rhs,
    }
}

pub fn negate(value: Value) -> Option<Value> {
    Some(match value {
        Value::Int8(i) => Value::Int8(i.wrapping_neg()),
        Value::Int16(i) => Value::Int16(i.wrapping_neg()),
        Value::Int32(i) => Value::Int32(i.wrapping_neg()),
        Value::Int64(i) => Value::Int64(i.wrapping_neg()),
        Value::UInt8(_) | Value::UInt16(_) | Value::UInt32(_) | Value::UInt64(_) => {
            Value::Int64(value.as_i64()?.wrapping_neg())
        }
        Value::Float32(f) => Value::Float32(-f),
        Value::Float64(f) => Value::Float64(-f),
        _ => return None,
    })
}

pub fn bitwise_not(value: Value) -> Option<Value> {
    Some(match value {
        Value::Int8(i) => Value::Int8(!i),
        Value::Int16(i) => Value::Int16(!i),
        Value::Int32(i) => Value::Int32(!i),
        Value::Int64(i) => Value::Int64(!i),
        Value::UInt8(i) => Value::UInt8(!i),
        Value::UInt16(i) => Value::UInt16(!i),
        Value::UInt32(i) => Value::UInt32(!i),
        Value::UInt64(i) => Value::UInt64(!i),
        _ => return None,
    })
}

fn conversion_failed(value: Value, to: &'static str) -> RuntimeError {
    ErrorKind::ConversionFailed {
        from: value.ty(),
        to,
    }
    .into()
}

pub fn to_int(gc: &Gc, value: Value) -> Result<Value, RuntimeError> {
    Ok(Value::Int64(match value {
        Value::Null => 0,
        Value::Bool(b) => b as i64,
        Value::Float32(f) => f as i64,
        Value::Float64(f) => f as i64,
        Value::Str(h) => {
            let s = gc.string(h)?.trim();

            match s.parse::<i64>() {
                Ok(i) => i,
                Err(_) => s
                    .parse::<f64>()
                    .map(|f| f as i64)
                    .map_err(|_| conversion_failed(value, "int"))?,
            }
        }
        _ => value.as_i64().ok_or_else(|| conversion_failed(value, "int"))?,
    }))
}

pub fn to_uint(gc: &Gc, value: Value) -> Result<Value, RuntimeError> {
    Ok(Value::UInt64(match value {
        Value::Null => 0,
        Value::Bool(b) => b as u64,
        Value::Float32(f) => f as u64,
        Value::Float64(f) => f as u64,
        Value::Str(h) => {
            let s = gc.string(h)?.trim();

            match s.parse::<u64>() {
                Ok(i) => i,
                Err(_) => s
                    .parse::<f64>()
                    .map(|f| f as u64)
                    .map_err(|_| conversion_failed(value, "uint"))?,
            }
        }
        _ => value
            .as_u64()
            .ok_or_else(|| conversion_failed(value, "uint"))?,
    }))
}

pub fn to_float(gc: &Gc, value: Value) -> Result<Value, RuntimeError> {
    Ok(Value::Float64(match value {
        Value::Null => 0.0,
        Value::Bool(b) => b as u8 as f64,
        Value::Str(h) => gc
            .string(h)?
            .trim()
            .parse::<f64>()
            .map_err(|_| conversion_failed(value, "float"))?,
        _ => value
            .as_f64()
            .ok_or_else(|| conversion_failed(value, "float"))?,
    }))
}

const MAX_REPR_DEPTH: usize = 8;

fn write_repr(gc: &Gc, value: Value, quote: bool, depth: usize, out: &mut String) {
    use std::fmt::Write;

    if depth > MAX_REPR_DEPTH {
        out.push_str("...");
        return;
    }

    let _ = match value {
        Value::Null => write!(out, "null"),
        Value::Bool(b) => write!(out, "{b}"),
        Value::Float32(f) => write!(out, "{f}"),
        Value::Float64(f) => write!(out, "{f}"),
        Value::NativePointer(p) => write!(out, "{p:#x}"),
        Value::Str(h) => match gc.string(h) {
            Ok(s) if quote => write!(out, "{s:?}"),
            Ok(s) => write!(out, "{s}"),
            Err(_) => write!(out, "<stale>"),
        },
        Value::Object(h) | Value::Array(h) | Value::Closure(h) | Value::Function(h) | Value::NativeData(h) => {
            match gc.get(h) {
                Ok(HeapData::Array(items)) => {
                    out.push('[');

                    for (i, item) in items.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }

                        write_repr(gc, *item, true, depth + 1, out);
                    }

                    out.push(']');
                    Ok(())
                }
                Ok(HeapData::Object(object)) => {
                    if let Some(name) = object
                        .prototype
                        .and_then(|p| gc.prototype(p).ok())
                        .and_then(|p| gc.string(p.name).ok())
                    {
                        out.push_str(name);
                    }

                    out.push('{');

                    for (i, (key, value)) in object.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }

                        write_repr(gc, *key, false, depth + 1, out);
                        out.push_str(": ");
                        write_repr(gc, *value, true, depth + 1, out);
                    }

                    out.push('}');
                    Ok(())
                }
                Ok(HeapData::Closure(c)) => write!(out, "<closure {}>", c.function.name),
                Ok(HeapData::NativeClosure(c)) => write!(out, "<native {}>", c.name),
                Ok(HeapData::BoundMethod(_)) => write!(out, "<method>"),
                Ok(HeapData::Function(f)) => write!(out, "<function {}>", f.name),
                Ok(HeapData::Module(m)) => write!(out, "<module {}>", m.full_path),
                Ok(HeapData::Prototype(p)) => match gc.string(p.name) {
                    Ok(name) => write!(out, "<prototype {name}>"),
                    Err(_) => write!(out, "<prototype>"),
                },
                Ok(HeapData::NativeData(d)) => write!(out, "<native data {}>", d.name),
                Ok(HeapData::Str(_) | HeapData::ClosureValue(_)) | Err(_) => {
                    write!(out, "<stale>")
                }
            }
        }
        _ => match value.as_i128() {
            Some(i) => write!(out, "{i}"),
            None => write!(out, "<{}>", value.ty()),
        },
    };
}

/// Default textual form used by `TO_STRING` when no metamethod applies.
pub fn to_display(gc: &Gc, value: Value) -> String {
    let mut out = String::new();
    write_repr(gc, value, false, 0, &mut out);
    out
}

/// Like [`to_display`] but quotes top-level strings.
pub fn repr(gc: &Gc, value: Value) -> String {
    let mut out = String::new();
    write_repr(gc, value, true, 0, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_promotion() {
        assert_eq!(
            arith(Arith::Add, Value::Int8(1), Value::Int32(2)).unwrap(),
            Some(Value::Int64(3))
        );
        assert_eq!(
            arith(Arith::Add, Value::UInt8(1), Value::UInt16(2)).unwrap(),
            Some(Value::UInt64(3))
        );
        assert_eq!(
            arith(Arith::Mul, Value::Int64(2), Value::Float64(1.5)).unwrap(),
            Some(Value::Float64(3.0))
        );
        assert_eq!(arith(Arith::Add, Value::Null, Value::Int64(1)).unwrap(), None);
        assert_eq!(
            arith(Arith::BitAnd, Value::Float64(1.0), Value::Int64(1)).unwrap(),
            None
        );
    }

    #[test]
    fn test_division_by_zero() {
        let err = arith(Arith::Div, Value::Int64(1), Value::Int64(0)).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::DivisionByZero));

        assert_eq!(
            arith(Arith::Div, Value::Float64(1.0), Value::Float64(0.0)).unwrap(),
            Some(Value::Float64(f64::INFINITY))
        );
    }

    #[test]
    fn test_specialised_mismatch_is_fatal() {
        let err = arith_signed(Op::MulSigned, Arith::Mul, Value::Int64(1), Value::UInt64(1))
            .unwrap_err();
        assert!(err.is_fatal());

        let err =
            arith_float(Op::AddFloat, Arith::Add, Value::Int64(1), Value::Float64(1.0)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_int_pow() {
        assert_eq!(
            arith(Arith::Pow, Value::Int64(2), Value::Int64(10)).unwrap(),
            Some(Value::Int64(1024))
        );
        assert_eq!(
            arith(Arith::Pow, Value::Int64(2), Value::Int64(-1)).unwrap(),
            Some(Value::Float64(0.5))
        );
    }

    #[test]
    fn test_equals_across_widths() {
        assert!(equals(Value::Int8(3), Value::UInt64(3)));
        assert!(equals(Value::Int64(3), Value::Float64(3.0)));
        assert!(!equals(Value::Null, Value::Bool(false)));
    }

    #[test]
    fn test_conversions() {
        let mut gc = Gc::default();
        let s = gc.intern(" 42 ").unwrap();

        assert_eq!(to_int(&gc, Value::Str(s)).unwrap(), Value::Int64(42));
        assert_eq!(to_int(&gc, Value::Null).unwrap(), Value::Int64(0));
        assert_eq!(to_float(&gc, Value::Int32(2)).unwrap(), Value::Float64(2.0));

        let bad = gc.intern("abc").unwrap();
        assert!(to_int(&gc, Value::Str(bad)).is_err());
    }

    #[test]
    fn test_display_nested_array() {
        let mut gc = Gc::default();
        let s = gc.intern("x").unwrap();
        let array = gc
            .alloc(HeapData::Array(vec![Value::Int64(1), Value::Str(s)]))
            .unwrap();

        assert_eq!(to_display(&gc, Value::Array(array)), "[1, \"x\"]");
        assert_eq!(to_display(&gc, Value::Str(s)), "x");
        assert_eq!(repr(&gc, Value::Str(s)), "\"x\"");
    }
}
