use std::fmt::Display;

use serde::Serialize;

use super::gc::{Handle, Marker, Trace};

/// Runtime type tags, as reported by errors and `typeof`-style introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueType {
    Null,
    Bool,
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
    Object,
    Array,
    Closure,
    Function,
    NativePointer,
    NativeData,
}

impl ValueType {
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::Int8 => "int8",
            ValueType::Int16 => "int16",
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::UInt8 => "uint8",
            ValueType::UInt16 => "uint16",
            ValueType::UInt32 => "uint32",
            ValueType::UInt64 => "uint64",
            ValueType::Float32 => "float32",
            ValueType::Float64 => "float64",
            ValueType::String => "string",
            ValueType::Object => "object",
            ValueType::Array => "array",
            ValueType::Closure => "closure",
            ValueType::Function => "function",
            ValueType::NativePointer => "pointer",
            ValueType::NativeData => "native",
        }
    }

    pub fn is_signed_int(&self) -> bool {
        matches!(
            self,
            ValueType::Int8 | ValueType::Int16 | ValueType::Int32 | ValueType::Int64
        )
    }

    pub fn is_unsigned_int(&self) -> bool {
        matches!(
            self,
            ValueType::UInt8 | ValueType::UInt16 | ValueType::UInt32 | ValueType::UInt64
        )
    }

    pub fn is_float(&self) -> bool {
        matches!(self, ValueType::Float32 | ValueType::Float64)
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The universal runtime value.
///
/// Scalars are stored inline; every heap-backed variant carries a [`Handle`]
/// into the collector, so `is_garbage_collectable` is decided by the variant.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    NativePointer(usize),
    Str(Handle),
    Object(Handle),
    Array(Handle),
    Closure(Handle),
    Function(Handle),
    NativeData(Handle),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int8(_) => ValueType::Int8,
            Value::Int16(_) => ValueType::Int16,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::UInt8(_) => ValueType::UInt8,
            Value::UInt16(_) => ValueType::UInt16,
            Value::UInt32(_) => ValueType::UInt32,
            Value::UInt64(_) => ValueType::UInt64,
            Value::Float32(_) => ValueType::Float32,
            Value::Float64(_) => ValueType::Float64,
            Value::NativePointer(_) => ValueType::NativePointer,
            Value::Str(_) => ValueType::String,
            Value::Object(_) => ValueType::Object,
            Value::Array(_) => ValueType::Array,
            Value::Closure(_) => ValueType::Closure,
            Value::Function(_) => ValueType::Function,
            Value::NativeData(_) => ValueType::NativeData,
        }
    }

    pub fn handle(&self) -> Option<Handle> {
        match self {
            Value::Str(h)
            | Value::Object(h)
            | Value::Array(h)
            | Value::Closure(h)
            | Value::Function(h)
            | Value::NativeData(h) => Some(*h),
            _ => None,
        }
    }

    pub fn is_garbage_collectable(&self) -> bool {
        self.handle().is_some()
    }

    /// Native values are owned by the host rather than the script.
    pub fn is_native(&self) -> bool {
        matches!(self, Value::NativePointer(_) | Value::NativeData(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match *self {
            Value::Null => false,
            Value::Bool(b) => b,
            Value::Float32(f) => f != 0.0,
            Value::Float64(f) => f != 0.0,
            _ => match self.as_i128() {
                Some(i) => i != 0,
                None => true,
            },
        }
    }

    /// Widened integer view of any integer variant.
    pub fn as_i128(&self) -> Option<i128> {
        Some(match *self {
            Value::Int8(i) => i as i128,
            Value::Int16(i) => i as i128,
            Value::Int32(i) => i as i128,
            Value::Int64(i) => i as i128,
            Value::UInt8(i) => i as i128,
            Value::UInt16(i) => i as i128,
            Value::UInt32(i) => i as i128,
            Value::UInt64(i) => i as i128,
            _ => return None,
        })
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_i128().map(|i| i as i64)
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_i128().map(|i| i as u64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::Float32(f) => Some(f as f64),
            Value::Float64(f) => Some(f),
            _ => self.as_i128().map(|i| i as f64),
        }
    }

    pub fn is_number(&self) -> bool {
        self.as_f64().is_some()
    }
}

impl Trace for Value {
    fn trace(&self, marker: &mut Marker) {
        if let Some(handle) = self.handle() {
            marker.mark(handle);
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int64(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::UInt64(u)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float64(f)
    }
}

/// Hashable key derived from a value, used by object tables.
///
/// Integers of every width share one key space and floats hash by bit
/// pattern. Strings are interned, so their handle is a content key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKey {
    Null,
    Bool(bool),
    Int(i128),
    Float(u64),
    Ptr(usize),
    Ref(Handle),
}

impl From<Value> for ObjectKey {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ObjectKey::Null,
            Value::Bool(b) => ObjectKey::Bool(b),
            Value::Float32(f) => ObjectKey::Float((f as f64).to_bits()),
            Value::Float64(f) => ObjectKey::Float(f.to_bits()),
            Value::NativePointer(p) => ObjectKey::Ptr(p),
            other => match other.as_i128() {
                Some(i) => ObjectKey::Int(i),
                None => match other.handle() {
                    Some(h) => ObjectKey::Ref(h),
                    None => ObjectKey::Null,
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Int64(0).is_truthy());
        assert!(!Value::Float64(0.0).is_truthy());
        assert!(Value::UInt8(3).is_truthy());
        assert!(Value::NativePointer(0).is_truthy());
    }

    #[test]
    fn test_scalars_are_not_collectable() {
        assert!(!Value::Int64(1).is_garbage_collectable());
        assert!(!Value::NativePointer(1).is_garbage_collectable());
        assert!(Value::NativePointer(1).is_native());
    }

    #[test]
    fn test_integer_keys_share_space() {
        assert_eq!(ObjectKey::from(Value::Int8(4)), ObjectKey::from(Value::UInt64(4)));
        assert_ne!(ObjectKey::from(Value::Int64(4)), ObjectKey::from(Value::Float64(4.0)));
    }
}
