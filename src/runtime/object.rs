use std::{any::Any, collections::HashMap};

use wyhash2::WyHash;

use super::{
    gc::{Handle, Marker, Trace},
    value::{ObjectKey, Value},
};

/// Key-value table backing script objects, module export tables and
/// prototype member tables. Iteration follows insertion order.
#[derive(Default)]
pub struct Object {
    pub prototype: Option<Handle>,
    entries: Vec<(Value, Value)>,
    index: HashMap<ObjectKey, usize, WyHash>,
}

impl Trace for Object {
    fn trace(&self, marker: &mut Marker) {
        self.prototype.trace(marker);

        for (key, value) in self.entries.iter() {
            key.trace(marker);
            value.trace(marker);
        }
    }
}

impl Object {
    pub fn with_prototype(prototype: Handle) -> Self {
        Self {
            prototype: Some(prototype),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn get(&self, key: Value) -> Option<Value> {
        self.index
            .get(&ObjectKey::from(key))
            .map(|&idx| self.entries[idx].1)
    }

    #[inline]
    pub fn set(&mut self, key: Value, value: Value) {
        match self.index.get(&ObjectKey::from(key)) {
            Some(&idx) => self.entries[idx].1 = value,
            None => {
                self.index.insert(ObjectKey::from(key), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn contains(&self, key: Value) -> bool {
        self.index.contains_key(&ObjectKey::from(key))
    }

    pub fn entry_at(&self, idx: usize) -> Option<(Value, Value)> {
        self.entries.get(idx).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Value, Value)> {
        self.entries.iter()
    }
}

/// Host-owned payload wrapped in a collectable object.
pub struct NativeData {
    pub name: &'static str,
    pub data: Box<dyn Any>,
}

impl NativeData {
    pub fn new(name: &'static str, data: impl Any) -> Self {
        Self {
            name,
            data: Box::new(data),
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.data.downcast_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order() {
        let mut object = Object::default();
        object.set(Value::Int64(2), Value::Bool(true));
        object.set(Value::Int64(1), Value::Bool(false));
        object.set(Value::Int8(2), Value::Null);

        assert_eq!(object.len(), 2);
        assert_eq!(object.entry_at(0), Some((Value::Int64(2), Value::Null)));
        assert_eq!(object.get(Value::UInt32(1)), Some(Value::Bool(false)));
        assert!(!object.contains(Value::Float64(1.0)));
    }

    #[test]
    fn test_native_data_downcast() {
        let data = NativeData::new("counter", 42u32);

        assert_eq!(data.downcast_ref::<u32>(), Some(&42));
        assert!(data.downcast_ref::<i64>().is_none());
    }
}
