use std::mem;

use tracing::trace;

use super::{
    error::{ErrorKind, RuntimeError},
    gc::{AllocTag, Gc},
    value::Value,
};

pub const BASIC_STACK_SIZE: usize = 40;
pub const MAX_STACK_SIZE: usize = 1_000_000;
/// Extra room granted while an overflow is being unwound, so handlers can run.
pub const ERROR_STACK_SIZE: usize = MAX_STACK_SIZE + 200;
/// Slots reserved above the arguments of every native call.
pub const NATIVE_CALL_MIN: usize = 20;

/// Operands in `-STACK_NEGATIVE_LIMIT..0` are relative to the stack top.
pub const STACK_NEGATIVE_LIMIT: i32 = 0x10000;
/// Operands at or below this address the running closure's captured values.
pub const STACK_CLOSURE_BASE: i32 = -0x2000_0000;
/// Operand addressing the global `zr` registry object.
pub const STACK_GLOBAL_MODULE_REGISTRY: i32 = -0x4000_0000;

#[derive(Debug, Clone, Copy, Default)]
pub struct StackSlot {
    pub value: Value,
    /// Distance to the previous to-be-closed slot, 0 when not registered.
    pub tbc_delta: u16,
}

/// Resolved form of a signed stack operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Slot(usize),
    Closure(usize),
    Registry,
}

/// The value stack of one thread.
///
/// Every reference into the stack held elsewhere in the runtime is a slot
/// index, so growing the backing vector keeps them valid. Growth still goes
/// through the allocator and bumps the relocation counter so frames can
/// resynchronise cached bases.
pub struct Stack {
    slots: Vec<StackSlot>,
    pub top: usize,
    max: usize,
    relocations: usize,
}

impl Stack {
    pub fn new(gc: &mut Gc, initial: usize, max: usize) -> Result<Self, RuntimeError> {
        let initial = initial.clamp(1, max);

        gc.reallocate(0, initial * mem::size_of::<StackSlot>(), AllocTag::Stack)?;

        Ok(Self {
            slots: vec![StackSlot::default(); initial],
            top: 0,
            max,
            relocations: 0,
        })
    }

    /// One-past-end boundary of the usable stack.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    pub fn relocations(&self) -> usize {
        self.relocations
    }

    /// Makes sure `extra` slots are available above `top`, growing by
    /// doubling. Returns whether the backing storage was reallocated.
    pub fn check_full_and_grow(
        &mut self,
        gc: &mut Gc,
        extra: usize,
        unwinding: bool,
    ) -> Result<bool, RuntimeError> {
        let needed = self.top + extra;

        if needed <= self.slots.len() {
            return Ok(false);
        }

        let limit = if unwinding {
            self.max + (ERROR_STACK_SIZE - MAX_STACK_SIZE)
        } else {
            self.max
        };

        if needed > limit {
            return Err(ErrorKind::StackOverflow.into());
        }

        let old_len = self.slots.len();
        let new_len = (old_len * 2).max(needed).min(limit);
        let slot_size = mem::size_of::<StackSlot>();

        gc.reallocate(old_len * slot_size, new_len * slot_size, AllocTag::Stack)?;

        self.slots.resize(new_len, StackSlot::default());
        self.relocations += 1;

        trace!(old_len, new_len, "stack grown");

        Ok(true)
    }

    #[inline]
    pub fn get(&self, slot: usize) -> Value {
        self.slots.get(slot).map(|s| s.value).unwrap_or_default()
    }

    #[inline]
    pub fn set(&mut self, slot: usize, value: Value) -> Result<(), RuntimeError> {
        match self.slots.get_mut(slot) {
            Some(s) => {
                s.value = value;
                Ok(())
            }
            None => Err(ErrorKind::InvalidOperand(slot as i64).into()),
        }
    }

    /// Writes a value after checking the object it references is still alive.
    pub fn set_value(&mut self, gc: &Gc, slot: usize, value: Value) -> Result<(), RuntimeError> {
        if cfg!(debug_assertions) {
            if let Some(handle) = value.handle() {
                gc.header(handle)?;
            }
        }

        self.set(slot, value)
    }

    pub fn copy_value(&mut self, gc: &Gc, from: usize, to: usize) -> Result<(), RuntimeError> {
        let value = self.get(from);
        self.set_value(gc, to, value)
    }

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.set(self.top, value)?;
        self.top += 1;
        Ok(())
    }

    pub fn slot(&self, slot: usize) -> Option<&StackSlot> {
        self.slots.get(slot)
    }

    pub fn slot_mut(&mut self, slot: usize) -> Option<&mut StackSlot> {
        self.slots.get_mut(slot)
    }

    pub fn fill(&mut self, from: usize, to: usize, value: Value) {
        let to = to.min(self.slots.len());

        for slot in self.slots[from.min(to)..to].iter_mut() {
            slot.value = value;
        }
    }

    pub fn values(&self, from: usize, to: usize) -> Vec<Value> {
        let to = to.min(self.slots.len());
        self.slots[from.min(to)..to].iter().map(|s| s.value).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.slots.iter().map(|s| &s.value)
    }

    /// Releases the backing storage accounting; used when a thread is dropped.
    pub fn release(&mut self, gc: &mut Gc) {
        let _ = gc.reallocate(
            self.slots.len() * mem::size_of::<StackSlot>(),
            0,
            AllocTag::Stack,
        );
        self.slots.clear();
        self.top = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_doubles() {
        let mut gc = Gc::default();
        let mut stack = Stack::new(&mut gc, 4, 100).unwrap();

        stack.top = 3;
        assert!(!stack.check_full_and_grow(&mut gc, 1, false).unwrap());
        assert!(stack.check_full_and_grow(&mut gc, 2, false).unwrap());
        assert_eq!(stack.len(), 8);
        assert_eq!(stack.relocations(), 1);
    }

    #[test]
    fn test_overflow_and_error_headroom() {
        let mut gc = Gc::default();
        let mut stack = Stack::new(&mut gc, 8, 8).unwrap();

        stack.top = 8;
        assert!(matches!(
            stack.check_full_and_grow(&mut gc, 1, false).map_err(|e| e.kind),
            Err(ErrorKind::StackOverflow)
        ));
        assert!(stack.check_full_and_grow(&mut gc, 1, true).unwrap());
    }

    #[test]
    fn test_values_survive_growth() {
        let mut gc = Gc::default();
        let mut stack = Stack::new(&mut gc, 2, 64).unwrap();

        stack.push(Value::Int64(7)).unwrap();
        stack.push(Value::Int64(9)).unwrap();
        stack.check_full_and_grow(&mut gc, 30, false).unwrap();

        assert_eq!(stack.get(0), Value::Int64(7));
        assert_eq!(stack.get(1), Value::Int64(9));
    }
}
