use std::rc::Rc;

use tracing::warn;

use super::{
    error::{ErrorKind, RuntimeError},
    function::Function,
    gc::{Handle, HeapData, Marker, Trace},
    meta::MetaMethod,
    state::State,
    value::Value,
    GlobalState,
};

/// Signature of every host function callable from scripts. Arguments sit at
/// `base + 1 ..` of the native frame; the return value is the number of
/// results left on top of the stack.
pub type NativeFn = fn(&mut State, &mut GlobalState) -> Result<usize, RuntimeError>;

/// Largest distance one to-be-closed link can encode.
pub const MAX_DELTA: usize = u16::MAX as usize;

pub struct Closure {
    pub function: Rc<Function>,
    pub values: Vec<Handle>,
}

impl Trace for Closure {
    fn trace(&self, marker: &mut Marker) {
        self.values.trace(marker);
    }
}

pub struct NativeClosure {
    pub name: &'static str,
    pub function: NativeFn,
    pub values: Vec<Value>,
}

impl Trace for NativeClosure {
    fn trace(&self, marker: &mut Marker) {
        self.values.trace(marker);
    }
}

/// A captured variable: aliases a live stack slot until the owning frame
/// exits, then owns a copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClosureValue {
    Open(usize),
    Closed(Value),
}

impl Trace for ClosureValue {
    fn trace(&self, marker: &mut Marker) {
        if let ClosureValue::Closed(value) = self {
            value.trace(marker);
        }
    }
}

/// A method looked up through an object; calling it passes `receiver` as
/// the first argument.
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}

impl Trace for BoundMethod {
    fn trace(&self, marker: &mut Marker) {
        self.receiver.trace(marker);
        self.method.trace(marker);
    }
}

impl State {
    /// Returns the open cell aliasing `slot`, creating it when none exists.
    pub fn find_or_create_value(
        &mut self,
        global: &mut GlobalState,
        slot: usize,
    ) -> Result<Handle, RuntimeError> {
        let pos = self.open_values.iter().position(|(s, _)| *s <= slot);

        if let Some(idx) = pos {
            let (s, handle) = self.open_values[idx];

            if s == slot {
                return Ok(handle);
            }
        }

        let handle = global
            .gc
            .alloc(HeapData::ClosureValue(ClosureValue::Open(slot)))?;

        match pos {
            Some(idx) => self.open_values.insert(idx, (slot, handle)),
            None => self.open_values.push((slot, handle)),
        }

        Ok(handle)
    }

    /// Builds a closure over `function` for the frame at `base`. Captures come
    /// either from that frame's live slots or from the creating closure.
    pub fn create_closure(
        &mut self,
        global: &mut GlobalState,
        base: usize,
        parent: Option<Handle>,
        function: Rc<Function>,
    ) -> Result<Handle, RuntimeError> {
        let mut values = Vec::with_capacity(function.closure_values.len());

        for var in function.closure_values.iter() {
            let index = var.index as usize;
            let handle = if var.in_stack {
                self.find_or_create_value(global, base + 1 + index)?
            } else {
                parent
                    .and_then(|parent| global.gc.closure(parent).ok())
                    .and_then(|parent| parent.values.get(index).copied())
                    .ok_or(ErrorKind::InvalidClosureIndex(index))?
            };

            values.push(handle);
        }

        global
            .gc
            .alloc(HeapData::Closure(Closure { function, values }))
    }

    /// Closes every open cell aliasing a slot at or above `level`.
    pub fn close_stack_values(
        &mut self,
        global: &mut GlobalState,
        level: usize,
    ) -> Result<(), RuntimeError> {
        let count = self
            .open_values
            .iter()
            .take_while(|(slot, _)| *slot >= level)
            .count();

        for (slot, handle) in self.open_values.drain(..count) {
            let value = self.stack.get(slot);
            *global.gc.closure_value_mut(handle)? = ClosureValue::Closed(value);
        }

        Ok(())
    }

    pub fn read_closure_value(
        &self,
        global: &GlobalState,
        handle: Handle,
    ) -> Result<Value, RuntimeError> {
        Ok(match global.gc.closure_value(handle)? {
            ClosureValue::Open(slot) => self.stack.get(*slot),
            ClosureValue::Closed(value) => *value,
        })
    }

    pub fn write_closure_value(
        &mut self,
        global: &mut GlobalState,
        handle: Handle,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match global.gc.closure_value_mut(handle)? {
            ClosureValue::Open(slot) => {
                let slot = *slot;
                self.stack.set_value(&global.gc, slot, value)
            }
            ClosureValue::Closed(stored) => {
                *stored = value;
                Ok(())
            }
        }
    }

    /// Registers `slot` for finalisation when its scope exits.
    pub fn to_be_closed_new(
        &mut self,
        global: &mut GlobalState,
        slot: usize,
    ) -> Result<(), RuntimeError> {
        let value = self.stack.get(slot);

        if value.is_null() {
            return Ok(());
        }

        if global.get_meta(value, MetaMethod::Close)?.is_none() {
            warn!(slot, ty = %value.ty(), "value has no close metamethod");
            return Ok(());
        }

        while slot - self.tbc_head > MAX_DELTA {
            self.tbc_head += MAX_DELTA;

            if let Some(dummy) = self.stack.slot_mut(self.tbc_head) {
                dummy.tbc_delta = 0;
            }
        }

        if let Some(entry) = self.stack.slot_mut(slot) {
            entry.tbc_delta = (slot - self.tbc_head) as u16;
        }

        self.tbc_head = slot;

        Ok(())
    }

    fn pop_tbc(&mut self) -> usize {
        let slot = self.tbc_head;
        let delta = self
            .stack
            .slot_mut(slot)
            .map(|entry| std::mem::take(&mut entry.tbc_delta))
            .unwrap_or_default();

        self.tbc_head -= (delta as usize).min(self.tbc_head);

        while self.tbc_head > 0
            && self
                .stack
                .slot(self.tbc_head)
                .map(|entry| entry.tbc_delta == 0)
                .unwrap_or(true)
        {
            self.tbc_head = self.tbc_head.saturating_sub(MAX_DELTA);
        }

        slot
    }

    /// Closes cells at or above `level`, then runs the `close` metamethod of
    /// every to-be-closed slot at or above `level`, innermost first.
    pub fn close_closure(
        &mut self,
        global: &mut GlobalState,
        level: usize,
        error: Option<Value>,
    ) -> Result<(), RuntimeError> {
        self.close_stack_values(global, level)?;

        while self.tbc_head >= level && self.tbc_head > 0 {
            let slot = self.pop_tbc();
            let value = self.stack.get(slot);

            if let Some(close) = global.get_meta(value, MetaMethod::Close)? {
                self.call_meta(global, close, &[value, error.unwrap_or_default()], 0)?;
            }
        }

        Ok(())
    }
}

impl GlobalState {
    /// Allocates one closed, null cell per captured variable of `function`.
    pub fn closure_init_values(
        &mut self,
        function: &Function,
    ) -> Result<Vec<Handle>, RuntimeError> {
        function
            .closure_values
            .iter()
            .map(|_| {
                self.gc
                    .alloc(HeapData::ClosureValue(ClosureValue::Closed(Value::Null)))
            })
            .collect()
    }

    pub fn new_closure(&mut self, function: Rc<Function>) -> Result<Handle, RuntimeError> {
        let values = self.closure_init_values(&function)?;
        self.gc.alloc(HeapData::Closure(Closure { function, values }))
    }

    pub fn new_native(
        &mut self,
        name: &'static str,
        function: NativeFn,
    ) -> Result<Value, RuntimeError> {
        let handle = self.gc.alloc(HeapData::NativeClosure(NativeClosure {
            name,
            function,
            values: vec![],
        }))?;

        Ok(Value::Closure(handle))
    }
}
