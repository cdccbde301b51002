use std::{cell::Cell, rc::Rc};

use tracing::{instrument, warn};

use crate::{backend::MULTIPLE_RESULTS, collections::ReuseVec};

#[cfg(feature = "profiler")]
use crate::profiler::VmProfiler;

use super::{
    call_info::CallInfo,
    closure::NativeFn,
    error::{Call, ErrorKind, RuntimeError},
    function::Function,
    gc::{Handle, HeapData, Marker, Trace},
    meta::MetaMethod,
    module::Export,
    object::Object,
    ops,
    stack::{
        Address, Stack, NATIVE_CALL_MIN, STACK_CLOSURE_BASE, STACK_GLOBAL_MODULE_REGISTRY,
        STACK_NEGATIVE_LIMIT,
    },
    value::Value,
    GlobalState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Fine,
    RuntimeError,
    ExceptionError,
    MemoryError,
}

/// An active `TRY` region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Handler {
    /// Index of the frame that entered the region.
    pub depth: usize,
    /// Where the frame resumes when an exception is caught.
    pub pc: usize,
    /// First slot owned by the region; cells and to-be-closed slots at or
    /// above it are closed on catch.
    pub level: usize,
}

/// One thread of execution: a value stack, its frames and its exception
/// handlers.
pub struct State {
    pub stack: Stack,
    pub(crate) call_infos: ReuseVec<CallInfo>,
    /// Open cells, sorted by descending slot.
    pub(crate) open_values: Vec<(usize, Handle)>,
    /// Head of the to-be-closed chain; slot 0 is the sentinel.
    pub(crate) tbc_head: usize,
    pub(crate) handlers: Vec<Handler>,
    pub(crate) exception: Value,
    pub(crate) exports: Vec<Export>,
    pub status: ThreadStatus,
    pub(crate) unwinding: bool,
    pub(crate) interrupted: bool,
    nested: u32,
    live: Rc<Cell<usize>>,
    #[cfg(feature = "profiler")]
    pub profiler: VmProfiler,
}

impl State {
    pub fn new(global: &mut GlobalState) -> Result<Self, RuntimeError> {
        let initial = global.config.initial_stack_size.max(1 + NATIVE_CALL_MIN);
        let mut stack = Stack::new(&mut global.gc, initial, global.config.max_stack_size)?;
        let mut call_infos = ReuseVec::default();

        call_infos
            .push_with(CallInfo::default)
            .entry_native_init(0, 1 + NATIVE_CALL_MIN, None, 0, 0);
        stack.top = 1;

        let live = Rc::clone(&global.live_states);
        live.set(live.get() + 1);

        Ok(Self {
            stack,
            call_infos,
            open_values: vec![],
            tbc_head: 0,
            handlers: vec![],
            exception: Value::Null,
            exports: vec![],
            status: ThreadStatus::Fine,
            unwinding: false,
            interrupted: false,
            nested: 0,
            live,
            #[cfg(feature = "profiler")]
            profiler: VmProfiler::default(),
        })
    }

    pub fn frames(&self) -> impl DoubleEndedIterator<Item = &CallInfo> {
        self.call_infos.iter()
    }

    pub fn depth(&self) -> usize {
        self.call_infos.len()
    }

    pub(crate) fn frame(&self) -> Result<&CallInfo, RuntimeError> {
        self.call_infos
            .last()
            .ok_or_else(|| ErrorKind::FrameCorrupted("no active frame").into())
    }

    pub(crate) fn frame_mut(&mut self) -> Result<&mut CallInfo, RuntimeError> {
        self.call_infos
            .last_mut()
            .ok_or_else(|| ErrorKind::FrameCorrupted("no active frame").into())
    }

    /// Argument `idx` of the running native call, or null when absent.
    pub fn arg(&self, idx: usize) -> Value {
        match self.call_infos.last() {
            Some(ci) if ci.base + 1 + idx < self.stack.top => self.stack.get(ci.base + 1 + idx),
            _ => Value::Null,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.call_infos
            .last()
            .map(|ci| self.stack.top.saturating_sub(ci.base + 1))
            .unwrap_or_default()
    }

    /// Sets the trap of every frame and raises `interrupted` at the next
    /// instruction fetch.
    pub fn interrupt(&mut self) {
        self.interrupted = true;

        for ci in self.call_infos.iter_mut() {
            ci.set_trap();
        }
    }

    /// Ensures `extra` free slots above the stack top. A reallocation traps
    /// every frame so they resynchronise before the next fetch.
    pub fn check_stack(&mut self, global: &mut GlobalState, extra: usize) -> Result<(), RuntimeError> {
        if self
            .stack
            .check_full_and_grow(&mut global.gc, extra, self.unwinding)?
        {
            for ci in self.call_infos.iter_mut() {
                ci.set_trap();
            }
        }

        let needed = self.stack.top + extra;

        if let Some(ci) = self.call_infos.last_mut() {
            if !ci.is_vm() && ci.top < needed {
                ci.top = needed;
            }
        }

        Ok(())
    }

    pub fn address(&self, base: usize, offset: i32) -> Result<Address, RuntimeError> {
        if offset >= 0 {
            return Ok(Address::Slot(base + 1 + offset as usize));
        }

        if offset >= -STACK_NEGATIVE_LIMIT {
            return self
                .stack
                .top
                .checked_sub(offset.unsigned_abs() as usize)
                .map(Address::Slot)
                .ok_or_else(|| ErrorKind::InvalidOperand(offset as i64).into());
        }

        if offset == STACK_GLOBAL_MODULE_REGISTRY {
            return Ok(Address::Registry);
        }

        if offset <= STACK_CLOSURE_BASE && offset > STACK_GLOBAL_MODULE_REGISTRY {
            return Ok(Address::Closure((STACK_CLOSURE_BASE - offset) as usize));
        }

        Err(ErrorKind::InvalidOperand(offset as i64).into())
    }

    pub(crate) fn closure_cell(
        &self,
        global: &GlobalState,
        closure: Option<Handle>,
        idx: usize,
    ) -> Result<Handle, RuntimeError> {
        closure
            .and_then(|closure| global.gc.closure(closure).ok())
            .and_then(|closure| closure.values.get(idx).copied())
            .ok_or_else(|| ErrorKind::InvalidClosureIndex(idx).into())
    }

    pub fn read_operand(
        &self,
        global: &GlobalState,
        base: usize,
        closure: Option<Handle>,
        offset: i32,
    ) -> Result<Value, RuntimeError> {
        match self.address(base, offset)? {
            Address::Slot(slot) => Ok(self.stack.get(slot)),
            Address::Registry => Ok(Value::Object(global.registry)),
            Address::Closure(idx) => {
                let cell = self.closure_cell(global, closure, idx)?;
                self.read_closure_value(global, cell)
            }
        }
    }

    pub fn write_operand(
        &mut self,
        global: &mut GlobalState,
        base: usize,
        closure: Option<Handle>,
        offset: i32,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match self.address(base, offset)? {
            Address::Slot(slot) => self.stack.set_value(&global.gc, slot, value),
            Address::Registry => Err(ErrorKind::InvalidOperand(offset as i64).into()),
            Address::Closure(idx) => {
                let cell = self.closure_cell(global, closure, idx)?;
                self.write_closure_value(global, cell, value)
            }
        }
    }

    /// Shifts the arguments above `func` up by one and places `first` as the
    /// new first argument, with `callee` in the function slot.
    pub(crate) fn insert_arg(
        &mut self,
        global: &mut GlobalState,
        func: usize,
        callee: Value,
        first: Value,
    ) -> Result<(), RuntimeError> {
        self.check_stack(global, 1)?;

        let top = self.stack.top;

        for slot in (func + 1..top).rev() {
            let value = self.stack.get(slot);
            self.stack.set(slot + 1, value)?;
        }

        self.stack.set(func, callee)?;
        self.stack.set(func + 1, first)?;
        self.stack.top = top + 1;

        Ok(())
    }

    /// Starts a call of the value at `func` whose arguments run up to the
    /// stack top. Returns `true` when a VM frame was pushed and still has to
    /// be executed; native calls complete before this returns.
    pub(crate) fn pre_call(
        &mut self,
        global: &mut GlobalState,
        func: usize,
        expected: u16,
    ) -> Result<bool, RuntimeError> {
        let callee = self.stack.get(func);

        match callee {
            Value::Closure(handle) => match global.gc.get(handle)? {
                HeapData::Closure(closure) => {
                    let function = Rc::clone(&closure.function);
                    self.enter_vm(global, func, function, Some(handle), expected)?;
                    Ok(true)
                }
                HeapData::NativeClosure(native) => {
                    let function = native.function;
                    self.call_native(global, func, function, Some(handle), expected)?;
                    Ok(false)
                }
                HeapData::BoundMethod(bound) => {
                    let (receiver, method) = (bound.receiver, bound.method);
                    self.insert_arg(global, func, method, receiver)?;
                    self.pre_call(global, func, expected)
                }
                _ => Err(ErrorKind::NotCallable(callee.ty()).into()),
            },
            Value::Function(handle) => {
                let function = global.gc.function(handle)?;
                self.enter_vm(global, func, function, None, expected)?;
                Ok(true)
            }
            Value::Object(handle) => match global.gc.get(handle)? {
                HeapData::Prototype(_) => {
                    self.construct(global, func, handle, expected)?;
                    Ok(false)
                }
                _ => match global.get_meta(callee, MetaMethod::Call)? {
                    Some(meta) => {
                        self.insert_arg(global, func, meta, callee)?;
                        self.pre_call(global, func, expected)
                    }
                    None => Err(ErrorKind::NotCallable(callee.ty()).into()),
                },
            },
            _ => Err(ErrorKind::NotCallable(callee.ty()).into()),
        }
    }

    fn enter_vm(
        &mut self,
        global: &mut GlobalState,
        func: usize,
        function: Rc<Function>,
        closure: Option<Handle>,
        expected: u16,
    ) -> Result<(), RuntimeError> {
        let nargs = self.stack.top.saturating_sub(func + 1);
        let params = function.parameter_count as usize;
        let size = (function.stack_size as usize).max(params + 1);

        self.check_stack(global, size + 1)?;

        let varargs = if function.has_variable_arguments && nargs > params {
            self.stack.values(func + 1 + params, func + 1 + nargs)
        } else {
            vec![]
        };

        self.stack
            .fill(func + 1 + nargs.min(params), func + 1 + size, Value::Null);

        if function.has_variable_arguments {
            let array = global.gc.alloc(HeapData::Array(varargs))?;
            self.stack.set(func + 1 + params, Value::Array(array))?;
        }

        let top = func + 1 + size;
        self.stack.top = top;
        self.call_infos
            .push_with(CallInfo::default)
            .vm_init(func, top, function, closure, expected);

        Ok(())
    }

    fn call_native(
        &mut self,
        global: &mut GlobalState,
        func: usize,
        function: NativeFn,
        closure: Option<Handle>,
        expected: u16,
    ) -> Result<(), RuntimeError> {
        self.check_stack(global, NATIVE_CALL_MIN)?;

        let top = self.stack.top + NATIVE_CALL_MIN;
        let saved_handler = self.handlers.len();

        self.call_infos
            .push_with(CallInfo::default)
            .entry_native_init(func, top, closure, saved_handler, expected);

        let count = function(self, global)?;
        let first = self
            .stack
            .top
            .checked_sub(count)
            .filter(|first| *first > func)
            .ok_or(ErrorKind::FrameCorrupted("native returned more values than it pushed"))?;

        self.post_call(global, first, count)
    }

    /// Calling a prototype builds an instance: every field starts as null,
    /// then the constructor metamethod runs with the instance as `this`.
    fn construct(
        &mut self,
        global: &mut GlobalState,
        func: usize,
        prototype: Handle,
        expected: u16,
    ) -> Result<(), RuntimeError> {
        let mut object = Object::with_prototype(prototype);

        for name in global.gc.instance_fields(prototype)? {
            object.set(Value::Str(name), Value::Null);
        }

        let instance = Value::Object(global.gc.alloc(HeapData::Object(object))?);

        if let Some(constructor) = global.gc.find_meta(prototype, MetaMethod::Constructor)? {
            self.insert_arg(global, func, constructor, instance)?;
            self.call(global, func, 0)?;
        }

        self.stack.set(func, instance)?;

        let wanted = if expected == MULTIPLE_RESULTS {
            1
        } else {
            expected as usize
        };

        for i in 1..wanted {
            self.stack.set(func + i, Value::Null)?;
        }

        self.stack.top = match self.call_infos.last() {
            Some(caller) if caller.is_vm() && expected != MULTIPLE_RESULTS => caller.top,
            _ => func + wanted,
        };

        Ok(())
    }

    /// Finishes the innermost frame: closes its cells and to-be-closed
    /// slots, moves `count` results from `first` to the frame base, pads
    /// them to the expected count and pops the frame.
    pub(crate) fn post_call(
        &mut self,
        global: &mut GlobalState,
        first: usize,
        count: usize,
    ) -> Result<(), RuntimeError> {
        let (base, expected) = {
            let ci = self.frame()?;
            (ci.base, ci.expected_returns)
        };

        if self.tbc_head > base || self.open_values.first().is_some_and(|(s, _)| *s > base) {
            self.close_closure(global, base + 1, None)?;
        }

        let wanted = if expected == MULTIPLE_RESULTS {
            count
        } else {
            expected as usize
        };

        if wanted > 0 {
            self.check_stack(global, (base + wanted).saturating_sub(self.stack.top))?;
        }

        for i in 0..wanted {
            let value = if i < count {
                self.stack.get(first + i)
            } else {
                Value::Null
            };

            self.stack.set(base + i, value)?;
        }

        let depth = self.call_infos.len() - 1;

        self.call_infos.pop();
        self.handlers.retain(|handler| handler.depth < depth);

        self.stack.top = match self.call_infos.last() {
            Some(caller) if caller.is_vm() && expected != MULTIPLE_RESULTS => caller.top,
            _ => base + wanted,
        };

        Ok(())
    }

    /// Value handed to script handlers for an error: the thrown value, or the
    /// error message as a string.
    pub(crate) fn error_value(
        &self,
        global: &mut GlobalState,
        error: &RuntimeError,
    ) -> Result<Value, RuntimeError> {
        match &error.kind {
            ErrorKind::Thrown(value) => Ok(*value),
            kind => Ok(Value::Str(global.gc.intern(&kind.to_string())?)),
        }
    }

    /// Converts `value` to text, honouring a `toString` metamethod.
    pub fn stringify(&mut self, global: &mut GlobalState, value: Value) -> Result<String, RuntimeError> {
        if let Value::Str(handle) = value {
            return Ok(global.gc.string(handle)?.to_string());
        }

        match global.get_meta(value, MetaMethod::ToString)? {
            Some(meta) => {
                let result = self.call_meta(global, meta, &[value], 1)?;
                Ok(ops::to_display(&global.gc, result))
            }
            None => Ok(ops::to_display(&global.gc, value)),
        }
    }

    pub fn backtrace(&self, global: &GlobalState) -> Vec<Call> {
        self.call_infos
            .iter()
            .rev()
            .filter_map(|ci| match &ci.function {
                Some(function) => Some(Call::new(ci.current_line(), function.name.clone())),
                None => ci
                    .closure
                    .and_then(|closure| match global.gc.get(closure) {
                        Ok(HeapData::NativeClosure(native)) => Some(native.name),
                        _ => None,
                    })
                    .map(|name| Call::new(None, name)),
            })
            .collect()
    }

    /// Unwinds every frame at or above `depth` after an error escaped them.
    fn unwind_to(&mut self, global: &mut GlobalState, depth: usize, func: usize, error: &RuntimeError) {
        self.unwinding = true;

        let value = self.error_value(global, error).unwrap_or_default();

        if let Err(e) = self.close_closure(global, func, Some(value)) {
            warn!(error = %e, "close metamethod failed while unwinding");
        }

        self.unwinding = false;
        self.call_infos.truncate(depth);
        self.handlers.retain(|handler| handler.depth < depth);
        self.open_values.retain(|(slot, _)| *slot < func);

        self.stack.top = match self.call_infos.last() {
            Some(caller) if caller.is_vm() => caller.top,
            _ => func,
        };
    }

    /// Calls the value at `func` with the arguments between it and the stack
    /// top. Results are left at `func..`. An exception that escapes the
    /// outermost call goes to the panic handler and becomes
    /// [`ErrorKind::Panic`].
    #[instrument(level = "trace", skip(self, global))]
    pub fn call(
        &mut self,
        global: &mut GlobalState,
        func: usize,
        expected: u16,
    ) -> Result<(), RuntimeError> {
        let entry_depth = self.call_infos.len();

        if self.nested == 0 {
            self.status = ThreadStatus::Fine;
        }

        self.nested += 1;

        let result = self
            .pre_call(global, func, expected)
            .and_then(|pushed| match pushed {
                true => self.execute(global, entry_depth),
                false => Ok(()),
            });

        self.nested -= 1;

        let Err(mut error) = result else {
            return Ok(());
        };

        if error.trace.is_none() {
            error.trace = Some(self.backtrace(global));
        }

        if error.line.is_none() {
            error.line = error
                .trace
                .as_ref()
                .and_then(|trace| trace.iter().find_map(|call| call.line));
        }

        self.unwind_to(global, entry_depth, func, &error);

        if self.nested > 0 {
            return Err(error);
        }

        self.status = match error.kind {
            ErrorKind::MemoryError => ThreadStatus::MemoryError,
            ErrorKind::Thrown(_) => ThreadStatus::ExceptionError,
            _ => ThreadStatus::RuntimeError,
        };

        if error.is_fatal() {
            return Err(error);
        }

        let value = self.error_value(global, &error)?;

        // a throwing toString must not re-enter the panic path
        self.nested += 1;

        let message = self
            .stringify(global, value)
            .unwrap_or_else(|_| ops::to_display(&global.gc, value));

        if let Some(mut handler) = global.take_panic_handler() {
            handler(self, global, value);
            global.restore_panic_handler(handler);
        }

        self.nested -= 1;
        self.status = ThreadStatus::ExceptionError;

        Err(RuntimeError {
            kind: ErrorKind::Panic(message),
            line: error.line,
            trace: error.trace,
        })
    }

    /// Calls `f` with `args` above the current stack top and returns its
    /// first result.
    pub fn call_meta(
        &mut self,
        global: &mut GlobalState,
        f: Value,
        args: &[Value],
        expected: u16,
    ) -> Result<Value, RuntimeError> {
        let func = self.stack.top;

        self.check_stack(global, args.len() + 1)?;
        self.stack.push(f)?;

        for arg in args {
            self.stack.push(*arg)?;
        }

        self.call(global, func, expected)?;

        let result = if expected > 0 {
            self.stack.get(func)
        } else {
            Value::Null
        };

        self.stack.top = func;

        Ok(result)
    }

    pub(crate) fn trace_roots(&self, marker: &mut Marker) {
        for value in self.stack.iter() {
            value.trace(marker);
        }

        for ci in self.call_infos.iter() {
            ci.closure.trace(marker);
        }

        for (_, handle) in self.open_values.iter() {
            marker.mark(*handle);
        }

        self.exception.trace(marker);

        for export in self.exports.iter() {
            export.value.trace(marker);
        }
    }
}

impl Drop for State {
    fn drop(&mut self) {
        self.live.set(self.live.get().saturating_sub(1));
    }
}
