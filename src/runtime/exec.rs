use std::{cmp::Ordering, rc::Rc};

#[cfg(feature = "dispatch-table")]
use lazy_static::lazy_static;

use crate::backend::{Const, Instruction, Op, ARGS_TO_TOP, MULTIPLE_RESULTS};

#[cfg(feature = "dispatch-table")]
use crate::backend::OP_COUNT;

use super::{
    call_info::{CallContext, CallStatus},
    closure::BoundMethod,
    error::{ErrorKind, RuntimeError},
    function::{AccessModifier, Function},
    gc::{Gc, Handle, HeapData},
    meta::MetaMethod,
    module::Export,
    object::Object,
    ops::{self, Arith},
    prototype::Member,
    state::{Handler, State},
    value::{Value, ValueType},
    GlobalState,
};

/// Cached view of the frame being executed.
pub(crate) struct ExecCtx {
    function: Rc<Function>,
    base: usize,
    closure: Option<Handle>,
    entry_depth: usize,
}

pub(crate) enum Flow {
    Next,
    /// The active frame changed; reload the context.
    Reenter,
    /// The entry frame returned.
    Exit,
}

#[cfg(feature = "dispatch-table")]
type OpHandler =
    fn(&mut State, &mut GlobalState, &mut ExecCtx, Instruction) -> Result<Flow, RuntimeError>;

#[derive(Debug, Clone, Copy)]
enum Cmp {
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
}

impl Cmp {
    fn symbol(&self) -> &'static str {
        match self {
            Cmp::Less => "<",
            Cmp::Greater => ">",
            Cmp::LessEqual => "<=",
            Cmp::GreaterEqual => ">=",
        }
    }

    fn test(&self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (_, None) => false,
            (Cmp::Less, Some(o)) => o.is_lt(),
            (Cmp::Greater, Some(o)) => o.is_gt(),
            (Cmp::LessEqual, Some(o)) => o.is_le(),
            (Cmp::GreaterEqual, Some(o)) => o.is_ge(),
        }
    }
}

pub(crate) fn const_value(global: &mut GlobalState, constant: &Const) -> Result<Value, RuntimeError> {
    Ok(match constant {
        Const::Null => Value::Null,
        Const::Bool(b) => Value::Bool(*b),
        Const::Int(i) => Value::Int64(*i),
        Const::UInt(u) => Value::UInt64(*u),
        Const::Float(f) => Value::Float64(*f),
        Const::Str(s) => Value::Str(global.gc.intern(s)?),
    })
}

fn invalid_key(global: &GlobalState, target: Value, key: Value) -> RuntimeError {
    ErrorKind::InvalidKey {
        ty: target.ty(),
        key: ops::to_display(&global.gc, key),
    }
    .into()
}

fn index(key: Value, len: usize) -> Result<Option<usize>, RuntimeError> {
    match key.as_i128() {
        Some(i) if i >= 0 && (i as usize) < len => Ok(Some(i as usize)),
        Some(i) => Err(ErrorKind::IndexOutOfBounds(i).into()),
        None => Ok(None),
    }
}

impl State {
    /// Runs VM frames until the frame at `entry_depth` returns. Errors are
    /// delivered to the innermost `TRY` owned by this invocation.
    pub(crate) fn execute(
        &mut self,
        global: &mut GlobalState,
        entry_depth: usize,
    ) -> Result<(), RuntimeError> {
        #[cfg(feature = "profiler")]
        self.profiler.enter();

        loop {
            let Err(mut error) = self.run(global, entry_depth) else {
                return Ok(());
            };

            if error.line.is_none() {
                error.line = self.call_infos.last().and_then(|ci| ci.current_line());
            }

            if error.is_fatal() {
                error.trace = Some(self.backtrace(global));
                return Err(error);
            }

            match self.handlers.last() {
                Some(handler) if handler.depth >= entry_depth => self.catch(global, error)?,
                _ => return Err(error),
            }
        }
    }

    fn catch(&mut self, global: &mut GlobalState, error: RuntimeError) -> Result<(), RuntimeError> {
        let handler = self
            .handlers
            .pop()
            .ok_or(ErrorKind::FrameCorrupted("no exception handler"))?;
        let value = self.error_value(global, &error)?;

        self.unwinding = true;
        let closed = self.close_closure(global, handler.level, Some(value));
        self.unwinding = false;
        closed?;

        self.call_infos.truncate(handler.depth + 1);

        let ci = self.frame_mut()?;
        let top = ci.top;

        match &mut ci.context {
            CallContext::Vm { pc, trap, .. } => {
                *pc = handler.pc;
                *trap = true;
            }
            CallContext::Native { .. } => {
                return Err(ErrorKind::FrameCorrupted("handler owned by native frame").into())
            }
        }

        self.stack.top = top;
        self.exception = value;

        Ok(())
    }

    fn load_ctx(&self, entry_depth: usize) -> Result<ExecCtx, RuntimeError> {
        let ci = self.frame()?;
        let function = ci
            .function
            .clone()
            .ok_or(ErrorKind::FrameCorrupted("vm frame without function"))?;

        Ok(ExecCtx {
            function,
            base: ci.base,
            closure: ci.closure,
            entry_depth,
        })
    }

    fn run(&mut self, global: &mut GlobalState, entry_depth: usize) -> Result<(), RuntimeError> {
        let mut ctx = self.load_ctx(entry_depth)?;

        loop {
            if global.gc.ready && global.live_states() <= 1 {
                global.collect(self);
            }

            let instr = self.fetch(&mut ctx)?;

            #[cfg(feature = "profiler")]
            self.profiler.record_instruction(instr.op);

            match dispatch(self, global, &mut ctx, instr)? {
                Flow::Next => {}
                Flow::Reenter => ctx = self.load_ctx(entry_depth)?,
                Flow::Exit => return Ok(()),
            }
        }
    }

    #[inline]
    fn fetch(&mut self, ctx: &mut ExecCtx) -> Result<Instruction, RuntimeError> {
        let ci = self
            .call_infos
            .last_mut()
            .ok_or(ErrorKind::FrameCorrupted("no active frame"))?;
        let CallContext::Vm { pc, trap, .. } = &mut ci.context else {
            return Err(ErrorKind::FrameCorrupted("native frame in vm loop").into());
        };

        if *trap {
            *trap = false;
            ctx.base = ci.base;

            if self.interrupted {
                self.interrupted = false;
                return Err(ErrorKind::Interrupted.into());
            }
        }

        let instr = ctx
            .function
            .instructions
            .get(*pc)
            .copied()
            .ok_or(ErrorKind::FrameCorrupted("pc out of range"))?;

        *pc += 1;

        Ok(instr)
    }

    fn jump(&mut self, offset: i32) -> Result<(), RuntimeError> {
        match &mut self.frame_mut()?.context {
            CallContext::Vm { pc, .. } => {
                *pc = pc
                    .checked_add_signed(offset as isize)
                    .ok_or(ErrorKind::FrameCorrupted("jump before function start"))?;
                Ok(())
            }
            CallContext::Native { .. } => {
                Err(ErrorKind::FrameCorrupted("jump in native frame").into())
            }
        }
    }

    fn pc(&self) -> Result<usize, RuntimeError> {
        Ok(self.frame()?.pc())
    }

    #[inline]
    fn reg(&self, ctx: &ExecCtx, slot: u16) -> Value {
        self.stack.get(ctx.base + 1 + slot as usize)
    }

    #[inline]
    fn set_reg(
        &mut self,
        global: &GlobalState,
        ctx: &ExecCtx,
        slot: u16,
        value: Value,
    ) -> Result<(), RuntimeError> {
        self.stack
            .set_value(&global.gc, ctx.base + 1 + slot as usize, value)
    }

    #[inline]
    fn operands(&self, ctx: &ExecCtx, instr: Instruction) -> (Value, Value) {
        let (lhs, rhs) = instr.u16x2();
        (self.reg(ctx, lhs), self.reg(ctx, rhs))
    }

    fn unary_operand(&self, ctx: &ExecCtx, instr: Instruction) -> Result<Value, RuntimeError> {
        let slot = u16::try_from(instr.i32())
            .map_err(|_| ErrorKind::InvalidOperand(instr.i32() as i64))?;
        Ok(self.reg(ctx, slot))
    }

    /// Calls the binary metamethod of `lhs`, else of `rhs`.
    fn binary_meta(
        &mut self,
        global: &mut GlobalState,
        meta: MetaMethod,
        lhs: Value,
        rhs: Value,
    ) -> Result<Option<Value>, RuntimeError> {
        let method = match global.get_meta(lhs, meta)? {
            Some(method) => Some(method),
            None => global.get_meta(rhs, meta)?,
        };

        match method {
            Some(method) => self.call_meta(global, method, &[lhs, rhs], 1).map(Some),
            None => Ok(None),
        }
    }

    fn arith_or_meta(
        &mut self,
        global: &mut GlobalState,
        op: Arith,
        lhs: Value,
        rhs: Value,
    ) -> Result<Value, RuntimeError> {
        if let Some(value) = ops::arith(op, lhs, rhs)? {
            return Ok(value);
        }

        if matches!(op, Arith::Add)
            && (matches!(lhs, Value::Str(_)) || matches!(rhs, Value::Str(_)))
            && global.get_meta(lhs, MetaMethod::Add)?.is_none()
        {
            return self.concat(global, lhs, rhs);
        }

        self.binary_meta(global, op.meta(), lhs, rhs)?.ok_or_else(|| {
            ErrorKind::UnsupportedOp {
                left: lhs.ty(),
                right: rhs.ty(),
                op: op.symbol(),
            }
            .into()
        })
    }

    fn concat(&mut self, global: &mut GlobalState, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
        let mut s = ops::to_display(&global.gc, lhs);
        s.push_str(&ops::to_display(&global.gc, rhs));

        Ok(Value::Str(global.gc.intern(&s)?))
    }

    fn compare_or_meta(
        &mut self,
        global: &mut GlobalState,
        cmp: Cmp,
        lhs: Value,
        rhs: Value,
    ) -> Result<bool, RuntimeError> {
        if let Some(ordering) = ops::compare(&global.gc, lhs, rhs)? {
            return Ok(cmp.test(Some(ordering)));
        }

        if lhs.is_number() && rhs.is_number() {
            return Ok(false);
        }

        let result = match cmp {
            Cmp::Less => self.binary_meta(global, MetaMethod::Less, lhs, rhs)?,
            Cmp::Greater => self.binary_meta(global, MetaMethod::Less, rhs, lhs)?,
            Cmp::LessEqual => self.binary_meta(global, MetaMethod::LessEqual, lhs, rhs)?,
            Cmp::GreaterEqual => self.binary_meta(global, MetaMethod::LessEqual, rhs, lhs)?,
        };

        result.map(|value| value.is_truthy()).ok_or_else(|| {
            ErrorKind::UnsupportedOp {
                left: lhs.ty(),
                right: rhs.ty(),
                op: cmp.symbol(),
            }
            .into()
        })
    }

    fn equals_or_meta(
        &mut self,
        global: &mut GlobalState,
        lhs: Value,
        rhs: Value,
    ) -> Result<bool, RuntimeError> {
        if ops::equals(lhs, rhs) {
            return Ok(true);
        }

        if let (Value::Object(_), Value::Object(_)) = (lhs, rhs) {
            if let Some(method) = global.get_meta(lhs, MetaMethod::Equal)? {
                return Ok(self.call_meta(global, method, &[lhs, rhs], 1)?.is_truthy());
            }
        }

        Ok(false)
    }

    fn unary_meta(
        &mut self,
        global: &mut GlobalState,
        meta: MetaMethod,
        value: Value,
    ) -> Result<Option<Value>, RuntimeError> {
        match global.get_meta(value, meta)? {
            Some(method) => self.call_meta(global, method, &[value], 1).map(Some),
            None => Ok(None),
        }
    }

    /// Member lookup shared by `GET_VALUE` and native helpers.
    pub fn get_member(
        &mut self,
        global: &mut GlobalState,
        target: Value,
        key: Value,
    ) -> Result<Value, RuntimeError> {
        match target {
            Value::Object(handle) => {
                let found = match global.gc.get(handle)? {
                    HeapData::Object(object) => match object.get(key) {
                        Some(value) => return Ok(value),
                        None => match object.prototype {
                            Some(prototype) => global.gc.find_member(prototype, key)?,
                            None => None,
                        },
                    },
                    HeapData::Module(module) => {
                        return Ok(module.get_pub_export(key).unwrap_or_default())
                    }
                    HeapData::Prototype(_) => {
                        return Ok(match global.gc.find_member(handle, key)? {
                            Some(Member::Method(value) | Member::Static(value)) => value,
                            None => Value::Null,
                        })
                    }
                    _ => return Err(invalid_key(global, target, key)),
                };

                match found {
                    Some(Member::Method(method)) => {
                        let bound = global.gc.alloc(HeapData::BoundMethod(BoundMethod {
                            receiver: target,
                            method,
                        }))?;

                        Ok(Value::Closure(bound))
                    }
                    Some(Member::Static(value)) => Ok(value),
                    None => Ok(Value::Null),
                }
            }
            Value::Array(handle) => {
                let items = global.gc.array(handle)?;

                if let Some(idx) = index(key, items.len())? {
                    return Ok(items[idx]);
                }

                match key {
                    Value::Str(s) if global.gc.string(s)? == "length" => {
                        Ok(Value::Int64(items.len() as i64))
                    }
                    _ => Err(invalid_key(global, target, key)),
                }
            }
            Value::Str(handle) => {
                let s = global.gc.string(handle)?;
                let len = s.chars().count();

                if let Some(idx) = index(key, len)? {
                    let c = s.chars().nth(idx).map(String::from).unwrap_or_default();
                    return Ok(Value::Str(global.gc.intern(&c)?));
                }

                match key {
                    Value::Str(k) if global.gc.string(k)? == "length" => {
                        Ok(Value::Int64(len as i64))
                    }
                    _ => Err(invalid_key(global, target, key)),
                }
            }
            _ => Err(invalid_key(global, target, key)),
        }
    }

    pub fn set_member(
        &mut self,
        global: &mut GlobalState,
        target: Value,
        key: Value,
        value: Value,
    ) -> Result<(), RuntimeError> {
        match target {
            Value::Object(handle) => {
                match global.gc.get_mut(handle)? {
                    HeapData::Object(object) => object.set(key, value),
                    HeapData::Prototype(prototype) => prototype.statics.set(key, value),
                    _ => return Err(invalid_key(global, target, key)),
                }

                global.gc.resize(handle)
            }
            Value::Array(handle) => {
                let items = global.gc.array_mut(handle)?;
                let len = items.len();

                match key.as_i128() {
                    Some(i) if i >= 0 && (i as usize) < len => {
                        items[i as usize] = value;
                        Ok(())
                    }
                    Some(i) if i >= 0 && i as usize == len => {
                        items.push(value);
                        global.gc.resize(handle)
                    }
                    Some(i) => Err(ErrorKind::IndexOutOfBounds(i).into()),
                    None => Err(invalid_key(global, target, key)),
                }
            }
            _ => Err(invalid_key(global, target, key)),
        }
    }

    fn op_nop(
        &mut self,
        _global: &mut GlobalState,
        _ctx: &mut ExecCtx,
        _instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        Ok(Flow::Next)
    }

    fn op_get_stack(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let value = self.read_operand(global, ctx.base, ctx.closure, instr.i32())?;
        self.set_reg(global, ctx, instr.extra, value)?;
        Ok(Flow::Next)
    }

    fn op_set_stack(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let value = self.reg(ctx, instr.extra);
        self.write_operand(global, ctx.base, ctx.closure, instr.i32(), value)?;
        Ok(Flow::Next)
    }

    fn op_get_constant(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let idx = instr.operand as usize;
        let constant = ctx
            .function
            .constants
            .get(idx)
            .ok_or(ErrorKind::InvalidConstant(idx))?;
        let value = const_value(global, constant)?;

        self.set_reg(global, ctx, instr.extra, value)?;
        Ok(Flow::Next)
    }

    fn op_get_closure(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let cell = self.closure_cell(global, ctx.closure, instr.operand as usize)?;
        let value = self.read_closure_value(global, cell)?;

        self.set_reg(global, ctx, instr.extra, value)?;
        Ok(Flow::Next)
    }

    fn op_set_closure(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let cell = self.closure_cell(global, ctx.closure, instr.operand as usize)?;
        let value = self.reg(ctx, instr.extra);

        self.write_closure_value(global, cell, value)?;
        Ok(Flow::Next)
    }

    fn op_get_value(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let (target, key) = self.operands(ctx, instr);
        let value = self.get_member(global, target, key)?;

        self.set_reg(global, ctx, instr.extra, value)?;
        Ok(Flow::Next)
    }

    fn op_set_value(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let (target, key) = self.operands(ctx, instr);
        let value = self.reg(ctx, instr.extra);

        self.set_member(global, target, key, value)?;
        Ok(Flow::Next)
    }

    fn op_get_prototype(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let function = Rc::clone(&ctx.function);
        let value = self.get_prototype(
            global,
            ctx.base,
            ctx.closure,
            &function,
            instr.operand as usize,
        )?;

        self.set_reg(global, ctx, instr.extra, value)?;
        Ok(Flow::Next)
    }

    fn op_to_bool(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let value = self.unary_operand(ctx, instr)?;
        let result = match self.unary_meta(global, MetaMethod::ToBool, value)? {
            Some(result) => Value::Bool(result.is_truthy()),
            None => Value::Bool(value.is_truthy()),
        };

        self.set_reg(global, ctx, instr.extra, result)?;
        Ok(Flow::Next)
    }

    fn convert(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
        meta: MetaMethod,
        convert: fn(&Gc, Value) -> Result<Value, RuntimeError>,
    ) -> Result<Flow, RuntimeError> {
        let value = self.unary_operand(ctx, instr)?;
        let result = match self.unary_meta(global, meta, value)? {
            Some(result) => convert(&global.gc, result)?,
            None => convert(&global.gc, value)?,
        };

        self.set_reg(global, ctx, instr.extra, result)?;
        Ok(Flow::Next)
    }

    fn op_to_int(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        self.convert(global, ctx, instr, MetaMethod::ToInt, ops::to_int)
    }

    fn op_to_uint(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        self.convert(global, ctx, instr, MetaMethod::ToUInt, ops::to_uint)
    }

    fn op_to_float(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        self.convert(global, ctx, instr, MetaMethod::ToFloat, ops::to_float)
    }

    fn op_to_string(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let value = self.unary_operand(ctx, instr)?;
        let result = match value {
            Value::Str(_) => value,
            _ => match self.unary_meta(global, MetaMethod::ToString, value)? {
                Some(result @ Value::Str(_)) => result,
                Some(other) => Value::Str(global.gc.intern(&ops::to_display(&global.gc, other))?),
                None => Value::Str(global.gc.intern(&ops::to_display(&global.gc, value))?),
            },
        };

        self.set_reg(global, ctx, instr.extra, result)?;
        Ok(Flow::Next)
    }

    fn op_add_string(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let (lhs, rhs) = self.operands(ctx, instr);

        let (Value::Str(_), Value::Str(_)) = (lhs, rhs) else {
            return Err(ErrorKind::TypeMismatch {
                op: instr.op,
                left: lhs.ty(),
                right: rhs.ty(),
            }
            .into());
        };

        let value = self.concat(global, lhs, rhs)?;

        self.set_reg(global, ctx, instr.extra, value)?;
        Ok(Flow::Next)
    }

    fn op_neg(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let value = self.unary_operand(ctx, instr)?;
        let result = match ops::negate(value) {
            Some(result) => result,
            None => self
                .unary_meta(global, MetaMethod::Neg, value)?
                .ok_or(ErrorKind::UnsupportedUnaryOp {
                    ty: value.ty(),
                    op: "-",
                })?,
        };

        self.set_reg(global, ctx, instr.extra, result)?;
        Ok(Flow::Next)
    }

    fn op_bitwise_not(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let value = self.unary_operand(ctx, instr)?;
        let result = match ops::bitwise_not(value) {
            Some(result) => result,
            None => self
                .unary_meta(global, MetaMethod::BitwiseNot, value)?
                .ok_or(ErrorKind::UnsupportedUnaryOp {
                    ty: value.ty(),
                    op: "~",
                })?,
        };

        self.set_reg(global, ctx, instr.extra, result)?;
        Ok(Flow::Next)
    }

    fn op_logical_not(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let value = self.unary_operand(ctx, instr)?;
        self.set_reg(global, ctx, instr.extra, Value::Bool(!value.is_truthy()))?;
        Ok(Flow::Next)
    }

    fn op_logical_and(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let (lhs, rhs) = self.operands(ctx, instr);
        let result = Value::Bool(lhs.is_truthy() && rhs.is_truthy());

        self.set_reg(global, ctx, instr.extra, result)?;
        Ok(Flow::Next)
    }

    fn op_logical_or(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let (lhs, rhs) = self.operands(ctx, instr);
        let result = Value::Bool(lhs.is_truthy() || rhs.is_truthy());

        self.set_reg(global, ctx, instr.extra, result)?;
        Ok(Flow::Next)
    }

    fn op_logical_equal(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let (lhs, rhs) = self.operands(ctx, instr);
        let result = self.equals_or_meta(global, lhs, rhs)?;

        self.set_reg(global, ctx, instr.extra, Value::Bool(result))?;
        Ok(Flow::Next)
    }

    fn op_logical_not_equal(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let (lhs, rhs) = self.operands(ctx, instr);
        let result = self.equals_or_meta(global, lhs, rhs)?;

        self.set_reg(global, ctx, instr.extra, Value::Bool(!result))?;
        Ok(Flow::Next)
    }

    fn op_function_call(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let func = ctx.base + 1 + instr.extra as usize;
        let (nargs, expected) = instr.u16x2();

        if nargs != ARGS_TO_TOP {
            self.stack.top = func + 1 + nargs as usize;
        }

        match self.pre_call(global, func, expected)? {
            true => Ok(Flow::Reenter),
            false => Ok(Flow::Next),
        }
    }

    /// Unwraps bound methods and `call` metamethods in place until the
    /// function slot holds a closure, function, native or prototype.
    fn resolve_callee(&mut self, global: &mut GlobalState, func: usize) -> Result<Value, RuntimeError> {
        loop {
            let callee = self.stack.get(func);

            let (method, receiver) = match callee {
                Value::Closure(handle) => match global.gc.get(handle)? {
                    HeapData::BoundMethod(bound) => (bound.method, bound.receiver),
                    _ => return Ok(callee),
                },
                Value::Object(handle) => match global.gc.get(handle)? {
                    HeapData::Prototype(_) => return Ok(callee),
                    _ => match global.get_meta(callee, MetaMethod::Call)? {
                        Some(meta) => (meta, callee),
                        None => return Err(ErrorKind::NotCallable(callee.ty()).into()),
                    },
                },
                Value::Function(_) => return Ok(callee),
                _ => return Err(ErrorKind::NotCallable(callee.ty()).into()),
            };

            self.insert_arg(global, func, method, receiver)?;
        }
    }

    /// A VM callee replaces the running frame; anything else is called
    /// normally and its results are returned right away.
    fn op_function_tail_call(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let func = ctx.base + 1 + instr.extra as usize;
        let (nargs, _) = instr.u16x2();

        if nargs != ARGS_TO_TOP {
            self.stack.top = func + 1 + nargs as usize;
        }

        let callee = self.resolve_callee(global, func)?;
        let is_vm = match callee {
            Value::Closure(handle) => matches!(global.gc.get(handle)?, HeapData::Closure(_)),
            Value::Function(_) => true,
            _ => false,
        };

        if !is_vm {
            self.pre_call(global, func, MULTIPLE_RESULTS)?;

            let count = self.stack.top.saturating_sub(func);
            return self.return_values(global, ctx, func, count);
        }

        let (base, expected, depth) = {
            let ci = self.frame()?;
            (ci.base, ci.expected_returns, self.call_infos.len() - 1)
        };

        self.close_closure(global, base + 1, None)?;

        let count = self.stack.top - func;

        for i in 0..count {
            let value = self.stack.get(func + i);
            self.stack.set(base + i, value)?;
        }

        self.stack.top = base + count;
        self.call_infos.pop();
        self.handlers.retain(|handler| handler.depth < depth);

        if !self.pre_call(global, base, expected)? {
            return Err(ErrorKind::FrameCorrupted("tail call did not enter a vm frame").into());
        }

        self.frame_mut()?.status.insert(CallStatus::TAIL_CALL);

        Ok(Flow::Reenter)
    }

    fn return_values(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        first: usize,
        count: usize,
    ) -> Result<Flow, RuntimeError> {
        if !ctx.function.exported_variables.is_empty() {
            self.exports = ctx
                .function
                .exported_variables
                .iter()
                .filter(|export| export.access != AccessModifier::Private)
                .map(|export| Export {
                    name: export.name.clone(),
                    value: self.stack.get(ctx.base + 1 + export.stack_slot as usize),
                    access: export.access,
                })
                .collect();
        }

        self.post_call(global, first, count)?;

        if self.call_infos.len() <= ctx.entry_depth {
            Ok(Flow::Exit)
        } else {
            Ok(Flow::Reenter)
        }
    }

    fn op_function_return(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let first = ctx.base + 1 + instr.extra as usize;
        let (count, _) = instr.u16x2();
        let count = match count {
            ARGS_TO_TOP => self.stack.top.saturating_sub(first),
            n => n as usize,
        };

        self.return_values(global, ctx, first, count)
    }

    fn op_jump(
        &mut self,
        _global: &mut GlobalState,
        _ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        self.jump(instr.i32())?;
        Ok(Flow::Next)
    }

    fn op_jump_if(
        &mut self,
        _global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        if self.reg(ctx, instr.extra).is_truthy() {
            self.jump(instr.i32())?;
        }

        Ok(Flow::Next)
    }

    fn op_jump_if_not(
        &mut self,
        _global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        if !self.reg(ctx, instr.extra).is_truthy() {
            self.jump(instr.i32())?;
        }

        Ok(Flow::Next)
    }

    fn op_create_closure(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let idx = instr.operand as usize;
        let child = ctx
            .function
            .child_functions
            .get(idx)
            .cloned()
            .ok_or(ErrorKind::InvalidChild(idx))?;
        let closure = self.create_closure(global, ctx.base, ctx.closure, child)?;

        self.set_reg(global, ctx, instr.extra, Value::Closure(closure))?;
        Ok(Flow::Next)
    }

    fn op_create_object(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let object = global.gc.alloc(HeapData::Object(Object::default()))?;

        self.set_reg(global, ctx, instr.extra, Value::Object(object))?;
        Ok(Flow::Next)
    }

    fn op_create_array(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let (first, count) = instr.u16x2();
        let from = ctx.base + 1 + first as usize;
        let to = match count {
            ARGS_TO_TOP => self.stack.top,
            n => from + n as usize,
        };
        let items = self.stack.values(from, to);
        let array = global.gc.alloc(HeapData::Array(items))?;

        self.stack.top = self.frame()?.top;
        self.set_reg(global, ctx, instr.extra, Value::Array(array))?;
        Ok(Flow::Next)
    }

    fn op_try(
        &mut self,
        _global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let pc = self
            .pc()?
            .checked_add_signed(instr.i32() as isize)
            .ok_or(ErrorKind::FrameCorrupted("catch target before function start"))?;

        self.handlers.push(Handler {
            depth: self.call_infos.len() - 1,
            pc,
            level: ctx.base + 1 + instr.extra as usize,
        });

        Ok(Flow::Next)
    }

    fn op_end_try(
        &mut self,
        _global: &mut GlobalState,
        _ctx: &mut ExecCtx,
        _instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let depth = self.call_infos.len() - 1;

        if self.handlers.last().is_some_and(|h| h.depth == depth) {
            self.handlers.pop();
        }

        Ok(Flow::Next)
    }

    fn op_throw(
        &mut self,
        _global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        Err(ErrorKind::Thrown(self.reg(ctx, instr.extra)).into())
    }

    fn op_catch(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        let exception = std::mem::take(&mut self.exception);

        self.set_reg(global, ctx, instr.extra, exception)?;
        Ok(Flow::Next)
    }

    fn op_mark_to_be_closed(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        self.to_be_closed_new(global, ctx.base + 1 + instr.extra as usize)?;
        Ok(Flow::Next)
    }

    fn op_close_scope(
        &mut self,
        global: &mut GlobalState,
        ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        self.close_closure(global, ctx.base + 1 + instr.extra as usize, None)?;
        Ok(Flow::Next)
    }

    fn op_invalid(
        &mut self,
        _global: &mut GlobalState,
        _ctx: &mut ExecCtx,
        instr: Instruction,
    ) -> Result<Flow, RuntimeError> {
        Err(ErrorKind::InvalidInstruction(instr.op).into())
    }
}

macro_rules! impl_arith {
    ($(($op:ident: $arith:ident)),+ $(,)?) => {
        pastey::paste! {
            impl State {
                $(fn [<op_ $op>](
                    &mut self,
                    global: &mut GlobalState,
                    ctx: &mut ExecCtx,
                    instr: Instruction,
                ) -> Result<Flow, RuntimeError> {
                    let (lhs, rhs) = self.operands(ctx, instr);
                    let value = self.arith_or_meta(global, Arith::$arith, lhs, rhs)?;

                    self.set_reg(global, ctx, instr.extra, value)?;
                    Ok(Flow::Next)
                })+
            }
        }
    };
}

macro_rules! impl_specialised {
    ($(($op:ident: $f:ident, $arith:ident)),+ $(,)?) => {
        pastey::paste! {
            impl State {
                $(fn [<op_ $op>](
                    &mut self,
                    global: &mut GlobalState,
                    ctx: &mut ExecCtx,
                    instr: Instruction,
                ) -> Result<Flow, RuntimeError> {
                    let (lhs, rhs) = self.operands(ctx, instr);
                    let value = ops::$f(instr.op, Arith::$arith, lhs, rhs)?;

                    self.set_reg(global, ctx, instr.extra, value)?;
                    Ok(Flow::Next)
                })+
            }
        }
    };
}

macro_rules! impl_compare {
    ($(($op:ident: $cmp:ident)),+ $(,)?) => {
        pastey::paste! {
            impl State {
                $(fn [<op_ $op>](
                    &mut self,
                    global: &mut GlobalState,
                    ctx: &mut ExecCtx,
                    instr: Instruction,
                ) -> Result<Flow, RuntimeError> {
                    let (lhs, rhs) = self.operands(ctx, instr);
                    let result = self.compare_or_meta(global, Cmp::$cmp, lhs, rhs)?;

                    self.set_reg(global, ctx, instr.extra, Value::Bool(result))?;
                    Ok(Flow::Next)
                })+
            }
        }
    };
}

macro_rules! impl_compare_typed {
    ($(($op:ident: $cmp:ident, $check:ident)),+ $(,)?) => {
        pastey::paste! {
            impl State {
                $(fn [<op_ $op>](
                    &mut self,
                    global: &mut GlobalState,
                    ctx: &mut ExecCtx,
                    instr: Instruction,
                ) -> Result<Flow, RuntimeError> {
                    let (lhs, rhs) = self.operands(ctx, instr);
                    let ordering = ops::compare_typed(instr.op, lhs, rhs, ValueType::$check)?;

                    self.set_reg(global, ctx, instr.extra, Value::Bool(Cmp::$cmp.test(ordering)))?;
                    Ok(Flow::Next)
                })+
            }
        }
    };
}

impl_arith!(
    (add: Add),
    (sub: Sub),
    (mul: Mul),
    (div: Div),
    (mod: Mod),
    (pow: Pow),
    (shift_left: Shl),
    (shift_right: Shr),
    (bitwise_and: BitAnd),
    (bitwise_or: BitOr),
    (bitwise_xor: BitXor),
);

impl_specialised!(
    (add_int: arith_int, Add),
    (add_float: arith_float, Add),
    (sub_int: arith_int, Sub),
    (sub_float: arith_float, Sub),
    (mul_signed: arith_signed, Mul),
    (mul_unsigned: arith_unsigned, Mul),
    (mul_float: arith_float, Mul),
    (div_signed: arith_signed, Div),
    (div_unsigned: arith_unsigned, Div),
    (div_float: arith_float, Div),
    (mod_signed: arith_signed, Mod),
    (mod_unsigned: arith_unsigned, Mod),
    (mod_float: arith_float, Mod),
    (pow_signed: arith_signed, Pow),
    (pow_unsigned: arith_unsigned, Pow),
    (pow_float: arith_float, Pow),
    (shift_left_int: arith_int, Shl),
    (shift_right_int: arith_int, Shr),
);

impl_compare!(
    (logical_greater: Greater),
    (logical_less: Less),
    (logical_greater_equal: GreaterEqual),
    (logical_less_equal: LessEqual),
);

impl_compare_typed!(
    (logical_greater_signed: Greater, is_signed_int),
    (logical_greater_unsigned: Greater, is_unsigned_int),
    (logical_greater_float: Greater, is_float),
    (logical_less_signed: Less, is_signed_int),
    (logical_less_unsigned: Less, is_unsigned_int),
    (logical_less_float: Less, is_float),
    (logical_greater_equal_signed: GreaterEqual, is_signed_int),
    (logical_greater_equal_unsigned: GreaterEqual, is_unsigned_int),
    (logical_greater_equal_float: GreaterEqual, is_float),
    (logical_less_equal_signed: LessEqual, is_signed_int),
    (logical_less_equal_unsigned: LessEqual, is_unsigned_int),
    (logical_less_equal_float: LessEqual, is_float),
);

/// Maps every opcode to its handler, either through a `match` or through a
/// table of function pointers built once.
macro_rules! dispatch {
    ($(($op:ident: $handler:ident)),+ $(,)?) => {
        #[cfg(not(feature = "dispatch-table"))]
        #[inline(always)]
        fn dispatch(
            state: &mut State,
            global: &mut GlobalState,
            ctx: &mut ExecCtx,
            instr: Instruction,
        ) -> Result<Flow, RuntimeError> {
            match instr.op {
                $(Op::$op => state.$handler(global, ctx, instr),)+
                Op::Invalid => state.op_invalid(global, ctx, instr),
            }
        }

        #[cfg(feature = "dispatch-table")]
        lazy_static! {
            static ref DISPATCH_TABLE: [OpHandler; OP_COUNT] = {
                let mut table: [OpHandler; OP_COUNT] = [State::op_invalid as OpHandler; OP_COUNT];
                $(table[u16::from(Op::$op) as usize] = State::$handler;)+
                table
            };
        }

        #[cfg(feature = "dispatch-table")]
        #[inline(always)]
        fn dispatch(
            state: &mut State,
            global: &mut GlobalState,
            ctx: &mut ExecCtx,
            instr: Instruction,
        ) -> Result<Flow, RuntimeError> {
            DISPATCH_TABLE[u16::from(instr.op) as usize](state, global, ctx, instr)
        }
    };
}

dispatch!(
    (Nop: op_nop),
    (GetStack: op_get_stack),
    (SetStack: op_set_stack),
    (GetConstant: op_get_constant),
    (GetClosure: op_get_closure),
    (SetClosure: op_set_closure),
    (GetValue: op_get_value),
    (SetValue: op_set_value),
    (GetPrototype: op_get_prototype),
    (ToBool: op_to_bool),
    (ToInt: op_to_int),
    (ToUInt: op_to_uint),
    (ToFloat: op_to_float),
    (ToString: op_to_string),
    (Add: op_add),
    (AddInt: op_add_int),
    (AddFloat: op_add_float),
    (AddString: op_add_string),
    (Sub: op_sub),
    (SubInt: op_sub_int),
    (SubFloat: op_sub_float),
    (Mul: op_mul),
    (MulSigned: op_mul_signed),
    (MulUnsigned: op_mul_unsigned),
    (MulFloat: op_mul_float),
    (Div: op_div),
    (DivSigned: op_div_signed),
    (DivUnsigned: op_div_unsigned),
    (DivFloat: op_div_float),
    (Mod: op_mod),
    (ModSigned: op_mod_signed),
    (ModUnsigned: op_mod_unsigned),
    (ModFloat: op_mod_float),
    (Pow: op_pow),
    (PowSigned: op_pow_signed),
    (PowUnsigned: op_pow_unsigned),
    (PowFloat: op_pow_float),
    (Neg: op_neg),
    (ShiftLeft: op_shift_left),
    (ShiftLeftInt: op_shift_left_int),
    (ShiftRight: op_shift_right),
    (ShiftRightInt: op_shift_right_int),
    (LogicalNot: op_logical_not),
    (LogicalAnd: op_logical_and),
    (LogicalOr: op_logical_or),
    (LogicalEqual: op_logical_equal),
    (LogicalNotEqual: op_logical_not_equal),
    (LogicalGreater: op_logical_greater),
    (LogicalGreaterSigned: op_logical_greater_signed),
    (LogicalGreaterUnsigned: op_logical_greater_unsigned),
    (LogicalGreaterFloat: op_logical_greater_float),
    (LogicalLess: op_logical_less),
    (LogicalLessSigned: op_logical_less_signed),
    (LogicalLessUnsigned: op_logical_less_unsigned),
    (LogicalLessFloat: op_logical_less_float),
    (LogicalGreaterEqual: op_logical_greater_equal),
    (LogicalGreaterEqualSigned: op_logical_greater_equal_signed),
    (LogicalGreaterEqualUnsigned: op_logical_greater_equal_unsigned),
    (LogicalGreaterEqualFloat: op_logical_greater_equal_float),
    (LogicalLessEqual: op_logical_less_equal),
    (LogicalLessEqualSigned: op_logical_less_equal_signed),
    (LogicalLessEqualUnsigned: op_logical_less_equal_unsigned),
    (LogicalLessEqualFloat: op_logical_less_equal_float),
    (BitwiseNot: op_bitwise_not),
    (BitwiseAnd: op_bitwise_and),
    (BitwiseOr: op_bitwise_or),
    (BitwiseXor: op_bitwise_xor),
    (FunctionCall: op_function_call),
    (FunctionTailCall: op_function_tail_call),
    (FunctionReturn: op_function_return),
    (Jump: op_jump),
    (JumpIf: op_jump_if),
    (JumpIfNot: op_jump_if_not),
    (CreateClosure: op_create_closure),
    (CreateObject: op_create_object),
    (CreateArray: op_create_array),
    (Try: op_try),
    (EndTry: op_end_try),
    (Throw: op_throw),
    (Catch: op_catch),
    (MarkToBeClosed: op_mark_to_be_closed),
    (CloseScope: op_close_scope),
);
