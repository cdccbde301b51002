use crate::{
    error::IntoSpanned,
    frontend::ast::{AssignOp, BinaryOp, Expr, ExprKind, Literal, ObjectKey, Stmt, UnaryOp},
    runtime::STACK_GLOBAL_MODULE_REGISTRY,
};

use super::{
    bytecode::{Const, Op},
    compiler::{CompileError, Compiler, ErrorKind, Name},
    scope::StaticType,
};

/// Picks the opcode for `op`, specialised when both operands share a known
/// type, and the type of the result.
pub fn select_binary_op(op: BinaryOp, lhs: StaticType, rhs: StaticType) -> (Op, StaticType) {
    use StaticType::*;

    let ty = if lhs == rhs { lhs } else { Unknown };
    let typed = |signed: Op, unsigned: Op, float: Op| match ty {
        Int => Some(signed),
        UInt => Some(unsigned),
        Float => Some(float),
        _ => None,
    };
    let arith = |generic: Op, specialised: Option<Op>| match specialised {
        Some(op) => (op, ty),
        None => (generic, Unknown),
    };
    let compare = |generic: Op, specialised: Option<Op>| (specialised.unwrap_or(generic), Bool);
    let integral = |generic: Op, specialised: Op| match ty {
        Int | UInt => (specialised, ty),
        _ => (generic, Unknown),
    };

    match op {
        BinaryOp::Add => match ty {
            Int | UInt => (Op::AddInt, ty),
            Float => (Op::AddFloat, Float),
            Str => (Op::AddString, Str),
            _ => (Op::Add, Unknown),
        },
        BinaryOp::Sub => match ty {
            Int | UInt => (Op::SubInt, ty),
            Float => (Op::SubFloat, Float),
            _ => (Op::Sub, Unknown),
        },
        BinaryOp::Mul => arith(Op::Mul, typed(Op::MulSigned, Op::MulUnsigned, Op::MulFloat)),
        BinaryOp::Div => arith(Op::Div, typed(Op::DivSigned, Op::DivUnsigned, Op::DivFloat)),
        BinaryOp::Mod => arith(Op::Mod, typed(Op::ModSigned, Op::ModUnsigned, Op::ModFloat)),
        // a negative integer exponent yields a float
        BinaryOp::Pow => match typed(Op::PowSigned, Op::PowUnsigned, Op::PowFloat) {
            Some(op) if ty == Float => (op, Float),
            Some(op) => (op, Unknown),
            None => (Op::Pow, Unknown),
        },
        BinaryOp::ShiftLeft => integral(Op::ShiftLeft, Op::ShiftLeftInt),
        BinaryOp::ShiftRight => integral(Op::ShiftRight, Op::ShiftRightInt),
        BinaryOp::BitAnd => integral(Op::BitwiseAnd, Op::BitwiseAnd),
        BinaryOp::BitOr => integral(Op::BitwiseOr, Op::BitwiseOr),
        BinaryOp::BitXor => integral(Op::BitwiseXor, Op::BitwiseXor),
        BinaryOp::Eq => (Op::LogicalEqual, Bool),
        BinaryOp::Ne => (Op::LogicalNotEqual, Bool),
        BinaryOp::Gt => compare(
            Op::LogicalGreater,
            typed(
                Op::LogicalGreaterSigned,
                Op::LogicalGreaterUnsigned,
                Op::LogicalGreaterFloat,
            ),
        ),
        BinaryOp::Gte => compare(
            Op::LogicalGreaterEqual,
            typed(
                Op::LogicalGreaterEqualSigned,
                Op::LogicalGreaterEqualUnsigned,
                Op::LogicalGreaterEqualFloat,
            ),
        ),
        BinaryOp::Lt => compare(
            Op::LogicalLess,
            typed(
                Op::LogicalLessSigned,
                Op::LogicalLessUnsigned,
                Op::LogicalLessFloat,
            ),
        ),
        BinaryOp::Lte => compare(
            Op::LogicalLessEqual,
            typed(
                Op::LogicalLessEqualSigned,
                Op::LogicalLessEqualUnsigned,
                Op::LogicalLessEqualFloat,
            ),
        ),
        BinaryOp::LogicalAnd => (Op::LogicalAnd, Bool),
        BinaryOp::LogicalOr => (Op::LogicalOr, Bool),
    }
}

impl Compiler {
    /// Compiles `expr` into the slot `dst` and returns its static type.
    /// Temporaries taken on the way are released again.
    pub(super) fn expr_to(&mut self, expr: &Expr, dst: u16) -> Result<StaticType, CompileError> {
        let mark = self.temp_mark();
        let line = self.fs.line;

        self.fs.line = expr.span.line.max(line);

        let result = self.expr_kind(expr, dst);

        self.fs.line = line;
        self.reset_temps(mark);

        result
    }

    /// Compiles `expr` into a fresh temporary unless it names a local, in
    /// which case the local's slot is used directly.
    pub(super) fn expr_any(&mut self, expr: &Expr) -> Result<(u16, StaticType), CompileError> {
        let name = match &expr.kind {
            ExprKind::Ident(name) => Some(name.as_str()),
            ExprKind::This => Some("this"),
            _ => None,
        };

        if let Some(local) = name.and_then(|name| self.fs.find_local(name)) {
            return Ok((local.slot, local.ty));
        }

        let slot = self.alloc_temp()?;
        let ty = self.expr_to(expr, slot)?;

        Ok((slot, ty))
    }

    fn expr_kind(&mut self, expr: &Expr, dst: u16) -> Result<StaticType, CompileError> {
        match &expr.kind {
            ExprKind::Literal(lit) => self.literal(lit, dst),
            ExprKind::Ident(name) => self.load_name(name, dst),
            ExprKind::This => self.load_name("this", dst),
            ExprKind::Unary(op, inner) => self.unary(*op, inner, dst),
            ExprKind::Binary(lhs, op, rhs) => self.binary(lhs, *op, rhs, dst),
            ExprKind::Assign(op, target, value) => self.assign(*op, target, value, dst),
            ExprKind::Conditional(cond, then, other) => {
                let other_label = self.create_label();
                let end = self.create_label();
                let mark = self.temp_mark();
                let (cond, _) = self.expr_any(cond)?;

                self.jump_to(Op::JumpIfNot, cond, other_label);
                self.reset_temps(mark);

                let then_ty = self.expr_to(then, dst)?;

                self.jump_to(Op::Jump, 0, end);
                self.resolve_label(other_label);

                let other_ty = self.expr_to(other, dst)?;

                self.resolve_label(end);

                Ok(if then_ty == other_ty {
                    then_ty
                } else {
                    StaticType::Unknown
                })
            }
            ExprKind::Call(callee, args) => {
                let (func, nargs) = self.call_setup(callee, args)?;

                self.emit2(Op::FunctionCall, func, nargs, 1);

                if func != dst {
                    self.emit1(Op::GetStack, dst, func as i32);
                }

                Ok(StaticType::Unknown)
            }
            ExprKind::Member(object, name) => {
                let (object, _) = self.expr_any(object)?;
                let key = self.alloc_temp()?;

                self.load_constant(key, Const::Str(name.clone()))?;
                self.emit2(Op::GetValue, dst, object, key);

                Ok(StaticType::Unknown)
            }
            ExprKind::Index(object, index) => {
                let (object, _) = self.expr_any(object)?;
                let (key, _) = self.expr_any(index)?;

                self.emit2(Op::GetValue, dst, object, key);

                Ok(StaticType::Unknown)
            }
            ExprKind::Array(items) => {
                let first = self.alloc_temps(items.len())?;

                for (i, item) in items.iter().enumerate() {
                    self.expr_to(item, first + i as u16)?;
                }

                self.emit2(Op::CreateArray, dst, first, items.len() as u16);

                Ok(StaticType::Unknown)
            }
            ExprKind::Object(entries) => {
                self.emit0(Op::CreateObject, dst);

                for (key, value) in entries {
                    let mark = self.temp_mark();
                    let key = match key {
                        ObjectKey::Name(name) => {
                            let slot = self.alloc_temp()?;
                            self.load_constant(slot, Const::Str(name.clone()))?;
                            slot
                        }
                        ObjectKey::Computed(expr) => self.expr_any(expr)?.0,
                    };
                    let (value, _) = self.expr_any(value)?;

                    self.emit2(Op::SetValue, value, dst, key);
                    self.reset_temps(mark);
                }

                Ok(StaticType::Unknown)
            }
            ExprKind::Lambda(decl) => {
                self.closure(decl, dst, false)?;
                Ok(StaticType::Unknown)
            }
            ExprKind::Cast(ty, inner) => {
                let target = StaticType::from_annotation(Some(ty));
                let op = target
                    .conversion()
                    .ok_or_else(|| ErrorKind::InvalidCast(ty.name.clone()).at(expr.span))?;
                let (src, _) = self.expr_any(inner)?;

                self.emit1(op, dst, src as i32);

                Ok(target)
            }
            ExprKind::Generator(body) => self.generator(body, dst),
        }
    }

    fn literal(&mut self, lit: &Literal, dst: u16) -> Result<StaticType, CompileError> {
        let (constant, ty) = match lit {
            Literal::Null => (Const::Null, StaticType::Unknown),
            Literal::Bool(b) => (Const::Bool(*b), StaticType::Bool),
            Literal::Int(i) => (Const::Int(*i), StaticType::Int),
            Literal::Float(n) => (Const::Float(*n), StaticType::Float),
            Literal::Str(s) => (Const::Str(s.clone()), StaticType::Str),
            Literal::Char(c) => (Const::Str(c.to_string()), StaticType::Str),
        };

        self.load_constant(dst, constant)?;

        Ok(ty)
    }

    pub(super) fn load_name(&mut self, name: &str, dst: u16) -> Result<StaticType, CompileError> {
        match self.resolve(name) {
            Name::Local(slot, ty) => {
                if slot != dst {
                    self.emit1(Op::GetStack, dst, slot as i32);
                }

                Ok(ty)
            }
            Name::Closure(idx, ty) => {
                self.emit1(Op::GetClosure, dst, idx as i32);
                Ok(ty)
            }
            Name::Registry => {
                self.emit1(Op::GetStack, dst, STACK_GLOBAL_MODULE_REGISTRY);
                Ok(StaticType::Unknown)
            }
            Name::Constant(constant, ty) => {
                self.load_constant(dst, constant)?;
                Ok(ty)
            }
            Name::CompileTimeOnly(name) => Err(ErrorKind::CompileTimeOnly(name).at(self.span())),
            Name::Global(name) => {
                self.load_global(&name, dst)?;
                Ok(StaticType::Unknown)
            }
        }
    }

    /// Reads `name` from the global registry.
    pub(super) fn load_global(&mut self, name: &str, dst: u16) -> Result<(), CompileError> {
        let key = self.alloc_temp()?;

        self.emit1(Op::GetStack, dst, STACK_GLOBAL_MODULE_REGISTRY);
        self.load_constant(key, Const::Str(name.to_string()))?;
        self.emit2(Op::GetValue, dst, dst, key);

        Ok(())
    }

    fn unary(&mut self, op: UnaryOp, inner: &Expr, dst: u16) -> Result<StaticType, CompileError> {
        if op == UnaryOp::Neg {
            match &inner.kind {
                ExprKind::Literal(Literal::Int(i)) => {
                    self.load_constant(dst, Const::Int(i.wrapping_neg()))?;
                    return Ok(StaticType::Int);
                }
                ExprKind::Literal(Literal::Float(n)) => {
                    self.load_constant(dst, Const::Float(-n))?;
                    return Ok(StaticType::Float);
                }
                _ => {}
            }
        }

        let (src, ty) = self.expr_any(inner)?;
        let (opcode, ty) = match op {
            UnaryOp::Neg => (
                Op::Neg,
                match ty {
                    StaticType::Int | StaticType::Float => ty,
                    _ => StaticType::Unknown,
                },
            ),
            UnaryOp::Not => (Op::LogicalNot, StaticType::Bool),
            UnaryOp::BitNot => (
                Op::BitwiseNot,
                match ty {
                    StaticType::Int | StaticType::UInt => ty,
                    _ => StaticType::Unknown,
                },
            ),
        };

        self.emit1(opcode, dst, src as i32);

        Ok(ty)
    }

    fn binary(
        &mut self,
        lhs: &Expr,
        op: BinaryOp,
        rhs: &Expr,
        dst: u16,
    ) -> Result<StaticType, CompileError> {
        if matches!(op, BinaryOp::LogicalAnd | BinaryOp::LogicalOr) {
            return self.logical(lhs, op, rhs, dst);
        }

        let (l, lt) = self.expr_any(lhs)?;
        let (r, rt) = self.expr_any(rhs)?;
        let (opcode, ty) = select_binary_op(op, lt, rt);

        self.emit2(opcode, dst, l, r);

        Ok(ty)
    }

    fn is_simple(&self, expr: &Expr) -> bool {
        match &expr.kind {
            ExprKind::Literal(_) => true,
            ExprKind::Ident(name) => self.fs.find_local(name).is_some(),
            ExprKind::This => self.fs.find_local("this").is_some(),
            _ => false,
        }
    }

    /// `&&` and `||` always produce a bool. The right operand is only
    /// evaluated when it can change the result, unless it is trivial.
    fn logical(
        &mut self,
        lhs: &Expr,
        op: BinaryOp,
        rhs: &Expr,
        dst: u16,
    ) -> Result<StaticType, CompileError> {
        let is_and = op == BinaryOp::LogicalAnd;

        if self.is_simple(rhs) {
            let (l, _) = self.expr_any(lhs)?;
            let (r, _) = self.expr_any(rhs)?;
            let opcode = if is_and { Op::LogicalAnd } else { Op::LogicalOr };

            self.emit2(opcode, dst, l, r);

            return Ok(StaticType::Bool);
        }

        let end = self.create_label();
        let jump = if is_and { Op::JumpIfNot } else { Op::JumpIf };

        self.expr_to(lhs, dst)?;
        self.emit1(Op::ToBool, dst, dst as i32);
        self.jump_to(jump, dst, end);
        self.expr_to(rhs, dst)?;
        self.emit1(Op::ToBool, dst, dst as i32);
        self.resolve_label(end);

        Ok(StaticType::Bool)
    }

    /// Places the callee and its arguments in consecutive slots and returns
    /// the callee slot and argument count.
    pub(super) fn call_setup(
        &mut self,
        callee: &Expr,
        args: &[Expr],
    ) -> Result<(u16, u16), CompileError> {
        let func = self.alloc_temps(args.len() + 1)?;

        self.expr_to(callee, func)?;

        for (i, arg) in args.iter().enumerate() {
            self.expr_to(arg, func + 1 + i as u16)?;
        }

        Ok((func, args.len() as u16))
    }

    /// Emits a conversion of `slot` when a value of type `from` is stored in
    /// a binding of type `to`.
    pub(super) fn coerce(&mut self, slot: u16, from: StaticType, to: StaticType) {
        if from == to {
            return;
        }

        if let Some(op) = to.conversion() {
            self.emit1(op, slot, slot as i32);
        }
    }

    fn assign(
        &mut self,
        op: Option<AssignOp>,
        target: &Expr,
        value: &Expr,
        dst: u16,
    ) -> Result<StaticType, CompileError> {
        let compound;
        let value = match op {
            Some(op) => {
                compound = ExprKind::Binary(
                    Box::new(target.clone()),
                    op.into(),
                    Box::new(value.clone()),
                )
                .at(value.span);
                &compound
            }
            None => value,
        };

        match &target.kind {
            ExprKind::Ident(name) => match self.resolve(name) {
                Name::Local(slot, ty) => {
                    let value_ty = self.expr_to(value, dst)?;

                    self.coerce(dst, value_ty, ty);
                    self.emit1(Op::SetStack, dst, slot as i32);

                    Ok(if ty.is_known() { ty } else { value_ty })
                }
                Name::Closure(idx, ty) => {
                    let value_ty = self.expr_to(value, dst)?;

                    self.coerce(dst, value_ty, ty);
                    self.emit1(Op::SetClosure, dst, idx as i32);

                    Ok(if ty.is_known() { ty } else { value_ty })
                }
                Name::Registry | Name::Constant(..) => {
                    Err(ErrorKind::InvalidAssignTarget.at(target.span))
                }
                Name::CompileTimeOnly(name) => Err(ErrorKind::CompileTimeOnly(name).at(target.span)),
                Name::Global(name) => Err(ErrorKind::UnknownName(name).at(target.span)),
            },
            ExprKind::Member(object, name) => {
                let (object, _) = self.expr_any(object)?;
                let key = self.alloc_temp()?;

                self.load_constant(key, Const::Str(name.clone()))?;

                let ty = self.expr_to(value, dst)?;

                self.emit2(Op::SetValue, dst, object, key);

                Ok(ty)
            }
            ExprKind::Index(object, index) => {
                let (object, _) = self.expr_any(object)?;
                let (key, _) = self.expr_any(index)?;
                let ty = self.expr_to(value, dst)?;

                self.emit2(Op::SetValue, dst, object, key);

                Ok(ty)
            }
            _ => Err(ErrorKind::InvalidAssignTarget.at(target.span)),
        }
    }

    /// A generator collects every `out` value of its body into a new array.
    fn generator(&mut self, body: &[Stmt], dst: u16) -> Result<StaticType, CompileError> {
        self.emit2(Op::CreateArray, dst, 0, 0);

        // statements release temporaries down to the locals
        self.fs.locals_top = self.fs.locals_top.max(self.fs.free);
        self.fs.generators.push(dst);

        let loops = std::mem::take(&mut self.fs.loops);

        self.enter_scope();

        let result = body.iter().try_for_each(|stmt| self.statement(stmt));

        self.exit_scope(true);
        self.fs.loops = loops;
        self.fs.generators.pop();
        result?;

        Ok(StaticType::Unknown)
    }

    pub(super) fn out_stmt(&mut self, value: &Expr) -> Result<(), CompileError> {
        let Some(&array) = self.fs.generators.last() else {
            return Err(ErrorKind::OutOutsideGenerator.at(value.span));
        };

        let (value, _) = self.expr_any(value)?;
        let len = self.alloc_temp()?;

        self.load_constant(len, Const::Str("length".to_string()))?;
        self.emit2(Op::GetValue, len, array, len);
        self.emit2(Op::SetValue, value, array, len);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case(BinaryOp::Add, StaticType::Int, StaticType::Int, Op::AddInt, StaticType::Int; "int add")]
    #[test_case(BinaryOp::Add, StaticType::UInt, StaticType::UInt, Op::AddInt, StaticType::UInt; "uint add")]
    #[test_case(BinaryOp::Add, StaticType::Str, StaticType::Str, Op::AddString, StaticType::Str; "concat")]
    #[test_case(BinaryOp::Add, StaticType::Int, StaticType::Float, Op::Add, StaticType::Unknown; "mixed add")]
    #[test_case(BinaryOp::Mul, StaticType::UInt, StaticType::UInt, Op::MulUnsigned, StaticType::UInt; "uint mul")]
    #[test_case(BinaryOp::Pow, StaticType::Int, StaticType::Int, Op::PowSigned, StaticType::Unknown; "int pow")]
    #[test_case(BinaryOp::Lt, StaticType::Float, StaticType::Float, Op::LogicalLessFloat, StaticType::Bool; "float less")]
    #[test_case(BinaryOp::Gte, StaticType::Unknown, StaticType::Int, Op::LogicalGreaterEqual, StaticType::Bool; "generic compare")]
    #[test_case(BinaryOp::ShiftLeft, StaticType::Int, StaticType::Int, Op::ShiftLeftInt, StaticType::Int; "int shift")]
    fn test_select_binary_op(
        op: BinaryOp,
        lhs: StaticType,
        rhs: StaticType,
        expected: Op,
        ty: StaticType,
    ) {
        assert_eq!(select_binary_op(op, lhs, rhs), (expected, ty));
    }
}
