use crate::{
    error::IntoSpanned,
    frontend::ast::{Expr, ExprKind, FnDecl, IfStmt, Pattern, Stmt, StmtKind, SwitchArm, TryStmt, VarDecl},
    runtime::STACK_GLOBAL_MODULE_REGISTRY,
};

use super::{
    bytecode::{Const, Op, MULTIPLE_RESULTS},
    compiler::{CompileError, Compiler, ErrorKind},
    scope::{LoopContext, StaticType},
};

impl Compiler {
    pub(super) fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match &stmt.kind {
            StmtKind::Module(name) => self.module_decl(name),
            StmtKind::Var(decl) => self.var_decl(decl, stmt),
            StmtKind::Expr(expr) => {
                let slot = self.alloc_temp()?;
                self.expr_to(expr, slot)?;
                Ok(())
            }
            StmtKind::Return(value) => self.return_stmt(value.as_ref(), stmt),
            StmtKind::Block(body) => self.block(body),
            StmtKind::If(stmt) => self.if_stmt(stmt),
            StmtKind::While(cond, body) => self.while_stmt(cond, body),
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => self.for_stmt(init.as_deref(), cond.as_ref(), step.as_ref(), body),
            StmtKind::ForEach(pattern, iter, body) => self.foreach_stmt(pattern, iter, body),
            StmtKind::Switch(value, arms, default) => {
                self.switch_stmt(value, arms, default.as_deref())
            }
            StmtKind::Break => self.loop_exit(true, stmt),
            StmtKind::Continue => self.loop_exit(false, stmt),
            StmtKind::Throw(value) => {
                let (value, _) = self.expr_any(value)?;
                self.emit0(Op::Throw, value);
                Ok(())
            }
            StmtKind::Try(try_stmt) => self.try_stmt(try_stmt),
            StmtKind::Out(value) => self.out_stmt(value),
            StmtKind::Fn(decl) => self.fn_decl(decl),
            StmtKind::Class(class) => self.class_decl(class),
            StmtKind::Test(name, body) => self.test_decl(name, body),
            StmtKind::CompileTime(decl) => self.compile_time_decl(decl, stmt.span),
        }
    }

    pub(super) fn block(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        self.enter_scope();

        for stmt in body {
            self.statement(stmt)?;
        }

        self.exit_scope(true);

        Ok(())
    }

    fn var_decl(&mut self, decl: &VarDecl, stmt: &Stmt) -> Result<(), CompileError> {
        let ty = StaticType::from_annotation(decl.ty.as_ref());

        let Pattern::Ident(name) = &decl.pattern else {
            if decl.using {
                return Err(ErrorKind::InvalidUsing.at(stmt.span));
            }

            let src = self.alloc_temp()?;

            match &decl.value {
                Some(value) => self.expr_to(value, src)?,
                None => {
                    self.load_constant(src, Const::Null)?;
                    StaticType::Unknown
                }
            };

            for (name, slot) in self.destructure(&decl.pattern, src, ty)? {
                self.export(&name, slot, decl.access);
            }

            return Ok(());
        };

        // the name becomes visible after its initializer
        let slot = self.reserve_local_slot()?;

        match &decl.value {
            Some(value) => {
                let value_ty = self.expr_to(value, slot)?;
                self.coerce(slot, value_ty, ty);
            }
            None => self.load_constant(slot, ty.zero())?,
        }

        self.declare_local(name, slot, ty)?;

        if decl.using {
            self.emit0(Op::MarkToBeClosed, slot);

            if let Some(scope) = self.fs.scopes.last_mut() {
                scope.has_tbc = true;
            }
        }

        self.export(name, slot, decl.access);

        Ok(())
    }

    /// Binds each name of an object or array pattern to the matching
    /// member of the value in `src`.
    fn destructure(
        &mut self,
        pattern: &Pattern,
        src: u16,
        ty: StaticType,
    ) -> Result<Vec<(String, u16)>, CompileError> {
        let keys = match pattern {
            Pattern::Ident(name) => {
                self.declare_local(name, src, ty)?;
                return Ok(vec![(name.clone(), src)]);
            }
            Pattern::Object(names) => names
                .iter()
                .map(|name| (name, Const::Str(name.clone())))
                .collect::<Vec<_>>(),
            Pattern::Array(names) => names
                .iter()
                .enumerate()
                .map(|(i, name)| (name, Const::Int(i as i64)))
                .collect(),
        };
        let mut bound = vec![];

        for (name, key) in keys {
            let slot = self.reserve_local_slot()?;
            let mark = self.temp_mark();
            let key_slot = self.alloc_temp()?;

            self.load_constant(key_slot, key)?;
            self.emit2(Op::GetValue, slot, src, key_slot);
            self.coerce(slot, StaticType::Unknown, ty);
            self.reset_temps(mark);
            self.declare_local(name, slot, ty)?;
            bound.push((name.clone(), slot));
        }

        Ok(bound)
    }

    fn fn_decl(&mut self, decl: &FnDecl) -> Result<(), CompileError> {
        // declared first so the body can refer to itself
        let slot = self.allocate_local_var(&decl.name, StaticType::Unknown)?;

        self.closure(decl, slot, false)?;
        self.export(&decl.name, slot, decl.access);

        Ok(())
    }

    fn return_stmt(&mut self, value: Option<&Expr>, stmt: &Stmt) -> Result<(), CompileError> {
        if self.in_generator() {
            return Err(ErrorKind::ReturnInGenerator.at(stmt.span));
        }

        let needs_cleanup =
            !self.fs.tries.is_empty() || self.fs.scopes.iter().any(|scope| scope.has_tbc);

        if let Some(Expr {
            kind: ExprKind::Call(callee, args),
            ..
        }) = value
        {
            if !needs_cleanup {
                let (func, nargs) = self.call_setup(callee, args)?;
                self.emit2(Op::FunctionTailCall, func, nargs, MULTIPLE_RESULTS);
                return Ok(());
            }
        }

        let slot = self.alloc_temp()?;

        match value {
            Some(value) => {
                self.expr_to(value, slot)?;
            }
            None => self.load_constant(slot, Const::Null)?,
        }

        if !self.fs.tries.is_empty() {
            // keep the value alive across the inlined finally blocks
            self.fs.locals_top = self.fs.locals_top.max(self.fs.free);
            self.exit_tries(0)?;
        }

        self.emit2(Op::FunctionReturn, slot, 1, 0);

        Ok(())
    }

    /// Leaves every `try` region above `depth`, running `finally` blocks
    /// innermost first.
    fn exit_tries(&mut self, depth: usize) -> Result<(), CompileError> {
        let tries = self.fs.tries.clone();

        for i in (depth..tries.len()).rev() {
            self.fs.tries.truncate(i);
            self.emit0(Op::EndTry, 0);

            if let Some(finally) = &tries[i] {
                self.block(finally)?;
            }
        }

        self.fs.tries = tries;

        Ok(())
    }

    fn if_stmt(&mut self, stmt: &IfStmt) -> Result<(), CompileError> {
        let IfStmt(cond, then, other) = stmt;
        let other_label = self.create_label();
        let end = self.create_label();
        let (cond, _) = self.expr_any(cond)?;

        self.jump_to(Op::JumpIfNot, cond, other_label);
        self.release_temps();
        self.block(then)?;

        match other {
            Some(other) => {
                self.jump_to(Op::Jump, 0, end);
                self.resolve_label(other_label);
                self.statement(other)?;
            }
            None => self.resolve_label(other_label),
        }

        self.resolve_label(end);

        Ok(())
    }

    fn loop_body(
        &mut self,
        body: &[Stmt],
        break_label: usize,
        continue_label: usize,
    ) -> Result<(), CompileError> {
        self.fs.loops.push(LoopContext {
            break_label,
            continue_label,
            try_depth: self.fs.tries.len(),
            close_level: self.fs.free,
        });

        let result = self.block(body);

        self.fs.loops.pop();

        result
    }

    fn while_stmt(&mut self, cond: &Expr, body: &[Stmt]) -> Result<(), CompileError> {
        let start = self.create_label();
        let end = self.create_label();

        self.resolve_label(start);

        let (cond, _) = self.expr_any(cond)?;

        self.jump_to(Op::JumpIfNot, cond, end);
        self.release_temps();
        self.loop_body(body, end, start)?;
        self.jump_to(Op::Jump, 0, start);
        self.resolve_label(end);

        Ok(())
    }

    fn for_stmt(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Expr>,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        self.enter_scope();

        if let Some(init) = init {
            self.statement(init)?;
        }

        let start = self.create_label();
        let next = self.create_label();
        let end = self.create_label();

        self.resolve_label(start);

        if let Some(cond) = cond {
            let (cond, _) = self.expr_any(cond)?;

            self.jump_to(Op::JumpIfNot, cond, end);
            self.release_temps();
        }

        self.loop_body(body, end, next)?;
        self.resolve_label(next);

        if let Some(step) = step {
            let slot = self.alloc_temp()?;

            self.expr_to(step, slot)?;
            self.release_temps();
        }

        self.jump_to(Op::Jump, 0, start);
        self.resolve_label(end);
        self.exit_scope(true);

        Ok(())
    }

    /// `for (var x in value)` walks `zr.iter(value)` by index, which yields
    /// arrays as-is, `[key, value]` pairs for objects and characters for
    /// strings.
    fn foreach_stmt(
        &mut self,
        pattern: &Pattern,
        iter: &Expr,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        self.enter_scope();

        let seq = self.reserve_local_slot()?;
        let index = self.reserve_local_slot()?;
        let len = self.reserve_local_slot()?;
        let func = self.alloc_temps(2)?;
        let key = self.alloc_temp()?;

        self.emit1(Op::GetStack, func, STACK_GLOBAL_MODULE_REGISTRY);
        self.load_constant(key, Const::Str("iter".to_string()))?;
        self.emit2(Op::GetValue, func, func, key);
        self.expr_to(iter, func + 1)?;
        self.emit2(Op::FunctionCall, func, 1, 1);
        self.emit1(Op::GetStack, seq, func as i32);
        self.load_constant(index, Const::Int(0))?;
        self.load_constant(key, Const::Str("length".to_string()))?;
        self.emit2(Op::GetValue, len, seq, key);
        self.release_temps();

        let start = self.create_label();
        let next = self.create_label();
        let end = self.create_label();

        self.resolve_label(start);

        let cond = self.alloc_temp()?;

        self.emit2(Op::LogicalLess, cond, index, len);
        self.jump_to(Op::JumpIfNot, cond, end);
        self.release_temps();

        self.fs.loops.push(LoopContext {
            break_label: end,
            continue_label: next,
            try_depth: self.fs.tries.len(),
            close_level: self.fs.free,
        });
        self.enter_scope();

        let result = self.foreach_body(pattern, seq, index, body);

        self.exit_scope(true);
        self.fs.loops.pop();
        result?;

        self.resolve_label(next);

        let one = self.alloc_temp()?;

        self.load_constant(one, Const::Int(1))?;
        self.emit2(Op::AddInt, index, index, one);
        self.release_temps();
        self.jump_to(Op::Jump, 0, start);
        self.resolve_label(end);
        self.exit_scope(true);

        Ok(())
    }

    fn foreach_body(
        &mut self,
        pattern: &Pattern,
        seq: u16,
        index: u16,
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        let item = self.reserve_local_slot()?;

        self.emit2(Op::GetValue, item, seq, index);
        self.destructure(pattern, item, StaticType::Unknown)?;

        for stmt in body {
            self.statement(stmt)?;
        }

        Ok(())
    }

    /// Arms are tested in order; the first equal arm runs and control
    /// leaves the switch.
    fn switch_stmt(
        &mut self,
        value: &Expr,
        arms: &[SwitchArm],
        default: Option<&[Stmt]>,
    ) -> Result<(), CompileError> {
        self.enter_scope();

        let subject = self.reserve_local_slot()?;
        let end = self.create_label();

        self.expr_to(value, subject)?;

        for arm in arms {
            let next = self.create_label();
            let cond = self.alloc_temp()?;
            let (value, _) = self.expr_any(&arm.value)?;

            self.emit2(Op::LogicalEqual, cond, subject, value);
            self.jump_to(Op::JumpIfNot, cond, next);
            self.release_temps();
            self.block(&arm.body)?;
            self.jump_to(Op::Jump, 0, end);
            self.resolve_label(next);
        }

        if let Some(default) = default {
            self.block(default)?;
        }

        self.resolve_label(end);
        self.exit_scope(true);

        Ok(())
    }

    fn loop_exit(&mut self, is_break: bool, stmt: &Stmt) -> Result<(), CompileError> {
        let keyword = if is_break { "break" } else { "continue" };
        let Some(ctx) = self.fs.loops.last().copied() else {
            return Err(ErrorKind::OutsideLoop(keyword).at(stmt.span));
        };

        self.exit_tries(ctx.try_depth)?;
        self.emit0(Op::CloseScope, ctx.close_level);

        let target = if is_break {
            ctx.break_label
        } else {
            ctx.continue_label
        };

        self.jump_to(Op::Jump, 0, target);

        Ok(())
    }

    /// Lowers `try`/`catch`/`finally`. The `finally` block is inlined on
    /// every exit path: normal completion, after the catch body and on
    /// early exits through `return`, `break` or `continue`.
    fn try_stmt(&mut self, stmt: &TryStmt) -> Result<(), CompileError> {
        let handler = self.create_label();
        let end = self.create_label();

        self.jump_to(Op::Try, self.fs.free, handler);
        self.fs.tries.push(stmt.finally.clone());

        let result = self.block(&stmt.body);

        self.fs.tries.pop();
        result?;
        self.emit0(Op::EndTry, 0);

        if let Some(finally) = &stmt.finally {
            self.block(finally)?;
        }

        self.jump_to(Op::Jump, 0, end);
        self.resolve_label(handler);

        match (&stmt.catch, &stmt.finally) {
            (Some((name, body)), None) => {
                self.enter_scope();

                let slot = self.allocate_local_var(name, StaticType::Unknown)?;

                self.emit0(Op::Catch, slot);

                for stmt in body {
                    self.statement(stmt)?;
                }

                self.exit_scope(true);
            }
            (Some((name, body)), Some(finally)) => {
                let rethrow = self.create_label();

                self.enter_scope();

                let slot = self.allocate_local_var(name, StaticType::Unknown)?;

                self.emit0(Op::Catch, slot);
                self.jump_to(Op::Try, self.fs.free, rethrow);
                self.fs.tries.push(Some(finally.clone()));

                let result = body.iter().try_for_each(|stmt| self.statement(stmt));

                self.fs.tries.pop();
                result?;
                self.emit0(Op::EndTry, 0);
                self.exit_scope(true);
                self.block(finally)?;
                self.jump_to(Op::Jump, 0, end);
                self.resolve_label(rethrow);
                self.finally_rethrow(finally)?;
            }
            (None, Some(finally)) => self.finally_rethrow(finally)?,
            (None, None) => {
                let slot = self.alloc_temp()?;
                self.emit0(Op::Catch, slot);
            }
        }

        self.resolve_label(end);

        Ok(())
    }

    /// Runs `finally` for an exception nobody caught and throws it again.
    fn finally_rethrow(&mut self, finally: &[Stmt]) -> Result<(), CompileError> {
        self.enter_scope();

        let exception = self.reserve_local_slot()?;

        self.emit0(Op::Catch, exception);
        self.block(finally)?;
        self.emit0(Op::Throw, exception);
        self.exit_scope(false);

        Ok(())
    }
}
