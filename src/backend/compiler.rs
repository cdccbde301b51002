use std::{fmt::Display, mem, rc::Rc};

use tracing::{debug, warn};

use crate::{
    collections::OrderedSet,
    error::{IntoSpanned, SpannedError},
    frontend::{
        ast::{Access, ClassDecl, ClassKind, ExprKind, FnDecl, ObjectKey, Stmt, StmtKind},
        Span,
    },
    runtime::{
        AccessModifier, ClosureVariable, ExportedVariable, Function, LocalVariable, MetaMethod,
    },
};

use super::{
    bytecode::{Const, Instruction, Op},
    compile_time::{const_type, CompileTimeScope},
    prototype::{
        field_size, layout_fields, serialize_prototype_info_to_binary, MemberInfo, MemberKind,
        PrototypeInfo, PrototypeKind, NONE_INDEX,
    },
    scope::{Label, Local, LoopContext, Scope, StaticType},
};

pub const MAX_CONSTANTS: usize = i32::MAX as usize;
/// `u16::MAX` is reserved for the argument and result sentinels.
pub const MAX_SLOTS: usize = u16::MAX as usize - 1;
pub const MAX_CHILDREN: usize = i32::MAX as usize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("cannot assign to unknown name '{0}'")]
    UnknownName(String),
    #[error("name '{0}' is already defined in this scope")]
    DuplicateName(String),
    #[error("invalid assignment target")]
    InvalidAssignTarget,
    #[error("unknown cast target '{0}'")]
    InvalidCast(String),
    #[error("unknown metamethod '@{0}'")]
    InvalidMetaMethod(String),
    #[error("unknown prototype '{0}'")]
    UnknownPrototype(String),
    #[error("{0} must be declared at module level")]
    NotTopLevel(&'static str),
    #[error("'{0}' outside of a loop")]
    OutsideLoop(&'static str),
    #[error("'out' outside of a generator")]
    OutOutsideGenerator,
    #[error("'return' inside a generator")]
    ReturnInGenerator,
    #[error("'using' requires a single name")]
    InvalidUsing,
    #[error("too many constants")]
    TooManyConstants,
    #[error("too many stack slots")]
    TooManySlots,
    #[error("too many child functions")]
    TooManyChildren,
    #[error("unresolved label {0}")]
    UnresolvedLabel(usize),
    #[error("%compileTime variable needs {0}")]
    InvalidCompileTime(&'static str),
    #[error("compile-time execution failed: {0}")]
    CompileTimeFailed(String),
    #[error("'{0}' only exists at compile time")]
    CompileTimeOnly(String),
}

impl ErrorKind {
    /// Fatal errors abort compilation; the others are collected and the
    /// compiler moves on to the next statement.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::TooManyConstants
                | ErrorKind::TooManySlots
                | ErrorKind::TooManyChildren
                | ErrorKind::UnresolvedLabel(_)
                | ErrorKind::CompileTimeFailed(_)
        )
    }
}

pub type CompileError = SpannedError<ErrorKind>;

impl CompileError {
    pub fn is_fatal(&self) -> bool {
        self.kind.is_fatal()
    }
}

#[derive(Debug, Clone)]
pub struct CompileErrors(pub Vec<CompileError>);

impl CompileErrors {
    pub fn span(&self) -> Span {
        self.0.first().map(|e| e.span).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompileError> {
        self.0.iter()
    }
}

impl Display for CompileErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_slice() {
            [] => write!(f, "compilation failed"),
            [first] => write!(f, "{first}"),
            [first, rest @ ..] => write!(f, "{first} (and {} more)", rest.len()),
        }
    }
}

impl std::error::Error for CompileErrors {}

pub struct CompileResult {
    pub main_function: Rc<Function>,
    pub test_functions: Vec<(String, Rc<Function>)>,
    pub module_name: Option<String>,
}

/// Per-function compilation state. A nested declaration swaps in a fresh
/// state and restores the enclosing one when it is done.
#[derive(Default)]
pub(super) struct FunctionState {
    pub function: Function,
    pub constants: OrderedSet<Const>,
    pub scopes: Vec<Scope>,
    /// Next free slot.
    pub free: u16,
    /// Slots below this hold locals and survive temporary release.
    pub locals_top: u16,
    pub closure_types: Vec<StaticType>,
    pub labels: Vec<Option<usize>>,
    pub pending_jumps: Vec<(usize, Label)>,
    pub loops: Vec<LoopContext>,
    /// `finally` bodies of the enclosing `try` regions, innermost last.
    pub tries: Vec<Option<Vec<Stmt>>>,
    /// Array slots of the enclosing generator expressions.
    pub generators: Vec<u16>,
    pub prototypes: Vec<PrototypeInfo>,
    pub prototype_names: Vec<String>,
    pub is_entry: bool,
    pub line: u32,
}

impl FunctionState {
    fn new(name: &str, line: u32) -> Self {
        Self {
            function: Function {
                name: name.to_string(),
                line_start: line,
                line_end: line,
                ..Function::default()
            },
            line,
            ..Self::default()
        }
    }

    pub fn find_local(&self, name: &str) -> Option<&Local> {
        self.scopes.iter().rev().find_map(|scope| scope.find(name))
    }

    /// Marks the scope owning `name` as captured and returns the local.
    fn capture_local(&mut self, name: &str) -> Option<(u16, StaticType)> {
        let scope = self
            .scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.find(name).is_some())?;
        let local = scope.find(name).map(|local| (local.slot, local.ty))?;

        scope.captured = true;

        Some(local)
    }

    fn find_closure(&self, name: &str) -> Option<u32> {
        self.function
            .closure_values
            .iter()
            .position(|var| var.name == name)
            .map(|idx| idx as u32)
    }

    fn add_closure(&mut self, name: &str, in_stack: bool, index: u32, ty: StaticType) -> u32 {
        self.function.closure_values.push(ClosureVariable {
            name: name.to_string(),
            in_stack,
            index,
        });
        self.closure_types.push(ty);

        (self.function.closure_values.len() - 1) as u32
    }

    pub(super) fn at_module_level(&self) -> bool {
        self.is_entry && self.scopes.len() == 1
    }

    fn finish(mut self) -> Result<Function, CompileError> {
        for (pc, label) in mem::take(&mut self.pending_jumps) {
            let target = self
                .labels
                .get(label)
                .copied()
                .flatten()
                .ok_or_else(|| ErrorKind::UnresolvedLabel(label).at(Span::default()))?;

            if let Some(instr) = self.function.instructions.get_mut(pc) {
                instr.operand = (target as i64 - pc as i64 - 1) as i32 as u32;
            }
        }

        let min_size = self.function.parameter_count as u32 + 1;

        self.function.stack_size = self.function.stack_size.max(min_size);
        self.function.constants = self.constants.into_vec();

        if !self.prototypes.is_empty() {
            self.function.prototype_count = self.prototypes.len() as u32;
            self.function.prototype_data = serialize_prototype_info_to_binary(&self.prototypes);
        }

        Ok(self.function)
    }
}

/// Resolution of an identifier at a use site.
pub(super) enum Name {
    Local(u16, StaticType),
    Closure(u32, StaticType),
    Registry,
    Constant(Const, StaticType),
    CompileTimeOnly(String),
    Global(String),
}

pub fn access_modifier(access: Access) -> AccessModifier {
    match access {
        Access::Public => AccessModifier::Public,
        Access::Private => AccessModifier::Private,
        Access::Protected => AccessModifier::Protected,
    }
}

pub struct Compiler {
    pub(super) fs: FunctionState,
    parents: Vec<FunctionState>,
    errors: Vec<CompileError>,
    tests: Vec<(String, Rc<Function>)>,
    module_name: Option<String>,
    test_mode: bool,
    pub(super) compile_time: CompileTimeScope,
}

impl Compiler {
    pub fn new(name: &str) -> Self {
        let mut fs = FunctionState::new(name, 1);
        fs.is_entry = true;

        Self {
            fs,
            parents: vec![],
            errors: vec![],
            tests: vec![],
            module_name: None,
            test_mode: false,
            compile_time: CompileTimeScope::default(),
        }
    }

    /// Compiles `%test` declarations into test functions instead of
    /// skipping them.
    pub fn test_mode(mut self, enabled: bool) -> Self {
        self.test_mode = enabled;
        self
    }

    pub fn compile(mut self, program: &[Stmt]) -> Result<CompileResult, CompileErrors> {
        match self.compile_entry(program) {
            Ok(main) if self.errors.is_empty() => Ok(CompileResult {
                main_function: Rc::new(main),
                test_functions: self.tests,
                module_name: self.module_name,
            }),
            Ok(_) => Err(CompileErrors(self.errors)),
            Err(e) => {
                self.errors.push(e);
                Err(CompileErrors(self.errors))
            }
        }
    }

    fn compile_entry(&mut self, program: &[Stmt]) -> Result<Function, CompileError> {
        self.enter_scope();

        for stmt in program {
            self.statement(stmt)?;
        }

        self.fs.function.line_end = program.last().map(|s| s.span.line).unwrap_or(1);
        self.implicit_return()?;
        self.exit_scope(false);

        mem::take(&mut self.fs).finish()
    }

    pub(super) fn span(&self) -> Span {
        Span {
            offset: 0,
            line: self.fs.line,
        }
    }

    /// Compiles one statement; recoverable errors are recorded and the
    /// statement is dropped.
    pub(super) fn statement(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        self.fs.line = stmt.span.line;

        let result = self.stmt(stmt);

        self.release_temps();

        match result {
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, line = e.span.line, "recovered compile error");
                self.errors.push(e);
                Ok(())
            }
            other => other,
        }
    }

    pub fn create_instruction_0(op: Op, extra: u16) -> Instruction {
        Instruction::new(op, extra)
    }

    pub fn create_instruction_1(op: Op, extra: u16, operand: i32) -> Instruction {
        Instruction::with_i32(op, extra, operand)
    }

    pub fn create_instruction_2(op: Op, extra: u16, a: u16, b: u16) -> Instruction {
        Instruction::with_u16x2(op, extra, a, b)
    }

    pub fn create_instruction_4(op: Op, extra: u16, bytes: [u8; 4]) -> Instruction {
        Instruction::with_u8x4(op, extra, bytes)
    }

    /// Appends `instr` and returns its index.
    pub fn emit_instruction(&mut self, instr: Instruction) -> usize {
        self.fs.function.instructions.push(instr);
        self.fs.function.line_info.push(self.fs.line);
        self.fs.function.instructions.len() - 1
    }

    pub(super) fn emit0(&mut self, op: Op, extra: u16) -> usize {
        self.emit_instruction(Self::create_instruction_0(op, extra))
    }

    pub(super) fn emit1(&mut self, op: Op, extra: u16, operand: i32) -> usize {
        self.emit_instruction(Self::create_instruction_1(op, extra, operand))
    }

    pub(super) fn emit2(&mut self, op: Op, extra: u16, a: u16, b: u16) -> usize {
        self.emit_instruction(Self::create_instruction_2(op, extra, a, b))
    }

    pub fn pc(&self) -> usize {
        self.fs.function.instructions.len()
    }

    pub fn create_label(&mut self) -> Label {
        self.fs.labels.push(None);
        self.fs.labels.len() - 1
    }

    /// Binds `label` to the next instruction.
    pub fn resolve_label(&mut self, label: Label) {
        let pc = self.pc();

        if let Some(slot) = self.fs.labels.get_mut(label) {
            *slot = Some(pc);
        }
    }

    /// Records that the instruction at `pc` jumps to `label`; the offset is
    /// patched when the function is finished.
    pub fn add_pending_jump(&mut self, pc: usize, label: Label) {
        self.fs.pending_jumps.push((pc, label));
    }

    pub(super) fn jump_to(&mut self, op: Op, extra: u16, label: Label) {
        let pc = self.emit1(op, extra, 0);
        self.add_pending_jump(pc, label);
    }

    /// Index of `constant` in the pool, reusing an equal entry.
    pub fn add_constant(&mut self, constant: Const) -> Result<u32, CompileError> {
        self.fs
            .constants
            .insert(constant, MAX_CONSTANTS)
            .map_err(|_| ErrorKind::TooManyConstants.at(self.span()))
    }

    pub(super) fn load_constant(&mut self, dst: u16, constant: Const) -> Result<(), CompileError> {
        let idx = self.add_constant(constant)?;
        self.emit1(Op::GetConstant, dst, idx as i32);
        Ok(())
    }

    fn alloc_slot(&mut self) -> Result<u16, CompileError> {
        let slot = self.fs.free;

        if slot as usize >= MAX_SLOTS {
            return Err(ErrorKind::TooManySlots.at(self.span()));
        }

        self.fs.free += 1;
        self.fs.function.stack_size = self.fs.function.stack_size.max(self.fs.free as u32);

        Ok(slot)
    }

    pub(super) fn alloc_temp(&mut self) -> Result<u16, CompileError> {
        self.alloc_slot()
    }

    /// Allocates `count` consecutive temporaries and returns the first.
    pub(super) fn alloc_temps(&mut self, count: usize) -> Result<u16, CompileError> {
        let first = self.fs.free;

        for _ in 0..count {
            self.alloc_slot()?;
        }

        Ok(first)
    }

    pub(super) fn temp_mark(&self) -> u16 {
        self.fs.free
    }

    pub(super) fn reset_temps(&mut self, mark: u16) {
        self.fs.free = mark.max(self.fs.locals_top);
    }

    pub(super) fn release_temps(&mut self) {
        self.fs.free = self.fs.locals_top;
    }

    /// Takes a slot for a local that is not visible yet.
    pub(super) fn reserve_local_slot(&mut self) -> Result<u16, CompileError> {
        let slot = self.alloc_slot()?;
        self.fs.locals_top = self.fs.locals_top.max(self.fs.free);
        Ok(slot)
    }

    /// Makes `slot` visible as `name` in the innermost scope.
    pub(super) fn declare_local(
        &mut self,
        name: &str,
        slot: u16,
        ty: StaticType,
    ) -> Result<(), CompileError> {
        let span = self.span();
        let debug_index = self.fs.function.local_variables.len();
        let pc = self.pc() as u32;
        let Some(scope) = self.fs.scopes.last_mut() else {
            return Ok(());
        };

        if scope.find(name).is_some() {
            return Err(ErrorKind::DuplicateName(name.to_string()).at(span));
        }

        scope.locals.push(Local {
            name: name.to_string(),
            slot,
            ty,
            debug_index,
        });
        self.fs.function.local_variables.push(LocalVariable {
            name: name.to_string(),
            stack_slot: slot as u32,
            offset_activate: pc,
            offset_dead: u32::MAX,
        });

        Ok(())
    }

    /// Allocates the next slot for `name`. Slots are never handed to
    /// another local of the same function.
    pub fn allocate_local_var(&mut self, name: &str, ty: StaticType) -> Result<u16, CompileError> {
        let slot = self.reserve_local_slot()?;
        self.declare_local(name, slot, ty)?;
        Ok(slot)
    }

    /// Slot of the innermost visible local called `name`.
    pub fn find_local_var(&self, name: &str) -> Option<u16> {
        self.fs.find_local(name).map(|local| local.slot)
    }

    pub fn find_closure_var(&self, name: &str) -> Option<u32> {
        self.fs.find_closure(name)
    }

    pub fn allocate_closure_var(&mut self, name: &str, in_stack: bool, index: u32) -> u32 {
        self.fs
            .add_closure(name, in_stack, index, StaticType::Unknown)
    }

    fn state(&self, level: usize) -> &FunctionState {
        match self.parents.get(level) {
            Some(state) => state,
            None => &self.fs,
        }
    }

    fn state_mut(&mut self, level: usize) -> &mut FunctionState {
        match self.parents.get_mut(level) {
            Some(state) => state,
            None => &mut self.fs,
        }
    }

    /// Resolves `name` as a captured value of the function at `level`,
    /// threading it through every function in between.
    fn resolve_closure_var(&mut self, level: usize, name: &str) -> Option<(u32, StaticType)> {
        if level == 0 {
            return None;
        }

        if let Some(idx) = self.state(level).find_closure(name) {
            let ty = self.state(level).closure_types[idx as usize];
            return Some((idx, ty));
        }

        let parent = level - 1;
        let (in_stack, index, ty) = match self.state_mut(parent).capture_local(name) {
            Some((slot, ty)) => (true, slot as u32, ty),
            None => {
                let (idx, ty) = self.resolve_closure_var(parent, name)?;
                (false, idx, ty)
            }
        };

        Some((self.state_mut(level).add_closure(name, in_stack, index, ty), ty))
    }

    pub(super) fn resolve(&mut self, name: &str) -> Name {
        if let Some(local) = self.fs.find_local(name) {
            return Name::Local(local.slot, local.ty);
        }

        if let Some((idx, ty)) = self.resolve_closure_var(self.parents.len(), name) {
            return Name::Closure(idx, ty);
        }

        if let Some(constant) = self.compile_time.value(name) {
            return Name::Constant(constant.clone(), const_type(constant));
        }

        match name {
            "zr" => Name::Registry,
            _ if self.compile_time.has_function(name) => Name::CompileTimeOnly(name.to_string()),
            _ => Name::Global(name.to_string()),
        }
    }

    /// Captures, in order of first use, every name the body of `decl`
    /// reads from enclosing functions.
    pub fn analyze_external_variables(&mut self, decl: &FnDecl) {
        let mut declared: Vec<&str> = decl.params.iter().map(|p| p.name.as_str()).collect();
        let mut used = vec![];

        declared.extend(decl.varargs.iter().map(|p| p.name.as_str()));
        collect_names(&decl.body, &mut declared, &mut used);

        for name in used {
            if !declared.contains(&name) && self.fs.find_local(name).is_none() {
                self.resolve_closure_var(self.parents.len(), name);
            }
        }
    }

    pub(super) fn enter_scope(&mut self) {
        let first = self.fs.free;
        self.fs.scopes.push(Scope::new(first));
    }

    /// Closes the innermost scope, ending the debug range of its locals.
    /// Captured and to-be-closed slots are closed when `emit_close` is set.
    pub(super) fn exit_scope(&mut self, emit_close: bool) {
        let Some(scope) = self.fs.scopes.pop() else {
            return;
        };

        let pc = self.pc() as u32;

        for local in scope.locals.iter() {
            if let Some(var) = self.fs.function.local_variables.get_mut(local.debug_index) {
                var.offset_dead = pc;
            }
        }

        if emit_close && scope.needs_close() {
            self.emit0(Op::CloseScope, scope.first_slot);
        }
    }

    pub(super) fn in_generator(&self) -> bool {
        !self.fs.generators.is_empty()
    }

    fn add_child(&mut self, child: Rc<Function>) -> Result<u32, CompileError> {
        if self.fs.function.child_functions.len() >= MAX_CHILDREN {
            return Err(ErrorKind::TooManyChildren.at(self.span()));
        }

        self.fs.function.child_functions.push(child);

        Ok((self.fs.function.child_functions.len() - 1) as u32)
    }

    /// Lowers `decl` into a child function and emits `CREATE_CLOSURE`.
    pub(super) fn closure(
        &mut self,
        decl: &FnDecl,
        dst: u16,
        has_this: bool,
    ) -> Result<(), CompileError> {
        let child = self.function(decl, has_this)?;
        let idx = self.add_child(child)?;

        self.emit1(Op::CreateClosure, dst, idx as i32);

        Ok(())
    }

    /// Compiles `decl` with a fresh function state. Methods receive the
    /// instance as an implicit first parameter named `this`.
    pub(super) fn function(
        &mut self,
        decl: &FnDecl,
        has_this: bool,
    ) -> Result<Rc<Function>, CompileError> {
        let line = self.fs.line;
        let parent = mem::replace(&mut self.fs, FunctionState::new(&decl.name, decl.span.line));

        self.parents.push(parent);

        let result = self.function_body(decl, has_this);
        let parent = self.parents.pop().unwrap_or_default();
        let state = mem::replace(&mut self.fs, parent);

        self.fs.line = line;
        result?;

        let function = state.finish()?;

        debug!(
            name = %function.name,
            instructions = function.instructions.len(),
            "compiled function"
        );

        Ok(Rc::new(function))
    }

    fn function_body(&mut self, decl: &FnDecl, has_this: bool) -> Result<(), CompileError> {
        self.enter_scope();

        if has_this {
            self.allocate_local_var("this", StaticType::Unknown)?;
        }

        let mut slots = vec![];

        for param in decl.params.iter() {
            let ty = StaticType::from_annotation(param.ty.as_ref());
            slots.push((self.allocate_local_var(&param.name, ty)?, ty));
        }

        self.fs.function.parameter_count = (has_this as usize + decl.params.len()) as u16;

        if let Some(varargs) = &decl.varargs {
            self.allocate_local_var(&varargs.name, StaticType::Unknown)?;
            self.fs.function.has_variable_arguments = true;
        }

        self.analyze_external_variables(decl);

        for (param, (slot, ty)) in decl.params.iter().zip(slots) {
            self.fs.line = param.span.line;

            if let Some(default) = &param.default {
                let skip = self.create_label();
                let mark = self.temp_mark();
                let cond = self.alloc_temp()?;

                self.load_constant(cond, Const::Null)?;
                self.emit2(Op::LogicalEqual, cond, slot, cond);
                self.jump_to(Op::JumpIfNot, cond, skip);
                self.expr_to(default, slot)?;
                self.resolve_label(skip);
                self.reset_temps(mark);
            }

            if let Some(op) = ty.conversion() {
                self.emit1(op, slot, slot as i32);
            }
        }

        for stmt in decl.body.iter() {
            self.statement(stmt)?;
        }

        self.fs.function.line_end = decl.body.last().map(|s| s.span.line).unwrap_or(decl.span.line);
        self.implicit_return()?;
        self.exit_scope(false);

        Ok(())
    }

    /// Appends `return null` unless the body already ends in a return that
    /// no jump can skip past.
    pub(super) fn implicit_return(&mut self) -> Result<(), CompileError> {
        let pc = self.pc();
        let ends_in_return = self
            .fs
            .function
            .instructions
            .last()
            .is_some_and(|instr| instr.op == Op::FunctionReturn);
        let jumped_to = self.fs.labels.iter().any(|label| *label == Some(pc));

        if ends_in_return && !jumped_to {
            return Ok(());
        }

        let slot = self.alloc_temp()?;

        self.load_constant(slot, Const::Null)?;
        self.emit2(Op::FunctionReturn, slot, 1, 0);

        Ok(())
    }

    /// Records a module-level binding in the export table.
    pub(super) fn export(&mut self, name: &str, slot: u16, access: Access) {
        if !self.fs.at_module_level() {
            return;
        }

        self.fs.function.exported_variables.push(ExportedVariable {
            name: name.to_string(),
            stack_slot: slot as u32,
            access: access_modifier(access),
        });
    }

    pub(super) fn module_decl(&mut self, name: &str) -> Result<(), CompileError> {
        if !self.fs.at_module_level() {
            return Err(ErrorKind::NotTopLevel("module name").at(self.span()));
        }

        self.module_name = Some(name.to_string());

        Ok(())
    }

    pub(super) fn test_decl(&mut self, name: &str, body: &[Stmt]) -> Result<(), CompileError> {
        if !self.fs.at_module_level() {
            return Err(ErrorKind::NotTopLevel("%test").at(self.span()));
        }

        if !self.test_mode {
            return Ok(());
        }

        let line = self.fs.line;
        let entry = mem::replace(&mut self.fs, FunctionState::new(name, line));
        let parents = mem::take(&mut self.parents);
        let result = self.test_body(body);
        let state = mem::replace(&mut self.fs, entry);

        self.parents = parents;
        self.fs.line = line;
        result?;

        self.tests.push((name.to_string(), Rc::new(state.finish()?)));

        Ok(())
    }

    fn test_body(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        self.enter_scope();

        for stmt in body {
            self.statement(stmt)?;
        }

        self.fs.function.line_end = body.last().map(|s| s.span.line).unwrap_or(self.fs.line);
        self.implicit_return()?;
        self.exit_scope(false);

        Ok(())
    }

    /// Lowers a struct or class into a prototype record of the entry
    /// function and binds its name to the instantiated prototype.
    pub(super) fn class_decl(&mut self, class: &ClassDecl) -> Result<(), CompileError> {
        if !self.fs.at_module_level() {
            return Err(ErrorKind::NotTopLevel("struct and class").at(class.span));
        }

        let mut inherits = vec![];

        for parent in class.inherits.iter() {
            match self.fs.prototype_names.iter().position(|n| n == parent) {
                Some(idx) => inherits.push(idx as u32),
                None => self
                    .errors
                    .push(ErrorKind::UnknownPrototype(parent.clone()).at(class.span)),
            }
        }

        let instance_sizes = class
            .fields
            .iter()
            .filter(|field| !field.is_static)
            .map(|field| field_size(field.ty.as_ref().map(|ty| ty.name.as_str())))
            .collect::<Vec<_>>();
        let (offsets, _) = layout_fields(&instance_sizes);
        let mut offsets = offsets.into_iter();
        let mut members = vec![];

        for field in class.fields.iter() {
            let type_name = field.ty.as_ref().map(|ty| ty.name.as_str());
            let size = field_size(type_name);
            let offset = match field.is_static {
                true => 0,
                false => offsets.next().unwrap_or_default(),
            };

            members.push(MemberInfo {
                kind: MemberKind::Field,
                name: self.add_constant(Const::Str(field.name.clone()))?,
                access: access_modifier(field.access),
                is_static: field.is_static,
                field_type_name: match type_name {
                    Some(name) => self.add_constant(Const::Str(name.to_string()))?,
                    None => NONE_INDEX,
                },
                field_offset: offset,
                field_size: size,
                is_meta_method: false,
                meta_type: 0,
                function_index: NONE_INDEX,
                parameter_count: 0,
                return_type_name: NONE_INDEX,
            });
        }

        for method in class.methods.iter() {
            let meta = match method.is_meta {
                true => match MetaMethod::from_name(&method.decl.name) {
                    Some(meta) => Some(meta),
                    None => {
                        self.errors.push(
                            ErrorKind::InvalidMetaMethod(method.decl.name.clone())
                                .at(method.decl.span),
                        );
                        continue;
                    }
                },
                false => None,
            };

            let has_this = !method.is_static;
            let child = self.function(&method.decl, has_this)?;
            let parameter_count = child.parameter_count as u32;
            let function_index = self.add_child(child)?;

            members.push(MemberInfo {
                kind: match meta {
                    Some(_) => MemberKind::MetaMethod,
                    None => MemberKind::Method,
                },
                name: self.add_constant(Const::Str(method.decl.name.clone()))?,
                access: access_modifier(method.decl.access),
                is_static: method.is_static,
                field_type_name: NONE_INDEX,
                field_offset: 0,
                field_size: 0,
                is_meta_method: meta.is_some(),
                meta_type: meta.map(|m| u8::from(m) as u32).unwrap_or_default(),
                function_index,
                parameter_count,
                return_type_name: match &method.decl.ret {
                    Some(ty) => self.add_constant(Const::Str(ty.name.clone()))?,
                    None => NONE_INDEX,
                },
            });
        }

        let info = PrototypeInfo {
            name: self.add_constant(Const::Str(class.name.clone()))?,
            kind: match class.kind {
                ClassKind::Struct => PrototypeKind::Struct,
                ClassKind::Class => PrototypeKind::Class,
            },
            access: access_modifier(class.access),
            inherits,
            members,
        };
        let index = self.fs.prototypes.len();

        self.fs.prototypes.push(info);
        self.fs.prototype_names.push(class.name.clone());

        let slot = self.allocate_local_var(&class.name, StaticType::Unknown)?;

        self.emit1(Op::GetPrototype, slot, index as i32);
        self.export(&class.name, slot, class.access);

        Ok(())
    }
}

fn collect_pattern_names<'a>(stmt: &'a Stmt, declared: &mut Vec<&'a str>) {
    match &stmt.kind {
        StmtKind::Var(decl) => declared.extend(decl.pattern.names()),
        StmtKind::ForEach(pattern, ..) => declared.extend(pattern.names()),
        StmtKind::Fn(decl) => declared.push(decl.name.as_str()),
        StmtKind::Class(class) => declared.push(class.name.as_str()),
        StmtKind::Try(stmt) => {
            if let Some((name, _)) = &stmt.catch {
                declared.push(name.as_str());
            }
        }
        _ => {}
    }
}

/// Collects names declared anywhere in `stmts` and names read by them,
/// without descending into nested functions.
fn collect_names<'a>(stmts: &'a [Stmt], declared: &mut Vec<&'a str>, used: &mut Vec<&'a str>) {
    for stmt in stmts {
        collect_pattern_names(stmt, declared);

        match &stmt.kind {
            StmtKind::Var(decl) => {
                if let Some(value) = &decl.value {
                    collect_expr_names(value, declared, used);
                }
            }
            StmtKind::Expr(expr) | StmtKind::Throw(expr) | StmtKind::Out(expr) => {
                collect_expr_names(expr, declared, used)
            }
            StmtKind::Return(expr) => {
                if let Some(expr) = expr {
                    collect_expr_names(expr, declared, used);
                }
            }
            StmtKind::Block(body) | StmtKind::Test(_, body) => collect_names(body, declared, used),
            StmtKind::If(stmt) => {
                collect_expr_names(&stmt.0, declared, used);
                collect_names(&stmt.1, declared, used);

                if let Some(other) = &stmt.2 {
                    collect_names(std::slice::from_ref(&**other), declared, used);
                }
            }
            StmtKind::While(cond, body) => {
                collect_expr_names(cond, declared, used);
                collect_names(body, declared, used);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    collect_names(std::slice::from_ref(&**init), declared, used);
                }

                for expr in cond.iter().chain(step.iter()) {
                    collect_expr_names(expr, declared, used);
                }

                collect_names(body, declared, used);
            }
            StmtKind::ForEach(_, iter, body) => {
                collect_expr_names(iter, declared, used);
                collect_names(body, declared, used);
            }
            StmtKind::Switch(value, arms, default) => {
                collect_expr_names(value, declared, used);

                for arm in arms {
                    collect_expr_names(&arm.value, declared, used);
                    collect_names(&arm.body, declared, used);
                }

                if let Some(default) = default {
                    collect_names(default, declared, used);
                }
            }
            StmtKind::Try(stmt) => {
                collect_names(&stmt.body, declared, used);

                if let Some((_, body)) = &stmt.catch {
                    collect_names(body, declared, used);
                }

                if let Some(body) = &stmt.finally {
                    collect_names(body, declared, used);
                }
            }
            StmtKind::Module(_)
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Fn(_)
            | StmtKind::Class(_)
            | StmtKind::CompileTime(_) => {}
        }
    }
}

fn collect_expr_names<'a>(
    expr: &'a crate::frontend::ast::Expr,
    declared: &mut Vec<&'a str>,
    used: &mut Vec<&'a str>,
) {
    match &expr.kind {
        ExprKind::Ident(name) => {
            if !used.contains(&name.as_str()) {
                used.push(name.as_str());
            }
        }
        ExprKind::This => {
            if !used.contains(&"this") {
                used.push("this");
            }
        }
        ExprKind::Literal(_) | ExprKind::Lambda(_) => {}
        ExprKind::Unary(_, inner) | ExprKind::Cast(_, inner) | ExprKind::Member(inner, _) => {
            collect_expr_names(inner, declared, used)
        }
        ExprKind::Binary(lhs, _, rhs) | ExprKind::Assign(_, lhs, rhs) | ExprKind::Index(lhs, rhs) => {
            collect_expr_names(lhs, declared, used);
            collect_expr_names(rhs, declared, used);
        }
        ExprKind::Conditional(cond, then, other) => {
            for expr in [cond, then, other] {
                collect_expr_names(expr, declared, used);
            }
        }
        ExprKind::Call(callee, args) => {
            collect_expr_names(callee, declared, used);

            for arg in args {
                collect_expr_names(arg, declared, used);
            }
        }
        ExprKind::Array(items) => {
            for item in items {
                collect_expr_names(item, declared, used);
            }
        }
        ExprKind::Object(entries) => {
            for (key, value) in entries {
                if let ObjectKey::Computed(key) = key {
                    collect_expr_names(key, declared, used);
                }

                collect_expr_names(value, declared, used);
            }
        }
        ExprKind::Generator(body) => collect_names(body, declared, used),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_patch_relative_offsets() {
        let mut compiler = Compiler::new("main");
        let label = compiler.create_label();

        compiler.jump_to(Op::Jump, 0, label);
        compiler.emit0(Op::Nop, 0);
        compiler.emit0(Op::Nop, 0);
        compiler.resolve_label(label);
        compiler.emit0(Op::Nop, 0);

        let function = mem::take(&mut compiler.fs).finish().unwrap();

        assert_eq!(function.instructions[0].i32(), 2);
    }

    #[test]
    fn test_backward_jump() {
        let mut compiler = Compiler::new("main");
        let label = compiler.create_label();

        compiler.resolve_label(label);
        compiler.emit0(Op::Nop, 0);
        compiler.jump_to(Op::Jump, 0, label);

        let function = mem::take(&mut compiler.fs).finish().unwrap();

        assert_eq!(function.instructions[1].i32(), -2);
    }

    #[test]
    fn test_unresolved_label_is_fatal() {
        let mut compiler = Compiler::new("main");
        let label = compiler.create_label();

        compiler.jump_to(Op::Jump, 0, label);

        let err = mem::take(&mut compiler.fs).finish().unwrap_err();

        assert!(err.is_fatal());
    }

    #[test]
    fn test_constants_dedup() {
        let mut compiler = Compiler::new("main");

        assert_eq!(compiler.add_constant(Const::Int(42)).unwrap(), 0);
        assert_eq!(compiler.add_constant(Const::Str("a".into())).unwrap(), 1);
        assert_eq!(compiler.add_constant(Const::Int(42)).unwrap(), 0);
        assert_eq!(compiler.add_constant(Const::Float(42.0)).unwrap(), 2);
    }

    #[test]
    fn test_locals_are_monotonic() {
        let mut compiler = Compiler::new("main");

        compiler.enter_scope();
        let a = compiler.allocate_local_var("a", StaticType::Unknown).unwrap();
        compiler.enter_scope();
        let b = compiler.allocate_local_var("b", StaticType::Unknown).unwrap();
        compiler.exit_scope(true);
        let c = compiler.allocate_local_var("c", StaticType::Unknown).unwrap();

        assert_eq!((a, b, c), (0, 1, 2));
        assert_eq!(compiler.find_local_var("a"), Some(0));
        assert_eq!(compiler.find_local_var("b"), None);
    }

    #[test]
    fn test_duplicate_local_in_scope() {
        let mut compiler = Compiler::new("main");

        compiler.enter_scope();
        compiler.allocate_local_var("a", StaticType::Unknown).unwrap();

        let err = compiler
            .allocate_local_var("a", StaticType::Unknown)
            .unwrap_err();

        assert!(matches!(err.kind, ErrorKind::DuplicateName(_)));
        assert!(!err.is_fatal());
    }
}
