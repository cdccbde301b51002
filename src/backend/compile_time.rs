use linear_map::LinearMap;
use tracing::debug;

use crate::{
    error::IntoSpanned,
    frontend::{
        ast::{CompileTimeDecl, Expr, ExprKind, FnDecl, Stmt, StmtKind},
        Span,
    },
    runtime::{
        const_value, gc::Gc, ErrorKind as RuntimeErrorKind, GlobalState, RuntimeError, State,
        Value, Vm, VmConfig,
    },
};

use super::{
    bytecode::Const,
    compiler::{CompileError, Compiler, ErrorKind},
    scope::StaticType,
};

/// Values and functions declared with `%compileTime`. Variables are folded
/// into constants wherever runtime code reads them; functions only exist
/// while compile-time code runs.
#[derive(Debug, Default)]
pub struct CompileTimeScope {
    values: LinearMap<String, Const>,
    functions: Vec<FnDecl>,
}

impl CompileTimeScope {
    pub fn value(&self, name: &str) -> Option<&Const> {
        self.values.get(name)
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.name == name)
    }

    /// Compiles `body` after the compile-time functions, runs it on a
    /// private vm and returns the entry function's result.
    fn run(&self, body: Vec<Stmt>) -> Result<Const, String> {
        let mut program = self
            .functions
            .iter()
            .map(|f| StmtKind::Fn(f.clone()).at(f.span))
            .collect::<Vec<_>>();

        program.extend(body);

        let main = Compiler::new("%compileTime")
            .compile(&program)
            .map_err(|e| e.to_string())?
            .main_function;
        let mut vm = self.vm().map_err(|e| e.to_string())?;
        let value = vm.run_function(main).map_err(|e| match e.kind {
            RuntimeErrorKind::Panic(message) => message,
            kind => kind.to_string(),
        })?;

        value_to_const(&vm.global.gc, value).ok_or_else(|| {
            format!("a {} cannot be a compile-time value", value.ty())
        })
    }

    fn vm(&self) -> Result<Vm, RuntimeError> {
        let mut vm = Vm::new(VmConfig::default())?;

        vm.global.register_native("FatalError", fatal_error)?;
        vm.global.register_native("Assert", assert)?;

        for (name, constant) in self.values.iter() {
            let value = const_value(&mut vm.global, constant)?;
            vm.global.register(name, value)?;
        }

        Ok(vm)
    }
}

/// `FatalError(message)`: aborts compilation with `message`.
fn fatal_error(state: &mut State, _global: &mut GlobalState) -> Result<usize, RuntimeError> {
    Err(RuntimeErrorKind::Thrown(state.arg(0)).into())
}

/// `Assert(condition, message?)`: aborts compilation when `condition` is
/// falsy.
fn assert(state: &mut State, global: &mut GlobalState) -> Result<usize, RuntimeError> {
    if state.arg(0).is_truthy() {
        return Ok(0);
    }

    let message = match state.arg(1) {
        Value::Null => Value::Str(global.gc.intern("Assertion failed")?),
        message => message,
    };

    Err(RuntimeErrorKind::Thrown(message).into())
}

fn value_to_const(gc: &Gc, value: Value) -> Option<Const> {
    Some(match value {
        Value::Null => Const::Null,
        Value::Bool(b) => Const::Bool(b),
        Value::Float32(f) => Const::Float(f as f64),
        Value::Float64(f) => Const::Float(f),
        Value::Str(handle) => Const::Str(gc.string(handle).ok()?.to_string()),
        Value::UInt8(_) | Value::UInt16(_) | Value::UInt32(_) | Value::UInt64(_) => {
            Const::UInt(value.as_i128()? as u64)
        }
        other => Const::Int(other.as_i128()? as i64),
    })
}

pub fn const_type(constant: &Const) -> StaticType {
    match constant {
        Const::Null => StaticType::Unknown,
        Const::Bool(_) => StaticType::Bool,
        Const::Int(_) => StaticType::Int,
        Const::UInt(_) => StaticType::UInt,
        Const::Float(_) => StaticType::Float,
        Const::Str(_) => StaticType::Str,
    }
}

impl Compiler {
    pub(super) fn compile_time_decl(
        &mut self,
        decl: &CompileTimeDecl,
        span: Span,
    ) -> Result<(), CompileError> {
        if !self.fs.at_module_level() {
            return Err(ErrorKind::NotTopLevel("%compileTime").at(span));
        }

        match decl {
            CompileTimeDecl::Var(var) => {
                let names = var.pattern.names();
                let [name] = names.as_slice() else {
                    return Err(ErrorKind::InvalidCompileTime("a single name").at(span));
                };
                let Some(value) = &var.value else {
                    return Err(ErrorKind::InvalidCompileTime("an initializer").at(span));
                };
                let value = match &var.ty {
                    Some(ty) if StaticType::from_annotation(Some(ty)).is_known() => {
                        ExprKind::Cast(ty.clone(), Box::new(value.clone())).at(value.span)
                    }
                    _ => value.clone(),
                };
                let constant = self.evaluate(value, span)?;

                debug!(name, value = %constant, "compile-time value");

                self.compile_time.values.insert(name.to_string(), constant);
            }
            CompileTimeDecl::Fn(f) => self.compile_time.functions.push(f.clone()),
            CompileTimeDecl::Block(body) => {
                self.compile_time
                    .run(body.clone())
                    .map_err(|e| ErrorKind::CompileTimeFailed(e).at(span))?;
            }
        }

        Ok(())
    }

    fn evaluate(&self, value: Expr, span: Span) -> Result<Const, CompileError> {
        let body = vec![StmtKind::Return(Some(value)).at(span)];

        self.compile_time
            .run(body)
            .map_err(|e| ErrorKind::CompileTimeFailed(e).at(span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_const() {
        let gc = Gc::new(
            Box::new(crate::runtime::gc::SystemAllocator::default()),
            crate::runtime::gc::GC_THRESHOLD,
        );

        assert_eq!(value_to_const(&gc, Value::Int32(-4)), Some(Const::Int(-4)));
        assert_eq!(value_to_const(&gc, Value::UInt8(4)), Some(Const::UInt(4)));
        assert_eq!(value_to_const(&gc, Value::Bool(true)), Some(Const::Bool(true)));
        assert_eq!(value_to_const(&gc, Value::NativePointer(1)), None);
    }
}
