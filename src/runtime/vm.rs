use std::rc::Rc;

use tracing::{debug, instrument, warn};

use crate::{
    backend::{self, zro},
    error::Error,
};

use super::{
    gc::HeapData, import, reload, Function, GlobalState, LoadedModule, ModuleLoader,
    RuntimeError, State, Value, VmConfig,
};

/// Outcome of one `%test` block.
#[derive(Debug, Clone, PartialEq)]
pub struct TestOutcome {
    pub name: String,
    /// The error message when the test failed.
    pub error: Option<String>,
}

impl TestOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

fn compile_source(source: &str, path: &str) -> Result<LoadedModule, String> {
    let result = backend::compile(source, path, false).map_err(|e| format!("{e} at {}", e.span()))?;

    Ok(LoadedModule {
        function: result.main_function,
        name: result.module_name,
    })
}

fn load_binary(data: &[u8]) -> Result<LoadedModule, String> {
    let module = zro::read_module(data).map_err(|e| e.to_string())?;

    Ok(LoadedModule {
        function: module.entry,
        name: Some(module.name).filter(|name| !name.is_empty()),
    })
}

/// `print(...)`: writes its arguments separated by spaces.
fn print(state: &mut State, global: &mut GlobalState) -> Result<usize, RuntimeError> {
    let mut parts = Vec::with_capacity(state.arg_count());

    for i in 0..state.arg_count() {
        let value = state.arg(i);
        parts.push(state.stringify(global, value)?);
    }

    println!("{}", parts.join(" "));

    Ok(0)
}

/// `iter(value)`: an indexable sequence over `value`. Arrays are returned
/// as-is, objects and modules yield `[key, value]` pairs and strings yield
/// their characters.
fn iter(state: &mut State, global: &mut GlobalState) -> Result<usize, RuntimeError> {
    let value = state.arg(0);
    let items = match value {
        Value::Array(_) => {
            state.stack.push(value)?;
            return Ok(1);
        }
        Value::Str(handle) => {
            let chars = global
                .gc
                .string(handle)?
                .chars()
                .map(|c| c.to_string())
                .collect::<Vec<_>>();

            chars
                .iter()
                .map(|c| Ok(Value::Str(global.gc.intern(c)?)))
                .collect::<Result<Vec<_>, RuntimeError>>()?
        }
        Value::Object(handle) => {
            let entries = match global.gc.get(handle)? {
                HeapData::Object(object) => object.iter().copied().collect::<Vec<_>>(),
                HeapData::Module(module) => module.public.iter().copied().collect(),
                _ => vec![],
            };

            entries
                .into_iter()
                .map(|(key, value)| {
                    let pair = global.gc.alloc(HeapData::Array(vec![key, value]))?;
                    Ok(Value::Array(pair))
                })
                .collect::<Result<Vec<_>, RuntimeError>>()?
        }
        other => {
            warn!(ty = %other.ty(), "value is not iterable");
            vec![]
        }
    };

    let array = global.gc.alloc(HeapData::Array(items))?;

    state.stack.push(Value::Array(array))?;

    Ok(1)
}

/// A ready-to-run interpreter: one global state, one thread, the source
/// compiler and binary reader hooked in and the builtins registered.
pub struct Vm {
    pub global: GlobalState,
    pub state: State,
}

impl Vm {
    pub fn new(config: VmConfig) -> Result<Self, RuntimeError> {
        let mut global = GlobalState::new(config)?;

        global.compile_source = Some(compile_source);
        global.load_binary = Some(load_binary);
        global.register_native("print", print)?;
        global.register_native("import", import)?;
        global.register_native("reload", reload)?;
        global.register_native("iter", iter)?;

        let state = State::new(&mut global)?;

        Ok(Self { global, state })
    }

    pub fn set_loader(&mut self, loader: impl ModuleLoader + 'static) {
        self.global.set_loader(loader);
    }

    /// Compiles and runs `source` and returns the value its entry function
    /// returned.
    #[instrument(skip(self, source))]
    pub fn run(&mut self, source: &str, name: &str) -> Result<Value, Error> {
        let result = backend::compile(source, name, false)?;

        Ok(self.run_function(result.main_function)?)
    }

    /// Calls `function` as a module entry with no arguments.
    pub fn run_function(&mut self, function: Rc<Function>) -> Result<Value, RuntimeError> {
        let closure = self.global.new_closure(function)?;
        let func = self.state.stack.top;

        self.state.check_stack(&mut self.global, 1)?;
        self.state.stack.push(Value::Closure(closure))?;

        let result = self.state.call(&mut self.global, func, 1);
        let value = self.state.stack.get(func);

        self.state.stack.top = func;
        self.state.exports.clear();
        result?;

        Ok(value)
    }

    /// Runs the entry function of `source` and then every `%test` block in
    /// declaration order. A failing test does not stop the others.
    #[instrument(skip(self, source))]
    pub fn run_tests(&mut self, source: &str, name: &str) -> Result<Vec<TestOutcome>, Error> {
        let result = backend::compile(source, name, true)?;

        self.run_function(result.main_function)?;

        let mut outcomes = vec![];

        for (name, function) in result.test_functions {
            let error = self.run_function(function).err().map(|e| e.to_string());

            match &error {
                Some(error) => warn!(test = %name, %error, "test failed"),
                None => debug!(test = %name, "test passed"),
            }

            outcomes.push(TestOutcome { name, error });
        }

        Ok(outcomes)
    }

    pub fn display(&mut self, value: Value) -> Result<String, RuntimeError> {
        self.state.stringify(&mut self.global, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> String {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        let value = vm.run(source, "main").unwrap();

        vm.display(value).unwrap()
    }

    #[test]
    fn test_return_value() {
        assert_eq!(run("return 1 + 2;"), "3");
    }

    #[test]
    fn test_iter_object_pairs() {
        assert_eq!(
            run("var out = []; for (var [k, v] in {a: 1}) { out[0] = k; out[1] = v; } return out;"),
            "[\"a\", 1]"
        );
    }

    #[test]
    fn test_iter_string_chars() {
        assert_eq!(
            run("var n = 0; for (var c in \"abc\") { n = n + 1; } return n;"),
            "3"
        );
    }

    #[test]
    fn test_run_tests_reports_failures() {
        let mut vm = Vm::new(VmConfig::default()).unwrap();
        let outcomes = vm
            .run_tests(
                "%test(\"ok\") { var a = 1; } %test(\"fails\") { throw \"boom\"; }",
                "main",
            )
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].passed());
        assert!(!outcomes[1].passed());
    }
}
