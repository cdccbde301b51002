#[cfg(test)]
#[allow(dead_code)]
mod tests {
    use std::fs;

    use zr_vm::{
        error::Error,
        runtime::{MemoryLoader, Value, Vm, VmConfig},
    };

    pub fn source(name: &str) -> String {
        fs::read_to_string(format!("tests/source/{name}")).expect("test source not found")
    }

    pub fn new_vm() -> Vm {
        Vm::new(VmConfig::default()).expect("failed to create vm")
    }

    /// Runs `tests/source/{name}` and renders its return value.
    pub fn run(name: &str) -> Result<String, Error> {
        let mut vm = new_vm();
        let value = vm.run(&source(name), name)?;

        Ok(vm.display(value)?)
    }

    pub fn run_source(vm: &mut Vm, source: &str) -> Result<Value, Error> {
        vm.run(source, "main")
    }

    /// A vm whose loader serves the given modules from memory.
    pub fn vm_with_modules(modules: &[(&str, &str)]) -> Vm {
        let mut vm = new_vm();
        let loader = modules
            .iter()
            .fold(MemoryLoader::default(), |loader, (path, source)| {
                loader.with(*path, *source)
            });

        vm.set_loader(loader);
        vm
    }
}

#[cfg(test)]
pub use tests::*;
