use std::{
    collections::HashMap,
    hash::BuildHasher,
    io::{Cursor, Read},
    path::{Path, PathBuf},
    rc::Rc,
};

use tracing::{debug, warn};
use wyhash2::WyHash;

use super::{
    error::{ErrorKind, RuntimeError},
    function::{AccessModifier, Function},
    gc::{Handle, HeapData, Marker, Trace},
    object::Object,
    state::State,
    value::Value,
    GlobalState,
};

/// Extension of precompiled modules.
pub const BINARY_EXTENSION: &str = "zro";
pub const SOURCE_EXTENSION: &str = "zr";

/// A function ready to run as a module entry, with the name it declares.
pub struct LoadedModule {
    pub function: Rc<Function>,
    pub name: Option<String>,
}

pub type CompileSourceFn = fn(source: &str, path: &str) -> Result<LoadedModule, String>;
pub type LoadBinaryFn = fn(data: &[u8]) -> Result<LoadedModule, String>;

/// A loaded module. Everything in `public` is also in `protected`.
pub struct Module {
    pub name: Option<String>,
    pub path_hash: u64,
    pub full_path: String,
    pub public: Object,
    pub protected: Object,
}

impl Module {
    pub fn new(name: Option<String>, path_hash: u64, full_path: impl Into<String>) -> Self {
        Self {
            name,
            path_hash,
            full_path: full_path.into(),
            public: Object::default(),
            protected: Object::default(),
        }
    }

    pub fn add_pub_export(&mut self, key: Value, value: Value) {
        self.public.set(key, value);
        self.protected.set(key, value);
    }

    pub fn add_pro_export(&mut self, key: Value, value: Value) {
        self.protected.set(key, value);
    }

    pub fn get_pub_export(&self, key: Value) -> Option<Value> {
        self.public.get(key)
    }

    pub fn get_pro_export(&self, key: Value) -> Option<Value> {
        self.protected.get(key)
    }
}

impl Trace for Module {
    fn trace(&self, marker: &mut Marker) {
        self.public.trace(marker);
        self.protected.trace(marker);
    }
}

/// Resolves import paths to readable module contents.
pub trait ModuleLoader {
    fn load(&mut self, path: &str, md5: Option<&str>) -> Option<Box<dyn Read>>;
}

/// Serves modules from memory; used by embedders and tests.
#[derive(Default)]
pub struct MemoryLoader {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryLoader {
    pub fn insert(&mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), data.into());
    }

    pub fn with(mut self, path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(path, data);
        self
    }
}

impl ModuleLoader for MemoryLoader {
    fn load(&mut self, path: &str, _md5: Option<&str>) -> Option<Box<dyn Read>> {
        self.files
            .get(path)
            .map(|data| Box::new(Cursor::new(data.clone())) as Box<dyn Read>)
    }
}

/// Reads modules relative to a root directory. Paths without an extension
/// are looked up as source files.
pub struct FileSystemLoader {
    root: PathBuf,
}

impl FileSystemLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModuleLoader for FileSystemLoader {
    fn load(&mut self, path: &str, _md5: Option<&str>) -> Option<Box<dyn Read>> {
        let mut full = self.root.join(path);

        if full.extension().is_none() {
            full.set_extension(SOURCE_EXTENSION);
        }

        match std::fs::File::open(&full) {
            Ok(file) => Some(Box::new(file)),
            Err(e) => {
                debug!(path = %full.display(), error = %e, "module file not readable");
                None
            }
        }
    }
}

pub fn path_hash(path: &str) -> u64 {
    WyHash::default().hash_one(path)
}

fn is_binary(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext == BINARY_EXTENSION)
}

/// An exported binding captured when a module entry function returns.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub value: Value,
    pub access: AccessModifier,
}

impl GlobalState {
    fn load_module(&mut self, path: &str) -> Result<LoadedModule, String> {
        let loader = self.loader.as_mut().ok_or("no module loader registered")?;
        let mut reader = loader
            .load(path, None)
            .ok_or_else(|| format!("module '{path}' not found"))?;
        let mut data = vec![];

        reader
            .read_to_end(&mut data)
            .map_err(|e| format!("failed to read module '{path}': {e}"))?;

        if is_binary(path) {
            let load_binary = self.load_binary.ok_or("no binary reader registered")?;
            load_binary(&data)
        } else {
            let compile_source = self.compile_source.ok_or("no compiler registered")?;
            let source = String::from_utf8(data)
                .map_err(|e| format!("module '{path}' is not valid UTF-8: {e}"))?;

            compile_source(&source, path)
        }
    }
}

impl State {
    /// Loads, runs and caches the module at `path`. Returns `None` when the
    /// module could not be produced; the reason has been logged.
    pub fn import_module(
        &mut self,
        global: &mut GlobalState,
        path: &str,
    ) -> Result<Option<Handle>, RuntimeError> {
        match global.module_cache.get(&path_hash(path)) {
            Some(module) => Ok(Some(*module)),
            None => self.load_module(global, path),
        }
    }

    /// Loads and runs the module at `path` again, replacing its cache entry.
    /// On failure the previously cached module stays in place.
    pub fn reload_module(
        &mut self,
        global: &mut GlobalState,
        path: &str,
    ) -> Result<Option<Handle>, RuntimeError> {
        self.load_module(global, path)
    }

    fn load_module(
        &mut self,
        global: &mut GlobalState,
        path: &str,
    ) -> Result<Option<Handle>, RuntimeError> {
        let hash = path_hash(path);

        let loaded = match global.load_module(path) {
            Ok(loaded) => loaded,
            Err(reason) => {
                warn!(path, %reason, "import failed");
                return Ok(None);
            }
        };

        let module = global.gc.alloc(HeapData::Module(Module::new(
            loaded.name.clone(),
            hash,
            path,
        )))?;
        let closure = global.new_closure(Rc::clone(&loaded.function))?;
        let saved_top = self.stack.top;

        self.check_stack(global, 2)?;
        self.stack.push(Value::Object(module))?;
        self.stack.push(Value::Closure(closure))?;

        let result = self.call(global, saved_top + 1, 0);
        let exports = std::mem::take(&mut self.exports);

        self.stack.top = saved_top;

        if let Err(e) = result {
            if matches!(e.kind, ErrorKind::Interrupted) {
                return Err(e);
            }

            warn!(path, error = %e, "module execution failed");
            return Ok(None);
        }

        for export in exports {
            let key = Value::Str(global.gc.intern(&export.name)?);
            let module = global.gc.module_mut(module)?;

            match export.access {
                AccessModifier::Public => module.add_pub_export(key, export.value),
                AccessModifier::Protected => module.add_pro_export(key, export.value),
                AccessModifier::Private => {}
            }
        }

        self.export_prototypes(global, module, &loaded.function)?;

        global.gc.resize(module)?;

        if global.module_cache.insert(hash, module).is_some() {
            debug!(path, "module cache entry replaced");
        }

        Ok(Some(module))
    }

    fn export_prototypes(
        &mut self,
        global: &mut GlobalState,
        module: Handle,
        function: &Rc<Function>,
    ) -> Result<(), RuntimeError> {
        let key = Rc::as_ptr(function) as usize;
        let Some((_, handles)) = global.prototypes.get(&key) else {
            return Ok(());
        };

        for handle in handles.clone() {
            let (name, access) = {
                let proto = global.gc.prototype(handle)?;
                (Value::Str(proto.name), proto.access)
            };
            let module = global.gc.module_mut(module)?;

            if module.get_pro_export(name).is_some() {
                continue;
            }

            match access {
                AccessModifier::Public => module.add_pub_export(name, Value::Object(handle)),
                AccessModifier::Protected => module.add_pro_export(name, Value::Object(handle)),
                AccessModifier::Private => {}
            }
        }

        Ok(())
    }
}

/// `zr.import(path)`: returns the module object or null.
fn import_native(
    state: &mut State,
    global: &mut GlobalState,
    reload: bool,
) -> Result<usize, RuntimeError> {
    let module = match state.arg(0) {
        Value::Str(path) => {
            let path = global.gc.string(path)?.to_string();
            let module = match reload {
                true => state.reload_module(global, &path)?,
                false => state.import_module(global, &path)?,
            };

            module.map(Value::Object).unwrap_or(Value::Null)
        }
        other => {
            warn!(ty = %other.ty(), "import path is not a string");
            Value::Null
        }
    };

    state.stack.push(module)?;

    Ok(1)
}

/// `import(path)`: the cached module for `path`, loading it on first use.
pub fn import(state: &mut State, global: &mut GlobalState) -> Result<usize, RuntimeError> {
    import_native(state, global, false)
}

/// `reload(path)`: loads `path` again and replaces the cached module.
pub fn reload(state: &mut State, global: &mut GlobalState) -> Result<usize, RuntimeError> {
    import_native(state, global, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pub_is_subset_of_pro() {
        let mut module = Module::new(None, 0, "m");

        module.add_pub_export(Value::Int64(1), Value::Bool(true));
        module.add_pro_export(Value::Int64(2), Value::Bool(false));

        assert_eq!(module.get_pub_export(Value::Int64(1)), Some(Value::Bool(true)));
        assert_eq!(module.get_pro_export(Value::Int64(1)), Some(Value::Bool(true)));
        assert_eq!(module.get_pub_export(Value::Int64(2)), None);
        assert_eq!(module.get_pro_export(Value::Int64(2)), Some(Value::Bool(false)));
    }

    #[test]
    fn test_memory_loader() {
        let mut loader = MemoryLoader::default().with("a.zr", "return 1;");
        let mut out = String::new();

        loader
            .load("a.zr", None)
            .unwrap()
            .read_to_string(&mut out)
            .unwrap();

        assert_eq!(out, "return 1;");
        assert!(loader.load("b.zr", None).is_none());
    }

    #[test]
    fn test_binary_extension() {
        assert!(is_binary("lib/math.zro"));
        assert!(!is_binary("lib/math.zr"));
        assert!(!is_binary("math"));
    }
}
