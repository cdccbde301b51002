use std::{cell::Cell, collections::HashMap, rc::Rc};

use linear_map::LinearMap;
use wyhash2::WyHash;

mod call_info;
mod closure;
mod error;
mod exec;
mod function;
pub mod gc;
mod meta;
mod module;
mod object;
pub mod ops;
mod prototype;
mod stack;
mod state;
mod value;
mod vm;

pub use call_info::{CallContext, CallInfo, CallStatus};
pub use closure::{BoundMethod, Closure, ClosureValue, NativeClosure, NativeFn};
pub use error::{Call, ErrorKind, RuntimeError};
pub use function::{AccessModifier, ClosureVariable, ExportedVariable, Function, LocalVariable};
pub use meta::{MetaMethod, MetaTable};
pub use module::{
    import, path_hash, reload, CompileSourceFn, Export, FileSystemLoader, LoadBinaryFn, LoadedModule,
    MemoryLoader, Module, ModuleLoader,
};
pub use object::{NativeData, Object};
pub use prototype::{FieldInfo, Member, Prototype};
pub use stack::{
    Address, Stack, StackSlot, BASIC_STACK_SIZE, ERROR_STACK_SIZE, MAX_STACK_SIZE,
    NATIVE_CALL_MIN, STACK_CLOSURE_BASE, STACK_GLOBAL_MODULE_REGISTRY, STACK_NEGATIVE_LIMIT,
};
pub use state::{State, ThreadStatus};
pub use value::{ObjectKey, Value, ValueType};
pub use vm::{TestOutcome, Vm};

pub(crate) use exec::const_value;

use gc::{Allocator, Gc, Handle, HeapData, Marker, SystemAllocator, GC_THRESHOLD};

/// Receives the thread an exception escaped from and the thrown value.
pub type PanicHandler = Box<dyn FnMut(&mut State, &mut GlobalState, Value)>;

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub initial_stack_size: usize,
    pub max_stack_size: usize,
    pub gc_threshold: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            initial_stack_size: BASIC_STACK_SIZE,
            max_stack_size: MAX_STACK_SIZE,
            gc_threshold: GC_THRESHOLD,
        }
    }
}

/// State shared by every thread: the heap, the `zr` registry, the module
/// cache and the host hooks.
pub struct GlobalState {
    pub gc: Gc,
    pub config: VmConfig,
    pub registry: Handle,
    pub module_cache: HashMap<u64, Handle, WyHash>,
    pub loader: Option<Box<dyn ModuleLoader>>,
    pub compile_source: Option<CompileSourceFn>,
    pub load_binary: Option<LoadBinaryFn>,
    /// Prototypes built from an entry function's blob, keyed by function
    /// identity. The function is kept alive so the key stays unique.
    pub(crate) prototypes: HashMap<usize, (Rc<Function>, Vec<Handle>), WyHash>,
    type_metas: LinearMap<ValueType, MetaTable>,
    panic_handler: Option<PanicHandler>,
    pub(crate) live_states: Rc<Cell<usize>>,
}

impl GlobalState {
    pub fn new(config: VmConfig) -> Result<Self, RuntimeError> {
        Self::with_allocator(config, Box::new(SystemAllocator::default()))
    }

    pub fn with_allocator(
        config: VmConfig,
        allocator: Box<dyn Allocator>,
    ) -> Result<Self, RuntimeError> {
        let mut gc = Gc::new(allocator, config.gc_threshold);
        let registry = gc.alloc(HeapData::Object(Object::default()))?;

        gc.set_permanent(registry)?;

        Ok(Self {
            gc,
            config,
            registry,
            module_cache: HashMap::default(),
            loader: None,
            compile_source: None,
            load_binary: None,
            prototypes: HashMap::default(),
            type_metas: LinearMap::new(),
            panic_handler: None,
            live_states: Rc::new(Cell::new(0)),
        })
    }

    pub fn set_loader(&mut self, loader: impl ModuleLoader + 'static) {
        self.loader = Some(Box::new(loader));
    }

    /// Installs the handler invoked with the exception value of an uncaught
    /// throw at the outermost call.
    pub fn set_panic_handler(
        &mut self,
        handler: impl FnMut(&mut State, &mut GlobalState, Value) + 'static,
    ) {
        self.panic_handler = Some(Box::new(handler));
    }

    pub(crate) fn take_panic_handler(&mut self) -> Option<PanicHandler> {
        self.panic_handler.take()
    }

    pub(crate) fn restore_panic_handler(&mut self, handler: PanicHandler) {
        self.panic_handler.get_or_insert(handler);
    }

    /// Registers `value` under `name` in the `zr` registry object.
    pub fn register(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        let key = Value::Str(self.gc.intern(name)?);
        self.gc.object_mut(self.registry)?.set(key, value);
        self.gc.resize(self.registry)
    }

    pub fn register_native(&mut self, name: &'static str, f: NativeFn) -> Result<(), RuntimeError> {
        let native = self.new_native(name, f)?;
        self.register(name, native)
    }

    /// Sets a metamethod shared by every value of type `ty` that has no
    /// prototype of its own.
    pub fn set_type_meta(&mut self, ty: ValueType, meta: MetaMethod, value: Value) {
        self.type_metas
            .entry(ty)
            .or_insert_with(MetaTable::default)
            .set(meta, value);
    }

    /// Resolves a metamethod: the prototype chain of an object first, then
    /// the per-type table.
    pub fn get_meta(&self, value: Value, meta: MetaMethod) -> Result<Option<Value>, RuntimeError> {
        if let Value::Object(handle) = value {
            if let HeapData::Object(object) = self.gc.get(handle)? {
                if let Some(prototype) = object.prototype {
                    if let Some(found) = self.gc.find_meta(prototype, meta)? {
                        return Ok(Some(found));
                    }
                }
            }
        }

        Ok(self
            .type_metas
            .get(&value.ty())
            .and_then(|table| table.get(meta)))
    }

    pub fn live_states(&self) -> usize {
        self.live_states.get()
    }

    /// Runs a full collection with `state` as the only thread root.
    pub fn collect(&mut self, state: &State) {
        let Self {
            gc,
            registry,
            module_cache,
            prototypes,
            type_metas,
            ..
        } = self;

        gc.collect(|marker: &mut Marker| {
            marker.mark(*registry);

            for module in module_cache.values() {
                marker.mark(*module);
            }

            for (_, handles) in prototypes.values() {
                for handle in handles {
                    marker.mark(*handle);
                }
            }

            for table in type_metas.values() {
                for value in table.values() {
                    gc::Trace::trace(&value, marker);
                }
            }

            state.trace_roots(marker);
        });
    }
}
