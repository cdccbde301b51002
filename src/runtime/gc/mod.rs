use std::{collections::HashMap, hash::BuildHasher, mem, rc::Rc};

use tracing::debug;
use wyhash2::WyHash;

mod allocator;
mod handle;

pub use allocator::{AllocError, AllocTag, Allocator, LimitedAllocator, SystemAllocator};
pub use handle::Handle;

use super::{
    closure::{BoundMethod, Closure, ClosureValue, NativeClosure},
    error::{ErrorKind, RuntimeError},
    function::Function,
    module::Module,
    object::{NativeData, Object},
    prototype::Prototype,
    value::Value,
};

pub const GC_THRESHOLD: usize = 256_000;

pub trait Trace {
    fn trace(&self, marker: &mut Marker);
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, marker: &mut Marker) {
        for item in self.iter() {
            item.trace(marker);
        }
    }
}

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, marker: &mut Marker) {
        if let Some(item) = self {
            item.trace(marker);
        }
    }
}

impl Trace for Handle {
    fn trace(&self, marker: &mut Marker) {
        marker.mark(*self);
    }
}

/// Gray worklist of the mark phase.
#[derive(Default)]
pub struct Marker {
    gray: Vec<Handle>,
}

impl Marker {
    pub fn mark(&mut self, handle: Handle) {
        self.gray.push(handle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    String,
    Object,
    Array,
    Closure,
    NativeClosure,
    ClosureValue,
    Function,
    Module,
    Prototype,
    BoundMethod,
    NativeData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    White,
    Black,
}

#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub kind: ObjectKind,
    pub mark: Mark,
    pub age: u8,
    pub hash: u64,
    pub permanent: bool,
    size: usize,
}

/// Payload of a heap object.
pub enum HeapData {
    Str(Box<str>),
    Object(Object),
    Array(Vec<Value>),
    Closure(Closure),
    NativeClosure(NativeClosure),
    ClosureValue(ClosureValue),
    Function(Rc<Function>),
    Module(Module),
    Prototype(Prototype),
    BoundMethod(BoundMethod),
    NativeData(NativeData),
}

impl HeapData {
    pub fn kind(&self) -> ObjectKind {
        match self {
            HeapData::Str(_) => ObjectKind::String,
            HeapData::Object(_) => ObjectKind::Object,
            HeapData::Array(_) => ObjectKind::Array,
            HeapData::Closure(_) => ObjectKind::Closure,
            HeapData::NativeClosure(_) => ObjectKind::NativeClosure,
            HeapData::ClosureValue(_) => ObjectKind::ClosureValue,
            HeapData::Function(_) => ObjectKind::Function,
            HeapData::Module(_) => ObjectKind::Module,
            HeapData::Prototype(_) => ObjectKind::Prototype,
            HeapData::BoundMethod(_) => ObjectKind::BoundMethod,
            HeapData::NativeData(_) => ObjectKind::NativeData,
        }
    }

    /// Approximate footprint used for allocation accounting.
    fn size(&self) -> usize {
        let payload = match self {
            HeapData::Str(s) => s.len(),
            HeapData::Object(o) => o.len() * mem::size_of::<(Value, Value)>() * 2,
            HeapData::Array(a) => a.capacity() * mem::size_of::<Value>(),
            HeapData::Closure(c) => c.values.len() * mem::size_of::<Handle>(),
            HeapData::NativeClosure(c) => c.values.len() * mem::size_of::<Value>(),
            HeapData::Module(m) => (m.public.len() + m.protected.len()) * 64,
            HeapData::Prototype(p) => p.members.len() * 64,
            _ => 0,
        };

        mem::size_of::<Slot>() + payload
    }
}

impl Trace for HeapData {
    fn trace(&self, marker: &mut Marker) {
        match self {
            HeapData::Str(_) | HeapData::Function(_) | HeapData::NativeData(_) => {}
            HeapData::Object(o) => o.trace(marker),
            HeapData::Array(a) => a.trace(marker),
            HeapData::Closure(c) => c.trace(marker),
            HeapData::NativeClosure(c) => c.trace(marker),
            HeapData::ClosureValue(c) => c.trace(marker),
            HeapData::Module(m) => m.trace(marker),
            HeapData::Prototype(p) => p.trace(marker),
            HeapData::BoundMethod(b) => b.trace(marker),
        }
    }
}

struct Entry {
    header: ObjectHeader,
    data: HeapData,
}

#[derive(Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Debug, Default, Clone)]
pub struct GcStats {
    pub alloc_count: usize,
    pub collections: usize,
    pub freed: usize,
}

macro_rules! accessors {
    ($(($get:ident, $get_mut:ident, $variant:ident, $ty:ty)),+) => {
        impl Gc {
            $(pub fn $get(&self, handle: Handle) -> Result<&$ty, RuntimeError> {
                match self.get(handle)? {
                    HeapData::$variant(data) => Ok(data),
                    _ => Err(ErrorKind::StaleHandle(handle).into()),
                }
            }

            pub fn $get_mut(&mut self, handle: Handle) -> Result<&mut $ty, RuntimeError> {
                match self.get_mut(handle)? {
                    HeapData::$variant(data) => Ok(data),
                    _ => Err(ErrorKind::StaleHandle(handle).into()),
                }
            })+
        }
    };
}

/// Arena of every heap object, owned by the global state.
///
/// Objects are reachable only through generation-checked handles, so the
/// sweep is a plain pass over the slot vector and nothing dangles.
pub struct Gc {
    pub ready: bool,
    slots: Vec<Slot>,
    free: Vec<u32>,
    strings: HashMap<u64, Vec<Handle>, WyHash>,
    allocator: Box<dyn Allocator>,
    base_threshold: usize,
    threshold: usize,
    debt: usize,
    disabled: bool,
    stats: GcStats,
}

impl Default for Gc {
    fn default() -> Self {
        Self::new(Box::new(SystemAllocator::default()), GC_THRESHOLD)
    }
}

impl Gc {
    pub fn new(allocator: Box<dyn Allocator>, threshold: usize) -> Self {
        Self {
            ready: false,
            slots: vec![],
            free: vec![],
            strings: HashMap::default(),
            allocator,
            base_threshold: threshold,
            threshold,
            debt: 0,
            disabled: false,
            stats: GcStats::default(),
        }
    }

    pub fn stats(&self) -> GcStats {
        self.stats.clone()
    }

    #[allow(dead_code)]
    pub fn disable(&mut self) {
        self.disabled = true;
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.allocator.in_use()
    }

    /// Funnel for memory the runtime owns outside the arena (the value stack).
    pub fn reallocate(
        &mut self,
        old_size: usize,
        new_size: usize,
        tag: AllocTag,
    ) -> Result<(), RuntimeError> {
        self.allocator
            .reallocate(old_size, new_size, tag)
            .map_err(|_| ErrorKind::MemoryError.into())
    }

    fn track(&mut self, data: HeapData, hash: Option<u64>) -> Result<Handle, RuntimeError> {
        let size = data.size();
        let tag = match data {
            HeapData::Str(_) => AllocTag::String,
            _ => AllocTag::Object,
        };

        self.reallocate(0, size, tag)?;

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        let handle = Handle::new(index, slot.generation);

        slot.entry = Some(Entry {
            header: ObjectHeader {
                kind: data.kind(),
                mark: Mark::White,
                age: 0,
                hash: hash.unwrap_or_else(|| handle.identity_hash()),
                permanent: false,
                size,
            },
            data,
        });

        self.debt += size;
        self.ready = !self.disabled && self.debt >= self.threshold;
        self.stats.alloc_count += 1;

        Ok(handle)
    }

    pub fn alloc(&mut self, data: HeapData) -> Result<Handle, RuntimeError> {
        debug_assert!(!matches!(data, HeapData::Str(_)), "strings must be interned");
        self.track(data, None)
    }

    pub fn intern(&mut self, s: &str) -> Result<Handle, RuntimeError> {
        let hash = WyHash::default().hash_one(s);

        if let Some(bucket) = self.strings.get(&hash) {
            for handle in bucket {
                if let Ok(HeapData::Str(existing)) = self.get(*handle) {
                    if existing.as_ref() == s {
                        return Ok(*handle);
                    }
                }
            }
        }

        let handle = self.track(HeapData::Str(s.into()), Some(hash))?;
        self.strings.entry(hash).or_default().push(handle);

        Ok(handle)
    }

    /// Re-accounts an object whose payload grew or shrank in place.
    pub fn resize(&mut self, handle: Handle) -> Result<(), RuntimeError> {
        let (old_size, new_size) = {
            let entry = self.entry(handle)?;
            (entry.header.size, entry.data.size())
        };

        if old_size == new_size {
            return Ok(());
        }

        self.reallocate(old_size, new_size, AllocTag::Object)?;

        if let Some(entry) = self.slots[handle.index()].entry.as_mut() {
            entry.header.size = new_size;
        }

        if new_size > old_size {
            self.debt += new_size - old_size;
            self.ready = !self.disabled && self.debt >= self.threshold;
        }

        Ok(())
    }

    fn entry(&self, handle: Handle) -> Result<&Entry, RuntimeError> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or_else(|| ErrorKind::StaleHandle(handle).into())
    }

    pub fn is_alive(&self, handle: Handle) -> bool {
        self.entry(handle).is_ok()
    }

    pub fn get(&self, handle: Handle) -> Result<&HeapData, RuntimeError> {
        self.entry(handle).map(|entry| &entry.data)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut HeapData, RuntimeError> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
            .map(|entry| &mut entry.data)
            .ok_or_else(|| ErrorKind::StaleHandle(handle).into())
    }

    pub fn header(&self, handle: Handle) -> Result<&ObjectHeader, RuntimeError> {
        self.entry(handle).map(|entry| &entry.header)
    }

    pub fn set_permanent(&mut self, handle: Handle) -> Result<(), RuntimeError> {
        match self
            .slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.entry.as_mut())
        {
            Some(entry) => {
                entry.header.permanent = true;
                Ok(())
            }
            None => Err(ErrorKind::StaleHandle(handle).into()),
        }
    }

    pub fn string(&self, handle: Handle) -> Result<&str, RuntimeError> {
        match self.get(handle)? {
            HeapData::Str(s) => Ok(s),
            _ => Err(ErrorKind::StaleHandle(handle).into()),
        }
    }

    pub fn function(&self, handle: Handle) -> Result<Rc<Function>, RuntimeError> {
        match self.get(handle)? {
            HeapData::Function(f) => Ok(Rc::clone(f)),
            _ => Err(ErrorKind::StaleHandle(handle).into()),
        }
    }

    /// Marks everything reachable from `roots` and frees the rest.
    pub fn collect(&mut self, roots: impl FnOnce(&mut Marker)) {
        if self.disabled {
            return;
        }

        let mut marker = Marker::default();
        roots(&mut marker);

        while let Some(handle) = marker.gray.pop() {
            let Some(slot) = self.slots.get_mut(handle.index()) else {
                continue;
            };

            if slot.generation != handle.generation {
                continue;
            }

            if let Some(entry) = slot.entry.as_mut() {
                if entry.header.mark == Mark::Black {
                    continue;
                }

                entry.header.mark = Mark::Black;
                entry.data.trace(&mut marker);
            }
        }

        let freed = self.sweep();

        self.stats.collections += 1;
        self.stats.freed += freed;
        self.debt = 0;
        self.threshold = self.base_threshold.max(self.allocator.in_use());
        self.ready = false;

        debug!(
            freed,
            live = self.live_count(),
            in_use = self.allocator.in_use(),
            "gc cycle"
        );
    }

    fn sweep(&mut self) -> usize {
        let mut freed = 0;

        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            let Some(entry) = slot.entry.as_mut() else {
                continue;
            };

            if entry.header.permanent || entry.header.mark == Mark::Black {
                entry.header.mark = Mark::White;
                entry.header.age = entry.header.age.saturating_add(1);
                continue;
            }

            let Some(entry) = slot.entry.take() else {
                continue;
            };
            let handle = Handle::new(index as u32, slot.generation);

            slot.generation = slot.generation.wrapping_add(1);

            if let HeapData::Str(_) = entry.data {
                if let Some(bucket) = self.strings.get_mut(&entry.header.hash) {
                    bucket.retain(|h| *h != handle);

                    if bucket.is_empty() {
                        self.strings.remove(&entry.header.hash);
                    }
                }
            }

            let _ = self
                .allocator
                .reallocate(entry.header.size, 0, AllocTag::Object);

            self.free.push(index as u32);
            freed += 1;
        }

        freed
    }
}

accessors!(
    (object, object_mut, Object, Object),
    (array, array_mut, Array, Vec<Value>),
    (closure, closure_mut, Closure, Closure),
    (closure_value, closure_value_mut, ClosureValue, ClosureValue),
    (module, module_mut, Module, Module),
    (prototype, prototype_mut, Prototype, Prototype)
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_identity() {
        let mut gc = Gc::default();
        let a = gc.intern("hello").unwrap();
        let b = gc.intern("hello").unwrap();
        let c = gc.intern("world").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(gc.string(a).unwrap(), "hello");
    }

    #[test]
    fn test_unreachable_objects_are_freed() {
        let mut gc = Gc::default();
        let kept = gc.alloc(HeapData::Array(vec![])).unwrap();
        let dropped = gc.alloc(HeapData::Array(vec![])).unwrap();

        gc.collect(|marker| marker.mark(kept));

        assert!(gc.is_alive(kept));
        assert!(!gc.is_alive(dropped));
        assert_eq!(gc.stats().freed, 1);
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut gc = Gc::default();
        let old = gc.alloc(HeapData::Array(vec![])).unwrap();

        gc.collect(|_| {});

        let new = gc.alloc(HeapData::Array(vec![])).unwrap();

        assert_eq!(old.index(), new.index());
        assert!(gc.array(old).is_err());
        assert!(gc.array(new).is_ok());
    }

    #[test]
    fn test_trace_follows_array_elements() {
        let mut gc = Gc::default();
        let s = gc.intern("inner").unwrap();
        let array = gc.alloc(HeapData::Array(vec![Value::Str(s)])).unwrap();

        gc.collect(|marker| marker.mark(array));

        assert_eq!(gc.string(s).unwrap(), "inner");
    }

    #[test]
    fn test_permanent_survives() {
        let mut gc = Gc::default();
        let s = gc.intern("zr").unwrap();
        gc.set_permanent(s).unwrap();

        gc.collect(|_| {});

        assert!(gc.is_alive(s));
        assert_eq!(gc.header(s).unwrap().age, 1);
    }

    #[test]
    fn test_limited_allocator_refuses() {
        let mut gc = Gc::new(Box::new(LimitedAllocator::new(64)), GC_THRESHOLD);
        let result = gc.alloc(HeapData::Array(Vec::with_capacity(1024)));

        assert!(matches!(
            result.map_err(|e| e.kind),
            Err(ErrorKind::MemoryError)
        ));
    }
}
