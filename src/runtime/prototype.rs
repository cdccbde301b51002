use std::rc::Rc;

use tracing::{debug, warn};

use crate::backend::{
    deserialize_prototype_info, Const, MemberKind, PrototypeKind, NONE_INDEX,
};

use super::{
    error::{ErrorKind, RuntimeError},
    function::{AccessModifier, Function},
    gc::{Gc, Handle, HeapData, Marker, Trace},
    meta::{MetaMethod, MetaTable},
    object::Object,
    state::State,
    value::Value,
    GlobalState,
};

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub name: Handle,
    pub access: AccessModifier,
    pub offset: u32,
    pub size: u32,
}

/// Runtime form of a struct or class declaration.
pub struct Prototype {
    pub name: Handle,
    pub kind: PrototypeKind,
    pub access: AccessModifier,
    pub parents: Vec<Handle>,
    /// Instance fields, in layout order.
    pub fields: Vec<FieldInfo>,
    /// Instance methods, bound to the receiver on lookup.
    pub members: Object,
    /// Static fields and static methods.
    pub statics: Object,
    pub metas: MetaTable,
}

impl Prototype {
    pub fn new(name: Handle, kind: PrototypeKind, access: AccessModifier) -> Self {
        Self {
            name,
            kind,
            access,
            parents: vec![],
            fields: vec![],
            members: Object::default(),
            statics: Object::default(),
            metas: MetaTable::default(),
        }
    }
}

impl Trace for Prototype {
    fn trace(&self, marker: &mut Marker) {
        marker.mark(self.name);
        self.parents.trace(marker);

        for field in self.fields.iter() {
            marker.mark(field.name);
        }

        self.members.trace(marker);
        self.statics.trace(marker);

        for value in self.metas.values() {
            value.trace(marker);
        }
    }
}

/// Result of a member lookup through a prototype chain.
pub enum Member {
    Method(Value),
    Static(Value),
}

impl Gc {
    /// Depth-first lookup of `key` through `prototype` and its parents.
    pub fn find_member(&self, prototype: Handle, key: Value) -> Result<Option<Member>, RuntimeError> {
        let mut pending = vec![prototype];
        let mut seen = vec![];

        while let Some(handle) = pending.pop() {
            if seen.contains(&handle) {
                continue;
            }

            seen.push(handle);

            let proto = self.prototype(handle)?;

            if let Some(method) = proto.members.get(key) {
                return Ok(Some(Member::Method(method)));
            }

            if let Some(value) = proto.statics.get(key) {
                return Ok(Some(Member::Static(value)));
            }

            pending.extend(proto.parents.iter().rev());
        }

        Ok(None)
    }

    /// Finds a metamethod through `prototype` and its parents.
    pub fn find_meta(&self, prototype: Handle, meta: MetaMethod) -> Result<Option<Value>, RuntimeError> {
        let mut pending = vec![prototype];
        let mut seen = vec![];

        while let Some(handle) = pending.pop() {
            if seen.contains(&handle) {
                continue;
            }

            seen.push(handle);

            let proto = self.prototype(handle)?;

            if let Some(value) = proto.metas.get(meta) {
                return Ok(Some(value));
            }

            pending.extend(proto.parents.iter().rev());
        }

        Ok(None)
    }

    /// Instance field names of `prototype`, parents first.
    pub fn instance_fields(&self, prototype: Handle) -> Result<Vec<Handle>, RuntimeError> {
        let mut names = vec![];
        let mut seen = vec![];

        self.collect_fields(prototype, &mut names, &mut seen)?;

        Ok(names)
    }

    fn collect_fields(
        &self,
        prototype: Handle,
        names: &mut Vec<Handle>,
        seen: &mut Vec<Handle>,
    ) -> Result<(), RuntimeError> {
        if seen.contains(&prototype) {
            return Ok(());
        }

        seen.push(prototype);

        let proto = self.prototype(prototype)?;

        for parent in proto.parents.iter() {
            self.collect_fields(*parent, names, seen)?;
        }

        for field in proto.fields.iter() {
            if !names.contains(&field.name) {
                names.push(field.name);
            }
        }

        Ok(())
    }
}

fn const_name(
    gc: &mut Gc,
    function: &Function,
    index: u32,
) -> Result<Option<Handle>, RuntimeError> {
    if index == NONE_INDEX {
        return Ok(None);
    }

    match function.constants.get(index as usize) {
        Some(Const::Str(name)) => gc.intern(name).map(Some),
        _ => Err(ErrorKind::InvalidConstant(index as usize).into()),
    }
}

impl State {
    /// Returns prototype `index` of the running entry function, building every
    /// prototype of its blob on first use.
    pub fn get_prototype(
        &mut self,
        global: &mut GlobalState,
        base: usize,
        closure: Option<Handle>,
        function: &Rc<Function>,
        index: usize,
    ) -> Result<Value, RuntimeError> {
        let key = Rc::as_ptr(function) as usize;

        if !global.prototypes.contains_key(&key) {
            let handles = self.instantiate_prototypes(global, base, closure, function)?;
            global.prototypes.insert(key, (Rc::clone(function), handles));
        }

        global
            .prototypes
            .get(&key)
            .and_then(|(_, handles)| handles.get(index))
            .map(|handle| Value::Object(*handle))
            .ok_or_else(|| ErrorKind::InvalidOperand(index as i64).into())
    }

    /// Two passes over the blob: allocate every prototype, then wire parents
    /// and members so forward references between declarations resolve.
    fn instantiate_prototypes(
        &mut self,
        global: &mut GlobalState,
        base: usize,
        closure: Option<Handle>,
        function: &Rc<Function>,
    ) -> Result<Vec<Handle>, RuntimeError> {
        let infos = deserialize_prototype_info(
            &function.prototype_data,
            function.prototype_count as usize,
        )
        .map_err(|e| {
            warn!(error = %e, "invalid prototype data");
            RuntimeError::from(ErrorKind::FrameCorrupted("prototype data"))
        })?;

        let mut handles = Vec::with_capacity(infos.len());
        let mut names = Vec::with_capacity(infos.len());

        for info in infos.iter() {
            let name = const_name(&mut global.gc, function, info.name)?
                .ok_or(ErrorKind::InvalidConstant(info.name as usize))?;
            let handle = global.gc.alloc(HeapData::Prototype(Prototype::new(
                name,
                info.kind,
                info.access,
            )))?;

            handles.push(handle);
            names.push(name);
        }

        for (info, handle) in infos.iter().zip(handles.iter()) {
            let mut parents = vec![];

            for inherit in info.inherits.iter() {
                let parent = const_name(&mut global.gc, function, *inherit)?
                    .and_then(|name| names.iter().position(|n| *n == name))
                    .map(|idx| handles[idx]);

                match parent {
                    Some(parent) if parent != *handle => parents.push(parent),
                    _ => warn!(index = inherit, "unresolved parent prototype"),
                }
            }

            let mut fields = vec![];
            let mut members = vec![];
            let mut statics = vec![];
            let mut metas = vec![];

            for member in info.members.iter() {
                let name = const_name(&mut global.gc, function, member.name)?;

                match member.kind {
                    MemberKind::Field => {
                        let name = name.ok_or(ErrorKind::InvalidConstant(member.name as usize))?;

                        if member.is_static {
                            statics.push((Value::Str(name), Value::Null));
                        } else {
                            fields.push(FieldInfo {
                                name,
                                access: member.access,
                                offset: member.field_offset,
                                size: member.field_size,
                            });
                        }
                    }
                    MemberKind::Method | MemberKind::MetaMethod => {
                        let child = function
                            .child_functions
                            .get(member.function_index as usize)
                            .cloned()
                            .ok_or(ErrorKind::InvalidChild(member.function_index as usize))?;
                        let method =
                            Value::Closure(self.create_closure(global, base, closure, child)?);

                        if member.is_meta_method {
                            match u8::try_from(member.meta_type)
                                .ok()
                                .and_then(|m| MetaMethod::try_from(m).ok())
                            {
                                Some(meta) => metas.push((meta, method)),
                                None => warn!(meta = member.meta_type, "unknown metamethod"),
                            }
                        } else if let Some(name) = name {
                            if member.is_static {
                                statics.push((Value::Str(name), method));
                            } else {
                                members.push((Value::Str(name), method));
                            }
                        }
                    }
                }
            }

            let proto = global.gc.prototype_mut(*handle)?;
            proto.parents = parents;
            proto.fields = fields;

            for (key, value) in members {
                proto.members.set(key, value);
            }

            for (key, value) in statics {
                proto.statics.set(key, value);
            }

            for (meta, value) in metas {
                proto.metas.set(meta, value);
            }

            global.gc.resize(*handle)?;
        }

        debug!(count = handles.len(), function = %function.name, "prototypes instantiated");

        Ok(handles)
    }
}
