use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use crate::runtime::AccessModifier;

/// Marks an absent constant or child index in the blob.
pub const NONE_INDEX: u32 = u32::MAX;

const HEADER_WORDS: usize = 5;
const MEMBER_WORDS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum PrototypeKind {
    Struct,
    Class,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum MemberKind {
    Field,
    Method,
    MetaMethod,
}

/// One member record. Names refer to string constants of the entry
/// function, `function_index` to its child function table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub kind: MemberKind,
    pub name: u32,
    pub access: AccessModifier,
    pub is_static: bool,
    pub field_type_name: u32,
    pub field_offset: u32,
    pub field_size: u32,
    pub is_meta_method: bool,
    pub meta_type: u32,
    pub function_index: u32,
    pub parameter_count: u32,
    pub return_type_name: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrototypeInfo {
    pub name: u32,
    pub kind: PrototypeKind,
    pub access: AccessModifier,
    pub inherits: Vec<u32>,
    pub members: Vec<MemberInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrototypeBlobError {
    #[error("prototype data ends unexpectedly")]
    Truncated,
    #[error("invalid {0} tag in prototype data: {1}")]
    InvalidTag(&'static str, u32),
}

/// Byte size of a field of the given type name; unknown names are
/// references and take a pointer.
pub fn field_size(type_name: Option<&str>) -> u32 {
    match type_name {
        Some("int" | "int64" | "uint" | "uint64" | "float" | "float64") => 8,
        Some("int32" | "uint32" | "float32") => 4,
        Some("int16" | "uint16") => 2,
        Some("int8" | "uint8" | "bool") => 1,
        _ => 8,
    }
}

/// Lays fields out in declaration order, each aligned to its own size.
/// Returns the offsets and the total size.
pub fn layout_fields(sizes: &[u32]) -> (Vec<u32>, u32) {
    let mut offset = 0u32;
    let offsets = sizes
        .iter()
        .map(|size| {
            let aligned = offset.div_ceil(*size) * size;
            offset = aligned + size;
            aligned
        })
        .collect();

    (offsets, offset)
}

/// Packs prototype records into one flat buffer: a five word header per
/// prototype followed by its inherit name indices and twelve words per
/// member. All words are little-endian `u32`.
pub fn serialize_prototype_info_to_binary(infos: &[PrototypeInfo]) -> Vec<u8> {
    let mut buff = vec![];

    for info in infos {
        buff.put_u32_le(info.name);
        buff.put_u32_le(info.kind.into());
        buff.put_u32_le(u8::from(info.access) as u32);
        buff.put_u32_le(info.inherits.len() as u32);
        buff.put_u32_le(info.members.len() as u32);

        for inherit in info.inherits.iter() {
            buff.put_u32_le(*inherit);
        }

        for member in info.members.iter() {
            buff.put_u32_le(member.kind.into());
            buff.put_u32_le(member.name);
            buff.put_u32_le(u8::from(member.access) as u32);
            buff.put_u32_le(member.is_static as u32);
            buff.put_u32_le(member.field_type_name);
            buff.put_u32_le(member.field_offset);
            buff.put_u32_le(member.field_size);
            buff.put_u32_le(member.is_meta_method as u32);
            buff.put_u32_le(member.meta_type);
            buff.put_u32_le(member.function_index);
            buff.put_u32_le(member.parameter_count);
            buff.put_u32_le(member.return_type_name);
        }
    }

    buff
}

fn access(value: u32) -> Result<AccessModifier, PrototypeBlobError> {
    u8::try_from(value)
        .ok()
        .and_then(|v| AccessModifier::try_from(v).ok())
        .ok_or(PrototypeBlobError::InvalidTag("access", value))
}

pub fn deserialize_prototype_info(
    mut data: &[u8],
    count: usize,
) -> Result<Vec<PrototypeInfo>, PrototypeBlobError> {
    let mut infos = Vec::with_capacity(count);

    for _ in 0..count {
        if data.remaining() < HEADER_WORDS * 4 {
            return Err(PrototypeBlobError::Truncated);
        }

        let name = data.get_u32_le();
        let kind = data.get_u32_le();
        let kind =
            PrototypeKind::try_from(kind).map_err(|_| PrototypeBlobError::InvalidTag("type", kind))?;
        let access_modifier = access(data.get_u32_le())?;
        let inherit_count = data.get_u32_le() as usize;
        let member_count = data.get_u32_le() as usize;

        if data.remaining() < (inherit_count + member_count * MEMBER_WORDS) * 4 {
            return Err(PrototypeBlobError::Truncated);
        }

        let inherits = (0..inherit_count).map(|_| data.get_u32_le()).collect();
        let mut members = Vec::with_capacity(member_count);

        for _ in 0..member_count {
            let kind = data.get_u32_le();

            members.push(MemberInfo {
                kind: MemberKind::try_from(kind)
                    .map_err(|_| PrototypeBlobError::InvalidTag("member", kind))?,
                name: data.get_u32_le(),
                access: access(data.get_u32_le())?,
                is_static: data.get_u32_le() != 0,
                field_type_name: data.get_u32_le(),
                field_offset: data.get_u32_le(),
                field_size: data.get_u32_le(),
                is_meta_method: data.get_u32_le() != 0,
                meta_type: data.get_u32_le(),
                function_index: data.get_u32_le(),
                parameter_count: data.get_u32_le(),
                return_type_name: data.get_u32_le(),
            });
        }

        infos.push(PrototypeInfo {
            name,
            kind,
            access: access_modifier,
            inherits,
            members,
        });
    }

    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: u32, offset: u32, size: u32) -> MemberInfo {
        MemberInfo {
            kind: MemberKind::Field,
            name,
            access: AccessModifier::Public,
            is_static: false,
            field_type_name: NONE_INDEX,
            field_offset: offset,
            field_size: size,
            is_meta_method: false,
            meta_type: 0,
            function_index: NONE_INDEX,
            parameter_count: 0,
            return_type_name: NONE_INDEX,
        }
    }

    #[test]
    fn test_blob_size_is_flat() {
        let info = PrototypeInfo {
            name: 0,
            kind: PrototypeKind::Class,
            access: AccessModifier::Public,
            inherits: vec![3],
            members: vec![field(1, 0, 8), field(2, 8, 4)],
        };
        let blob = serialize_prototype_info_to_binary(&[info.clone()]);

        assert_eq!(blob.len(), (5 + 1 + 2 * 12) * 4);
        assert_eq!(deserialize_prototype_info(&blob, 1).unwrap(), vec![info]);
    }

    #[test]
    fn test_truncated_blob() {
        let blob = serialize_prototype_info_to_binary(&[PrototypeInfo {
            name: 0,
            kind: PrototypeKind::Struct,
            access: AccessModifier::Private,
            inherits: vec![],
            members: vec![field(1, 0, 8)],
        }]);

        assert_eq!(
            deserialize_prototype_info(&blob[..blob.len() - 4], 1),
            Err(PrototypeBlobError::Truncated)
        );
    }

    #[test]
    fn test_field_layout_alignment() {
        let (offsets, total) = layout_fields(&[1, 8, 2, 4]);

        assert_eq!(offsets, vec![0, 8, 16, 20]);
        assert_eq!(total, 24);
    }
}
