//! Reader and writer for `.zro` compiled modules.
//!
//! A file starts with a fixed header (signature, version, format word, the
//! target's scalar sizes, an endian flag, a debug flag and a module count)
//! followed by the modules. Every multi-byte word is stored in the byte
//! order the header announces.

use std::rc::Rc;

use bytes::{Buf, BufMut};
use tracing::debug;

use crate::runtime::{AccessModifier, ClosureVariable, ExportedVariable, Function, LocalVariable};

use super::{
    bytecode::{Const, Instruction},
    prototype::{deserialize_prototype_info, PrototypeBlobError},
};

pub const SIGNATURE: &[u8; 4] = b"\x01ZR\x02";
pub const VERSION: [u32; 3] = [0, 1, 0];
pub const FORMAT: u64 = 1;

const INSTRUCTION_SIZE: u8 = 8;

const TAG_NULL: u32 = 0;
const TAG_BOOL: u32 = 1;
const TAG_INT: u32 = 2;
const TAG_UINT: u32 = 3;
const TAG_FLOAT: u32 = 4;
const TAG_STRING: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum ZroError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("unsupported version {0}.{1}.{2}")]
    UnsupportedVersion(u32, u32, u32),
    #[error("unsupported instruction size {0}")]
    InstructionSize(u8),
    #[error("unexpected end of data")]
    Truncated,
    #[error("invalid {0} tag: {1}")]
    InvalidTag(&'static str, u32),
    #[error("invalid UTF-8 in string")]
    InvalidUtf8,
    #[error("binary contains no module")]
    Empty,
    #[error("{0}")]
    Prototype(#[from] PrototypeBlobError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZroImport {
    pub name: String,
    pub md5: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZroModule {
    pub name: String,
    /// Checksum of the source the module was compiled from.
    pub md5: String,
    pub imports: Vec<ZroImport>,
    pub entry: Rc<Function>,
}

impl ZroModule {
    pub fn new(name: impl Into<String>, entry: Rc<Function>) -> Self {
        Self {
            name: name.into(),
            md5: String::new(),
            imports: vec![],
            entry,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub little_endian: bool,
    /// Include per-instruction line numbers.
    pub debug: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            little_endian: cfg!(target_endian = "little"),
            debug: true,
        }
    }
}

struct Writer {
    buff: Vec<u8>,
    little: bool,
    debug: bool,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.buff.put_u8(value);
    }

    fn u32(&mut self, value: u32) {
        match self.little {
            true => self.buff.put_u32_le(value),
            false => self.buff.put_u32(value),
        }
    }

    fn u64(&mut self, value: u64) {
        match self.little {
            true => self.buff.put_u64_le(value),
            false => self.buff.put_u64(value),
        }
    }

    fn bytes(&mut self, data: &[u8]) {
        self.u64(data.len() as u64);
        self.buff.put_slice(data);
    }

    fn string(&mut self, s: &str) {
        self.bytes(s.as_bytes());
    }

    fn constant(&mut self, constant: &Const) {
        match constant {
            Const::Null => self.u32(TAG_NULL),
            Const::Bool(b) => {
                self.u32(TAG_BOOL);
                self.u8(*b as u8);
            }
            Const::Int(i) => {
                self.u32(TAG_INT);
                self.u64(*i as u64);
            }
            Const::UInt(u) => {
                self.u32(TAG_UINT);
                self.u64(*u);
            }
            Const::Float(n) => {
                self.u32(TAG_FLOAT);
                self.u64(n.to_bits());
            }
            Const::Str(s) => {
                self.u32(TAG_STRING);
                self.string(s);
            }
        }
    }

    fn function(&mut self, function: &Function) {
        self.string(&function.name);
        self.u32(function.line_start);
        self.u32(function.line_end);
        self.u32(function.parameter_count as u32);
        self.u8(function.has_variable_arguments as u8);
        self.u64(function.stack_size as u64);

        self.u64(function.instructions.len() as u64);
        for instr in function.instructions.iter() {
            self.u64(instr.encode());
        }

        self.u64(function.local_variables.len() as u64);
        for local in function.local_variables.iter() {
            self.string(&local.name);
            self.u32(local.stack_slot);
            self.u32(local.offset_activate);
            self.u32(local.offset_dead);
        }

        self.u64(function.constants.len() as u64);
        for constant in function.constants.iter() {
            self.constant(constant);
            self.u32(function.line_start);
            self.u32(function.line_end);
        }

        self.u64(function.closure_values.len() as u64);
        for var in function.closure_values.iter() {
            self.string(&var.name);
            self.u8(var.in_stack as u8);
            self.u32(var.index);
        }

        self.u64(function.exported_variables.len() as u64);
        for var in function.exported_variables.iter() {
            self.string(&var.name);
            self.u32(var.stack_slot);
            self.u8(var.access.into());
        }

        self.u32(function.prototype_count);
        self.bytes(&function.prototype_data);

        self.u64(function.child_functions.len() as u64);
        for child in function.child_functions.iter() {
            self.function(child);
        }

        if self.debug {
            self.u64(function.line_info.len() as u64);
            for line in function.line_info.iter() {
                self.u32(*line);
            }
        }
    }

    fn module(&mut self, module: &ZroModule) {
        self.string(&module.name);
        self.string(&module.md5);
        self.u64(module.imports.len() as u64);

        for import in module.imports.iter() {
            self.string(&import.name);
            self.string(&import.md5);
        }

        // declarations live in the entry function's prototype data
        self.u64(0);
        self.function(&module.entry);
    }
}

pub fn write_modules(modules: &[ZroModule], options: WriteOptions) -> Vec<u8> {
    let mut writer = Writer {
        buff: vec![],
        little: options.little_endian,
        debug: options.debug,
    };

    writer.buff.put_slice(SIGNATURE);

    for part in VERSION {
        writer.u32(part);
    }

    writer.u64(FORMAT);
    writer.u8(std::mem::size_of::<i64>() as u8);
    writer.u8(std::mem::size_of::<usize>() as u8);
    writer.u8(INSTRUCTION_SIZE);
    writer.u8(options.little_endian as u8);
    writer.u8(options.debug as u8);
    writer.buff.put_slice(&[0; 3]);
    writer.u64(modules.len() as u64);

    for module in modules {
        writer.module(module);
    }

    writer.buff
}

pub fn write_module(module: &ZroModule, options: WriteOptions) -> Vec<u8> {
    write_modules(std::slice::from_ref(module), options)
}

struct Reader<'a> {
    data: &'a [u8],
    little: bool,
    debug: bool,
}

impl Reader<'_> {
    fn ensure(&self, len: usize) -> Result<(), ZroError> {
        match self.data.remaining() >= len {
            true => Ok(()),
            false => Err(ZroError::Truncated),
        }
    }

    fn u8(&mut self) -> Result<u8, ZroError> {
        self.ensure(1)?;
        Ok(self.data.get_u8())
    }

    fn u32(&mut self) -> Result<u32, ZroError> {
        self.ensure(4)?;
        Ok(match self.little {
            true => self.data.get_u32_le(),
            false => self.data.get_u32(),
        })
    }

    fn u64(&mut self) -> Result<u64, ZroError> {
        self.ensure(8)?;
        Ok(match self.little {
            true => self.data.get_u64_le(),
            false => self.data.get_u64(),
        })
    }

    /// Reads an element count. Every element takes at least a byte, which
    /// bounds the count by the remaining input.
    fn count(&mut self) -> Result<usize, ZroError> {
        let count = self.u64()?;

        match count <= self.data.remaining() as u64 {
            true => Ok(count as usize),
            false => Err(ZroError::Truncated),
        }
    }

    fn bytes(&mut self) -> Result<Vec<u8>, ZroError> {
        let len = self.count()?;
        let bytes = self.data[..len].to_vec();

        self.data.advance(len);

        Ok(bytes)
    }

    fn string(&mut self) -> Result<String, ZroError> {
        String::from_utf8(self.bytes()?).map_err(|_| ZroError::InvalidUtf8)
    }

    fn constant(&mut self) -> Result<Const, ZroError> {
        let constant = match self.u32()? {
            TAG_NULL => Const::Null,
            TAG_BOOL => Const::Bool(self.u8()? != 0),
            TAG_INT => Const::Int(self.u64()? as i64),
            TAG_UINT => Const::UInt(self.u64()?),
            TAG_FLOAT => Const::Float(f64::from_bits(self.u64()?)),
            TAG_STRING => Const::Str(self.string()?),
            tag => return Err(ZroError::InvalidTag("constant", tag)),
        };

        // line range of the constant
        self.u32()?;
        self.u32()?;

        Ok(constant)
    }

    fn access(&mut self) -> Result<AccessModifier, ZroError> {
        let value = self.u8()?;
        AccessModifier::try_from(value).map_err(|_| ZroError::InvalidTag("access", value as u32))
    }

    fn function(&mut self) -> Result<Function, ZroError> {
        let mut function = Function {
            name: self.string()?,
            line_start: self.u32()?,
            line_end: self.u32()?,
            parameter_count: self.u32()? as u16,
            has_variable_arguments: self.u8()? != 0,
            stack_size: self.u64()? as u32,
            ..Function::default()
        };

        for _ in 0..self.count()? {
            function.instructions.push(Instruction::decode(self.u64()?));
        }

        for _ in 0..self.count()? {
            function.local_variables.push(LocalVariable {
                name: self.string()?,
                stack_slot: self.u32()?,
                offset_activate: self.u32()?,
                offset_dead: self.u32()?,
            });
        }

        for _ in 0..self.count()? {
            function.constants.push(self.constant()?);
        }

        for _ in 0..self.count()? {
            function.closure_values.push(ClosureVariable {
                name: self.string()?,
                in_stack: self.u8()? != 0,
                index: self.u32()?,
            });
        }

        for _ in 0..self.count()? {
            function.exported_variables.push(ExportedVariable {
                name: self.string()?,
                stack_slot: self.u32()?,
                access: self.access()?,
            });
        }

        function.prototype_count = self.u32()?;
        function.prototype_data = self.bytes()?;

        if function.prototype_count > 0 {
            deserialize_prototype_info(&function.prototype_data, function.prototype_count as usize)?;
        }

        for _ in 0..self.count()? {
            function.child_functions.push(Rc::new(self.function()?));
        }

        if self.debug {
            for _ in 0..self.count()? {
                function.line_info.push(self.u32()?);
            }
        }

        Ok(function)
    }

    fn module(&mut self) -> Result<ZroModule, ZroError> {
        let name = self.string()?;
        let md5 = self.string()?;
        let mut imports = vec![];

        for _ in 0..self.count()? {
            imports.push(ZroImport {
                name: self.string()?,
                md5: self.string()?,
            });
        }

        if self.count()? > 0 {
            let tag = self.u8()?;
            return Err(ZroError::InvalidTag("declaration", tag as u32));
        }

        Ok(ZroModule {
            name,
            md5,
            imports,
            entry: Rc::new(self.function()?),
        })
    }
}

pub fn read_modules(mut data: &[u8]) -> Result<Vec<ZroModule>, ZroError> {
    if data.remaining() < 32 {
        return Err(ZroError::Truncated);
    }

    if &data[..4] != SIGNATURE {
        return Err(ZroError::InvalidSignature);
    }

    // the endian flag sits behind the version and format words
    let little = data[27] != 0;
    let debug = data[28] != 0;

    data.advance(4);

    let mut reader = Reader {
        data,
        little,
        debug,
    };
    let version = [reader.u32()?, reader.u32()?, reader.u32()?];

    if version[0] != VERSION[0] {
        return Err(ZroError::UnsupportedVersion(
            version[0], version[1], version[2],
        ));
    }

    let _format = reader.u64()?;
    let _int_size = reader.u8()?;
    let _size_t_size = reader.u8()?;
    let instruction_size = reader.u8()?;

    if instruction_size != INSTRUCTION_SIZE {
        return Err(ZroError::InstructionSize(instruction_size));
    }

    reader.data.advance(5);

    let count = reader.count()?;
    let mut modules = Vec::with_capacity(count);

    for _ in 0..count {
        modules.push(reader.module()?);
    }

    debug!(modules = modules.len(), little, "read binary modules");

    Ok(modules)
}

/// Reads the first module of a `.zro` file.
pub fn read_module(data: &[u8]) -> Result<ZroModule, ZroError> {
    read_modules(data)?
        .into_iter()
        .next()
        .ok_or(ZroError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Op;

    fn sample() -> ZroModule {
        let child = Function {
            name: "inner".to_string(),
            parameter_count: 1,
            stack_size: 2,
            instructions: vec![Instruction::with_u16x2(Op::FunctionReturn, 0, 1, 0)],
            line_info: vec![3],
            closure_values: vec![ClosureVariable {
                name: "x".to_string(),
                in_stack: true,
                index: 0,
            }],
            ..Function::default()
        };
        let main = Function {
            name: "main".to_string(),
            stack_size: 4,
            line_start: 1,
            line_end: 5,
            instructions: vec![
                Instruction::with_i32(Op::GetConstant, 0, 0),
                Instruction::with_i32(Op::CreateClosure, 1, 0),
                Instruction::with_i32(Op::Jump, 0, -2),
            ],
            line_info: vec![1, 2, 2],
            constants: vec![
                Const::Null,
                Const::Bool(true),
                Const::Int(-42),
                Const::UInt(u64::MAX),
                Const::Float(0.5),
                Const::Str("héllo".to_string()),
            ],
            local_variables: vec![LocalVariable {
                name: "x".to_string(),
                stack_slot: 0,
                offset_activate: 1,
                offset_dead: 3,
            }],
            exported_variables: vec![ExportedVariable {
                name: "x".to_string(),
                stack_slot: 0,
                access: AccessModifier::Protected,
            }],
            child_functions: vec![Rc::new(child)],
            ..Function::default()
        };

        ZroModule {
            name: "sample".to_string(),
            md5: "abc".to_string(),
            imports: vec![ZroImport {
                name: "dep".to_string(),
                md5: "def".to_string(),
            }],
            entry: Rc::new(main),
        }
    }

    #[test]
    fn test_round_trip_both_byte_orders() {
        let module = sample();

        for little_endian in [true, false] {
            let data = write_module(
                &module,
                WriteOptions {
                    little_endian,
                    debug: true,
                },
            );

            assert_eq!(&data[..4], SIGNATURE);
            assert_eq!(read_module(&data).unwrap(), module);
        }
    }

    #[test]
    fn test_without_debug_info() {
        let module = sample();
        let data = write_module(
            &module,
            WriteOptions {
                little_endian: true,
                debug: false,
            },
        );
        let read = read_module(&data).unwrap();

        assert!(read.entry.line_info.is_empty());
        assert_eq!(read.entry.instructions, module.entry.instructions);
    }

    #[test]
    fn test_invalid_signature() {
        let mut data = write_module(&sample(), WriteOptions::default());

        data[1] = b'X';

        assert!(matches!(read_module(&data), Err(ZroError::InvalidSignature)));
    }

    #[test]
    fn test_truncated() {
        let data = write_module(&sample(), WriteOptions::default());

        for len in [0, 16, 40, data.len() - 1] {
            assert!(matches!(read_module(&data[..len]), Err(ZroError::Truncated)));
        }
    }
}
