use crate::{
    backend::{Const, Op},
    frontend::ast::TypeName,
};

/// What the compiler knows about a value's type at a use site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StaticType {
    #[default]
    Unknown,
    Bool,
    Int,
    UInt,
    Float,
    Str,
}

impl StaticType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "bool" => StaticType::Bool,
            "int" | "int8" | "int16" | "int32" | "int64" => StaticType::Int,
            "uint" | "uint8" | "uint16" | "uint32" | "uint64" => StaticType::UInt,
            "float" | "float32" | "float64" => StaticType::Float,
            "string" => StaticType::Str,
            _ => StaticType::Unknown,
        }
    }

    pub fn from_annotation(ty: Option<&TypeName>) -> Self {
        match ty {
            Some(ty) if !ty.array => Self::from_name(&ty.name),
            _ => StaticType::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, StaticType::Unknown)
    }

    /// Opcode converting any value to this type.
    pub fn conversion(&self) -> Option<Op> {
        match self {
            StaticType::Unknown => None,
            StaticType::Bool => Some(Op::ToBool),
            StaticType::Int => Some(Op::ToInt),
            StaticType::UInt => Some(Op::ToUInt),
            StaticType::Float => Some(Op::ToFloat),
            StaticType::Str => Some(Op::ToString),
        }
    }

    /// Initial value of a declaration without an initializer.
    pub fn zero(&self) -> Const {
        match self {
            StaticType::Unknown => Const::Null,
            StaticType::Bool => Const::Bool(false),
            StaticType::Int => Const::Int(0),
            StaticType::UInt => Const::UInt(0),
            StaticType::Float => Const::Float(0.0),
            StaticType::Str => Const::Str(String::new()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub slot: u16,
    pub ty: StaticType,
    /// Index of the debug record in the function's local table.
    pub debug_index: usize,
}

#[derive(Debug, Default)]
pub struct Scope {
    pub locals: Vec<Local>,
    /// First slot allocated after the scope was entered.
    pub first_slot: u16,
    /// A local of this scope is captured by a closure.
    pub captured: bool,
    pub has_tbc: bool,
}

impl Scope {
    pub fn new(first_slot: u16) -> Self {
        Self {
            first_slot,
            ..Self::default()
        }
    }

    pub fn find(&self, name: &str) -> Option<&Local> {
        self.locals.iter().rev().find(|local| local.name == name)
    }

    pub fn needs_close(&self) -> bool {
        self.captured || self.has_tbc
    }
}

pub type Label = usize;

/// Jump targets of the innermost loop and the state to unwind on exit.
#[derive(Debug, Clone, Copy)]
pub struct LoopContext {
    pub break_label: Label,
    pub continue_label: Label,
    /// Number of active `try` regions when the loop was entered.
    pub try_depth: usize,
    /// First slot of the loop body; cells above it close on exit.
    pub close_level: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(StaticType::from_name("int32"), StaticType::Int);
        assert_eq!(StaticType::from_name("Point"), StaticType::Unknown);
        assert_eq!(
            StaticType::from_annotation(Some(&TypeName {
                name: "int".to_string(),
                array: true,
            })),
            StaticType::Unknown
        );
    }

    #[test]
    fn test_shadowing_finds_latest() {
        let mut scope = Scope::new(0);

        for (slot, name) in ["a", "b", "a"].into_iter().enumerate() {
            scope.locals.push(Local {
                name: name.to_string(),
                slot: slot as u16,
                ty: StaticType::Unknown,
                debug_index: slot,
            });
        }

        assert_eq!(scope.find("a").map(|l| l.slot), Some(2));
        assert!(scope.find("c").is_none());
    }
}
