use std::{fmt::Debug, rc::Rc};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

use crate::backend::{Const, Instruction};

/// Visibility of a module-level declaration.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(u8)]
pub enum AccessModifier {
    Public,
    #[default]
    Private,
    Protected,
}

/// Debug range of a local: the slot is live for `offset_activate..offset_dead`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalVariable {
    pub name: String,
    pub stack_slot: u32,
    pub offset_activate: u32,
    pub offset_dead: u32,
}

/// Describes how a closure obtains one captured value when it is created:
/// from a live slot of the creating frame (`in_stack`) or from the creating
/// closure's own captured values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosureVariable {
    pub name: String,
    pub in_stack: bool,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedVariable {
    pub name: String,
    pub stack_slot: u32,
    pub access: AccessModifier,
}

/// Compiled, immutable function prototype shared by every closure over it.
#[derive(Default, Clone, PartialEq, Serialize)]
pub struct Function {
    pub name: String,
    pub parameter_count: u16,
    pub has_variable_arguments: bool,
    pub stack_size: u32,
    pub instructions: Vec<Instruction>,
    pub line_info: Vec<u32>,
    pub constants: Vec<Const>,
    pub local_variables: Vec<LocalVariable>,
    pub closure_values: Vec<ClosureVariable>,
    pub child_functions: Vec<Rc<Function>>,
    pub exported_variables: Vec<ExportedVariable>,
    pub prototype_count: u32,
    pub prototype_data: Vec<u8>,
    pub line_start: u32,
    pub line_end: u32,
}

impl Function {
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_info.get(pc).copied()
    }

    /// Name of the local living in `slot` at instruction `pc`, if any.
    pub fn get_local_variable_name(&self, slot: u32, pc: u32) -> Option<&str> {
        self.local_variables
            .iter()
            .find(|local| {
                local.stack_slot == slot && local.offset_activate <= pc && pc < local.offset_dead
            })
            .map(|local| local.name.as_str())
    }
}

impl Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("parameter_count", &self.parameter_count)
            .field("stack_size", &self.stack_size)
            .field("instructions", &self.instructions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_name_respects_range() {
        let f = Function {
            local_variables: vec![
                LocalVariable {
                    name: "a".into(),
                    stack_slot: 0,
                    offset_activate: 1,
                    offset_dead: 4,
                },
                LocalVariable {
                    name: "b".into(),
                    stack_slot: 0,
                    offset_activate: 4,
                    offset_dead: 9,
                },
            ],
            ..Function::default()
        };

        assert_eq!(f.get_local_variable_name(0, 0), None);
        assert_eq!(f.get_local_variable_name(0, 3), Some("a"));
        assert_eq!(f.get_local_variable_name(0, 4), Some("b"));
    }
}
