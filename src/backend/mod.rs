mod bytecode;
mod compile_time;
mod compiler;
mod expressions;
mod prototype;
mod scope;
mod statements;
pub mod zro;

pub use bytecode::{Const, Instruction, Op, Serializable, ARGS_TO_TOP, MULTIPLE_RESULTS, OP_COUNT};
pub use compiler::{
    CompileError, CompileErrors, CompileResult, Compiler, ErrorKind as CompileErrorKind,
    MAX_CONSTANTS, MAX_SLOTS,
};
pub use prototype::{
    deserialize_prototype_info, field_size, layout_fields, serialize_prototype_info_to_binary,
    MemberInfo, MemberKind, PrototypeBlobError, PrototypeInfo, PrototypeKind, NONE_INDEX,
};
pub use scope::StaticType;
pub use zro::{read_module, write_module, WriteOptions, ZroError, ZroModule};

use tracing::debug;

use crate::{error::Error, frontend};

/// Parses and compiles `source` into a module entry function. `name` names
/// the entry function; `%test` blocks are compiled only in test mode.
pub fn compile(source: &str, name: &str, test_mode: bool) -> Result<CompileResult, Error> {
    let program = frontend::parse(source)?;
    let result = Compiler::new(name)
        .test_mode(test_mode)
        .compile(&program)?;

    debug!(
        name,
        tests = result.test_functions.len(),
        children = result.main_function.child_functions.len(),
        "compiled module"
    );

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn main_of(source: &str) -> std::rc::Rc<crate::runtime::Function> {
        compile(source, "main", false).unwrap().main_function
    }

    #[test]
    fn test_equal_constants_share_a_slot() {
        let main = main_of("var a = 42; var b = 42; var c = 42;");

        assert_eq!(main.constants, vec![Const::Int(42), Const::Null]);
        assert_eq!(
            main.instructions
                .iter()
                .filter(|instr| instr.op == Op::GetConstant && instr.i32() == 0)
                .count(),
            3
        );
    }

    #[test]
    fn test_locals_get_distinct_slots() {
        let main = main_of("var a = 1; { var b = 2; } var c = 3;");
        let slots = main
            .local_variables
            .iter()
            .map(|var| (var.name.as_str(), var.stack_slot))
            .collect::<Vec<_>>();

        assert_eq!(slots, vec![("a", 0), ("b", 1), ("c", 2)]);
    }

    #[test]
    fn test_closure_captures_parent_local() {
        let main = main_of("var x = 1; var f = () => x;");
        let child = &main.child_functions[0];

        assert_eq!(child.closure_values.len(), 1);
        assert_eq!(child.closure_values[0].name, "x");
        assert!(child.closure_values[0].in_stack);
        assert_eq!(child.closure_values[0].index, 0);
    }

    #[test]
    fn test_nested_capture_goes_through_parent() {
        let main = main_of("var x = 1; outer() { return () => x; }");
        let outer = &main.child_functions[0];
        let inner = &outer.child_functions[0];

        assert!(!outer.closure_values.is_empty());
        assert_eq!(inner.closure_values[0].name, "x");
        assert!(!inner.closure_values[0].in_stack);
    }

    #[test]
    fn test_return_call_is_tail_call() {
        let main = main_of("f(n) { return f(n); }");
        let f = &main.child_functions[0];

        assert!(f.instructions.iter().any(|i| i.op == Op::FunctionTailCall));
    }

    #[test]
    fn test_return_in_try_is_not_tail_call() {
        let main = main_of("f(n) { try { return f(n); } catch (e) {} }");
        let f = &main.child_functions[0];

        assert!(!f.instructions.iter().any(|i| i.op == Op::FunctionTailCall));
        assert!(f.instructions.iter().any(|i| i.op == Op::EndTry));
    }

    #[test]
    fn test_typed_operands_use_specialised_ops() {
        let main = main_of("var a: int = 1; var b: int = 2; var c = a + b; var d = a < b;");

        assert!(main.instructions.iter().any(|i| i.op == Op::AddInt));
        assert!(main.instructions.iter().any(|i| i.op == Op::LogicalLessSigned));
    }

    #[test]
    fn test_untyped_operands_use_generic_ops() {
        let main = main_of("var a = 1; var b = 2; var c = a + b;");

        assert!(main.instructions.iter().any(|i| i.op == Op::Add));
        assert!(!main.instructions.iter().any(|i| i.op == Op::AddInt));
    }

    #[test]
    fn test_exports_record_access() {
        let main = main_of("pub var a = 1; pro var b = 2; var c = 3;");
        let exports = main
            .exported_variables
            .iter()
            .map(|var| (var.name.as_str(), var.access))
            .collect::<Vec<_>>();

        use crate::runtime::AccessModifier::*;
        assert_eq!(exports, vec![("a", Public), ("b", Protected), ("c", Private)]);
    }

    #[test]
    fn test_class_builds_prototype_blob() {
        let main = main_of(
            "class Point { pub var x: int; pub var y: int; len() { return this.x; } @add(o) { return this; } }",
        );
        let infos =
            deserialize_prototype_info(&main.prototype_data, main.prototype_count as usize)
                .unwrap();

        assert_eq!(main.prototype_count, 1);
        assert_eq!(infos[0].members.len(), 4);
        assert_eq!(infos[0].members[1].field_offset, 8);
        assert!(infos[0].members[3].is_meta_method);
    }

    #[test]
    fn test_tests_compile_only_in_test_mode() {
        let source = "%test(\"adds\") { var a = 1 + 1; }";

        assert!(compile(source, "main", false).unwrap().test_functions.is_empty());

        let result = compile(source, "main", true).unwrap();

        assert_eq!(result.test_functions.len(), 1);
        assert_eq!(result.test_functions[0].0, "adds");
    }

    #[test]
    fn test_module_name() {
        let result = compile("module \"math\"; pub var pi = 3.14;", "main", false).unwrap();

        assert_eq!(result.module_name.as_deref(), Some("math"));
    }

    #[test]
    fn test_recoverable_errors_are_collected() {
        let Err(Error::Compile(errors)) = compile("undefined = 1; var a = 1; missing = a;", "main", false)
        else {
            panic!("expected compile errors");
        };

        assert_eq!(errors.0.len(), 2);
        assert!(errors.iter().all(|e| !e.is_fatal()));
    }

    #[test]
    fn test_trailing_return_is_not_doubled() {
        let main = main_of("f(a) { return a; }");
        let returns = main.child_functions[0]
            .instructions
            .iter()
            .filter(|instr| instr.op == Op::FunctionReturn)
            .count();

        assert_eq!(returns, 1);
    }

    #[test]
    fn test_return_skipped_by_a_jump_keeps_implicit_return() {
        let main = main_of("f(a) { if (a) { return 1; } }");
        let f = &main.child_functions[0];
        let returns = f
            .instructions
            .iter()
            .filter(|instr| instr.op == Op::FunctionReturn)
            .count();

        assert_eq!(returns, 2);
        assert!(f.constants.contains(&Const::Null));
    }

    #[test]
    fn test_break_outside_loop() {
        assert!(compile("break;", "main", false).is_err());
    }

    #[test]
    fn test_out_requires_generator() {
        assert!(compile("out 1;", "main", false).is_err());
        assert!(compile("var a = {{ out 1; out 2; }};", "main", false).is_ok());
    }
}
