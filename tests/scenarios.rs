use zr_vm::{
    backend::{self, Op},
    runtime::{ThreadStatus, Value},
};

mod common;

#[test]
fn test_function_declaration_compiles_to_function() {
    let result =
        backend::compile("testFunc(a, b, c) { return a + b + c; }", "main", false).unwrap();
    let function = &result.main_function.child_functions[0];

    assert_eq!(function.name, "testFunc");
    assert_eq!(function.parameter_count, 3);
    assert!(!function.has_variable_arguments);
    assert_eq!(
        function.instructions.last().map(|instr| instr.op),
        Some(Op::FunctionReturn)
    );
}

#[test]
fn test_entry_result_lands_in_the_base_slot() {
    let result = backend::compile("return 1 + 2;", "main", false).unwrap();
    let mut vm = common::new_vm();
    let value = vm.run_function(result.main_function).unwrap();

    assert_eq!(value, Value::Int64(3));
    assert_eq!(vm.state.status, ThreadStatus::Fine);
}

#[test]
fn test_status_is_fine_again_after_a_failed_run() {
    let mut vm = common::new_vm();

    assert!(common::run_source(&mut vm, "throw 1;").is_err());
    assert_eq!(vm.state.status, ThreadStatus::ExceptionError);

    let value = common::run_source(&mut vm, "return 1 + 2;").unwrap();

    assert_eq!(value, Value::Int64(3));
    assert_eq!(vm.state.status, ThreadStatus::Fine);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_lambda_sees_later_writes_to_captured_variable() {
    let source = "var x = 10; var f = () => { return x; }; x = 20; return f();";
    let result = backend::compile(source, "main", false).unwrap();

    assert!(!result.main_function.child_functions[0]
        .closure_values
        .is_empty());

    let mut vm = common::new_vm();
    let value = vm.run_function(result.main_function).unwrap();

    assert_eq!(value, Value::Int64(20));
}
