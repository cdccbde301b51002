use test_case::test_case;
use zr_vm::{
    backend::{self, CompileErrorKind, Const, Op},
    error::Error,
};

mod common;

#[test_case("vars", "[42, 99]"; "compile-time variables")]
#[test_case("functions", "[30, 26]"; "compile-time functions")]
#[test_case("recursion", "120"; "recursive compile-time function")]
#[test_case("validation", "10"; "checks and conditional values")]
#[cfg_attr(miri, ignore)]
fn compile_time(name: &str, expected: &str) {
    let actual = common::run(&format!("compile_time/{name}.zr")).expect("runtime error");

    assert_eq!(actual, expected);
}

fn compile_error(source: &str) -> CompileErrorKind {
    match backend::compile(source, "main", false) {
        Err(Error::Compile(errors)) => errors.0[0].kind.clone(),
        Err(e) => panic!("expected a compile error, got {e}"),
        Ok(_) => panic!("expected a compile error"),
    }
}

#[test]
fn test_values_are_folded_into_constants() {
    let result = backend::compile(
        "%compileTime var ANSWER = 6 * 7; var a = ANSWER;",
        "main",
        false,
    )
    .unwrap();
    let main = result.main_function;

    assert!(main.constants.contains(&Const::Int(42)));
    assert!(!main.constants.contains(&Const::Str("ANSWER".into())));
    assert!(!main.instructions.iter().any(|instr| instr.op == Op::Mul));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_fatal_error_stops_compilation() {
    let kind = compile_error(
        "%compileTime var MAX = 1; %compileTime { if (MAX < 10) { FatalError(\"MAX too small\"); } }",
    );

    assert!(kind.is_fatal());
    assert_eq!(kind.to_string(), "compile-time execution failed: MAX too small");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_failed_assert_stops_compilation() {
    let kind = compile_error("%compileTime { Assert(1 > 2); }");

    assert!(kind.is_fatal());
    assert!(kind.to_string().ends_with("Assertion failed"));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_runtime_error_in_initializer_is_fatal() {
    let kind = compile_error("%compileTime var BAD = missing();");

    assert!(matches!(kind, CompileErrorKind::CompileTimeFailed(_)));
}

#[test]
fn test_compile_time_functions_are_not_callable_at_runtime() {
    let kind = compile_error("%compileTime twice(n) { return n * 2; } var a = twice(2);");

    assert!(matches!(kind, CompileErrorKind::CompileTimeOnly(name) if name == "twice"));
}

#[test]
fn test_compile_time_values_are_read_only() {
    let kind = compile_error("%compileTime var LIMIT = 3; LIMIT = 4;");

    assert!(matches!(kind, CompileErrorKind::InvalidAssignTarget));
}

#[test]
fn test_compile_time_only_at_module_level() {
    let kind = compile_error("f() { %compileTime var A = 1; }");

    assert!(matches!(kind, CompileErrorKind::NotTopLevel(_)));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_compile_time_values_are_visible_in_tests() {
    let mut vm = common::new_vm();
    let outcomes = vm
        .run_tests(
            "%compileTime var EXPECTED = 3; %test(\"sees constant\") { if (EXPECTED != 3) { throw \"wrong\"; } }",
            "main",
        )
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].passed());
}
