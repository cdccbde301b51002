use test_case::test_case;

mod common;

#[test_case("closure_counter", "3"; "closure keeps its own counter")]
#[test_case("closure_shared", "2"; "closures share a captured variable")]
#[test_case("closure_closed", "[3, 1]"; "closures share a cell after their frame returns")]
#[test_case("closure_nested", "111"; "capture through an intermediate function")]
#[test_case("loop_for", "7"; "for loop with continue")]
#[test_case("loop_while", "10"; "while loop with break")]
#[test_case("loop_capture", "[0, 10, 20]"; "each iteration captures a fresh variable")]
#[test_case("foreach_array", "10"; "iterate an array")]
#[test_case("fib", "610"; "recursive calls")]
#[test_case("tail_call", "100000"; "deep tail recursion")]
#[test_case("default_params", "[11, 3, 2]"; "default and variadic parameters")]
#[test_case("try_catch", "42"; "catch a thrown value")]
#[test_case("try_runtime_error", "caught"; "catch a runtime error")]
#[test_case("try_finally_return", "[1, \"finally\"]"; "finally runs on return")]
#[test_case("try_rethrow", "11"; "finally runs before the outer handler")]
#[test_case("try_across_calls", "deep"; "exception unwinds several frames")]
#[test_case("switch", "[\"one\", \"two\", \"other\"]"; "switch arms and default")]
#[test_case("generator", "[0, 1, 4, 9]"; "generator collects outputs")]
#[test_case("destructure", "10"; "object and array patterns")]
#[test_case("class_meta", "[4, 7]"; "class with metamethods")]
#[test_case("typed", "11"; "typed arithmetic")]
#[test_case("strings", "[\"abcd\", 4, \"b\"]"; "string concat and index")]
#[test_case("tbc", "[\"body\", \"closed\"]"; "to-be-closed variable")]
#[test_case("conditional", "[\"big\", true, false]"; "conditional and logical operators")]
#[cfg_attr(miri, ignore)]
fn runtime(name: &str, expected: &str) {
    let actual = common::run(&format!("runtime/{name}.zr")).expect("runtime error");

    assert_eq!(actual, expected);
}
