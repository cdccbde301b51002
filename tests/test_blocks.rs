mod common;

#[test]
#[cfg_attr(miri, ignore)]
fn test_blocks_run_in_order() {
    let mut vm = common::new_vm();
    let outcomes = vm
        .run_tests(&common::source("tests/suite.zr"), "suite")
        .unwrap();
    let summary = outcomes
        .iter()
        .map(|outcome| (outcome.name.as_str(), outcome.passed()))
        .collect::<Vec<_>>();

    assert_eq!(
        summary,
        vec![("adds", true), ("catches", true), ("fails", false), ("after failure", true)]
    );
}
