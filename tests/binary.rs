use std::rc::Rc;

use test_case::test_case;
use zr_vm::backend::{self, zro, WriteOptions, ZroModule};

mod common;

#[test_case("runtime/fib.zr", "610"; "recursion")]
#[test_case("runtime/closure_counter.zr", "3"; "closures")]
#[test_case("runtime/try_finally_return.zr", "[1, \"finally\"]"; "exception handlers")]
#[test_case("runtime/class_meta.zr", "[4, 7]"; "prototypes")]
#[cfg_attr(miri, ignore)]
fn binary_round_trip(name: &str, expected: &str) {
    let compiled = backend::compile(&common::source(name), name, false).unwrap();
    let module = ZroModule::new(name, Rc::clone(&compiled.main_function));

    for little_endian in [true, false] {
        let data = zro::write_module(
            &module,
            WriteOptions {
                little_endian,
                debug: false,
            },
        );
        let loaded = zro::read_module(&data).unwrap();
        let mut vm = common::new_vm();
        let value = vm.run_function(loaded.entry).unwrap();

        assert_eq!(vm.display(value).unwrap(), expected);
    }
}

#[test]
fn test_corrupt_binary_is_rejected() {
    let compiled = backend::compile("return 1;", "main", false).unwrap();
    let module = ZroModule::new("main", compiled.main_function);
    let mut data = zro::write_module(&module, WriteOptions::default());

    data.truncate(data.len() / 2);

    assert!(zro::read_module(&data).is_err());
}
