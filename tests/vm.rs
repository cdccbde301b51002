use std::{cell::RefCell, rc::Rc};

use zr_vm::{
    error::Error,
    runtime::{ErrorKind, GlobalState, RuntimeError, State, Value, Vm, VmConfig},
};

mod common;

fn depth(state: &mut State, _global: &mut GlobalState) -> Result<usize, RuntimeError> {
    let depth = state.depth() as i64;

    state.stack.push(Value::Int64(depth))?;

    Ok(1)
}

fn display(vm: &mut Vm, source: &str) -> String {
    let value = common::run_source(vm, source).expect("runtime error");

    vm.display(value).expect("display failed")
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_tail_calls_reuse_the_frame() {
    let mut vm = common::new_vm();

    vm.global.register_native("depth", depth).unwrap();

    let source = "
        count(n) {
            if (n == 0) {
                return depth();
            }
            return count(n - 1);
        }
        return count(1) == count(200);
    ";

    assert_eq!(display(&mut vm, source), "true");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_non_tail_calls_grow_the_frame_list() {
    let mut vm = common::new_vm();

    vm.global.register_native("depth", depth).unwrap();

    let source = "
        count(n) {
            if (n == 0) {
                return depth();
            }
            var d = count(n - 1);
            return d;
        }
        return count(5) - count(0);
    ";

    assert_eq!(display(&mut vm, source), "5");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_stack_growth_keeps_captures_valid() {
    let mut vm = Vm::new(VmConfig {
        initial_stack_size: 16,
        ..VmConfig::default()
    })
    .unwrap();

    let source = "
        var x = 7;
        var f = () => x;
        deep(n) {
            if (n == 0) {
                return f();
            }
            var r = deep(n - 1);
            return r;
        }
        var r = deep(300);
        x = 8;
        return [r, f()];
    ";

    assert_eq!(display(&mut vm, source), "[7, 8]");
    assert!(vm.state.stack.relocations() > 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_stack_overflow_is_catchable() {
    let mut vm = Vm::new(VmConfig {
        max_stack_size: 4096,
        ..VmConfig::default()
    })
    .unwrap();

    let source = "
        f(n) {
            var r = f(n + 1);
            return r;
        }
        try {
            f(0);
        } catch (e) {
            return \"overflow\";
        }
    ";

    assert_eq!(display(&mut vm, source), "overflow");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_closures_have_identity() {
    let mut vm = common::new_vm();
    let source = "
        make() {
            return () => 1;
        }
        var g = make();
        var h = g;
        return [make() == make(), g == h];
    ";

    assert_eq!(display(&mut vm, source), "[false, true]");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_uncaught_throw_reaches_panic_handler() {
    let mut vm = common::new_vm();
    let seen = Rc::new(RefCell::new(vec![]));
    let sink = Rc::clone(&seen);

    vm.global.set_panic_handler(move |state, global, value| {
        let message = state.stringify(global, value).unwrap();
        sink.borrow_mut().push(message);
    });

    let result = common::run_source(&mut vm, "throw \"boom\";");

    assert!(matches!(
        result,
        Err(Error::Runtime(RuntimeError {
            kind: ErrorKind::Panic(_),
            ..
        }))
    ));
    assert_eq!(seen.borrow().len(), 1);
    assert!(seen.borrow()[0].contains("boom"));
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_panic_message_uses_to_string_metamethod() {
    let mut vm = common::new_vm();
    let seen = Rc::new(RefCell::new(vec![]));
    let sink = Rc::clone(&seen);

    vm.global.set_panic_handler(move |state, global, value| {
        let message = state.stringify(global, value).unwrap();
        sink.borrow_mut().push(message);
    });

    let source = "
        class Failure {
            @toString() {
                return \"custom-message\";
            }
        }
        throw Failure();
    ";
    let result = common::run_source(&mut vm, source);

    let Err(Error::Runtime(RuntimeError {
        kind: ErrorKind::Panic(message),
        ..
    })) = result
    else {
        panic!("expected a panic, got {result:?}");
    };

    assert_eq!(message, "custom-message");
    assert_eq!(*seen.borrow(), vec!["custom-message".to_string()]);
}

/// True when frame bases strictly increase from the root frame upwards.
fn frames_ordered(state: &mut State, _global: &mut GlobalState) -> Result<usize, RuntimeError> {
    let bases = state.frames().map(|frame| frame.base).collect::<Vec<_>>();
    let ordered = bases.first() == Some(&0) && bases.windows(2).all(|pair| pair[0] < pair[1]);

    state.stack.push(Value::Bool(ordered && bases.len() > 5))?;

    Ok(1)
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_frames_stack_in_call_order() {
    let mut vm = common::new_vm();

    vm.global.register_native("frames_ordered", frames_ordered).unwrap();

    let source = "
        walk(n) {
            if (n == 0) {
                return frames_ordered();
            }
            var r = walk(n - 1);
            return r;
        }
        return walk(6);
    ";

    assert_eq!(display(&mut vm, source), "true");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_frames_are_unwound_after_an_error() {
    let mut vm = common::new_vm();
    let source = "
        fail(n) {
            if (n == 0) {
                throw 1;
            }
            var r = fail(n - 1);
            return r;
        }
        fail(10);
    ";

    let depth = vm.state.depth();

    assert!(common::run_source(&mut vm, source).is_err());
    assert_eq!(vm.state.depth(), depth);
    assert_eq!(display(&mut vm, "return 40 + 2;"), "42");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_garbage_is_collected() {
    let mut vm = common::new_vm();
    let source = "
        for (var i = 0; i < 100; i = i + 1) {
            var tmp = [i, i + 1, {value: i}];
        }
        return 0;
    ";

    common::run_source(&mut vm, source).unwrap();

    let before = vm.global.gc.live_count();

    vm.global.collect(&vm.state);

    assert!(vm.global.gc.live_count() < before);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_compile_errors_are_reported() {
    let mut vm = common::new_vm();
    let result = common::run_source(&mut vm, "missing = 1;");

    assert!(matches!(result, Err(Error::Compile(_))));
}
