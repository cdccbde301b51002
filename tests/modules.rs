use std::rc::Rc;

use zr_vm::{
    backend::{self, zro, WriteOptions, ZroModule},
    runtime::{MemoryLoader, Value},
};

mod common;

const MATH: &str = "
    module \"math\";
    pub var pi = 3;
    pro var secret = 42;
    var hidden = 1;
    pub square(x) {
        return x * x;
    }
";

fn display(vm: &mut zr_vm::Vm, source: &str) -> String {
    let value = common::run_source(vm, source).expect("runtime error");

    vm.display(value).expect("display failed")
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_public_exports_are_visible() {
    let mut vm = common::vm_with_modules(&[("math", MATH)]);
    let source = "
        var m = import(\"math\");
        return [m.pi, m.square(5), m.secret, m.hidden];
    ";

    assert_eq!(display(&mut vm, source), "[3, 25, null, null]");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_protected_exports_are_kept_on_the_module() {
    let mut vm = common::vm_with_modules(&[("math", MATH)]);
    let value = common::run_source(&mut vm, "return import(\"math\");").unwrap();
    let Value::Object(handle) = value else {
        panic!("expected a module object, got {value:?}");
    };
    let secret = Value::Str(vm.global.gc.intern("secret").unwrap());
    let hidden = Value::Str(vm.global.gc.intern("hidden").unwrap());
    let module = vm.global.gc.module(handle).unwrap();

    assert_eq!(module.name.as_deref(), Some("math"));
    assert_eq!(module.get_pro_export(secret), Some(Value::Int64(42)));
    assert_eq!(module.get_pub_export(secret), None);
    assert_eq!(module.get_pro_export(hidden), None);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_modules_are_cached() {
    let mut vm = common::vm_with_modules(&[("math", MATH)]);

    assert_eq!(
        display(&mut vm, "return import(\"math\") == import(\"math\");"),
        "true"
    );
    assert_eq!(vm.global.module_cache.len(), 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_missing_module_is_null() {
    let mut vm = common::vm_with_modules(&[]);

    assert_eq!(display(&mut vm, "return import(\"nowhere\");"), "null");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_broken_modules_are_null() {
    let mut vm = common::vm_with_modules(&[
        ("syntax", "var = ;"),
        ("throws", "throw \"init failed\";"),
    ]);

    assert_eq!(
        display(&mut vm, "return [import(\"syntax\"), import(\"throws\")];"),
        "[null, null]"
    );
    assert!(vm.global.module_cache.is_empty());
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_imports_through_the_registry() {
    let mut vm = common::vm_with_modules(&[("math", MATH)]);

    assert_eq!(display(&mut vm, "return zr.import(\"math\").pi;"), "3");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_exported_classes() {
    let mut vm = common::vm_with_modules(&[(
        "shapes",
        "pub class Square { pub var side: int; area() { return this.side * this.side; } }",
    )]);
    let source = "
        var shapes = import(\"shapes\");
        var s = shapes.Square();
        s.side = 4;
        return s.area();
    ";

    assert_eq!(display(&mut vm, source), "16");
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_binary_modules() {
    let compiled = backend::compile(MATH, "math", false).unwrap();
    let module = ZroModule::new("math", Rc::clone(&compiled.main_function));
    let data = zro::write_module(&module, WriteOptions::default());
    let mut vm = common::vm_with_modules(&[]);
    let mut loader = zr_vm::runtime::MemoryLoader::default();

    loader.insert("math.zro", data);
    vm.set_loader(loader);

    assert_eq!(
        display(&mut vm, "var m = import(\"math.zro\"); return m.square(m.pi);"),
        "9"
    );
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_reload_replaces_the_cached_module() {
    let mut vm = common::vm_with_modules(&[("math", MATH)]);

    assert_eq!(display(&mut vm, "return import(\"math\").pi;"), "3");

    vm.set_loader(MemoryLoader::default().with("math", "pub var pi = 4;"));

    let source = "
        var before = import(\"math\").pi;
        var fresh = reload(\"math\").pi;
        return [before, fresh, import(\"math\").pi];
    ";

    assert_eq!(display(&mut vm, source), "[3, 4, 4]");
    assert_eq!(vm.global.module_cache.len(), 1);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_failed_reload_keeps_the_cached_module() {
    let mut vm = common::vm_with_modules(&[("math", MATH)]);

    assert_eq!(display(&mut vm, "return import(\"math\").pi;"), "3");

    vm.set_loader(MemoryLoader::default().with("math", "throw \"broken\";"));

    let source = "return [reload(\"math\"), import(\"math\").pi];";

    assert_eq!(display(&mut vm, source), "[null, 3]");
}
