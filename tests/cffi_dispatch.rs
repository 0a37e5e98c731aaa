/// Foreign calls end to end: an extern declaration compiles into the CFFI
/// descriptor table, the executor dispatches through the registry by
/// mangled name, and marshalling covers the supported primitive types.

mod common;

use std::sync::Arc;

use common::*;
use etch::ast::{Expr, ExternDecl, Module};
use etch::cffi::{CffiRegistry, FfiValue};
use etch::vm::{ExecStatus, Executor};

fn extern_module() -> Module {
    let mut m = module(vec![main_fn(vec![
        print_stmt(
            Expr::call("scale2_i64", vec![Expr::int(21, 2)], 2),
            2,
        ),
        print_stmt(
            Expr::call("greet_str", vec![Expr::str("vm", 3)], 3),
            3,
        ),
    ])]);
    m.externs.push(ExternDecl {
        mangled: "scale2_i64".into(),
        library: "libdemo".into(),
        resolved_path: "/usr/lib/libdemo.so".into(),
        symbol: "scale2".into(),
        base_name: "scale2".into(),
        param_types: vec!["i64".into()],
        return_type: "i64".into(),
    });
    m.externs.push(ExternDecl {
        mangled: "greet_str".into(),
        library: "libdemo".into(),
        resolved_path: "/usr/lib/libdemo.so".into(),
        symbol: "greet".into(),
        base_name: "greet".into(),
        param_types: vec!["str".into()],
        return_type: "str".into(),
    });
    m
}

fn demo_registry() -> CffiRegistry {
    let mut registry = CffiRegistry::new();
    let program = compile_module(&extern_module(), 0);
    let scale_desc = program.cffi.get("scale2_i64").unwrap().clone();
    let greet_desc = program.cffi.get("greet_str").unwrap().clone();
    registry.register(
        "scale2_i64",
        scale_desc,
        Arc::new(|args| match args.first() {
            Some(FfiValue::I64(n)) => FfiValue::I64(n * 2),
            _ => FfiValue::Void,
        }),
    );
    registry.register(
        "greet_str",
        greet_desc,
        Arc::new(|args| match args.first() {
            Some(FfiValue::Str(s)) => {
                let name = s.to_string_lossy();
                FfiValue::Str(std::ffi::CString::new(format!("hello {}", name)).unwrap())
            }
            _ => FfiValue::Void,
        }),
    );
    registry
}

#[test]
fn extern_declarations_land_in_the_program() {
    let program = compile_module(&extern_module(), 0);
    let desc = program.cffi.get("scale2_i64").expect("descriptor");
    assert_eq!(desc.library_name, "libdemo");
    assert_eq!(desc.symbol, "scale2");
    assert_eq!(desc.param_types.len(), 1);
}

#[test]
fn foreign_calls_dispatch_through_the_registry() {
    let program = compile_module(&extern_module(), 0);
    let mut exec = Executor::new(Arc::new(program), Arc::new(demo_registry()));
    exec.capture_output();
    let status = exec.execute();
    assert_eq!(status, ExecStatus::Done);
    assert_eq!(exec.take_output(), "42\nhello vm\n");
}

#[test]
fn unregistered_foreign_call_yields_nil() {
    // Descriptors present, registry empty: the call logs and yields nil.
    let program = compile_module(&extern_module(), 0);
    let mut exec = Executor::new(Arc::new(program), Arc::new(CffiRegistry::new()));
    exec.capture_output();
    let status = exec.execute();
    assert_eq!(status, ExecStatus::Done);
    assert_eq!(exec.take_output(), "nil\nnil\n");
}
