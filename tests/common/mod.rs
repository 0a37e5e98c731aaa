//! Shared fixtures: hand-assembled ASTs standing in for the external front
//! end, plus compile-and-run plumbing.
#![allow(dead_code)]

use std::sync::Arc;

use etch::ast::{Expr, Function, Module, Param, Pos, Stmt};
use etch::cffi::CffiRegistry;
use etch::compiler::{compile, CompileOptions};
use etch::vm::{ExecStatus, Executor};
use etch::Program;

pub fn module(functions: Vec<Function>) -> Module {
    Module {
        source_file: "fixture.etch".into(),
        functions,
        externs: vec![],
        globals: vec![],
    }
}

pub fn main_fn(body: Vec<Stmt>) -> Function {
    Function { name: "main".into(), params: vec![], body, pos: Pos::line(1) }
}

pub fn fn_named(name: &str, params: &[&str], body: Vec<Stmt>) -> Function {
    Function {
        name: name.into(),
        params: params
            .iter()
            .map(|p| Param { name: (*p).into(), default: None })
            .collect(),
        body,
        pos: Pos::line(1),
    }
}

pub fn compile_module(m: &Module, opt_level: u8) -> Program {
    let opts = CompileOptions { opt_level, debug_info: true, verbose: false };
    compile(m, &opts).expect("fixture should compile")
}

pub fn run_program(program: Program) -> (String, ExecStatus) {
    let mut exec = Executor::new(Arc::new(program), Arc::new(CffiRegistry::new()));
    exec.capture_output();
    let status = exec.execute();
    (exec.take_output(), status)
}

pub fn run_module(m: &Module, opt_level: u8) -> (String, ExecStatus) {
    run_program(compile_module(m, opt_level))
}

pub fn print_stmt(e: Expr, line: u32) -> Stmt {
    Stmt::expr(Expr::call("print", vec![e], line))
}
