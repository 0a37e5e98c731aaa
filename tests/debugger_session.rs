/// Debugger-driven executions: breakpoint pause/resume round trips,
/// stepping across call depths, and variable display through the lifetime
/// tracker at the paused PC.

mod common;

use std::sync::Arc;

use common::*;
use etch::ast::{BinOp, Expr, Pos, Stmt};
use etch::cffi::CffiRegistry;
use etch::debugger::Debugger;
use etch::vm::{ExecStatus, Executor};

fn debug_executor(m: &etch::ast::Module) -> Executor {
    let program = compile_module(m, 0);
    let mut exec = Executor::new(Arc::new(program), Arc::new(CffiRegistry::new()));
    exec.capture_output();
    exec.debugger = Some(Debugger::new());
    exec
}

fn counting_module(n: i64) -> etch::ast::Module {
    module(vec![main_fn(vec![
        Stmt::let_("i", Expr::int(0, 1), 1),
        Stmt::While {
            condition: Expr::binary(BinOp::Lt, Expr::ident("i", 2), Expr::int(n, 2), 2),
            body: vec![
                print_stmt(Expr::ident("i", 3), 3),
                Stmt::assign(
                    "i",
                    Expr::binary(BinOp::Add, Expr::ident("i", 4), Expr::int(1, 4), 4),
                    4,
                ),
            ],
            pos: Pos::line(2),
        },
    ])])
}

#[test]
fn breakpoint_pauses_once_per_arrival() {
    let mut exec = debug_executor(&counting_module(3));
    exec.debugger.as_mut().unwrap().add_breakpoint("fixture.etch", 3);

    let mut pauses = 0;
    loop {
        match exec.execute() {
            ExecStatus::Paused => {
                pauses += 1;
                exec.debugger.as_mut().unwrap().resume();
            }
            ExecStatus::Done => break,
            ExecStatus::Fatal(code) => panic!("fatal {}", code),
        }
    }
    // Line 3 runs once per loop iteration.
    assert_eq!(pauses, 3);
    assert_eq!(exec.take_output(), "0\n1\n2\n");
}

#[test]
fn paused_vm_exposes_variables_via_lifetimes() {
    let mut exec = debug_executor(&counting_module(5));
    exec.debugger.as_mut().unwrap().add_breakpoint("fixture.etch", 4);

    // Second arrival at line 4: i has been printed once and incremented once.
    assert_eq!(exec.execute(), ExecStatus::Paused);
    exec.debugger.as_mut().unwrap().resume();
    assert_eq!(exec.execute(), ExecStatus::Paused);

    let (function, pc) = {
        let (f, pc) = exec.current_position().expect("paused inside a frame");
        (f.to_string(), pc)
    };
    assert_eq!(function, "main");
    let registers: Vec<etch::Value> = exec.frames().last().unwrap().registers.clone();
    let dbg = exec.debugger.as_ref().unwrap();
    let vars = dbg.variables(exec.program(), &function, pc, &registers);
    let i = vars.iter().find(|v| v.name == "i").expect("i visible at line 4");
    assert!(i.initialized);
    assert_eq!(i.value, "1");
}

#[test]
fn step_over_walks_lines_without_entering_calls() {
    let helper = fn_named(
        "noisy",
        &[],
        vec![
            print_stmt(Expr::str("inside", 2), 2),
            Stmt::Return { value: None, pos: Pos::line(3) },
        ],
    );
    let m = module(vec![
        helper,
        main_fn(vec![
            print_stmt(Expr::str("one", 5), 5),
            Stmt::expr(Expr::call("noisy", vec![], 6)),
            print_stmt(Expr::str("two", 7), 7),
        ]),
    ]);
    let mut exec = debug_executor(&m);
    exec.debugger.as_mut().unwrap().pause();

    // First break lands on main's first instruction.
    assert_eq!(exec.execute(), ExecStatus::Paused);
    let mut lines = Vec::new();
    for _ in 0..3 {
        exec.debugger.as_mut().unwrap().step_over();
        if exec.execute() != ExecStatus::Paused {
            break;
        }
        let (_, pc) = exec.current_position().unwrap();
        lines.push(exec.program().code[pc].line());
    }
    // Stops at 6 and 7; never at noisy's line 2.
    assert!(lines.contains(&6));
    assert!(lines.contains(&7));
    assert!(!lines.contains(&2));
}

#[test]
fn step_into_descends_into_the_callee() {
    let helper = fn_named(
        "noisy",
        &[],
        vec![
            print_stmt(Expr::str("inside", 2), 2),
            Stmt::Return { value: None, pos: Pos::line(3) },
        ],
    );
    let m = module(vec![
        helper,
        main_fn(vec![
            Stmt::expr(Expr::call("noisy", vec![], 5)),
            print_stmt(Expr::str("after", 6), 6),
        ]),
    ]);
    let mut exec = debug_executor(&m);
    exec.debugger.as_mut().unwrap().pause();
    assert_eq!(exec.execute(), ExecStatus::Paused);

    let mut seen_lines = Vec::new();
    for _ in 0..8 {
        exec.debugger.as_mut().unwrap().step_into();
        if exec.execute() != ExecStatus::Paused {
            break;
        }
        let (f, pc) = exec.current_position().unwrap();
        seen_lines.push((f.to_string(), exec.program().code[pc].line()));
    }
    assert!(
        seen_lines.iter().any(|(f, l)| f == "noisy" && *l == 2),
        "step-into reaches the callee body: {:?}",
        seen_lines
    );
}

#[test]
fn stack_mirror_tracks_user_frames() {
    let leaf = fn_named(
        "leaf",
        &[],
        vec![print_stmt(Expr::str("x", 2), 2)],
    );
    let mid = fn_named(
        "mid",
        &[],
        vec![Stmt::expr(Expr::call("leaf", vec![], 5))],
    );
    let m = module(vec![
        leaf,
        mid,
        main_fn(vec![Stmt::expr(Expr::call("mid", vec![], 8))]),
    ]);
    let mut exec = debug_executor(&m);
    exec.debugger.as_mut().unwrap().add_breakpoint("fixture.etch", 2);
    assert_eq!(exec.execute(), ExecStatus::Paused);

    let dbg = exec.debugger.as_ref().unwrap();
    let names: Vec<&str> = dbg.stack_mirror().iter().map(|f| f.function.as_str()).collect();
    assert_eq!(names, vec!["main", "mid", "leaf"]);
    assert_eq!(dbg.user_call_depth(), 3);

    // The mirror is plain data for the DAP layer.
    let json = serde_json::to_string(dbg.stack_mirror()).expect("serializes");
    assert!(json.contains("\"leaf\""));
}
