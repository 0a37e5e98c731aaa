/// Serialization round-trip on real compiled programs: constants,
/// instructions, function tables, CFFI descriptors, entry point, and
/// lifetime data all survive the disk format, and the reloaded program
/// behaves identically.

mod common;

use common::*;
use etch::ast::{BinOp, Expr, ExternDecl, ForIter, Pos, Stmt};
use etch::serializer::{deserialize, serialize};

fn rich_module() -> etch::ast::Module {
    let helper = fn_named(
        "scale",
        &["x"],
        vec![Stmt::Return {
            value: Some(Expr::binary(BinOp::Mul, Expr::ident("x", 2), Expr::int(3, 2), 2)),
            pos: Pos::line(2),
        }],
    );
    let mut m = module(vec![
        helper,
        main_fn(vec![
            Stmt::let_("big", Expr::int(1_000_000, 4), 4),
            Stmt::let_("pi", Expr::float(3.25, 5), 5),
            Stmt::let_("s", Expr::str("persisted", 6), 6),
            Stmt::For {
                var: "i".into(),
                iter: ForIter::Range {
                    start: Expr::int(0, 7),
                    end: Expr::int(3, 7),
                    inclusive: false,
                },
                body: vec![print_stmt(Expr::call("scale", vec![Expr::ident("i", 8)], 8), 8)],
                pos: Pos::line(7),
            },
            print_stmt(Expr::ident("s", 9), 9),
        ]),
    ]);
    m.globals.push(("counter".into(), Expr::int(41, 1), Pos::line(1)));
    m.externs.push(ExternDecl {
        mangled: "clock_ms".into(),
        library: "libc".into(),
        resolved_path: String::new(),
        symbol: "clock".into(),
        base_name: "clock".into(),
        param_types: vec![],
        return_type: "i64".into(),
    });
    m
}

/// Instruction identity as the on-disk format defines it: opcode, A,
/// operands, line, file. Columns are advisory and never persisted.
fn persisted_view(code: &[etch::Instr]) -> Vec<(etch::Op, u8, etch::bytecode::Operands, u32, String)> {
    code.iter()
        .map(|i| {
            let (line, file) = i
                .debug
                .as_ref()
                .map(|d| (d.line, d.source_file.clone()))
                .unwrap_or((0, String::new()));
            (i.op, i.a, i.operands, line, file)
        })
        .collect()
}

#[test]
fn compiled_program_round_trips_structurally() {
    for opt in [0, 1, 2, 3] {
        let p = compile_module(&rich_module(), opt);
        let q = deserialize(&serialize(&p)).expect("reload");
        assert_eq!(q.constants.values(), p.constants.values(), "opt {}", opt);
        assert_eq!(persisted_view(&q.code), persisted_view(&p.code), "opt {}", opt);
        assert_eq!(q.functions, p.functions, "opt {}", opt);
        assert_eq!(q.function_table, p.function_table, "opt {}", opt);
        assert_eq!(q.cffi, p.cffi, "opt {}", opt);
        assert_eq!(q.entry_point, p.entry_point, "opt {}", opt);
        assert_eq!(q.lifetimes, p.lifetimes, "opt {}", opt);
        assert_eq!(q.flags, p.flags, "opt {}", opt);
    }
}

#[test]
fn reloaded_program_runs_identically() {
    let p = compile_module(&rich_module(), 2);
    let (expected, _) = run_program(compile_module(&rich_module(), 2));
    let q = deserialize(&serialize(&p)).expect("reload");
    let (out, status) = run_program(q);
    assert_eq!(status.code(), 0);
    assert_eq!(out, expected);
}

#[test]
fn double_round_trip_is_fixed_point() {
    let p = compile_module(&rich_module(), 1);
    let once = serialize(&p);
    let twice = serialize(&deserialize(&once).expect("first reload"));
    assert_eq!(once, twice, "serialization reaches a byte fixed point");
}
