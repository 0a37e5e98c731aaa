/// Post-compile bytecode optimization pipeline.
///
/// Runs per function over the flat instruction stream:
///
///   1. Constant folding      (opt ≥ 1) — LoadK/LoadK/arith triples
///   2. Peephole              (opt ≥ 1) — identity arithmetic on immediates
///   3. Test fusion           (opt ≥ 1) — Test + Jmp → CmpJmp,
///                                        AddI +1 + back-edge Jmp → IncTest
///   4. Common subexpressions (opt ≥ 3) — within basic blocks
///
/// Every pass preserves instruction indices: replaced slots become Nop, and
/// nothing is compacted. Jump offsets and the PC-keyed lifetime data stay
/// valid without any re-patching.

use std::collections::{HashMap, HashSet};

use crate::bytecode::{Instr, Op, Operands, Program};
use crate::value::{arith_add, arith_mul, arith_sub, Value};

pub fn optimize(program: &mut Program, opt_level: u8) {
    if opt_level == 0 {
        return;
    }
    let ranges: Vec<(usize, usize)> = program
        .functions
        .values()
        .map(|f| (f.start_pc as usize, f.end_pc as usize))
        .collect();

    for &(start, end) in &ranges {
        fold_constants(program, start, end);
        peephole(program, start, end);
        fuse_tests(program, start, end);
        if opt_level >= 3 {
            eliminate_common_subexpressions(program, start, end);
        }
    }
}

/// PCs that are the destination of some jump inside `[start, end]`.
fn jump_targets(code: &[Instr], start: usize, end: usize) -> HashSet<usize> {
    let mut targets = HashSet::new();
    for pc in start..=end.min(code.len() - 1) {
        let instr = &code[pc];
        if instr.is_jump() {
            let t = pc as i64 + 1 + instr.sbx() as i64;
            if t >= 0 {
                targets.insert(t as usize);
            }
        }
    }
    targets
}

/// True when `reg` is read somewhere in `(from, end]` before being written.
fn read_before_overwrite(code: &[Instr], from: usize, end: usize, reg: u8) -> bool {
    for pc in from..=end.min(code.len() - 1) {
        let instr = &code[pc];
        if instr.reads().contains(&reg) {
            return true;
        }
        if instr.writes() == Some(reg) {
            return false;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Pass 1: constant folding
// ---------------------------------------------------------------------------

/// Fold `LoadK a; LoadK b; arith dst, a, b` into a single LoadK of the
/// result. Only fires when the arithmetic consumes exactly the two loaded
/// registers and neither is read again afterwards. Division is left alone:
/// folding would erase the runtime zero-divisor trap.
fn fold_constants(program: &mut Program, start: usize, end: usize) {
    let mut pc = start;
    while pc + 2 <= end {
        let (i0, i1, i2) = (&program.code[pc], &program.code[pc + 1], &program.code[pc + 2]);
        let foldable = i0.op == Op::LoadK
            && i1.op == Op::LoadK
            && matches!(i2.op, Op::Add | Op::Sub | Op::Mul)
            && i2.b() == i0.a
            && i2.c() == i1.a;
        if !foldable {
            pc += 1;
            continue;
        }
        let lhs = loadk_value(program, pc);
        let rhs = loadk_value(program, pc + 1);
        let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
            pc += 1;
            continue;
        };
        let folded = match program.code[pc + 2].op {
            Op::Add => arith_add(&lhs, &rhs),
            Op::Sub => arith_sub(&lhs, &rhs),
            _ => arith_mul(&lhs, &rhs),
        };
        if folded == Value::Nil {
            pc += 1;
            continue;
        }
        let a0 = program.code[pc].a;
        let a1 = program.code[pc + 1].a;
        let dst = program.code[pc + 2].a;
        let safe = (a0 == dst || !read_before_overwrite(&program.code, pc + 3, end, a0))
            && (a1 == dst || !read_before_overwrite(&program.code, pc + 3, end, a1));
        if !safe {
            pc += 1;
            continue;
        }
        let debug = program.code[pc + 2].debug.clone();
        let mut replacement = match folded {
            Value::Int(n) if (-32767..=32767).contains(&n) => Instr::asbx(Op::LoadK, dst, n as i16),
            other => match program.constants.add(other) {
                Ok(k) => Instr::abx(Op::LoadK, dst, k),
                Err(_) => {
                    pc += 1;
                    continue;
                }
            },
        };
        replacement.debug = debug;
        program.code[pc] = Instr::abc(Op::Nop, 0, 0, 0);
        program.code[pc + 1] = Instr::abc(Op::Nop, 0, 0, 0);
        program.code[pc + 2] = replacement;
        pc += 3;
    }
}

/// Constant loaded by the LoadK at `pc`, if resolvable.
fn loadk_value(program: &Program, pc: usize) -> Option<Value> {
    match program.code[pc].operands {
        Operands::AsBx { sbx } => Some(Value::Int(sbx as i64)),
        Operands::ABx { bx } => Some(program.constants.get(bx)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Pass 2: peephole
// ---------------------------------------------------------------------------

fn peephole(program: &mut Program, start: usize, end: usize) {
    for pc in start..=end.min(program.code.len().saturating_sub(1)) {
        let instr = program.code[pc].clone();
        match instr.op {
            // x + 0 and x - 0 are moves.
            Op::AddI | Op::SubI if instr.c() as i8 == 0 => {
                program.code[pc] = relabel(Instr::abc(Op::Move, instr.a, instr.b(), 0), &instr);
            }
            // x * 1 is a move; x * 0 is a zero load.
            Op::MulI if instr.c() as i8 == 1 => {
                program.code[pc] = relabel(Instr::abc(Op::Move, instr.a, instr.b(), 0), &instr);
            }
            Op::MulI if instr.c() as i8 == 0 => {
                program.code[pc] = relabel(Instr::asbx(Op::LoadK, instr.a, 0), &instr);
            }
            _ => {}
        }
    }
}

fn relabel(mut instr: Instr, original: &Instr) -> Instr {
    instr.debug = original.debug.clone();
    instr
}

// ---------------------------------------------------------------------------
// Pass 3: test fusion
// ---------------------------------------------------------------------------

/// `Test A, 0` + `Jmp` → `CmpJmp A` (jump-if-false), and the loop tail
/// `AddI A, A, 1` + back-edge `Jmp` → `IncTest A`. The second slot becomes
/// Nop; fusion is skipped when another jump lands on it.
///
/// The fused instruction sits one slot before the Jmp it absorbs, so its
/// offset is the Jmp's offset plus one.
fn fuse_tests(program: &mut Program, start: usize, end: usize) {
    let targets = jump_targets(&program.code, start, end);
    let mut pc = start;
    while pc + 1 <= end {
        let (i0, i1) = (&program.code[pc], &program.code[pc + 1]);
        if targets.contains(&(pc + 1)) {
            pc += 1;
            continue;
        }
        if i0.op == Op::Test && i0.c() == 0 && i1.op == Op::Jmp && i1.sbx() < i16::MAX {
            let reg = i0.a;
            let sbx = i1.sbx() + 1;
            let debug = i0.debug.clone();
            let mut fused = Instr::asbx(Op::CmpJmp, reg, sbx);
            fused.debug = debug;
            program.code[pc] = fused;
            program.code[pc + 1] = Instr::abc(Op::Nop, 0, 0, 0);
            pc += 2;
            continue;
        }
        if i0.op == Op::AddI && i0.a == i0.b() && i0.c() as i8 == 1 && i1.op == Op::Jmp && i1.sbx() < 0
        {
            let reg = i0.a;
            let sbx = i1.sbx() + 1;
            let debug = i0.debug.clone();
            let mut fused = Instr::asbx(Op::IncTest, reg, sbx);
            fused.debug = debug;
            program.code[pc] = fused;
            program.code[pc + 1] = Instr::abc(Op::Nop, 0, 0, 0);
            pc += 2;
            continue;
        }
        pc += 1;
    }
}

// ---------------------------------------------------------------------------
// Pass 4: common subexpression elimination
// ---------------------------------------------------------------------------

fn cse_key(instr: &Instr) -> Option<(Op, u8, u8)> {
    match instr.op {
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Mod | Op::Pow | Op::EqStore | Op::NeStore
        | Op::LtStore | Op::LeStore | Op::Len | Op::In | Op::NotIn => {
            Some((instr.op, instr.b(), instr.c()))
        }
        _ => None,
    }
}

/// Reuse previously computed pure expressions inside a basic block, keyed
/// by opcode and operand registers. The available set resets at block
/// boundaries and drains on register writes, global writes, indexed
/// stores, and calls.
fn eliminate_common_subexpressions(program: &mut Program, start: usize, end: usize) {
    let targets = jump_targets(&program.code, start, end);
    let mut available: HashMap<(Op, u8, u8), u8> = HashMap::new();

    for pc in start..=end.min(program.code.len().saturating_sub(1)) {
        if targets.contains(&pc) {
            available.clear();
        }
        let instr = program.code[pc].clone();

        if matches!(
            instr.op,
            Op::Call | Op::TailCall | Op::SetGlobal | Op::SetIndex | Op::SetIndexI | Op::ArrayPush
            // Skip-next opcodes make the following slot conditional.
            | Op::Eq | Op::Lt | Op::Le | Op::Test | Op::TestSet | Op::TestTag
        ) {
            available.clear();
        } else if let Some(key) = cse_key(&instr) {
            if let Some(&prev) = available.get(&key) {
                if prev != instr.a {
                    let mut replacement = Instr::abc(Op::Move, instr.a, prev, 0);
                    replacement.debug = instr.debug.clone();
                    program.code[pc] = replacement;
                }
            } else {
                available.insert(key, instr.a);
            }
        }

        if let Some(w) = program.code[pc].writes() {
            available.retain(|&(_, b, c), &mut dst| b != w && c != w && dst != w);
            // Re-admit the expression just computed into this register.
            if let Some(key) = cse_key(&program.code[pc]) {
                if key.1 != w && key.2 != w {
                    available.insert(key, w);
                }
            }
        }
        if instr.is_jump() {
            available.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Program;

    fn prog(code: Vec<Instr>) -> Program {
        let mut p = Program::new("opt.etch");
        for i in code {
            p.emit(i);
        }
        p.functions.insert(
            "main".into(),
            crate::bytecode::FunctionInfo {
                start_pc: 0,
                end_pc: p.code.len() as u32 - 1,
                param_count: 0,
                max_register_used: 8,
            },
        );
        p
    }

    #[test]
    fn folds_loadk_loadk_add() {
        let mut p = prog(vec![
            Instr::asbx(Op::LoadK, 1, 2),
            Instr::asbx(Op::LoadK, 2, 3),
            Instr::abc(Op::Add, 0, 1, 2),
            Instr::abc(Op::Return, 0, 1, 0),
        ]);
        optimize(&mut p, 1);
        assert_eq!(p.code[0].op, Op::Nop);
        assert_eq!(p.code[1].op, Op::Nop);
        assert_eq!(p.code[2].op, Op::LoadK);
        assert_eq!(p.code[2].sbx(), 5);
        assert_eq!(p.code[2].a, 0);
        // Stream length untouched; downstream PCs stable.
        assert_eq!(p.code.len(), 4);
    }

    #[test]
    fn does_not_fold_when_operand_register_is_read_later() {
        let mut p = prog(vec![
            Instr::asbx(Op::LoadK, 1, 2),
            Instr::asbx(Op::LoadK, 2, 3),
            Instr::abc(Op::Add, 0, 1, 2),
            // r1 is still needed here.
            Instr::abc(Op::Add, 3, 1, 0),
            Instr::abc(Op::Return, 3, 1, 0),
        ]);
        optimize(&mut p, 1);
        assert_eq!(p.code[0].op, Op::LoadK);
        assert_eq!(p.code[2].op, Op::Add);
    }

    #[test]
    fn does_not_fold_division() {
        let mut p = prog(vec![
            Instr::asbx(Op::LoadK, 1, 6),
            Instr::asbx(Op::LoadK, 2, 0),
            Instr::abc(Op::Div, 0, 1, 2),
            Instr::abc(Op::Return, 0, 1, 0),
        ]);
        optimize(&mut p, 1);
        assert_eq!(p.code[2].op, Op::Div);
    }

    #[test]
    fn fuses_test_jmp_into_cmpjmp() {
        let mut p = prog(vec![
            Instr::abc(Op::Test, 0, 0, 0),
            Instr::asbx(Op::Jmp, 0, 2),
            Instr::abc(Op::Nop, 0, 0, 0),
            Instr::abc(Op::Nop, 0, 0, 0),
            Instr::abc(Op::Return, 0, 0, 0),
        ]);
        optimize(&mut p, 1);
        assert_eq!(p.code[0].op, Op::CmpJmp);
        // Absorbs the Jmp one slot later: offset is the Jmp's plus one.
        assert_eq!(p.code[0].sbx(), 3);
        assert_eq!(p.code[1].op, Op::Nop);
    }

    #[test]
    fn fuses_counter_increment_with_back_edge() {
        let mut p = prog(vec![
            Instr::abc(Op::Nop, 0, 0, 0),
            Instr::abc(Op::AddI, 0, 0, 1),
            Instr::asbx(Op::Jmp, 0, -3),
            Instr::abc(Op::Return, 0, 0, 0),
        ]);
        optimize(&mut p, 1);
        assert_eq!(p.code[1].op, Op::IncTest);
        assert_eq!(p.code[1].sbx(), -2);
    }

    #[test]
    fn cse_reuses_pure_expression() {
        let mut p = prog(vec![
            Instr::abc(Op::Add, 2, 0, 1),
            Instr::abc(Op::Add, 3, 0, 1),
            Instr::abc(Op::Return, 3, 1, 0),
        ]);
        optimize(&mut p, 3);
        assert_eq!(p.code[1].op, Op::Move);
        assert_eq!(p.code[1].b(), 2);
    }

    #[test]
    fn cse_invalidated_by_call() {
        let mut p = prog(vec![
            Instr::abc(Op::Add, 2, 0, 1),
            Instr::call(Op::Call, 4, 0, 0, 1),
            Instr::abc(Op::Add, 3, 0, 1),
            Instr::abc(Op::Return, 3, 1, 0),
        ]);
        optimize(&mut p, 3);
        assert_eq!(p.code[2].op, Op::Add);
    }

    #[test]
    fn peephole_identity_arithmetic() {
        let mut p = prog(vec![
            Instr::abc(Op::AddI, 1, 0, 0),
            Instr::abc(Op::MulI, 2, 1, 1),
            Instr::abc(Op::Return, 2, 1, 0),
        ]);
        optimize(&mut p, 1);
        assert_eq!(p.code[0].op, Op::Move);
        assert_eq!(p.code[1].op, Op::Move);
    }
}
