/// AST → bytecode compiler.
///
/// Walks checked AST and emits three-address instructions into the program's
/// flat stream. Every expression returns the register holding its value;
/// statements mutate the allocator and lifetime tracker as they go.
///
/// Layout of a compiled module:
///   [user functions except main] [main] [<global_init> if globals exist]
/// The entry point is <global_init> when present (it initializes globals,
/// calls main, returns), otherwise the start of main.
///
/// Forward control flow uses placeholder jumps patched once the target PC is
/// known; offsets always encode `target - placeholder - 1`.

use std::collections::{HashMap, HashSet};

use crate::ast::{
    AssignTarget, BinOp, Expr, ForIter, Literal, MatchArm, Module, Param, Pattern, Pos, Stmt,
    UnOp, WrapKind,
};
use crate::bytecode::{FunctionInfo, Instr, Op, Program, ProgramFlags, SCRATCH_REG};
use crate::cffi::{CffiDescriptor, FfiType};
use crate::errors::CompileError;
use crate::intrinsics::is_builtin;
use crate::lifetime::{shrink_to_last_use, LifetimeTracker};
use crate::regalloc::RegisterAllocator;
use crate::value::{Tag, Value};

#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub opt_level: u8,
    pub debug_info: bool,
    pub verbose: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions { opt_level: 1, debug_info: true, verbose: false }
    }
}

/// Compile a checked module into an executable program. Runs the optimizer
/// afterwards when the options ask for it.
pub fn compile(module: &Module, opts: &CompileOptions) -> Result<Program, CompileError> {
    let mut program = Program::new(module.source_file.clone());
    program.flags = ProgramFlags {
        verbose: opts.verbose,
        debug: opts.debug_info,
        opt_level: opts.opt_level,
    };

    for ext in &module.externs {
        let param_types = ext
            .param_types
            .iter()
            .map(|t| FfiType::parse(t).unwrap_or(FfiType::I64))
            .collect();
        program.cffi.insert(
            ext.mangled.clone(),
            CffiDescriptor {
                library_name: ext.library.clone(),
                resolved_path: ext.resolved_path.clone(),
                symbol: ext.symbol.clone(),
                base_name: ext.base_name.clone(),
                param_types,
                return_type: FfiType::parse(&ext.return_type).unwrap_or(FfiType::Void),
            },
        );
    }

    let signatures: HashMap<String, Vec<Param>> = module
        .functions
        .iter()
        .map(|f| (f.name.clone(), f.params.clone()))
        .collect();
    let externs: HashSet<String> = module.externs.iter().map(|e| e.mangled.clone()).collect();

    // User functions first, main last among them.
    for func in module.functions.iter().filter(|f| f.name != "main") {
        compile_function(&mut program, &signatures, &externs, opts, &func.name, &func.params, &func.body)?;
    }
    if let Some(main) = module.functions.iter().find(|f| f.name == "main") {
        compile_function(&mut program, &signatures, &externs, opts, "main", &main.params, &main.body)?;
    }

    if !module.globals.is_empty() {
        let entry = compile_global_init(&mut program, &signatures, &externs, opts, module)?;
        program.entry_point = entry;
    } else if let Some(info) = program.functions.get("main") {
        program.entry_point = info.start_pc;
    } else {
        // Nothing to run: a single Halt keeps the stream well-formed.
        program.entry_point = program.emit(Instr::abc(Op::Halt, 0, 0, 0)) as u32;
    }

    if opts.opt_level >= 1 {
        crate::optimizer::optimize(&mut program, opts.opt_level);
    }
    Ok(program)
}

fn compile_function(
    program: &mut Program,
    signatures: &HashMap<String, Vec<Param>>,
    externs: &HashSet<String>,
    opts: &CompileOptions,
    name: &str,
    params: &[Param],
    body: &[Stmt],
) -> Result<(), CompileError> {
    let start_pc = program.code.len();
    let mut fc = FnCompiler {
        program,
        signatures,
        externs,
        opts,
        fname: name.to_string(),
        regs: RegisterAllocator::new(name),
        tracker: LifetimeTracker::new(),
        loops: Vec::new(),
        defers_emitted: 0,
    };

    // Parameter registers are seeded by the caller; they are defined the
    // moment the frame exists.
    for p in params {
        let reg = fc.regs.alloc_named(&p.name)?;
        fc.tracker.declare(&p.name, reg, start_pc);
        fc.tracker.define(&p.name, start_pc);
    }

    for stmt in body {
        fc.compile_stmt(stmt)?;
    }
    // Fall-through exit: defers still run, then an implicit nil return.
    let tail_pos = Pos::default();
    fc.emit_at(Instr::abc(Op::ExecDefers, 0, 0, 0), tail_pos);
    fc.emit_at(Instr::abc(Op::Return, 0, 0, 0), tail_pos);

    let max_register_used = fc.regs.high_water_mark() as u32;
    let FnCompiler { program, tracker, .. } = fc;
    let end_pc = program.code.len() - 1;
    let mut lifetimes = tracker.finish(end_pc);
    if opts.opt_level >= 1 {
        shrink_to_last_use(&mut lifetimes);
    }
    program.lifetimes.insert(name.to_string(), lifetimes);
    program.functions.insert(
        name.to_string(),
        FunctionInfo {
            start_pc: start_pc as u32,
            end_pc: end_pc as u32,
            param_count: params.len() as u32,
            max_register_used,
        },
    );
    // User functions are callable by index.
    if program.function_index(name).is_none() {
        program.function_table.push(name.to_string());
    }
    Ok(())
}

/// Synthesize `<global_init>`: run global initializers in frame 0, call
/// main, return. Returns its start PC.
fn compile_global_init(
    program: &mut Program,
    signatures: &HashMap<String, Vec<Param>>,
    externs: &HashSet<String>,
    opts: &CompileOptions,
    module: &Module,
) -> Result<u32, CompileError> {
    let start_pc = program.code.len();
    let mut fc = FnCompiler {
        program,
        signatures,
        externs,
        opts,
        fname: "<global_init>".to_string(),
        regs: RegisterAllocator::new("<global_init>"),
        tracker: LifetimeTracker::new(),
        loops: Vec::new(),
        defers_emitted: 0,
    };

    for (name, init, pos) in &module.globals {
        let vr = fc.compile_expr(init)?;
        let k = fc.program.constants.add(Value::Str(name.clone()))?;
        fc.emit_at(Instr::abx(Op::SetGlobal, vr, k), *pos);
        fc.free_temp(vr);
    }

    if fc.signatures.contains_key("main") {
        let r = fc.regs.alloc_temp()?;
        let idx = fc.table_index("main");
        fc.emit_at(Instr::call(Op::Call, r, idx, 0, 1), Pos::default());
        fc.free_temp(r);
    }
    fc.emit_at(Instr::abc(Op::Return, 0, 0, 0), Pos::default());

    let max_register_used = fc.regs.high_water_mark() as u32;
    let FnCompiler { program, tracker, .. } = fc;
    let end_pc = program.code.len() - 1;
    let lifetimes = tracker.finish(end_pc);
    program.lifetimes.insert("<global_init>".to_string(), lifetimes);
    program.functions.insert(
        "<global_init>".to_string(),
        FunctionInfo {
            start_pc: start_pc as u32,
            end_pc: end_pc as u32,
            param_count: 0,
            max_register_used,
        },
    );
    Ok(start_pc as u32)
}

struct LoopInfo {
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
}

struct FnCompiler<'a> {
    program: &'a mut Program,
    signatures: &'a HashMap<String, Vec<Param>>,
    externs: &'a HashSet<String>,
    opts: &'a CompileOptions,
    fname: String,
    regs: RegisterAllocator,
    tracker: LifetimeTracker,
    loops: Vec<LoopInfo>,
    defers_emitted: usize,
}

impl<'a> FnCompiler<'a> {
    fn emit_at(&mut self, instr: Instr, pos: Pos) -> usize {
        let instr = if self.opts.debug_info && pos.line != 0 {
            let file = self.program.source_file.clone();
            instr.with_debug(pos.line, pos.col, &file)
        } else {
            instr
        };
        self.program.emit(instr)
    }

    fn pc(&self) -> usize {
        self.program.code.len()
    }

    /// Free a register unless it currently backs a name.
    fn free_temp(&mut self, reg: u8) {
        if !self.regs.is_named(reg) {
            self.regs.free(reg);
        }
    }

    fn table_index(&mut self, name: &str) -> u16 {
        if let Some(idx) = self.program.function_index(name) {
            return idx;
        }
        self.program.function_table.push(name.to_string());
        (self.program.function_table.len() - 1) as u16
    }

    fn konst(&mut self, v: Value) -> Result<u16, CompileError> {
        self.program.constants.add(v)
    }

    // ── Statements ───────────────────────────────────────────────────────

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Expr(e) => {
                let r = self.compile_expr(e)?;
                self.free_temp(r);
                Ok(())
            }
            Stmt::Let { name, value, pos } => self.compile_let(name, value, *pos),
            Stmt::Assign { target, value, pos } => self.compile_assign(target, value, *pos),
            Stmt::If { condition, then_body, elif_branches, else_body, pos } => {
                self.compile_if(condition, then_body, elif_branches, else_body.as_deref(), *pos)
            }
            Stmt::While { condition, body, pos } => self.compile_while(condition, body, *pos),
            Stmt::For { var, iter, body, pos } => match iter {
                ForIter::Range { start, end, inclusive } => {
                    self.compile_for_range(var, start, end, *inclusive, body, *pos)
                }
                ForIter::Array(arr) => self.compile_for_array(var, arr, body, *pos),
            },
            Stmt::Return { value, pos } => self.compile_return(value.as_ref(), *pos),
            Stmt::Break { pos } => {
                let jmp = self.emit_at(Instr::asbx(Op::Jmp, 0, 0), *pos);
                match self.loops.last_mut() {
                    Some(li) => {
                        li.break_jumps.push(jmp);
                        Ok(())
                    }
                    None => Err(CompileError::IncoherentAst {
                        message: format!("break outside of a loop at line {}", pos.line),
                    }),
                }
            }
            Stmt::Continue { pos } => {
                let jmp = self.emit_at(Instr::asbx(Op::Jmp, 0, 0), *pos);
                match self.loops.last_mut() {
                    Some(li) => {
                        li.continue_jumps.push(jmp);
                        Ok(())
                    }
                    None => Err(CompileError::IncoherentAst {
                        message: format!("continue outside of a loop at line {}", pos.line),
                    }),
                }
            }
            Stmt::Defer { body, pos } => self.compile_defer(body, *pos),
            Stmt::Block(stmts) => {
                self.tracker.enter_scope();
                for s in stmts {
                    self.compile_stmt(s)?;
                }
                let pc = self.pc();
                self.tracker.exit_scope(pc);
                Ok(())
            }
        }
    }

    fn compile_let(&mut self, name: &str, value: &Expr, _pos: Pos) -> Result<(), CompileError> {
        let reg = self.regs.alloc_named(name)?;
        let decl_pc = self.pc();
        self.tracker.declare(name, reg, decl_pc);
        self.compile_expr_into(value, reg)?;
        let def_pc = self.pc().saturating_sub(1);
        self.tracker.define(name, def_pc);
        Ok(())
    }

    fn compile_assign(&mut self, target: &AssignTarget, value: &Expr, pos: Pos) -> Result<(), CompileError> {
        match target {
            AssignTarget::Name(name) => {
                if let Some(reg) = self.regs.lookup(name) {
                    self.compile_expr_into(value, reg)?;
                } else {
                    let vr = self.compile_expr(value)?;
                    let k = self.konst(Value::Str(name.clone()))?;
                    self.emit_at(Instr::abx(Op::SetGlobal, vr, k), pos);
                    self.free_temp(vr);
                }
                Ok(())
            }
            AssignTarget::Index { base, index } => {
                let br = self.compile_expr(base)?;
                // Immediate index stores when the index is a small literal.
                if let Expr::Literal { value: Literal::Int(n), .. } = index {
                    if (0..=255).contains(n) {
                        let vr = self.compile_expr(value)?;
                        self.emit_at(Instr::abc(Op::SetIndexI, br, *n as u8, vr), pos);
                        self.free_temp(vr);
                        self.free_temp(br);
                        return Ok(());
                    }
                }
                let ir = self.compile_expr(index)?;
                let vr = self.compile_expr(value)?;
                self.emit_at(Instr::abc(Op::SetIndex, br, ir, vr), pos);
                self.free_temp(vr);
                self.free_temp(ir);
                self.free_temp(br);
                Ok(())
            }
            AssignTarget::Field { base, field } => {
                let br = self.compile_expr(base)?;
                let kr = self.regs.alloc_temp()?;
                let k = self.konst(Value::Str(field.clone()))?;
                self.emit_at(Instr::abx(Op::LoadK, kr, k), pos);
                let vr = self.compile_expr(value)?;
                self.emit_at(Instr::abc(Op::SetIndex, br, kr, vr), pos);
                self.free_temp(vr);
                self.free_temp(kr);
                self.free_temp(br);
                Ok(())
            }
        }
    }

    fn compile_if(
        &mut self,
        condition: &Expr,
        then_body: &[Stmt],
        elif_branches: &[(Expr, Vec<Stmt>)],
        else_body: Option<&[Stmt]>,
        pos: Pos,
    ) -> Result<(), CompileError> {
        let mut end_jumps = Vec::new();

        let false_jump = self.compile_condition(condition, pos)?;
        self.compile_scoped_block(then_body)?;
        let has_more = !elif_branches.is_empty() || else_body.is_some();
        if has_more {
            end_jumps.push(self.emit_at(Instr::asbx(Op::Jmp, 0, 0), pos));
        }
        self.program.patch_jump_here(false_jump)?;

        for (i, (cond, body)) in elif_branches.iter().enumerate() {
            let false_jump = self.compile_condition(cond, cond.pos())?;
            self.compile_scoped_block(body)?;
            let more = i + 1 < elif_branches.len() || else_body.is_some();
            if more {
                end_jumps.push(self.emit_at(Instr::asbx(Op::Jmp, 0, 0), pos));
            }
            self.program.patch_jump_here(false_jump)?;
        }

        if let Some(body) = else_body {
            self.compile_scoped_block(body)?;
        }

        for j in end_jumps {
            self.program.patch_jump_here(j)?;
        }
        Ok(())
    }

    fn compile_while(&mut self, condition: &Expr, body: &[Stmt], pos: Pos) -> Result<(), CompileError> {
        let head = self.pc();
        let false_jump = self.compile_condition(condition, pos)?;

        self.loops.push(LoopInfo { break_jumps: Vec::new(), continue_jumps: Vec::new() });
        self.compile_scoped_block(body)?;

        let back = self.emit_at(Instr::asbx(Op::Jmp, 0, 0), pos);
        self.program.patch_jump_to(back, head as i64 - back as i64 - 1)?;
        self.program.patch_jump_here(false_jump)?;

        let li = self.loops.pop().expect("loop info pushed above");
        for j in li.break_jumps {
            self.program.patch_jump_here(j)?;
        }
        for j in li.continue_jumps {
            self.program.patch_jump_to(j, head as i64 - j as i64 - 1)?;
        }
        Ok(())
    }

    /// Numeric range loop over three consecutive registers: index, limit,
    /// step. ForPrep skips the whole loop when it would not run; ForLoop
    /// increments and loops back.
    fn compile_for_range(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        inclusive: bool,
        body: &[Stmt],
        pos: Pos,
    ) -> Result<(), CompileError> {
        self.regs.unmap(var);
        let base = self.regs.alloc_block3()?;
        self.compile_expr_into(start, base)?;
        self.compile_expr_into(end, base + 1)?;
        self.emit_at(Instr::asbx(Op::LoadK, base + 2, 1), pos);
        if inclusive {
            self.emit_at(Instr::abc(Op::AddI, base + 1, base + 1, 1), pos);
        }

        self.regs.map(var, base);
        self.tracker.enter_scope();
        let decl_pc = self.pc();
        self.tracker.declare(var, base, decl_pc);
        self.tracker.define(var, decl_pc);

        let prep = self.emit_at(Instr::asbx(Op::ForPrep, base, 0), pos);
        let body_start = self.pc();

        self.loops.push(LoopInfo { break_jumps: Vec::new(), continue_jumps: Vec::new() });
        for s in body {
            self.compile_stmt(s)?;
        }

        let forloop = self.emit_at(Instr::asbx(Op::ForLoop, base, 0), pos);
        self.program.patch_jump_to(forloop, body_start as i64 - forloop as i64 - 1)?;
        self.program.patch_jump_here(prep)?;

        let li = self.loops.pop().expect("loop info pushed above");
        for j in li.break_jumps {
            self.program.patch_jump_here(j)?;
        }
        for j in li.continue_jumps {
            self.program.patch_jump_to(j, forloop as i64 - j as i64 - 1)?;
        }

        let pc = self.pc();
        self.tracker.exit_scope(pc);
        self.regs.unmap(var);
        self.regs.free(base + 2);
        self.regs.free(base + 1);
        self.regs.free(base);
        Ok(())
    }

    /// Array iteration: compute the array once, walk an index against its
    /// length, load each element before the body.
    fn compile_for_array(
        &mut self,
        var: &str,
        arr: &Expr,
        body: &[Stmt],
        pos: Pos,
    ) -> Result<(), CompileError> {
        let ar = self.compile_expr(arr)?;
        let idx = self.regs.alloc_temp()?;
        self.emit_at(Instr::asbx(Op::LoadK, idx, 0), pos);
        let len = self.regs.alloc_temp()?;
        self.emit_at(Instr::abc(Op::Len, len, ar, 0), pos);

        self.regs.unmap(var);
        let elem = self.regs.alloc_named(var)?;

        self.tracker.enter_scope();
        let head = self.pc();
        // idx < len falls into the body; otherwise the Jmp exits.
        self.emit_at(Instr::abc(Op::Lt, 0, idx, len), pos);
        let exit = self.emit_at(Instr::asbx(Op::Jmp, 0, 0), pos);
        self.emit_at(Instr::abc(Op::GetIndex, elem, ar, idx), pos);
        let elem_pc = self.pc() - 1;
        self.tracker.declare(var, elem, elem_pc);
        self.tracker.define(var, elem_pc);

        self.loops.push(LoopInfo { break_jumps: Vec::new(), continue_jumps: Vec::new() });
        for s in body {
            self.compile_stmt(s)?;
        }

        let inc = self.emit_at(Instr::abc(Op::AddI, idx, idx, 1), pos);
        let back = self.emit_at(Instr::asbx(Op::Jmp, 0, 0), pos);
        self.program.patch_jump_to(back, head as i64 - back as i64 - 1)?;
        self.program.patch_jump_here(exit)?;

        let li = self.loops.pop().expect("loop info pushed above");
        for j in li.break_jumps {
            self.program.patch_jump_here(j)?;
        }
        for j in li.continue_jumps {
            self.program.patch_jump_to(j, inc as i64 - j as i64 - 1)?;
        }

        let pc = self.pc();
        self.tracker.exit_scope(pc);
        self.regs.unmap(var);
        self.regs.free(elem);
        self.regs.free(len);
        self.regs.free(idx);
        self.free_temp(ar);
        Ok(())
    }

    fn compile_return(&mut self, value: Option<&Expr>, pos: Pos) -> Result<(), CompileError> {
        match value {
            // Tail position call to a user function: reuse the frame. Only
            // when no defers are pending — their bodies run between the
            // argument window being filled and the TailCall reading it.
            Some(Expr::Call { callee, args, pos: cpos })
                if self.signatures.contains_key(callee) && self.defers_emitted == 0 =>
            {
                let (r, idx, argc) = self.prepare_call(callee, args, *cpos)?;
                self.emit_at(Instr::abc(Op::ExecDefers, 0, 0, 0), pos);
                self.emit_at(Instr::call(Op::TailCall, r, idx, argc, 1), pos);
                self.release_call_window(r, argc);
                Ok(())
            }
            Some(e) => {
                // Park the value in the scratch register: defer bodies may
                // scribble over any allocatable temporary.
                let r = self.compile_expr(e)?;
                self.emit_at(Instr::abc(Op::Move, SCRATCH_REG, r, 0), pos);
                self.emit_at(Instr::abc(Op::ExecDefers, 0, 0, 0), pos);
                self.emit_at(Instr::abc(Op::Return, SCRATCH_REG, 1, 0), pos);
                self.free_temp(r);
                Ok(())
            }
            None => {
                self.emit_at(Instr::abc(Op::ExecDefers, 0, 0, 0), pos);
                self.emit_at(Instr::abc(Op::Return, 0, 0, 0), pos);
                Ok(())
            }
        }
    }

    /// defer { body }:
    ///   Jmp over the body; body; DeferEnd; PushDefer with a negative
    ///   offset back to the body start. ExecDefers at returns pops the
    ///   recorded PCs in LIFO order.
    fn compile_defer(&mut self, body: &[Stmt], pos: Pos) -> Result<(), CompileError> {
        let skip = self.emit_at(Instr::asbx(Op::Jmp, 0, 0), pos);
        let body_start = self.pc();
        self.compile_scoped_block(body)?;
        self.emit_at(Instr::abc(Op::DeferEnd, 0, 0, 0), pos);
        self.program.patch_jump_here(skip)?;
        let push = self.emit_at(Instr::asbx(Op::PushDefer, 0, 0), pos);
        self.program.patch_jump_to(push, body_start as i64 - push as i64 - 1)?;
        self.defers_emitted += 1;
        Ok(())
    }

    fn compile_scoped_block(&mut self, body: &[Stmt]) -> Result<(), CompileError> {
        self.tracker.enter_scope();
        for s in body {
            self.compile_stmt(s)?;
        }
        let pc = self.pc();
        self.tracker.exit_scope(pc);
        Ok(())
    }

    // ── Conditions ───────────────────────────────────────────────────────

    /// Lower a branch condition. Direct comparisons use the skip-next form:
    /// the Jmp emitted right after is skipped when the condition holds and
    /// taken into the false branch otherwise. Returns the placeholder PC of
    /// that false-branch Jmp.
    fn compile_condition(&mut self, cond: &Expr, pos: Pos) -> Result<usize, CompileError> {
        if let Expr::Binary { op, lhs, rhs, pos: cpos } = cond {
            if let Some((skip_op, expected, swap)) = comparison_skip_form(*op) {
                let (l, r) = if swap { (rhs.as_ref(), lhs.as_ref()) } else { (lhs.as_ref(), rhs.as_ref()) };
                let lr = self.compile_expr(l)?;
                let rr = self.compile_expr(r)?;
                self.emit_at(Instr::abc(skip_op, expected, lr, rr), *cpos);
                let jmp = self.emit_at(Instr::asbx(Op::Jmp, 0, 0), *cpos);
                self.free_temp(rr);
                self.free_temp(lr);
                return Ok(jmp);
            }
        }
        let r = self.compile_expr(cond)?;
        // Truthy skips the Jmp into the body; falsy takes it.
        self.emit_at(Instr::abc(Op::Test, r, 0, 0), pos);
        let jmp = self.emit_at(Instr::asbx(Op::Jmp, 0, 0), pos);
        self.free_temp(r);
        Ok(jmp)
    }

    // ── Expressions ──────────────────────────────────────────────────────

    fn compile_expr(&mut self, e: &Expr) -> Result<u8, CompileError> {
        match e {
            Expr::Ident { name, pos } => {
                if let Some(reg) = self.regs.lookup(name) {
                    let pc = self.pc();
                    self.tracker.use_var(name, pc);
                    return Ok(reg);
                }
                let dst = self.regs.alloc_temp()?;
                let k = self.konst(Value::Str(name.clone()))?;
                self.emit_at(Instr::abx(Op::GetGlobal, dst, k), *pos);
                Ok(dst)
            }
            other => {
                let dst = self.regs.alloc_temp()?;
                self.compile_expr_into(other, dst)?;
                Ok(dst)
            }
        }
    }

    /// Compile an expression so its value lands in `dst`.
    fn compile_expr_into(&mut self, e: &Expr, dst: u8) -> Result<(), CompileError> {
        match e {
            Expr::Literal { value, pos } => self.compile_literal(value, dst, *pos),
            Expr::Ident { name, pos } => {
                if let Some(reg) = self.regs.lookup(name) {
                    let pc = self.pc();
                    self.tracker.use_var(name, pc);
                    // Emitted even when reg == dst so the definition point
                    // stays observable to the lifetime tracker.
                    self.emit_at(Instr::abc(Op::Move, dst, reg, 0), *pos);
                } else {
                    let k = self.konst(Value::Str(name.clone()))?;
                    self.emit_at(Instr::abx(Op::GetGlobal, dst, k), *pos);
                }
                Ok(())
            }
            Expr::Binary { op, lhs, rhs, pos } => self.compile_binary(*op, lhs, rhs, dst, *pos),
            Expr::Unary { op, operand, pos } => {
                let r = self.compile_expr(operand)?;
                let opcode = match op {
                    UnOp::Neg => Op::Neg,
                    UnOp::Not => Op::Not,
                };
                self.emit_at(Instr::abc(opcode, dst, r, 0), *pos);
                self.free_temp(r);
                Ok(())
            }
            Expr::Call { callee, args, pos } => {
                let r = self.compile_call(callee, args, *pos)?;
                if r != dst {
                    self.emit_at(Instr::abc(Op::Move, dst, r, 0), *pos);
                }
                self.free_temp(r);
                Ok(())
            }
            Expr::Index { base, index, pos } => {
                let br = self.compile_expr(base)?;
                if let Expr::Literal { value: Literal::Int(n), .. } = index.as_ref() {
                    if (0..=255).contains(n) {
                        self.emit_at(Instr::abc(Op::GetIndexI, dst, br, *n as u8), *pos);
                        self.free_temp(br);
                        return Ok(());
                    }
                }
                let ir = self.compile_expr(index)?;
                self.emit_at(Instr::abc(Op::GetIndex, dst, br, ir), *pos);
                self.free_temp(ir);
                self.free_temp(br);
                Ok(())
            }
            Expr::Field { base, field, pos } => {
                let br = self.compile_expr(base)?;
                let kr = self.regs.alloc_temp()?;
                let k = self.konst(Value::Str(field.clone()))?;
                self.emit_at(Instr::abx(Op::LoadK, kr, k), *pos);
                self.emit_at(Instr::abc(Op::GetIndex, dst, br, kr), *pos);
                self.free_temp(kr);
                self.free_temp(br);
                Ok(())
            }
            Expr::Slice { base, start, end, pos } => {
                let br = self.compile_expr(base)?;
                let sr = self.compile_expr(start)?;
                let er = self.compile_expr(end)?;
                // Slice reads bounds from two consecutive registers.
                let lo = self.regs.alloc_temp()?;
                let hi = self.regs.alloc_temp()?;
                self.emit_at(Instr::abc(Op::Move, lo, sr, 0), *pos);
                self.emit_at(Instr::abc(Op::Move, hi, er, 0), *pos);
                self.emit_at(Instr::abc(Op::Slice, dst, br, lo), *pos);
                self.free_temp(hi);
                self.free_temp(lo);
                self.free_temp(er);
                self.free_temp(sr);
                self.free_temp(br);
                Ok(())
            }
            Expr::ArrayLit { items, pos } => {
                self.emit_at(Instr::abc(Op::NewArray, dst, 0, 0), *pos);
                for item in items {
                    let r = self.compile_expr(item)?;
                    self.emit_at(Instr::abc(Op::ArrayPush, dst, r, 0), *pos);
                    self.free_temp(r);
                }
                Ok(())
            }
            Expr::TableLit { entries, pos } => {
                self.emit_at(Instr::abc(Op::NewTable, dst, 0, 0), *pos);
                for (key, val) in entries {
                    let kr = self.regs.alloc_temp()?;
                    let k = self.konst(Value::Str(key.clone()))?;
                    self.emit_at(Instr::abx(Op::LoadK, kr, k), *pos);
                    let vr = self.compile_expr(val)?;
                    self.emit_at(Instr::abc(Op::SetIndex, dst, kr, vr), *pos);
                    self.free_temp(vr);
                    self.free_temp(kr);
                }
                Ok(())
            }
            Expr::Wrap { tag, inner, pos } => {
                let r = self.compile_expr(inner)?;
                let opcode = match tag {
                    WrapKind::Some => Op::WrapSome,
                    WrapKind::Ok => Op::WrapOk,
                    WrapKind::Err => Op::WrapErr,
                };
                self.emit_at(Instr::abc(opcode, dst, r, 0), *pos);
                self.free_temp(r);
                Ok(())
            }
            Expr::Match { scrutinee, arms, pos } => self.compile_match(scrutinee, arms, dst, *pos),
        }
    }

    fn compile_literal(&mut self, lit: &Literal, dst: u8, pos: Pos) -> Result<(), CompileError> {
        match lit {
            Literal::Int(n) if (-32767..=32767).contains(n) => {
                self.emit_at(Instr::asbx(Op::LoadK, dst, *n as i16), pos);
            }
            Literal::Int(n) => {
                let k = self.konst(Value::Int(*n))?;
                self.emit_at(Instr::abx(Op::LoadK, dst, k), pos);
            }
            Literal::Float(f) => {
                let k = self.konst(Value::Float(*f))?;
                self.emit_at(Instr::abx(Op::LoadK, dst, k), pos);
            }
            Literal::Bool(b) => {
                let k = self.konst(Value::Bool(*b))?;
                self.emit_at(Instr::abx(Op::LoadK, dst, k), pos);
            }
            Literal::Char(c) => {
                let k = self.konst(Value::Char(*c))?;
                self.emit_at(Instr::abx(Op::LoadK, dst, k), pos);
            }
            Literal::Str(s) => {
                let k = self.konst(Value::Str(s.clone()))?;
                self.emit_at(Instr::abx(Op::LoadK, dst, k), pos);
            }
            Literal::Nil => {
                self.emit_at(Instr::abc(Op::LoadNil, dst, 0, 0), pos);
            }
            Literal::NoneLit => {
                let k = self.konst(Value::None)?;
                self.emit_at(Instr::abx(Op::LoadK, dst, k), pos);
            }
        }
        Ok(())
    }

    fn compile_binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: u8,
        pos: Pos,
    ) -> Result<(), CompileError> {
        // Fusion window (opt ≥ 2): (a + b) + c and a * b + c collapse into
        // one Ax-form instruction over three source registers.
        if self.opts.opt_level >= 2 && op == BinOp::Add {
            if let Expr::Binary { op: inner_op, lhs: il, rhs: ir, .. } = lhs {
                if matches!(inner_op, BinOp::Add | BinOp::Mul) {
                    let fused = if *inner_op == BinOp::Add { Op::AddAdd } else { Op::MulAdd };
                    let x = self.compile_expr(il)?;
                    let y = self.compile_expr(ir)?;
                    let z = self.compile_expr(rhs)?;
                    self.emit_at(Instr::ax(fused, dst, x, y, z), pos);
                    self.free_temp(z);
                    self.free_temp(y);
                    self.free_temp(x);
                    return Ok(());
                }
            }
        }

        // Immediate arithmetic when the RHS is a byte-sized int literal.
        if let Some(imm_op) = immediate_form(op) {
            if let Expr::Literal { value: Literal::Int(n), .. } = rhs {
                if (-128..=127).contains(n) {
                    let lr = self.compile_expr(lhs)?;
                    self.emit_at(Instr::abc(imm_op, dst, lr, *n as i8 as u8), pos);
                    self.free_temp(lr);
                    return Ok(());
                }
            }
        }

        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Pow => {
                let opcode = match op {
                    BinOp::Add => Op::Add,
                    BinOp::Sub => Op::Sub,
                    BinOp::Mul => Op::Mul,
                    BinOp::Div => Op::Div,
                    BinOp::Mod => Op::Mod,
                    _ => Op::Pow,
                };
                let lr = self.compile_expr(lhs)?;
                let rr = self.compile_expr(rhs)?;
                self.emit_at(Instr::abc(opcode, dst, lr, rr), pos);
                self.free_temp(rr);
                self.free_temp(lr);
                Ok(())
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let (opcode, swap) = match op {
                    BinOp::Eq => (Op::EqStore, false),
                    BinOp::Ne => (Op::NeStore, false),
                    BinOp::Lt => (Op::LtStore, false),
                    BinOp::Le => (Op::LeStore, false),
                    BinOp::Gt => (Op::LtStore, true),
                    _ => (Op::LeStore, true),
                };
                let (l, r) = if swap { (rhs, lhs) } else { (lhs, rhs) };
                let lr = self.compile_expr(l)?;
                let rr = self.compile_expr(r)?;
                self.emit_at(Instr::abc(opcode, dst, lr, rr), pos);
                self.free_temp(rr);
                self.free_temp(lr);
                Ok(())
            }
            BinOp::And | BinOp::Or => {
                let opcode = if op == BinOp::And { Op::And } else { Op::Or };
                let lr = self.compile_expr(lhs)?;
                let rr = self.compile_expr(rhs)?;
                self.emit_at(Instr::abc(opcode, dst, lr, rr), pos);
                self.free_temp(rr);
                self.free_temp(lr);
                Ok(())
            }
            BinOp::In | BinOp::NotIn => {
                let opcode = if op == BinOp::In { Op::In } else { Op::NotIn };
                let lr = self.compile_expr(lhs)?;
                let rr = self.compile_expr(rhs)?;
                self.emit_at(Instr::abc(opcode, dst, lr, rr), pos);
                self.free_temp(rr);
                self.free_temp(lr);
                Ok(())
            }
        }
    }

    /// Call protocol: allocate the result register, reserve the argument
    /// window right above it, fill the window, emit the call.
    fn prepare_call(&mut self, callee: &str, args: &[Expr], pos: Pos) -> Result<(u8, u16, u8), CompileError> {
        let known_user = self.signatures.contains_key(callee);
        if !known_user && !self.externs.contains(callee) && !is_builtin(callee) {
            return Err(CompileError::UnknownFunction { name: callee.to_string() });
        }

        // Fill omitted trailing arguments from declared defaults.
        let mut full_args: Vec<Expr> = args.to_vec();
        if let Some(params) = self.signatures.get(callee) {
            for p in params.iter().skip(args.len()) {
                match &p.default {
                    Some(lit) => full_args.push(Expr::Literal { value: lit.clone(), pos }),
                    None => break,
                }
            }
        }

        let result = self.regs.alloc_temp()?;
        let argc = full_args.len();
        if result as usize + argc >= 255 {
            return Err(CompileError::RegisterExhausted { function: self.fname.clone() });
        }
        if argc > 0 {
            self.regs.reserve_through(result + argc as u8);
        }
        for (i, arg) in full_args.iter().enumerate() {
            let target = result + 1 + i as u8;
            let r = self.compile_expr(arg)?;
            if r != target {
                self.emit_at(Instr::abc(Op::Move, target, r, 0), arg.pos());
                self.free_temp(r);
            }
        }
        let idx = self.table_index(callee);
        Ok((result, idx, argc as u8))
    }

    fn release_call_window(&mut self, result: u8, argc: u8) {
        for i in (1..=argc).rev() {
            self.regs.free(result + i);
        }
    }

    fn compile_call(&mut self, callee: &str, args: &[Expr], pos: Pos) -> Result<u8, CompileError> {
        let (result, idx, argc) = self.prepare_call(callee, args, pos)?;
        self.emit_at(Instr::call(Op::Call, result, idx, argc, 1), pos);
        self.release_call_window(result, argc);
        Ok(result)
    }

    /// match lowering: one TestTag per tagged arm that skips the arm's
    /// reject-jump on a hit; bindings unwrap into a fresh register mapped
    /// for the arm body; every arm but the last jumps to the join point.
    fn compile_match(
        &mut self,
        scrutinee: &Expr,
        arms: &[MatchArm],
        dst: u8,
        pos: Pos,
    ) -> Result<(), CompileError> {
        let sr = self.compile_expr(scrutinee)?;
        let mut end_jumps = Vec::new();

        for (i, arm) in arms.iter().enumerate() {
            let last = i + 1 == arms.len();
            let reject = match pattern_tag(&arm.pattern) {
                Some(tag) => {
                    self.emit_at(Instr::abc(Op::TestTag, sr, tag as u8, 0), arm.pos);
                    Some(self.emit_at(Instr::asbx(Op::Jmp, 0, 0), arm.pos))
                }
                None => None, // wildcard matches anything
            };

            let binding = pattern_binding(&arm.pattern);
            let bound_reg = match &binding {
                Some(name) => {
                    let br = self.regs.alloc_temp()?;
                    let unwrap_op = match arm.pattern {
                        Pattern::Some(_) => Op::UnwrapOption,
                        _ => Op::UnwrapResult,
                    };
                    self.emit_at(Instr::abc(unwrap_op, br, sr, 0), arm.pos);
                    let def_pc = self.pc() - 1;
                    self.regs.map(name, br);
                    self.tracker.enter_scope();
                    self.tracker.declare(name, br, def_pc);
                    self.tracker.define(name, def_pc);
                    Some(br)
                }
                None => None,
            };

            let vr = self.compile_expr(&arm.body)?;
            if vr != dst {
                self.emit_at(Instr::abc(Op::Move, dst, vr, 0), arm.pos);
            }
            self.free_temp(vr);

            if let (Some(name), Some(br)) = (&binding, bound_reg) {
                let pc = self.pc();
                self.tracker.exit_scope(pc);
                self.regs.unmap(name);
                self.regs.free(br);
            }

            if !last {
                end_jumps.push(self.emit_at(Instr::asbx(Op::Jmp, 0, 0), pos));
            }
            if let Some(r) = reject {
                self.program.patch_jump_here(r)?;
            }
        }

        for j in end_jumps {
            self.program.patch_jump_here(j)?;
        }
        self.free_temp(sr);
        Ok(())
    }
}

fn pattern_tag(p: &Pattern) -> Option<Tag> {
    match p {
        Pattern::Some(_) => Some(Tag::Some),
        Pattern::None => Some(Tag::None),
        Pattern::Ok(_) => Some(Tag::Ok),
        Pattern::Err(_) => Some(Tag::Err),
        Pattern::Type(tag) => Some(*tag),
        Pattern::Wildcard => None,
    }
}

fn pattern_binding(p: &Pattern) -> Option<String> {
    match p {
        Pattern::Some(b) | Pattern::Ok(b) | Pattern::Err(b) => b.clone(),
        _ => None,
    }
}

/// Map a comparison operator to its skip-next opcode, the expected-truth
/// operand A, and whether the operands must swap (> and >= reuse Lt/Le).
fn comparison_skip_form(op: BinOp) -> Option<(Op, u8, bool)> {
    match op {
        BinOp::Eq => Some((Op::Eq, 0, false)),
        BinOp::Ne => Some((Op::Eq, 1, false)),
        BinOp::Lt => Some((Op::Lt, 0, false)),
        BinOp::Le => Some((Op::Le, 0, false)),
        BinOp::Gt => Some((Op::Lt, 0, true)),
        BinOp::Ge => Some((Op::Le, 0, true)),
        _ => None,
    }
}

fn immediate_form(op: BinOp) -> Option<Op> {
    match op {
        BinOp::Add => Some(Op::AddI),
        BinOp::Sub => Some(Op::SubI),
        BinOp::Mul => Some(Op::MulI),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Function, Module, Stmt};
    use crate::bytecode::Operands;

    fn module_with_main(body: Vec<Stmt>) -> Module {
        Module {
            source_file: "test.etch".into(),
            functions: vec![Function {
                name: "main".into(),
                params: vec![],
                body,
                pos: Pos::line(1),
            }],
            externs: vec![],
            globals: vec![],
        }
    }

    fn compile_main(body: Vec<Stmt>, opt_level: u8) -> Program {
        let module = module_with_main(body);
        let opts = CompileOptions { opt_level, debug_info: true, verbose: false };
        compile(&module, &opts).expect("compilation should succeed")
    }

    fn ops_of(p: &Program) -> Vec<Op> {
        p.code.iter().map(|i| i.op).collect()
    }

    #[test]
    fn small_int_literal_uses_immediate_loadk() {
        let p = compile_main(vec![Stmt::let_("x", Expr::int(7, 1), 1)], 0);
        let first = &p.code[0];
        assert_eq!(first.op, Op::LoadK);
        assert!(matches!(first.operands, Operands::AsBx { sbx: 7 }));
    }

    #[test]
    fn large_int_literal_goes_through_pool() {
        let p = compile_main(vec![Stmt::let_("x", Expr::int(100_000, 1), 1)], 0);
        let first = &p.code[0];
        assert_eq!(first.op, Op::LoadK);
        assert!(matches!(first.operands, Operands::ABx { .. }));
        assert_eq!(p.constants.get(first.bx()), Value::Int(100_000));
    }

    #[test]
    fn immediate_add_for_byte_rhs() {
        let p = compile_main(
            vec![
                Stmt::let_("x", Expr::int(1, 1), 1),
                Stmt::let_("y", Expr::binary(BinOp::Add, Expr::ident("x", 2), Expr::int(5, 2), 2), 2),
            ],
            0,
        );
        assert!(ops_of(&p).contains(&Op::AddI));
    }

    #[test]
    fn muladd_fuses_at_opt2_only() {
        let expr = Expr::binary(
            BinOp::Add,
            Expr::binary(BinOp::Mul, Expr::int(2, 1), Expr::int(3, 1), 1),
            Expr::int(4, 1),
            1,
        );
        let fused = compile_main(vec![Stmt::let_("x", expr.clone(), 1)], 2);
        assert_eq!(ops_of(&fused).iter().filter(|o| **o == Op::MulAdd).count(), 1);
        let plain = compile_main(vec![Stmt::let_("x", expr, 1)], 0);
        assert!(!ops_of(&plain).contains(&Op::MulAdd));
    }

    #[test]
    fn while_condition_uses_skip_next_comparison() {
        let body = vec![Stmt::While {
            condition: Expr::binary(BinOp::Lt, Expr::ident("i", 1), Expr::int(5, 1), 1),
            body: vec![Stmt::assign(
                "i",
                Expr::binary(BinOp::Add, Expr::ident("i", 2), Expr::int(1, 2), 2),
                2,
            )],
            pos: Pos::line(1),
        }];
        let p = compile_main(
            [vec![Stmt::let_("i", Expr::int(0, 1), 1)], body].concat(),
            0,
        );
        let ops = ops_of(&p);
        let lt = ops.iter().position(|o| *o == Op::Lt).expect("skip-next Lt");
        assert_eq!(ops[lt + 1], Op::Jmp);
        // The comparison expects truth (A=0 form) and the loop jumps back.
        assert_eq!(p.code[lt].a, 0);
        assert!(p.code.iter().any(|i| i.op == Op::Jmp && i.sbx() < 0));
    }

    #[test]
    fn greater_than_swaps_operands() {
        let body = vec![Stmt::If {
            condition: Expr::binary(BinOp::Gt, Expr::ident("a", 1), Expr::ident("b", 1), 1),
            then_body: vec![],
            elif_branches: vec![],
            else_body: None,
            pos: Pos::line(1),
        }];
        let p = compile_main(
            [
                vec![
                    Stmt::let_("a", Expr::int(1, 1), 1),
                    Stmt::let_("b", Expr::int(2, 1), 1),
                ],
                body,
            ]
            .concat(),
            0,
        );
        let lt = p.code.iter().find(|i| i.op == Op::Lt).expect("swapped Lt");
        // a is r0, b is r1; `a > b` becomes Lt with b first.
        assert_eq!((lt.b(), lt.c()), (1, 0));
    }

    #[test]
    fn defer_emits_skip_body_and_negative_pushdefer() {
        let p = compile_main(
            vec![Stmt::Defer {
                body: vec![Stmt::expr(Expr::call("print", vec![Expr::str("a", 2)], 2))],
                pos: Pos::line(2),
            }],
            0,
        );
        let ops = ops_of(&p);
        assert!(ops.contains(&Op::DeferEnd));
        let push = p.code.iter().find(|i| i.op == Op::PushDefer).unwrap();
        assert!(push.sbx() < 0, "PushDefer points backwards at the body");
        // Return path runs pending defers first.
        let ret = ops.iter().position(|o| *o == Op::Return).unwrap();
        assert_eq!(ops[ret - 1], Op::ExecDefers);
    }

    #[test]
    fn call_reserves_argument_window() {
        let module = Module {
            source_file: "t.etch".into(),
            functions: vec![
                Function {
                    name: "add2".into(),
                    params: vec![
                        Param { name: "a".into(), default: None },
                        Param { name: "b".into(), default: Some(Literal::Int(10)) },
                    ],
                    body: vec![Stmt::Return {
                        value: Some(Expr::binary(BinOp::Add, Expr::ident("a", 1), Expr::ident("b", 1), 1)),
                        pos: Pos::line(1),
                    }],
                    pos: Pos::line(1),
                },
                Function {
                    name: "main".into(),
                    params: vec![],
                    body: vec![Stmt::let_("r", Expr::call("add2", vec![Expr::int(1, 3)], 3), 3)],
                    pos: Pos::line(3),
                },
            ],
            externs: vec![],
            globals: vec![],
        };
        let p = compile(&module, &CompileOptions::default()).unwrap();
        let call = p.code.iter().find(|i| i.op == Op::Call).unwrap();
        match call.operands {
            Operands::Call { nargs, nres, .. } => {
                // One explicit arg + one default.
                assert_eq!(nargs, 2);
                assert_eq!(nres, 1);
            }
            _ => panic!("call operands"),
        }
        assert_eq!(p.function_table[call_func_index(call)], "add2");
    }

    fn call_func_index(i: &Instr) -> usize {
        match i.operands {
            Operands::Call { func, .. } => func as usize,
            _ => unreachable!(),
        }
    }

    #[test]
    fn unknown_callee_is_a_compile_error() {
        let module = module_with_main(vec![Stmt::expr(Expr::call("no_such_fn", vec![], 1))]);
        let err = compile(&module, &CompileOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::UnknownFunction { .. }));
    }

    #[test]
    fn globals_produce_synthetic_entry() {
        let module = Module {
            source_file: "t.etch".into(),
            functions: vec![Function {
                name: "main".into(),
                params: vec![],
                body: vec![],
                pos: Pos::line(2),
            }],
            externs: vec![],
            globals: vec![("g".into(), Expr::int(9, 1), Pos::line(1))],
        };
        let p = compile(&module, &CompileOptions::default()).unwrap();
        let init = p.functions.get("<global_init>").expect("synthetic entry");
        assert_eq!(p.entry_point, init.start_pc);
        let init_ops: Vec<Op> = p.code[init.start_pc as usize..=init.end_pc as usize]
            .iter()
            .map(|i| i.op)
            .collect();
        assert!(init_ops.contains(&Op::SetGlobal));
        assert!(init_ops.contains(&Op::Call));
        assert_eq!(*init_ops.last().unwrap(), Op::Return);
    }

    #[test]
    fn for_range_allocates_consecutive_triple() {
        let p = compile_main(
            vec![Stmt::For {
                var: "i".into(),
                iter: ForIter::Range {
                    start: Expr::int(1, 1),
                    end: Expr::int(3, 1),
                    inclusive: true,
                },
                body: vec![Stmt::expr(Expr::call("print", vec![Expr::ident("i", 2)], 2))],
                pos: Pos::line(1),
            }],
            0,
        );
        let ops = ops_of(&p);
        assert!(ops.contains(&Op::ForPrep));
        assert!(ops.contains(&Op::ForLoop));
        // Inclusive range bumps the stored limit by one at prep time.
        let prep = ops.iter().position(|o| *o == Op::ForPrep).unwrap();
        assert_eq!(ops[prep - 1], Op::AddI);
        let forloop = p.code.iter().find(|i| i.op == Op::ForLoop).unwrap();
        assert!(forloop.sbx() < 0);
    }

    #[test]
    fn match_compiles_testtag_chain() {
        let m = Expr::Match {
            scrutinee: Box::new(Expr::ident("x", 2)),
            arms: vec![
                MatchArm {
                    pattern: Pattern::Some(Some("n".into())),
                    body: Expr::ident("n", 2),
                    pos: Pos::line(2),
                },
                MatchArm {
                    pattern: Pattern::None,
                    body: Expr::int(-1, 3),
                    pos: Pos::line(3),
                },
            ],
            pos: Pos::line(2),
        };
        let p = compile_main(
            vec![
                Stmt::let_("x", Expr::Wrap {
                    tag: WrapKind::Some,
                    inner: Box::new(Expr::int(42, 1)),
                    pos: Pos::line(1),
                }, 1),
                Stmt::let_("y", m, 2),
            ],
            0,
        );
        let ops = ops_of(&p);
        assert_eq!(ops.iter().filter(|o| **o == Op::TestTag).count(), 2);
        assert!(ops.contains(&Op::UnwrapOption));
    }

    #[test]
    fn lifetimes_are_recorded_per_function() {
        let p = compile_main(
            vec![
                Stmt::let_("x", Expr::int(1, 1), 1),
                Stmt::expr(Expr::call("print", vec![Expr::ident("x", 2)], 2)),
            ],
            0,
        );
        let lt = p.lifetimes.get("main").expect("main lifetimes");
        let x = lt.ranges.iter().find(|r| r.name == "x").expect("range for x");
        assert!(x.def_pc >= 0);
        assert!(x.end_pc >= x.def_pc);
    }

    #[test]
    fn tail_position_call_uses_tailcall() {
        let module = Module {
            source_file: "t.etch".into(),
            functions: vec![
                Function {
                    name: "leaf".into(),
                    params: vec![],
                    body: vec![Stmt::Return { value: Some(Expr::int(1, 1)), pos: Pos::line(1) }],
                    pos: Pos::line(1),
                },
                Function {
                    name: "main".into(),
                    params: vec![],
                    body: vec![Stmt::Return {
                        value: Some(Expr::call("leaf", vec![], 4)),
                        pos: Pos::line(4),
                    }],
                    pos: Pos::line(3),
                },
            ],
            externs: vec![],
            globals: vec![],
        };
        let p = compile(&module, &CompileOptions::default()).unwrap();
        assert!(p.code.iter().any(|i| i.op == Op::TailCall));
    }
}
