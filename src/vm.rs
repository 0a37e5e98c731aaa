/// Execution engine.
///
/// A single dispatch loop over the instruction stream. Frames own a 256-slot
/// register file and live on an explicit Vec, so deep recursion never
/// touches the Rust stack. PC increments before dispatch; skip-next opcodes
/// add one more.
///
/// `execute` returns a status instead of throwing: Done (exit 0), Paused
/// (the debugger asked to yield; clear the pause and re-enter to resume
/// from the saved PC), or Fatal with a positive exit code. No suspension
/// happens inside an instruction. The stdout buffer is flushed on every
/// return path.
///
/// Recoverable type errors never branch: mismatched arithmetic writes Nil
/// and execution continues.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use crate::bytecode::{Instr, Op, Operands, Program};
use crate::cffi::CffiRegistry;
use crate::conf::DEFAULT_SEED;
use crate::debugger::Debugger;
use crate::errors::VmError;
use crate::intrinsics;
use crate::replay::{FrameSnapshot, Recorder, RestoredState};
use crate::stats::DispatchStats;
use crate::value::{
    arith_add, arith_div, arith_mod, arith_mul, arith_neg, arith_pow, arith_sub, cmp_le, cmp_lt,
    contains, index_get, index_set, length, slice, Value,
};

pub const FRAME_REGISTERS: usize = 256;
pub const MAX_CALL_DEPTH: usize = 1024;

const FLUSH_BYTES: usize = 8 * 1024;
const FLUSH_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Done,
    Paused,
    Fatal(i32),
}

impl ExecStatus {
    /// 0 = normal termination, -1 = paused, positive = fatal.
    pub fn code(self) -> i32 {
        match self {
            ExecStatus::Done => 0,
            ExecStatus::Paused => -1,
            ExecStatus::Fatal(code) => code,
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

pub struct Frame {
    pub function: String,
    pub registers: Vec<Value>,
    pub pc: usize,
    /// Absolute PC in the caller to continue at after Return.
    pub return_pc: usize,
    /// Caller register receiving this frame's return value.
    pub result_reg: u8,
    pub nres: u8,
    /// PCs of pending defer bodies, executed LIFO at ExecDefers.
    pub defers: Vec<usize>,
    /// Where DeferEnd hands control back to.
    pub defer_return_pc: usize,
}

/// Outcome of popping a frame for a return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramePop {
    /// Control continues in the caller frame.
    Continued,
    /// The last frame popped; the program is over.
    Finished,
    /// Pop with no frame on the stack.
    Underflow,
}

impl Frame {
    fn new(function: &str) -> Frame {
        Frame {
            function: function.to_string(),
            registers: vec![Value::Nil; FRAME_REGISTERS],
            pc: 0,
            return_pc: 0,
            result_reg: 0,
            nres: 0,
            defers: Vec::new(),
            defer_return_pc: 0,
        }
    }
}

fn frame_snapshot(frame: &Frame, program: &Program) -> FrameSnapshot {
    let reg_count = program
        .functions
        .get(&frame.function)
        .map(|f| (f.max_register_used as usize + 1).min(FRAME_REGISTERS))
        .unwrap_or(FRAME_REGISTERS);
    FrameSnapshot {
        function: frame.function.clone(),
        pc: frame.pc,
        registers: frame.registers[..reg_count].iter().map(Value::deep_copy).collect(),
        result_reg: frame.result_reg,
        nres: frame.nres,
        return_pc: frame.return_pc,
        defers: frame.defers.clone(),
    }
}

fn frame_from_snapshot(snap: &FrameSnapshot) -> Frame {
    let mut registers = vec![Value::Nil; FRAME_REGISTERS];
    for (i, v) in snap.registers.iter().enumerate().take(FRAME_REGISTERS) {
        registers[i] = v.deep_copy();
    }
    Frame {
        function: snap.function.clone(),
        registers,
        pc: snap.pc,
        return_pc: snap.return_pc,
        result_reg: snap.result_reg,
        nres: snap.nres,
        defers: snap.defers.clone(),
        defer_return_pc: 0,
    }
}

// ---------------------------------------------------------------------------
// Buffered stdout
// ---------------------------------------------------------------------------

struct OutputBuffer {
    buf: String,
    lines: usize,
    /// When set, output collects here instead of stdout (debug sinks,
    /// deterministic tests).
    capture: Option<String>,
}

impl OutputBuffer {
    fn new() -> OutputBuffer {
        OutputBuffer { buf: String::new(), lines: 0, capture: None }
    }

    fn push_line(&mut self, line: &str) {
        self.buf.push_str(line);
        self.buf.push('\n');
        self.lines += 1;
        if self.buf.len() >= FLUSH_BYTES || self.lines >= FLUSH_LINES {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        match &mut self.capture {
            Some(sink) => sink.push_str(&self.buf),
            None => {
                print!("{}", self.buf);
                let _ = std::io::stdout().flush();
            }
        }
        self.buf.clear();
        self.lines = 0;
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    program: Arc<Program>,
    registry: Arc<CffiRegistry>,
    pub globals: HashMap<String, Value>,
    frames: Vec<Frame>,
    out: OutputBuffer,
    rng_state: u64,
    pub debugger: Option<Debugger>,
    pub recorder: Option<Recorder>,
    pub stats: DispatchStats,
    pub trace: bool,
    last_error: Option<VmError>,
}

impl Executor {
    pub fn new(program: Arc<Program>, registry: Arc<CffiRegistry>) -> Executor {
        Executor {
            program,
            registry,
            globals: HashMap::new(),
            frames: Vec::with_capacity(16),
            out: OutputBuffer::new(),
            rng_state: DEFAULT_SEED,
            debugger: None,
            recorder: None,
            stats: DispatchStats::new(),
            trace: false,
            last_error: None,
        }
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.rng_state = if seed == 0 { DEFAULT_SEED } else { seed };
    }

    /// Collect print output instead of writing to stdout.
    pub fn capture_output(&mut self) {
        self.out.capture = Some(String::new());
    }

    pub fn take_output(&mut self) -> String {
        self.out.flush();
        self.out.capture.take().unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<&VmError> {
        self.last_error.as_ref()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Current frame's function and PC, for the debugger's variable view.
    pub fn current_position(&self) -> Option<(&str, usize)> {
        self.frames.last().map(|f| (f.function.as_str(), f.pc))
    }

    /// Rebuild VM state from a replay seek.
    pub fn restore(&mut self, state: &RestoredState) {
        self.frames = state.frames.iter().map(frame_from_snapshot).collect();
        self.globals = state
            .globals
            .iter()
            .map(|(k, v)| (k.clone(), v.deep_copy()))
            .collect();
        self.rng_state = state.rng_state;
    }

    fn push_entry_frame(&mut self) -> Result<(), VmError> {
        let entry = self.program.entry_point as usize;
        if entry >= self.program.code.len() {
            return Err(VmError::BadEntryPoint { pc: entry, len: self.program.code.len() });
        }
        let name = self
            .program
            .functions
            .iter()
            .find(|(_, info)| info.start_pc as usize <= entry && entry <= info.end_pc as usize)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| "<entry>".to_string());
        let mut frame = Frame::new(&name);
        frame.pc = entry;
        if let Some(dbg) = self.debugger.as_mut() {
            dbg.push_stack_frame(&name, false);
        }
        if self.recorder.is_some() {
            let snap = frame_snapshot(&frame, &self.program);
            if let Some(rec) = self.recorder.as_mut() {
                rec.on_frame_push(snap);
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    // ── Register and global plumbing ─────────────────────────────────────

    #[inline]
    fn reg(&self, r: u8) -> &Value {
        &self.frames.last().expect("active frame").registers[r as usize]
    }

    #[inline]
    fn reg_cloned(&self, r: u8) -> Value {
        self.reg(r).clone()
    }

    fn write_reg(&mut self, r: u8, val: Value) {
        let frame_idx = self.frames.len() - 1;
        if let Some(rec) = self.recorder.as_mut() {
            let old = self.frames[frame_idx].registers[r as usize].clone();
            rec.on_reg_write(frame_idx, r, old, val.clone());
        }
        self.frames[frame_idx].registers[r as usize] = val;
    }

    fn write_global(&mut self, name: &str, val: Value) {
        if let Some(rec) = self.recorder.as_mut() {
            let old = self.globals.get(name).cloned().unwrap_or(Value::Nil);
            rec.on_global_write(name, old, val.clone());
        }
        self.globals.insert(name.to_string(), val);
    }

    #[inline]
    fn jump(&mut self, offset: i16) {
        let frame = self.frames.last_mut().expect("active frame");
        let old = frame.pc;
        frame.pc = (frame.pc as i64 + offset as i64) as usize;
        let new = frame.pc;
        if let Some(rec) = self.recorder.as_mut() {
            rec.on_pc_jump(old, new);
        }
    }

    #[inline]
    fn skip_next(&mut self) {
        self.frames.last_mut().expect("active frame").pc += 1;
    }

    fn global_name(&self, bx: u16) -> Option<String> {
        match self.program.constants.get(bx) {
            Value::Str(name) => Some(name),
            _ => None,
        }
    }

    fn next_rand(&mut self) -> f64 {
        let old = self.rng_state;
        let mut x = self.rng_state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.rng_state = x;
        if let Some(rec) = self.recorder.as_mut() {
            rec.on_rng_change(old, x);
        }
        let bits = x.wrapping_mul(0x2545_F491_4F6C_DD1D);
        (bits >> 11) as f64 / (1u64 << 53) as f64
    }

    fn fatal(&mut self, err: VmError) -> ExecStatus {
        eprintln!("etch: fatal: {}", err);
        self.out.flush();
        let code = err.exit_code();
        self.last_error = Some(err);
        ExecStatus::Fatal(code)
    }

    /// Pop the current frame, landing `ret` in the caller. Popping the last
    /// frame ends the program normally; popping with no frame at all is an
    /// underflow, which the dispatch loop turns into a fatal status rather
    /// than a clean exit.
    fn pop_frame_with(&mut self, ret: Value) -> FramePop {
        let popped = match self.frames.pop() {
            Some(f) => f,
            None => return FramePop::Underflow,
        };
        if self.recorder.is_some() {
            let snap = frame_snapshot(&popped, &self.program);
            if let Some(rec) = self.recorder.as_mut() {
                rec.on_frame_pop(snap);
            }
        }
        if let Some(dbg) = self.debugger.as_mut() {
            dbg.pop_stack_frame();
        }
        if self.frames.is_empty() {
            self.out.flush();
            return FramePop::Finished;
        }
        self.frames.last_mut().expect("caller frame").pc = popped.return_pc;
        if popped.nres != 0 {
            self.write_reg(popped.result_reg, ret);
        }
        FramePop::Continued
    }

    // ── Main loop ────────────────────────────────────────────────────────

    pub fn execute(&mut self) -> ExecStatus {
        if self.frames.is_empty() {
            if let Err(e) = self.push_entry_frame() {
                return self.fatal(e);
            }
        }
        let program = Arc::clone(&self.program);

        loop {
            let pc = match self.frames.last() {
                Some(frame) => frame.pc,
                None => {
                    self.out.flush();
                    return ExecStatus::Done;
                }
            };
            if pc >= program.code.len() {
                // Fell off the stream without Return: implicit nil return.
                match self.pop_frame_with(Value::Nil) {
                    FramePop::Continued => continue,
                    FramePop::Finished => {
                        self.out.flush();
                        return ExecStatus::Done;
                    }
                    FramePop::Underflow => {
                        return self.fatal(VmError::FrameStackUnderflow);
                    }
                }
            }

            let instr = &program.code[pc];
            let (file, line) = match &instr.debug {
                Some(d) => (d.source_file.as_str(), d.line),
                None => ("", 0),
            };

            if let Some(dbg) = self.debugger.as_mut() {
                if dbg.should_break(pc, file, line) {
                    self.out.flush();
                    return ExecStatus::Paused;
                }
            }

            if self.recorder.is_some() {
                let frames = &self.frames;
                let globals = &self.globals;
                let rng = self.rng_state;
                let prog = &program;
                if let Some(rec) = self.recorder.as_mut() {
                    rec.on_instruction(pc, file, line, || {
                        (
                            frames.iter().map(|f| frame_snapshot(f, prog)).collect(),
                            globals.iter().map(|(k, v)| (k.clone(), v.deep_copy())).collect(),
                            rng,
                        )
                    });
                }
            }

            self.stats.record(instr.op);
            if self.trace {
                eprintln!("[trace] {:5}  {}", pc, instr);
            }

            self.frames.last_mut().expect("active frame").pc = pc + 1;

            match instr.op {
                // ── Moves / loads ────────────────────────────────────────
                Op::Move => {
                    let v = self.reg_cloned(instr.b());
                    self.write_reg(instr.a, v);
                }
                Op::LoadK => {
                    let v = match instr.operands {
                        Operands::AsBx { sbx } => Value::Int(sbx as i64),
                        Operands::ABx { bx } => program.constants.get(bx),
                        _ => Value::Nil,
                    };
                    self.write_reg(instr.a, v);
                }
                Op::LoadNil => self.write_reg(instr.a, Value::Nil),

                // ── Globals ──────────────────────────────────────────────
                Op::GetGlobal => {
                    let v = self
                        .global_name(instr.bx())
                        .and_then(|name| self.globals.get(&name).cloned())
                        .unwrap_or(Value::Nil);
                    self.write_reg(instr.a, v);
                }
                Op::SetGlobal => {
                    if let Some(name) = self.global_name(instr.bx()) {
                        let v = self.reg_cloned(instr.a);
                        self.write_global(&name, v);
                    }
                }

                // ── Arithmetic ───────────────────────────────────────────
                Op::Add => {
                    let v = arith_add(self.reg(instr.b()), self.reg(instr.c()));
                    self.write_reg(instr.a, v);
                }
                Op::Sub => {
                    let v = arith_sub(self.reg(instr.b()), self.reg(instr.c()));
                    self.write_reg(instr.a, v);
                }
                Op::Mul => {
                    let v = arith_mul(self.reg(instr.b()), self.reg(instr.c()));
                    self.write_reg(instr.a, v);
                }
                Op::Div => match arith_div(self.reg(instr.b()), self.reg(instr.c())) {
                    Some(v) => self.write_reg(instr.a, v),
                    None => return self.fatal(VmError::DivisionByZero { pc, line }),
                },
                Op::Mod => match arith_mod(self.reg(instr.b()), self.reg(instr.c())) {
                    Some(v) => self.write_reg(instr.a, v),
                    None => return self.fatal(VmError::DivisionByZero { pc, line }),
                },
                Op::Pow => {
                    let v = arith_pow(self.reg(instr.b()), self.reg(instr.c()));
                    self.write_reg(instr.a, v);
                }
                Op::AddI | Op::SubI | Op::MulI => {
                    let imm = instr.c() as i8 as i64;
                    let v = match (instr.op, self.reg(instr.b())) {
                        (Op::AddI, Value::Int(n)) => Value::Int(n.wrapping_add(imm)),
                        (Op::SubI, Value::Int(n)) => Value::Int(n.wrapping_sub(imm)),
                        (Op::MulI, Value::Int(n)) => Value::Int(n.wrapping_mul(imm)),
                        _ => Value::Nil,
                    };
                    self.write_reg(instr.a, v);
                }
                Op::Neg => {
                    let v = arith_neg(self.reg(instr.b()));
                    self.write_reg(instr.a, v);
                }
                Op::Not => {
                    let v = Value::Bool(!self.reg(instr.b()).is_truthy());
                    self.write_reg(instr.a, v);
                }

                // ── Comparisons, skip-next form ──────────────────────────
                Op::Eq => {
                    let computed = self.reg(instr.b()) == self.reg(instr.c());
                    if computed != (instr.a != 0) {
                        self.skip_next();
                    }
                }
                Op::Lt => {
                    let computed = cmp_lt(self.reg(instr.b()), self.reg(instr.c())).unwrap_or(false);
                    if computed != (instr.a != 0) {
                        self.skip_next();
                    }
                }
                Op::Le => {
                    let computed = cmp_le(self.reg(instr.b()), self.reg(instr.c())).unwrap_or(false);
                    if computed != (instr.a != 0) {
                        self.skip_next();
                    }
                }

                // ── Comparisons, store form ──────────────────────────────
                Op::EqStore => {
                    let v = Value::Bool(self.reg(instr.b()) == self.reg(instr.c()));
                    self.write_reg(instr.a, v);
                }
                Op::NeStore => {
                    let v = Value::Bool(self.reg(instr.b()) != self.reg(instr.c()));
                    self.write_reg(instr.a, v);
                }
                Op::LtStore => {
                    let v = cmp_lt(self.reg(instr.b()), self.reg(instr.c()))
                        .map(Value::Bool)
                        .unwrap_or(Value::Nil);
                    self.write_reg(instr.a, v);
                }
                Op::LeStore => {
                    let v = cmp_le(self.reg(instr.b()), self.reg(instr.c()))
                        .map(Value::Bool)
                        .unwrap_or(Value::Nil);
                    self.write_reg(instr.a, v);
                }

                // ── Logic ────────────────────────────────────────────────
                Op::And => {
                    let l = self.reg_cloned(instr.b());
                    let v = if l.is_truthy() { self.reg_cloned(instr.c()) } else { l };
                    self.write_reg(instr.a, v);
                }
                Op::Or => {
                    let l = self.reg_cloned(instr.b());
                    let v = if l.is_truthy() { l } else { self.reg_cloned(instr.c()) };
                    self.write_reg(instr.a, v);
                }

                // ── Membership ───────────────────────────────────────────
                Op::In => {
                    let v = Value::Bool(contains(self.reg(instr.c()), self.reg(instr.b())));
                    self.write_reg(instr.a, v);
                }
                Op::NotIn => {
                    let v = Value::Bool(!contains(self.reg(instr.c()), self.reg(instr.b())));
                    self.write_reg(instr.a, v);
                }

                // ── Wrapping ─────────────────────────────────────────────
                Op::WrapSome => {
                    let v = Value::some(self.reg_cloned(instr.b()));
                    self.write_reg(instr.a, v);
                }
                Op::WrapOk => {
                    let v = Value::ok(self.reg_cloned(instr.b()));
                    self.write_reg(instr.a, v);
                }
                Op::WrapErr => {
                    let v = Value::err(self.reg_cloned(instr.b()));
                    self.write_reg(instr.a, v);
                }
                Op::UnwrapOption => {
                    let v = self.reg_cloned(instr.b()).unwrap_option();
                    self.write_reg(instr.a, v);
                }
                Op::UnwrapResult => {
                    let v = self.reg_cloned(instr.b()).unwrap_result();
                    self.write_reg(instr.a, v);
                }
                Op::TestTag => {
                    if self.reg(instr.a).tag() as u8 == instr.b() {
                        self.skip_next();
                    }
                }

                // ── Containers ───────────────────────────────────────────
                Op::NewArray => {
                    let base = instr.b();
                    let count = instr.c();
                    let items: Vec<Value> =
                        (0..count).map(|i| self.reg_cloned(base + i)).collect();
                    self.write_reg(instr.a, Value::array(items));
                }
                Op::NewTable => {
                    self.write_reg(instr.a, Value::table(HashMap::new()));
                }
                Op::ArrayPush => {
                    self.mutate_container(instr.a, |container, item| {
                        if let Value::Array(items) = container {
                            items.lock().push(item);
                        }
                    }, self.reg_cloned(instr.b()));
                }
                Op::GetIndex => {
                    let v = index_get(self.reg(instr.b()), self.reg(instr.c()));
                    self.write_reg(instr.a, v);
                }
                Op::SetIndex => {
                    self.mutate_container(instr.a, |container, (index, val)| {
                        index_set(container, &index, val);
                    }, (self.reg_cloned(instr.b()), self.reg_cloned(instr.c())));
                }
                Op::GetIndexI => {
                    let v = index_get(self.reg(instr.b()), &Value::Int(instr.c() as i64));
                    self.write_reg(instr.a, v);
                }
                Op::SetIndexI => {
                    let idx = Value::Int(instr.b() as i64);
                    self.mutate_container(instr.a, |container, (index, val)| {
                        index_set(container, &index, val);
                    }, (idx, self.reg_cloned(instr.c())));
                }
                Op::Len => {
                    let v = length(self.reg(instr.b()));
                    self.write_reg(instr.a, v);
                }
                Op::Slice => {
                    let v = match (self.reg(instr.c()), self.reg(instr.c().wrapping_add(1))) {
                        (Value::Int(start), Value::Int(end)) => {
                            slice(self.reg(instr.b()), *start, *end)
                        }
                        _ => Value::Nil,
                    };
                    self.write_reg(instr.a, v);
                }

                // ── Control flow ─────────────────────────────────────────
                Op::Jmp => self.jump(instr.sbx()),
                Op::Test => {
                    if self.reg(instr.a).is_truthy() != (instr.c() != 0) {
                        self.skip_next();
                    }
                }
                Op::TestSet => {
                    if self.reg(instr.b()).is_truthy() == (instr.c() != 0) {
                        let v = self.reg_cloned(instr.b());
                        self.write_reg(instr.a, v);
                    } else {
                        self.skip_next();
                    }
                }

                // ── Calls ────────────────────────────────────────────────
                Op::Call => {
                    if let Some(status) = self.do_call(instr, pc, false) {
                        return status;
                    }
                }
                Op::TailCall => {
                    if let Some(status) = self.do_call(instr, pc, true) {
                        return status;
                    }
                }
                Op::Return => {
                    let ret = if instr.b() != 0 { self.reg_cloned(instr.a) } else { Value::Nil };
                    match self.pop_frame_with(ret) {
                        FramePop::Continued => {}
                        FramePop::Finished => return ExecStatus::Done,
                        FramePop::Underflow => {
                            return self.fatal(VmError::FrameStackUnderflow);
                        }
                    }
                }

                // ── Numeric for-loop ─────────────────────────────────────
                Op::ForPrep => {
                    let runs = cmp_lt(self.reg(instr.a), self.reg(instr.a + 1)).unwrap_or(false);
                    if !runs {
                        self.jump(instr.sbx());
                    }
                }
                Op::ForLoop => {
                    let next = arith_add(self.reg(instr.a), self.reg(instr.a + 2));
                    let continues = cmp_lt(&next, self.reg(instr.a + 1)).unwrap_or(false);
                    self.write_reg(instr.a, next);
                    if continues {
                        self.jump(instr.sbx());
                    }
                }

                // ── Defer ────────────────────────────────────────────────
                Op::PushDefer => {
                    let frame = self.frames.last_mut().expect("active frame");
                    let body = (frame.pc as i64 + instr.sbx() as i64) as usize;
                    frame.defers.push(body);
                }
                Op::ExecDefers => {
                    let frame = self.frames.last_mut().expect("active frame");
                    if let Some(body) = frame.defers.pop() {
                        // Re-enter this ExecDefers after DeferEnd so the
                        // next pending body pops, LIFO until drained.
                        frame.defer_return_pc = pc;
                        frame.pc = body;
                    }
                }
                Op::DeferEnd => {
                    let frame = self.frames.last_mut().expect("active frame");
                    frame.pc = frame.defer_return_pc;
                }

                // ── Fused forms ──────────────────────────────────────────
                Op::AddAdd => {
                    let (x, y, z) = instr.ax_regs();
                    let partial = arith_add(self.reg(x), self.reg(y));
                    let v = arith_add(&partial, self.reg(z));
                    self.write_reg(instr.a, v);
                }
                Op::MulAdd => {
                    let (x, y, z) = instr.ax_regs();
                    let partial = arith_mul(self.reg(x), self.reg(y));
                    let v = arith_add(&partial, self.reg(z));
                    self.write_reg(instr.a, v);
                }
                Op::CmpJmp => {
                    if !self.reg(instr.a).is_truthy() {
                        self.jump(instr.sbx());
                    }
                }
                Op::IncTest => {
                    let v = match self.reg(instr.a) {
                        Value::Int(n) => Value::Int(n.wrapping_add(1)),
                        _ => Value::Nil,
                    };
                    self.write_reg(instr.a, v);
                    self.jump(instr.sbx());
                }

                // ── Misc ─────────────────────────────────────────────────
                Op::Nop => {}
                Op::Halt => {
                    self.out.flush();
                    return ExecStatus::Done;
                }
            }
        }
    }

    /// In-place container mutation, bracketed with deep copies for the
    /// recorder so replay sees the change as a register write.
    fn mutate_container<T>(&mut self, reg: u8, mutate: impl FnOnce(&Value, T), payload: T) {
        let frame_idx = self.frames.len() - 1;
        let old = if self.recorder.is_some() {
            Some(self.frames[frame_idx].registers[reg as usize].deep_copy())
        } else {
            None
        };
        mutate(&self.frames[frame_idx].registers[reg as usize], payload);
        if let Some(old) = old {
            let new = self.frames[frame_idx].registers[reg as usize].deep_copy();
            if let Some(rec) = self.recorder.as_mut() {
                rec.on_reg_write(frame_idx, reg, old, new);
            }
        }
    }

    /// Call dispatch: user function (frame push / frame replace for tail
    /// calls), then CFFI registry, then builtins. Unknown names log a
    /// diagnostic and yield Nil.
    fn do_call(&mut self, instr: &Instr, pc: usize, tail: bool) -> Option<ExecStatus> {
        let Operands::Call { func, nargs, nres } = instr.operands else {
            return None;
        };
        let a = instr.a;
        let name = match self.program.function_table.get(func as usize) {
            Some(name) => name.clone(),
            None => {
                eprintln!("etch: unknown function index {} at pc {}", func, pc);
                self.write_reg(a, Value::Nil);
                return None;
            }
        };

        if let Some(info) = self.program.functions.get(&name) {
            if self.frames.len() >= MAX_CALL_DEPTH {
                return Some(self.fatal(VmError::StackOverflow { depth: self.frames.len() }));
            }
            let caller = self.frames.last().expect("active frame");
            let mut callee = Frame::new(&name);
            for i in 0..nargs {
                callee.registers[i as usize] =
                    caller.registers[(a + 1 + i) as usize].clone();
            }
            callee.pc = info.start_pc as usize;
            if tail {
                // Reuse the frame slot; the original caller's return
                // plumbing survives the replacement.
                callee.return_pc = caller.return_pc;
                callee.result_reg = caller.result_reg;
                callee.nres = caller.nres;
                if self.recorder.is_some() {
                    let old_snap = frame_snapshot(caller, &self.program);
                    let new_snap = frame_snapshot(&callee, &self.program);
                    if let Some(rec) = self.recorder.as_mut() {
                        rec.on_frame_pop(old_snap);
                        rec.on_frame_push(new_snap);
                    }
                }
                if let Some(dbg) = self.debugger.as_mut() {
                    dbg.pop_stack_frame();
                    dbg.push_stack_frame(&name, false);
                }
                *self.frames.last_mut().expect("active frame") = callee;
            } else {
                callee.return_pc = caller.pc;
                callee.result_reg = a;
                callee.nres = nres;
                if self.recorder.is_some() {
                    let snap = frame_snapshot(&callee, &self.program);
                    if let Some(rec) = self.recorder.as_mut() {
                        rec.on_frame_push(snap);
                    }
                }
                if let Some(dbg) = self.debugger.as_mut() {
                    dbg.push_stack_frame(&name, false);
                }
                self.frames.push(callee);
            }
            return None;
        }

        // Foreign and builtin calls never push a VM frame; the debugger
        // mirror still sees them, flagged.
        let args: Vec<Value> = {
            let caller = self.frames.last().expect("active frame");
            (0..nargs).map(|i| caller.registers[(a + 1 + i) as usize].clone()).collect()
        };
        if let Some(dbg) = self.debugger.as_mut() {
            dbg.push_stack_frame(&name, true);
        }
        let result = if self.program.cffi.contains_key(&name) {
            match self.registry.invoke(&name, &args) {
                Some(v) => v,
                None => {
                    eprintln!("etch: foreign call '{}' failed at pc {}", name, pc);
                    Value::Nil
                }
            }
        } else {
            self.call_builtin(&name, &args, pc)
        };
        if let Some(dbg) = self.debugger.as_mut() {
            dbg.pop_stack_frame();
        }

        if tail {
            match self.pop_frame_with(result) {
                FramePop::Continued => {}
                FramePop::Finished => return Some(ExecStatus::Done),
                FramePop::Underflow => {
                    return Some(self.fatal(VmError::FrameStackUnderflow));
                }
            }
        } else {
            self.write_reg(a, result);
        }
        None
    }

    fn call_builtin(&mut self, name: &str, args: &[Value], pc: usize) -> Value {
        match name {
            "print" => {
                let line = args.first().map(|v| v.display()).unwrap_or_else(|| "nil".into());
                self.out.push_line(&line);
                Value::Nil
            }
            "rand" => Value::Float(self.next_rand()),
            "seed" => {
                match args.first() {
                    Some(Value::Int(n)) => {
                        let old = self.rng_state;
                        self.set_seed(*n as u64);
                        let new = self.rng_state;
                        if let Some(rec) = self.recorder.as_mut() {
                            rec.on_rng_change(old, new);
                        }
                    }
                    _ => {}
                }
                Value::Nil
            }
            other => match intrinsics::lookup(other) {
                Some(f) => f(args),
                None => {
                    eprintln!("etch: unknown function '{}' at pc {}", other, pc);
                    Value::Nil
                }
            },
        }
    }
}
