/// Debugger hook.
///
/// The executor asks `should_break(pc, file, line)` before every
/// instruction. The answer is yes when the debugger is paused, when a
/// breakpoint sits on that source line, or when a step condition holds:
///
///   StepOver — next line transition at or above the recorded depth
///   StepInto — any next line transition
///   StepOut  — depth drops below the recorded depth
///
/// Line transitions compare against the position of the previous break,
/// which only updates when a break actually happens. Call depth is fed by
/// push/pop hooks at Call and Return; builtin and foreign frames are
/// mirrored but flagged so they never count toward user depth.
///
/// The stack mirror and variable views are plain serializable data — the
/// DAP transport that ships them over the wire lives outside the core.

use std::collections::HashSet;

use colored::Colorize;
use serde::Serialize;

use crate::bytecode::Program;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    None,
    Over,
    Into,
    Out,
}

/// One mirrored call frame, outermost first.
#[derive(Debug, Clone, Serialize)]
pub struct DebugFrame {
    pub function: String,
    pub is_builtin: bool,
}

/// One visible variable, formatted for display.
#[derive(Debug, Clone, Serialize)]
pub struct VarDisplay {
    pub name: String,
    pub register: u8,
    pub value: String,
    pub initialized: bool,
}

pub struct Debugger {
    breakpoints: HashSet<(String, u32)>,
    paused: bool,
    step: StepMode,
    step_depth: usize,
    user_call_depth: usize,
    /// Position of the previous actual break.
    last_file: String,
    last_line: u32,
    /// Position of the previous `should_break` query, updated every check;
    /// lets breakpoints fire on line entry instead of once per instruction.
    checked_file: String,
    checked_line: u32,
    frames: Vec<DebugFrame>,
    /// Print a banner to stderr on each break.
    pub announce: bool,
}

impl Debugger {
    pub fn new() -> Debugger {
        Debugger {
            breakpoints: HashSet::new(),
            paused: false,
            step: StepMode::None,
            step_depth: 0,
            user_call_depth: 0,
            last_file: String::new(),
            last_line: 0,
            checked_file: String::new(),
            checked_line: 0,
            frames: Vec::new(),
            announce: false,
        }
    }

    // ── Breakpoints ──────────────────────────────────────────────────────

    pub fn add_breakpoint(&mut self, file: &str, line: u32) {
        self.breakpoints.insert((file.to_string(), line));
    }

    pub fn remove_breakpoint(&mut self, file: &str, line: u32) {
        self.breakpoints.remove(&(file.to_string(), line));
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    // ── Pause / resume / step ────────────────────────────────────────────

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.step = StepMode::None;
    }

    pub fn step_over(&mut self) {
        self.paused = false;
        self.step = StepMode::Over;
        self.step_depth = self.user_call_depth;
    }

    pub fn step_into(&mut self) {
        self.paused = false;
        self.step = StepMode::Into;
    }

    pub fn step_out(&mut self) {
        self.paused = false;
        self.step = StepMode::Out;
        self.step_depth = self.user_call_depth;
    }

    // ── Executor hooks ───────────────────────────────────────────────────

    pub fn push_stack_frame(&mut self, function: &str, is_builtin: bool) {
        self.frames.push(DebugFrame { function: function.to_string(), is_builtin });
        if !is_builtin {
            self.user_call_depth += 1;
        }
    }

    pub fn pop_stack_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            if !frame.is_builtin {
                self.user_call_depth = self.user_call_depth.saturating_sub(1);
            }
        }
    }

    pub fn stack_mirror(&self) -> &[DebugFrame] {
        &self.frames
    }

    pub fn user_call_depth(&self) -> usize {
        self.user_call_depth
    }

    /// Queried before each instruction. A yes pauses the machine; the
    /// executor then returns the paused sentinel to the embedder.
    pub fn should_break(&mut self, pc: usize, file: &str, line: u32) -> bool {
        if self.paused {
            // A pause is an actual break: anchor the step machinery here.
            if line != 0 {
                self.last_file = file.to_string();
                self.last_line = line;
                self.checked_file = file.to_string();
                self.checked_line = line;
            }
            return true;
        }
        if line == 0 {
            // No debug record; release-built instruction.
            return false;
        }
        let entered_line = file != self.checked_file || line != self.checked_line;
        self.checked_file.clear();
        self.checked_file.push_str(file);
        self.checked_line = line;

        let line_transition = file != self.last_file || line != self.last_line;
        let hit = (entered_line && self.breakpoints.contains(&(file.to_string(), line)))
            || match self.step {
                StepMode::Over => line_transition && self.user_call_depth <= self.step_depth,
                StepMode::Into => line_transition,
                StepMode::Out => self.user_call_depth < self.step_depth,
                StepMode::None => false,
            };
        if hit {
            self.paused = true;
            self.step = StepMode::None;
            self.last_file = file.to_string();
            self.last_line = line;
            if self.announce {
                eprintln!(
                    "{} {}:{} (pc {})",
                    "break".red().bold(),
                    file,
                    line,
                    pc
                );
            }
        }
        hit
    }

    /// Variables in scope at `pc` of `function`, formatted from the live
    /// register file through the lifetime tracker.
    pub fn variables(
        &self,
        program: &Program,
        function: &str,
        pc: usize,
        registers: &[Value],
    ) -> Vec<VarDisplay> {
        let Some(lifetimes) = program.lifetimes.get(function) else {
            return Vec::new();
        };
        lifetimes
            .variables_at(pc as i64)
            .into_iter()
            .map(|v| {
                let value = if v.initialized {
                    registers
                        .get(v.register as usize)
                        .map(|val| val.display())
                        .unwrap_or_else(|| "nil".to_string())
                } else {
                    "<uninitialized>".to_string()
                };
                VarDisplay {
                    name: v.name,
                    register: v.register,
                    value,
                    initialized: v.initialized,
                }
            })
            .collect()
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Debugger::new()
    }
}
