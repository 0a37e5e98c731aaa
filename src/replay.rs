/// Instruction-granularity recording and replay ("scrubbing").
///
/// The recorder captures a full snapshot every N statements and a delta for
/// every state mutation in between. Seeking to statement T restores the
/// latest snapshot at or before T, then replays the deltas in
/// `[snapshot, T)` — cost bounded by the snapshot interval, independent of
/// how far back T lies.
///
/// A statement is one source-line transition, detected exactly the way the
/// debugger detects them. Mutating state mid-replay branches the timeline:
/// everything after the cursor is discarded and recording resumes there.

use std::collections::HashMap;
use std::time::Instant;

use crate::errors::LoadError;
use crate::serializer::{put_str, put_u32, put_value, read_value, Reader};
use crate::value::Value;

pub const REPLAY_MAGIC: &[u8] = b"ETCH_REPLAY";
pub const REPLAY_VERSION: u32 = 2;

pub const DEFAULT_SNAPSHOT_INTERVAL: usize = 50;

// ---------------------------------------------------------------------------
// Recorded state shapes
// ---------------------------------------------------------------------------

/// A frame as the recorder sees it: registers deep-copied, metadata enough
/// to rebuild the executor's frame exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    pub function: String,
    pub pc: usize,
    pub registers: Vec<Value>,
    pub result_reg: u8,
    pub nres: u8,
    pub return_pc: usize,
    pub defers: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    RegWrite { frame_idx: usize, reg: u8, old: Value, new: Value },
    GlobalWrite { name: String, old: Value, new: Value },
    FramePush { frame: FrameSnapshot },
    FramePop { frame: FrameSnapshot },
    RngChange { old: u64, new: u64 },
    PcJump { old: usize, new: usize },
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub statement_index: usize,
    /// Count of instructions dispatched when the snapshot was taken.
    pub instr_index: u64,
    pub pc: usize,
    pub line: u32,
    /// Seconds since recording started.
    pub timestamp: f64,
    pub frames: Vec<FrameSnapshot>,
    pub globals: HashMap<String, Value>,
    pub rng_state: u64,
    /// Length of the delta log at snapshot time.
    pub delta_pos: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct StatementRecord {
    pub pc: usize,
    pub line: u32,
    pub instr_index: u64,
    /// Length of the delta log when this statement began.
    pub delta_start: usize,
}

/// Full VM state reconstructed by a seek.
#[derive(Debug, Clone)]
pub struct RestoredState {
    pub statement_index: usize,
    pub pc: usize,
    pub line: u32,
    pub frames: Vec<FrameSnapshot>,
    pub globals: HashMap<String, Value>,
    pub rng_state: u64,
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

pub struct Recorder {
    interval: usize,
    statements: Vec<StatementRecord>,
    snapshots: Vec<Snapshot>,
    deltas: Vec<Delta>,
    /// pc → indices into the delta log, for tooling that walks mutations
    /// caused by a particular instruction.
    pc_index: HashMap<usize, Vec<usize>>,
    current_pc: usize,
    last_file: String,
    last_line: u32,
    instr_count: u64,
    started: Instant,
    source_file: String,
}

impl Recorder {
    pub fn new(source_file: &str, interval: usize) -> Recorder {
        Recorder {
            interval: interval.max(1),
            statements: Vec::new(),
            snapshots: Vec::new(),
            deltas: Vec::new(),
            pc_index: HashMap::new(),
            current_pc: 0,
            last_file: String::new(),
            last_line: 0,
            instr_count: 0,
            started: Instant::now(),
            source_file: source_file.to_string(),
        }
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn delta_count(&self) -> usize {
        self.deltas.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn deltas_at_pc(&self, pc: usize) -> &[usize] {
        self.pc_index.get(&pc).map(Vec::as_slice).unwrap_or(&[])
    }

    // ── Executor hooks ───────────────────────────────────────────────────

    /// Called before each instruction dispatch. Detects statement
    /// boundaries by line transition and takes periodic snapshots; the
    /// capture closure materializes (frames, globals, rng) only when a
    /// snapshot is actually due.
    pub fn on_instruction<F>(&mut self, pc: usize, file: &str, line: u32, capture: F)
    where
        F: FnOnce() -> (Vec<FrameSnapshot>, HashMap<String, Value>, u64),
    {
        self.current_pc = pc;
        self.instr_count += 1;
        if line == 0 {
            return;
        }
        if file == self.last_file && line == self.last_line {
            return;
        }
        self.last_file.clear();
        self.last_file.push_str(file);
        self.last_line = line;

        let stmt = StatementRecord {
            pc,
            line,
            instr_index: self.instr_count,
            delta_start: self.deltas.len(),
        };
        if self.statements.len() % self.interval == 0 {
            let (frames, globals, rng_state) = capture();
            self.snapshots.push(Snapshot {
                statement_index: self.statements.len(),
                instr_index: self.instr_count,
                pc,
                line,
                timestamp: self.started.elapsed().as_secs_f64(),
                frames,
                globals,
                rng_state,
                delta_pos: self.deltas.len(),
            });
        }
        self.statements.push(stmt);
    }

    fn push_delta(&mut self, delta: Delta) {
        self.pc_index.entry(self.current_pc).or_default().push(self.deltas.len());
        self.deltas.push(delta);
    }

    pub fn on_reg_write(&mut self, frame_idx: usize, reg: u8, old: Value, new: Value) {
        self.push_delta(Delta::RegWrite { frame_idx, reg, old, new });
    }

    pub fn on_global_write(&mut self, name: &str, old: Value, new: Value) {
        self.push_delta(Delta::GlobalWrite { name: name.to_string(), old, new });
    }

    pub fn on_frame_push(&mut self, frame: FrameSnapshot) {
        self.push_delta(Delta::FramePush { frame });
    }

    pub fn on_frame_pop(&mut self, frame: FrameSnapshot) {
        self.push_delta(Delta::FramePop { frame });
    }

    pub fn on_rng_change(&mut self, old: u64, new: u64) {
        self.push_delta(Delta::RngChange { old, new });
    }

    pub fn on_pc_jump(&mut self, old: usize, new: usize) {
        self.push_delta(Delta::PcJump { old, new });
    }

    // ── Seeking ──────────────────────────────────────────────────────────

    /// Rebuild the VM state as it was when statement `target` began.
    pub fn seek(&self, target: usize) -> Option<RestoredState> {
        let stmt = self.statements.get(target)?;
        let snapshot = self
            .snapshots
            .iter()
            .rev()
            .find(|s| s.statement_index <= target)?;

        let mut frames: Vec<FrameSnapshot> = snapshot
            .frames
            .iter()
            .map(deep_copy_frame)
            .collect();
        let mut globals: HashMap<String, Value> = snapshot
            .globals
            .iter()
            .map(|(k, v)| (k.clone(), v.deep_copy()))
            .collect();
        let mut rng_state = snapshot.rng_state;

        for delta in &self.deltas[snapshot.delta_pos..stmt.delta_start] {
            apply_delta(delta, &mut frames, &mut globals, &mut rng_state);
        }
        if let Some(top) = frames.last_mut() {
            top.pc = stmt.pc;
        }
        Some(RestoredState {
            statement_index: target,
            pc: stmt.pc,
            line: stmt.line,
            frames,
            globals,
            rng_state,
        })
    }

    /// Branch-on-modify: discard everything recorded after statement
    /// `cursor` and resume recording from there. The post-cursor future is
    /// gone for good.
    pub fn branch_at(&mut self, cursor: usize) {
        let Some(stmt) = self.statements.get(cursor).copied() else { return };
        self.deltas.truncate(stmt.delta_start);
        self.statements.truncate(cursor + 1);
        self.snapshots.retain(|s| s.statement_index <= cursor && s.delta_pos <= stmt.delta_start);
        self.instr_count = stmt.instr_index;
        self.last_line = stmt.line;
        // Reindex the delta multimap against the truncated log.
        let kept = self.deltas.len();
        self.pc_index.retain(|_, indices| {
            indices.retain(|&i| i < kept);
            !indices.is_empty()
        });
    }

    // ── Replay file ──────────────────────────────────────────────────────

    /// Write the session header and snapshots. Registers are simplified to
    /// primitive variants on disk; containers and wrappers collapse to nil.
    pub fn serialize_session(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(REPLAY_MAGIC);
        put_u32(&mut out, REPLAY_VERSION);
        put_str(&mut out, &self.source_file);
        put_u32(&mut out, self.statements.len() as u32);
        put_u32(&mut out, self.interval as u32);
        out.extend_from_slice(&self.started.elapsed().as_secs_f64().to_le_bytes());

        put_u32(&mut out, self.snapshots.len() as u32);
        for snap in &self.snapshots {
            put_u32(&mut out, snap.statement_index as u32);
            out.extend_from_slice(&snap.instr_index.to_le_bytes());
            put_u32(&mut out, snap.pc as u32);
            put_u32(&mut out, snap.line);
            out.extend_from_slice(&snap.timestamp.to_le_bytes());
            put_u32(&mut out, snap.frames.len() as u32);
            for frame in &snap.frames {
                put_str(&mut out, &frame.function);
                put_u32(&mut out, frame.pc as u32);
                put_u32(&mut out, frame.registers.len() as u32);
                for reg in &frame.registers {
                    put_value(&mut out, &simplify(reg));
                }
            }
            let mut names: Vec<&String> = snap.globals.keys().collect();
            names.sort();
            put_u32(&mut out, names.len() as u32);
            for name in names {
                put_str(&mut out, name);
                put_value(&mut out, &simplify(&snap.globals[name]));
            }
            out.extend_from_slice(&snap.rng_state.to_le_bytes());
        }
        out
    }
}

fn deep_copy_frame(f: &FrameSnapshot) -> FrameSnapshot {
    FrameSnapshot {
        function: f.function.clone(),
        pc: f.pc,
        registers: f.registers.iter().map(Value::deep_copy).collect(),
        result_reg: f.result_reg,
        nres: f.nres,
        return_pc: f.return_pc,
        defers: f.defers.clone(),
    }
}

fn apply_delta(
    delta: &Delta,
    frames: &mut Vec<FrameSnapshot>,
    globals: &mut HashMap<String, Value>,
    rng_state: &mut u64,
) {
    match delta {
        Delta::RegWrite { frame_idx, reg, new, .. } => {
            if let Some(frame) = frames.get_mut(*frame_idx) {
                if (*reg as usize) < frame.registers.len() {
                    frame.registers[*reg as usize] = new.deep_copy();
                }
            }
        }
        Delta::GlobalWrite { name, new, .. } => {
            globals.insert(name.clone(), new.deep_copy());
        }
        Delta::FramePush { frame } => frames.push(deep_copy_frame(frame)),
        Delta::FramePop { .. } => {
            frames.pop();
        }
        Delta::RngChange { new, .. } => *rng_state = *new,
        Delta::PcJump { new, .. } => {
            if let Some(top) = frames.last_mut() {
                top.pc = *new;
            }
        }
    }
}

fn simplify(v: &Value) -> Value {
    match v {
        Value::Int(_) | Value::Float(_) | Value::Bool(_) | Value::Char(_) | Value::Str(_)
        | Value::Nil => v.clone(),
        _ => Value::Nil,
    }
}

// ---------------------------------------------------------------------------
// Session loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub statement_index: usize,
    pub instr_index: u64,
    pub pc: usize,
    pub line: u32,
    pub timestamp: f64,
    pub frames: Vec<(String, usize, Vec<Value>)>,
    pub globals: HashMap<String, Value>,
    pub rng_state: u64,
}

#[derive(Debug, Clone)]
pub struct ReplaySession {
    pub source_file: String,
    pub total_statements: usize,
    pub snapshot_interval: usize,
    pub duration: f64,
    pub snapshots: Vec<SessionSnapshot>,
}

pub fn load_session(bytes: &[u8]) -> Result<ReplaySession, LoadError> {
    let mut r = Reader { data: bytes, pos: 0 };
    let magic = r.take(REPLAY_MAGIC.len(), "replay magic")?;
    if magic != REPLAY_MAGIC {
        return Err(LoadError::BadReplayMagic);
    }
    let version = r.u32("replay version")?;
    if version != REPLAY_VERSION {
        return Err(LoadError::WrongVersion { found: version, expected: REPLAY_VERSION });
    }
    let source_file = r.string("replay source file")?;
    let total_statements = r.u32("replay statement count")? as usize;
    let snapshot_interval = r.u32("replay snapshot interval")? as usize;
    let duration = r.f64("replay duration")?;

    let snap_count = r.u32("replay snapshot count")?;
    let mut snapshots = Vec::with_capacity(snap_count as usize);
    for _ in 0..snap_count {
        let statement_index = r.u32("snapshot statement index")? as usize;
        let instr_index = u64::from_le_bytes(
            r.take(8, "snapshot instruction index")?
                .try_into()
                .expect("length checked"),
        );
        let pc = r.u32("snapshot pc")? as usize;
        let line = r.u32("snapshot line")?;
        let timestamp = r.f64("snapshot timestamp")?;
        let frame_count = r.u32("snapshot frame count")?;
        let mut frames = Vec::with_capacity(frame_count as usize);
        for _ in 0..frame_count {
            let function = r.string("snapshot frame function")?;
            let fpc = r.u32("snapshot frame pc")? as usize;
            let reg_count = r.u32("snapshot register count")?;
            let mut registers = Vec::with_capacity(reg_count as usize);
            for _ in 0..reg_count {
                registers.push(read_value(&mut r)?);
            }
            frames.push((function, fpc, registers));
        }
        let global_count = r.u32("snapshot global count")?;
        let mut globals = HashMap::with_capacity(global_count as usize);
        for _ in 0..global_count {
            let name = r.string("snapshot global name")?;
            globals.insert(name, read_value(&mut r)?);
        }
        let rng_state =
            u64::from_le_bytes(r.take(8, "snapshot rng state")?.try_into().expect("length checked"));
        snapshots.push(SessionSnapshot {
            statement_index,
            instr_index,
            pc,
            line,
            timestamp,
            frames,
            globals,
            rng_state,
        });
    }

    Ok(ReplaySession { source_file, total_statements, snapshot_interval, duration, snapshots })
}
