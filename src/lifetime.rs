/// Variable lifetime tracking.
///
/// The compiler drives one tracker per function: declare at `let`, define
/// once the initializer has landed, touch on every read, close when the
/// scope exits. PCs are recorded with -1 sentinels until the corresponding
/// event happens. After compilation the tracker freezes into
/// `FunctionLifetimes`: the ranges themselves, a pc → active-variables
/// index, and the destructor points where scope exits release variables.
///
/// The debugger reads this to answer "which variables exist at PC p, and
/// which of them are initialized".

use std::collections::HashMap;

pub const PC_UNSET: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifetimeRange {
    pub name: String,
    pub register: u8,
    pub decl_pc: i64,
    pub def_pc: i64,
    pub last_use_pc: i64,
    pub end_pc: i64,
    pub scope_level: u32,
}

/// Frozen per-function lifetime data, owned by the Program and serialized
/// as a first-class field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionLifetimes {
    pub ranges: Vec<LifetimeRange>,
    pub pc_to_vars: HashMap<u32, Vec<String>>,
    pub destructor_points: HashMap<u32, Vec<String>>,
}

/// One variable visible at a PC, as reported to the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveVar {
    pub name: String,
    pub register: u8,
    /// False when `def_pc == pc`: the defining instruction has not executed.
    pub initialized: bool,
}

impl FunctionLifetimes {
    /// Variables defined at `pc`: ranges where decl_pc ≤ pc ≤ end_pc and the
    /// variable has a definition at or before pc.
    pub fn variables_at(&self, pc: i64) -> Vec<ActiveVar> {
        self.ranges
            .iter()
            .filter(|r| r.decl_pc <= pc && pc <= r.end_pc && r.def_pc != PC_UNSET && r.def_pc <= pc)
            .map(|r| ActiveVar {
                name: r.name.clone(),
                register: r.register,
                initialized: r.def_pc != pc,
            })
            .collect()
    }
}

struct Scope {
    level: u32,
    /// Indices into `ranges` for variables declared in this scope.
    members: Vec<usize>,
}

pub struct LifetimeTracker {
    ranges: Vec<LifetimeRange>,
    scopes: Vec<Scope>,
    destructor_points: HashMap<u32, Vec<String>>,
}

impl LifetimeTracker {
    pub fn new() -> LifetimeTracker {
        LifetimeTracker {
            ranges: Vec::new(),
            scopes: vec![Scope { level: 0, members: Vec::new() }],
            destructor_points: HashMap::new(),
        }
    }

    pub fn scope_level(&self) -> u32 {
        self.scopes.last().map(|s| s.level).unwrap_or(0)
    }

    pub fn enter_scope(&mut self) {
        let level = self.scope_level() + 1;
        self.scopes.push(Scope { level, members: Vec::new() });
    }

    /// Close every still-open range in the current scope at `pc` and record
    /// a destructor point naming them.
    pub fn exit_scope(&mut self, pc: usize) {
        let Some(scope) = self.scopes.pop() else { return };
        let mut released = Vec::new();
        for idx in scope.members {
            let range = &mut self.ranges[idx];
            if range.end_pc == PC_UNSET {
                range.end_pc = pc as i64;
                released.push(range.name.clone());
            }
        }
        if !released.is_empty() {
            self.destructor_points.entry(pc as u32).or_default().extend(released);
        }
    }

    pub fn declare(&mut self, name: &str, register: u8, pc: usize) {
        let level = self.scope_level();
        let idx = self.ranges.len();
        self.ranges.push(LifetimeRange {
            name: name.to_string(),
            register,
            decl_pc: pc as i64,
            def_pc: PC_UNSET,
            last_use_pc: PC_UNSET,
            end_pc: PC_UNSET,
            scope_level: level,
        });
        if let Some(scope) = self.scopes.last_mut() {
            scope.members.push(idx);
        }
    }

    /// Mark the most recent open range for `name` as defined at `pc`.
    pub fn define(&mut self, name: &str, pc: usize) {
        if let Some(range) = self.find_open_mut(name) {
            range.def_pc = pc as i64;
        }
    }

    pub fn use_var(&mut self, name: &str, pc: usize) {
        if let Some(range) = self.find_open_mut(name) {
            range.last_use_pc = pc as i64;
        }
    }

    fn find_open_mut(&mut self, name: &str) -> Option<&mut LifetimeRange> {
        self.ranges
            .iter_mut()
            .rev()
            .find(|r| r.name == name && r.end_pc == PC_UNSET)
    }

    /// Close any ranges still open (function end), then freeze into the
    /// queryable form, building the pc → names index.
    pub fn finish(mut self, end_pc: usize) -> FunctionLifetimes {
        while self.scopes.len() > 1 {
            self.exit_scope(end_pc);
        }
        if let Some(root) = self.scopes.pop() {
            let mut released = Vec::new();
            for idx in root.members {
                let range = &mut self.ranges[idx];
                if range.end_pc == PC_UNSET {
                    range.end_pc = end_pc as i64;
                    released.push(range.name.clone());
                }
            }
            if !released.is_empty() {
                self.destructor_points.entry(end_pc as u32).or_default().extend(released);
            }
        }

        let mut out = FunctionLifetimes {
            ranges: self.ranges,
            pc_to_vars: HashMap::new(),
            destructor_points: self.destructor_points,
        };
        rebuild_index(&mut out);
        out
    }
}

impl Default for LifetimeTracker {
    fn default() -> Self {
        LifetimeTracker::new()
    }
}

fn rebuild_index(lt: &mut FunctionLifetimes) {
    lt.pc_to_vars.clear();
    for range in &lt.ranges {
        if range.decl_pc == PC_UNSET || range.end_pc == PC_UNSET {
            continue;
        }
        for pc in range.decl_pc..=range.end_pc {
            lt.pc_to_vars.entry(pc as u32).or_default().push(range.name.clone());
        }
    }
}

/// Shrink ranges to their last use: a variable never read after
/// `last_use_pc` can be released there, with an earlier destructor point at
/// `last_use_pc + 1`. Rebuilds the pc index afterwards.
pub fn shrink_to_last_use(lt: &mut FunctionLifetimes) {
    for range in &mut lt.ranges {
        if range.last_use_pc != PC_UNSET && range.last_use_pc < range.end_pc {
            // Drop the name from its old destructor point, if recorded there.
            if let Some(names) = lt.destructor_points.get_mut(&(range.end_pc as u32)) {
                names.retain(|n| n != &range.name);
            }
            range.end_pc = range.last_use_pc;
            lt.destructor_points
                .entry((range.last_use_pc + 1) as u32)
                .or_default()
                .push(range.name.clone());
        }
    }
    lt.destructor_points.retain(|_, names| !names.is_empty());
    rebuild_index(lt);
}
