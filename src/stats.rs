/// Dispatch statistics.
///
/// Per-opcode execution counters plus a one-line throughput summary,
/// printed under verbose mode. Counters are plain integers owned by the
/// executor; the machine runs on one thread.

use std::time::Instant;

use crate::bytecode::{Op, OP_COUNT};

pub struct DispatchStats {
    counts: [u64; OP_COUNT as usize],
    started: Instant,
}

impl DispatchStats {
    pub fn new() -> DispatchStats {
        DispatchStats { counts: [0; OP_COUNT as usize], started: Instant::now() }
    }

    #[inline(always)]
    pub fn record(&mut self, op: Op) {
        self.counts[op as usize] += 1;
    }

    pub fn get(&self, op: Op) -> u64 {
        self.counts[op as usize]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Top-N opcode frequency table.
    pub fn report(&self, n: usize) -> String {
        use std::fmt::Write;
        let total = self.total();
        let mut out = String::new();
        let _ = writeln!(out, "=== Opcode Frequency (top {}) ===", n);
        if total == 0 {
            let _ = writeln!(out, "  (no instructions executed)");
            return out;
        }
        let mut entries: Vec<(Op, u64)> = (0..OP_COUNT)
            .filter_map(|i| {
                let op = Op::from_u8(i)?;
                let count = self.counts[i as usize];
                if count > 0 {
                    Some((op, count))
                } else {
                    None
                }
            })
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        let _ = writeln!(out, "  {:<14} {:>12}  {:>7}", "Opcode", "Count", "% total");
        for (op, count) in entries.iter().take(n) {
            let pct = *count as f64 / total as f64 * 100.0;
            let _ = writeln!(out, "  {:<14} {:>12}  {:>6.2}%", op.name(), count, pct);
        }
        let _ = writeln!(out, "  {:<14} {:>12}", "TOTAL", total);
        out
    }

    /// One-line summary for non-verbose runs.
    pub fn summary(&self) -> String {
        let elapsed = self.started.elapsed();
        let total = self.total();
        let mips = if elapsed.as_secs_f64() > 0.001 {
            total as f64 / elapsed.as_secs_f64() / 1_000_000.0
        } else {
            0.0
        };
        format!("{:.3}s | {} instrs | {:.1} MIPS", elapsed.as_secs_f64(), total, mips)
    }
}

impl Default for DispatchStats {
    fn default() -> Self {
        DispatchStats::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let mut s = DispatchStats::new();
        s.record(Op::Add);
        s.record(Op::Add);
        s.record(Op::Jmp);
        assert_eq!(s.get(Op::Add), 2);
        assert_eq!(s.total(), 3);
        assert!(s.report(5).contains("Add"));
    }
}
