//! Per-operation performance counters backing the RpcStat RPC.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Data-plane operations tracked by the counters. Wire ids 1..=8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerfOp {
    Put = 0,
    Get = 1,
    Delete = 2,
    Scan = 3,
    KeepAlive = 4,
    Lock = 5,
    Unlock = 6,
    Watch = 7,
}

impl PerfOp {
    pub const COUNT: usize = 8;

    pub fn from_wire(id: u32) -> Option<PerfOp> {
        match id {
            1 => Some(PerfOp::Put),
            2 => Some(PerfOp::Get),
            3 => Some(PerfOp::Delete),
            4 => Some(PerfOp::Scan),
            5 => Some(PerfOp::KeepAlive),
            6 => Some(PerfOp::Lock),
            7 => Some(PerfOp::Unlock),
            8 => Some(PerfOp::Watch),
            _ => None,
        }
    }
}

/// One sampled statistic: recent rate and lifetime average, both per second.
#[derive(Debug, Clone, Copy)]
pub struct PerfStat {
    pub current: i64,
    pub average: i64,
}

struct SampleState {
    taken_at: Instant,
    totals: [u64; PerfOp::COUNT],
}

/// Lock-free counting with a small sampled window for "current" rates.
pub struct PerfCounters {
    started: Instant,
    totals: [AtomicU64; PerfOp::COUNT],
    last_sample: Mutex<SampleState>,
}

impl PerfCounters {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            totals: Default::default(),
            last_sample: Mutex::new(SampleState {
                taken_at: now,
                totals: [0; PerfOp::COUNT],
            }),
        }
    }

    pub fn record(&self, op: PerfOp) {
        self.totals[op as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Sample one operation: rate since the previous sample of that op plus
    /// the lifetime average.
    pub fn sample(&self, op: PerfOp) -> PerfStat {
        let now = Instant::now();
        let total = self.totals[op as usize].load(Ordering::Relaxed);

        let mut last = self.last_sample.lock();
        let window = now.duration_since(last.taken_at).as_secs_f64().max(0.001);
        let delta = total.saturating_sub(last.totals[op as usize]);
        last.totals[op as usize] = total;
        last.taken_at = now;

        let lifetime = now.duration_since(self.started).as_secs_f64().max(0.001);
        PerfStat {
            current: (delta as f64 / window) as i64,
            average: (total as f64 / lifetime) as i64,
        }
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}
