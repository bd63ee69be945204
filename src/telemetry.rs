//! Telemetry
//!
//! A bounded trace ring of decision records plus per-CPU counters, for
//! offline analysis. Recording only copies values out; nothing here is
//! ever read back by a decision path.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::flt::GROUP_COUNT;
use crate::placement::PlacementPath;
use crate::task::TaskId;
use crate::topology::{CpuId, CpuMask, MAX_CPUS};

/// Number of records kept in the trace ring.
pub const TELEMETRY_DEPTH: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    Placement {
        at: u64,
        task: TaskId,
        prev_cpu: Option<CpuId>,
        cpu: Option<CpuId>,
        path: PlacementPath,
        candidates: CpuMask,
        /// Energy delta of the chosen CPU, if energies were compared.
        energy: Option<u64>,
    },
    RtPlacement {
        at: u64,
        task: TaskId,
        cpu: Option<CpuId>,
    },
    Window {
        at: u64,
        cpu: CpuId,
        curr_sum: u64,
        prev_sum: u64,
        demand: u64,
    },
    Misfit {
        at: u64,
        task: TaskId,
        src: CpuId,
        dst: CpuId,
        queued: bool,
    },
    Rotation {
        at: u64,
        small: CpuId,
        big: CpuId,
    },
    GroupHints {
        at: u64,
        hints: [bool; GROUP_COUNT],
    },
}

/// Counters of one CPU.
#[derive(Default)]
pub struct PerCpuStats {
    pub placements: AtomicU64,
    pub energy_evals: AtomicU64,
    pub fallbacks: AtomicU64,
    pub misfit_requests: AtomicU64,
    pub rotations: AtomicU64,
    pub clock_skips: AtomicU64,
}

/// Plain copy of [`PerCpuStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuStatsSnapshot {
    pub placements: u64,
    pub energy_evals: u64,
    pub fallbacks: u64,
    pub misfit_requests: u64,
    pub rotations: u64,
    pub clock_skips: u64,
}

impl PerCpuStats {
    pub fn snapshot(&self) -> CpuStatsSnapshot {
        CpuStatsSnapshot {
            placements: self.placements.load(Ordering::Relaxed),
            energy_evals: self.energy_evals.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            misfit_requests: self.misfit_requests.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
            clock_skips: self.clock_skips.load(Ordering::Relaxed),
        }
    }
}

#[inline]
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub struct Telemetry {
    ring: Mutex<VecDeque<TraceEvent>>,
    overwritten: AtomicU64,
    cpus: Vec<PerCpuStats>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(TELEMETRY_DEPTH)),
            overwritten: AtomicU64::new(0),
            cpus: (0..MAX_CPUS).map(|_| PerCpuStats::default()).collect(),
        }
    }

    /// Append `event`, dropping the oldest record when the ring is full.
    #[cfg(feature = "telemetry")]
    pub fn record(&self, event: TraceEvent) {
        let mut ring = self.ring.lock();
        if ring.len() == TELEMETRY_DEPTH {
            ring.pop_front();
            self.overwritten.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(event);
    }

    #[cfg(not(feature = "telemetry"))]
    #[inline]
    pub fn record(&self, _event: TraceEvent) {}

    /// Take every buffered record, oldest first.
    pub fn drain(&self) -> Vec<TraceEvent> {
        self.ring.lock().drain(..).collect()
    }

    /// Copy the buffered records without consuming them.
    pub fn snapshot(&self) -> Vec<TraceEvent> {
        self.ring.lock().iter().copied().collect()
    }

    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn cpu(&self, cpu: CpuId) -> &PerCpuStats {
        &self.cpus[cpu.index()]
    }

    pub fn cpu_stats(&self, cpu: CpuId) -> CpuStatsSnapshot {
        self.cpu(cpu).snapshot()
    }

    /// Sum of every CPU's counters.
    pub fn totals(&self) -> CpuStatsSnapshot {
        self.cpus
            .iter()
            .map(PerCpuStats::snapshot)
            .fold(CpuStatsSnapshot::default(), |acc, s| CpuStatsSnapshot {
                placements: acc.placements + s.placements,
                energy_evals: acc.energy_evals + s.energy_evals,
                fallbacks: acc.fallbacks + s.fallbacks,
                misfit_requests: acc.misfit_requests + s.misfit_requests,
                rotations: acc.rotations + s.rotations,
                clock_skips: acc.clock_skips + s.clock_skips,
            })
    }
}
