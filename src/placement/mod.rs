//! CFS task placement
//!
//! One call picks a CPU for a waking, forked or exec'ing fair task:
//!
//! ```text
//! fast exits -> candidate build -> (single | energy compare) -> fallback chain
//! ```
//!
//! Every outcome carries the [`PlacementPath`] that produced it. With no
//! energy model the engine goes straight to the fallback chain.

pub mod candidates;
pub mod fallback;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::energy::EnergyModel;
use crate::estimate::{energy_delta, CpuEnergyInput, EnergyEnv};
use crate::flt::GroupId;
use crate::grp_awr::GroupAggregator;
use crate::host::{CpuSnapshot, SchedPolicy, SchedulerHost};
use crate::percpu::{CpuRq, PerCpuArena};
use crate::task::{SchedulingExtension, TaskId};
use crate::topology::{ClusterId, CpuId, CpuMask, Topology, MAX_CPUS};
use crate::tunables::{FltMode, Tunables};
use crate::SCHED_CAPACITY_SCALE;

pub use candidates::{build_candidates, CandidateSet, SearchScope};
pub use fallback::run_fallback;

/// Most RT tasks the waker's CPU may have queued for the sync fast path.
pub const SYNC_RT_MAX_QUEUED: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementKind {
    Wakeup,
    Fork,
    Exec,
    /// Load-balance reschedule of a queued task.
    Balance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakerInfo {
    pub policy: SchedPolicy,
    pub prio: u8,
    pub per_cpu_kthread: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlacementRequest {
    pub task: TaskId,
    pub prev_cpu: CpuId,
    /// CPU making the call (the waker's CPU on wakeups).
    pub this_cpu: CpuId,
    pub kind: PlacementKind,
    pub sync: bool,
    pub waker: Option<WakerInfo>,
    pub in_irq: bool,
    pub policy: SchedPolicy,
    pub prio: u8,
    /// Host utilisation estimate of the task, capacity units.
    pub util_est: u64,
    pub allowed: CpuMask,
    /// CPU the task last ran on before `prev_cpu`, if the host tracks it.
    pub recent_cpu: Option<CpuId>,
}

/// Step that produced a placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementPath {
    /// Exec or balance reschedule stays on the current CPU.
    StayOnCpu,
    /// Sync wakeup from a realtime waker.
    SyncWaker,
    SingleCandidate,
    LowestEnergy,
    /// Max-spare CPU used when no CPU passed the fit check.
    MaxSpare,
    VvipBalance,
    WakeAffine,
    PrevIdle,
    KthreadStack,
    RecentIdle,
    IdleFit,
    AllowedFirst,
    RtIdle,
    RtPreemptFair,
    RtPreemptRt,
    RtPrev,
    /// Nothing applies; the host uses its default.
    NotFound,
}

impl PlacementPath {
    pub const fn as_str(self) -> &'static str {
        match self {
            PlacementPath::StayOnCpu => "stay",
            PlacementPath::SyncWaker => "sync",
            PlacementPath::SingleCandidate => "single",
            PlacementPath::LowestEnergy => "energy",
            PlacementPath::MaxSpare => "max_spare",
            PlacementPath::VvipBalance => "vvip",
            PlacementPath::WakeAffine => "wake_affine",
            PlacementPath::PrevIdle => "prev_idle",
            PlacementPath::KthreadStack => "kthread",
            PlacementPath::RecentIdle => "recent_idle",
            PlacementPath::IdleFit => "idle_fit",
            PlacementPath::AllowedFirst => "allowed_first",
            PlacementPath::RtIdle => "rt_idle",
            PlacementPath::RtPreemptFair => "rt_fair",
            PlacementPath::RtPreemptRt => "rt_rt",
            PlacementPath::RtPrev => "rt_prev",
            PlacementPath::NotFound => "none",
        }
    }

    #[inline]
    pub fn is_fallback(self) -> bool {
        matches!(
            self,
            PlacementPath::VvipBalance
                | PlacementPath::WakeAffine
                | PlacementPath::PrevIdle
                | PlacementPath::KthreadStack
                | PlacementPath::RecentIdle
                | PlacementPath::IdleFit
                | PlacementPath::AllowedFirst
                | PlacementPath::NotFound
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub cpu: Option<CpuId>,
    pub path: PlacementPath,
}

impl Placement {
    pub const fn new(cpu: Option<CpuId>, path: PlacementPath) -> Self {
        Self { cpu, path }
    }
}

/// A placement plus what led to it, for telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub placement: Placement,
    pub candidates: CpuMask,
    /// Energy delta of the chosen CPU when energies were compared.
    pub energy: Option<u64>,
    /// Energy evaluations performed.
    pub energy_evals: u32,
}

impl Decision {
    fn plain(placement: Placement) -> Self {
        Self {
            placement,
            candidates: CpuMask::empty(),
            energy: None,
            energy_evals: 0,
        }
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Read-only view of the system for one decision.
pub struct PlacementEnv<'a> {
    pub topology: &'a Topology,
    pub model: Option<&'a dyn EnergyModel>,
    pub tunables: &'a Tunables,
    pub groups: &'a GroupAggregator,
    pub rqs: &'a PerCpuArena<CpuRq>,
    /// Capacity ceiling of each cluster.
    pub ceilings: &'a [AtomicU64],
    snapshots: Vec<Option<CpuSnapshot>>,
}

/// `util` fits `capacity` with `pct` percent headroom.
#[inline]
pub fn fits_capacity(util: u64, capacity: u64, pct: u32) -> bool {
    util.saturating_mul(100) < capacity.saturating_mul(pct as u64)
}

impl<'a> PlacementEnv<'a> {
    pub fn new(
        topology: &'a Topology,
        model: Option<&'a dyn EnergyModel>,
        tunables: &'a Tunables,
        groups: &'a GroupAggregator,
        rqs: &'a PerCpuArena<CpuRq>,
        ceilings: &'a [AtomicU64],
        host: &dyn SchedulerHost,
    ) -> Self {
        let mut snapshots = Vec::with_capacity(MAX_CPUS);
        let len = topology.cpus().map(|cpu| cpu.index() + 1).max().unwrap_or(0);
        snapshots.resize(len, None);
        for cpu in topology.cpus() {
            snapshots[cpu.index()] = Some(host.cpu_state(cpu));
        }
        Self {
            topology,
            model,
            tunables,
            groups,
            rqs,
            ceilings,
            snapshots,
        }
    }

    /// Host snapshot of `cpu`; `None` outside the topology.
    #[inline]
    pub fn snapshot(&self, cpu: CpuId) -> Option<&CpuSnapshot> {
        self.snapshots.get(cpu.index()).and_then(Option::as_ref)
    }

    /// Online in both the host's and the engine's view, and not paused.
    pub fn available(&self, cpu: CpuId) -> bool {
        self.rqs.is_online(cpu) && self.snapshot(cpu).map(|s| s.available()).unwrap_or(false)
    }

    pub fn is_idle(&self, cpu: CpuId) -> bool {
        self.snapshot(cpu)
            .map(|s| s.idle && s.nr_running == 0)
            .unwrap_or(false)
    }

    /// Capacity of `cluster` under its thermal ceiling.
    pub fn cluster_capacity_of(&self, cluster: ClusterId) -> u64 {
        let ceiling = self
            .ceilings
            .get(cluster.index())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(SCHED_CAPACITY_SCALE);
        self.topology.cluster_capacity(cluster).min(ceiling)
    }

    pub fn capacity_of(&self, cpu: CpuId) -> u64 {
        self.topology
            .cluster_of(cpu)
            .map(|cluster| self.cluster_capacity_of(cluster))
            .unwrap_or(0)
    }

    /// Utilisation of `cpu`: the host estimate or the tracked demand,
    /// whichever is larger.
    pub fn cpu_util(&self, cpu: CpuId) -> u64 {
        let host = self.snapshot(cpu).map(|s| s.util).unwrap_or(0);
        let tracked = match self.tunables.flt_mode() {
            FltMode::Disabled => 0,
            _ => self.rqs.get(cpu).map(|rq| rq.published_demand()).unwrap_or(0),
        };
        host.max(tracked)
    }

    /// Interrupt load above the high-irq threshold.
    pub fn high_irq(&self, cpu: CpuId) -> bool {
        self.snapshot(cpu)
            .map(|s| {
                s.irq_util.saturating_mul(100)
                    > self.topology.capacity_orig(cpu).saturating_mul(self.tunables.high_irq_pct() as u64)
            })
            .unwrap_or(false)
    }

    /// Task utilisation before group margins.
    pub fn task_util(&self, util_est: u64, ext: &SchedulingExtension) -> u64 {
        match self.tunables.flt_mode() {
            FltMode::TaskAndCpu => util_est.max(ext.load.demand()),
            _ => util_est,
        }
    }

    /// `util` inflated by the group margin of `cluster`.
    pub fn util_on(&self, util: u64, group: Option<GroupId>, cluster: ClusterId) -> u64 {
        match group {
            Some(group) if self.tunables.group_aware_dvfs() => {
                let margin = self.groups.margin(group, cluster, self.tunables);
                util.saturating_mul(margin) / SCHED_CAPACITY_SCALE
            }
            _ => util,
        }
    }

    /// Task fits a CPU of `cluster` under the cluster's up-migration pct.
    pub fn task_fits_cluster(&self, util: u64, group: Option<GroupId>, cluster: ClusterId) -> bool {
        fits_capacity(
            self.util_on(util, group, cluster),
            self.cluster_capacity_of(cluster),
            self.tunables.up_pct(cluster),
        )
    }

    /// `cpu` can take `util` more and stay within its up-migration pct.
    pub fn task_fits_cpu(&self, util: u64, group: Option<GroupId>, cpu: CpuId) -> bool {
        let Some(cluster) = self.topology.cluster_of(cpu) else {
            return false;
        };
        let new_util = self.cpu_util(cpu).saturating_add(self.util_on(util, group, cluster));
        fits_capacity(new_util, self.capacity_of(cpu), self.tunables.up_pct(cluster))
    }

    pub fn energy_env(&self, task_util: u64, src: Option<CpuId>) -> Option<EnergyEnv<'a>> {
        let model = self.model?;
        Some(EnergyEnv::new(
            self.topology,
            model,
            task_util,
            src,
            |cpu| CpuEnergyInput {
                util: self.cpu_util(cpu),
                temperature_c: self.snapshot(cpu).and_then(|s| s.temperature_c),
            },
            |cluster| self.cluster_capacity_of(cluster),
        ))
    }
}

// ============================================================================
// Decision
// ============================================================================

fn fast_exit(env: &PlacementEnv<'_>, req: &PlacementRequest) -> Option<Placement> {
    let this = req.this_cpu;
    let this_ok = req.allowed.test(this) && env.available(this);

    let reschedule = !matches!(req.kind, PlacementKind::Wakeup | PlacementKind::Fork);
    if reschedule && this_ok {
        return Some(Placement::new(Some(this), PlacementPath::StayOnCpu));
    }

    if req.sync && this_ok {
        if let Some(waker) = req.waker {
            let rt_queued = env.snapshot(this).map(|s| s.rt_nr_running).unwrap_or(u32::MAX);
            if waker.policy == SchedPolicy::Realtime
                && waker.prio <= req.prio
                && rt_queued <= SYNC_RT_MAX_QUEUED
            {
                return Some(Placement::new(Some(this), PlacementPath::SyncWaker));
            }
        }
    }
    None
}

/// Pick a CPU for a fair task.
pub fn select_task_cpu(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    ext: &SchedulingExtension,
) -> Decision {
    if let Some(placement) = fast_exit(env, req) {
        return Decision::plain(placement);
    }

    let util = env.task_util(req.util_est, ext);
    if util == 0 || env.model.is_none() {
        return Decision::plain(run_fallback(env, req, ext, util));
    }

    let set = build_candidates(env, req, ext, util, SearchScope::Wakeup);
    let mut decision = Decision {
        placement: Placement::new(None, PlacementPath::NotFound),
        candidates: set.mask,
        energy: None,
        energy_evals: 0,
    };

    match set.order.as_slice() {
        [] => match set.safety_net() {
            Some(cpu) => decision.placement = Placement::new(Some(cpu), PlacementPath::MaxSpare),
            None => decision.placement = run_fallback(env, req, ext, util),
        },
        [only] => decision.placement = Placement::new(Some(*only), PlacementPath::SingleCandidate),
        many => {
            let src = Some(req.prev_cpu).filter(|cpu| env.topology.contains(*cpu));
            let mut best: Option<(CpuId, u64)> = None;
            if let Some(mut energy) = env.energy_env(util, src) {
                for &cpu in many {
                    let Some(delta) = energy_delta(&mut energy, cpu) else {
                        continue;
                    };
                    decision.energy_evals += 1;
                    // first minimum wins
                    if best.map(|(_, b)| delta < b).unwrap_or(true) {
                        best = Some((cpu, delta));
                    }
                }
            }
            decision.placement = match best {
                Some((cpu, delta)) => {
                    decision.energy = Some(delta);
                    Placement::new(Some(cpu), PlacementPath::LowestEnergy)
                }
                None => run_fallback(env, req, ext, util),
            };
        }
    }
    decision
}
