//! Candidate CPU search
//!
//! Clusters are visited from a start gear outward. Each visited cluster
//! contributes at most two CPUs: its best idle CPU and its best busy CPU.
//! Across all visited clusters the CPUs with the most spare capacity are
//! kept as a safety net for when nothing passes the fit check.

use alloc::vec::Vec;

use super::{fits_capacity, PlacementEnv, PlacementRequest};
use crate::flt::GroupId;
use crate::task::SchedulingExtension;
use crate::topology::{ClusterId, CpuId, CpuMask};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchScope {
    Wakeup,
    /// Misfit migration off a CPU of `from`: only strictly bigger CPUs.
    Misfit { from: ClusterId },
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CandidateSet {
    pub mask: CpuMask,
    /// Candidates in evaluation order.
    pub order: Vec<CpuId>,
    pub max_spare: Option<CpuId>,
    pub max_spare_idle: Option<CpuId>,
    latency_sensitive: bool,
}

impl CandidateSet {
    fn push(&mut self, cpu: CpuId) {
        if !self.mask.test(cpu) {
            self.mask.set(cpu.index());
            self.order.push(cpu);
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Safety-net CPU; latency-sensitive tasks prefer an idle one.
    pub fn safety_net(&self) -> Option<CpuId> {
        if self.latency_sensitive {
            self.max_spare_idle.or(self.max_spare)
        } else {
            self.max_spare
        }
    }
}

/// (cpu, exit latency, spare after placement)
type IdleCandidate = (CpuId, u32, u64);
/// (cpu, priority of the running task, spare after placement)
type BusyCandidate = (CpuId, u8, u64);

/// Shallowest idle state wins; on a tie the tighter fit wins.
#[inline]
fn should_replace_idle(candidate: IdleCandidate, best: IdleCandidate) -> bool {
    let (_, c_lat, c_spare) = candidate;
    let (_, b_lat, b_spare) = best;
    c_lat < b_lat || (c_lat == b_lat && c_spare < b_spare)
}

/// Least important running task wins; on a tie the most spare wins.
#[inline]
fn should_replace_busy(candidate: BusyCandidate, best: BusyCandidate) -> bool {
    let (_, c_prio, c_spare) = candidate;
    let (_, b_prio, b_spare) = best;
    c_prio > b_prio || (c_prio == b_prio && c_spare > b_spare)
}

/// Cluster visiting order and the walk position from which the search may
/// stop once something was found.
fn search_order(
    env: &PlacementEnv<'_>,
    ext: &SchedulingExtension,
    util: u64,
    group: Option<GroupId>,
    scope: SearchScope,
) -> (Vec<ClusterId>, usize) {
    let nr = env.topology.nr_clusters();
    if nr == 0 {
        return (Vec::new(), 0);
    }

    if let SearchScope::Misfit { from } = scope {
        return ((from.index()..nr).map(ClusterId).collect(), 0);
    }

    if let Some(start) = ext.hints.gear_start.filter(|s| *s < nr) {
        let num = ext.hints.num_gear.max(1);
        let order: Vec<ClusterId> = if ext.hints.reverse {
            (0..=start).rev().take(num).map(ClusterId).collect()
        } else {
            (start..nr).take(num).map(ClusterId).collect()
        };
        let end = order.len().saturating_sub(1);
        return (order, end);
    }

    let mut start = (0..nr)
        .map(ClusterId)
        .find(|cluster| env.task_fits_cluster(util, group, *cluster))
        .map(|cluster| cluster.index())
        .unwrap_or(nr - 1);
    if let Some(group) = group {
        if env.tunables.group_aware_dvfs() && env.groups.gear_hint(group) {
            start = start.max(1).min(nr - 1);
        }
    }
    ((start..nr).map(ClusterId).collect(), 0)
}

/// Collect candidate CPUs for a task of utilisation `util`.
pub fn build_candidates(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    ext: &SchedulingExtension,
    util: u64,
    scope: SearchScope,
) -> CandidateSet {
    let group = ext.effective_group();
    let latency_sensitive = ext.vip.latency_sensitive();
    let soft_affinity = ext.vip.soft_affinity.filter(|_| latency_sensitive);
    let floor = match scope {
        SearchScope::Misfit { from } => Some(env.cluster_capacity_of(from)),
        SearchScope::Wakeup => None,
    };

    let mut set = CandidateSet {
        latency_sensitive,
        ..CandidateSet::default()
    };
    let mut max_spare: Option<(CpuId, u64)> = None;
    let mut max_spare_idle: Option<(CpuId, u64)> = None;
    let mut smallest_found: Option<ClusterId> = None;

    // VIP and latency-sensitive tasks see every gear in the window.
    let keeps_big = latency_sensitive || ext.vip.is_vip();

    let (order, end) = search_order(env, ext, util, group, scope);
    for (pos, cluster) in order.into_iter().enumerate() {
        if !keeps_big && !req.in_irq {
            if let Some(smaller) = smallest_found.filter(|s| s.index() < cluster.index()) {
                let fits_smaller = fits_capacity(
                    env.util_on(util, group, smaller),
                    env.cluster_capacity_of(smaller),
                    env.tunables.down_pct(smaller),
                );
                if fits_smaller {
                    crate::ktrace!("eas: {} skips gear {}", req.task, cluster.index());
                    continue;
                }
            }
        }

        let util_c = env.util_on(util, group, cluster);
        let up_pct = env.tunables.up_pct(cluster);
        let mut best_idle: Option<IdleCandidate> = None;
        let mut best_busy: Option<BusyCandidate> = None;

        for cpu in env.topology.cluster_cpus(cluster).iter_cpus() {
            if !req.allowed.test(cpu) || !env.available(cpu) || env.high_irq(cpu) {
                continue;
            }
            if let Some(mask) = soft_affinity {
                if !mask.test(cpu) {
                    continue;
                }
            }
            let capacity = env.capacity_of(cpu);
            if floor.map(|f| capacity <= f).unwrap_or(false) {
                continue;
            }
            let Some(snapshot) = env.snapshot(cpu) else {
                continue;
            };

            let cpu_util = env.cpu_util(cpu);
            let idle = env.is_idle(cpu);
            let headroom = capacity.saturating_sub(cpu_util);
            if headroom > util_c {
                if max_spare.map(|(_, s)| headroom > s).unwrap_or(true) {
                    max_spare = Some((cpu, headroom));
                }
                if idle && max_spare_idle.map(|(_, s)| headroom > s).unwrap_or(true) {
                    max_spare_idle = Some((cpu, headroom));
                }
            }

            let new_util = cpu_util.saturating_add(util_c);
            if !fits_capacity(new_util, capacity, up_pct) {
                continue;
            }
            let spare = capacity.saturating_sub(new_util);

            if idle {
                let candidate = (cpu, snapshot.idle_exit_latency, spare);
                if best_idle.map(|best| should_replace_idle(candidate, best)).unwrap_or(true) {
                    best_idle = Some(candidate);
                }
            } else {
                let candidate = (cpu, snapshot.curr_prio, spare);
                if best_busy.map(|best| should_replace_busy(candidate, best)).unwrap_or(true) {
                    best_busy = Some(candidate);
                }
            }
        }

        if let Some((cpu, _, _)) = best_idle {
            set.push(cpu);
        }
        if let Some((cpu, _, _)) = best_busy {
            set.push(cpu);
        }
        if (best_idle.is_some() || best_busy.is_some()) && smallest_found.is_none() {
            smallest_found = Some(cluster);
        }

        if pos >= end && !set.is_empty() {
            break;
        }
    }

    set.max_spare = max_spare.map(|(cpu, _)| cpu);
    set.max_spare_idle = max_spare_idle.map(|(cpu, _)| cpu);
    set
}
