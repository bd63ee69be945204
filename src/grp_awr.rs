//! Group aggregation ("grp_awr")
//!
//! Turns the per-CPU per-group demand published by the load tracker into
//! per-group decisions: whether the group should prefer a bigger gear, and
//! the margin its tasks are inflated by on each cluster. Data only flows
//! one way: load tracker -> aggregator -> placement.
//!
//! Hints and margins are atomics: readers on other CPUs accept slightly
//! stale values.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::energy::{EnergyModel, WorkloadType};
use crate::flt::{GroupId, GROUP_COUNT};
use crate::topology::{ClusterId, CpuId, Topology};
use crate::tunables::Tunables;
use crate::SCHED_CAPACITY_SCALE;

pub struct GroupAggregator {
    hints: [AtomicBool; GROUP_COUNT],
    /// `margins[cluster][group]`, scaled by 1024.
    margins: Vec<[AtomicU64; GROUP_COUNT]>,
}

/// Result of one [`GroupAggregator::update_preferred_cluster`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupHints {
    pub hints: [bool; GROUP_COUNT],
    pub threshold: u64,
}

/// Adaptive margin of a cluster at `ratio` (active ratio scaled by 1024):
/// `1024 + (1024 - ratio) / 4`.
#[inline]
pub fn adaptive_margin(ratio: u64) -> u64 {
    let ratio = ratio.min(SCHED_CAPACITY_SCALE);
    SCHED_CAPACITY_SCALE + (SCHED_CAPACITY_SCALE - ratio) / 4
}

impl GroupAggregator {
    pub fn new(nr_clusters: usize) -> Self {
        Self {
            hints: core::array::from_fn(|_| AtomicBool::new(false)),
            margins: (0..nr_clusters)
                .map(|_| core::array::from_fn(|_| AtomicU64::new(SCHED_CAPACITY_SCALE)))
                .collect(),
        }
    }

    /// Sum of the group's per-CPU demand within each cluster.
    pub fn aggregate_group_util(
        &self,
        group: GroupId,
        topology: &Topology,
        demand: impl Fn(CpuId, GroupId) -> u64,
    ) -> Vec<u64> {
        topology
            .clusters()
            .map(|(_, desc)| {
                desc.cpus
                    .iter_cpus()
                    .map(|cpu| demand(cpu, group))
                    .fold(0u64, u64::saturating_add)
            })
            .collect()
    }

    /// Recompute every group's gear hint and margins.
    ///
    /// Threshold: `max_capacity(cluster 0) * nr_cpus(cluster 0) * pct / 100`.
    /// A group prefers a bigger gear when its total demand is above it.
    /// Without usable cluster 0 data every hint is false.
    pub fn update_preferred_cluster(
        &self,
        workload: WorkloadType,
        topology: &Topology,
        model: Option<&dyn EnergyModel>,
        tunables: &Tunables,
        demand: impl Fn(CpuId, GroupId) -> u64,
    ) -> GroupHints {
        let cluster0 = ClusterId(0);
        let cap0 = model
            .and_then(|m| m.table(cluster0, workload))
            .map(|table| table.max_capacity())
            .unwrap_or_else(|| topology.cluster_capacity(cluster0));
        let ncpu0 = topology.cluster_cpus(cluster0).count() as u64;

        let mut result = GroupHints::default();
        if topology.nr_clusters() == 0 || cap0 == 0 || ncpu0 == 0 {
            for hint in &self.hints {
                hint.store(false, Ordering::Relaxed);
            }
            return result;
        }

        let forced = tunables.forced_margin();
        for group in GroupId::all() {
            let per_cluster = self.aggregate_group_util(group, topology, &demand);
            let total = per_cluster.iter().fold(0u64, |acc, v| acc.saturating_add(*v));

            let pct = tunables.group_threshold_pct(group) as u64;
            let threshold = cap0 * ncpu0 * pct / 100;
            let hint = total > threshold;
            self.hints[group.index()].store(hint, Ordering::Relaxed);
            result.hints[group.index()] = hint;
            if group.index() == 0 {
                result.threshold = threshold;
            }

            self.update_margins(group, topology, &per_cluster, forced, tunables.adaptive_margin());
        }
        result
    }

    fn update_margins(
        &self,
        group: GroupId,
        topology: &Topology,
        per_cluster: &[u64],
        forced: Option<u64>,
        adaptive: bool,
    ) {
        for (cluster, desc) in topology.clusters() {
            let Some(slot) = self.margins.get(cluster.index()) else {
                continue;
            };
            let margin = match forced {
                Some(manual) => manual,
                None if adaptive => {
                    let bandwidth = desc.capacity * desc.cpus.count() as u64;
                    if bandwidth == 0 {
                        SCHED_CAPACITY_SCALE
                    } else {
                        let demand = per_cluster.get(cluster.index()).copied().unwrap_or(0);
                        adaptive_margin(demand.saturating_mul(SCHED_CAPACITY_SCALE) / bandwidth)
                    }
                }
                None => SCHED_CAPACITY_SCALE,
            };
            slot[group.index()].store(margin, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn gear_hint(&self, group: GroupId) -> bool {
        self.hints[group.index()].load(Ordering::Relaxed)
    }

    pub fn hints(&self) -> [bool; GROUP_COUNT] {
        core::array::from_fn(|idx| self.hints[idx].load(Ordering::Relaxed))
    }

    /// Margin of `group` on `cluster`, scaled by 1024. A forced margin wins
    /// even before the next update pass.
    pub fn margin(&self, group: GroupId, cluster: ClusterId, tunables: &Tunables) -> u64 {
        if let Some(manual) = tunables.forced_margin() {
            return manual;
        }
        self.margins
            .get(cluster.index())
            .map(|slot| slot[group.index()].load(Ordering::Relaxed))
            .unwrap_or(SCHED_CAPACITY_SCALE)
    }
}
