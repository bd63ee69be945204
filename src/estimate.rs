//! Energy estimation
//!
//! One [`EnergyEnv`] lives for one placement decision. It snapshots the
//! per-CPU utilisation and temperature once, then memoises every cluster's
//! baseline (energy without the task) so each candidate CPU only costs the
//! re-evaluation of its own cluster.
//!
//! All values are fixed point with full capacity = 1024. Divisions by zero
//! contribute 0.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::energy::dsu::voltage_bump_cost;
use crate::energy::{ActiveTables, EmTable, EnergyModel, OperatingPoint};
use crate::topology::{ClusterId, CpuId, Topology};
use crate::SCHED_CAPACITY_SCALE;

/// Temperatures outside this range are reported but not trusted.
pub const TEMP_MIN_C: i32 = -40;
pub const TEMP_MAX_C: i32 = 125;

/// Operating point headroom over the busiest CPU (1.25 scaled by 1024).
pub const OPP_HEADROOM: u64 = 1280;

/// What the estimator needs to know about one CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuEnergyInput {
    /// Utilisation in capacity units, including the task if it is queued here.
    pub util: u64,
    pub temperature_c: Option<i32>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnergyEstimate {
    pub dynamic: u64,
    pub static_power: u64,
    /// Every CPU of the cluster reported a plausible temperature.
    pub static_trusted: bool,
    pub dsu: u64,
    /// `dynamic + dsu`, plus `static_power` when trusted.
    pub total: u64,
}

impl EnergyEstimate {
    fn finish(mut self) -> Self {
        self.total = self.dynamic.saturating_add(self.dsu);
        if self.static_trusted {
            self.total = self.total.saturating_add(self.static_power);
        }
        self
    }
}

/// Memoised state of one cluster without the task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterBaseline {
    pub cpu_utils: Vec<(CpuId, u64)>,
    pub busy: u64,
    pub max_util: u64,
    /// Cluster energy without the DSU share.
    pub energy: EnergyEstimate,
    pub opp: OperatingPoint,
}

/// Work done by one [`EnergyEnv`], for instrumentation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EnergyCounters {
    pub compute_calls: u32,
    pub baselines: u32,
    pub bump_evals: u32,
}

pub struct EnergyEnv<'a> {
    topology: &'a Topology,
    model: &'a dyn EnergyModel,
    tables: Arc<ActiveTables>,
    task_util: u64,
    /// Indexed by CPU index; the task is already removed from its source.
    cpus: Vec<CpuEnergyInput>,
    /// Capacity ceiling per cluster.
    ceilings: Vec<u64>,
    baselines: Vec<Option<ClusterBaseline>>,
    bump_costs: Vec<Option<u64>>,
    counters: EnergyCounters,
}

fn plausible(temp_c: i32) -> bool {
    (TEMP_MIN_C..=TEMP_MAX_C).contains(&temp_c)
}

impl<'a> EnergyEnv<'a> {
    /// `src` is the CPU whose utilisation currently includes the task.
    pub fn new(
        topology: &'a Topology,
        model: &'a dyn EnergyModel,
        task_util: u64,
        src: Option<CpuId>,
        input: impl Fn(CpuId) -> CpuEnergyInput,
        ceiling: impl Fn(ClusterId) -> u64,
    ) -> Self {
        let len = topology.cpus().map(|cpu| cpu.index() + 1).max().unwrap_or(0);
        let mut cpus = vec![CpuEnergyInput::default(); len];
        for cpu in topology.cpus() {
            let mut sample = input(cpu);
            if Some(cpu) == src {
                sample.util = sample.util.saturating_sub(task_util);
            }
            cpus[cpu.index()] = sample;
        }
        let nr_clusters = topology.nr_clusters();
        Self {
            topology,
            model,
            tables: model.active(),
            task_util,
            cpus,
            ceilings: topology.clusters().map(|(id, _)| ceiling(id)).collect(),
            baselines: vec![None; nr_clusters],
            bump_costs: vec![None; nr_clusters],
            counters: EnergyCounters::default(),
        }
    }

    #[inline]
    pub fn task_util(&self) -> u64 {
        self.task_util
    }

    #[inline]
    pub fn counters(&self) -> EnergyCounters {
        self.counters
    }

    /// Baseline of `cluster`, computed on first use.
    pub fn baseline(&mut self, cluster: ClusterId) -> Option<&ClusterBaseline> {
        if !self.ensure_baseline(cluster) {
            return None;
        }
        self.baselines.get(cluster.index()).and_then(Option::as_ref)
    }

    fn ensure_baseline(&mut self, cluster: ClusterId) -> bool {
        match self.baselines.get(cluster.index()) {
            None => return false,
            Some(Some(_)) => return true,
            Some(None) => {}
        }
        let Some(desc) = self.topology.cluster(cluster) else {
            return false;
        };
        let utils: Vec<(CpuId, u64)> = desc
            .cpus
            .iter_cpus()
            .map(|cpu| (cpu, self.cpu_util(cpu).min(desc.capacity)))
            .collect();
        let Some((energy, busy, max_util, opp)) = self.cluster_energy(cluster, &utils) else {
            return false;
        };
        self.counters.baselines += 1;
        self.baselines[cluster.index()] = Some(ClusterBaseline {
            cpu_utils: utils,
            busy,
            max_util,
            energy,
            opp,
        });
        true
    }

    fn cpu_util(&self, cpu: CpuId) -> u64 {
        self.cpus.get(cpu.index()).map(|c| c.util).unwrap_or(0)
    }

    fn table(&self, cluster: ClusterId) -> Option<&EmTable> {
        self.tables.table(cluster)
    }

    /// Operating point the cluster settles on for `max_util`.
    fn operating_point(&self, cluster: ClusterId, table: &EmTable, max_util: u64) -> OperatingPoint {
        let ceiling = self
            .ceilings
            .get(cluster.index())
            .copied()
            .unwrap_or(SCHED_CAPACITY_SCALE)
            .min(table.max_capacity());
        let capacity = (max_util.saturating_mul(OPP_HEADROOM) / SCHED_CAPACITY_SCALE).min(ceiling);
        *table.interpolated(capacity)
    }

    /// Energy of `cluster` with the given per-CPU utilisation, DSU excluded.
    fn cluster_energy(
        &self,
        cluster: ClusterId,
        utils: &[(CpuId, u64)],
    ) -> Option<(EnergyEstimate, u64, u64, OperatingPoint)> {
        let table = self.table(cluster)?;
        let busy = utils.iter().fold(0u64, |acc, (_, u)| acc.saturating_add(*u));
        let max_util = utils.iter().map(|(_, u)| *u).max().unwrap_or(0);
        let opp = self.operating_point(cluster, table, max_util);

        let mut estimate = EnergyEstimate {
            dynamic: opp.pwr_eff.saturating_mul(busy) / SCHED_CAPACITY_SCALE,
            ..EnergyEstimate::default()
        };

        let temps_known = utils
            .iter()
            .all(|(cpu, _)| self.cpus.get(cpu.index()).and_then(|c| c.temperature_c).is_some());
        if temps_known && busy > 0 {
            let index = table.opp_for_capacity(opp.capacity);
            let divisor = self.model.leakage_divisor(cluster);
            let mut trusted = true;
            let mut weighted = 0u128;
            for (cpu, util) in utils {
                let temp = self.cpus[cpu.index()].temperature_c.unwrap_or(0);
                trusted &= plausible(temp);
                weighted += table.leakage(index, temp, divisor) as u128 * *util as u128;
            }
            estimate.static_power = (weighted / busy as u128).min(u64::MAX as u128) as u64;
            estimate.static_trusted = trusted;
        }

        Some((estimate.finish(), busy, max_util, opp))
    }

    /// DSU energy when the fastest cluster runs at `freq_khz` and the whole
    /// system is `busy`: shared power weighted by average utilisation.
    fn dsu_energy(&self, freq_khz: u32, busy: u64) -> u64 {
        let Some(dsu) = self.model.dsu() else {
            return 0;
        };
        let nr_cpus = self.topology.nr_cpus() as u64;
        if nr_cpus == 0 {
            return 0;
        }
        let power = dsu.opp_for_cluster_freq(freq_khz).dyn_power;
        power.saturating_mul(busy) / (SCHED_CAPACITY_SCALE * nr_cpus)
    }

    /// Highest baseline frequency and total busy time of every cluster but
    /// `except`. Requires all baselines.
    fn others(&self, except: ClusterId) -> (u32, u64) {
        self.baselines
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != except.index())
            .filter_map(|(_, b)| b.as_ref())
            .fold((0, 0), |(freq, busy), b| {
                (freq.max(b.opp.freq_khz), busy.saturating_add(b.busy))
            })
    }

    fn ensure_all_baselines(&mut self) {
        for idx in 0..self.baselines.len() {
            self.ensure_baseline(ClusterId(idx));
        }
    }
}

/// Energy of `cluster` with the task placed on `dst`, or without it when
/// `dst` is `None` or lies in another cluster.
pub fn compute_energy(
    env: &mut EnergyEnv<'_>,
    cluster: ClusterId,
    dst: Option<CpuId>,
) -> Option<EnergyEstimate> {
    env.counters.compute_calls += 1;
    if !env.ensure_baseline(cluster) {
        return None;
    }
    if env.model.dsu().is_some() {
        env.ensure_all_baselines();
    }
    let base = env.baselines.get(cluster.index())?.as_ref()?;

    let in_cluster = dst.filter(|cpu| env.topology.cluster_of(*cpu) == Some(cluster));
    let (mut estimate, busy, opp) = match in_cluster {
        None => (base.energy, base.busy, base.opp),
        Some(dst) => {
            let capacity = env.topology.cluster_capacity(cluster);
            let utils: Vec<(CpuId, u64)> = base
                .cpu_utils
                .iter()
                .map(|(cpu, util)| {
                    let util = if *cpu == dst {
                        util.saturating_add(env.task_util).min(capacity)
                    } else {
                        *util
                    };
                    (*cpu, util)
                })
                .collect();
            let (estimate, busy, _, opp) = env.cluster_energy(cluster, &utils)?;
            (estimate, busy, opp)
        }
    };

    if env.model.dsu().is_some() {
        let (other_freq, other_busy) = env.others(cluster);
        estimate.dsu = env.dsu_energy(other_freq.max(opp.freq_khz), other_busy.saturating_add(busy));
        estimate = estimate.finish();
    }
    Some(estimate)
}

/// One-time cost of `cluster` lifting the shared DSU rail to `volt_uv`.
fn shared_rail_bump(env: &mut EnergyEnv<'_>, cluster: ClusterId, volt_uv: u32) -> u64 {
    let Some(rail) = env.model.dsu().map(|dsu| dsu.shared_rail_cluster()) else {
        return 0;
    };
    if rail == cluster {
        return 0;
    }
    if let Some(Some(cost)) = env.bump_costs.get(cluster.index()) {
        return *cost;
    }
    if !env.ensure_baseline(rail) {
        return 0;
    }
    let cost = match env.baselines.get(rail.index()).and_then(Option::as_ref) {
        Some(base) => voltage_bump_cost(base.energy.dynamic, base.opp.volt_uv, volt_uv),
        None => 0,
    };
    env.counters.bump_evals += 1;
    if let Some(slot) = env.bump_costs.get_mut(cluster.index()) {
        *slot = Some(cost);
    }
    cost
}

/// Extra energy of placing the task on `dst`: its cluster with the task
/// minus the cluster baseline, including the DSU share and the shared-rail
/// voltage bump (charged once per destination cluster).
pub fn energy_delta(env: &mut EnergyEnv<'_>, dst: CpuId) -> Option<u64> {
    let cluster = env.topology.cluster_of(dst)?;
    let base = compute_energy(env, cluster, None)?;
    let with = compute_energy(env, cluster, Some(dst))?;
    let mut delta = with.total.saturating_sub(base.total);

    if env.model.dsu().is_some() {
        let capacity = env.topology.cluster_capacity(cluster);
        let util = env.cpu_util(dst).saturating_add(env.task_util).min(capacity);
        let table_volt = {
            let max_util = env
                .baselines
                .get(cluster.index())
                .and_then(Option::as_ref)
                .map(|b| b.max_util.max(util))
                .unwrap_or(util);
            env.table(cluster)
                .map(|table| env.operating_point(cluster, table, max_util).volt_uv)
        };
        if let Some(volt_uv) = table_volt {
            delta = delta.saturating_add(shared_rail_bump(env, cluster, volt_uv));
        }
    }
    Some(delta)
}
