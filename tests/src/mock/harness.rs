//! Placement environment without an engine around it
//!
//! Lets tests drive the candidate search, fallback chain and RT selection
//! directly against a [`MockHost`].

use std::sync::atomic::AtomicU64;

use nexa_eas::grp_awr::GroupAggregator;
use nexa_eas::percpu::{CpuRq, PerCpuArena};
use nexa_eas::placement::{PlacementEnv, PlacementKind};
use nexa_eas::{
    build_energy_model, CpuMask, EasConfig, EmCalibration, EnergyModel, PlacementRequest,
    SchedPolicy, TaskId, Topology, Tunables,
};

use super::fixtures::cpu;
use super::host::MockHost;

pub struct Harness {
    pub topology: Topology,
    pub model: Option<Box<dyn EnergyModel>>,
    pub tunables: Tunables,
    pub groups: GroupAggregator,
    pub rqs: PerCpuArena<CpuRq>,
    pub ceilings: Vec<AtomicU64>,
    pub host: MockHost,
}

impl Harness {
    /// Every CPU online and idle.
    pub fn new(topology: Topology, calibration: Option<&EmCalibration>) -> Self {
        let model = calibration.map(|c| build_energy_model(c).expect("model"));
        let nr_clusters = topology.nr_clusters();
        let rqs = PerCpuArena::new(&topology, CpuRq::new);
        for cpu in topology.cpus() {
            rqs.online(cpu);
        }
        let ceilings = topology
            .clusters()
            .map(|(_, desc)| AtomicU64::new(desc.capacity))
            .collect();
        Self {
            host: MockHost::new(topology.nr_cpus()),
            tunables: Tunables::new(&EasConfig::default(), nr_clusters),
            groups: GroupAggregator::new(nr_clusters),
            model,
            rqs,
            ceilings,
            topology,
        }
    }

    pub fn env(&self) -> PlacementEnv<'_> {
        PlacementEnv::new(
            &self.topology,
            self.model.as_deref(),
            &self.tunables,
            &self.groups,
            &self.rqs,
            &self.ceilings,
            &self.host,
        )
    }

    /// Mark `cpu` busy with a fair task of `util` at `prio`.
    pub fn busy(&self, raw: u16, util: u64, prio: u8) {
        self.host.update_cpu(raw, |s| {
            s.idle = false;
            s.nr_running = 1;
            s.util = util;
            s.curr_policy = SchedPolicy::Normal;
            s.curr_prio = prio;
        });
    }
}

/// Fair wakeup of `task` that last ran on `prev`, woken from `prev`.
pub fn request(task: u64, prev: u16, util: u64) -> PlacementRequest {
    PlacementRequest {
        task: TaskId(task),
        prev_cpu: cpu(prev),
        this_cpu: cpu(prev),
        kind: PlacementKind::Wakeup,
        sync: false,
        waker: None,
        in_irq: false,
        policy: SchedPolicy::Normal,
        prio: 120,
        util_est: util,
        allowed: CpuMask::all(),
        recent_cpu: None,
    }
}
