//! Realtime class placement
//!
//! Clusters are walked in capacity order. Preference: an idle CPU in the
//! shallowest idle state, then the CPU running the least important fair
//! task, then the CPU running the least important lower-priority RT task.

use alloc::vec::Vec;

use crate::estimate::energy_delta;
use crate::host::SchedPolicy;
use crate::placement::{Decision, Placement, PlacementEnv, PlacementPath, PlacementRequest};
use crate::topology::{CpuId, CpuMask};

/// Pick a CPU for a realtime task.
pub fn select_rt_cpu(env: &PlacementEnv<'_>, req: &PlacementRequest, util: u64) -> Decision {
    let mut idle: Vec<(CpuId, u32)> = Vec::new();
    let mut best_fair: Option<(CpuId, u8)> = None;
    let mut best_rt: Option<(CpuId, u8)> = None;
    let mut candidates = CpuMask::empty();

    for (_, desc) in env.topology.clusters() {
        for cpu in desc.cpus.iter_cpus() {
            if !req.allowed.test(cpu) || !env.available(cpu) {
                continue;
            }
            let Some(snapshot) = env.snapshot(cpu) else {
                continue;
            };
            if env.is_idle(cpu) {
                let latency = snapshot.idle_exit_latency;
                match idle.first().map(|(_, best)| *best) {
                    Some(best) if latency > best => {}
                    Some(best) if latency < best => {
                        idle.clear();
                        idle.push((cpu, latency));
                    }
                    _ => idle.push((cpu, latency)),
                }
            } else if snapshot.curr_policy != SchedPolicy::Realtime {
                if best_fair.map(|(_, p)| snapshot.curr_prio > p).unwrap_or(true) {
                    best_fair = Some((cpu, snapshot.curr_prio));
                }
            } else if snapshot.curr_prio > req.prio
                && best_rt.map(|(_, p)| snapshot.curr_prio > p).unwrap_or(true)
            {
                best_rt = Some((cpu, snapshot.curr_prio));
            }
        }
    }

    for (cpu, _) in &idle {
        candidates.set(cpu.index());
    }

    let mut decision = Decision {
        placement: Placement::new(None, PlacementPath::NotFound),
        candidates,
        energy: None,
        energy_evals: 0,
    };

    if let Some(&(first, _)) = idle.first() {
        let first_cluster = env.topology.cluster_of(first);
        let spans_clusters = idle
            .iter()
            .any(|(cpu, _)| env.topology.cluster_of(*cpu) != first_cluster);

        let mut chosen = (first, None);
        if spans_clusters {
            if let Some(mut energy) = env.energy_env(util, None) {
                let mut best: Option<(CpuId, u64)> = None;
                for (cpu, _) in &idle {
                    let Some(delta) = energy_delta(&mut energy, *cpu) else {
                        continue;
                    };
                    decision.energy_evals += 1;
                    if best.map(|(_, b)| delta < b).unwrap_or(true) {
                        best = Some((*cpu, delta));
                    }
                }
                if let Some((cpu, delta)) = best {
                    chosen = (cpu, Some(delta));
                }
            }
        }
        decision.energy = chosen.1;
        decision.placement = Placement::new(Some(chosen.0), PlacementPath::RtIdle);
    } else if let Some((cpu, _)) = best_fair {
        decision.placement = Placement::new(Some(cpu), PlacementPath::RtPreemptFair);
    } else if let Some((cpu, _)) = best_rt {
        decision.placement = Placement::new(Some(cpu), PlacementPath::RtPreemptRt);
    } else if req.allowed.test(req.prev_cpu) && env.available(req.prev_cpu) {
        decision.placement = Placement::new(Some(req.prev_cpu), PlacementPath::RtPrev);
    }

    crate::ktrace!(
        "eas: rt {} -> {:?} ({})",
        req.task,
        decision.placement.cpu,
        decision.placement.path.as_str()
    );
    decision
}
