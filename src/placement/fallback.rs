//! Fallback chain
//!
//! Ordered heuristics for when energy comparison has nothing to work with.
//! The first step that yields a CPU wins.

use super::{Placement, PlacementEnv, PlacementKind, PlacementPath, PlacementRequest};
use crate::task::{SchedulingExtension, TaskFlags, VipTier};
use crate::topology::CpuId;

type Step = fn(&PlacementEnv<'_>, &PlacementRequest, &SchedulingExtension, u64) -> Option<CpuId>;

const CHAIN: [(Step, PlacementPath); 7] = [
    (vvip_balance, PlacementPath::VvipBalance),
    (wake_affine, PlacementPath::WakeAffine),
    (prev_idle, PlacementPath::PrevIdle),
    (kthread_stack, PlacementPath::KthreadStack),
    (recent_idle, PlacementPath::RecentIdle),
    (idle_fit, PlacementPath::IdleFit),
    (allowed_first, PlacementPath::AllowedFirst),
];

#[inline]
fn usable(env: &PlacementEnv<'_>, req: &PlacementRequest, cpu: CpuId) -> bool {
    req.allowed.test(cpu) && env.available(cpu)
}

/// VVIP tasks spread out: the CPU running the fewest VIP tasks, then the
/// fewest runnable tasks.
fn vvip_balance(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    ext: &SchedulingExtension,
    _util: u64,
) -> Option<CpuId> {
    if ext.vip.tier != VipTier::Vvip {
        return None;
    }
    env.topology
        .cpus()
        .filter(|cpu| usable(env, req, *cpu))
        .filter_map(|cpu| env.snapshot(cpu).map(|s| (cpu, s.nr_vip, s.nr_running)))
        .min_by_key(|(_, vip, running)| (*vip, *running))
        .map(|(cpu, _, _)| cpu)
}

fn wake_affine(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    ext: &SchedulingExtension,
    util: u64,
) -> Option<CpuId> {
    if req.kind != PlacementKind::Wakeup {
        return None;
    }
    let this = req.this_cpu;
    let prev = req.prev_cpu;
    if this == prev || !usable(env, req, this) {
        return None;
    }

    if env.is_idle(this) && env.topology.shares_cache(this, prev) {
        if usable(env, req, prev) && env.is_idle(prev) {
            return Some(prev);
        }
        return Some(this);
    }
    if req.sync && env.snapshot(this).map(|s| s.nr_running == 1).unwrap_or(false) {
        return Some(this);
    }
    if !usable(env, req, prev) {
        return None;
    }
    // load comparison: pull only when this CPU stays lighter than prev
    let group = ext.effective_group();
    let this_load = env.cpu_util(this).saturating_add(util);
    if this_load < env.cpu_util(prev) && env.task_fits_cpu(util, group, this) {
        return Some(this);
    }
    None
}

fn prev_idle(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    ext: &SchedulingExtension,
    util: u64,
) -> Option<CpuId> {
    let prev = req.prev_cpu;
    (usable(env, req, prev)
        && env.is_idle(prev)
        && env.task_fits_cpu(util, ext.effective_group(), prev))
    .then_some(prev)
}

/// Per-CPU kthreads stay where they are; tasks woken by a per-CPU kthread
/// on their own CPU stack behind it.
fn kthread_stack(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    ext: &SchedulingExtension,
    _util: u64,
) -> Option<CpuId> {
    let prev = req.prev_cpu;
    if !usable(env, req, prev) {
        return None;
    }
    if ext.vip.flags.contains(TaskFlags::PER_CPU_KTHREAD) {
        return Some(prev);
    }
    let woken_by_kthread = req.waker.map(|w| w.per_cpu_kthread).unwrap_or(false);
    let light = env.snapshot(prev).map(|s| s.nr_running <= 1).unwrap_or(false);
    (woken_by_kthread && req.this_cpu == prev && light).then_some(prev)
}

fn recent_idle(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    _ext: &SchedulingExtension,
    _util: u64,
) -> Option<CpuId> {
    req.recent_cpu
        .filter(|cpu| *cpu != req.prev_cpu)
        .filter(|cpu| usable(env, req, *cpu) && env.is_idle(*cpu))
}

/// First idle CPU that fits, smallest gear first.
fn idle_fit(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    ext: &SchedulingExtension,
    util: u64,
) -> Option<CpuId> {
    let group = ext.effective_group();
    env.topology.cpus().find(|cpu| {
        usable(env, req, *cpu) && env.is_idle(*cpu) && env.task_fits_cpu(util, group, *cpu)
    })
}

fn allowed_first(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    _ext: &SchedulingExtension,
    _util: u64,
) -> Option<CpuId> {
    req.allowed
        .iter_cpus()
        .find(|cpu| env.topology.contains(*cpu) && env.available(*cpu))
}

/// Run the chain; `NotFound` leaves the choice to the host.
pub fn run_fallback(
    env: &PlacementEnv<'_>,
    req: &PlacementRequest,
    ext: &SchedulingExtension,
    util: u64,
) -> Placement {
    for (step, path) in CHAIN {
        if let Some(cpu) = step(env, req, ext, util) {
            crate::ktrace!("eas: {} fallback {} -> {}", req.task, path.as_str(), cpu);
            return Placement::new(Some(cpu), path);
        }
    }
    crate::kdebug!("eas: {} no fallback cpu", req.task);
    Placement::new(None, PlacementPath::NotFound)
}
