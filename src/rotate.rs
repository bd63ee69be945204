//! Misfit migration and big task rotation
//!
//! Both run from the scheduler tick, at most once per CPU per tick, and
//! never hold a rq lock across a call that may take another one. Any
//! contention abandons the attempt; the next tick retries.

use crate::host::{MigrationReason, MigrationRequest, RunningTask, SchedulerHost};
use crate::percpu::try_lock_pair;
use crate::placement::{build_candidates, PlacementEnv, PlacementKind, PlacementRequest, SearchScope};
use crate::task::SchedulingExtension;
use crate::telemetry::{bump, Telemetry, TraceEvent};
use crate::topology::CpuId;

/// Rotation needs at least this many CPUs running a misfit task.
pub const ROTATION_MIN_HEAVY: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MisfitOutcome {
    /// Running task fits (or is not a fair task).
    Fits,
    /// Misfit, but it cannot or need not move (biggest CPU, pinned).
    Stuck,
    /// A migration off this CPU is already in flight.
    Busy,
    NoTarget,
    Requested(CpuId),
    /// The host refused the migration request.
    Rejected(CpuId),
}

fn clear_misfit(env: &PlacementEnv<'_>, cpu: CpuId) {
    if let Some(rq) = env.rqs.get(cpu) {
        rq.lock().misfit = false;
        rq.set_misfit_since(None);
    }
}

/// Check whether the task running on `cpu` outgrew it and, if so, ask the
/// host to move it to a strictly bigger CPU.
pub fn misfit_check(
    env: &PlacementEnv<'_>,
    host: &dyn SchedulerHost,
    telemetry: &Telemetry,
    cpu: CpuId,
    running: &RunningTask,
    ext: Option<&SchedulingExtension>,
    now: u64,
) -> MisfitOutcome {
    let (Some(rq), Some(cluster)) = (env.rqs.get(cpu), env.topology.cluster_of(cpu)) else {
        return MisfitOutcome::Fits;
    };
    if !running.policy.is_fair() {
        clear_misfit(env, cpu);
        return MisfitOutcome::Fits;
    }

    let owned;
    let ext = match ext {
        Some(ext) => ext,
        None => {
            let mut fresh = SchedulingExtension::new(running.id);
            fresh.group.cgroup = running.group;
            owned = fresh;
            &owned
        }
    };
    let util = env.task_util(running.util, ext);
    let group = ext.effective_group().or(running.group);
    if env.task_fits_cluster(util, group, cluster) {
        clear_misfit(env, cpu);
        return MisfitOutcome::Fits;
    }

    rq.lock().misfit = true;
    if rq.misfit_since().is_none() {
        rq.set_misfit_since(Some(now));
    }
    if env.topology.is_max_capacity(cpu) || running.pinned {
        return MisfitOutcome::Stuck;
    }
    if rq.active_balance() {
        return MisfitOutcome::Busy;
    }

    let req = PlacementRequest {
        task: running.id,
        prev_cpu: cpu,
        this_cpu: cpu,
        kind: PlacementKind::Balance,
        sync: false,
        waker: None,
        in_irq: false,
        policy: running.policy,
        prio: running.prio,
        util_est: running.util,
        allowed: running.allowed,
        recent_cpu: None,
    };
    let set = build_candidates(env, &req, ext, util, SearchScope::Misfit { from: cluster });
    let Some(dst) = set.order.first().copied().or_else(|| set.safety_net()) else {
        return MisfitOutcome::NoTarget;
    };

    if !rq.claim_active_balance() {
        return MisfitOutcome::Busy;
    }
    let queued = host.request_active_migration(MigrationRequest {
        src: cpu,
        dst,
        task: running.id,
        reason: MigrationReason::Misfit,
    });
    if !queued {
        rq.release_active_balance();
    }

    bump(&telemetry.cpu(cpu).misfit_requests);
    if env.tunables.telemetry() {
        telemetry.record(TraceEvent::Misfit {
            at: now,
            task: running.id,
            src: cpu,
            dst,
            queued,
        });
    }
    crate::kdebug!("eas: misfit {} {} -> {} queued={}", running.id, cpu, dst, queued);

    if queued {
        MisfitOutcome::Requested(dst)
    } else {
        MisfitOutcome::Rejected(dst)
    }
}

/// Number of online CPUs currently running a misfit task.
pub fn heavy_count(env: &PlacementEnv<'_>) -> usize {
    env.rqs
        .iter_online()
        .filter(|(_, rq)| rq.misfit_since().is_some())
        .count()
}

/// Non-max CPU whose misfit task has waited longest.
fn longest_waiting(env: &PlacementEnv<'_>) -> Option<CpuId> {
    env.rqs
        .iter_online()
        .filter(|(cpu, _)| !env.topology.is_max_capacity(*cpu))
        .filter_map(|(cpu, rq)| rq.misfit_since().map(|since| (since, cpu)))
        .min()
        .map(|(_, cpu)| cpu)
}

/// Swap the misfit task of `cpu` with a long-running task of a max
/// capacity CPU. Both tasks must be rotation candidates. Returns the
/// `(small, big)` pair on success.
pub fn try_rotate(
    env: &PlacementEnv<'_>,
    host: &dyn SchedulerHost,
    telemetry: &Telemetry,
    cpu: CpuId,
    now: u64,
) -> Option<(CpuId, CpuId)> {
    if !env.tunables.rotation_enabled() || heavy_count(env) < ROTATION_MIN_HEAVY {
        return None;
    }
    if env.topology.is_max_capacity(cpu) || longest_waiting(env) != Some(cpu) {
        return None;
    }
    let small_rq = env.rqs.get(cpu)?;
    let small_task = host.running_task(cpu)?;
    if !small_task.rotation_candidate
        || !small_task.policy.is_fair()
        || small_task.pinned
        || !env.available(cpu)
    {
        return None;
    }

    let threshold = env.tunables.rotation_threshold_ns();
    let big_cluster = env.topology.max_capacity_cluster();
    let big = env.topology.cluster_cpus(big_cluster).iter_cpus().find(|big| {
        let Some(rq) = env.rqs.get(*big) else {
            return false;
        };
        if !env.available(*big) || rq.active_balance() {
            return false;
        }
        if env.snapshot(*big).map(|s| s.nr_running != 1).unwrap_or(true) {
            return false;
        }
        match host.running_task(*big) {
            Some(task) => {
                task.rotation_candidate
                    && task.policy.is_fair()
                    && !task.pinned
                    && now.saturating_sub(task.run_start_ns) > threshold
                    && task.allowed.test(cpu)
                    && small_task.allowed.test(*big)
            }
            None => false,
        }
    })?;
    let big_rq = env.rqs.get(big)?;

    if !small_rq.claim_active_balance() {
        return None;
    }
    if !big_rq.claim_active_balance() {
        small_rq.release_active_balance();
        return None;
    }

    let swapped = match try_lock_pair(small_rq, big_rq) {
        Some(mut pair) => {
            let swapped = host.swap_running_tasks(cpu, big);
            if swapped {
                let (small_state, _) = pair.split();
                small_state.misfit = false;
            }
            swapped
        }
        None => false,
    };
    if swapped {
        small_rq.set_misfit_since(None);
    }
    small_rq.release_active_balance();
    big_rq.release_active_balance();

    if !swapped {
        return None;
    }
    bump(&telemetry.cpu(cpu).rotations);
    if env.tunables.telemetry() {
        telemetry.record(TraceEvent::Rotation {
            at: now,
            small: cpu,
            big,
        });
    }
    crate::kdebug!("eas: rotate {} <-> {}", cpu, big);
    Some((cpu, big))
}
