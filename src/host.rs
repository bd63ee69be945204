//! Host scheduler interfaces
//!
//! The base scheduler implements [`SchedulerHost`] and calls the engine
//! through [`SchedulerEventSink`]. Both directions are plain synchronous
//! calls; nothing here blocks or allocates on the hot paths.

use crate::error::Timeout;
use crate::flt::GroupId;
use crate::placement::{Placement, PlacementRequest};
use crate::task::{SchedulingExtension, TaskId};
use crate::topology::{CpuId, CpuMask};

/// Scheduling class of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    Normal,
    Realtime,
    Batch,
    Idle,
}

impl SchedPolicy {
    /// Policies handled by the fair class.
    #[inline]
    pub fn is_fair(self) -> bool {
        matches!(self, SchedPolicy::Normal | SchedPolicy::Batch)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SchedPolicy::Realtime => "RT",
            SchedPolicy::Normal => "Normal",
            SchedPolicy::Batch => "Batch",
            SchedPolicy::Idle => "Idle",
        }
    }
}

/// Lowest (least important) priority value. 0 is the most important.
pub const MAX_PRIO: u8 = 139;
/// Realtime priorities are `0..MAX_RT_PRIO`.
pub const MAX_RT_PRIO: u8 = 100;

/// Host view of one CPU at the time of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub online: bool,
    /// Paused CPUs take no new work.
    pub paused: bool,
    /// Idle, or only running the idle task.
    pub idle: bool,
    /// Exit latency of the idle state the CPU is in (0 when shallow/busy).
    pub idle_exit_latency: u32,
    pub nr_running: u32,
    pub rt_nr_running: u32,
    /// VIP tasks queued or running on the CPU.
    pub nr_vip: u32,
    /// Host utilisation estimate of the fair class, capacity units.
    pub util: u64,
    /// Interrupt utilisation, capacity units.
    pub irq_util: u64,
    pub curr_policy: SchedPolicy,
    pub curr_prio: u8,
    pub temperature_c: Option<i32>,
    pub cur_freq_khz: u32,
}

impl CpuSnapshot {
    pub const fn idle() -> Self {
        Self {
            online: true,
            paused: false,
            idle: true,
            idle_exit_latency: 0,
            nr_running: 0,
            rt_nr_running: 0,
            nr_vip: 0,
            util: 0,
            irq_util: 0,
            curr_policy: SchedPolicy::Idle,
            curr_prio: MAX_PRIO,
            temperature_c: None,
            cur_freq_khz: 0,
        }
    }

    #[inline]
    pub fn available(&self) -> bool {
        self.online && !self.paused
    }
}

impl Default for CpuSnapshot {
    fn default() -> Self {
        Self::idle()
    }
}

/// The task currently running on a CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunningTask {
    pub id: TaskId,
    pub policy: SchedPolicy,
    pub prio: u8,
    /// Host utilisation estimate, capacity units.
    pub util: u64,
    pub group: Option<GroupId>,
    /// Start of the current uninterrupted run.
    pub run_start_ns: u64,
    /// Task may not leave its CPU (migration disabled, per-CPU kthread).
    pub pinned: bool,
    /// Policy marked the task for big task rotation.
    pub rotation_candidate: bool,
    pub allowed: CpuMask,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationReason {
    Misfit,
}

/// One-shot stop-task migration of the task running on `src`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MigrationRequest {
    pub src: CpuId,
    pub dst: CpuId,
    pub task: TaskId,
    pub reason: MigrationReason,
}

/// Capabilities the base scheduler provides to the engine.
pub trait SchedulerHost: Send + Sync {
    fn cpu_state(&self, cpu: CpuId) -> CpuSnapshot;

    fn running_task(&self, cpu: CpuId) -> Option<RunningTask>;

    /// Queue a one-shot migration on `req.src`. The host reports completion
    /// with [`crate::EasEngine::active_migration_done`]. Returns false if
    /// the request could not be queued.
    fn request_active_migration(&self, req: MigrationRequest) -> bool;

    /// Exchange the running tasks of `a` and `b`. Called with both rq
    /// locks held by the engine; returns false if the swap was not possible.
    fn swap_running_tasks(&self, a: CpuId, b: CpuId) -> bool;

    /// Suspend-aware monotonic clock in ns. Must match the `wallclock`
    /// passed to the events.
    fn now_ns(&self) -> u64;
}

/// Scheduler events consumed by the engine.
///
/// Every `wallclock` comes from [`SchedulerHost::now_ns`]: time spent
/// suspended must not show up as elapsed, or the load windows read a
/// suspend as a long gap and replay it as full windows.
pub trait SchedulerEventSink {
    /// Periodic tick on `cpu`. `curr` is the running fair/RT task, if any.
    fn on_tick(&self, cpu: CpuId, curr: Option<&mut SchedulingExtension>, wallclock: u64);

    /// Pick a CPU for a waking, forked or exec'ing task.
    fn on_wakeup(&self, req: &PlacementRequest, task: &mut SchedulingExtension) -> Placement;

    fn on_enqueue(&self, cpu: CpuId, task: &mut SchedulingExtension, wallclock: u64);

    fn on_dequeue(&self, cpu: CpuId, task: &mut SchedulingExtension, wallclock: u64);

    /// `task` moves from `src` to `dst`. Called with both rq locks held by
    /// the host, before the task is enqueued on `dst`.
    fn on_migrate(&self, src: CpuId, dst: CpuId, task: &mut SchedulingExtension, wallclock: u64);

    /// `prev` stops and `next` starts running on `cpu`. `None` is the idle task.
    fn on_context_switch(
        &self,
        cpu: CpuId,
        prev: Option<&mut SchedulingExtension>,
        next: Option<&mut SchedulingExtension>,
        wallclock: u64,
    );

    /// `irq_ns` of interrupt time ended at `wallclock` on `cpu`.
    fn on_irq_time(&self, cpu: CpuId, irq_ns: u64, wallclock: u64);

    fn on_cpu_online(&self, cpu: CpuId);

    /// Waits for in-flight active migrations off `cpu` until `deadline_ns`.
    fn on_cpu_offline(&self, cpu: CpuId, deadline_ns: u64) -> Result<(), Timeout>;
}
