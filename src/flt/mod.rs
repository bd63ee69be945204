//! Fast load tracking (FLT)
//!
//! Windowed busy-time accounting for tasks, CPUs and (CPU, group) pairs.
//!
//! ## Locking
//!
//! A CPU's [`CpuLoad`] is only written with that CPU's rq lock held (it
//! lives inside [`crate::percpu::RqState`]). A task's window is written by
//! whichever CPU currently owns the task, under that CPU's rq lock.
//! Migration moves in-flight time with both rq locks held, see
//! [`fixup_busy_time`].

pub mod group;
pub mod window;

pub use group::{GroupId, GroupLoad, GROUP_COUNT};
pub use window::{
    HistorySlot, LoadWindow, Scale, WindowState, WindowUpdate, DEFAULT_WINDOW_NS,
    FLT_HISTORY_DEPTH,
};

use crate::tunables::FltMode;

/// Scheduler event that triggered an accounting update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FltEvent {
    /// The task stops running on the CPU.
    PutPrev,
    /// The task starts running on the CPU.
    PickNext,
    /// The task wakes up after sleeping.
    Wake,
    /// The task moves to another CPU.
    Migrate,
    /// Periodic update of the running task (tick).
    Update,
    /// Interrupt time observed on the CPU.
    IrqUpdate,
}

impl FltEvent {
    pub const fn as_str(self) -> &'static str {
        match self {
            FltEvent::PutPrev => "put_prev",
            FltEvent::PickNext => "pick_next",
            FltEvent::Wake => "wake",
            FltEvent::Migrate => "migrate",
            FltEvent::Update => "update",
            FltEvent::IrqUpdate => "irq_update",
        }
    }
}

/// What the CPU was running during the interval being accounted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuCurr {
    Idle,
    Task { group: Option<GroupId> },
}

/// Load state of one CPU: the aggregate window plus per-group windows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuLoad {
    pub window: LoadWindow,
    pub groups: GroupLoad,
}

impl CpuLoad {
    pub const fn new() -> Self {
        Self {
            window: LoadWindow::new(),
            groups: GroupLoad::new(),
        }
    }

    pub fn reset(&mut self) {
        self.window.reset();
        self.groups.reset();
    }

    #[inline]
    pub fn demand(&self) -> u64 {
        windowed_demand(&self.window)
    }

    #[inline]
    pub fn group_demand(&self, group: GroupId) -> u64 {
        windowed_demand(self.groups.window(group))
    }
}

/// Entity an accounting update applies to.
pub enum FltEntity<'a> {
    Task(&'a mut LoadWindow),
    Cpu { load: &'a mut CpuLoad, curr: CpuCurr },
}

/// Per-call accounting parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FltContext {
    pub mode: FltMode,
    pub window_ns: u64,
    /// Scale of the CPU the time was spent on.
    pub scale: Scale,
}

/// Account runtime for `entity` up to `wallclock`.
///
/// Returns `None` when the current mode does not track this kind of entity.
/// A `wallclock` that does not advance is logged and skipped.
pub fn record_runtime(
    entity: FltEntity<'_>,
    event: FltEvent,
    wallclock: u64,
    irq_time: u64,
    ctx: &FltContext,
) -> Option<WindowUpdate> {
    let result = match entity {
        FltEntity::Task(window) => {
            if ctx.mode != FltMode::TaskAndCpu {
                return None;
            }
            let busy = match event {
                FltEvent::PutPrev | FltEvent::Update => u64::MAX,
                _ => 0,
            };
            let last = window.mark_start();
            let result = window.update(wallclock, ctx.window_ns, busy, ctx.scale);
            if result == WindowUpdate::Skipped {
                log_skip("task", event, wallclock, last);
            }
            result
        }
        FltEntity::Cpu { load, curr } => {
            if ctx.mode == FltMode::Disabled {
                return None;
            }
            let busy = match (event, curr) {
                (FltEvent::IrqUpdate, _) => irq_time,
                (FltEvent::PutPrev | FltEvent::Update, CpuCurr::Task { .. }) => u64::MAX,
                _ => 0,
            };
            let running_group = match curr {
                CpuCurr::Task { group } => group,
                CpuCurr::Idle => None,
            };

            let last = load.window.mark_start();
            let result = load.window.update(wallclock, ctx.window_ns, busy, ctx.scale);
            for (group, window) in load.groups.windows_mut() {
                let group_busy = if running_group == Some(group) && event != FltEvent::IrqUpdate {
                    busy
                } else {
                    0
                };
                window.update(wallclock, ctx.window_ns, group_busy, ctx.scale);
            }
            if result == WindowUpdate::Skipped {
                log_skip("cpu", event, wallclock, last);
            }
            result
        }
    };
    Some(result)
}

fn log_skip(entity: &str, event: FltEvent, wallclock: u64, last: u64) {
    if wallclock < last {
        crate::ktrace!(
            "flt: {} clock went backwards ({} < {}) on {}",
            entity,
            wallclock,
            last,
            event.as_str()
        );
    } else {
        crate::ktrace!("flt: {} clock did not advance ({}) on {}", entity, wallclock, event.as_str());
    }
}

/// One side of a migration.
pub struct CpuSide<'a> {
    pub load: &'a mut CpuLoad,
    pub curr: CpuCurr,
    pub scale: Scale,
}

/// Move a migrating task's in-flight window contribution from `src` to `dst`.
///
/// Both CPUs' rq locks must be held. Both CPU windows and the task window
/// are first brought up to `wallclock` so all three share the same window
/// boundaries.
pub fn fixup_busy_time(
    task: &mut LoadWindow,
    group: Option<GroupId>,
    src: CpuSide<'_>,
    dst: CpuSide<'_>,
    wallclock: u64,
    mode: FltMode,
    window_ns: u64,
) -> bool {
    if mode != FltMode::TaskAndCpu || !task.is_active() {
        return false;
    }

    let src_ctx = FltContext {
        mode,
        window_ns,
        scale: src.scale,
    };
    let dst_ctx = FltContext {
        mode,
        window_ns,
        scale: dst.scale,
    };

    record_runtime(
        FltEntity::Cpu {
            load: &mut *src.load,
            curr: src.curr,
        },
        FltEvent::Update,
        wallclock,
        0,
        &src_ctx,
    );
    record_runtime(
        FltEntity::Cpu {
            load: &mut *dst.load,
            curr: dst.curr,
        },
        FltEvent::Update,
        wallclock,
        0,
        &dst_ctx,
    );
    record_runtime(
        FltEntity::Task(&mut *task),
        FltEvent::Migrate,
        wallclock,
        0,
        &src_ctx,
    );

    let curr = task.curr_sum();
    let prev = task.prev_sum();

    src.load.window.subtract(curr, prev, window_ns);
    dst.load.window.add(curr, prev, window_ns);
    if let Some(group) = group {
        src.load.groups.window_mut(group).subtract(curr, prev, window_ns);
        dst.load.groups.window_mut(group).add(curr, prev, window_ns);
    }
    true
}

/// Most recent consolidated window of `window` in capacity units.
#[inline]
pub fn windowed_demand(window: &LoadWindow) -> u64 {
    window.demand()
}
