//! Per-task scheduling extension
//!
//! The host embeds one [`SchedulingExtension`] in each task record and
//! passes it by reference to the engine. Each concern is its own struct.

use core::fmt;

use bitflags::bitflags;

use crate::flt::{GroupId, LoadWindow};
use crate::topology::{CpuMask, Topology};

/// Host task identifier, used only for logging and telemetry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task{}", self.0)
    }
}

/// VIP priority tier. Higher tiers win placement ties.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VipTier {
    #[default]
    None,
    Vip,
    /// Spread across CPUs: placed on the CPU running the fewest VIP tasks.
    Vvip,
}

bitflags! {
    /// Policy annotations of a task.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TaskFlags: u32 {
        const LATENCY_SENSITIVE = 1 << 0;
        const ROTATION_CANDIDATE = 1 << 1;
        /// Per-CPU kernel thread (bound to a single CPU).
        const PER_CPU_KTHREAD = 1 << 2;
    }
}

impl Default for TaskFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// VIP / latency annotations set by the policy layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VipTag {
    pub tier: VipTier,
    pub flags: TaskFlags,
    /// Preferred CPUs of a latency-sensitive task.
    pub soft_affinity: Option<CpuMask>,
}

impl VipTag {
    #[inline]
    pub fn latency_sensitive(&self) -> bool {
        self.flags.contains(TaskFlags::LATENCY_SENSITIVE)
    }

    #[inline]
    pub fn is_vip(&self) -> bool {
        self.tier != VipTier::None
    }

    #[inline]
    pub fn rotation_candidate(&self) -> bool {
        self.flags.contains(TaskFlags::ROTATION_CANDIDATE)
    }
}

/// Preferred cluster search window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GearHints {
    /// First cluster to search; `None` derives it from capacity fit.
    pub gear_start: Option<usize>,
    /// Number of clusters to visit. 0 means all of them.
    pub num_gear: usize,
    /// Walk towards smaller clusters instead of bigger ones.
    pub reverse: bool,
}

/// Group membership: a per-task override beats the cgroup's group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupMembership {
    pub cgroup: Option<GroupId>,
    pub custom: Option<GroupId>,
}

impl GroupMembership {
    #[inline]
    pub fn effective(&self) -> Option<GroupId> {
        self.custom.or(self.cgroup)
    }
}

/// Rotation bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RotationStamp {
    /// When the task last started running; hosts report it as
    /// [`crate::host::RunningTask::run_start_ns`].
    pub run_start: u64,
    pub rotations: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulingExtension {
    pub id: TaskId,
    pub load: LoadWindow,
    pub vip: VipTag,
    pub hints: GearHints,
    pub group: GroupMembership,
    pub rotation: RotationStamp,
}

impl SchedulingExtension {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn set_vip_tier(&mut self, tier: VipTier) -> bool {
        self.vip.tier = tier;
        true
    }

    pub fn set_latency_sensitive(&mut self, enabled: bool) -> bool {
        self.vip.flags.set(TaskFlags::LATENCY_SENSITIVE, enabled);
        true
    }

    /// Hosts report this flag in [`crate::host::RunningTask`].
    pub fn set_rotation_candidate(&mut self, enabled: bool) -> bool {
        self.vip.flags.set(TaskFlags::ROTATION_CANDIDATE, enabled);
        true
    }

    pub fn set_per_cpu_kthread(&mut self, enabled: bool) -> bool {
        self.vip.flags.set(TaskFlags::PER_CPU_KTHREAD, enabled);
        true
    }

    /// `None` clears the soft affinity. A mask must be non-empty and lie
    /// inside the topology.
    pub fn set_soft_affinity(&mut self, mask: Option<CpuMask>, topology: &Topology) -> bool {
        if let Some(mask) = mask {
            if mask.is_empty() || !mask.is_subset_of(&topology.possible_mask()) {
                return false;
            }
        }
        self.vip.soft_affinity = mask;
        true
    }

    pub fn set_gear_hints(&mut self, hints: GearHints, topology: &Topology) -> bool {
        if let Some(start) = hints.gear_start {
            if start >= topology.nr_clusters() || hints.num_gear == 0 {
                return false;
            }
        }
        self.hints = hints;
        true
    }

    /// Group changes of a queued task must go through
    /// [`crate::EasEngine::set_task_group`] so the per-CPU counters follow.
    pub fn set_custom_group(&mut self, group: Option<u8>) -> bool {
        match group {
            Some(raw) => match GroupId::new(raw) {
                Some(group) => self.group.custom = Some(group),
                None => return false,
            },
            None => self.group.custom = None,
        }
        true
    }

    pub fn set_cgroup_group(&mut self, group: Option<u8>) -> bool {
        match group {
            Some(raw) => match GroupId::new(raw) {
                Some(group) => self.group.cgroup = Some(group),
                None => return false,
            },
            None => self.group.cgroup = None,
        }
        true
    }

    #[inline]
    pub fn effective_group(&self) -> Option<GroupId> {
        self.group.effective()
    }
}
