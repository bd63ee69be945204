//! Runtime control surface
//!
//! Every knob is an atomic so the policy layer can flip it while scheduler
//! paths read it without locks. Setters validate their input and return
//! `false` (leaving the old value untouched) when it is out of range.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::config::EasConfig;
use crate::flt::{GroupId, GROUP_COUNT};
use crate::topology::ClusterId;
use crate::SCHED_CAPACITY_SCALE;

pub const MIN_MARGIN: u64 = SCHED_CAPACITY_SCALE;
pub const MAX_MARGIN: u64 = 2 * SCHED_CAPACITY_SCALE;
pub const MIN_ROTATION_THRESHOLD_NS: u64 = 1_000_000;
pub const MAX_ROTATION_THRESHOLD_NS: u64 = 100_000_000;
pub const MIN_WINDOW_NS: u64 = 1_000_000;
pub const MAX_WINDOW_NS: u64 = 100_000_000;

/// Which entities the load tracker accounts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FltMode {
    Disabled,
    CpuOnly,
    TaskAndCpu,
}

impl FltMode {
    const fn to_raw(self) -> u8 {
        match self {
            FltMode::Disabled => 0,
            FltMode::CpuOnly => 1,
            FltMode::TaskAndCpu => 2,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => FltMode::Disabled,
            1 => FltMode::CpuOnly,
            _ => FltMode::TaskAndCpu,
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "0" | "off" | "disabled" => Some(FltMode::Disabled),
            "1" | "cpu" => Some(FltMode::CpuOnly),
            "2" | "full" | "task" => Some(FltMode::TaskAndCpu),
            _ => None,
        }
    }
}

/// Up/down migration percentages of one cluster.
struct ClusterMargins {
    up_pct: AtomicU32,
    down_pct: AtomicU32,
}

pub struct Tunables {
    flt_mode: AtomicU8,
    window_ns: u64,
    rotation: AtomicBool,
    group_aware_dvfs: AtomicBool,
    adaptive_margin: AtomicBool,
    force_margin: AtomicBool,
    manual_margin: AtomicU64,
    group_threshold_pct: [AtomicU32; GROUP_COUNT],
    clusters: Vec<ClusterMargins>,
    rotation_threshold_ns: AtomicU64,
    high_irq_pct: AtomicU32,
    telemetry: AtomicBool,
}

#[inline]
fn pct_in_range(pct: u32) -> bool {
    (1..=100).contains(&pct)
}

impl Tunables {
    /// Boot values come from `config`, which has already been range-checked.
    pub fn new(config: &EasConfig, nr_clusters: usize) -> Self {
        let clusters = (0..nr_clusters)
            .map(|_| ClusterMargins {
                up_pct: AtomicU32::new(config.up_pct),
                down_pct: AtomicU32::new(config.down_pct),
            })
            .collect();

        Self {
            flt_mode: AtomicU8::new(config.flt_mode.to_raw()),
            window_ns: config.window_ns,
            rotation: AtomicBool::new(config.rotation),
            group_aware_dvfs: AtomicBool::new(config.group_aware_dvfs),
            adaptive_margin: AtomicBool::new(config.adaptive_margin),
            force_margin: AtomicBool::new(config.manual_margin.is_some()),
            manual_margin: AtomicU64::new(config.manual_margin.unwrap_or(MIN_MARGIN)),
            group_threshold_pct: core::array::from_fn(|idx| {
                AtomicU32::new(config.group_threshold_pct[idx])
            }),
            clusters,
            rotation_threshold_ns: AtomicU64::new(config.rotation_threshold_ns),
            high_irq_pct: AtomicU32::new(config.high_irq_pct),
            telemetry: AtomicBool::new(config.telemetry),
        }
    }

    // ------------------------------------------------------------------
    // Load tracking
    // ------------------------------------------------------------------

    pub fn flt_mode(&self) -> FltMode {
        FltMode::from_raw(self.flt_mode.load(Ordering::Relaxed))
    }

    pub fn set_flt_mode(&self, mode: FltMode) -> bool {
        self.flt_mode.store(mode.to_raw(), Ordering::Relaxed);
        true
    }

    /// Window length is fixed at boot: all windows share its boundaries.
    #[inline]
    pub fn window_ns(&self) -> u64 {
        self.window_ns
    }

    // ------------------------------------------------------------------
    // Rotation
    // ------------------------------------------------------------------

    pub fn rotation_enabled(&self) -> bool {
        self.rotation.load(Ordering::Relaxed)
    }

    pub fn set_rotation(&self, enabled: bool) -> bool {
        self.rotation.store(enabled, Ordering::Relaxed);
        true
    }

    pub fn rotation_threshold_ns(&self) -> u64 {
        self.rotation_threshold_ns.load(Ordering::Relaxed)
    }

    pub fn set_rotation_threshold_ns(&self, threshold_ns: u64) -> bool {
        if !(MIN_ROTATION_THRESHOLD_NS..=MAX_ROTATION_THRESHOLD_NS).contains(&threshold_ns) {
            return false;
        }
        self.rotation_threshold_ns
            .store(threshold_ns, Ordering::Relaxed);
        true
    }

    // ------------------------------------------------------------------
    // Group aware DVFS and margins
    // ------------------------------------------------------------------

    pub fn group_aware_dvfs(&self) -> bool {
        self.group_aware_dvfs.load(Ordering::Relaxed)
    }

    pub fn set_group_aware_dvfs(&self, enabled: bool) -> bool {
        self.group_aware_dvfs.store(enabled, Ordering::Relaxed);
        true
    }

    pub fn adaptive_margin(&self) -> bool {
        self.adaptive_margin.load(Ordering::Relaxed)
    }

    pub fn set_adaptive_margin(&self, enabled: bool) -> bool {
        self.adaptive_margin.store(enabled, Ordering::Relaxed);
        true
    }

    /// Manual margin, if the override is active.
    pub fn forced_margin(&self) -> Option<u64> {
        if self.force_margin.load(Ordering::Acquire) {
            Some(self.manual_margin.load(Ordering::Relaxed))
        } else {
            None
        }
    }

    /// `Some(margin)` installs a manual margin for every group and cluster,
    /// `None` returns to the computed margins.
    pub fn set_forced_margin(&self, margin: Option<u64>) -> bool {
        match margin {
            Some(margin) => {
                if !(MIN_MARGIN..=MAX_MARGIN).contains(&margin) {
                    return false;
                }
                self.manual_margin.store(margin, Ordering::Relaxed);
                self.force_margin.store(true, Ordering::Release);
            }
            None => self.force_margin.store(false, Ordering::Release),
        }
        true
    }

    pub fn group_threshold_pct(&self, group: GroupId) -> u32 {
        self.group_threshold_pct[group.index()].load(Ordering::Relaxed)
    }

    pub fn set_group_threshold_pct(&self, group: GroupId, pct: u32) -> bool {
        if pct > 100 {
            return false;
        }
        self.group_threshold_pct[group.index()].store(pct, Ordering::Relaxed);
        true
    }

    // ------------------------------------------------------------------
    // Migration percentages
    // ------------------------------------------------------------------

    /// A task fits a CPU of `cluster` when `util * 100 < capacity * up_pct`.
    pub fn up_pct(&self, cluster: ClusterId) -> u32 {
        self.clusters
            .get(cluster.index())
            .map(|c| c.up_pct.load(Ordering::Relaxed))
            .unwrap_or(100)
    }

    /// Stricter margin used when deciding that a smaller cluster is enough.
    pub fn down_pct(&self, cluster: ClusterId) -> u32 {
        self.clusters
            .get(cluster.index())
            .map(|c| c.down_pct.load(Ordering::Relaxed))
            .unwrap_or(100)
    }

    pub fn set_migration_pct(&self, cluster: ClusterId, up_pct: u32, down_pct: u32) -> bool {
        let Some(margins) = self.clusters.get(cluster.index()) else {
            return false;
        };
        if !pct_in_range(up_pct) || !pct_in_range(down_pct) {
            return false;
        }
        margins.up_pct.store(up_pct, Ordering::Relaxed);
        margins.down_pct.store(down_pct, Ordering::Relaxed);
        true
    }

    // ------------------------------------------------------------------
    // Misc
    // ------------------------------------------------------------------

    pub fn high_irq_pct(&self) -> u32 {
        self.high_irq_pct.load(Ordering::Relaxed)
    }

    pub fn set_high_irq_pct(&self, pct: u32) -> bool {
        if !pct_in_range(pct) {
            return false;
        }
        self.high_irq_pct.store(pct, Ordering::Relaxed);
        true
    }

    pub fn telemetry(&self) -> bool {
        self.telemetry.load(Ordering::Relaxed)
    }

    pub fn set_telemetry(&self, enabled: bool) -> bool {
        self.telemetry.store(enabled, Ordering::Relaxed);
        true
    }
}
