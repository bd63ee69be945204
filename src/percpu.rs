//! Per-CPU state
//!
//! [`PerCpuArena`] stores one value per CPU of the topology, keyed by
//! [`CpuId`], with an explicit online/offline lifecycle. The engine keeps a
//! [`CpuRq`] per CPU in it: the load-tracking side of the host's run queue.
//!
//! ## Lock Hierarchy
//!
//! 1. `CpuRq::state` of the lower CPU index
//! 2. `CpuRq::state` of the higher CPU index
//! 3. atomics (`active_balance`, published demand, misfit stamp)
//!
//! Two rq states are only ever taken through [`lock_pair`]/[`try_lock_pair`].

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::error::Timeout;
use crate::flt::{CpuLoad, GroupId, GROUP_COUNT};
use crate::topology::{CpuId, CpuMask, Topology};

// ============================================================================
// Arena
// ============================================================================

struct Slot<T> {
    online: AtomicBool,
    value: T,
}

pub struct PerCpuArena<T> {
    slots: Vec<Option<Slot<T>>>,
    possible: CpuMask,
}

impl<T> PerCpuArena<T> {
    /// One value per CPU of `topology`, all offline.
    pub fn new(topology: &Topology, mut init: impl FnMut(CpuId) -> T) -> Self {
        let possible = topology.possible_mask();
        let len = topology.cpus().map(|cpu| cpu.index() + 1).max().unwrap_or(0);
        let mut slots = Vec::with_capacity(len);
        for idx in 0..len {
            let slot = CpuId::new(idx as u16)
                .filter(|cpu| possible.test(*cpu))
                .map(|cpu| Slot {
                    online: AtomicBool::new(false),
                    value: init(cpu),
                });
            slots.push(slot);
        }
        Self { slots, possible }
    }

    #[inline]
    fn slot(&self, cpu: CpuId) -> Option<&Slot<T>> {
        self.slots.get(cpu.index()).and_then(Option::as_ref)
    }

    /// Value of an online CPU.
    #[inline]
    pub fn get(&self, cpu: CpuId) -> Option<&T> {
        self.slot(cpu)
            .filter(|slot| slot.online.load(Ordering::Acquire))
            .map(|slot| &slot.value)
    }

    /// Value of any CPU of the topology, online or not.
    #[inline]
    pub fn get_any(&self, cpu: CpuId) -> Option<&T> {
        self.slot(cpu).map(|slot| &slot.value)
    }

    #[inline]
    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.slot(cpu)
            .map(|slot| slot.online.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Returns false for CPUs outside the topology or already online.
    pub fn online(&self, cpu: CpuId) -> bool {
        match self.slot(cpu) {
            Some(slot) => !slot.online.swap(true, Ordering::AcqRel),
            None => false,
        }
    }

    /// Returns false for CPUs outside the topology or already offline.
    pub fn offline(&self, cpu: CpuId) -> bool {
        match self.slot(cpu) {
            Some(slot) => slot.online.swap(false, Ordering::AcqRel),
            None => false,
        }
    }

    pub fn online_mask(&self) -> CpuMask {
        let mut mask = CpuMask::empty();
        for cpu in self.possible.iter_cpus() {
            if self.is_online(cpu) {
                mask.set(cpu.index());
            }
        }
        mask
    }

    pub fn iter_online(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.possible
            .iter_cpus()
            .filter_map(move |cpu| self.get(cpu).map(|value| (cpu, value)))
    }
}

// ============================================================================
// Run queue side state
// ============================================================================

/// Load-tracking state of one CPU, protected by the CPU's rq lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RqState {
    pub load: CpuLoad,
    /// Running task does not fit this CPU.
    pub misfit: bool,
}

impl RqState {
    pub const fn new() -> Self {
        Self {
            load: CpuLoad::new(),
            misfit: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[repr(align(64))]
pub struct CpuRq {
    pub cpu: CpuId,
    state: Mutex<RqState>,
    /// Set while an active migration off this CPU is in flight.
    pub active_balance: AtomicBool,
    /// When the running task became misfit here (0: none). Read lock-free by
    /// the rotation scan of other CPUs.
    misfit_since: AtomicU64,
    /// Last consolidated CPU demand, for lock-free readers.
    demand: AtomicU64,
    /// Last consolidated demand per group, read by the group aggregator.
    group_demand: [AtomicU64; GROUP_COUNT],
}

impl CpuRq {
    pub const fn new(cpu: CpuId) -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            cpu,
            state: Mutex::new(RqState::new()),
            active_balance: AtomicBool::new(false),
            misfit_since: AtomicU64::new(0),
            demand: AtomicU64::new(0),
            group_demand: [ZERO; GROUP_COUNT],
        }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, RqState> {
        self.state.lock()
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, RqState>> {
        self.state.try_lock()
    }

    /// Claim the migration slot of this CPU. Fails if a migration is
    /// already in flight.
    pub fn claim_active_balance(&self) -> bool {
        self.active_balance
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_active_balance(&self) {
        self.active_balance.store(false, Ordering::Release);
    }

    #[inline]
    pub fn active_balance(&self) -> bool {
        self.active_balance.load(Ordering::Acquire)
    }

    #[inline]
    pub fn misfit_since(&self) -> Option<u64> {
        match self.misfit_since.load(Ordering::Relaxed) {
            0 => None,
            since => Some(since),
        }
    }

    pub fn set_misfit_since(&self, since: Option<u64>) {
        self.misfit_since
            .store(since.map(|s| s.max(1)).unwrap_or(0), Ordering::Relaxed);
    }

    #[inline]
    pub fn published_demand(&self) -> u64 {
        self.demand.load(Ordering::Relaxed)
    }

    pub fn publish_demand(&self, demand: u64) {
        self.demand.store(demand, Ordering::Relaxed);
    }

    #[inline]
    pub fn published_group_demand(&self, group: GroupId) -> u64 {
        self.group_demand[group.index()].load(Ordering::Relaxed)
    }

    /// Publish the consolidated demands of `load` for lock-free readers.
    pub fn publish(&self, load: &CpuLoad) {
        self.publish_demand(load.demand());
        for group in GroupId::all() {
            self.group_demand[group.index()].store(load.group_demand(group), Ordering::Relaxed);
        }
    }

    /// Drop all state (CPU going offline or coming back).
    pub fn reset(&self) {
        self.lock().reset();
        self.misfit_since.store(0, Ordering::Relaxed);
        self.demand.store(0, Ordering::Relaxed);
        for slot in &self.group_demand {
            slot.store(0, Ordering::Relaxed);
        }
    }

    /// Poll `active_balance` until it clears or `clock()` passes `deadline_ns`.
    pub fn wait_for_migration_idle(
        &self,
        deadline_ns: u64,
        clock: impl Fn() -> u64,
    ) -> Result<(), Timeout> {
        let mut polls = 0u32;
        loop {
            if !self.active_balance() {
                return Ok(());
            }
            polls = polls.saturating_add(1);
            if clock() >= deadline_ns {
                return Err(Timeout { deadline_ns, polls });
            }
            core::hint::spin_loop();
        }
    }
}

// ============================================================================
// Double locking
// ============================================================================

/// Two rq states locked together, handed back in caller order.
pub enum RqPair<'a> {
    /// `a == b`
    Single(MutexGuard<'a, RqState>),
    Pair {
        a: MutexGuard<'a, RqState>,
        b: MutexGuard<'a, RqState>,
    },
}

impl<'a> RqPair<'a> {
    /// State of `a`, and of `b` when it is a different CPU.
    pub fn split(&mut self) -> (&mut RqState, Option<&mut RqState>) {
        match self {
            RqPair::Single(a) => (&mut **a, None),
            RqPair::Pair { a, b } => (&mut **a, Some(&mut **b)),
        }
    }
}

/// Lock the rq states of `a` and `b`, lowest CPU index first.
pub fn lock_pair<'a>(a: &'a CpuRq, b: &'a CpuRq) -> RqPair<'a> {
    if a.cpu == b.cpu {
        return RqPair::Single(a.lock());
    }
    if a.cpu < b.cpu {
        let ga = a.lock();
        let gb = b.lock();
        RqPair::Pair { a: ga, b: gb }
    } else {
        let gb = b.lock();
        let ga = a.lock();
        RqPair::Pair { a: ga, b: gb }
    }
}

/// Like [`lock_pair`] but gives up instead of spinning on a held lock.
pub fn try_lock_pair<'a>(a: &'a CpuRq, b: &'a CpuRq) -> Option<RqPair<'a>> {
    if a.cpu == b.cpu {
        return a.try_lock().map(RqPair::Single);
    }
    let (first, second) = if a.cpu < b.cpu { (a, b) } else { (b, a) };
    let g1 = first.try_lock()?;
    let g2 = second.try_lock()?;
    if a.cpu < b.cpu {
        Some(RqPair::Pair { a: g1, b: g2 })
    } else {
        Some(RqPair::Pair { a: g2, b: g1 })
    }
}
