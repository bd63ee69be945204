//! CPU topology: CPU ids, CPU masks and clusters ("gears")
//!
//! Clusters are performance domains: CPUs sharing one DVFS rail. Cluster
//! index 0 is the smallest gear; indices grow with capacity.

use alloc::vec::Vec;
use core::fmt;

use crate::error::EasError;
use crate::SCHED_CAPACITY_SCALE;

/// Maximum number of CPUs the core can describe (one bit per CPU in [`CpuMask`]).
pub const MAX_CPUS: usize = 64;

/// Validated CPU index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(u16);

impl CpuId {
    pub const fn new(raw: u16) -> Option<Self> {
        if (raw as usize) < MAX_CPUS {
            Some(Self(raw))
        } else {
            None
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// One bit per CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CpuMask(u64);

impl CpuMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn from_cpus(cpus: &[u16]) -> Self {
        let mut mask = Self::empty();
        for &cpu in cpus {
            mask.set(cpu as usize);
        }
        mask
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.0 |= 1 << cpu;
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < MAX_CPUS {
            self.0 &= !(1 << cpu);
        }
    }

    #[inline]
    pub fn is_set(&self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    #[inline]
    pub fn test(&self, cpu: CpuId) -> bool {
        self.is_set(cpu.index())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn first_set(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as usize)
        }
    }

    pub fn first_cpu(&self) -> Option<CpuId> {
        self.first_set().and_then(|cpu| CpuId::new(cpu as u16))
    }

    #[inline]
    pub const fn and(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline]
    pub const fn or(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    pub fn intersects(&self, other: &Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn iter_set(&self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        core::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let cpu = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(cpu)
        })
    }

    pub fn iter_cpus(&self) -> impl Iterator<Item = CpuId> {
        self.iter_set().map(|cpu| CpuId(cpu as u16))
    }
}

/// Cluster (performance domain) index. 0 is the lowest-capacity gear.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId(pub usize);

impl ClusterId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Boot description of one cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterDesc {
    pub cpus: CpuMask,
    /// Original capacity of each CPU in the cluster at its highest OPP.
    pub capacity: u64,
}

impl ClusterDesc {
    pub fn new(cpus: &[u16], capacity: u64) -> Self {
        Self {
            cpus: CpuMask::from_cpus(cpus),
            capacity,
        }
    }
}

/// Immutable system topology.
#[derive(Clone, Debug)]
pub struct Topology {
    clusters: Vec<ClusterDesc>,
    cpu_cluster: [Option<ClusterId>; MAX_CPUS],
    possible: CpuMask,
}

impl Topology {
    pub fn new(clusters: Vec<ClusterDesc>) -> Result<Self, EasError> {
        if clusters.is_empty() {
            return Err(EasError::InvalidTopology("no clusters"));
        }

        let mut cpu_cluster = [None; MAX_CPUS];
        let mut possible = CpuMask::empty();
        let mut last_capacity = 0;

        for (idx, cluster) in clusters.iter().enumerate() {
            if cluster.cpus.is_empty() {
                return Err(EasError::InvalidTopology("empty cluster"));
            }
            if cluster.cpus.intersects(&possible) {
                return Err(EasError::InvalidTopology("overlapping clusters"));
            }
            if cluster.capacity == 0 || cluster.capacity > SCHED_CAPACITY_SCALE {
                return Err(EasError::InvalidTopology("capacity out of range"));
            }
            if cluster.capacity < last_capacity {
                return Err(EasError::InvalidTopology("clusters not ordered by capacity"));
            }
            last_capacity = cluster.capacity;
            possible = possible.or(cluster.cpus);
            for cpu in cluster.cpus.iter_set() {
                cpu_cluster[cpu] = Some(ClusterId(idx));
            }
        }

        Ok(Self {
            clusters,
            cpu_cluster,
            possible,
        })
    }

    #[inline]
    pub fn nr_clusters(&self) -> usize {
        self.clusters.len()
    }

    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.possible.count()
    }

    #[inline]
    pub fn possible_mask(&self) -> CpuMask {
        self.possible
    }

    pub fn cpus(&self) -> impl Iterator<Item = CpuId> {
        self.possible.iter_cpus()
    }

    /// Validate a raw CPU number against the topology.
    pub fn cpu(&self, raw: u16) -> Option<CpuId> {
        CpuId::new(raw).filter(|cpu| self.possible.test(*cpu))
    }

    #[inline]
    pub fn contains(&self, cpu: CpuId) -> bool {
        self.possible.test(cpu)
    }

    pub fn cluster_of(&self, cpu: CpuId) -> Option<ClusterId> {
        self.cpu_cluster.get(cpu.index()).copied().flatten()
    }

    pub fn cluster(&self, cluster: ClusterId) -> Option<&ClusterDesc> {
        self.clusters.get(cluster.index())
    }

    pub fn clusters(&self) -> impl Iterator<Item = (ClusterId, &ClusterDesc)> {
        self.clusters
            .iter()
            .enumerate()
            .map(|(idx, desc)| (ClusterId(idx), desc))
    }

    pub fn cluster_cpus(&self, cluster: ClusterId) -> CpuMask {
        self.cluster(cluster)
            .map(|desc| desc.cpus)
            .unwrap_or_default()
    }

    pub fn cluster_capacity(&self, cluster: ClusterId) -> u64 {
        self.cluster(cluster).map(|desc| desc.capacity).unwrap_or(0)
    }

    pub fn capacity_orig(&self, cpu: CpuId) -> u64 {
        self.cluster_of(cpu)
            .map(|cluster| self.cluster_capacity(cluster))
            .unwrap_or(0)
    }

    pub fn max_capacity_cluster(&self) -> ClusterId {
        ClusterId(self.clusters.len() - 1)
    }

    pub fn is_max_capacity(&self, cpu: CpuId) -> bool {
        self.capacity_orig(cpu) >= self.cluster_capacity(self.max_capacity_cluster())
    }

    pub fn is_min_capacity(&self, cpu: CpuId) -> bool {
        self.capacity_orig(cpu) <= self.cluster_capacity(ClusterId(0))
    }

    /// CPUs in the same cluster share the last level cache.
    pub fn shares_cache(&self, a: CpuId, b: CpuId) -> bool {
        match (self.cluster_of(a), self.cluster_of(b)) {
            (Some(ca), Some(cb)) => ca == cb,
            _ => false,
        }
    }
}
