//! Energy model strategies
//!
//! `SingleTableModel` serves one workload type per cluster.
//! `MultiWorkloadModel` keeps several tables per cluster and lets the
//! policy layer switch the active one at run time. The active selection is
//! an immutable snapshot behind an `Arc`: readers clone the handle and keep
//! a consistent view for a whole decision, writers build a new snapshot and
//! swap the handle.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use super::dsu::DsuModel;
use super::table::{EmTable, OperatingPoint};
use crate::topology::{ClusterId, CpuMask};

/// Workload classification used to pick a table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadType(pub u8);

impl WorkloadType {
    pub const DEFAULT: WorkloadType = WorkloadType(0);

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelKind {
    SingleTable,
    MultiWorkload,
}

/// Static data of one cluster.
#[derive(Debug)]
pub struct ClusterModel {
    pub cpus: CpuMask,
    pub leakage_divisor: u32,
    tables: Vec<Arc<EmTable>>,
}

impl ClusterModel {
    pub fn new(cpus: CpuMask, leakage_divisor: u32, tables: Vec<Arc<EmTable>>) -> Self {
        Self {
            cpus,
            leakage_divisor,
            tables,
        }
    }

    #[inline]
    pub fn nr_workloads(&self) -> usize {
        self.tables.len()
    }

    #[inline]
    pub fn table(&self, workload: WorkloadType) -> Option<&Arc<EmTable>> {
        self.tables.get(workload.index())
    }
}

/// Active table of every cluster at one instant.
#[derive(Debug)]
pub struct ActiveTables {
    workloads: Vec<WorkloadType>,
    tables: Vec<Arc<EmTable>>,
}

impl ActiveTables {
    fn select_defaults(clusters: &[ClusterModel]) -> Self {
        let tables = clusters
            .iter()
            .filter_map(|cluster| cluster.table(WorkloadType::DEFAULT).cloned())
            .collect();
        Self {
            workloads: alloc::vec![WorkloadType::DEFAULT; clusters.len()],
            tables,
        }
    }

    #[inline]
    pub fn table(&self, cluster: ClusterId) -> Option<&EmTable> {
        self.tables.get(cluster.index()).map(|table| &**table)
    }

    #[inline]
    pub fn workload(&self, cluster: ClusterId) -> Option<WorkloadType> {
        self.workloads.get(cluster.index()).copied()
    }
}

/// Energy model capability. Selected once at init.
pub trait EnergyModel: Send + Sync {
    fn kind(&self) -> ModelKind;

    fn clusters(&self) -> &[ClusterModel];

    fn dsu(&self) -> Option<&DsuModel>;

    /// Snapshot of the currently selected tables.
    fn active(&self) -> Arc<ActiveTables>;

    /// Make `workload` the active table of `cluster`. Returns false (and
    /// changes nothing) if the cluster has no such table.
    fn select_workload_table(&self, cluster: ClusterId, workload: WorkloadType) -> bool;

    fn nr_clusters(&self) -> usize {
        self.clusters().len()
    }

    fn table(&self, cluster: ClusterId, workload: WorkloadType) -> Option<&EmTable> {
        self.clusters()
            .get(cluster.index())
            .and_then(|c| c.table(workload))
            .map(|table| &**table)
    }

    fn leakage_divisor(&self, cluster: ClusterId) -> u32 {
        self.clusters()
            .get(cluster.index())
            .map(|c| c.leakage_divisor)
            .unwrap_or(0)
    }

    fn opp_at(&self, cluster: ClusterId, workload: WorkloadType, index: usize) -> Option<OperatingPoint> {
        self.table(cluster, workload).map(|t| *t.opp_at(index))
    }

    fn opp_for_frequency(&self, cluster: ClusterId, workload: WorkloadType, freq_khz: u32) -> Option<usize> {
        self.table(cluster, workload)
            .map(|t| t.opp_for_frequency(freq_khz))
    }

    fn opp_for_capacity(&self, cluster: ClusterId, workload: WorkloadType, capacity: u64) -> Option<usize> {
        self.table(cluster, workload)
            .map(|t| t.opp_for_capacity(capacity))
    }

    fn interpolated(&self, cluster: ClusterId, workload: WorkloadType, capacity: u64) -> Option<OperatingPoint> {
        self.table(cluster, workload)
            .map(|t| *t.interpolated(capacity))
    }

    /// Static leakage; 0 when the table does not exist.
    fn leakage(&self, cluster: ClusterId, workload: WorkloadType, index: usize, temp_c: i32) -> u64 {
        match self.table(cluster, workload) {
            Some(table) => table.leakage(index, temp_c, self.leakage_divisor(cluster)),
            None => 0,
        }
    }

    /// Capacity available under a thermal frequency ceiling.
    fn capacity_ceiling(&self, cluster: ClusterId, freq_khz: u32) -> Option<u64> {
        let active = self.active();
        let table = active.table(cluster)?;
        let index = table.opp_for_frequency(freq_khz);
        let opp = table.opp_at(index);
        // rounding goes up; step down if the point found is above the ceiling
        if opp.freq_khz > freq_khz && index + 1 < table.nr_opps() {
            Some(table.opp_at(index + 1).capacity)
        } else {
            Some(opp.capacity)
        }
    }
}

// ============================================================================
// Single table
// ============================================================================

#[derive(Debug)]
pub struct SingleTableModel {
    clusters: Vec<ClusterModel>,
    dsu: Option<DsuModel>,
    active: Arc<ActiveTables>,
}

impl SingleTableModel {
    /// Every cluster keeps only its workload-0 table.
    pub fn new(clusters: Vec<ClusterModel>, dsu: Option<DsuModel>) -> Self {
        let clusters: Vec<ClusterModel> = clusters
            .into_iter()
            .map(|mut cluster| {
                cluster.tables.truncate(1);
                cluster
            })
            .collect();
        let active = Arc::new(ActiveTables::select_defaults(&clusters));
        Self {
            clusters,
            dsu,
            active,
        }
    }
}

impl EnergyModel for SingleTableModel {
    fn kind(&self) -> ModelKind {
        ModelKind::SingleTable
    }

    fn clusters(&self) -> &[ClusterModel] {
        &self.clusters
    }

    fn dsu(&self) -> Option<&DsuModel> {
        self.dsu.as_ref()
    }

    fn active(&self) -> Arc<ActiveTables> {
        self.active.clone()
    }

    fn select_workload_table(&self, cluster: ClusterId, workload: WorkloadType) -> bool {
        cluster.index() < self.clusters.len() && workload == WorkloadType::DEFAULT
    }
}

// ============================================================================
// Multiple workload tables
// ============================================================================

#[derive(Debug)]
pub struct MultiWorkloadModel {
    clusters: Vec<ClusterModel>,
    dsu: Option<DsuModel>,
    active: RwLock<Arc<ActiveTables>>,
    /// Serialises writers; readers only ever touch `active`.
    update_lock: Mutex<()>,
}

impl MultiWorkloadModel {
    pub fn new(clusters: Vec<ClusterModel>, dsu: Option<DsuModel>) -> Self {
        let active = RwLock::new(Arc::new(ActiveTables::select_defaults(&clusters)));
        Self {
            clusters,
            dsu,
            active,
            update_lock: Mutex::new(()),
        }
    }
}

impl EnergyModel for MultiWorkloadModel {
    fn kind(&self) -> ModelKind {
        ModelKind::MultiWorkload
    }

    fn clusters(&self) -> &[ClusterModel] {
        &self.clusters
    }

    fn dsu(&self) -> Option<&DsuModel> {
        self.dsu.as_ref()
    }

    fn active(&self) -> Arc<ActiveTables> {
        self.active.read().clone()
    }

    fn select_workload_table(&self, cluster: ClusterId, workload: WorkloadType) -> bool {
        let Some(table) = self
            .clusters
            .get(cluster.index())
            .and_then(|c| c.table(workload))
        else {
            return false;
        };

        let _update = self.update_lock.lock();
        let current = self.active();
        if current.workload(cluster) == Some(workload) {
            return true;
        }
        let mut workloads = current.workloads.clone();
        let mut tables = current.tables.clone();
        workloads[cluster.index()] = workload;
        tables[cluster.index()] = table.clone();
        let next = Arc::new(ActiveTables { workloads, tables });

        *self.active.write() = next;
        crate::kdebug!("em: cluster {} now uses workload table {}", cluster.index(), workload.0);
        true
    }
}
