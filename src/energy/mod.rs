//! Energy model
//!
//! Per-cluster operating point tables, optionally one per workload type,
//! plus the DSU sub-model. Built once at boot from an [`EmCalibration`]
//! (structured, or decoded from a blob with [`blob::parse_blob`]).

pub mod blob;
pub mod dsu;
pub mod model;
pub mod table;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub use dsu::{DsuCalibration, DsuModel, DsuOpp};
pub use model::{
    ActiveTables, ClusterModel, EnergyModel, ModelKind, MultiWorkloadModel, SingleTableModel,
    WorkloadType,
};
pub use table::{EmTable, LeakageCoeffs, OperatingPoint};

use crate::error::EmError;
use crate::topology::CpuMask;
use crate::{kinfo, kwarn};

/// Calibration of one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterCalibration {
    pub cpus: CpuMask,
    pub leakage_divisor: u32,
    /// `tables[workload][opp]`, highest performance point first.
    pub tables: Vec<Vec<OperatingPoint>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EmCalibration {
    pub clusters: Vec<ClusterCalibration>,
    pub dsu: Option<DsuCalibration>,
}

impl EmCalibration {
    pub fn from_blob(data: &[u8]) -> Result<Self, EmError> {
        blob::parse_blob(data)
    }
}

fn build_workload(
    calibration: &ClusterCalibration,
    cluster: usize,
    workload: usize,
) -> Result<EmTable, EmError> {
    let opps = calibration
        .tables
        .get(workload)
        .ok_or(EmError::EmptyTable { cluster })?;
    let expected = calibration.tables[0].len();
    if workload != 0 && opps.len() != expected {
        return Err(EmError::InconsistentTable {
            cluster,
            workload,
            found: opps.len(),
            expected,
        });
    }
    EmTable::build(opps.clone(), cluster, workload)
}

/// Validate `calibration` and pick the model strategy.
///
/// Workload 0 of every cluster is mandatory: if any of them is invalid the
/// whole model is rejected. Invalid extra workload tables degrade the model
/// to a [`SingleTableModel`]. An invalid DSU section is dropped.
pub fn build_energy_model(calibration: &EmCalibration) -> Result<Box<dyn EnergyModel>, EmError> {
    if calibration.clusters.is_empty() {
        return Err(EmError::NoClusters);
    }

    let mut clusters = Vec::with_capacity(calibration.clusters.len());
    let mut degraded: Option<EmError> = None;
    let mut multi = false;

    for (idx, cluster) in calibration.clusters.iter().enumerate() {
        if cluster.leakage_divisor == 0 {
            return Err(EmError::BadLeakageDivisor { cluster: idx });
        }
        let mut tables = Vec::with_capacity(cluster.tables.len());
        tables.push(Arc::new(build_workload(cluster, idx, 0)?));

        for workload in 1..cluster.tables.len() {
            match build_workload(cluster, idx, workload) {
                Ok(table) => tables.push(Arc::new(table)),
                Err(err) => {
                    degraded.get_or_insert(err);
                    break;
                }
            }
        }
        multi |= tables.len() > 1;
        clusters.push(ClusterModel::new(cluster.cpus, cluster.leakage_divisor, tables));
    }

    let dsu = match &calibration.dsu {
        Some(dsu) => match DsuModel::build(dsu, clusters.len()) {
            Ok(model) => Some(model),
            Err(err) => {
                kwarn!("em: dropping DSU model: {}", err);
                None
            }
        },
        None => None,
    };

    if let Some(err) = degraded {
        kwarn!("em: {}; falling back to a single workload table", err);
        return Ok(Box::new(SingleTableModel::new(clusters, dsu)));
    }

    if multi {
        kinfo!("em: {} clusters, multiple workload tables", clusters.len());
        Ok(Box::new(MultiWorkloadModel::new(clusters, dsu)))
    } else {
        kinfo!("em: {} clusters, single workload table", clusters.len());
        Ok(Box::new(SingleTableModel::new(clusters, dsu)))
    }
}
