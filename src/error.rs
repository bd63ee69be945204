//! Error types
//!
//! Hot paths never return these: they degrade to `Option`/`bool`. Errors
//! only surface from initialization and from bounded waits.

use thiserror::Error;

use crate::energy::blob::BlobError;

/// Energy model construction failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmError {
    #[error("energy model calibration has no clusters")]
    NoClusters,
    #[error("cluster {cluster} has no operating points")]
    EmptyTable { cluster: usize },
    #[error("cluster {cluster} workload {workload} has {found} operating points, expected {expected}")]
    InconsistentTable {
        cluster: usize,
        workload: usize,
        found: usize,
        expected: usize,
    },
    #[error("cluster {cluster} workload {workload} opp {index}: frequency/capacity not monotonic")]
    NotMonotonic {
        cluster: usize,
        workload: usize,
        index: usize,
    },
    #[error("cluster {cluster} opp {index}: zero or out-of-range capacity")]
    BadCapacity { cluster: usize, index: usize },
    #[error("cluster {cluster}: zero leakage divisor")]
    BadLeakageDivisor { cluster: usize },
    #[error("shared-rail cluster {cluster} does not exist")]
    BadDsuRail { cluster: usize },
    #[error("calibration blob: {0}")]
    Blob(#[from] BlobError),
}

/// Errors raised while bringing up the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EasError {
    #[error("invalid topology: {0}")]
    InvalidTopology(&'static str),
    #[error("energy model: {0}")]
    EnergyModel(#[from] EmError),
    #[error("energy model covers {model} clusters, topology has {topology}")]
    ModelMismatch { model: usize, topology: usize },
    #[error("energy model cluster {cluster} spans cpus {model:#x}, topology {topology:#x}")]
    ClusterMaskMismatch {
        cluster: usize,
        model: u64,
        topology: u64,
    },
}

/// A bounded wait ran past its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline {deadline_ns} ns passed after {polls} polls")]
pub struct Timeout {
    pub deadline_ns: u64,
    pub polls: u32,
}
