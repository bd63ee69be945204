//! DSU (shared L3 / interconnect) sub-model
//!
//! The DSU has its own operating points. It follows the fastest cluster:
//! the DSU point in use is the lowest one whose frequency covers the
//! highest cluster frequency. One cluster shares its voltage rail with the
//! DSU, so a DSU voltage above that cluster's own voltage raises the rail
//! for both.

use alloc::vec::Vec;

use crate::error::EmError;
use crate::topology::ClusterId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DsuOpp {
    pub freq_khz: u32,
    pub volt_uv: u32,
    pub dyn_power: u64,
}

/// DSU calibration, highest performance point first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DsuCalibration {
    pub shared_rail_cluster: usize,
    pub opps: Vec<DsuOpp>,
}

#[derive(Clone, Debug)]
pub struct DsuModel {
    shared_rail_cluster: ClusterId,
    opps: Vec<DsuOpp>,
}

impl DsuModel {
    pub fn build(calibration: &DsuCalibration, nr_clusters: usize) -> Result<Self, EmError> {
        let rail = calibration.shared_rail_cluster;
        if rail >= nr_clusters {
            return Err(EmError::BadDsuRail { cluster: rail });
        }
        if calibration.opps.is_empty() {
            return Err(EmError::EmptyTable { cluster: rail });
        }
        for (index, pair) in calibration.opps.windows(2).enumerate() {
            if pair[1].freq_khz >= pair[0].freq_khz || pair[1].volt_uv > pair[0].volt_uv {
                return Err(EmError::NotMonotonic {
                    cluster: rail,
                    workload: 0,
                    index: index + 1,
                });
            }
        }
        Ok(Self {
            shared_rail_cluster: ClusterId(rail),
            opps: calibration.opps.clone(),
        })
    }

    #[inline]
    pub fn shared_rail_cluster(&self) -> ClusterId {
        self.shared_rail_cluster
    }

    #[inline]
    pub fn nr_opps(&self) -> usize {
        self.opps.len()
    }

    #[inline]
    pub fn opp_at(&self, index: usize) -> &DsuOpp {
        &self.opps[index.min(self.opps.len() - 1)]
    }

    /// Lowest DSU point whose frequency is at least `freq_khz`.
    pub fn opp_for_frequency(&self, freq_khz: u32) -> usize {
        // descending frequencies: count the points at or above the request
        let above = self.opps.partition_point(|opp| opp.freq_khz >= freq_khz);
        above.saturating_sub(1)
    }

    /// DSU point in use when the fastest cluster runs at `freq_khz`.
    pub fn opp_for_cluster_freq(&self, freq_khz: u32) -> &DsuOpp {
        self.opp_at(self.opp_for_frequency(freq_khz))
    }
}

/// Energy of `energy` re-priced from `old_uv` to `new_uv`: dynamic power
/// grows with the square of the voltage.
pub fn voltage_bump_cost(energy: u64, old_uv: u32, new_uv: u32) -> u64 {
    if old_uv == 0 || new_uv <= old_uv {
        return 0;
    }
    let old = old_uv as u128;
    let new = new_uv as u128;
    let extra = energy as u128 * (new * new - old * old) / (old * old);
    extra.min(u64::MAX as u128) as u64
}
