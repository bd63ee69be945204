//! Operating point tables
//!
//! One `EmTable` per (cluster, workload type). Operating points are stored
//! with index 0 as the highest performance point. Three lookup structures
//! are precomputed at build time so that no decision path scans the table:
//!
//! - `legacy`: frequency -> index, quantised by a fixed frequency step
//! - `capacity`: capacity -> index, one slot per capacity unit
//! - `private`: one interpolated operating point per capacity unit

use alloc::vec::Vec;

use crate::error::EmError;
use crate::SCHED_CAPACITY_SCALE;

/// Upper bound on the number of slots of the frequency map. When the GCD of
/// the frequency distances would need more slots, the step is widened and
/// lookups walk the few points sharing a slot.
const LEGACY_MAP_MAX_SLOTS: u64 = 4096;

/// Quadratic-in-temperature static leakage coefficients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LeakageCoeffs {
    pub a: i32,
    pub b: i32,
    pub c: i32,
}

impl LeakageCoeffs {
    pub const fn is_zero(&self) -> bool {
        self.a == 0 && self.b == 0 && self.c == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperatingPoint {
    pub freq_khz: u32,
    pub volt_uv: u32,
    /// Normalised capacity, 0..=1024.
    pub capacity: u64,
    pub dyn_power: u64,
    pub leakage: LeakageCoeffs,
    /// `dyn_power * 1024 / capacity`, 0 for zero capacity.
    pub pwr_eff: u64,
}

impl OperatingPoint {
    pub fn new(
        freq_khz: u32,
        volt_uv: u32,
        capacity: u64,
        dyn_power: u64,
        leakage: LeakageCoeffs,
    ) -> Self {
        Self {
            freq_khz,
            volt_uv,
            capacity,
            dyn_power,
            leakage,
            pwr_eff: power_efficiency(dyn_power, capacity),
        }
    }
}

#[inline]
pub fn power_efficiency(dyn_power: u64, capacity: u64) -> u64 {
    if capacity == 0 {
        0
    } else {
        dyn_power.saturating_mul(SCHED_CAPACITY_SCALE) / capacity
    }
}

#[inline]
fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Linear interpolation of `y` at `x` between `(x0, y0)` and `(x1, y1)`.
#[inline]
fn lerp(x: u64, x0: u64, y0: u64, x1: u64, y1: u64) -> u64 {
    if x1 == x0 {
        return y0;
    }
    let (x, x0, x1) = (x as i128, x0 as i128, x1 as i128);
    let (y0, y1) = (y0 as i128, y1 as i128);
    let y = y0 + (y1 - y0) * (x - x0) / (x1 - x0);
    y.max(0) as u64
}

#[derive(Clone, Debug)]
pub struct EmTable {
    opps: Vec<OperatingPoint>,
    freq_step: u64,
    legacy: Vec<u16>,
    capacity: Vec<u16>,
    private: Vec<OperatingPoint>,
}

impl EmTable {
    /// Validate `opps` (index 0 = highest performance) and precompute the
    /// lookup maps. `cluster`/`workload` only label the error.
    pub fn build(
        opps: Vec<OperatingPoint>,
        cluster: usize,
        workload: usize,
    ) -> Result<Self, EmError> {
        if opps.is_empty() {
            return Err(EmError::EmptyTable { cluster });
        }
        if opps.len() > u16::MAX as usize {
            return Err(EmError::InconsistentTable {
                cluster,
                workload,
                found: opps.len(),
                expected: u16::MAX as usize,
            });
        }
        for (index, opp) in opps.iter().enumerate() {
            if opp.capacity == 0 || opp.capacity > SCHED_CAPACITY_SCALE {
                return Err(EmError::BadCapacity { cluster, index });
            }
        }
        for (index, pair) in opps.windows(2).enumerate() {
            if pair[1].freq_khz >= pair[0].freq_khz || pair[1].capacity >= pair[0].capacity {
                return Err(EmError::NotMonotonic {
                    cluster,
                    workload,
                    index: index + 1,
                });
            }
        }

        let opps: Vec<OperatingPoint> = opps
            .into_iter()
            .map(|opp| OperatingPoint {
                pwr_eff: power_efficiency(opp.dyn_power, opp.capacity),
                ..opp
            })
            .collect();

        let (freq_step, legacy) = Self::build_legacy(&opps);
        let capacity = Self::build_capacity(&opps);
        let private = Self::build_private(&opps);

        Ok(Self {
            opps,
            freq_step,
            legacy,
            capacity,
            private,
        })
    }

    fn build_legacy(opps: &[OperatingPoint]) -> (u64, Vec<u16>) {
        let max = opps[0].freq_khz as u64;
        let min = opps[opps.len() - 1].freq_khz as u64;
        let range = max - min;
        if range == 0 {
            return (1, alloc::vec![0]);
        }

        let mut step = opps
            .iter()
            .map(|opp| max - opp.freq_khz as u64)
            .filter(|distance| *distance != 0)
            .fold(0, gcd)
            .max(1);
        if range / step + 1 > LEGACY_MAP_MAX_SLOTS {
            step = range.div_ceil(LEGACY_MAP_MAX_SLOTS - 1);
        }

        let slots = (range / step + 1) as usize;
        let mut map = Vec::with_capacity(slots);
        let mut idx = 0usize;
        for slot in 0..slots {
            let slot_freq = max.saturating_sub(slot as u64 * step);
            // lowest point still at or above the slot frequency
            while idx + 1 < opps.len() && opps[idx + 1].freq_khz as u64 >= slot_freq {
                idx += 1;
            }
            map.push(idx as u16);
        }
        (step, map)
    }

    fn build_capacity(opps: &[OperatingPoint]) -> Vec<u16> {
        let max = opps[0].capacity;
        let min = opps[opps.len() - 1].capacity;
        let slots = (max - min + 1) as usize;
        let mut map = Vec::with_capacity(slots);
        let mut idx = 0usize;
        for slot in 0..slots {
            let slot_cap = max - slot as u64;
            while idx + 1 < opps.len() && opps[idx + 1].capacity >= slot_cap {
                idx += 1;
            }
            map.push(idx as u16);
        }
        map
    }

    fn build_private(opps: &[OperatingPoint]) -> Vec<OperatingPoint> {
        let max = opps[0].capacity;
        let min = opps[opps.len() - 1].capacity;
        let mut table = Vec::with_capacity((max - min + 1) as usize);
        let mut hi = 0usize;
        for cap in (min..=max).rev() {
            while hi + 1 < opps.len() && opps[hi + 1].capacity >= cap {
                hi += 1;
            }
            let upper = &opps[hi];
            let point = if upper.capacity == cap || hi + 1 >= opps.len() {
                *upper
            } else {
                let lower = &opps[hi + 1];
                let (c0, c1) = (lower.capacity, upper.capacity);
                let freq = lerp(cap, c0, lower.freq_khz as u64, c1, upper.freq_khz as u64);
                let volt = lerp(cap, c0, lower.volt_uv as u64, c1, upper.volt_uv as u64);
                let power = lerp(cap, c0, lower.dyn_power, c1, upper.dyn_power);
                OperatingPoint::new(freq as u32, volt as u32, cap, power, upper.leakage)
            };
            table.push(point);
        }
        table
    }

    #[inline]
    pub fn nr_opps(&self) -> usize {
        self.opps.len()
    }

    #[inline]
    pub fn opps(&self) -> &[OperatingPoint] {
        &self.opps
    }

    #[inline]
    pub fn max_opp(&self) -> &OperatingPoint {
        &self.opps[0]
    }

    #[inline]
    pub fn min_opp(&self) -> &OperatingPoint {
        &self.opps[self.opps.len() - 1]
    }

    #[inline]
    pub fn max_capacity(&self) -> u64 {
        self.max_opp().capacity
    }

    #[inline]
    pub fn max_freq(&self) -> u32 {
        self.max_opp().freq_khz
    }

    #[inline]
    pub fn freq_step(&self) -> u64 {
        self.freq_step
    }

    /// Operating point at `index`, clamped to the table.
    #[inline]
    pub fn opp_at(&self, index: usize) -> &OperatingPoint {
        &self.opps[index.min(self.opps.len() - 1)]
    }

    /// Index of the lowest operating point whose frequency is at least
    /// `freq_khz`. Requests above the maximum map to index 0, requests
    /// below the minimum to the last index.
    pub fn opp_for_frequency(&self, freq_khz: u32) -> usize {
        let max = self.max_freq() as u64;
        let freq = freq_khz as u64;
        if freq >= max {
            return 0;
        }
        let slot = ((max - freq) / self.freq_step) as usize;
        let mut idx = self.legacy[slot.min(self.legacy.len() - 1)] as usize;
        while idx + 1 < self.opps.len() && self.opps[idx + 1].freq_khz as u64 >= freq {
            idx += 1;
        }
        idx
    }

    /// Index of the lowest operating point whose capacity is at least
    /// `capacity`.
    pub fn opp_for_capacity(&self, capacity: u64) -> usize {
        let max = self.max_capacity();
        if capacity >= max {
            return 0;
        }
        let slot = (max - capacity) as usize;
        self.capacity[slot.min(self.capacity.len() - 1)] as usize
    }

    /// Continuous operating point for `capacity`, clamped to the table range.
    pub fn interpolated(&self, capacity: u64) -> &OperatingPoint {
        let slot = self.max_capacity().saturating_sub(capacity) as usize;
        &self.private[slot.min(self.private.len() - 1)]
    }

    /// Static leakage of `opp` at `temp_c`:
    /// `(temp * (temp * a - b) + c) / divisor`, never negative.
    pub fn leakage(&self, index: usize, temp_c: i32, divisor: u32) -> u64 {
        if divisor == 0 {
            return 0;
        }
        let coeffs = self.opp_at(index).leakage;
        if coeffs.is_zero() {
            return 0;
        }
        let t = temp_c as i64;
        let raw = t * (t * coeffs.a as i64 - coeffs.b as i64) + coeffs.c as i64;
        (raw / divisor as i64).max(0) as u64
    }
}
