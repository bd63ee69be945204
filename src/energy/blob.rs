//! Boot calibration blob
//!
//! Little-endian layout:
//!
//! ```text
//! header   magic "EMTB" u32 | version u16 (=1) | nr_clusters u16 | flags u32
//! cluster  cpu_mask u64 | nr_workloads u8 | nr_opps u8 | reserved u16
//!          | leakage_divisor u32
//!          then nr_workloads * nr_opps records:
//!          freq u32 | volt u32 | capacity u16 | reserved u16 | dyn_power u32
//!          | a i32 | b i32 | c i32
//! dsu      (flags bit 0) shared_rail_cluster u8 | nr_opps u8 | reserved u16
//!          then nr_opps records: freq u32 | volt u32 | dyn_power u32
//! ```
//!
//! Records are ordered highest performance first.

use alloc::vec::Vec;

use thiserror::Error;

use super::dsu::{DsuCalibration, DsuOpp};
use super::table::{LeakageCoeffs, OperatingPoint};
use super::{ClusterCalibration, EmCalibration};
use crate::error::EmError;
use crate::topology::CpuMask;

pub const BLOB_MAGIC: u32 = u32::from_le_bytes(*b"EMTB");
pub const BLOB_VERSION: u16 = 1;
pub const BLOB_FLAG_DSU: u32 = 1 << 0;

pub const HEADER_LEN: usize = 12;
pub const CLUSTER_HEADER_LEN: usize = 16;
pub const OPP_RECORD_LEN: usize = 28;
pub const DSU_HEADER_LEN: usize = 4;
pub const DSU_RECORD_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlobError {
    #[error("read of {size} bytes at offset {offset} past end ({len} bytes)")]
    OutOfBounds {
        offset: usize,
        size: usize,
        len: usize,
    },
    #[error("offset overflow")]
    Overflow,
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("cluster {cluster}: empty cpu mask")]
    EmptyCpuMask { cluster: usize },
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
}

/// Bounds-checked little-endian cursor over a byte slice.
#[derive(Clone, Copy)]
pub struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], BlobError> {
        let end = self.pos.checked_add(len).ok_or(BlobError::Overflow)?;
        if end > self.data.len() {
            return Err(BlobError::OutOfBounds {
                offset: self.pos,
                size: len,
                len: self.data.len(),
            });
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], BlobError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), BlobError> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8, BlobError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, BlobError> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> Result<u32, BlobError> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> Result<i32, BlobError> {
        self.array().map(i32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Result<u64, BlobError> {
        self.array().map(u64::from_le_bytes)
    }
}

fn read_opp(reader: &mut BlobReader<'_>) -> Result<OperatingPoint, BlobError> {
    let freq = reader.u32()?;
    let volt = reader.u32()?;
    let capacity = reader.u16()?;
    reader.skip(2)?;
    let dyn_power = reader.u32()?;
    let leakage = LeakageCoeffs {
        a: reader.i32()?,
        b: reader.i32()?,
        c: reader.i32()?,
    };
    Ok(OperatingPoint::new(
        freq,
        volt,
        capacity as u64,
        dyn_power as u64,
        leakage,
    ))
}

/// Decode a calibration blob. Structural problems are reported here; table
/// semantics (ordering, capacities) are checked by `build_energy_model`.
pub fn parse_blob(data: &[u8]) -> Result<EmCalibration, EmError> {
    let mut reader = BlobReader::new(data);

    let magic = reader.u32()?;
    if magic != BLOB_MAGIC {
        return Err(BlobError::BadMagic(magic).into());
    }
    let version = reader.u16()?;
    if version != BLOB_VERSION {
        return Err(BlobError::UnsupportedVersion(version).into());
    }
    let nr_clusters = reader.u16()? as usize;
    let flags = reader.u32()?;
    if nr_clusters == 0 {
        return Err(EmError::NoClusters);
    }

    let mut clusters = Vec::with_capacity(nr_clusters);
    for cluster in 0..nr_clusters {
        let mask = reader.u64()?;
        let nr_workloads = reader.u8()? as usize;
        let nr_opps = reader.u8()? as usize;
        reader.skip(2)?;
        let leakage_divisor = reader.u32()?;

        if mask == 0 {
            return Err(BlobError::EmptyCpuMask { cluster }.into());
        }
        if nr_workloads == 0 || nr_opps == 0 {
            return Err(EmError::EmptyTable { cluster });
        }

        let mut tables = Vec::with_capacity(nr_workloads);
        for _ in 0..nr_workloads {
            let mut opps = Vec::with_capacity(nr_opps);
            for _ in 0..nr_opps {
                opps.push(read_opp(&mut reader)?);
            }
            tables.push(opps);
        }

        clusters.push(ClusterCalibration {
            cpus: CpuMask::from_bits(mask),
            leakage_divisor,
            tables,
        });
    }

    let dsu = if flags & BLOB_FLAG_DSU != 0 {
        let shared_rail_cluster = reader.u8()? as usize;
        let nr_opps = reader.u8()? as usize;
        reader.skip(2)?;
        let mut opps = Vec::with_capacity(nr_opps);
        for _ in 0..nr_opps {
            opps.push(DsuOpp {
                freq_khz: reader.u32()?,
                volt_uv: reader.u32()?,
                dyn_power: reader.u32()? as u64,
            });
        }
        Some(DsuCalibration {
            shared_rail_cluster,
            opps,
        })
    } else {
        None
    };

    if reader.remaining() != 0 {
        return Err(BlobError::TrailingBytes(reader.remaining()).into());
    }

    Ok(EmCalibration { clusters, dsu })
}
