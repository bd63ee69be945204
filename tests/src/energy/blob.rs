//! Calibration blob decoding

use nexa_eas::energy::blob::{BlobError, BLOB_FLAG_DSU, BLOB_MAGIC, BLOB_VERSION};
use nexa_eas::{build_energy_model, ClusterId, EmCalibration, EmError, ModelKind, WorkloadType};

/// Little-endian blob writer for crafted inputs.
#[derive(Default)]
struct BlobWriter(Vec<u8>);

impl BlobWriter {
    fn u8(mut self, v: u8) -> Self {
        self.0.push(v);
        self
    }
    fn u16(mut self, v: u16) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn u32(mut self, v: u32) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn i32(mut self, v: i32) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }
    fn u64(mut self, v: u64) -> Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn header(self, nr_clusters: u16, flags: u32) -> Self {
        self.u32(BLOB_MAGIC).u16(BLOB_VERSION).u16(nr_clusters).u32(flags)
    }

    fn cluster(self, mask: u64, nr_workloads: u8, nr_opps: u8, divisor: u32) -> Self {
        self.u64(mask).u8(nr_workloads).u8(nr_opps).u16(0).u32(divisor)
    }

    fn opp(self, freq: u32, volt: u32, capacity: u16, power: u32, abc: (i32, i32, i32)) -> Self {
        self.u32(freq)
            .u32(volt)
            .u16(capacity)
            .u16(0)
            .u32(power)
            .i32(abc.0)
            .i32(abc.1)
            .i32(abc.2)
    }

    fn bytes(self) -> Vec<u8> {
        self.0
    }
}

fn two_cluster_blob(flags: u32) -> BlobWriter {
    BlobWriter::default()
        .header(2, flags)
        .cluster(0b0011, 1, 2, 1)
        .opp(1_800_000, 900_000, 512, 300, (0, 0, 0))
        .opp(900_000, 650_000, 256, 90, (0, 0, 0))
        .cluster(0b1100, 2, 2, 4)
        .opp(2_800_000, 1_050_000, 1024, 1400, (1, 2, 30))
        .opp(1_400_000, 750_000, 512, 380, (1, 2, 30))
        .opp(2_800_000, 1_050_000, 1024, 1100, (1, 2, 30))
        .opp(1_400_000, 750_000, 512, 300, (1, 2, 30))
}

#[test]
fn test_decodes_clusters_and_workloads() {
    let calibration = EmCalibration::from_blob(&two_cluster_blob(0).bytes()).expect("blob");
    assert_eq!(calibration.clusters.len(), 2);
    assert_eq!(calibration.clusters[0].cpus.count(), 2);
    assert_eq!(calibration.clusters[1].tables.len(), 2);
    assert_eq!(calibration.clusters[1].leakage_divisor, 4);
    assert_eq!(calibration.clusters[1].tables[1][0].dyn_power, 1100);
    assert_eq!(calibration.clusters[1].tables[0][0].leakage.c, 30);
    assert!(calibration.dsu.is_none());

    let model = build_energy_model(&calibration).expect("model");
    assert_eq!(model.kind(), ModelKind::MultiWorkload);
    assert!(model.select_workload_table(ClusterId(1), WorkloadType(1)));
    // cluster 0 only has workload 0
    assert!(!model.select_workload_table(ClusterId(0), WorkloadType(1)));
}

#[test]
fn test_decodes_dsu_section() {
    let bytes = two_cluster_blob(BLOB_FLAG_DSU)
        .u8(1)
        .u8(2)
        .u16(0)
        .u32(2_000_000)
        .u32(900_000)
        .u32(200)
        .u32(1_000_000)
        .u32(700_000)
        .u32(80)
        .bytes();
    let calibration = EmCalibration::from_blob(&bytes).expect("blob");
    let dsu = calibration.dsu.expect("dsu");
    assert_eq!(dsu.shared_rail_cluster, 1);
    assert_eq!(dsu.opps.len(), 2);
    assert_eq!(dsu.opps[1].dyn_power, 80);
}

#[test]
fn test_bad_magic_is_reported() {
    let bytes = BlobWriter::default().u32(0xdead_beef).u16(1).u16(1).u32(0).bytes();
    assert_eq!(
        EmCalibration::from_blob(&bytes),
        Err(EmError::Blob(BlobError::BadMagic(0xdead_beef)))
    );
}

#[test]
fn test_truncated_blob_is_out_of_bounds() {
    let mut bytes = two_cluster_blob(0).bytes();
    bytes.truncate(bytes.len() - 3);
    assert!(matches!(
        EmCalibration::from_blob(&bytes),
        Err(EmError::Blob(BlobError::OutOfBounds { .. }))
    ));
}

#[test]
fn test_trailing_bytes_are_rejected() {
    let bytes = two_cluster_blob(0).u8(0).bytes();
    assert_eq!(
        EmCalibration::from_blob(&bytes),
        Err(EmError::Blob(BlobError::TrailingBytes(1)))
    );
}

#[test]
fn test_empty_mask_is_rejected() {
    let bytes = BlobWriter::default()
        .header(1, 0)
        .cluster(0, 1, 1, 1)
        .opp(1_000_000, 800_000, 1024, 100, (0, 0, 0))
        .bytes();
    assert_eq!(
        EmCalibration::from_blob(&bytes),
        Err(EmError::Blob(BlobError::EmptyCpuMask { cluster: 0 }))
    );
}

#[test]
fn test_no_clusters() {
    let bytes = BlobWriter::default().header(0, 0).bytes();
    assert_eq!(EmCalibration::from_blob(&bytes), Err(EmError::NoClusters));
}
