//! Model strategies and table switching

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use nexa_eas::energy::ClusterCalibration;
use nexa_eas::{build_energy_model, ClusterId, CpuMask, EmCalibration, EmError, ModelKind, WorkloadType};

use crate::mock::opp;

fn calibration(workloads: usize) -> EmCalibration {
    let tables = (0..workloads as u64)
        .map(|wl| {
            vec![
                opp(2_000_000, 1_000_000, 1024, 1000 + 100 * wl),
                opp(1_000_000, 700_000, 512, 300 + 100 * wl),
            ]
        })
        .collect();
    EmCalibration {
        clusters: vec![
            ClusterCalibration {
                cpus: CpuMask::from_cpus(&[0, 1]),
                leakage_divisor: 1,
                tables: vec![vec![opp(1_000_000, 800_000, 512, 200)]],
            },
            ClusterCalibration {
                cpus: CpuMask::from_cpus(&[2, 3]),
                leakage_divisor: 1,
                tables,
            },
        ],
        dsu: None,
    }
}

#[test]
fn test_single_table_model_only_accepts_default() {
    let model = build_energy_model(&calibration(1)).expect("model");
    assert_eq!(model.kind(), ModelKind::SingleTable);
    assert!(model.select_workload_table(ClusterId(1), WorkloadType::DEFAULT));
    assert!(!model.select_workload_table(ClusterId(1), WorkloadType(1)));
    assert!(!model.select_workload_table(ClusterId(2), WorkloadType::DEFAULT));
}

#[test]
fn test_bad_extra_table_degrades_to_single_table() {
    let mut calibration = calibration(2);
    // second workload out of order
    calibration.clusters[1].tables[1].swap(0, 1);
    let model = build_energy_model(&calibration).expect("degraded model");
    assert_eq!(model.kind(), ModelKind::SingleTable);
    assert_eq!(model.active().workload(ClusterId(1)), Some(WorkloadType::DEFAULT));
}

#[test]
fn test_bad_default_table_fails() {
    let mut calibration = calibration(2);
    calibration.clusters[0].tables[0].clear();
    assert_eq!(
        build_energy_model(&calibration).err(),
        Some(EmError::EmptyTable { cluster: 0 })
    );
}

#[test]
fn test_zero_leakage_divisor_fails() {
    let mut calibration = calibration(1);
    calibration.clusters[1].leakage_divisor = 0;
    assert_eq!(
        build_energy_model(&calibration).err(),
        Some(EmError::BadLeakageDivisor { cluster: 1 })
    );
}

#[test]
fn test_bad_dsu_section_is_dropped() {
    let mut calibration = calibration(1);
    calibration.dsu = Some(nexa_eas::energy::DsuCalibration {
        shared_rail_cluster: 9,
        opps: Vec::new(),
    });
    let model = build_energy_model(&calibration).expect("model");
    assert!(model.dsu().is_none());
}

#[test]
fn test_held_snapshot_survives_switch() {
    let model = build_energy_model(&calibration(2)).expect("model");
    let before = model.active();
    assert!(model.select_workload_table(ClusterId(1), WorkloadType(1)));
    assert_eq!(before.workload(ClusterId(1)), Some(WorkloadType::DEFAULT));
    assert_eq!(before.table(ClusterId(1)).map(|t| t.max_opp().dyn_power), Some(1000));
    let after = model.active();
    assert_eq!(after.table(ClusterId(1)).map(|t| t.max_opp().dyn_power), Some(1100));
}

#[test]
fn test_readers_never_see_mixed_tables() {
    let model: Arc<dyn nexa_eas::EnergyModel> = Arc::from(build_energy_model(&calibration(3)).expect("model"));
    let stop = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let model = Arc::clone(&model);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut reads = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let active = model.active();
                    let workload = active.workload(ClusterId(1)).expect("workload");
                    let table = active.table(ClusterId(1)).expect("table");
                    assert_eq!(table.max_opp().dyn_power, 1000 + 100 * workload.0 as u64);
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for round in 0..2_000u32 {
        assert!(model.select_workload_table(ClusterId(1), WorkloadType((round % 3) as u8)));
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        reader.join().expect("reader panicked");
    }
}
