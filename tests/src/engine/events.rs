//! Bring-up, CPU lifecycle and runtime controls

use nexa_eas::flt::DEFAULT_WINDOW_NS;
use nexa_eas::{
    build_energy_model, ClusterId, CpuMask, EasConfig, EasEngine, EasError, EmError, PlacementPath,
    SchedulerEventSink, SchedulingExtension, TaskId, Timeout, WorkloadType,
};

use crate::mock::{
    cpu, engine_with, request, three_gear_calibration, two_gear, two_gear_calibration,
    two_gear_engine, MockHost, TaskBuilder,
};

const W: u64 = DEFAULT_WINDOW_NS;

#[test]
fn test_cpus_start_offline() {
    let engine = EasEngine::new(
        MockHost::new(4),
        two_gear(),
        Some(&two_gear_calibration()),
        EasConfig::default(),
    )
    .expect("engine");
    assert!(engine.rq(cpu(0)).is_none());
    assert_eq!(engine.cpu_demand(cpu(0)), None);

    engine.on_cpu_online(cpu(0));
    assert!(engine.rq(cpu(0)).is_some());
    assert!(engine.rq(cpu(1)).is_none());
}

#[test]
fn test_online_of_unknown_cpu_is_ignored() {
    let engine = two_gear_engine();
    engine.on_cpu_online(cpu(9));
    assert!(engine.rq(cpu(9)).is_none());
    assert_eq!(engine.on_cpu_offline(cpu(9), 0), Ok(()));
}

#[test]
fn test_offline_waits_for_in_flight_migration() {
    let engine = two_gear_engine();
    let rq = engine.rq(cpu(1)).expect("online");
    assert!(rq.claim_active_balance());

    // mock clock already sits past the deadline
    assert_eq!(
        engine.on_cpu_offline(cpu(1), 0),
        Err(Timeout {
            deadline_ns: 0,
            polls: 1
        })
    );
    assert!(engine.rq(cpu(1)).is_none());

    engine.active_migration_done(cpu(1));
    engine.on_cpu_online(cpu(1));
    assert_eq!(engine.on_cpu_offline(cpu(1), 0), Ok(()));
}

#[test]
fn test_offline_drops_tracked_load() {
    let engine = two_gear_engine();
    let mut task = SchedulingExtension::new(TaskId(1));
    engine.on_context_switch(cpu(0), None, Some(&mut task), W);
    engine.on_tick(cpu(0), Some(&mut task), 2 * W);
    assert_eq!(engine.cpu_demand(cpu(0)), Some(512));

    assert_eq!(engine.on_cpu_offline(cpu(0), u64::MAX), Ok(()));
    engine.on_cpu_online(cpu(0));
    assert_eq!(engine.cpu_demand(cpu(0)), Some(0));
}

#[test]
fn test_with_model_rejects_cluster_mismatch() {
    let model = build_energy_model(&three_gear_calibration()).expect("model");
    let result = EasEngine::with_model(MockHost::new(4), two_gear(), model, EasConfig::default());
    assert_eq!(
        result.err(),
        Some(EasError::ModelMismatch {
            model: 3,
            topology: 2
        })
    );
}

#[test]
fn test_mismatched_calibration_runs_without_model() {
    let engine = engine_with(two_gear(), Some(&three_gear_calibration()), EasConfig::default());
    assert!(engine.model().is_none());

    let mut task = SchedulingExtension::new(TaskId(1));
    let placement = engine.on_wakeup(&request(1, 0, 600), &mut task);
    assert!(placement.path.is_fallback());
    assert_eq!(engine.telemetry().cpu_stats(cpu(0)).fallbacks, 1);
}

fn shifted_calibration() -> nexa_eas::EmCalibration {
    let mut calibration = two_gear_calibration();
    calibration.clusters[0].cpus = CpuMask::from_cpus(&[0, 1, 2]);
    calibration.clusters[1].cpus = CpuMask::from_cpus(&[3]);
    calibration
}

#[test]
fn test_with_model_rejects_cpu_mask_mismatch() {
    let model = build_energy_model(&shifted_calibration()).expect("model");
    let result = EasEngine::with_model(MockHost::new(4), two_gear(), model, EasConfig::default());
    assert_eq!(
        result.err(),
        Some(EasError::ClusterMaskMismatch {
            cluster: 0,
            model: 0b111,
            topology: 0b011
        })
    );
}

#[test]
fn test_mask_mismatched_calibration_runs_without_model() {
    let engine = engine_with(two_gear(), Some(&shifted_calibration()), EasConfig::default());
    assert!(engine.model().is_none());
}

#[test]
fn test_undecodable_blob_is_an_error() {
    let result = EasEngine::from_blob(
        MockHost::new(4),
        two_gear(),
        &[0xde, 0xad],
        EasConfig::default(),
    );
    assert!(matches!(result.err(), Some(EasError::EnergyModel(EmError::Blob(_)))));
}

#[test]
fn test_thermal_ceiling_limits_placement() {
    let engine = two_gear_engine();
    assert!(engine.set_thermal_ceiling(ClusterId(1), Some(1_400_000)));
    assert_eq!(engine.capacity_ceiling(ClusterId(1)), 512);

    // neither gear can take 600 any more
    let mut task = SchedulingExtension::new(TaskId(1));
    let placement = engine.on_wakeup(&request(1, 0, 600), &mut task);
    assert_eq!(placement.path, PlacementPath::AllowedFirst);
    assert_eq!(placement.cpu, Some(cpu(0)));

    assert!(engine.set_thermal_ceiling(ClusterId(1), None));
    assert_eq!(engine.capacity_ceiling(ClusterId(1)), 1024);
    let placement = engine.on_wakeup(&request(1, 0, 600), &mut task);
    assert_eq!(placement.cpu, Some(cpu(2)));

    assert!(!engine.set_thermal_ceiling(ClusterId(5), None));
}

#[test]
fn test_thermal_ceiling_needs_energy_model() {
    let engine = engine_with(two_gear(), None, EasConfig::default());
    assert!(!engine.set_thermal_ceiling(ClusterId(1), Some(1_400_000)));
    assert_eq!(engine.capacity_ceiling(ClusterId(1)), 1024);
    assert!(engine.set_thermal_ceiling(ClusterId(1), None));
}

#[test]
fn test_select_workload() {
    let engine = two_gear_engine();
    assert!(engine.select_workload(ClusterId(0), WorkloadType::DEFAULT));
    assert!(!engine.select_workload(ClusterId(0), WorkloadType(1)));
    assert!(!engine.select_workload(ClusterId(4), WorkloadType::DEFAULT));

    let bare = engine_with(two_gear(), None, EasConfig::default());
    assert!(!bare.select_workload(ClusterId(0), WorkloadType::DEFAULT));
}

#[test]
fn test_placement_counters() {
    let engine = two_gear_engine();
    engine.host().run(1, TaskBuilder::fair(5, 300).build());
    let mut task = SchedulingExtension::new(TaskId(1));

    let mut req = request(1, 0, 100);
    req.this_cpu = cpu(3);
    engine.on_wakeup(&req, &mut task);
    engine.on_wakeup(&req, &mut task);

    let stats = engine.telemetry().cpu_stats(cpu(3));
    assert_eq!(stats.placements, 2);
    assert_eq!(stats.energy_evals, 4);
    assert_eq!(stats.fallbacks, 0);
    assert_eq!(engine.telemetry().totals().placements, 2);
}
