//! End to end scenarios through the event interface

use nexa_eas::flt::{GroupId, DEFAULT_WINDOW_NS, GROUP_COUNT};
use nexa_eas::{
    ClusterId, PlacementPath, SchedPolicy, SchedulerEventSink, SchedulingExtension, TaskId,
    WakerInfo,
};

use crate::mock::{cpu, request, three_gear_engine, two_gear_engine, TaskBuilder};

const W: u64 = DEFAULT_WINDOW_NS;
const MS: u64 = 1_000_000;

#[test]
fn test_task_too_big_for_little_goes_big() {
    let engine = two_gear_engine();
    let mut task = SchedulingExtension::new(TaskId(1));
    let placement = engine.on_wakeup(&request(1, 0, 600), &mut task);
    let chosen = placement.cpu.expect("a cpu");
    assert_eq!(engine.topology().cluster_of(chosen), Some(ClusterId(1)));
    assert_eq!(placement.path, PlacementPath::SingleCandidate);
}

#[test]
fn test_sync_wakeup_stays_with_rt_waker() {
    let engine = two_gear_engine();
    engine.host().update_cpu(1, |s| s.rt_nr_running = 2);
    let mut req = request(1, 1, 100);
    req.sync = true;
    req.waker = Some(WakerInfo {
        policy: SchedPolicy::Realtime,
        prio: 40,
        per_cpu_kthread: false,
    });
    let mut task = SchedulingExtension::new(TaskId(1));
    let placement = engine.on_wakeup(&req, &mut task);

    assert_eq!(placement.path, PlacementPath::SyncWaker);
    assert_eq!(placement.cpu, Some(cpu(1)));
    assert_eq!(engine.telemetry().cpu_stats(cpu(1)).energy_evals, 0);
}

#[test]
fn test_rotation_toggle_stops_swaps_under_pressure() {
    let engine = three_gear_engine();
    engine.host().reject_migrations(true);
    assert!(engine.tunables().set_rotation(false));
    for raw in 0..4u16 {
        engine
            .host()
            .run(raw, TaskBuilder::fair(u64::from(raw) + 1, 500).rotation_candidate().build());
    }
    engine.host().run(7, TaskBuilder::fair(99, 300).rotation_candidate().build());

    for round in 0..5u64 {
        for raw in 0..4u16 {
            engine.on_tick(cpu(raw), None, (10 + 10 * round + u64::from(raw)) * MS);
        }
    }
    assert!(engine.host().swaps().is_empty());
    assert_eq!(engine.telemetry().totals().rotations, 0);
    assert_eq!(engine.telemetry().totals().misfit_requests, 20);
}

#[test]
fn test_zero_threshold_hints_every_loaded_group() {
    let engine = two_gear_engine();
    for raw in 0..GROUP_COUNT as u8 {
        let group = GroupId::new(raw).expect("group");
        assert!(engine.tunables().set_group_threshold_pct(group, 0));
    }

    let mut little = SchedulingExtension::new(TaskId(1));
    let mut big = SchedulingExtension::new(TaskId(2));
    assert!(engine.set_task_group(&mut little, Some(1), None));
    assert!(engine.set_task_group(&mut big, Some(3), None));
    engine.on_context_switch(cpu(0), None, Some(&mut little), W);
    engine.on_context_switch(cpu(2), None, Some(&mut big), W);
    engine.on_tick(cpu(0), Some(&mut little), 2 * W);
    engine.on_tick(cpu(2), Some(&mut big), 2 * W);

    let hints = engine.update_group_hints(2 * W);
    assert_eq!(hints.hints, [false, true, false, true]);
}
