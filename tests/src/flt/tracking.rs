//! Load tracking driven through the engine's event interface

use nexa_eas::flt::{
    record_runtime, CpuCurr, CpuLoad, FltContext, FltEntity, FltEvent, GroupId, LoadWindow, Scale,
    WindowUpdate, DEFAULT_WINDOW_NS, GROUP_COUNT,
};
use nexa_eas::telemetry::TraceEvent;
use nexa_eas::{FltMode, SchedulerEventSink, SchedulingExtension, TaskId};

use crate::mock::{cpu, two_gear_engine};

const W: u64 = DEFAULT_WINDOW_NS;

#[test]
fn test_busy_window_reaches_cpu_task_and_group() {
    let engine = two_gear_engine();
    let mut task = SchedulingExtension::new(TaskId(1));
    assert!(engine.set_task_group(&mut task, Some(1), None));
    let group = GroupId::new(1).expect("group");

    engine.on_context_switch(cpu(0), None, Some(&mut task), W);
    engine.on_tick(cpu(0), Some(&mut task), 2 * W);

    // CPU 0 has half the capacity of the biggest CPU
    assert_eq!(engine.cpu_demand(cpu(0)), Some(512));
    assert_eq!(engine.cpu_group_demand(cpu(0), group), Some(512));
    assert_eq!(engine.cpu_group_demand(cpu(0), GroupId::new(0).expect("group")), Some(0));
    assert_eq!(engine.task_demand(&task), 512);
    assert_eq!(engine.rq(cpu(0)).map(|rq| rq.published_demand()), Some(512));

    let windows: Vec<_> = engine
        .telemetry()
        .snapshot()
        .into_iter()
        .filter(|event| matches!(event, TraceEvent::Window { .. }))
        .collect();
    assert_eq!(windows.len(), 1);
}

#[test]
fn test_idle_cpu_accumulates_nothing() {
    let engine = two_gear_engine();
    engine.on_tick(cpu(2), None, W);
    engine.on_tick(cpu(2), None, W + W / 2);
    engine.on_tick(cpu(2), None, 2 * W);
    assert_eq!(engine.cpu_demand(cpu(2)), Some(0));
}

#[test]
fn test_tickless_gap_reads_as_busy() {
    let engine = two_gear_engine();
    engine.on_tick(cpu(2), None, W);
    engine.on_tick(cpu(2), None, 4 * W);
    assert_eq!(engine.cpu_demand(cpu(2)), Some(1024));
    // little CPUs replay at their own capacity
    engine.on_tick(cpu(0), None, W);
    engine.on_tick(cpu(0), None, 4 * W);
    assert_eq!(engine.cpu_demand(cpu(0)), Some(512));
}

#[test]
fn test_samples_saturate_at_window_length() {
    let ctx = FltContext {
        mode: FltMode::TaskAndCpu,
        window_ns: W,
        scale: Scale::FULL,
    };
    let mut task = LoadWindow::new();
    let mut load = CpuLoad::new();
    let group = GroupId::new(1);
    let within_window = |window: &LoadWindow| {
        window.curr_sum() <= W && window.history().iter().all(|slot| slot.sum <= W && slot.util <= 1024)
    };

    let mut now = W / 3;
    for step in [W / 2, 3 * W, W + 7, 10 * W, W / 5, 2 * W] {
        now += step;
        record_runtime(FltEntity::Task(&mut task), FltEvent::PutPrev, now, 0, &ctx);
        record_runtime(
            FltEntity::Cpu {
                load: &mut load,
                curr: CpuCurr::Task { group },
            },
            FltEvent::Update,
            now,
            0,
            &ctx,
        );
        // interrupt time longer than the interval it is reported for
        now += step / 2 + 1;
        record_runtime(
            FltEntity::Cpu {
                load: &mut load,
                curr: CpuCurr::Idle,
            },
            FltEvent::IrqUpdate,
            now,
            4 * W,
            &ctx,
        );
        assert!(within_window(&task));
        assert!(within_window(&load.window));
        let groups = (0..GROUP_COUNT as u8).filter_map(GroupId::new);
        assert!(groups.map(|g| load.groups.window(g)).all(within_window));
    }
    assert_eq!(task.demand(), 1024);
}

#[test]
fn test_repeated_timestamp_is_skipped() {
    let ctx = FltContext {
        mode: FltMode::TaskAndCpu,
        window_ns: W,
        scale: Scale::FULL,
    };
    let mut task = LoadWindow::new();
    record_runtime(FltEntity::Task(&mut task), FltEvent::PickNext, W, 0, &ctx);
    record_runtime(FltEntity::Task(&mut task), FltEvent::PutPrev, W + 100, 0, &ctx);
    let before = task;
    let result = record_runtime(FltEntity::Task(&mut task), FltEvent::PutPrev, W + 100, 0, &ctx);
    assert_eq!(result, Some(WindowUpdate::Skipped));
    assert_eq!(task, before);
    assert_eq!(task.curr_sum(), 100);
}

#[test]
fn test_disabled_mode_tracks_nothing() {
    let engine = two_gear_engine();
    assert!(engine.tunables().set_flt_mode(FltMode::Disabled));
    let mut task = SchedulingExtension::new(TaskId(1));

    engine.on_context_switch(cpu(2), None, Some(&mut task), W);
    engine.on_tick(cpu(2), Some(&mut task), 3 * W);

    assert_eq!(engine.cpu_demand(cpu(2)), Some(0));
    assert!(!task.load.is_active());
}

#[test]
fn test_cpu_only_mode_leaves_tasks_alone() {
    let engine = two_gear_engine();
    assert!(engine.tunables().set_flt_mode(FltMode::CpuOnly));
    let mut task = SchedulingExtension::new(TaskId(1));

    engine.on_context_switch(cpu(2), None, Some(&mut task), W);
    engine.on_tick(cpu(2), Some(&mut task), 2 * W);

    assert_eq!(engine.cpu_demand(cpu(2)), Some(1024));
    assert_eq!(engine.task_demand(&task), 0);
}

#[test]
fn test_backwards_clock_is_counted_and_skipped() {
    let engine = two_gear_engine();
    engine.on_tick(cpu(1), None, 2 * W);
    engine.on_tick(cpu(1), None, 2 * W);
    engine.on_tick(cpu(1), None, W);
    assert_eq!(engine.telemetry().cpu_stats(cpu(1)).clock_skips, 1);
}

#[test]
fn test_irq_time_is_charged_to_cpu() {
    let engine = two_gear_engine();
    engine.on_tick(cpu(3), None, W);
    engine.on_irq_time(cpu(3), W / 4, W + W / 2);
    engine.on_tick(cpu(3), None, 2 * W);
    assert_eq!(engine.cpu_demand(cpu(3)), Some(256));
}

#[test]
fn test_migration_moves_in_flight_time() {
    let engine = two_gear_engine();
    let mut task = SchedulingExtension::new(TaskId(7));
    assert!(engine.set_task_group(&mut task, Some(2), None));
    let group = GroupId::new(2).expect("group");

    engine.on_context_switch(cpu(0), None, Some(&mut task), W);
    engine.on_enqueue(cpu(0), &mut task, W);
    engine.on_tick(cpu(0), Some(&mut task), W + W / 2);
    engine.on_context_switch(cpu(0), Some(&mut task), None, W + W / 2);

    let src_before = engine.rq(cpu(0)).map(|rq| rq.lock().load.window.curr_sum());
    assert_eq!(src_before, Some(W / 4));
    assert_eq!(task.load.curr_sum(), W / 4);

    engine.on_migrate(cpu(0), cpu(2), &mut task, W + W / 2);

    let (src, dst) = match (engine.rq(cpu(0)), engine.rq(cpu(2))) {
        (Some(src), Some(dst)) => (*src.lock(), *dst.lock()),
        _ => panic!("both cpus online"),
    };
    assert_eq!(src.load.window.curr_sum(), 0);
    assert_eq!(dst.load.window.curr_sum(), W / 4);
    assert_eq!(src.load.groups.window(group).curr_sum(), 0);
    assert_eq!(dst.load.groups.window(group).curr_sum(), W / 4);
    assert_eq!(src.load.groups.nr_running(group), 0);
    assert_eq!(dst.load.groups.nr_running(group), 1);
}

#[test]
fn test_group_counters_follow_enqueue_and_regroup() {
    let engine = two_gear_engine();
    let mut task = SchedulingExtension::new(TaskId(3));
    assert!(engine.set_task_group(&mut task, Some(0), None));
    let g0 = GroupId::new(0).expect("group");
    let g3 = GroupId::new(3).expect("group");

    engine.on_enqueue(cpu(1), &mut task, W);
    assert!(engine.set_task_group(&mut task, Some(3), Some(cpu(1))));
    let counts = engine
        .rq(cpu(1))
        .map(|rq| {
            let state = rq.lock();
            (state.load.groups.nr_running(g0), state.load.groups.nr_running(g3))
        })
        .expect("online");
    assert_eq!(counts, (0, 1));

    engine.on_dequeue(cpu(1), &mut task, 2 * W);
    let left = engine.rq(cpu(1)).map(|rq| rq.lock().load.groups.nr_running(g3));
    assert_eq!(left, Some(0));

    // rejected group ids change nothing
    assert!(!engine.set_task_group(&mut task, Some(9), Some(cpu(1))));
    assert_eq!(task.effective_group(), Some(g3));
}
