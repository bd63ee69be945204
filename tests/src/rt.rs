//! Realtime placement

use nexa_eas::rt::select_rt_cpu;
use nexa_eas::{CpuMask, PlacementPath, PlacementRequest, SchedPolicy, SchedulerEventSink, SchedulingExtension, TaskId};

use crate::mock::{cpu, request, two_gear, two_gear_calibration, two_gear_engine, Harness, TaskBuilder};

fn harness() -> Harness {
    Harness::new(two_gear(), Some(&two_gear_calibration()))
}

fn rt_request(prev: u16, prio: u8) -> PlacementRequest {
    let mut req = request(7, prev, 100);
    req.policy = SchedPolicy::Realtime;
    req.prio = prio;
    req
}

#[test]
fn test_shallowest_idle_wins() {
    let h = harness();
    h.host.update_cpu(0, |s| s.idle_exit_latency = 5);
    h.host.update_cpu(1, |s| s.idle_exit_latency = 0);
    h.host.update_cpu(2, |s| s.idle_exit_latency = 3);
    h.host.update_cpu(3, |s| s.idle_exit_latency = 3);
    let decision = select_rt_cpu(&h.env(), &rt_request(2, 50), 100);
    assert_eq!(decision.placement.path, PlacementPath::RtIdle);
    assert_eq!(decision.placement.cpu, Some(cpu(1)));
    assert_eq!(decision.energy_evals, 0);
}

#[test]
fn test_tie_in_one_cluster_takes_first() {
    let h = harness();
    h.host.update_cpu(0, |s| s.idle_exit_latency = 5);
    h.host.update_cpu(1, |s| s.idle_exit_latency = 5);
    let decision = select_rt_cpu(&h.env(), &rt_request(0, 50), 100);
    assert_eq!(decision.placement.cpu, Some(cpu(2)));
    assert_eq!(decision.energy_evals, 0);
    assert!(decision.candidates.test(cpu(2)) && decision.candidates.test(cpu(3)));
}

#[test]
fn test_tie_across_clusters_is_energy_broken() {
    let h = harness();
    h.host.update_cpu(0, |s| s.idle_exit_latency = 5);
    h.host.update_cpu(3, |s| s.idle_exit_latency = 5);
    // cpu 1 and cpu 2 tie at latency 0
    let decision = select_rt_cpu(&h.env(), &rt_request(2, 50), 100);
    assert_eq!(decision.placement.path, PlacementPath::RtIdle);
    assert_eq!(decision.placement.cpu, Some(cpu(1)));
    assert_eq!(decision.energy_evals, 2);
    assert!(decision.energy.is_some());
}

#[test]
fn test_tie_across_clusters_without_model_takes_first() {
    let h = Harness::new(two_gear(), None);
    let decision = select_rt_cpu(&h.env(), &rt_request(2, 50), 100);
    assert_eq!(decision.placement.cpu, Some(cpu(0)));
    assert_eq!(decision.energy_evals, 0);
}

#[test]
fn test_preempts_least_important_fair_task() {
    let h = harness();
    h.host.run(0, TaskBuilder::fair(1, 100).build());
    h.host.run(1, TaskBuilder::fair(2, 100).prio(130).build());
    h.host.run(2, TaskBuilder::rt(3, 10).build());
    h.host.run(3, TaskBuilder::rt(4, 60).build());
    let decision = select_rt_cpu(&h.env(), &rt_request(2, 50), 100);
    assert_eq!(decision.placement.path, PlacementPath::RtPreemptFair);
    assert_eq!(decision.placement.cpu, Some(cpu(1)));
}

#[test]
fn test_preempts_lower_priority_rt_task() {
    let h = harness();
    h.host.run(0, TaskBuilder::rt(1, 10).build());
    h.host.run(1, TaskBuilder::rt(2, 60).build());
    h.host.run(2, TaskBuilder::rt(3, 70).build());
    h.host.run(3, TaskBuilder::rt(4, 40).build());
    let decision = select_rt_cpu(&h.env(), &rt_request(0, 50), 100);
    assert_eq!(decision.placement.path, PlacementPath::RtPreemptRt);
    assert_eq!(decision.placement.cpu, Some(cpu(2)));
}

#[test]
fn test_falls_back_to_prev() {
    let h = harness();
    for raw in 0..4 {
        h.host.run(raw, TaskBuilder::rt(u64::from(raw), 10).build());
    }
    let decision = select_rt_cpu(&h.env(), &rt_request(3, 50), 100);
    assert_eq!(decision.placement.path, PlacementPath::RtPrev);
    assert_eq!(decision.placement.cpu, Some(cpu(3)));
}

#[test]
fn test_nothing_when_prev_not_allowed() {
    let h = harness();
    for raw in 0..4 {
        h.host.run(raw, TaskBuilder::rt(u64::from(raw), 10).build());
    }
    let mut req = rt_request(3, 50);
    req.allowed = CpuMask::from_cpus(&[0, 1]);
    let decision = select_rt_cpu(&h.env(), &req, 100);
    assert_eq!(decision.placement.path, PlacementPath::NotFound);
    assert_eq!(decision.placement.cpu, None);
}

#[test]
fn test_engine_routes_rt_wakeups() {
    let engine = two_gear_engine();
    engine.host().run(0, TaskBuilder::fair(1, 100).build());
    let mut task = SchedulingExtension::new(TaskId(7));
    let placement = engine.on_wakeup(&rt_request(0, 50), &mut task);
    assert_eq!(placement.path, PlacementPath::RtIdle);
    assert_eq!(placement.cpu, Some(cpu(1)));
    assert_eq!(engine.telemetry().cpu_stats(cpu(0)).placements, 1);
}
