//! Energy estimation against calibrated tables

use nexa_eas::estimate::{compute_energy, energy_delta, CpuEnergyInput, EnergyEnv};
use nexa_eas::{build_energy_model, ClusterId, CpuId};

use crate::mock::{cpu, three_gear, three_gear_calibration, two_gear, two_gear_calibration};

fn util_only(utils: &'static [u64]) -> impl Fn(CpuId) -> CpuEnergyInput {
    move |cpu| CpuEnergyInput {
        util: utils.get(cpu.index()).copied().unwrap_or(0),
        temperature_c: None,
    }
}

#[test]
fn test_bigger_task_costs_more() {
    let topology = two_gear();
    let model = build_energy_model(&two_gear_calibration()).expect("model");
    let deltas: Vec<u64> = [100u64, 300, 500, 700]
        .iter()
        .map(|util| {
            let mut env =
                EnergyEnv::new(&topology, &*model, *util, None, util_only(&[]), |_| 1024);
            energy_delta(&mut env, cpu(2)).expect("delta")
        })
        .collect();
    assert!(deltas.windows(2).all(|pair| pair[0] < pair[1]), "{:?}", deltas);
}

#[test]
fn test_spreading_beats_raising_cluster_opp() {
    let topology = two_gear();
    let model = build_energy_model(&two_gear_calibration()).expect("model");
    // stacking on cpu 2 pushes the shared cluster point to the top
    let mut env = EnergyEnv::new(&topology, &*model, 200, None, util_only(&[0, 0, 800, 0]), |_| 1024);
    let on_busy = energy_delta(&mut env, cpu(2)).expect("delta");
    let on_idle = energy_delta(&mut env, cpu(3)).expect("delta");
    assert!(on_idle < on_busy, "busy {} idle {}", on_busy, on_idle);
}

#[test]
fn test_thermal_ceiling_caps_operating_point() {
    let topology = two_gear();
    let model = build_energy_model(&two_gear_calibration()).expect("model");

    let mut free = EnergyEnv::new(&topology, &*model, 0, None, util_only(&[0, 0, 900]), |_| 1024);
    assert_eq!(free.baseline(ClusterId(1)).map(|b| b.opp.capacity), Some(1024));

    let mut capped = EnergyEnv::new(&topology, &*model, 0, None, util_only(&[0, 0, 900]), |c| {
        if c == ClusterId(1) {
            512
        } else {
            1024
        }
    });
    let base = capped.baseline(ClusterId(1)).expect("baseline");
    assert_eq!(base.opp.capacity, 512);
    assert_eq!(base.busy, 900);
}

#[test]
fn test_dsu_share_follows_fastest_cluster() {
    let topology = three_gear();
    let model = build_energy_model(&three_gear_calibration()).expect("model");
    let mut env = EnergyEnv::new(
        &topology,
        &*model,
        0,
        None,
        util_only(&[0, 0, 0, 0, 0, 0, 0, 600]),
        |_| 1024,
    );
    // top DSU point (200) weighted by 600 busy units over 8 CPUs
    let estimate = compute_energy(&mut env, ClusterId(0), None).expect("estimate");
    assert_eq!(estimate.dynamic, 0);
    assert_eq!(estimate.dsu, 200 * 600 / (1024 * 8));
    assert_eq!(estimate.total, estimate.dsu);
    assert_eq!(env.counters().baselines, 3);
}

#[test]
fn test_unknown_cluster_has_no_estimate() {
    let topology = two_gear();
    let model = build_energy_model(&two_gear_calibration()).expect("model");
    let mut env = EnergyEnv::new(&topology, &*model, 100, None, util_only(&[]), |_| 1024);
    assert!(compute_energy(&mut env, ClusterId(5), None).is_none());
}

#[test]
fn test_source_cpu_is_credited_back() {
    let topology = two_gear();
    let model = build_energy_model(&two_gear_calibration()).expect("model");
    let mut stay = EnergyEnv::new(&topology, &*model, 300, Some(cpu(2)), util_only(&[0, 0, 300]), |_| 1024);
    let back_home = energy_delta(&mut stay, cpu(2)).expect("delta");
    let mut fresh = EnergyEnv::new(&topology, &*model, 300, None, util_only(&[]), |_| 1024);
    let from_idle = energy_delta(&mut fresh, cpu(2)).expect("delta");
    assert_eq!(back_home, from_idle);
}
