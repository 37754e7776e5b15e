//! Rolling-horizon simulation over a longer horizon.

mod common;

use std::sync::Arc;

use cityflex_algo::{AlgorithmConfig, AlgorithmKind, RollingHorizon, SchedulingError, SIMULATED};
use cityflex_core::{
    CityDistrict, Device, Environment, Objective, Prices, Quantity, Timer, Weather, CURRENT,
};
use common::*;

fn rolling_env(horizon: usize, prices: Vec<f64>) -> Arc<Environment> {
    let simu = prices.len();
    Arc::new(
        Environment::new(
            Timer::new(3600, horizon).unwrap().with_simu_horizon(simu),
            Prices {
                energy: prices,
                ..Prices::default()
            },
            Weather::default(),
        )
        .unwrap(),
    )
}

fn simulated_p_el(district: &CityDistrict, id: cityflex_core::EntityId) -> Vec<f64> {
    district
        .store()
        .get(id, SIMULATED)
        .and_then(|s| s.p_el().map(<[f64]>::to_vec))
        .unwrap()
}

#[test]
fn windows_cover_the_simulation_horizon() {
    let loads = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let mut district = CityDistrict::new(rolling_env(2, vec![10.0; 6]), Objective::PeakShaving);
    let bd = district
        .add_building(load_building("bd", loads.clone()), (0.0, 0.0))
        .unwrap();

    let report = RollingHorizon::new(AlgorithmConfig::new(AlgorithmKind::Central))
        .run(&mut district)
        .unwrap();
    assert_eq!(report.windows, 3);
    assert_eq!(report.steps, 6);
    assert_eq!(report.runs.len(), 3);
    assert_eq!(report.slot, SIMULATED);

    assert_close(&simulated_p_el(&district, bd), &loads, 1e-4);
    assert_close(&simulated_p_el(&district, district.id()), &loads, 1e-4);
    // the last window's plan stays current, the window is reset
    assert_close(&current_p_el(&district, bd), &[5.0, 6.0], 1e-4);
    assert_eq!(district.env().timer.start, 0);
    assert!(district.initial_energy().is_empty());
}

#[test]
fn narrower_step_width_plans_more_windows() {
    let loads = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let mut district = CityDistrict::new(rolling_env(2, vec![10.0; 6]), Objective::PeakShaving);
    let bd = district
        .add_building(load_building("bd", loads.clone()), (0.0, 0.0))
        .unwrap();

    let report = RollingHorizon::new(AlgorithmConfig::new(AlgorithmKind::ExchangeAdmm))
        .with_step_width(1)
        .with_slot("mpc")
        .run(&mut district)
        .unwrap();
    // windows start at steps 0 to 4; the last one ends at the horizon
    assert_eq!(report.windows, 5);
    assert_eq!(report.steps, 5);
    let executed = district.store().get(bd, "mpc").unwrap();
    assert_close(executed.p_el().unwrap(), &loads[..5], 1e-3);
}

#[test]
fn storage_level_carries_between_windows() {
    let prices = vec![1.0, 5.0, 1.0, 5.0, 1.0, 5.0];
    let mut district = CityDistrict::new(rolling_env(2, prices), Objective::None);
    let building = battery_building("bd", Objective::Price, vec![5.0; 6]);
    let bat = building
        .devices()
        .find(|(_, d)| matches!(d, Device::Battery(_)))
        .map(|(e, _)| e.id())
        .unwrap();
    district.add_building(building, (0.0, 0.0)).unwrap();

    RollingHorizon::new(AlgorithmConfig::new(AlgorithmKind::Central))
        .with_step_width(1)
        .run(&mut district)
        .unwrap();

    let executed = district.store().get(bat, SIMULATED).unwrap();
    let power = executed.p_el().unwrap();
    let energy = executed.get(Quantity::EEl).unwrap();
    assert_eq!(energy.len(), 5);
    // lossless battery, one-hour steps, starting half full
    let mut level = 5.0;
    for (p, e) in power.iter().zip(energy) {
        level += p;
        assert!((level - e).abs() < 1e-3, "level {level} vs executed {e}");
    }
    assert!(district.initial_energy().is_empty());
}

#[test]
fn failing_window_commits_nothing() {
    let mut district = CityDistrict::new(rolling_env(2, vec![10.0; 4]), Objective::Co2);
    district
        .add_building(load_building("bd", vec![1.0; 4]), (0.0, 0.0))
        .unwrap();
    let err = RollingHorizon::new(AlgorithmConfig::new(AlgorithmKind::Central))
        .run(&mut district)
        .unwrap_err();
    assert!(matches!(err, SchedulingError::ModelBuild(_)));
    assert!(district.store().snapshot().is_empty());
    assert_eq!(district.env().timer.start, 0);
    assert!(district.store().get(district.id(), CURRENT).is_none());
}
