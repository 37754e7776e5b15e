//! Re-dispatch of a committed plan under deviating demand.

mod common;

use cityflex_algo::{
    run, simulate_actual, ActualSimulation, AlgorithmConfig, AlgorithmKind, Realization,
    SchedulingError, SolverOptions, ACTUAL,
};
use cityflex_core::{
    CityDistrict, Device, Entity, EntityId, Generator, Objective, Quantity, CURRENT,
};
use common::*;

struct Case {
    district: CityDistrict,
    building: EntityId,
    fixed_load: EntityId,
    space_heating: EntityId,
    storage: EntityId,
}

fn case() -> Case {
    let mut district = CityDistrict::new(env(3600, vec![10.0; 4]), Objective::PeakShaving);
    let building = district
        .add_building(
            heated_building("bd", Objective::PeakShaving, vec![10.0; 4], vec![10.0; 4], 20.0, 20.0),
            (0.0, 0.0),
        )
        .unwrap();
    let device = |matches: fn(&Device) -> bool| {
        district.buildings()[0]
            .devices()
            .find(|(_, d)| matches(d))
            .map(|(e, _)| e.id())
            .unwrap()
    };
    let fixed_load = device(|d| matches!(d, Device::FixedLoad(_)));
    let space_heating = device(|d| matches!(d, Device::SpaceHeating(_)));
    let storage = device(|d| matches!(d, Device::ThermalHeatingStorage(_)));
    Case {
        district,
        building,
        fixed_load,
        space_heating,
        storage,
    }
}

#[test]
fn storage_absorbs_deviation_until_empty() {
    let c = case();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &c.district).unwrap();
    assert_close(&current_p_el(&c.district, c.building), &[20.0; 4], 1e-4);

    let realization = Realization::new()
        .with(c.space_heating, vec![11.0; 4])
        .with(c.fixed_load, vec![10.0, 13.0, 13.0, 13.0]);
    let report = simulate_actual(&c.district, &realization, &SolverOptions::default()).unwrap();
    assert_eq!(report.slot, ACTUAL);
    assert_eq!(report.steps, 4);
    assert!((report.max_deviation - 3.0).abs() < 1e-3);

    let store = c.district.store();
    let deviation = store.compare(c.building, CURRENT, ACTUAL).unwrap();
    assert_close(&deviation, &[0.0, 0.0, 0.0, 3.0], 1e-3);

    // the storage discharges 4 kW in step 2 to cover a 1 kW heat deviation
    let storage = store
        .compare_quantity(c.storage, Quantity::PThHeat, CURRENT, ACTUAL)
        .unwrap();
    let heating = store
        .compare_quantity(c.space_heating, Quantity::PThHeat, CURRENT, ACTUAL)
        .unwrap();
    assert!((storage[1] + 4.0).abs() < 1e-3);
    assert!((heating[1] - 1.0).abs() < 1e-6);
    assert!(storage[1].abs() > heating[1].abs());

    let energy = store.get(c.storage, ACTUAL).unwrap();
    assert_close(energy.get(Quantity::EThHeat).unwrap(), &[9.0, 5.0, 1.0, 0.0], 1e-3);

    let district = store.compare(c.district.id(), CURRENT, ACTUAL).unwrap();
    assert_close(&district, &[0.0, 0.0, 0.0, 3.0], 1e-3);
}

#[test]
fn forecast_realization_reproduces_plan() {
    let c = case();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &c.district).unwrap();
    let report = ActualSimulation::new()
        .with_slot("replay")
        .run(&c.district, &Realization::new())
        .unwrap();
    assert!(report.max_deviation < 1e-3);
    let deviation = c.district.store().compare(c.building, CURRENT, "replay").unwrap();
    assert_close(&deviation, &[0.0; 4], 1e-3);
}

/// Self-consuming building with a 2 kW load and a curtailable 10 kW PV.
fn curtailing_district() -> (CityDistrict, EntityId, EntityId) {
    let mut district = CityDistrict::new(env(3600, vec![10.0; 4]), Objective::PeakShaving);
    let mut building = load_building("bd", vec![2.0; 4]);
    building.set_objective(Objective::SelfConsumption).unwrap();
    let pv = Entity::device("pv", Device::Photovoltaic(Generator::new(vec![10.0; 4]).curtailable()));
    let pv_id = building
        .energy_system_mut()
        .unwrap()
        .add_child(pv)
        .unwrap();
    let building = district.add_building(building, (0.0, 0.0)).unwrap();
    (district, building, pv_id)
}

#[test]
fn curtailed_generation_replays_plan() {
    let (district, building, pv) = curtailing_district();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &district).unwrap();
    assert_close(&current_p_el(&district, pv), &[-2.0; 4], 1e-3);

    let report = ActualSimulation::new()
        .with_slot("replay")
        .run(&district, &Realization::new())
        .unwrap();
    assert!(report.max_deviation < 1e-3, "deviation {}", report.max_deviation);
    let deviation = district.store().compare(building, CURRENT, "replay").unwrap();
    assert_close(&deviation, &[0.0; 4], 1e-3);
}

#[test]
fn actual_generation_caps_curtailable_output() {
    let (district, building, pv) = curtailing_district();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &district).unwrap();

    let realization = Realization::new().with(pv, vec![1.0, 10.0, 12.0, 0.5]);
    let report = ActualSimulation::new().run(&district, &realization).unwrap();
    assert!((report.max_deviation - 1.5).abs() < 1e-3);

    let store = district.store();
    let output = store.get(pv, ACTUAL).unwrap();
    assert_close(output.p_el().unwrap(), &[-1.0, -2.0, -2.0, -0.5], 1e-3);
    let deviation = store.compare(building, CURRENT, ACTUAL).unwrap();
    assert_close(&deviation, &[1.0, 0.0, 0.0, 1.5], 1e-3);
}

#[test]
fn district_generator_is_redispatched() {
    let mut district = CityDistrict::new(env(3600, vec![10.0; 2]), Objective::PeakShaving);
    district
        .add_building(load_building("bd", vec![3.0; 2]), (0.0, 0.0))
        .unwrap();
    let pv = district
        .add_generator(
            Entity::device("pv", Device::Photovoltaic(Generator::new(vec![1.0; 2]))),
            (0.0, 0.0),
        )
        .unwrap();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &district).unwrap();

    let realization = Realization::new().with(pv, vec![0.0, 2.0]);
    let report = ActualSimulation::new().run(&district, &realization).unwrap();
    assert!((report.max_deviation - 1.0).abs() < 1e-6);
    let store = district.store();
    assert_close(store.get(pv, ACTUAL).unwrap().p_el().unwrap(), &[0.0, -2.0], 1e-6);
    let total = store.compare(district.id(), CURRENT, ACTUAL).unwrap();
    assert_close(&total, &[1.0, -1.0], 1e-6);
}

#[test]
fn missing_plan_is_a_build_error() {
    let c = case();
    let err = ActualSimulation::new()
        .run(&c.district, &Realization::new())
        .unwrap_err();
    assert!(matches!(err, SchedulingError::ModelBuild(_)));
    assert!(c.district.store().snapshot().is_empty());
}

#[test]
fn actual_series_must_cover_window() {
    let c = case();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &c.district).unwrap();
    let before = c.district.store().snapshot();
    let realization = Realization::new().with(c.fixed_load, vec![10.0; 2]);
    let err = ActualSimulation::new().run(&c.district, &realization).unwrap_err();
    assert!(err.to_string().contains("2 steps"));
    assert_eq!(c.district.store().snapshot(), before);
}

#[test]
fn current_slot_cannot_be_overwritten() {
    let c = case();
    run(&AlgorithmConfig::new(AlgorithmKind::Central), &c.district).unwrap();
    assert!(ActualSimulation::new()
        .with_slot(CURRENT)
        .run(&c.district, &Realization::new())
        .is_err());
}
