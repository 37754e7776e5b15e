//! Shared district fixtures.

#![allow(dead_code)]

use std::sync::Arc;

use cityflex_core::{
    Battery, CityDistrict, Device, ElectricalHeater, Entity, EntityId, Environment, FixedLoad,
    Objective, Prices, Quantity, SpaceHeating, ThermalHeatingStorage, Timer, Weather, CURRENT,
};

pub fn env(step: u32, prices: Vec<f64>) -> Arc<Environment> {
    let h = prices.len();
    Arc::new(
        Environment::new(
            Timer::new(step, h).unwrap(),
            Prices {
                energy: prices,
                ..Prices::default()
            },
            Weather::default(),
        )
        .unwrap(),
    )
}

/// Building with one apartment (fixed load, space heating) and an energy
/// system of electrical heater and thermal storage.
pub fn heated_building(
    name: &str,
    objective: Objective,
    fixed_load: Vec<f64>,
    space_heating: Vec<f64>,
    storage: f64,
    heater: f64,
) -> Entity {
    let mut building = Entity::building(name, objective);
    let apartment = Entity::apartment(format!("{name}-ap"))
        .with_child(Entity::device("fl", Device::FixedLoad(FixedLoad::new(fixed_load))))
        .unwrap()
        .with_child(Entity::device("sh", Device::SpaceHeating(SpaceHeating::new(space_heating))))
        .unwrap();
    building.add_child(apartment).unwrap();
    let bes = building.energy_system_mut().unwrap();
    bes.add_child(Entity::device(
        "ths",
        Device::ThermalHeatingStorage(ThermalHeatingStorage::new(storage, 0.5)),
    ))
    .unwrap();
    bes.add_child(Entity::device(
        "eh",
        Device::ElectricalHeater(ElectricalHeater::new(heater)),
    ))
    .unwrap();
    building
}

/// Building with a fixed load only.
pub fn load_building(name: &str, load: Vec<f64>) -> Entity {
    Entity::building(name, Objective::PeakShaving)
        .with_child(
            Entity::apartment(format!("{name}-ap"))
                .with_child(Entity::device("fl", Device::FixedLoad(FixedLoad::new(load))))
                .unwrap(),
        )
        .unwrap()
}

/// Building with a fixed load and a battery.
pub fn battery_building(name: &str, objective: Objective, load: Vec<f64>) -> Entity {
    let mut building = load_building(name, load);
    building.set_objective(objective).unwrap();
    building
        .energy_system_mut()
        .unwrap()
        .add_child(Entity::device(
            "bat",
            Device::Battery(Battery::new(10.0, 5.0, 0.5)),
        ))
        .unwrap();
    building
}

/// Two heated buildings whose plans are fully determined: 20 kW and 40 kW
/// in every step.
pub fn two_heated_buildings() -> (CityDistrict, EntityId, EntityId) {
    let mut district = CityDistrict::new(env(900, vec![10.0; 2]), Objective::PeakShaving);
    let b1 = district
        .add_building(
            heated_building("bd-1", Objective::PeakShaving, vec![10.0; 2], vec![10.0; 2], 40.0, 10.0),
            (0.0, 0.0),
        )
        .unwrap();
    let b2 = district
        .add_building(
            heated_building("bd-2", Objective::PeakShaving, vec![20.0; 2], vec![20.0; 2], 40.0, 20.0),
            (1.0, 0.0),
        )
        .unwrap();
    (district, b1, b2)
}

pub fn current_p_el(district: &CityDistrict, id: EntityId) -> Vec<f64> {
    district
        .store()
        .get(id, CURRENT)
        .and_then(|s| s.get(Quantity::PEl).map(<[f64]>::to_vec))
        .unwrap()
}

pub fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (t, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "step {t}: {a} differs from {e} by more than {tol}"
        );
    }
}
