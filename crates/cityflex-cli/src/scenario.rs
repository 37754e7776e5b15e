//! TOML scenario files.
//!
//! ```toml
//! [environment.timer]
//! step_size = 3600
//! op_horizon = 4
//!
//! [environment.prices]
//! energy = [20.0, 20.0, 30.0, 30.0]
//!
//! [district]
//! objective = "peak-shaving"
//! generators = [{ name = "park", type = "photovoltaic", generation = [0.0, 4.0, 6.0, 0.0] }]
//!
//! [[buildings]]
//! name = "bd-1"
//! objective = "price"
//!
//! [[buildings.apartments]]
//! name = "ap-1"
//! devices = [{ name = "fl", type = "fixed-load", demand = [2.0, 3.0, 2.0, 3.0] }]
//!
//! [[buildings.energy_system]]
//! name = "bat"
//! type = "battery"
//! capacity = 10.0
//! soc_init = 0.5
//! p_charge_max = 5.0
//! p_discharge_max = 5.0
//!
//! [algorithm]
//! kind = "exchange-admm"
//!
//! [[actual]]
//! building = "bd-1"
//! device = "fl"
//! values = [2.0, 4.0, 2.0, 3.0]
//! ```
//!
//! Actual values of a district generator omit `building`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use cityflex_algo::{AlgorithmConfig, Realization, SolverOptions};
use cityflex_core::{CityDistrict, Device, Entity, EntityId, Environment, Objective};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    pub environment: Environment,
    #[serde(default)]
    pub district: DistrictSpec,
    #[serde(default)]
    pub buildings: Vec<BuildingSpec>,
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
    /// Overrides the solver settings of `[algorithm]`.
    #[serde(default)]
    pub solver: Option<SolverOptions>,
    /// Realised values of uncontrollable devices, for `simulate`.
    #[serde(default)]
    pub actual: Vec<ActualSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistrictSpec {
    #[serde(default)]
    pub objective: Objective,
    /// Photovoltaic or wind generators connected to the district directly.
    #[serde(default)]
    pub generators: Vec<GeneratorSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneratorSpec {
    pub name: String,
    #[serde(default)]
    pub position: (f64, f64),
    #[serde(flatten)]
    pub device: Device,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildingSpec {
    pub name: String,
    #[serde(default)]
    pub objective: Objective,
    #[serde(default)]
    pub position: (f64, f64),
    #[serde(default)]
    pub apartments: Vec<ApartmentSpec>,
    #[serde(default)]
    pub energy_system: Vec<DeviceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApartmentSpec {
    pub name: String,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSpec {
    pub name: String,
    #[serde(flatten)]
    pub device: Device,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActualSpec {
    #[serde(default)]
    pub building: Option<String>,
    pub device: String,
    pub values: Vec<f64>,
}

/// A scenario turned into a district ready to schedule.
#[derive(Debug)]
pub struct LoadedScenario {
    pub district: CityDistrict,
    pub config: AlgorithmConfig,
    pub realization: Realization,
}

impl Scenario {
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read scenario {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("failed to parse scenario {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Build the district hierarchy and resolve the actual values.
    pub fn build(&self) -> Result<LoadedScenario> {
        self.environment
            .validate()
            .context("invalid environment")?;
        let mut district =
            CityDistrict::new(Arc::new(self.environment.clone()), self.district.objective);

        let mut devices: HashMap<DeviceKey, EntityId> = HashMap::new();
        for spec in &self.buildings {
            let building = build_building(spec, &mut devices)
                .with_context(|| format!("invalid building '{}'", spec.name))?;
            district
                .add_building(building, spec.position)
                .with_context(|| format!("cannot add building '{}'", spec.name))?;
        }
        for spec in &self.district.generators {
            let generator = Entity::device(spec.name.clone(), spec.device.clone());
            if devices.insert((None, spec.name.clone()), generator.id()).is_some() {
                bail!("district generator name '{}' is used twice", spec.name);
            }
            district
                .add_generator(generator, spec.position)
                .with_context(|| format!("cannot add district generator '{}'", spec.name))?;
        }

        let mut realization = Realization::new();
        for actual in &self.actual {
            let id = devices
                .get(&(actual.building.clone(), actual.device.clone()))
                .ok_or_else(|| match &actual.building {
                    Some(building) => anyhow!(
                        "actual values reference unknown device '{}' in building '{building}'",
                        actual.device,
                    ),
                    None => anyhow!(
                        "actual values reference unknown district generator '{}'",
                        actual.device
                    ),
                })?;
            realization.set(*id, actual.values.clone());
        }

        let mut config = self.algorithm.clone();
        if let Some(solver) = &self.solver {
            config.options.solver = solver.clone();
        }
        debug!(
            buildings = district.buildings().len(),
            generators = district.generators().len(),
            actual = realization.len(),
            algorithm = %config.kind,
            "scenario loaded"
        );
        Ok(LoadedScenario {
            district,
            config,
            realization,
        })
    }
}

/// Building name (none for district generators) and device name.
type DeviceKey = (Option<String>, String);

fn build_building(
    spec: &BuildingSpec,
    devices: &mut HashMap<DeviceKey, EntityId>,
) -> Result<Entity> {
    let mut register = |device: &DeviceSpec| -> Result<Entity> {
        let entity = Entity::device(device.name.clone(), device.device.clone());
        if devices
            .insert((Some(spec.name.clone()), device.name.clone()), entity.id())
            .is_some()
        {
            bail!("device name '{}' is used twice", device.name);
        }
        Ok(entity)
    };

    let mut building = Entity::building(spec.name.clone(), spec.objective);
    for ap in &spec.apartments {
        let mut apartment = Entity::apartment(ap.name.clone());
        for device in &ap.devices {
            apartment.add_child(register(device)?)?;
        }
        building.add_child(apartment)?;
    }
    if !spec.energy_system.is_empty() {
        let bes = building.energy_system_mut()?;
        for device in &spec.energy_system {
            bes.add_child(register(device)?)?;
        }
    }
    Ok(building)
}

/// Read and build a scenario file.
pub fn load(path: &Path) -> Result<LoadedScenario> {
    Scenario::from_path(path)?.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cityflex_algo::AlgorithmKind;

    const SCENARIO: &str = r#"
[environment.timer]
step_size = 3600
op_horizon = 2

[environment.prices]
energy = [10.0, 20.0]

[[buildings]]
name = "bd"
objective = "price"

[[buildings.apartments]]
name = "ap"
devices = [{ name = "fl", type = "fixed-load", demand = [1, 2] }]

[[buildings.energy_system]]
name = "bat"
type = "battery"
capacity = 4.0
soc_init = 0.5
p_charge_max = 2.0
p_discharge_max = 2.0

[algorithm]
kind = "dual-decomposition"
beta = 0.5

[solver]
max_iterations = 50

[[actual]]
building = "bd"
device = "fl"
values = [1.5, 2.0]
"#;

    #[test]
    fn parses_and_builds() {
        let loaded = Scenario::parse(SCENARIO).unwrap().build().unwrap();
        assert_eq!(loaded.district.buildings().len(), 1);
        let building = &loaded.district.buildings()[0];
        assert_eq!(building.name(), "bd");
        assert_eq!(building.objective(), Some(Objective::Price));
        assert_eq!(building.devices().count(), 2);
        assert_eq!(loaded.config.kind, AlgorithmKind::DualDecomposition);
        assert_eq!(loaded.config.options.beta, 0.5);
        assert_eq!(loaded.config.options.solver.max_iterations, 50);
        assert_eq!(loaded.realization.len(), 1);
    }

    #[test]
    fn unknown_actual_device_rejected() {
        let text = SCENARIO.replace("device = \"fl\"", "device = \"pv\"");
        let err = Scenario::parse(&text).unwrap().build().unwrap_err();
        assert!(err.to_string().contains("unknown device 'pv'"));
    }

    #[test]
    fn unknown_device_type_rejected() {
        let text = SCENARIO.replace("type = \"battery\"", "type = \"flux-capacitor\"");
        assert!(Scenario::parse(&text).is_err());
    }

    #[test]
    fn district_generators_follow_buildings() {
        let mut text = SCENARIO.replace(
            "[[buildings]]",
            r#"[district]
generators = [{ name = "park", type = "wind-energy-converter", generation = [3, 4], curtailable = true }]

[[buildings]]"#,
        );
        text.push_str("\n[[actual]]\ndevice = \"park\"\nvalues = [2.0, 2.0]\n");
        let loaded = Scenario::parse(&text).unwrap().build().unwrap();
        let district = &loaded.district;
        assert_eq!(district.buildings().len(), 1);
        assert_eq!(district.generators().len(), 1);
        assert_eq!(district.nodes()[1].name(), "park");
        let park = district.generators()[0].id();
        assert_eq!(loaded.realization.get(park), Some(&[2.0, 2.0][..]));
        assert_eq!(loaded.realization.len(), 2);
    }

    #[test]
    fn district_generator_must_be_renewable() {
        let text = SCENARIO.replace(
            "[[buildings]]",
            "[district]\ngenerators = [{ name = \"fl\", type = \"fixed-load\", demand = [1, 1] }]\n\n[[buildings]]",
        );
        let err = Scenario::parse(&text).unwrap().build().unwrap_err();
        assert!(format!("{err:#}").contains("cannot add district generator 'fl'"));
    }

    #[test]
    fn unknown_district_generator_rejected() {
        let text = SCENARIO.replace("building = \"bd\"\n", "");
        let err = Scenario::parse(&text).unwrap().build().unwrap_err();
        assert!(err.to_string().contains("unknown district generator 'fl'"));
    }

    #[test]
    fn short_forecast_rejected() {
        let text = SCENARIO.replace("demand = [1, 2]", "demand = [1]");
        let err = Scenario::parse(&text).unwrap().build().unwrap_err();
        assert!(format!("{err:#}").contains("cannot add building 'bd'"));
    }
}
