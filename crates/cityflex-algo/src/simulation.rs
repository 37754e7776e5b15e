//! Rolling-horizon (model predictive) simulation.
//!
//! [`RollingHorizon`] plans the optimisation window, executes its first
//! `step_width` steps as planned and moves the window on by that many steps,
//! until the next window would reach past the simulation horizon:
//!
//! ```text
//! simu_horizon  |---------------------------------------|
//! window 1      [=====plan=====]
//!                executed ^^^^
//! window 2             [=====plan=====]
//!                       executed ^^^^
//! ```
//!
//! Storage levels at the end of the executed part carry over into the next
//! window. The executed parts of all windows are joined into one timeline
//! per entity and committed to a separate slot; the district's window and
//! initial energy are restored afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use cityflex_core::{CityDistrict, EntityId, Schedule, CURRENT};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::algorithms::{AlgorithmConfig, RunReport};
use crate::error::{SchedulingError, SchedulingResult};
use crate::solver::{ClarabelBackend, SolverBackend};

/// Slot the executed timelines are committed to by default.
pub const SIMULATED: &str = "simulated";

/// Outcome of a rolling-horizon simulation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub slot: String,
    /// Number of optimisation windows planned.
    pub windows: usize,
    /// Steps covered by the committed timelines.
    pub steps: usize,
    pub runs: Vec<RunReport>,
}

pub struct RollingHorizon {
    config: AlgorithmConfig,
    step_width: Option<usize>,
    slot: String,
    backend: Arc<dyn SolverBackend>,
}

impl RollingHorizon {
    pub fn new(config: AlgorithmConfig) -> Self {
        RollingHorizon {
            config,
            step_width: None,
            slot: SIMULATED.to_string(),
            backend: Arc::new(ClarabelBackend),
        }
    }

    /// Steps executed per window; defaults to the optimisation horizon.
    pub fn with_step_width(mut self, steps: usize) -> Self {
        self.step_width = Some(steps);
        self
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = slot.into();
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn SolverBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Simulate the district over its simulation horizon.
    ///
    /// `"current"` holds the plan of the last window afterwards. Nothing is
    /// written to the simulation slot when a window fails.
    pub fn run(&self, district: &mut CityDistrict) -> SchedulingResult<SimulationReport> {
        if self.slot == CURRENT {
            return Err(SchedulingError::ModelBuild(
                "simulated timelines cannot overwrite the current plan".into(),
            ));
        }
        let env = district.env().clone();
        let energy = district.initial_energy().clone();
        let outcome = self.simulate(district);
        district.set_env(env);
        district.set_initial_energy(energy);

        let (timelines, report) = outcome?;
        let guard = district.begin_run()?;
        district.commit_run(&guard, &self.slot, timelines);
        info!(
            slot = %report.slot,
            windows = report.windows,
            steps = report.steps,
            "simulated timelines committed"
        );
        Ok(report)
    }

    fn simulate(
        &self,
        district: &mut CityDistrict,
    ) -> SchedulingResult<(HashMap<EntityId, Schedule>, SimulationReport)> {
        let timer = district.env().timer.clone();
        let horizon = timer.op_horizon;
        let width = self.step_width.unwrap_or(horizon);
        if width == 0 || width > horizon {
            return Err(SchedulingError::ModelBuild(format!(
                "step width must lie in 1..={horizon}, got {width}"
            )));
        }
        let algorithm = self.config.build(self.backend.clone());

        let mut timelines: HashMap<EntityId, Schedule> = HashMap::new();
        let mut runs = Vec::new();
        let mut offset = 0;
        loop {
            let report = algorithm.run(district)?;
            debug!(
                window = runs.len() + 1,
                start = timer.start + offset,
                status = ?report.status,
                "window planned"
            );
            runs.push(report);
            let carried = execute(district, width, &mut timelines)?;
            district.set_initial_energy(carried);

            if offset + width + horizon > timer.simu_horizon() {
                break;
            }
            offset += width;
            let next = district.env().advanced(width)?;
            district.set_env(Arc::new(next));
        }

        let report = SimulationReport {
            slot: self.slot.clone(),
            windows: runs.len(),
            steps: offset + width,
            runs,
        };
        Ok((timelines, report))
    }
}

/// Append the first `width` planned steps of every entity to its timeline
/// and return the storage levels reached.
fn execute(
    district: &CityDistrict,
    width: usize,
    timelines: &mut HashMap<EntityId, Schedule>,
) -> SchedulingResult<HashMap<EntityId, f64>> {
    let mut carried = HashMap::new();
    for entity in district.entities() {
        let plan = district
            .store()
            .require(entity.id(), CURRENT)
            .map_err(|e| SchedulingError::ModelBuild(e.to_string()))?;
        let timeline = timelines.entry(entity.id()).or_default();
        for (quantity, values) in plan.iter() {
            let executed = values.get(..width).ok_or_else(|| {
                SchedulingError::ModelBuild(format!(
                    "plan of entity {} covers {} steps, {width} to execute",
                    entity.id(),
                    values.len()
                ))
            })?;
            let mut joined = timeline.get(quantity).map(<[f64]>::to_vec).unwrap_or_default();
            joined.extend_from_slice(executed);
            timeline.insert(quantity, joined);
        }
        let storage = entity.as_device().and_then(|d| d.storage_quantity());
        if let Some(level) = storage.and_then(|q| plan.get(q)).and_then(|e| e.get(width - 1)) {
            carried.insert(entity.id(), *level);
        }
    }
    Ok(carried)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::AlgorithmKind;
    use cityflex_core::{
        Battery, Device, Entity, Environment, FixedLoad, Objective, Prices, Quantity, Timer,
        Weather,
    };

    fn district() -> (CityDistrict, EntityId) {
        let env = Environment::new(
            Timer::new(3600, 4).unwrap(),
            Prices {
                energy: vec![1.0; 4],
                ..Prices::default()
            },
            Weather::default(),
        )
        .unwrap();
        let mut district = CityDistrict::new(Arc::new(env), Objective::PeakShaving);
        let mut building = Entity::building("bd", Objective::PeakShaving)
            .with_child(
                Entity::apartment("ap")
                    .with_child(Entity::device("fl", Device::FixedLoad(FixedLoad::new(vec![1.0; 4]))))
                    .unwrap(),
            )
            .unwrap();
        let bat = building
            .energy_system_mut()
            .unwrap()
            .add_child(Entity::device("bat", Device::Battery(Battery::new(10.0, 5.0, 0.5))))
            .unwrap();
        district.add_building(building, (0.0, 0.0)).unwrap();
        (district, bat)
    }

    #[test]
    fn execute_joins_windows_and_carries_storage() {
        let (district, bat) = district();
        for entity in district.entities() {
            let mut plan = Schedule::new().with(Quantity::PEl, vec![1.0, 2.0, 3.0, 4.0]);
            if entity.id() == bat {
                plan.insert(Quantity::EEl, vec![5.0, 6.0, 7.0, 8.0]);
            }
            district.store().commit(entity.id(), CURRENT, plan);
        }

        let mut timelines = HashMap::new();
        let carried = execute(&district, 2, &mut timelines).unwrap();
        assert_eq!(carried, HashMap::from([(bat, 6.0)]));
        let carried = execute(&district, 3, &mut timelines).unwrap();
        assert_eq!(carried[&bat], 7.0);

        let timeline = &timelines[&bat];
        assert_eq!(timeline.p_el().unwrap(), &[1.0, 2.0, 1.0, 2.0, 3.0]);
        assert_eq!(timeline.get(Quantity::EEl).unwrap(), &[5.0, 6.0, 5.0, 6.0, 7.0]);
        assert_eq!(timelines.len(), district.entities().len());
    }

    #[test]
    fn execute_needs_a_plan() {
        let (district, _) = district();
        let err = execute(&district, 1, &mut HashMap::new()).unwrap_err();
        assert!(matches!(err, SchedulingError::ModelBuild(_)));
    }

    #[test]
    fn invalid_settings_leave_district_untouched() {
        let (mut district, _) = district();
        let central = AlgorithmConfig::new(AlgorithmKind::Central);
        let err = RollingHorizon::new(central.clone())
            .with_slot(CURRENT)
            .run(&mut district)
            .unwrap_err();
        assert!(matches!(err, SchedulingError::ModelBuild(_)));

        for width in [0, 5] {
            let err = RollingHorizon::new(central.clone())
                .with_step_width(width)
                .run(&mut district)
                .unwrap_err();
            assert!(err.to_string().contains("step width"));
        }
        assert!(district.store().snapshot().is_empty());
    }
}
