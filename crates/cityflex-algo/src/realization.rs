//! Re-dispatch of a committed plan against realised conditions.
//!
//! After a plan is committed to `"current"`, the uncontrollable devices
//! (fixed loads, thermal demands, generators) may turn out differently from
//! their forecasts. [`ActualSimulation`] walks the optimisation window step
//! by step: in every step the uncontrollable devices follow their actual
//! values, storages and heat producers are free to compensate, all other
//! devices keep their plan, and each building or district generator tries to
//! stay on its planned electrical trajectory. Curtailable generators keep
//! their planned output unless an actual value is given, which then only
//! caps the output. Storage levels carry over from one step to the next.
//! The result is committed to a separate slot, so
//! [`ScheduleStore::compare`](cityflex_core::ScheduleStore::compare) shows
//! the deviation per step.

use std::collections::HashMap;
use std::sync::Arc;

use cityflex_core::{
    CityDistrict, Device, Entity, EntityId, Environment, Quantity, Schedule, CURRENT,
};
use tracing::{debug, info};

use crate::builder::{Bounds, BuildContext, ProblemBuilder};
use crate::error::{SchedulingError, SchedulingResult};
use crate::solver::{ClarabelBackend, SolverBackend, SolverOptions};

/// Slot the realised schedules are committed to by default.
pub const ACTUAL: &str = "actual";

/// Realised values of uncontrollable devices over the optimisation window.
///
/// Values use the convention of the device's forecast field (demand or
/// generation). Devices without an entry follow their forecast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Realization {
    actual: HashMap<EntityId, Vec<f64>>,
}

impl Realization {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, device: EntityId, values: Vec<f64>) -> Self {
        self.actual.insert(device, values);
        self
    }

    pub fn set(&mut self, device: EntityId, values: Vec<f64>) {
        self.actual.insert(device, values);
    }

    pub fn get(&self, device: EntityId) -> Option<&[f64]> {
        self.actual.get(&device).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.actual.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actual.is_empty()
    }
}

/// Outcome of a realisation run.
#[derive(Debug, Clone, PartialEq)]
pub struct RealizationReport {
    pub slot: String,
    pub steps: usize,
    /// Largest absolute per-step deviation of any building from its plan.
    pub max_deviation: f64,
}

/// Step-wise re-dispatch of the committed plan.
pub struct ActualSimulation {
    slot: String,
    solver: SolverOptions,
    backend: Arc<dyn SolverBackend>,
}

impl Default for ActualSimulation {
    fn default() -> Self {
        ActualSimulation {
            slot: ACTUAL.to_string(),
            solver: SolverOptions::default(),
            backend: Arc::new(ClarabelBackend),
        }
    }
}

/// Per-step values of one node, filled in step by step.
type Trajectories = HashMap<(EntityId, Quantity), Vec<f64>>;

/// What the re-dispatch holds fixed or restricts.
#[derive(Debug, Default)]
struct Held {
    pins: Trajectories,
    bounds: Bounds,
}

impl ActualSimulation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = slot.into();
        self
    }

    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn SolverBackend>) -> Self {
        self.backend = backend;
        self
    }

    /// Simulate every building and district generator and commit the
    /// realised schedules.
    ///
    /// Requires a `"current"` plan for every node and every controllable
    /// device that is kept on plan. Nothing is written when a step fails.
    pub fn run(
        &self,
        district: &CityDistrict,
        realization: &Realization,
    ) -> SchedulingResult<RealizationReport> {
        if self.slot == CURRENT {
            return Err(SchedulingError::ModelBuild(
                "realised schedules cannot overwrite the current plan".into(),
            ));
        }
        let guard = district.begin_run()?;
        let env = district.env();
        let horizon = env.timer.op_horizon;

        let mut schedules: HashMap<EntityId, Schedule> = HashMap::new();
        let mut total = vec![0.0; horizon];
        let mut max_deviation: f64 = 0.0;
        for node in district.nodes() {
            let plan_p = planned_p_el(district, node.id())?;
            let trajectories = self.simulate_node(district, env, node, &plan_p, realization)?;

            for ((id, quantity), values) in trajectories {
                schedules.entry(id).or_default().insert(quantity, values);
            }
            if let Some(actual) = schedules.get(&node.id()).and_then(Schedule::p_el) {
                for (t, (a, p)) in actual.iter().zip(&plan_p).enumerate() {
                    total[t] += a;
                    max_deviation = max_deviation.max((a - p).abs());
                }
            }
        }
        schedules.insert(district.id(), Schedule::new().with(Quantity::PEl, total));

        district.commit_run(&guard, &self.slot, schedules);
        info!(
            slot = %self.slot,
            steps = horizon,
            max_deviation,
            "realised schedules committed"
        );
        Ok(RealizationReport {
            slot: self.slot.clone(),
            steps: horizon,
            max_deviation,
        })
    }

    fn simulate_node(
        &self,
        district: &CityDistrict,
        env: &Environment,
        node: &Entity,
        plan: &[f64],
        realization: &Realization,
    ) -> SchedulingResult<Trajectories> {
        let start = env.timer.start;
        let horizon = env.timer.op_horizon;
        let held = self.held_trajectories(district, env, node, realization)?;

        let mut out = Trajectories::new();
        let mut energy = district.initial_energy().clone();
        for t in 0..horizon {
            let mut ctx = BuildContext::new(env)
                .window(start + t, 1)
                .with_initial_energy(energy.clone());
            ctx.end_constraints = false;
            for ((id, quantity), values) in &held.pins {
                ctx = ctx.pin(*id, *quantity, vec![values[t]]);
            }
            for ((id, quantity), bounds) in &held.bounds {
                ctx = ctx.bound(*id, *quantity, vec![bounds[t]]);
            }

            let mut builder = ProblemBuilder::new(ctx)?;
            let vars = builder.add_entity(node)?;
            let p = vars.p_el.ok_or_else(|| {
                SchedulingError::ModelBuild(format!(
                    "{} {} has no electrical trajectory",
                    node.kind().tag(),
                    node.id()
                ))
            })?;
            // (p - plan)²
            let model = builder.model_mut();
            model.add_square(p[0], 1.0);
            model.add_linear(p[0], -2.0 * plan[t]);
            model.add_offset(plan[t] * plan[t]);
            let (model, layout) = builder.finish();

            let scope = format!("realisation of {} {} at step {t}", node.kind().tag(), node.id());
            let solution = self.backend.solve(&model, &self.solver)?.into_result(&scope)?;
            for (id, schedule) in layout.schedules(&solution.values) {
                for (quantity, values) in schedule.iter() {
                    out.entry((id, quantity)).or_default().extend_from_slice(values);
                    if matches!(quantity, Quantity::EEl | Quantity::EThHeat) {
                        if let Some(e) = values.first() {
                            energy.insert(id, e.max(0.0));
                        }
                    }
                }
            }
            debug!(
                node = %node.id(),
                step = t,
                squared_deviation = solution.objective,
                "realised step"
            );
        }
        Ok(out)
    }

    /// Trajectories held during the re-dispatch: actual values for
    /// uncontrollable devices, the plan for devices that cannot compensate
    /// and for curtailable generators without actual values.
    fn held_trajectories(
        &self,
        district: &CityDistrict,
        env: &Environment,
        node: &Entity,
        realization: &Realization,
    ) -> SchedulingResult<Held> {
        let range = env.timer.op_range();
        let horizon = range.len();
        let mut held = Held::default();
        for (entity, device) in node.devices() {
            if let Some((quantity, forecast)) = device.forecast(range.clone()) {
                let actual = realization.get(entity.id());
                if let Some(actual) = actual.filter(|a| a.len() != horizon) {
                    return Err(SchedulingError::ModelBuild(format!(
                        "actual values of {} '{}' have {} steps, window has {horizon}",
                        device.tag(),
                        entity.name(),
                        actual.len()
                    )));
                }
                match (is_curtailable(device), actual) {
                    (true, Some(actual)) => {
                        let caps = actual.iter().map(|g| (-g, 0.0)).collect();
                        held.bounds.insert((entity.id(), quantity), caps);
                    }
                    (true, None) => {
                        let plan = planned_p_el(district, entity.id())?;
                        held.pins.insert((entity.id(), quantity), plan);
                    }
                    (false, Some(actual)) => {
                        held.pins.insert((entity.id(), quantity), in_device_sign(device, actual));
                    }
                    (false, None) => {
                        held.pins.insert((entity.id(), quantity), forecast);
                    }
                }
            } else if !device.compensates() {
                let plan = district
                    .store()
                    .require(entity.id(), CURRENT)
                    .map_err(|e| SchedulingError::ModelBuild(e.to_string()))?;
                if let Some(p) = plan.p_el() {
                    held.pins.insert((entity.id(), Quantity::PEl), p.to_vec());
                }
            }
        }
        Ok(held)
    }
}

fn planned_p_el(district: &CityDistrict, id: EntityId) -> SchedulingResult<Vec<f64>> {
    let plan = district
        .store()
        .require(id, CURRENT)
        .map_err(|e| SchedulingError::ModelBuild(e.to_string()))?;
    plan.p_el()
        .map(<[f64]>::to_vec)
        .ok_or_else(|| SchedulingError::ModelBuild(format!("plan of entity {id} has no p_el")))
}

fn is_curtailable(device: &Device) -> bool {
    matches!(
        device,
        Device::Photovoltaic(g) | Device::WindEnergyConverter(g) if g.curtailable
    )
}

/// Re-dispatch the current plan with the Clarabel backend into [`ACTUAL`].
pub fn simulate_actual(
    district: &CityDistrict,
    realization: &Realization,
    solver: &SolverOptions,
) -> SchedulingResult<RealizationReport> {
    ActualSimulation::new()
        .with_solver(solver.clone())
        .run(district, realization)
}

fn in_device_sign(device: &Device, values: &[f64]) -> Vec<f64> {
    match device {
        Device::Photovoltaic(_) | Device::WindEnergyConverter(_) => values.iter().map(|v| -v).collect(),
        _ => values.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cityflex_core::{FixedLoad, Generator};

    #[test]
    fn realization_entries() {
        let id = EntityId::new(7);
        let mut realization = Realization::new().with(id, vec![1.0, 2.0]);
        assert_eq!(realization.get(id), Some(&[1.0, 2.0][..]));
        realization.set(id, vec![3.0]);
        assert_eq!(realization.len(), 1);
        assert_eq!(realization.get(EntityId::new(8)), None);
    }

    #[test]
    fn only_curtailable_generators_are_capped() {
        let pv = Device::Photovoltaic(Generator::new(vec![1.0]));
        assert!(!is_curtailable(&pv));
        let wec = Device::WindEnergyConverter(Generator::new(vec![1.0]).curtailable());
        assert!(is_curtailable(&wec));
        assert!(!is_curtailable(&Device::FixedLoad(FixedLoad::new(vec![1.0]))));
    }

    #[test]
    fn generation_is_negated() {
        let pv = Device::Photovoltaic(Generator::new(vec![0.0]));
        assert_eq!(in_device_sign(&pv, &[2.0, 0.5]), vec![-2.0, -0.5]);
        let fl = Device::FixedLoad(FixedLoad::new(vec![0.0]));
        assert_eq!(in_device_sign(&fl, &[2.0]), vec![2.0]);
    }
}
