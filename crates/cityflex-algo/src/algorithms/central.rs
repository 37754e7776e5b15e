//! Central optimisation: the whole district as one model.
//!
//! The model contains every entity of the hierarchy. Its objective is the
//! district objective on the district trajectory plus `beta` times each
//! building's objective on that building's trajectory. The result is the
//! reference optimum the distributed algorithms are measured against.

use std::sync::Arc;

use cityflex_core::{CityDistrict, Quantity, CURRENT};
use tracing::{info, warn};
use web_time::Instant;

use super::{AlgorithmKind, IterationRecord, RunOptions, RunReport, RunStatus, SchedulingAlgorithm};
use crate::builder::{scope_of, BuildContext, ProblemBuilder};
use crate::error::{SchedulingError, SchedulingResult};
use crate::solver::{ClarabelBackend, SolveStatus, SolverBackend};

pub struct CentralOptimization {
    options: RunOptions,
    backend: Arc<dyn SolverBackend>,
}

impl CentralOptimization {
    pub fn new(options: RunOptions) -> Self {
        CentralOptimization {
            options,
            backend: Arc::new(ClarabelBackend),
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn SolverBackend>) -> Self {
        self.backend = backend;
        self
    }
}

impl SchedulingAlgorithm for CentralOptimization {
    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::Central
    }

    fn run(&self, district: &CityDistrict) -> SchedulingResult<RunReport> {
        let start = Instant::now();
        let guard = district.begin_run()?;
        let env = district.env();

        let ctx = BuildContext::new(env)
            .with_robustness(self.options.robustness)
            .with_initial_energy(district.initial_energy().clone());
        let mut builder = ProblemBuilder::new(ctx)?;
        let root = builder.add_entity(district.root())?;
        let p_district = root
            .p_el
            .ok_or_else(|| SchedulingError::ModelBuild("district has no electrical trajectory".into()))?;
        builder.add_objective(&scope_of(district.root()), &p_district, district.objective(), 1.0)?;
        for building in district.buildings() {
            let Some(objective) = building.objective() else {
                continue;
            };
            let p = builder
                .layout()
                .p_el(building.id())
                .map(<[_]>::to_vec)
                .unwrap_or_default();
            builder.add_objective(&scope_of(building), &p, objective, self.options.beta)?;
        }
        let (model, layout) = builder.finish();
        info!(
            buildings = district.buildings().len(),
            generators = district.generators().len(),
            vars = model.num_vars(),
            constraints = model.num_constraints(),
            backend = self.backend.id(),
            "central model built"
        );

        let solution = self
            .backend
            .solve(&model, &self.options.solver)?
            .into_result("central problem")?;
        let schedules = layout.schedules(&solution.values);
        let district_objective = schedules
            .get(&district.id())
            .and_then(|s| s.get(Quantity::PEl))
            .map(|p| {
                district
                    .objective()
                    .evaluate(p, env.energy_prices(), env.co2_intensity())
            })
            .unwrap_or(0.0);

        district.commit_run(&guard, CURRENT, schedules);
        drop(guard);

        let status = if solution.status == SolveStatus::Optimal {
            RunStatus::Optimal
        } else {
            warn!(status = %solution.status, "central schedule committed at reduced accuracy");
            RunStatus::Approximate
        };
        let elapsed = start.elapsed().as_millis();
        info!(
            objective = solution.objective,
            district_objective,
            time_ms = elapsed,
            "central schedule committed"
        );
        Ok(RunReport {
            algorithm: AlgorithmKind::Central,
            status,
            iterations: 1,
            history: vec![IterationRecord {
                iteration: 1,
                primal_residual: 0.0,
                dual_residual: None,
                elapsed_ms: elapsed,
            }],
            district_objective,
            solve_time_ms: elapsed,
        })
    }
}
