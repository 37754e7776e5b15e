//! Iterative coordination of node sub-problems.
//!
//! The nodes of a district are its buildings and the generators attached to
//! the district itself. Every node is planned by its own sub-problem; a
//! [`CoordinationRule`]
//! turns the current iterate into penalty terms for the next round and
//! decides when the iterate is good enough. The engine itself is shared:
//!
//! ```text
//! Init ──▶ Iterate ──▶ Converged        commit current iterate
//!            │  ▲  ├─▶ MaxIterReached   commit best iterate, Approximate
//!            └──┘  └─▶ Diverged         commit nothing, error
//! ```
//!
//! Node sub-problems of one round only read the coordination signal, so
//! they are solved in parallel with rayon. The district sub-problem and the
//! signal update run after all nodes have returned.

use std::collections::HashMap;
use std::sync::Arc;

use cityflex_core::{
    CityDistrict, Entity, EntityId, Environment, Quantity, RunGuard, Schedule, CURRENT,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use web_time::Instant;

use super::{AlgorithmKind, IterationRecord, RunOptions, RunReport, RunStatus, SchedulingAlgorithm};
use crate::builder::{scope_of, BuildContext, Layout, ProblemBuilder};
use crate::error::{SchedulingError, SchedulingResult};
use crate::solver::{ClarabelBackend, Model, SolverBackend, Var};

/// Objective terms `quadratic · p[t]² + linear[t] · p[t]` added to a
/// sub-problem for one round.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Penalty {
    pub quadratic: f64,
    /// Empty when there is no linear term.
    pub linear: Vec<f64>,
}

impl Penalty {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn apply(&self, model: &mut Model, p: &[Var]) {
        for (t, var) in p.iter().enumerate() {
            if self.quadratic != 0.0 {
                model.add_square(*var, self.quadratic);
            }
            if let Some(coeff) = self.linear.get(t) {
                model.add_linear(*var, *coeff);
            }
        }
    }
}

/// Residuals of one coordination round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Residuals {
    pub primal: f64,
    /// Only reported by rules that track one.
    pub dual: Option<f64>,
}

/// Penalty and signal update of an iterative coordination scheme.
pub trait CoordinationRule: Send + Sync {
    /// Coordination state carried between rounds.
    type Signal: Send + Sync;

    fn name(&self) -> &'static str;

    fn kind(&self) -> AlgorithmKind;

    fn validate(&self) -> SchedulingResult<()> {
        Ok(())
    }

    fn init(&self, nodes: usize, horizon: usize) -> Self::Signal;

    fn node_penalty(&self, signal: &Self::Signal, node: usize) -> Penalty;

    /// Whether the district solves its own sub-problem. Without one the
    /// district trajectory is the sum of the nodes.
    fn coordinates_district(&self) -> bool {
        true
    }

    fn district_penalty(&self, signal: &Self::Signal) -> Penalty;

    /// Advance the signal after round `iteration` (1-based).
    fn update(
        &self,
        signal: &mut Self::Signal,
        iteration: usize,
        district: &[f64],
        nodes: &[Vec<f64>],
    ) -> Residuals;

    fn converged(&self, residuals: &Residuals) -> bool;
}

fn norm2(values: impl Iterator<Item = f64>) -> f64 {
    values.map(|v| v * v).sum::<f64>().sqrt()
}

/// Node sum minus district trajectory, per step.
fn mismatch(district: &[f64], nodes: &[Vec<f64>]) -> Vec<f64> {
    district
        .iter()
        .enumerate()
        .map(|(t, p_d)| nodes.iter().map(|n| n[t]).sum::<f64>() - p_d)
        .collect()
}

/// Exchange ADMM over the district and its nodes.
///
/// The district takes part as the node `-p_district`, so all node
/// trajectories sum to zero at a consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExchangeAdmm {
    /// Step size of the scaled dual update and weight of the proximal term.
    pub rho: f64,
    pub eps_primal: f64,
    pub eps_dual: f64,
}

impl Default for ExchangeAdmm {
    fn default() -> Self {
        ExchangeAdmm {
            rho: 2.0,
            eps_primal: 0.1,
            eps_dual: 1.0,
        }
    }
}

/// Exchange ADMM state: previous iterate, node average and scaled dual.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeState {
    pub last_district: Vec<f64>,
    pub last_nodes: Vec<Vec<f64>>,
    pub mean: Vec<f64>,
    pub dual: Vec<f64>,
}

impl CoordinationRule for ExchangeAdmm {
    type Signal = ExchangeState;

    fn name(&self) -> &'static str {
        "exchange-admm"
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::ExchangeAdmm
    }

    fn validate(&self) -> SchedulingResult<()> {
        if !(self.rho > 0.0 && self.rho.is_finite()) {
            return Err(SchedulingError::ModelBuild(format!(
                "ADMM rho must be positive, got {}",
                self.rho
            )));
        }
        Ok(())
    }

    fn init(&self, nodes: usize, horizon: usize) -> ExchangeState {
        ExchangeState {
            last_district: vec![0.0; horizon],
            last_nodes: vec![vec![0.0; horizon]; nodes],
            mean: vec![0.0; horizon],
            dual: vec![0.0; horizon],
        }
    }

    fn node_penalty(&self, state: &ExchangeState, node: usize) -> Penalty {
        let last = &state.last_nodes[node];
        Penalty {
            quadratic: self.rho / 2.0,
            linear: (0..last.len())
                .map(|t| self.rho * (-last[t] + state.mean[t] + state.dual[t]))
                .collect(),
        }
    }

    fn district_penalty(&self, state: &ExchangeState) -> Penalty {
        let last = &state.last_district;
        Penalty {
            quadratic: self.rho / 2.0,
            linear: (0..last.len())
                .map(|t| self.rho * (-last[t] - state.mean[t] - state.dual[t]))
                .collect(),
        }
    }

    fn update(
        &self,
        state: &mut ExchangeState,
        _iteration: usize,
        district: &[f64],
        nodes: &[Vec<f64>],
    ) -> Residuals {
        let count = (nodes.len() + 1) as f64;
        let mean: Vec<f64> = mismatch(district, nodes)
            .into_iter()
            .map(|m| m / count)
            .collect();
        for (u, x) in state.dual.iter_mut().zip(&mean) {
            *u += x;
        }

        let shift: Vec<f64> = state.mean.iter().zip(&mean).map(|(a, b)| a - b).collect();
        let district_change = (0..district.len())
            .map(|t| -self.rho * (-district[t] + state.last_district[t] + shift[t]));
        let node_change = nodes
            .iter()
            .zip(&state.last_nodes)
            .flat_map(|(p, last)| {
                (0..p.len()).map(|t| -self.rho * (p[t] - last[t] + shift[t])).collect::<Vec<_>>()
            });
        let dual = norm2(district_change.chain(node_change));
        // norm of the stacked residual, the mean repeated for every node
        let primal = count.sqrt() * norm2(mean.iter().copied());

        state.mean = mean;
        state.last_district = district.to_vec();
        state.last_nodes = nodes.to_vec();
        Residuals {
            primal,
            dual: Some(dual),
        }
    }

    fn converged(&self, residuals: &Residuals) -> bool {
        residuals.primal <= self.eps_primal
            && residuals.dual.map_or(true, |s| s <= self.eps_dual)
    }
}

/// Dual decomposition with a per-step price signal `λ`.
///
/// Nodes pay `λ · p`, the district is paid `λ · p`, and `λ` moves along
/// the mismatch with step size `rho / (1 + step_decay · k)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DualDecomposition {
    pub rho: f64,
    pub eps_primal: f64,
    /// Diminishing step size; `0` keeps the step constant.
    pub step_decay: f64,
}

impl Default for DualDecomposition {
    fn default() -> Self {
        DualDecomposition {
            rho: 2.0,
            eps_primal: 0.1,
            step_decay: 0.0,
        }
    }
}

impl DualDecomposition {
    /// Step size used in round `iteration` (1-based).
    pub fn step(&self, iteration: usize) -> f64 {
        self.rho / (1.0 + self.step_decay * iteration.saturating_sub(1) as f64)
    }
}

impl CoordinationRule for DualDecomposition {
    type Signal = Vec<f64>;

    fn name(&self) -> &'static str {
        "dual-decomposition"
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::DualDecomposition
    }

    fn validate(&self) -> SchedulingResult<()> {
        if !(self.rho > 0.0 && self.rho.is_finite()) || self.step_decay < 0.0 {
            return Err(SchedulingError::ModelBuild(format!(
                "dual decomposition needs rho > 0 and step_decay >= 0, got {} and {}",
                self.rho, self.step_decay
            )));
        }
        Ok(())
    }

    fn init(&self, _nodes: usize, horizon: usize) -> Vec<f64> {
        vec![0.0; horizon]
    }

    fn node_penalty(&self, lambda: &Vec<f64>, _node: usize) -> Penalty {
        Penalty {
            quadratic: 0.0,
            linear: lambda.clone(),
        }
    }

    fn district_penalty(&self, lambda: &Vec<f64>) -> Penalty {
        Penalty {
            quadratic: 0.0,
            linear: lambda.iter().map(|l| -l).collect(),
        }
    }

    fn update(
        &self,
        lambda: &mut Vec<f64>,
        iteration: usize,
        district: &[f64],
        nodes: &[Vec<f64>],
    ) -> Residuals {
        let step = self.step(iteration);
        let gap = mismatch(district, nodes);
        for (l, g) in lambda.iter_mut().zip(&gap) {
            *l += step * g;
        }
        Residuals {
            primal: gap.iter().fold(0.0, |acc, g| acc.max(g.abs())),
            dual: None,
        }
    }

    fn converged(&self, residuals: &Residuals) -> bool {
        residuals.primal <= self.eps_primal
    }
}

/// Stand-alone baseline: each building optimises its building objective once,
/// unaware of the district. Device-level objectives are not modeled. District
/// generators follow their forecast or, when curtailable, any output within it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NoCoordination;

impl CoordinationRule for NoCoordination {
    type Signal = ();

    fn name(&self) -> &'static str {
        "stand-alone"
    }

    fn kind(&self) -> AlgorithmKind {
        AlgorithmKind::StandAlone
    }

    fn init(&self, _nodes: usize, _horizon: usize) -> Self::Signal {}

    fn node_penalty(&self, _signal: &(), _node: usize) -> Penalty {
        Penalty::none()
    }

    fn coordinates_district(&self) -> bool {
        false
    }

    fn district_penalty(&self, _signal: &()) -> Penalty {
        Penalty::none()
    }

    fn update(
        &self,
        _signal: &mut (),
        _iteration: usize,
        _district: &[f64],
        _nodes: &[Vec<f64>],
    ) -> Residuals {
        Residuals {
            primal: 0.0,
            dual: None,
        }
    }

    fn converged(&self, _residuals: &Residuals) -> bool {
        true
    }
}

/// Iteration budget and divergence detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IterationPolicy {
    pub max_iterations: usize,
    /// Primal residual above which a round counts towards divergence.
    pub divergence_threshold: f64,
    /// Consecutive rounds above the threshold before the run is abandoned.
    pub divergence_patience: usize,
}

impl Default for IterationPolicy {
    fn default() -> Self {
        IterationPolicy {
            max_iterations: 10_000,
            divergence_threshold: 1e9,
            divergence_patience: 3,
        }
    }
}

/// A sub-problem built once and re-solved every round with fresh penalties.
struct Subproblem {
    scope: String,
    model: Model,
    layout: Layout,
    p_el: Vec<Var>,
}

/// Solutions of one round.
#[derive(Debug, Clone)]
struct Iterate {
    node_values: Vec<Vec<f64>>,
    node_p: Vec<Vec<f64>>,
    primal: f64,
}

/// Engine running a [`CoordinationRule`] to convergence.
pub struct DistributedOptimization<R> {
    rule: R,
    options: RunOptions,
    policy: IterationPolicy,
    backend: Arc<dyn SolverBackend>,
}

impl<R: CoordinationRule> DistributedOptimization<R> {
    pub fn new(rule: R, options: RunOptions) -> Self {
        DistributedOptimization {
            rule,
            options,
            policy: IterationPolicy::default(),
            backend: Arc::new(ClarabelBackend),
        }
    }

    pub fn with_policy(mut self, policy: IterationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn SolverBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn rule(&self) -> &R {
        &self.rule
    }

    fn node_problem(&self, district: &CityDistrict, node: &Entity) -> SchedulingResult<Subproblem> {
        let ctx = BuildContext::new(district.env())
            .with_robustness(self.options.robustness)
            .with_initial_energy(district.initial_energy().clone());
        let mut builder = ProblemBuilder::new(ctx)?;
        let vars = builder.add_entity(node)?;
        let p_el = vars.p_el.ok_or_else(|| {
            SchedulingError::ModelBuild(format!(
                "{} {} has no electrical trajectory",
                node.kind().tag(),
                node.id()
            ))
        })?;
        let scope = scope_of(node);
        if let Some(objective) = node.objective() {
            builder.add_objective(&scope, &p_el, objective, self.options.beta)?;
        }
        let (model, layout) = builder.finish();
        Ok(Subproblem {
            scope,
            model,
            layout,
            p_el,
        })
    }

    fn district_problem(&self, env: &Environment, district: &CityDistrict) -> SchedulingResult<Subproblem> {
        let mut builder = ProblemBuilder::new(BuildContext::new(env))?;
        let p_el = builder.add_detached(district.root())?;
        let scope = scope_of(district.root());
        builder.add_objective(&scope, &p_el, district.objective(), 1.0)?;
        let (model, layout) = builder.finish();
        Ok(Subproblem {
            scope,
            model,
            layout,
            p_el,
        })
    }

    fn solve(&self, sub: &Subproblem, penalty: &Penalty) -> SchedulingResult<Vec<f64>> {
        let mut model = sub.model.clone();
        penalty.apply(&mut model, &sub.p_el);
        let solution = self
            .backend
            .solve(&model, &self.options.solver)?
            .into_result(&sub.scope)?;
        Ok(solution.values)
    }

    fn commit(
        &self,
        district: &CityDistrict,
        guard: &RunGuard<'_>,
        nodes: &[Subproblem],
        iterate: &Iterate,
    ) -> f64 {
        let mut schedules: HashMap<EntityId, Schedule> = HashMap::new();
        for (sub, values) in nodes.iter().zip(&iterate.node_values) {
            schedules.extend(sub.layout.schedules(values));
        }
        let total = sum_trajectories(&iterate.node_p, district.env().timer.op_horizon);
        let env = district.env();
        let objective = district
            .objective()
            .evaluate(&total, env.energy_prices(), env.co2_intensity());
        schedules.insert(district.id(), Schedule::new().with(Quantity::PEl, total));
        district.commit_run(guard, CURRENT, schedules);
        objective
    }
}

fn sum_trajectories(trajectories: &[Vec<f64>], horizon: usize) -> Vec<f64> {
    (0..horizon)
        .map(|t| trajectories.iter().map(|p| p[t]).sum())
        .collect()
}

fn read(values: &[f64], vars: &[Var]) -> Vec<f64> {
    vars.iter().map(|v| values[v.index()]).collect()
}

impl<R: CoordinationRule> SchedulingAlgorithm for DistributedOptimization<R> {
    fn kind(&self) -> AlgorithmKind {
        self.rule.kind()
    }

    fn run(&self, district: &CityDistrict) -> SchedulingResult<RunReport> {
        let start = Instant::now();
        self.rule.validate()?;
        if self.policy.max_iterations == 0 {
            return Err(SchedulingError::ModelBuild("max_iterations must be at least 1".into()));
        }
        let guard = district.begin_run()?;
        let env = district.env();
        let horizon = env.timer.op_horizon;

        let nodes = district
            .nodes()
            .iter()
            .map(|node| self.node_problem(district, node))
            .collect::<SchedulingResult<Vec<_>>>()?;
        let district_problem = if self.rule.coordinates_district() {
            Some(self.district_problem(env, district)?)
        } else {
            None
        };
        info!(
            algorithm = self.rule.name(),
            phase = "init",
            nodes = nodes.len(),
            horizon,
            backend = self.backend.id(),
            "sub-problems built"
        );

        let mut signal = self.rule.init(nodes.len(), horizon);
        let mut history = Vec::new();
        let mut best: Option<Iterate> = None;
        let mut above_threshold = 0;

        for iteration in 1..=self.policy.max_iterations {
            let node_values = nodes
                .par_iter()
                .enumerate()
                .map(|(i, sub)| self.solve(sub, &self.rule.node_penalty(&signal, i)))
                .collect::<SchedulingResult<Vec<_>>>()?;
            let node_p: Vec<Vec<f64>> = nodes
                .iter()
                .zip(&node_values)
                .map(|(sub, values)| read(values, &sub.p_el))
                .collect();
            let district_p = match &district_problem {
                Some(sub) => {
                    let values = self.solve(sub, &self.rule.district_penalty(&signal))?;
                    read(&values, &sub.p_el)
                }
                None => sum_trajectories(&node_p, horizon),
            };

            let residuals = self
                .rule
                .update(&mut signal, iteration, &district_p, &node_p);
            history.push(IterationRecord {
                iteration,
                primal_residual: residuals.primal,
                dual_residual: residuals.dual,
                elapsed_ms: start.elapsed().as_millis(),
            });
            debug!(
                algorithm = self.rule.name(),
                iteration,
                primal = residuals.primal,
                dual = ?residuals.dual,
                "coordination round"
            );

            if !residuals.primal.is_finite() || residuals.dual.is_some_and(|s| !s.is_finite()) {
                warn!(algorithm = self.rule.name(), phase = "diverged", iteration, "non-finite residual");
                return Err(SchedulingError::CoordinationDiverged {
                    iterations: iteration,
                    residual: residuals.primal,
                });
            }
            if residuals.primal > self.policy.divergence_threshold {
                above_threshold += 1;
                if above_threshold >= self.policy.divergence_patience {
                    warn!(
                        algorithm = self.rule.name(),
                        phase = "diverged",
                        iteration,
                        residual = residuals.primal,
                        "residual stayed above divergence threshold"
                    );
                    return Err(SchedulingError::CoordinationDiverged {
                        iterations: iteration,
                        residual: residuals.primal,
                    });
                }
            } else {
                above_threshold = 0;
            }

            let iterate = Iterate {
                node_values,
                node_p,
                primal: residuals.primal,
            };
            if self.rule.converged(&residuals) {
                let district_objective = self.commit(district, &guard, &nodes, &iterate);
                let elapsed = start.elapsed().as_millis();
                info!(
                    algorithm = self.rule.name(),
                    phase = "converged",
                    iterations = iteration,
                    district_objective,
                    time_ms = elapsed,
                    "schedule committed"
                );
                return Ok(RunReport {
                    algorithm: self.rule.kind(),
                    status: RunStatus::Converged,
                    iterations: iteration,
                    history,
                    district_objective,
                    solve_time_ms: elapsed,
                });
            }
            if best.as_ref().map_or(true, |b| iterate.primal < b.primal) {
                best = Some(iterate);
            }
        }

        let best = best.ok_or_else(|| SchedulingError::NumericalIssue("no iterate to commit".into()))?;
        let district_objective = self.commit(district, &guard, &nodes, &best);
        let elapsed = start.elapsed().as_millis();
        warn!(
            algorithm = self.rule.name(),
            phase = "max-iter-reached",
            iterations = self.policy.max_iterations,
            residual = best.primal,
            "committed best iterate without convergence"
        );
        Ok(RunReport {
            algorithm: self.rule.kind(),
            status: RunStatus::Approximate,
            iterations: self.policy.max_iterations,
            history,
            district_objective,
            solve_time_ms: elapsed,
        })
    }
}
