//! Scheduling algorithms.
//!
//! | Algorithm | Strategy |
//! |-----------|----------|
//! | [`CentralOptimization`] | one model for the whole district, solved once |
//! | [`ExchangeAdmm`] | per-building sub-problems coordinated by exchange ADMM |
//! | [`DualDecomposition`] | per-building sub-problems coordinated by a price signal |
//! | [`NoCoordination`] | stand-alone baseline: every building optimises itself |
//!
//! Every algorithm holds the district's run guard from start to commit and
//! writes all schedules in one step, so a failed run leaves the store as it
//! was.

mod central;
mod distributed;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use cityflex_core::CityDistrict;
use serde::{Deserialize, Serialize};

pub use central::CentralOptimization;
pub use distributed::{
    CoordinationRule, DistributedOptimization, DualDecomposition, ExchangeAdmm, ExchangeState,
    IterationPolicy, NoCoordination, Penalty, Residuals,
};

use crate::error::SchedulingResult;
use crate::robust::Robustness;
use crate::solver::{ClarabelBackend, SolverBackend, SolverOptions};

/// Available scheduling algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlgorithmKind {
    #[default]
    Central,
    ExchangeAdmm,
    DualDecomposition,
    StandAlone,
}

impl fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlgorithmKind::Central => write!(f, "central"),
            AlgorithmKind::ExchangeAdmm => write!(f, "exchange-admm"),
            AlgorithmKind::DualDecomposition => write!(f, "dual-decomposition"),
            AlgorithmKind::StandAlone => write!(f, "stand-alone"),
        }
    }
}

impl FromStr for AlgorithmKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "central" => Ok(AlgorithmKind::Central),
            "exchange-admm" | "admm" => Ok(AlgorithmKind::ExchangeAdmm),
            "dual-decomposition" | "dual" => Ok(AlgorithmKind::DualDecomposition),
            "stand-alone" | "standalone" => Ok(AlgorithmKind::StandAlone),
            _ => Err(format!(
                "Unknown algorithm: '{}'. Valid options: central, exchange-admm, dual-decomposition, stand-alone",
                s
            )),
        }
    }
}

/// Options shared by all algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Weight of the building objectives relative to the district objective.
    pub beta: f64,
    /// Protect thermal storage against space heating deviations.
    pub robustness: Option<Robustness>,
    pub solver: SolverOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            beta: 1.0,
            robustness: None,
            solver: SolverOptions::default(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Single solve finished at full accuracy.
    Optimal,
    /// Iterative coordination met its tolerances.
    Converged,
    /// Iteration budget exhausted or reduced solver accuracy; the committed
    /// schedule is the best available one.
    Approximate,
}

/// Residuals after one coordination round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: usize,
    pub primal_residual: f64,
    pub dual_residual: Option<f64>,
    pub elapsed_ms: u128,
}

/// Summary of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub algorithm: AlgorithmKind,
    pub status: RunStatus,
    pub iterations: usize,
    pub history: Vec<IterationRecord>,
    /// District objective evaluated on the committed district trajectory.
    pub district_objective: f64,
    pub solve_time_ms: u128,
}

impl RunReport {
    pub fn is_approximate(&self) -> bool {
        self.status == RunStatus::Approximate
    }
}

/// A scheduling algorithm that plans a district and commits the result to
/// its `"current"` schedules.
pub trait SchedulingAlgorithm: Send + Sync {
    fn kind(&self) -> AlgorithmKind;

    fn run(&self, district: &CityDistrict) -> SchedulingResult<RunReport>;
}

/// Configuration selecting and parameterising an algorithm.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgorithmConfig {
    pub kind: AlgorithmKind,
    #[serde(flatten)]
    pub options: RunOptions,
    pub admm: ExchangeAdmm,
    pub dual: DualDecomposition,
    pub policy: IterationPolicy,
}

impl AlgorithmConfig {
    pub fn new(kind: AlgorithmKind) -> Self {
        AlgorithmConfig {
            kind,
            ..Self::default()
        }
    }

    /// Instantiate the configured algorithm on top of `backend`.
    pub fn build(&self, backend: Arc<dyn SolverBackend>) -> Box<dyn SchedulingAlgorithm> {
        let options = self.options.clone();
        match self.kind {
            AlgorithmKind::Central => {
                Box::new(CentralOptimization::new(options).with_backend(backend))
            }
            AlgorithmKind::ExchangeAdmm => Box::new(
                DistributedOptimization::new(self.admm.clone(), options)
                    .with_policy(self.policy.clone())
                    .with_backend(backend),
            ),
            AlgorithmKind::DualDecomposition => Box::new(
                DistributedOptimization::new(self.dual.clone(), options)
                    .with_policy(self.policy.clone())
                    .with_backend(backend),
            ),
            AlgorithmKind::StandAlone => Box::new(
                DistributedOptimization::new(NoCoordination, options)
                    .with_policy(self.policy.clone())
                    .with_backend(backend),
            ),
        }
    }
}

/// Run the configured algorithm with the default Clarabel backend.
pub fn run(config: &AlgorithmConfig, district: &CityDistrict) -> SchedulingResult<RunReport> {
    config.build(Arc::new(ClarabelBackend)).run(district)
}
