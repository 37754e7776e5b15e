//! Modeling interface between the problem builder and the numerical solver.
//!
//! A [`Model`] holds bounded real variables, linear constraints and a convex
//! quadratic objective to minimise:
//!
//! ```text
//!   min  Σ c_ij x_i x_j + Σ q_i x_i + k
//!   s.t. Σ a_i x_i  (= | ≤ | ≥)  b     for every constraint
//!        l_i ≤ x_i ≤ u_i
//! ```
//!
//! Backends implement [`SolverBackend`]; the default backend is
//! [`ClarabelBackend`]. Models are plain data, so cloning one and adding
//! objective terms is how iterative algorithms update a sub-problem between
//! rounds without rebuilding it.

mod clarabel;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use self::clarabel::ClarabelBackend;
use crate::error::{SchedulingError, SchedulingResult};

/// Handle to a model variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(usize);

impl Var {
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Affine expression `Σ coeff · var + constant`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinExpr {
    pub terms: Vec<(Var, f64)>,
    pub constant: f64,
}

impl LinExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, var: Var, coeff: f64) -> Self {
        self.terms.push((var, coeff));
        self
    }

    pub fn add_term(&mut self, var: Var, coeff: f64) {
        self.terms.push((var, coeff));
    }

    pub fn constant(mut self, value: f64) -> Self {
        self.constant += value;
        self
    }

    /// Unit-coefficient sum of variables.
    pub fn sum<'a>(vars: impl IntoIterator<Item = &'a Var>) -> Self {
        LinExpr {
            terms: vars.into_iter().map(|v| (*v, 1.0)).collect(),
            constant: 0.0,
        }
    }

    pub fn evaluate(&self, values: &[f64]) -> f64 {
        self.constant
            + self
                .terms
                .iter()
                .map(|(v, c)| c * values[v.index()])
                .sum::<f64>()
    }
}

impl From<Var> for LinExpr {
    fn from(var: Var) -> Self {
        LinExpr::new().term(var, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Eq,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    pub name: String,
    pub expr: LinExpr,
    pub sense: Sense,
    pub rhs: f64,
}

/// Optimisation model assembled by the problem builder.
///
/// Two models built from the same inputs compare equal, including variable
/// names and ordering.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    names: Vec<String>,
    lower: Vec<f64>,
    upper: Vec<f64>,
    constraints: Vec<Constraint>,
    linear: Vec<f64>,
    /// Keys are `(i, j)` with `i <= j`.
    quadratic: BTreeMap<(usize, usize), f64>,
    offset: f64,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable with bounds `lower ≤ x ≤ upper` (infinite bounds allowed).
    pub fn add_var(&mut self, name: impl Into<String>, lower: f64, upper: f64) -> SchedulingResult<Var> {
        let name = name.into();
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(SchedulingError::ModelBuild(format!(
                "variable {name} has bounds [{lower}, {upper}]"
            )));
        }
        if lower == f64::INFINITY || upper == f64::NEG_INFINITY {
            return Err(SchedulingError::ModelBuild(format!(
                "variable {name} has an empty domain"
            )));
        }
        let var = Var(self.names.len());
        self.names.push(name);
        self.lower.push(lower);
        self.upper.push(upper);
        self.linear.push(0.0);
        Ok(var)
    }

    /// One variable per step, named `prefix[t]`.
    pub fn add_vars(
        &mut self,
        prefix: &str,
        len: usize,
        mut bounds: impl FnMut(usize) -> (f64, f64),
    ) -> SchedulingResult<Vec<Var>> {
        (0..len)
            .map(|t| {
                let (lb, ub) = bounds(t);
                self.add_var(format!("{prefix}[{t}]"), lb, ub)
            })
            .collect()
    }

    /// Pin a variable to a value.
    pub fn fix(&mut self, var: Var, value: f64) -> SchedulingResult<()> {
        if !value.is_finite() {
            return Err(SchedulingError::ModelBuild(format!(
                "cannot fix {} to {value}",
                self.names[var.0]
            )));
        }
        self.lower[var.0] = value;
        self.upper[var.0] = value;
        Ok(())
    }

    /// Replace the bounds of a variable.
    pub fn set_bounds(&mut self, var: Var, lower: f64, upper: f64) -> SchedulingResult<()> {
        if lower.is_nan() || upper.is_nan() || lower > upper {
            return Err(SchedulingError::ModelBuild(format!(
                "cannot bound {} to [{lower}, {upper}]",
                self.names[var.0]
            )));
        }
        self.lower[var.0] = lower;
        self.upper[var.0] = upper;
        Ok(())
    }

    pub fn add_constraint(&mut self, name: impl Into<String>, expr: LinExpr, sense: Sense, rhs: f64) {
        self.constraints.push(Constraint {
            name: name.into(),
            expr,
            sense,
            rhs,
        });
    }

    pub fn add_linear(&mut self, var: Var, coeff: f64) {
        self.linear[var.0] += coeff;
    }

    /// Add `coeff · a · b` to the objective.
    pub fn add_quadratic(&mut self, a: Var, b: Var, coeff: f64) {
        let key = if a.0 <= b.0 { (a.0, b.0) } else { (b.0, a.0) };
        *self.quadratic.entry(key).or_insert(0.0) += coeff;
    }

    pub fn add_square(&mut self, var: Var, coeff: f64) {
        self.add_quadratic(var, var, coeff);
    }

    pub fn add_offset(&mut self, value: f64) {
        self.offset += value;
    }

    pub fn num_vars(&self) -> usize {
        self.names.len()
    }

    pub fn num_constraints(&self) -> usize {
        self.constraints.len()
    }

    pub fn var_name(&self, var: Var) -> &str {
        &self.names[var.0]
    }

    pub fn bounds(&self, var: Var) -> (f64, f64) {
        (self.lower[var.0], self.upper[var.0])
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn evaluate_objective(&self, values: &[f64]) -> f64 {
        let lin: f64 = self.linear.iter().zip(values).map(|(q, x)| q * x).sum();
        let quad: f64 = self
            .quadratic
            .iter()
            .map(|(&(i, j), c)| c * values[i] * values[j])
            .sum();
        lin + quad + self.offset
    }

    pub(crate) fn linear_coefficients(&self) -> &[f64] {
        &self.linear
    }

    pub(crate) fn quadratic_terms(&self) -> &BTreeMap<(usize, usize), f64> {
        &self.quadratic
    }

    pub(crate) fn lower_bounds(&self) -> &[f64] {
        &self.lower
    }

    pub(crate) fn upper_bounds(&self) -> &[f64] {
        &self.upper
    }
}

/// Solver settings passed to every sub-problem solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SolverOptions {
    /// Maximum interior-point iterations.
    pub max_iterations: u32,
    /// Wall-clock budget per solve in seconds; the solve is cancelled and
    /// reported as a timeout when it runs out.
    pub time_limit_secs: Option<f64>,
    pub tol_gap_abs: f64,
    pub tol_gap_rel: f64,
    pub tol_feas: f64,
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 200,
            time_limit_secs: None,
            tol_gap_abs: 1e-8,
            tol_gap_rel: 1e-8,
            tol_feas: 1e-8,
            verbose: false,
        }
    }
}

/// Termination status of a single solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveStatus {
    Optimal,
    /// Solved to reduced accuracy.
    FeasibleSuboptimal,
    Infeasible,
    Unbounded,
    Timeout,
    NumericalError,
}

impl SolveStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::FeasibleSuboptimal)
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveStatus::Optimal => write!(f, "optimal"),
            SolveStatus::FeasibleSuboptimal => write!(f, "feasible (suboptimal)"),
            SolveStatus::Infeasible => write!(f, "infeasible"),
            SolveStatus::Unbounded => write!(f, "unbounded"),
            SolveStatus::Timeout => write!(f, "timeout"),
            SolveStatus::NumericalError => write!(f, "numerical error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Solution {
    pub status: SolveStatus,
    pub objective: f64,
    pub values: Vec<f64>,
    pub iterations: u32,
    pub solve_time_ms: u128,
}

impl Solution {
    #[inline]
    pub fn value(&self, var: Var) -> f64 {
        self.values[var.0]
    }

    /// Turn a non-successful status into the matching error. `scope` names
    /// the sub-problem in the message.
    pub fn into_result(self, scope: &str) -> SchedulingResult<Solution> {
        match self.status {
            SolveStatus::Optimal => Ok(self),
            SolveStatus::FeasibleSuboptimal => {
                warn!(scope, "solver reached reduced accuracy only");
                Ok(self)
            }
            SolveStatus::Infeasible => Err(SchedulingError::Infeasible(scope.to_string())),
            SolveStatus::Unbounded => Err(SchedulingError::Unbounded(scope.to_string())),
            SolveStatus::Timeout => Err(SchedulingError::SolverTimeout(format!(
                "{scope} after {} iterations",
                self.iterations
            ))),
            SolveStatus::NumericalError => Err(SchedulingError::NumericalIssue(scope.to_string())),
        }
    }
}

/// A numerical optimisation backend.
pub trait SolverBackend: Send + Sync {
    /// Unique identifier (e.g., "clarabel")
    fn id(&self) -> &str;

    fn solve(&self, model: &Model, options: &SolverOptions) -> SchedulingResult<Solution>;
}
