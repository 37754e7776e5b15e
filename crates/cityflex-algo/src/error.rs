use cityflex_core::CoreError;
use thiserror::Error;

/// Errors raised while building, solving or committing a schedule.
///
/// Apart from [`SchedulingError::CommitConflict`], every variant is raised
/// before anything is written to the schedule store.
#[derive(Debug, Error)]
pub enum SchedulingError {
    /// Inconsistent horizon, inverted bounds or invalid parameters, detected
    /// before the solver runs.
    #[error("Model build failed: {0}")]
    ModelBuild(String),

    #[error("Problem is infeasible: {0}")]
    Infeasible(String),

    #[error("Problem is unbounded: {0}")]
    Unbounded(String),

    #[error("Solver timed out: {0}")]
    SolverTimeout(String),

    #[error("Numerical issue: {0}")]
    NumericalIssue(String),

    #[error("Coordination diverged after {iterations} iterations (primal residual {residual:e})")]
    CoordinationDiverged { iterations: usize, residual: f64 },

    #[error("another scheduling run holds this district")]
    CommitConflict,

    #[error(transparent)]
    Core(CoreError),
}

impl From<CoreError> for SchedulingError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::RunInProgress => SchedulingError::CommitConflict,
            CoreError::Validation(msg) | CoreError::Hierarchy(msg) => {
                SchedulingError::ModelBuild(msg)
            }
            other => SchedulingError::Core(other),
        }
    }
}

pub type SchedulingResult<T> = Result<T, SchedulingError>;
