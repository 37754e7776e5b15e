//! Robust storage bounds for buildings with uncertain thermal demand.
//!
//! A building's thermal storages are kept away from their limits by the
//! energy an adverse deviation of the space heating demand could require.
//! Only the `protected_steps` largest per-step deviations up to each step are
//! counted (the fractional part weighs one further step), which trades
//! conservativeness against cost.

use serde::{Deserialize, Serialize};

use crate::error::{SchedulingError, SchedulingResult};

/// Robustness setting for thermal storage of buildings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Robustness {
    /// Number of steps protected against a deviation; may be fractional.
    pub protected_steps: f64,
    /// Relative deviation of the space heating demand, e.g. `0.5` for 50 %.
    pub deviation: f64,
}

impl Robustness {
    pub fn validate(&self) -> SchedulingResult<()> {
        if !self.deviation.is_finite() || self.deviation < 0.0 {
            return Err(SchedulingError::ModelBuild(format!(
                "robust deviation must be finite and non-negative, got {}",
                self.deviation
            )));
        }
        if !self.protected_steps.is_finite() || self.protected_steps < 0.0 {
            return Err(SchedulingError::ModelBuild(format!(
                "protected steps must be finite and non-negative, got {}",
                self.protected_steps
            )));
        }
        Ok(())
    }
}

/// Inputs aggregated over one building.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageEnvelope<'a> {
    /// Space heating forecast of all apartments, per step of the window.
    pub demand: &'a [f64],
    /// Sum of the nominal outputs of all heat producers.
    pub heat_supply: f64,
    /// Sum of the storage capacities.
    pub capacity: f64,
    /// Sum of the storages' initial energy.
    pub end_value: f64,
    /// Step length in hours.
    pub dt: f64,
}

/// Lower and upper bounds for the summed storage energy at each step.
pub fn storage_bounds(robustness: &Robustness, envelope: &StorageEnvelope<'_>) -> (Vec<f64>, Vec<f64>) {
    let horizon = envelope.demand.len();
    let mut lower = vec![0.0; horizon];
    let mut upper = vec![envelope.capacity; horizon];
    if horizon == 0 {
        return (lower, upper);
    }

    let protected = robustness.protected_steps.max(0.0);
    let mut whole = protected.floor() as usize;
    let mut fraction = protected.fract();
    if whole >= horizon {
        whole = horizon - 1;
        fraction = 1.0;
    }

    let half = envelope.capacity / 2.0;
    let mut end_value = envelope.end_value;
    let mut uncertain = vec![0.0; horizon];
    for t in 0..horizon {
        uncertain[t] = (envelope.demand[t] * robustness.deviation).min(envelope.heat_supply);
        let mut sorted = uncertain.clone();
        sorted.sort_by(|a, b| b.total_cmp(a));
        let energy = envelope.dt * (sorted[..whole].iter().sum::<f64>() + sorted[whole] * fraction);

        if energy >= half {
            lower[t] = half;
            upper[t] = half;
        } else if t + 1 < horizon {
            lower[t] = energy;
            upper[t] = envelope.capacity - energy;
        } else {
            end_value = if envelope.capacity > 0.0 && end_value / envelope.capacity <= 0.5 {
                end_value.max(energy)
            } else {
                end_value.min(envelope.capacity - energy)
            };
            lower[t] = end_value;
            upper[t] = end_value;
        }
    }
    (lower, upper)
}
