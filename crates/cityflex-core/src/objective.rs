use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Objective an entity pursues for its electrical trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Objective {
    /// No preference; the entity only has to stay feasible.
    None,
    /// Flatten the load profile (sum of squared power).
    #[default]
    PeakShaving,
    /// Minimise energy cost under time-of-use prices.
    Price,
    /// Minimise emissions under a co2 intensity signal.
    Co2,
    /// Minimise the largest absolute power over the window.
    MaxConsumption,
    /// Penalise export so local generation is consumed locally.
    SelfConsumption,
}

impl Objective {
    /// Value of the objective for a trajectory, using the same scaling the
    /// problem builder applies.
    pub fn evaluate(&self, p: &[f64], prices: &[f64], co2: Option<&[f64]>) -> f64 {
        match self {
            Objective::None => 0.0,
            Objective::PeakShaving => p.iter().map(|v| v * v).sum(),
            Objective::Price => weighted(p, prices),
            Objective::Co2 => co2.map(|c| weighted(p, c)).unwrap_or(0.0),
            Objective::MaxConsumption => p.iter().fold(0.0, |m, v| m.max(v.abs())),
            Objective::SelfConsumption => p
                .iter()
                .map(|v| {
                    let export = (-v).max(0.0);
                    export * export
                })
                .sum(),
        }
    }
}

/// Signal scaled to mean absolute value one over the window, so price-like
/// objectives are comparable with peak shaving across data sets.
pub fn normalized(signal: &[f64]) -> Vec<f64> {
    let total: f64 = signal.iter().map(|v| v.abs()).sum();
    if total == 0.0 {
        return vec![0.0; signal.len()];
    }
    let scale = signal.len() as f64 / total;
    signal.iter().map(|v| v * scale).collect()
}

fn weighted(p: &[f64], signal: &[f64]) -> f64 {
    normalized(signal).iter().zip(p).map(|(s, v)| s * v).sum()
}

impl fmt::Display for Objective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Objective::None => "none",
            Objective::PeakShaving => "peak-shaving",
            Objective::Price => "price",
            Objective::Co2 => "co2",
            Objective::MaxConsumption => "max-consumption",
            Objective::SelfConsumption => "self-consumption",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Objective {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "none" => Ok(Objective::None),
            "peak-shaving" => Ok(Objective::PeakShaving),
            "price" => Ok(Objective::Price),
            "co2" => Ok(Objective::Co2),
            "max-consumption" => Ok(Objective::MaxConsumption),
            "self-consumption" => Ok(Objective::SelfConsumption),
            _ => Err(CoreError::Parse(format!(
                "unknown objective '{s}', expected one of none, peak-shaving, price, co2, \
                 max-consumption, self-consumption"
            ))),
        }
    }
}
