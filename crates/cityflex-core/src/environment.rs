//! Shared environment context: timer, price signals and weather.
//!
//! One [`Environment`] is created per scheduling run and shared read-only by
//! every entity of a district. All series are index-aligned with the timer:
//! entry `k` belongs to simulation step `k`, and each series must cover the
//! steps `0..start + simu_horizon`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

/// Discretisation of time for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Timer {
    /// Length of one time step in seconds.
    pub step_size: u32,
    /// Number of steps scheduled per optimisation (H).
    pub op_horizon: usize,
    /// Number of steps the series must cover beyond `start`.
    #[serde(default)]
    pub simu_horizon: Option<usize>,
    /// First simulation step of the optimisation window.
    #[serde(default)]
    pub start: usize,
}

impl Timer {
    pub fn new(step_size: u32, op_horizon: usize) -> CoreResult<Self> {
        let timer = Timer {
            step_size,
            op_horizon,
            simu_horizon: None,
            start: 0,
        };
        timer.validate()?;
        Ok(timer)
    }

    pub fn with_start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    pub fn with_simu_horizon(mut self, steps: usize) -> Self {
        self.simu_horizon = Some(steps);
        self
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.step_size == 0 || 3600 % self.step_size != 0 {
            return Err(CoreError::Validation(format!(
                "step size of {} s does not divide one hour",
                self.step_size
            )));
        }
        if self.op_horizon == 0 {
            return Err(CoreError::Validation(
                "optimisation horizon must be at least one step".into(),
            ));
        }
        if self.simu_horizon() < self.op_horizon {
            return Err(CoreError::Validation(format!(
                "simulation horizon {} is shorter than the optimisation horizon {}",
                self.simu_horizon(),
                self.op_horizon
            )));
        }
        Ok(())
    }

    /// Step length in hours.
    #[inline]
    pub fn time_slot(&self) -> f64 {
        f64::from(self.step_size) / 3600.0
    }

    pub fn simu_horizon(&self) -> usize {
        self.simu_horizon.unwrap_or(self.op_horizon)
    }

    /// Absolute step indices of the optimisation window.
    pub fn op_range(&self) -> Range<usize> {
        self.start..self.start + self.op_horizon
    }

    /// Steps every series has to provide.
    pub fn required_len(&self) -> usize {
        self.start + self.simu_horizon()
    }

    pub fn steps_per_day(&self) -> usize {
        86_400 / self.step_size as usize
    }

    /// Timer for the window `steps` later. The simulation horizon shrinks by
    /// the same amount, so the covered steps stay the same.
    pub fn advance(&self, steps: usize) -> CoreResult<Timer> {
        let remaining = self.simu_horizon().checked_sub(steps).ok_or_else(|| {
            CoreError::Validation(format!(
                "cannot advance {steps} steps past a simulation horizon of {}",
                self.simu_horizon()
            ))
        })?;
        let timer = Timer {
            start: self.start + steps,
            simu_horizon: Some(remaining),
            ..self.clone()
        };
        timer.validate()?;
        Ok(timer)
    }
}

/// Price signals in ct/kWh (energy, feed-in) and g/kWh (co2).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prices {
    /// Time-of-use energy price for imports.
    pub energy: Vec<f64>,
    /// Remuneration for exported energy.
    #[serde(default)]
    pub feed_in: Option<Vec<f64>>,
    /// Specific emissions of imported energy.
    #[serde(default)]
    pub co2: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Weather {
    /// Ambient air temperature in °C.
    #[serde(default)]
    pub ambient_temperature: Vec<f64>,
}

/// Immutable run context shared by all entities of a district.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub timer: Timer,
    pub prices: Prices,
    #[serde(default)]
    pub weather: Weather,
}

impl Environment {
    pub fn new(timer: Timer, prices: Prices, weather: Weather) -> CoreResult<Self> {
        let env = Environment {
            timer,
            prices,
            weather,
        };
        env.validate()?;
        Ok(env)
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.timer.validate()?;
        let needed = self.timer.required_len();
        check_series("energy price", &self.prices.energy, needed)?;
        if let Some(feed_in) = &self.prices.feed_in {
            check_series("feed-in price", feed_in, needed)?;
        }
        if let Some(co2) = &self.prices.co2 {
            check_series("co2 intensity", co2, needed)?;
        }
        if !self.weather.ambient_temperature.is_empty() {
            check_series(
                "ambient temperature",
                &self.weather.ambient_temperature,
                needed,
            )?;
        }
        Ok(())
    }

    /// The same environment with its window moved `steps` forward.
    pub fn advanced(&self, steps: usize) -> CoreResult<Environment> {
        Ok(Environment {
            timer: self.timer.advance(steps)?,
            ..self.clone()
        })
    }

    /// Energy prices over the optimisation window.
    pub fn energy_prices(&self) -> &[f64] {
        &self.prices.energy[self.timer.op_range()]
    }

    pub fn co2_intensity(&self) -> Option<&[f64]> {
        self.prices.co2.as_ref().map(|c| &c[self.timer.op_range()])
    }

    pub fn feed_in_prices(&self) -> Option<&[f64]> {
        self.prices.feed_in.as_ref().map(|f| &f[self.timer.op_range()])
    }
}

fn check_series(label: &str, series: &[f64], needed: usize) -> CoreResult<()> {
    if series.len() < needed {
        return Err(CoreError::Validation(format!(
            "{label} series has {} entries, {needed} required",
            series.len()
        )));
    }
    if let Some(pos) = series[..needed].iter().position(|v| !v.is_finite()) {
        return Err(CoreError::Validation(format!(
            "{label} series has a non-finite value at step {pos}"
        )));
    }
    Ok(())
}
