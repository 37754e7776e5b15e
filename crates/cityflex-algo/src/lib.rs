//! # cityflex-algo: scheduling algorithms for city districts
//!
//! Builds optimisation models from a [`cityflex_core::CityDistrict`], solves
//! them with a [`SolverBackend`] (Clarabel by default) and commits the
//! resulting schedules to the district's store.
//!
//! ## Modules
//!
//! - [`solver`]: modeling interface and the Clarabel backend
//! - [`builder`]: device models and aggregation into a [`Model`]
//! - [`robust`]: robust bounds for thermal storage
//! - [`algorithms`]: central, exchange ADMM, dual decomposition and
//!   stand-alone scheduling
//! - [`realization`]: re-dispatch of a plan against realised conditions
//! - [`simulation`]: rolling-horizon runs over the simulation horizon
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cityflex_algo::{run, AlgorithmConfig, AlgorithmKind};
//! use cityflex_core::*;
//!
//! let env = Environment::new(
//!     Timer::new(900, 4).unwrap(),
//!     Prices { energy: vec![30.0; 4], ..Prices::default() },
//!     Weather::default(),
//! )
//! .unwrap();
//! let mut district = CityDistrict::new(Arc::new(env), Objective::PeakShaving);
//! let building = Entity::building("bd", Objective::Price)
//!     .with_child(
//!         Entity::apartment("ap")
//!             .with_child(Entity::device("fl", Device::FixedLoad(FixedLoad::new(vec![2.0; 4]))))
//!             .unwrap(),
//!     )
//!     .unwrap();
//! district.add_building(building, (0.0, 0.0)).unwrap();
//!
//! let report = run(&AlgorithmConfig::new(AlgorithmKind::ExchangeAdmm), &district).unwrap();
//! println!("{} after {} iterations", report.algorithm, report.iterations);
//! ```

pub mod algorithms;
pub mod builder;
pub mod error;
pub mod realization;
pub mod robust;
pub mod simulation;
pub mod solver;

pub use algorithms::{
    run, AlgorithmConfig, AlgorithmKind, CentralOptimization, CoordinationRule,
    DistributedOptimization, DualDecomposition, ExchangeAdmm, IterationPolicy, IterationRecord,
    NoCoordination, Penalty, Residuals, RunOptions, RunReport, RunStatus, SchedulingAlgorithm,
};
pub use builder::{BuildContext, DeviceModel, Layout, ProblemBuilder};
pub use error::{SchedulingError, SchedulingResult};
pub use realization::{simulate_actual, ActualSimulation, Realization, RealizationReport, ACTUAL};
pub use robust::Robustness;
pub use simulation::{RollingHorizon, SimulationReport, SIMULATED};
pub use solver::{ClarabelBackend, Model, SolveStatus, Solution, SolverBackend, SolverOptions};
