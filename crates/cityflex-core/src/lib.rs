//! # cityflex-core: data model for district energy scheduling
//!
//! This crate describes *what* gets scheduled: the shared [`Environment`]
//! (timer, prices, weather), the entity hierarchy of a [`CityDistrict`] with
//! its [`Device`] catalogue, the [`Objective`] selectors, and the
//! [`ScheduleStore`] that holds committed trajectories. The optimisation
//! itself lives in `cityflex-algo`.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use cityflex_core::*;
//!
//! let env = Environment::new(
//!     Timer::new(900, 4).unwrap(),
//!     Prices { energy: vec![30.0; 4], ..Prices::default() },
//!     Weather::default(),
//! )
//! .unwrap();
//! let mut district = CityDistrict::new(Arc::new(env), Objective::PeakShaving);
//!
//! let mut building = Entity::building("bd-1", Objective::Price);
//! let apartment = Entity::apartment("ap-1")
//!     .with_child(Entity::device("fl", Device::FixedLoad(FixedLoad::new(vec![2.0; 4]))))
//!     .unwrap();
//! building.add_child(apartment).unwrap();
//! district.add_building(building, (0.0, 0.0)).unwrap();
//!
//! assert_eq!(district.buildings().len(), 1);
//! ```

pub mod device;
pub mod entity;
pub mod environment;
pub mod error;
pub mod ids;
pub mod lock;
pub mod metrics;
pub mod objective;
pub mod schedule;

pub use device::{
    Battery, Boiler, CombinedHeatPower, Cop, CurtailableLoad, DeferrableLoad, Device,
    DomesticHotWater, ElectricalHeater, ElectricalVehicle, FixedLoad, Generator, HeatPump,
    SpaceHeating, ThermalHeatingStorage,
};
pub use entity::{CityDistrict, Entity, EntityKind};
pub use environment::{Environment, Prices, Timer, Weather};
pub use error::{CoreError, CoreResult};
pub use ids::EntityId;
pub use lock::{RunGuard, RunLock};
pub use objective::Objective;
pub use schedule::{Quantity, Schedule, ScheduleStore, CURRENT};
