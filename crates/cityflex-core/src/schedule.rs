//! Named schedules per entity.
//!
//! Every entity can hold several schedules side by side (the working
//! `"current"` plan, a saved `"reference"`, a realized `"actual"`, ...). The
//! store is shared across threads; runs write it in one locked step so a
//! reader never observes half a commit.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult, EntityId};

/// Name of the working schedule written by the algorithms.
pub const CURRENT: &str = "current";

/// Physical quantity of a trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Electrical power in kW.
    PEl,
    /// Thermal heating power in kW.
    PThHeat,
    /// Stored electrical energy in kWh.
    EEl,
    /// Stored heat in kWh.
    EThHeat,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quantity::PEl => "p_el",
            Quantity::PThHeat => "p_th_heat",
            Quantity::EEl => "e_el",
            Quantity::EThHeat => "e_th_heat",
        };
        write!(f, "{s}")
    }
}

/// Trajectories of one entity over the optimisation window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule {
    series: BTreeMap<Quantity, Vec<f64>>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, quantity: Quantity, values: Vec<f64>) -> Self {
        self.series.insert(quantity, values);
        self
    }

    pub fn insert(&mut self, quantity: Quantity, values: Vec<f64>) {
        self.series.insert(quantity, values);
    }

    pub fn get(&self, quantity: Quantity) -> Option<&[f64]> {
        self.series.get(&quantity).map(Vec::as_slice)
    }

    pub fn p_el(&self) -> Option<&[f64]> {
        self.get(Quantity::PEl)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Quantity, &[f64])> {
        self.series.iter().map(|(q, v)| (*q, v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

type Slots = BTreeMap<String, Schedule>;

/// Thread-safe store of named schedules.
#[derive(Debug, Default)]
pub struct ScheduleStore {
    inner: RwLock<HashMap<EntityId, Slots>>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the named slot of one entity.
    pub fn commit(&self, entity: EntityId, name: &str, schedule: Schedule) {
        self.inner
            .write()
            .entry(entity)
            .or_default()
            .insert(name.to_string(), schedule);
    }

    /// Overwrite the named slot of many entities under a single write lock.
    pub fn commit_all(&self, name: &str, schedules: HashMap<EntityId, Schedule>) {
        let mut inner = self.inner.write();
        for (entity, schedule) in schedules {
            inner
                .entry(entity)
                .or_default()
                .insert(name.to_string(), schedule);
        }
    }

    pub fn get(&self, entity: EntityId, name: &str) -> Option<Schedule> {
        self.inner
            .read()
            .get(&entity)
            .and_then(|slots| slots.get(name))
            .cloned()
    }

    pub fn require(&self, entity: EntityId, name: &str) -> CoreResult<Schedule> {
        self.get(entity, name)
            .ok_or_else(|| CoreError::ScheduleNotFound {
                entity,
                name: name.to_string(),
            })
    }

    /// Names of the schedules stored for an entity, sorted.
    pub fn names(&self, entity: EntityId) -> Vec<String> {
        self.inner
            .read()
            .get(&entity)
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Copy slot `src` to slot `dst` for every entity that has `src`.
    pub fn copy_all(&self, src: &str, dst: &str) {
        let mut inner = self.inner.write();
        for slots in inner.values_mut() {
            if let Some(schedule) = slots.get(src).cloned() {
                slots.insert(dst.to_string(), schedule);
            }
        }
    }

    pub fn remove_all(&self, name: &str) {
        let mut inner = self.inner.write();
        for slots in inner.values_mut() {
            slots.remove(name);
        }
    }

    /// Deep copy of the whole store.
    pub fn snapshot(&self) -> HashMap<EntityId, BTreeMap<String, Schedule>> {
        self.inner.read().clone()
    }

    /// Per-step difference `b - a` of the electrical trajectory.
    pub fn compare(&self, entity: EntityId, name_a: &str, name_b: &str) -> CoreResult<Vec<f64>> {
        self.compare_quantity(entity, Quantity::PEl, name_a, name_b)
    }

    /// Per-step difference `b - a` of one quantity.
    pub fn compare_quantity(
        &self,
        entity: EntityId,
        quantity: Quantity,
        name_a: &str,
        name_b: &str,
    ) -> CoreResult<Vec<f64>> {
        let inner = self.inner.read();
        let lookup = |name: &str| -> CoreResult<Vec<f64>> {
            inner
                .get(&entity)
                .and_then(|slots| slots.get(name))
                .and_then(|s| s.get(quantity))
                .map(<[f64]>::to_vec)
                .ok_or_else(|| CoreError::ScheduleNotFound {
                    entity,
                    name: format!("{name}/{quantity}"),
                })
        };
        let a = lookup(name_a)?;
        let b = lookup(name_b)?;
        if a.len() != b.len() {
            return Err(CoreError::Validation(format!(
                "schedules '{name_a}' and '{name_b}' differ in length ({} vs {})",
                a.len(),
                b.len()
            )));
        }
        Ok(a.iter().zip(&b).map(|(x, y)| y - x).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(values: &[f64]) -> Schedule {
        Schedule::new().with(Quantity::PEl, values.to_vec())
    }

    #[test]
    fn commit_overwrites_slot() {
        let store = ScheduleStore::new();
        let id = EntityId::new(1);
        store.commit(id, CURRENT, schedule(&[1.0, 2.0]));
        store.commit(id, CURRENT, schedule(&[3.0, 4.0]));
        assert_eq!(
            store.get(id, CURRENT).unwrap().p_el().unwrap(),
            &[3.0, 4.0]
        );
        assert_eq!(store.names(id), vec![CURRENT.to_string()]);
    }

    #[test]
    fn compare_reports_b_minus_a() {
        let store = ScheduleStore::new();
        let id = EntityId::new(2);
        store.commit(id, "current", schedule(&[10.0, 10.0, 10.0]));
        store.commit(id, "actual", schedule(&[10.0, 12.0, 7.5]));
        let delta = store.compare(id, "current", "actual").unwrap();
        assert_eq!(delta, vec![0.0, 2.0, -2.5]);
    }

    #[test]
    fn compare_missing_slot_fails() {
        let store = ScheduleStore::new();
        let id = EntityId::new(3);
        store.commit(id, "current", schedule(&[1.0]));
        let err = store.compare(id, "current", "actual").unwrap_err();
        assert!(matches!(err, CoreError::ScheduleNotFound { .. }));
    }

    #[test]
    fn copy_all_saves_reference() {
        let store = ScheduleStore::new();
        let mut batch = HashMap::new();
        batch.insert(EntityId::new(4), schedule(&[1.0]));
        batch.insert(EntityId::new(5), schedule(&[2.0]));
        store.commit_all(CURRENT, batch);
        store.copy_all(CURRENT, "reference");
        store.commit(EntityId::new(4), CURRENT, schedule(&[9.0]));

        let delta = store.compare(EntityId::new(4), "reference", CURRENT).unwrap();
        assert_eq!(delta, vec![8.0]);
        assert!(store.get(EntityId::new(5), "reference").is_some());

        store.remove_all("reference");
        assert!(store.get(EntityId::new(5), "reference").is_none());
    }
}
