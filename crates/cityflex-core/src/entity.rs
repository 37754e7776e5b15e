//! Entity hierarchy of a city district.
//!
//! The hierarchy is an owned tree: a [`CityDistrict`] owns its buildings, a
//! building owns its apartments and energy system, and those own devices.
//! Children keep the id of their parent as a back-reference.
//!
//! ```text
//! CityDistrict
//! ├── Building ── EnergySystem ── devices (heaters, storages, ...)
//! │            └─ Apartment ───── devices (loads, space heating, ...)
//! ├── Building ...
//! └── PV / WEC (district-level generation)
//! ```
//!
//! The district keeps its buildings ahead of its generators, so both can be
//! handed out as slices.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    CoreError, CoreResult, Device, EntityId, Environment, Objective, RunGuard, RunLock, Schedule,
    ScheduleStore,
};

/// What an entity is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntityKind {
    Device(Device),
    Apartment,
    /// Device container of a building (heat supply and storage).
    EnergySystem,
    Building { objective: Objective },
    District { objective: Objective },
}

impl EntityKind {
    pub fn tag(&self) -> &'static str {
        match self {
            EntityKind::Device(d) => d.tag(),
            EntityKind::Apartment => "AP",
            EntityKind::EnergySystem => "BES",
            EntityKind::Building { .. } => "BD",
            EntityKind::District { .. } => "CD",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    id: EntityId,
    name: String,
    parent: Option<EntityId>,
    kind: EntityKind,
    children: Vec<Entity>,
}

impl Entity {
    fn with_kind(name: impl Into<String>, kind: EntityKind) -> Self {
        Entity {
            id: EntityId::allocate(),
            name: name.into(),
            parent: None,
            kind,
            children: Vec::new(),
        }
    }

    pub fn device(name: impl Into<String>, device: Device) -> Self {
        Self::with_kind(name, EntityKind::Device(device))
    }

    pub fn apartment(name: impl Into<String>) -> Self {
        Self::with_kind(name, EntityKind::Apartment)
    }

    pub fn energy_system(name: impl Into<String>) -> Self {
        Self::with_kind(name, EntityKind::EnergySystem)
    }

    pub fn building(name: impl Into<String>, objective: Objective) -> Self {
        Self::with_kind(name, EntityKind::Building { objective })
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    pub fn kind(&self) -> &EntityKind {
        &self.kind
    }

    pub fn children(&self) -> &[Entity] {
        &self.children
    }

    pub fn as_device(&self) -> Option<&Device> {
        match &self.kind {
            EntityKind::Device(d) => Some(d),
            _ => None,
        }
    }

    /// Objective of buildings and districts.
    pub fn objective(&self) -> Option<Objective> {
        match self.kind {
            EntityKind::Building { objective } | EntityKind::District { objective } => {
                Some(objective)
            }
            _ => None,
        }
    }

    pub fn set_objective(&mut self, new: Objective) -> CoreResult<()> {
        match &mut self.kind {
            EntityKind::Building { objective } | EntityKind::District { objective } => {
                *objective = new;
                Ok(())
            }
            _ => Err(CoreError::Hierarchy(format!(
                "{} '{}' has no objective",
                self.kind.tag(),
                self.name
            ))),
        }
    }

    /// Attach a child, enforcing the district composition rules.
    pub fn add_child(&mut self, mut child: Entity) -> CoreResult<EntityId> {
        let allowed = match (&self.kind, &child.kind) {
            (EntityKind::District { .. }, EntityKind::Building { .. }) => true,
            (
                EntityKind::District { .. },
                EntityKind::Device(Device::Photovoltaic(_) | Device::WindEnergyConverter(_)),
            ) => true,
            (EntityKind::Building { .. }, EntityKind::Apartment) => true,
            (EntityKind::Building { .. }, EntityKind::EnergySystem) => !self
                .children
                .iter()
                .any(|c| matches!(c.kind, EntityKind::EnergySystem)),
            (EntityKind::Apartment | EntityKind::EnergySystem, EntityKind::Device(_)) => true,
            _ => false,
        };
        if !allowed {
            return Err(CoreError::Hierarchy(format!(
                "cannot attach {} '{}' to {} '{}'",
                child.kind.tag(),
                child.name,
                self.kind.tag(),
                self.name
            )));
        }
        child.parent = Some(self.id);
        let id = child.id;
        if matches!(child.kind, EntityKind::Building { .. }) {
            let pos = self.building_count();
            self.children.insert(pos, child);
        } else {
            self.children.push(child);
        }
        Ok(id)
    }

    fn building_count(&self) -> usize {
        self.children
            .iter()
            .take_while(|c| matches!(c.kind, EntityKind::Building { .. }))
            .count()
    }

    /// Builder-style variant of [`Entity::add_child`].
    pub fn with_child(mut self, child: Entity) -> CoreResult<Self> {
        self.add_child(child)?;
        Ok(self)
    }

    /// The building's energy system, created on first use.
    pub fn energy_system_mut(&mut self) -> CoreResult<&mut Entity> {
        if !matches!(self.kind, EntityKind::Building { .. }) {
            return Err(CoreError::Hierarchy(format!(
                "{} '{}' has no energy system",
                self.kind.tag(),
                self.name
            )));
        }
        let pos = match self
            .children
            .iter()
            .position(|c| matches!(c.kind, EntityKind::EnergySystem))
        {
            Some(pos) => pos,
            None => {
                let bes = Entity::energy_system(format!("{}-bes", self.name));
                self.add_child(bes)?;
                self.children.len() - 1
            }
        };
        Ok(&mut self.children[pos])
    }

    /// Depth-first pre-order traversal including `self`.
    pub fn walk(&self) -> Vec<&Entity> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(entity) = stack.pop() {
            out.push(entity);
            stack.extend(entity.children.iter().rev());
        }
        out
    }

    /// Device leaves below (or equal to) this entity.
    pub fn devices(&self) -> impl Iterator<Item = (&Entity, &Device)> {
        self.walk()
            .into_iter()
            .filter_map(|e| e.as_device().map(|d| (e, d)))
    }

    pub fn find(&self, id: EntityId) -> Option<&Entity> {
        self.walk().into_iter().find(|e| e.id == id)
    }

    pub fn has_electrical(&self) -> bool {
        match &self.kind {
            EntityKind::Device(d) => d.has_electrical(),
            _ => true,
        }
    }

    /// Whether any part of this subtree carries heat.
    pub fn has_thermal(&self) -> bool {
        match &self.kind {
            EntityKind::Device(d) => d.has_thermal(),
            _ => self.children.iter().any(Entity::has_thermal),
        }
    }
}

/// Root of a hierarchy together with its shared run state.
#[derive(Debug)]
pub struct CityDistrict {
    env: Arc<Environment>,
    root: Entity,
    positions: HashMap<EntityId, (f64, f64)>,
    /// Storage energy carried over from a previous window.
    initial_energy: HashMap<EntityId, f64>,
    store: ScheduleStore,
    run_lock: RunLock,
}

impl CityDistrict {
    pub fn new(env: Arc<Environment>, objective: Objective) -> Self {
        CityDistrict {
            env,
            root: Entity::with_kind("district", EntityKind::District { objective }),
            positions: HashMap::new(),
            initial_energy: HashMap::new(),
            store: ScheduleStore::new(),
            run_lock: RunLock::new(),
        }
    }

    pub fn id(&self) -> EntityId {
        self.root.id
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn root(&self) -> &Entity {
        &self.root
    }

    pub fn objective(&self) -> Objective {
        self.root.objective().unwrap_or_default()
    }

    pub fn set_objective(&mut self, objective: Objective) -> CoreResult<()> {
        self.root.set_objective(objective)
    }

    /// Replace the environment, e.g. to move the optimisation window.
    pub fn set_env(&mut self, env: Arc<Environment>) {
        self.env = env;
    }

    /// Storage energy at the start of the window, by device.
    pub fn initial_energy(&self) -> &HashMap<EntityId, f64> {
        &self.initial_energy
    }

    pub fn set_initial_energy(&mut self, energy: HashMap<EntityId, f64>) {
        self.initial_energy = energy;
    }

    /// Place a building at a 2-D position (used for reporting only).
    pub fn add_building(&mut self, building: Entity, position: (f64, f64)) -> CoreResult<EntityId> {
        self.check_new(&building)?;
        let id = self.root.add_child(building)?;
        self.positions.insert(id, position);
        debug!(building = %id, x = position.0, y = position.1, "added building");
        Ok(id)
    }

    /// Attach a photovoltaic or wind generator directly to the district.
    pub fn add_generator(&mut self, generator: Entity, position: (f64, f64)) -> CoreResult<EntityId> {
        self.check_new(&generator)?;
        let id = self.root.add_child(generator)?;
        self.positions.insert(id, position);
        debug!(generator = %id, x = position.0, y = position.1, "added district generator");
        Ok(id)
    }

    fn check_new(&self, entity: &Entity) -> CoreResult<()> {
        let needed = self.env.timer.required_len();
        for (leaf, device) in entity.devices() {
            device.validate(needed).map_err(|e| {
                CoreError::Validation(format!("{} '{}': {e}", device.tag(), leaf.name()))
            })?;
        }
        let ids: HashSet<EntityId> = self.root.walk().iter().map(|e| e.id).collect();
        if entity.walk().iter().any(|e| ids.contains(&e.id)) {
            return Err(CoreError::Hierarchy(format!(
                "{} '{}' shares entities with this district",
                entity.kind.tag(),
                entity.name
            )));
        }
        Ok(())
    }

    pub fn buildings(&self) -> &[Entity] {
        &self.root.children[..self.root.building_count()]
    }

    /// Generators attached to the district itself.
    pub fn generators(&self) -> &[Entity] {
        &self.root.children[self.root.building_count()..]
    }

    /// Direct children of the district: buildings, then generators.
    pub fn nodes(&self) -> &[Entity] {
        self.root.children()
    }

    pub fn building_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.root.children.iter_mut().find(|b| b.id == id)
    }

    pub fn position(&self, id: EntityId) -> Option<(f64, f64)> {
        self.positions.get(&id).copied()
    }

    pub fn find(&self, id: EntityId) -> Option<&Entity> {
        self.root.find(id)
    }

    /// Every entity in pre-order, starting with the district itself.
    pub fn entities(&self) -> Vec<&Entity> {
        self.root.walk()
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    /// Claim the hierarchy for one run; fails fast if another run holds it.
    pub fn begin_run(&self) -> CoreResult<RunGuard<'_>> {
        self.run_lock.try_acquire().ok_or(CoreError::RunInProgress)
    }

    /// Commit the schedules of a run atomically.
    ///
    /// Requires the guard returned by [`CityDistrict::begin_run`].
    pub fn commit_run(
        &self,
        _guard: &RunGuard<'_>,
        name: &str,
        schedules: HashMap<EntityId, Schedule>,
    ) {
        debug!(slot = name, entities = schedules.len(), "committing schedules");
        self.store.commit_all(name, schedules);
    }
}
