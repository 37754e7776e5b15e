//! Optimisation problem builder.
//!
//! Turns an entity subtree into a [`Model`]. Leaves declare their variables
//! and operating constraints through [`DeviceModel`]; composite entities add
//! one equality per step tying their trajectory to the sum of their
//! children. Buildings additionally balance heat internally (no heat is
//! exchanged between buildings) and, when robustness is requested, keep their
//! thermal storages inside the bounds from [`crate::robust`].
//!
//! Variable names follow `"{tag}_{id}_{quantity}[t]"` and are declared in
//! tree order, so rebuilding from the same inputs gives an identical model.

use std::collections::HashMap;
use std::ops::Range;

use cityflex_core::objective::normalized;
use cityflex_core::{
    Battery, Boiler, CombinedHeatPower, CurtailableLoad, DeferrableLoad, Device,
    DomesticHotWater, ElectricalHeater, ElectricalVehicle, Entity, EntityId, EntityKind,
    Environment, FixedLoad, Generator, HeatPump, Objective, Quantity, Schedule, SpaceHeating,
    ThermalHeatingStorage,
};

use crate::error::{SchedulingError, SchedulingResult};
use crate::robust::{storage_bounds, Robustness, StorageEnvelope};
use crate::solver::{LinExpr, Model, Sense, Var};

const FREE: (f64, f64) = (f64::NEG_INFINITY, f64::INFINITY);

/// Externally fixed trajectories, keyed by entity and quantity.
pub type Pins = HashMap<(EntityId, Quantity), Vec<f64>>;

/// Per-step `(lower, upper)` bounds replacing those of a device.
pub type Bounds = HashMap<(EntityId, Quantity), Vec<(f64, f64)>>;

/// Inputs shared by every entity of one build.
#[derive(Debug, Clone)]
pub struct BuildContext<'a> {
    pub env: &'a Environment,
    /// First absolute step of the window.
    pub start: usize,
    /// Number of steps in the window.
    pub horizon: usize,
    pub pins: Pins,
    pub bounds: Bounds,
    /// Storage energy at the start of the window, overriding `soc_init`.
    pub initial_energy: HashMap<EntityId, f64>,
    /// Whether terminal conditions (storage end state, deferrable energy)
    /// apply at the end of the window.
    pub end_constraints: bool,
    pub robustness: Option<Robustness>,
}

impl<'a> BuildContext<'a> {
    /// Context for the environment's optimisation window.
    pub fn new(env: &'a Environment) -> Self {
        BuildContext {
            env,
            start: env.timer.start,
            horizon: env.timer.op_horizon,
            pins: Pins::new(),
            bounds: Bounds::new(),
            initial_energy: HashMap::new(),
            end_constraints: true,
            robustness: None,
        }
    }

    pub fn window(mut self, start: usize, horizon: usize) -> Self {
        self.start = start;
        self.horizon = horizon;
        self
    }

    pub fn with_robustness(mut self, robustness: Option<Robustness>) -> Self {
        self.robustness = robustness;
        self
    }

    pub fn pin(mut self, entity: EntityId, quantity: Quantity, values: Vec<f64>) -> Self {
        self.pins.insert((entity, quantity), values);
        self
    }

    pub fn bound(mut self, entity: EntityId, quantity: Quantity, bounds: Vec<(f64, f64)>) -> Self {
        self.bounds.insert((entity, quantity), bounds);
        self
    }

    pub fn with_initial_energy(mut self, energy: HashMap<EntityId, f64>) -> Self {
        self.initial_energy = energy;
        self
    }

    #[inline]
    pub fn dt(&self) -> f64 {
        self.env.timer.time_slot()
    }

    fn range(&self) -> Range<usize> {
        self.start..self.start + self.horizon
    }

    fn check(&self) -> SchedulingResult<()> {
        if self.horizon == 0 {
            return Err(SchedulingError::ModelBuild("window has no steps".into()));
        }
        let end = self.start + self.horizon;
        if self.env.prices.energy.len() < end {
            return Err(SchedulingError::ModelBuild(format!(
                "window ends at step {end} but the environment covers {} steps",
                self.env.prices.energy.len()
            )));
        }
        if let Some(robustness) = &self.robustness {
            robustness.validate()?;
        }
        Ok(())
    }
}

/// Variables of one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityVars {
    pub p_el: Option<Vec<Var>>,
    pub p_th_heat: Option<Vec<Var>>,
    pub energy: Option<(Quantity, Vec<Var>)>,
    /// Device-internal variables (e.g. battery charge and discharge).
    pub internal: Vec<Vec<Var>>,
}

impl EntityVars {
    pub fn get(&self, quantity: Quantity) -> Option<&[Var]> {
        match quantity {
            Quantity::PEl => self.p_el.as_deref(),
            Quantity::PThHeat => self.p_th_heat.as_deref(),
            q => self
                .energy
                .as_ref()
                .filter(|(eq, _)| *eq == q)
                .map(|(_, v)| v.as_slice()),
        }
    }

    fn require(&self, quantity: Quantity, leaf: &Leaf) -> SchedulingResult<&[Var]> {
        self.get(quantity).ok_or_else(|| {
            SchedulingError::ModelBuild(format!("{} has no {quantity} variables", leaf.prefix))
        })
    }
}

/// Naming scope of one entity.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub id: EntityId,
    prefix: String,
}

impl Leaf {
    fn new(tag: &str, id: EntityId) -> Self {
        Leaf {
            id,
            prefix: format!("{tag}_{id}"),
        }
    }

    fn name(&self, what: &str) -> String {
        format!("{}_{what}", self.prefix)
    }
}

/// Capability set of a schedulable device.
pub trait DeviceModel {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars>;

    fn declare_constraints(
        &self,
        _leaf: &Leaf,
        _vars: &EntityVars,
        _model: &mut Model,
        _ctx: &BuildContext<'_>,
    ) -> SchedulingResult<()> {
        Ok(())
    }
}

fn el_only(p_el: Vec<Var>) -> EntityVars {
    EntityVars {
        p_el: Some(p_el),
        ..EntityVars::default()
    }
}

impl DeviceModel for FixedLoad {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let demand = &self.demand[ctx.range()];
        let p = model.add_vars(&leaf.name("p_el"), ctx.horizon, |t| (demand[t], demand[t]))?;
        Ok(el_only(p))
    }
}

impl DeviceModel for CurtailableLoad {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let demand = &self.demand[ctx.range()];
        let keep = 1.0 - self.max_curtailment;
        let p = model.add_vars(&leaf.name("p_el"), ctx.horizon, |t| {
            (demand[t] * keep, demand[t])
        })?;
        Ok(el_only(p))
    }
}

impl DeviceModel for DeferrableLoad {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let p = model.add_vars(&leaf.name("p_el"), ctx.horizon, |t| {
            (0.0, if self.allowed(t) { self.p_el_nom } else { 0.0 })
        })?;
        Ok(el_only(p))
    }

    fn declare_constraints(
        &self,
        leaf: &Leaf,
        vars: &EntityVars,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<()> {
        if !ctx.end_constraints {
            return Ok(());
        }
        let p = vars.require(Quantity::PEl, leaf)?;
        let dt = ctx.dt();
        let allowed_steps = (0..ctx.horizon).filter(|t| self.allowed(*t)).count();
        let reachable = allowed_steps as f64 * self.p_el_nom * dt;
        if self.energy > reachable + 1e-9 {
            return Err(SchedulingError::ModelBuild(format!(
                "{} needs {} kWh but its window allows at most {reachable} kWh",
                leaf.prefix, self.energy
            )));
        }
        let mut expr = LinExpr::new();
        for var in p {
            expr.add_term(*var, dt);
        }
        model.add_constraint(leaf.name("energy"), expr, Sense::Eq, self.energy);
        Ok(())
    }
}

impl DeviceModel for Generator {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let gen = &self.generation[ctx.range()];
        let p = model.add_vars(&leaf.name("p_el"), ctx.horizon, |t| {
            if self.curtailable {
                (-gen[t], 0.0)
            } else {
                (-gen[t], -gen[t])
            }
        })?;
        Ok(el_only(p))
    }
}

fn storage_balance(
    leaf: &Leaf,
    model: &mut Model,
    energy: &[Var],
    keep: f64,
    e0: f64,
    inflow: impl Fn(usize) -> LinExpr,
) {
    for (t, e) in energy.iter().enumerate() {
        let mut expr = inflow(t).term(*e, 1.0);
        let rhs = if t == 0 {
            keep * e0
        } else {
            expr.add_term(energy[t - 1], -keep);
            0.0
        };
        model.add_constraint(leaf.name(&format!("e_balance[{t}]")), expr, Sense::Eq, rhs);
    }
}

fn end_state(
    leaf: &Leaf,
    model: &mut Model,
    energy: &[Var],
    target: f64,
    equality: bool,
    ctx: &BuildContext<'_>,
) {
    if !ctx.end_constraints {
        return;
    }
    if let Some(last) = energy.last() {
        let sense = if equality { Sense::Eq } else { Sense::Ge };
        model.add_constraint(leaf.name("e_end"), LinExpr::from(*last), sense, target);
    }
}

fn initial_energy(
    leaf: &Leaf,
    ctx: &BuildContext<'_>,
    default: f64,
    capacity: f64,
) -> SchedulingResult<f64> {
    let e0 = ctx.initial_energy.get(&leaf.id).copied().unwrap_or(default);
    // solver output may overshoot the bounds by its feasibility tolerance
    if !(-1e-6..=capacity + 1e-6).contains(&e0) {
        return Err(SchedulingError::ModelBuild(format!(
            "{} starts with {e0} kWh outside [0, {capacity}]",
            leaf.prefix
        )));
    }
    Ok(e0.clamp(0.0, capacity))
}

impl DeviceModel for Battery {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let h = ctx.horizon;
        let p_el = model.add_vars(&leaf.name("p_el"), h, |_| {
            (-self.p_discharge_max, self.p_charge_max)
        })?;
        let p_in = model.add_vars(&leaf.name("p_in"), h, |_| (0.0, self.p_charge_max))?;
        let p_out = model.add_vars(&leaf.name("p_out"), h, |_| (0.0, self.p_discharge_max))?;
        let e = model.add_vars(&leaf.name("e_el"), h, |_| (0.0, self.capacity))?;
        Ok(EntityVars {
            p_el: Some(p_el),
            energy: Some((Quantity::EEl, e)),
            internal: vec![p_in, p_out],
            ..EntityVars::default()
        })
    }

    fn declare_constraints(
        &self,
        leaf: &Leaf,
        vars: &EntityVars,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<()> {
        let p_el = vars.require(Quantity::PEl, leaf)?;
        let e = vars.require(Quantity::EEl, leaf)?;
        let (p_in, p_out) = match vars.internal.as_slice() {
            [p_in, p_out] => (p_in, p_out),
            _ => {
                return Err(SchedulingError::ModelBuild(format!(
                    "{} lacks charge/discharge variables",
                    leaf.prefix
                )))
            }
        };
        for t in 0..ctx.horizon {
            model.add_constraint(
                leaf.name(&format!("p_split[{t}]")),
                LinExpr::from(p_el[t]).term(p_in[t], -1.0).term(p_out[t], 1.0),
                Sense::Eq,
                0.0,
            );
        }
        let dt = ctx.dt();
        let e0 = initial_energy(leaf, ctx, self.soc_init * self.capacity, self.capacity)?;
        storage_balance(leaf, model, e, 1.0 - self.self_discharge, e0, |t| {
            LinExpr::new()
                .term(p_in[t], -self.eta_charge * dt)
                .term(p_out[t], dt / self.eta_discharge)
        });
        end_state(leaf, model, e, self.soc_init * self.capacity, self.end_equality, ctx);
        Ok(())
    }
}

/// Heat producer `p_th ∈ [-nom, 0]` with `p_th + k[t]·p_el = 0`.
fn heat_producer(
    leaf: &Leaf,
    model: &mut Model,
    ctx: &BuildContext<'_>,
    p_th_nom: f64,
    factors: &[f64],
) -> SchedulingResult<EntityVars> {
    let p_th = model.add_vars(&leaf.name("p_th_heat"), ctx.horizon, |_| (-p_th_nom, 0.0))?;
    let p_el = model.add_vars(&leaf.name("p_el"), ctx.horizon, |t| {
        if factors[t] > 0.0 {
            (0.0, p_th_nom / factors[t])
        } else {
            (0.0, 0.0)
        }
    })?;
    for t in 0..ctx.horizon {
        model.add_constraint(
            leaf.name(&format!("conversion[{t}]")),
            LinExpr::from(p_th[t]).term(p_el[t], factors[t]),
            Sense::Eq,
            0.0,
        );
    }
    Ok(EntityVars {
        p_el: Some(p_el),
        p_th_heat: Some(p_th),
        ..EntityVars::default()
    })
}

impl DeviceModel for ElectricalHeater {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        heat_producer(leaf, model, ctx, self.p_th_nom, &vec![self.eta; ctx.horizon])
    }
}

impl DeviceModel for HeatPump {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let cop = ctx
            .range()
            .map(|step| self.cop.at(step, ctx.env))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SchedulingError::ModelBuild(format!("{}: {e}", leaf.prefix)))?;
        heat_producer(leaf, model, ctx, self.p_th_nom, &cop)
    }
}

impl DeviceModel for Boiler {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let p_th = model.add_vars(&leaf.name("p_th_heat"), ctx.horizon, |_| (-self.p_th_nom, 0.0))?;
        Ok(EntityVars {
            p_th_heat: Some(p_th),
            ..EntityVars::default()
        })
    }
}

impl DeviceModel for ThermalHeatingStorage {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let p_th = model.add_vars(&leaf.name("p_th_heat"), ctx.horizon, |_| FREE)?;
        let e = model.add_vars(&leaf.name("e_th_heat"), ctx.horizon, |_| (0.0, self.capacity))?;
        Ok(EntityVars {
            p_th_heat: Some(p_th),
            energy: Some((Quantity::EThHeat, e)),
            ..EntityVars::default()
        })
    }

    fn declare_constraints(
        &self,
        leaf: &Leaf,
        vars: &EntityVars,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<()> {
        let p_th = vars.require(Quantity::PThHeat, leaf)?;
        let e = vars.require(Quantity::EThHeat, leaf)?;
        let dt = ctx.dt();
        let e0 = initial_energy(leaf, ctx, self.soc_init * self.capacity, self.capacity)?;
        storage_balance(leaf, model, e, 1.0 - self.loss, e0, |t| {
            LinExpr::new().term(p_th[t], -dt)
        });
        end_state(leaf, model, e, self.soc_init * self.capacity, self.end_equality, ctx);
        Ok(())
    }
}

fn thermal_demand(
    leaf: &Leaf,
    model: &mut Model,
    ctx: &BuildContext<'_>,
    demand: &[f64],
) -> SchedulingResult<EntityVars> {
    let demand = &demand[ctx.range()];
    let p_th = model.add_vars(&leaf.name("p_th_heat"), ctx.horizon, |t| (demand[t], demand[t]))?;
    Ok(EntityVars {
        p_th_heat: Some(p_th),
        ..EntityVars::default()
    })
}

impl DeviceModel for SpaceHeating {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        thermal_demand(leaf, model, ctx, &self.demand)
    }
}

impl DeviceModel for DomesticHotWater {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        thermal_demand(leaf, model, ctx, &self.demand)
    }
}

impl DeviceModel for CombinedHeatPower {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let p_th = model.add_vars(&leaf.name("p_th_heat"), ctx.horizon, |_| (-self.p_th_nom, 0.0))?;
        let p_el = model.add_vars(&leaf.name("p_el"), ctx.horizon, |_| (-self.p_el_nom, 0.0))?;
        Ok(EntityVars {
            p_el: Some(p_el),
            p_th_heat: Some(p_th),
            ..EntityVars::default()
        })
    }

    fn declare_constraints(
        &self,
        leaf: &Leaf,
        vars: &EntityVars,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<()> {
        let p_el = vars.require(Quantity::PEl, leaf)?;
        let p_th = vars.require(Quantity::PThHeat, leaf)?;
        let sigma = self.sigma();
        for t in 0..ctx.horizon {
            model.add_constraint(
                leaf.name(&format!("chp_ratio[{t}]")),
                LinExpr::from(p_el[t]).term(p_th[t], -sigma),
                Sense::Eq,
                0.0,
            );
        }
        Ok(())
    }
}

/// Energy an electrical vehicle holds at the last step of the window while
/// it is plugged in: the share of its charging period's required charge that
/// has elapsed.
fn ev_window_target(ev: &ElectricalVehicle, last: usize, steps_per_day: usize, dt: f64) -> f64 {
    let plugged = |step| ev.plugged_in(step, steps_per_day);
    let mut first = last;
    while first > 0 && plugged(first - 1) {
        first -= 1;
    }
    let pattern_end = if ev.charging.is_empty() {
        usize::MAX
    } else {
        ev.charging.len()
    };
    let mut stop = last + 1;
    while stop < pattern_end && plugged(stop) {
        stop += 1;
    }
    let duration = (stop - first) as f64;
    let start_level = if ev.charged_before(first, steps_per_day) {
        ev.soc_return * ev.capacity
    } else {
        ev.soc_init * ev.capacity
    };
    let mut required = ev.capacity - start_level;
    if stop == pattern_end {
        // the last period may be too short to fill up
        required = required.min(duration * dt * ev.p_charge_max * ev.eta_charge);
    }
    start_level + (last - first + 1) as f64 * required / duration
}

impl DeviceModel for ElectricalVehicle {
    fn declare_variables(
        &self,
        leaf: &Leaf,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<EntityVars> {
        let h = ctx.horizon;
        let per_day = ctx.env.timer.steps_per_day();
        let plugged: Vec<bool> = ctx.range().map(|s| self.plugged_in(s, per_day)).collect();
        let leaves = |t: usize| t + 1 < h && plugged[t] && !plugged[t + 1];

        let p_el = model.add_vars(&leaf.name("p_el"), h, |t| {
            if plugged[t] {
                (-self.p_discharge_max, self.p_charge_max)
            } else {
                (0.0, 0.0)
            }
        })?;
        let p_in = model.add_vars(&leaf.name("p_in"), h, |t| {
            (0.0, if plugged[t] { self.p_charge_max } else { 0.0 })
        })?;
        let p_out = model.add_vars(&leaf.name("p_out"), h, |t| {
            (0.0, if plugged[t] { self.p_discharge_max } else { 0.0 })
        })?;
        let p_drive = model.add_vars(&leaf.name("p_drive"), h, |t| {
            (0.0, if plugged[t] { 0.0 } else { f64::INFINITY })
        })?;

        let mut seen = self.charged_before(ctx.start, per_day);
        let e = model.add_vars(&leaf.name("e_el"), h, |t| {
            if plugged[t] {
                seen = true;
                if leaves(t) {
                    (self.capacity, self.capacity)
                } else {
                    (0.0, self.capacity)
                }
            } else {
                let level = if seen { self.soc_return } else { self.soc_init } * self.capacity;
                (level, level)
            }
        })?;
        Ok(EntityVars {
            p_el: Some(p_el),
            energy: Some((Quantity::EEl, e)),
            internal: vec![p_in, p_out, p_drive],
            ..EntityVars::default()
        })
    }

    fn declare_constraints(
        &self,
        leaf: &Leaf,
        vars: &EntityVars,
        model: &mut Model,
        ctx: &BuildContext<'_>,
    ) -> SchedulingResult<()> {
        let p_el = vars.require(Quantity::PEl, leaf)?;
        let e = vars.require(Quantity::EEl, leaf)?;
        let (p_in, p_out, p_drive) = match vars.internal.as_slice() {
            [p_in, p_out, p_drive] => (p_in, p_out, p_drive),
            _ => {
                return Err(SchedulingError::ModelBuild(format!(
                    "{} lacks charge, discharge or drive variables",
                    leaf.prefix
                )))
            }
        };
        for t in 0..ctx.horizon {
            model.add_constraint(
                leaf.name(&format!("p_split[{t}]")),
                LinExpr::from(p_el[t]).term(p_in[t], -1.0).term(p_out[t], 1.0),
                Sense::Eq,
                0.0,
            );
        }
        let dt = ctx.dt();
        let e0 = initial_energy(leaf, ctx, self.soc_init * self.capacity, self.capacity)?;
        storage_balance(leaf, model, e, 1.0, e0, |t| {
            LinExpr::new()
                .term(p_in[t], -self.eta_charge * dt)
                .term(p_out[t], dt / self.eta_discharge)
                .term(p_drive[t], dt)
        });

        let per_day = ctx.env.timer.steps_per_day();
        let last = ctx.start + ctx.horizon - 1;
        if ctx.end_constraints && self.plugged_in(last, per_day) {
            if let Some(e_last) = e.last() {
                let target = ev_window_target(self, last, per_day, dt);
                model.add_constraint(leaf.name("e_end"), LinExpr::from(*e_last), Sense::Eq, target);
            }
        }
        Ok(())
    }
}

fn device_model(device: &Device) -> &dyn DeviceModel {
    match device {
        Device::FixedLoad(d) => d,
        Device::CurtailableLoad(d) => d,
        Device::DeferrableLoad(d) => d,
        Device::Photovoltaic(d) | Device::WindEnergyConverter(d) => d,
        Device::Battery(d) => d,
        Device::ElectricalHeater(d) => d,
        Device::HeatPump(d) => d,
        Device::Boiler(d) => d,
        Device::ThermalHeatingStorage(d) => d,
        Device::SpaceHeating(d) => d,
        Device::DomesticHotWater(d) => d,
        Device::CombinedHeatPower(d) => d,
        Device::ElectricalVehicle(d) => d,
    }
}

/// Mapping from entities to their model variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Layout {
    entries: Vec<(EntityId, EntityVars)>,
}

impl Layout {
    pub fn vars(&self, id: EntityId) -> Option<&EntityVars> {
        self.entries.iter().find(|(e, _)| *e == id).map(|(_, v)| v)
    }

    pub fn p_el(&self, id: EntityId) -> Option<&[Var]> {
        self.vars(id).and_then(|v| v.p_el.as_deref())
    }

    pub fn entities(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }

    /// Read every entity's trajectories out of a solution vector.
    pub fn schedules(&self, values: &[f64]) -> HashMap<EntityId, Schedule> {
        let read = |vars: &[Var]| vars.iter().map(|v| values[v.index()]).collect::<Vec<_>>();
        self.entries
            .iter()
            .map(|(id, vars)| {
                let mut schedule = Schedule::new();
                if let Some(p) = &vars.p_el {
                    schedule.insert(Quantity::PEl, read(p));
                }
                if let Some(p) = &vars.p_th_heat {
                    schedule.insert(Quantity::PThHeat, read(p));
                }
                if let Some((q, e)) = &vars.energy {
                    schedule.insert(*q, read(e));
                }
                (*id, schedule)
            })
            .collect()
    }
}

/// Incrementally assembles a model for a set of entities.
pub struct ProblemBuilder<'a> {
    ctx: BuildContext<'a>,
    model: Model,
    layout: Layout,
}

impl<'a> ProblemBuilder<'a> {
    pub fn new(ctx: BuildContext<'a>) -> SchedulingResult<Self> {
        ctx.check()?;
        Ok(ProblemBuilder {
            ctx,
            model: Model::new(),
            layout: Layout::default(),
        })
    }

    pub fn context(&self) -> &BuildContext<'a> {
        &self.ctx
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Declare `entity` and its whole subtree.
    pub fn add_entity(&mut self, entity: &Entity) -> SchedulingResult<EntityVars> {
        let vars = match entity.kind() {
            EntityKind::Device(device) => self.add_device(entity, device)?,
            kind => {
                let children = entity
                    .children()
                    .iter()
                    .map(|child| self.add_entity(child))
                    .collect::<SchedulingResult<Vec<_>>>()?;
                let vars = self.aggregate_children(entity, &children)?;
                if matches!(kind, EntityKind::Building { .. }) {
                    self.add_robust_bounds(entity)?;
                }
                vars
            }
        };
        self.apply_pins(entity, &vars)?;
        self.layout.entries.push((entity.id(), vars.clone()));
        Ok(vars)
    }

    /// Declare only a free electrical trajectory for `entity`, without its
    /// children.
    pub fn add_detached(&mut self, entity: &Entity) -> SchedulingResult<Vec<Var>> {
        let leaf = Leaf::new(entity.kind().tag(), entity.id());
        let p = self.model.add_vars(&leaf.name("p_el"), self.ctx.horizon, |_| FREE)?;
        let vars = el_only(p.clone());
        self.apply_pins(entity, &vars)?;
        self.layout.entries.push((entity.id(), vars));
        Ok(p)
    }

    fn add_device(&mut self, entity: &Entity, device: &Device) -> SchedulingResult<EntityVars> {
        let leaf = Leaf::new(device.tag(), entity.id());
        device
            .validate(self.ctx.start + self.ctx.horizon)
            .map_err(|e| SchedulingError::ModelBuild(format!("{} '{}': {e}", leaf.prefix, entity.name())))?;
        let dm = device_model(device);
        let vars = dm.declare_variables(&leaf, &mut self.model, &self.ctx)?;
        dm.declare_constraints(&leaf, &vars, &mut self.model, &self.ctx)?;
        Ok(vars)
    }

    /// Tie a composite's trajectories to the sum of its children.
    fn aggregate_children(
        &mut self,
        entity: &Entity,
        children: &[EntityVars],
    ) -> SchedulingResult<EntityVars> {
        let leaf = Leaf::new(entity.kind().tag(), entity.id());
        let h = self.ctx.horizon;

        let p_el = self.model.add_vars(&leaf.name("p_el"), h, |_| FREE)?;
        let el_children: Vec<&[Var]> = children.iter().filter_map(|c| c.p_el.as_deref()).collect();
        for t in 0..h {
            let mut expr = LinExpr::from(p_el[t]);
            for child in &el_children {
                expr.add_term(child[t], -1.0);
            }
            self.model
                .add_constraint(leaf.name(&format!("p_el_sum[{t}]")), expr, Sense::Eq, 0.0);
        }

        let th_children: Vec<&[Var]> = children
            .iter()
            .filter_map(|c| c.p_th_heat.as_deref())
            .collect();
        let p_th_heat = if th_children.is_empty() {
            None
        } else if matches!(entity.kind(), EntityKind::Building { .. }) {
            for t in 0..h {
                let expr = LinExpr::sum(th_children.iter().map(|c| &c[t]));
                self.model
                    .add_constraint(leaf.name(&format!("th_balance[{t}]")), expr, Sense::Eq, 0.0);
            }
            None
        } else {
            let p_th = self.model.add_vars(&leaf.name("p_th_heat"), h, |_| FREE)?;
            for t in 0..h {
                let mut expr = LinExpr::from(p_th[t]);
                for child in &th_children {
                    expr.add_term(child[t], -1.0);
                }
                self.model
                    .add_constraint(leaf.name(&format!("p_th_sum[{t}]")), expr, Sense::Eq, 0.0);
            }
            Some(p_th)
        };

        Ok(EntityVars {
            p_el: Some(p_el),
            p_th_heat,
            ..EntityVars::default()
        })
    }

    fn add_robust_bounds(&mut self, building: &Entity) -> SchedulingResult<()> {
        let Some(robustness) = self.ctx.robustness else {
            return Ok(());
        };
        let h = self.ctx.horizon;
        let mut demand = vec![0.0; h];
        let mut heat_supply = 0.0;
        let mut capacity = 0.0;
        let mut end_value = 0.0;
        let mut storages = Vec::new();
        for (entity, device) in building.devices() {
            match device {
                Device::SpaceHeating(sh) => {
                    for (d, v) in demand.iter_mut().zip(&sh.demand[self.ctx.range()]) {
                        *d += v;
                    }
                }
                Device::ThermalHeatingStorage(ths) => {
                    capacity += ths.capacity;
                    end_value += ths.soc_init * ths.capacity;
                    storages.push(entity.id());
                }
                other => heat_supply += other.heat_supply().unwrap_or(0.0),
            }
        }
        if storages.is_empty() {
            return Ok(());
        }

        let (lower, upper) = storage_bounds(
            &robustness,
            &StorageEnvelope {
                demand: &demand,
                heat_supply,
                capacity,
                end_value,
                dt: self.ctx.dt(),
            },
        );
        let energy: Vec<Vec<Var>> = storages
            .iter()
            .filter_map(|id| self.layout.vars(*id))
            .filter_map(|v| v.get(Quantity::EThHeat).map(<[Var]>::to_vec))
            .collect();
        let leaf = Leaf::new(building.kind().tag(), building.id());
        for t in 0..h {
            let expr = LinExpr::sum(energy.iter().map(|e| &e[t]));
            self.model.add_constraint(
                leaf.name(&format!("robust_lower[{t}]")),
                expr.clone(),
                Sense::Ge,
                lower[t],
            );
            self.model
                .add_constraint(leaf.name(&format!("robust_upper[{t}]")), expr, Sense::Le, upper[t]);
        }
        Ok(())
    }

    fn apply_pins(&mut self, entity: &Entity, vars: &EntityVars) -> SchedulingResult<()> {
        for quantity in [Quantity::PEl, Quantity::PThHeat, Quantity::EEl, Quantity::EThHeat] {
            if let Some(bounds) = self.ctx.bounds.get(&(entity.id(), quantity)) {
                let targets = vars.get(quantity).unwrap_or_default();
                if bounds.len() != targets.len() {
                    return Err(SchedulingError::ModelBuild(format!(
                        "bounds on {quantity} of entity {} cover {} steps, window has {}",
                        entity.id(),
                        bounds.len(),
                        targets.len()
                    )));
                }
                for (var, (lower, upper)) in targets.iter().zip(bounds) {
                    self.model.set_bounds(*var, *lower, *upper)?;
                }
            }
            let Some(values) = self.ctx.pins.get(&(entity.id(), quantity)) else {
                continue;
            };
            let targets = vars.get(quantity).ok_or_else(|| {
                SchedulingError::ModelBuild(format!(
                    "entity {} has no {quantity} trajectory to pin",
                    entity.id()
                ))
            })?;
            if values.len() != targets.len() {
                return Err(SchedulingError::ModelBuild(format!(
                    "pinned {quantity} of entity {} has {} values, window has {}",
                    entity.id(),
                    values.len(),
                    targets.len()
                )));
            }
            for (var, value) in targets.iter().zip(values) {
                self.model.fix(*var, *value)?;
            }
        }
        Ok(())
    }

    /// Add `coeff ·` the objective of `objective` over trajectory `p`.
    pub fn add_objective(
        &mut self,
        scope: &str,
        p: &[Var],
        objective: Objective,
        coeff: f64,
    ) -> SchedulingResult<()> {
        if !coeff.is_finite() || coeff < 0.0 {
            return Err(SchedulingError::ModelBuild(format!(
                "objective weight {coeff} for {scope} must be finite and non-negative"
            )));
        }
        if coeff == 0.0 {
            return Ok(());
        }
        match objective {
            Objective::None => {}
            Objective::PeakShaving => {
                for var in p {
                    self.model.add_square(*var, coeff);
                }
            }
            Objective::Price => {
                let prices = normalized(&self.ctx.env.prices.energy[self.ctx.range()]);
                for (var, price) in p.iter().zip(prices) {
                    self.model.add_linear(*var, coeff * price);
                }
            }
            Objective::Co2 => {
                let co2 = self.ctx.env.prices.co2.as_ref().ok_or_else(|| {
                    SchedulingError::ModelBuild(format!(
                        "{scope} minimises co2 but the environment has no co2 series"
                    ))
                })?;
                let co2 = normalized(&co2[self.ctx.range()]);
                for (var, c) in p.iter().zip(co2) {
                    self.model.add_linear(*var, coeff * c);
                }
            }
            Objective::MaxConsumption => {
                let peak = self
                    .model
                    .add_var(format!("{scope}_max_p"), 0.0, f64::INFINITY)?;
                for (t, var) in p.iter().enumerate() {
                    self.model.add_constraint(
                        format!("{scope}_max_p_upper[{t}]"),
                        LinExpr::from(peak).term(*var, -1.0),
                        Sense::Ge,
                        0.0,
                    );
                    self.model.add_constraint(
                        format!("{scope}_max_p_lower[{t}]"),
                        LinExpr::from(peak).term(*var, 1.0),
                        Sense::Ge,
                        0.0,
                    );
                }
                self.model.add_linear(peak, coeff);
            }
            Objective::SelfConsumption => {
                let h = p.len();
                let import = self
                    .model
                    .add_vars(&format!("{scope}_import"), h, |_| (0.0, f64::INFINITY))?;
                let export = self
                    .model
                    .add_vars(&format!("{scope}_export"), h, |_| (0.0, f64::INFINITY))?;
                for t in 0..h {
                    self.model.add_constraint(
                        format!("{scope}_exchange[{t}]"),
                        LinExpr::from(p[t]).term(import[t], -1.0).term(export[t], 1.0),
                        Sense::Eq,
                        0.0,
                    );
                    self.model.add_square(export[t], coeff);
                }
            }
        }
        Ok(())
    }

    pub fn finish(self) -> (Model, Layout) {
        (self.model, self.layout)
    }
}

/// Naming scope used for objective auxiliaries of an entity.
pub fn scope_of(entity: &Entity) -> String {
    format!("{}_{}", entity.kind().tag(), entity.id())
}
