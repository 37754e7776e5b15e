//! Device catalogue.
//!
//! Devices are the leaves of a district hierarchy. Each one carries the
//! parameters and forecasts that determine its operating region; the problem
//! builder in `cityflex-algo` turns them into variables and constraints.
//!
//! Sign convention: consumption is positive, generation is negative. Heat
//! producers therefore have a non-positive thermal trajectory, while thermal
//! demand (space heating) is positive.
//!
//! Forecast series are indexed by absolute simulation step, like the
//! environment series, and must cover the optimisation window.

use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult, Environment, Quantity};

/// Inflexible electrical load following its forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedLoad {
    /// Demand in kW per step.
    pub demand: Vec<f64>,
}

impl FixedLoad {
    pub fn new(demand: Vec<f64>) -> Self {
        FixedLoad { demand }
    }
}

/// Load that may shed part of its demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CurtailableLoad {
    pub demand: Vec<f64>,
    /// Share of the demand that may be shed, in `[0, 1]`.
    pub max_curtailment: f64,
}

impl CurtailableLoad {
    pub fn new(demand: Vec<f64>, max_curtailment: f64) -> Self {
        CurtailableLoad {
            demand,
            max_curtailment,
        }
    }
}

/// Load that must consume a fixed amount of energy inside an allowed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeferrableLoad {
    /// Nominal power in kW.
    pub p_el_nom: f64,
    /// Energy to consume within the optimisation window, in kWh.
    pub energy: f64,
    /// Steps of the optimisation window in which the load may run. An empty
    /// window allows every step.
    #[serde(default)]
    pub window: Vec<bool>,
}

impl DeferrableLoad {
    pub fn new(p_el_nom: f64, energy: f64) -> Self {
        DeferrableLoad {
            p_el_nom,
            energy,
            window: Vec::new(),
        }
    }

    pub fn with_window(mut self, window: Vec<bool>) -> Self {
        self.window = window;
        self
    }

    pub fn allowed(&self, offset: usize) -> bool {
        self.window.get(offset).copied().unwrap_or(self.window.is_empty())
    }
}

/// Renewable generator fed by a generation forecast (kW, non-negative).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Generator {
    pub generation: Vec<f64>,
    /// Whether output may be curtailed below the forecast.
    #[serde(default)]
    pub curtailable: bool,
}

impl Generator {
    pub fn new(generation: Vec<f64>) -> Self {
        Generator {
            generation,
            curtailable: false,
        }
    }

    pub fn curtailable(mut self) -> Self {
        self.curtailable = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Battery {
    /// Usable capacity in kWh.
    pub capacity: f64,
    /// Initial and final state of charge as a share of capacity.
    pub soc_init: f64,
    pub p_charge_max: f64,
    pub p_discharge_max: f64,
    #[serde(default = "unit")]
    pub eta_charge: f64,
    #[serde(default = "unit")]
    pub eta_discharge: f64,
    /// Share of stored energy lost per step.
    #[serde(default)]
    pub self_discharge: f64,
    /// Require the final state of charge to equal the initial one instead of
    /// merely reaching it.
    #[serde(default)]
    pub end_equality: bool,
}

impl Battery {
    pub fn new(capacity: f64, p_max: f64, soc_init: f64) -> Self {
        Battery {
            capacity,
            soc_init,
            p_charge_max: p_max,
            p_discharge_max: p_max,
            eta_charge: 1.0,
            eta_discharge: 1.0,
            self_discharge: 0.0,
            end_equality: false,
        }
    }

    pub fn with_efficiencies(mut self, eta_charge: f64, eta_discharge: f64) -> Self {
        self.eta_charge = eta_charge;
        self.eta_discharge = eta_discharge;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElectricalHeater {
    /// Nominal thermal output in kW.
    pub p_th_nom: f64,
    #[serde(default = "unit")]
    pub eta: f64,
}

impl ElectricalHeater {
    pub fn new(p_th_nom: f64) -> Self {
        ElectricalHeater { p_th_nom, eta: 1.0 }
    }
}

/// Coefficient of performance of a heat pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", deny_unknown_fields)]
pub enum Cop {
    Constant { value: f64 },
    /// Per-step values, indexed like the environment series.
    Series { values: Vec<f64> },
    /// Carnot cop scaled by a quality grade, using the ambient temperature
    /// from the environment.
    Carnot { eta: f64, flow_temperature: f64 },
}

impl Cop {
    pub fn at(&self, step: usize, env: &Environment) -> CoreResult<f64> {
        let value = match self {
            Cop::Constant { value } => *value,
            Cop::Series { values } => *values.get(step).ok_or_else(|| {
                CoreError::Validation(format!("cop series has no value for step {step}"))
            })?,
            Cop::Carnot {
                eta,
                flow_temperature,
            } => {
                let ambient = *env.weather.ambient_temperature.get(step).ok_or_else(|| {
                    CoreError::Validation(format!(
                        "carnot cop needs an ambient temperature for step {step}"
                    ))
                })?;
                let lift = flow_temperature - ambient;
                if lift <= 0.0 {
                    return Err(CoreError::Validation(format!(
                        "flow temperature {flow_temperature} does not exceed ambient {ambient}"
                    )));
                }
                (eta * (flow_temperature + 273.15) / lift).max(0.0)
            }
        };
        if !value.is_finite() || value < 0.0 {
            return Err(CoreError::Validation(format!(
                "cop at step {step} is {value}"
            )));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeatPump {
    pub p_th_nom: f64,
    pub cop: Cop,
}

impl HeatPump {
    pub fn new(p_th_nom: f64, cop: f64) -> Self {
        HeatPump {
            p_th_nom,
            cop: Cop::Constant { value: cop },
        }
    }
}

/// Fuel-fired heat source without an electrical trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Boiler {
    pub p_th_nom: f64,
    #[serde(default = "unit")]
    pub eta: f64,
}

impl Boiler {
    pub fn new(p_th_nom: f64) -> Self {
        Boiler { p_th_nom, eta: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThermalHeatingStorage {
    /// Capacity in kWh.
    pub capacity: f64,
    pub soc_init: f64,
    /// Share of stored heat lost per step.
    #[serde(default)]
    pub loss: f64,
    #[serde(default)]
    pub end_equality: bool,
}

impl ThermalHeatingStorage {
    pub fn new(capacity: f64, soc_init: f64) -> Self {
        ThermalHeatingStorage {
            capacity,
            soc_init,
            loss: 0.0,
            end_equality: false,
        }
    }
}

/// Thermal demand following its forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpaceHeating {
    pub demand: Vec<f64>,
}

impl SpaceHeating {
    pub fn new(demand: Vec<f64>) -> Self {
        SpaceHeating { demand }
    }
}

/// Hot water draw, a thermal demand following its forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomesticHotWater {
    pub demand: Vec<f64>,
}

impl DomesticHotWater {
    pub fn new(demand: Vec<f64>) -> Self {
        DomesticHotWater { demand }
    }
}

/// Combined heat and power unit. Electrical output is proportional to heat
/// output, with the ratio of the nominal powers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CombinedHeatPower {
    pub p_th_nom: f64,
    pub p_el_nom: f64,
}

impl CombinedHeatPower {
    pub fn new(p_th_nom: f64, p_el_nom: f64) -> Self {
        CombinedHeatPower { p_th_nom, p_el_nom }
    }

    /// Electrical output per unit of heat output.
    pub fn sigma(&self) -> f64 {
        if self.p_th_nom > 0.0 {
            self.p_el_nom / self.p_th_nom
        } else {
            0.0
        }
    }
}

/// Battery that is only reachable while plugged in.
///
/// Away from the charger the vehicle draws its driving consumption from the
/// battery; on return it holds `soc_return` of its capacity (or `soc_init`
/// if it has not been plugged in yet). It leaves fully charged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ElectricalVehicle {
    pub capacity: f64,
    pub soc_init: f64,
    pub p_charge_max: f64,
    #[serde(default)]
    pub p_discharge_max: f64,
    #[serde(default = "unit")]
    pub eta_charge: f64,
    #[serde(default = "unit")]
    pub eta_discharge: f64,
    /// Plugged-in indicator per absolute step. When empty, the vehicle is
    /// plugged in during the first and last quarter of every day.
    #[serde(default)]
    pub charging: Vec<bool>,
    #[serde(default = "soc_return")]
    pub soc_return: f64,
}

impl ElectricalVehicle {
    pub fn new(capacity: f64, p_charge_max: f64, soc_init: f64) -> Self {
        ElectricalVehicle {
            capacity,
            soc_init,
            p_charge_max,
            p_discharge_max: 0.0,
            eta_charge: 1.0,
            eta_discharge: 1.0,
            charging: Vec::new(),
            soc_return: soc_return(),
        }
    }

    pub fn with_charging(mut self, charging: Vec<bool>) -> Self {
        self.charging = charging;
        self
    }

    /// Whether the vehicle is plugged in at absolute `step`.
    pub fn plugged_in(&self, step: usize, steps_per_day: usize) -> bool {
        if !self.charging.is_empty() {
            return self.charging.get(step).copied().unwrap_or(false);
        }
        let day = steps_per_day.max(1);
        let night = day / 4;
        let away = day / 2;
        let slot = step % day;
        slot < night || slot >= night + away
    }

    /// Whether the vehicle has been plugged in at any step before `step`.
    pub fn charged_before(&self, step: usize, steps_per_day: usize) -> bool {
        (0..step).any(|s| self.plugged_in(s, steps_per_day))
    }
}

fn unit() -> f64 {
    1.0
}

fn soc_return() -> f64 {
    0.2
}

/// A schedulable device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Device {
    FixedLoad(FixedLoad),
    CurtailableLoad(CurtailableLoad),
    DeferrableLoad(DeferrableLoad),
    Photovoltaic(Generator),
    WindEnergyConverter(Generator),
    Battery(Battery),
    ElectricalHeater(ElectricalHeater),
    HeatPump(HeatPump),
    Boiler(Boiler),
    ThermalHeatingStorage(ThermalHeatingStorage),
    SpaceHeating(SpaceHeating),
    DomesticHotWater(DomesticHotWater),
    CombinedHeatPower(CombinedHeatPower),
    ElectricalVehicle(ElectricalVehicle),
}

impl Device {
    /// Short tag used in variable names and reports.
    pub fn tag(&self) -> &'static str {
        match self {
            Device::FixedLoad(_) => "FL",
            Device::CurtailableLoad(_) => "CL",
            Device::DeferrableLoad(_) => "DL",
            Device::Photovoltaic(_) => "PV",
            Device::WindEnergyConverter(_) => "WEC",
            Device::Battery(_) => "BAT",
            Device::ElectricalHeater(_) => "EH",
            Device::HeatPump(_) => "HP",
            Device::Boiler(_) => "B",
            Device::ThermalHeatingStorage(_) => "THS",
            Device::SpaceHeating(_) => "SH",
            Device::DomesticHotWater(_) => "DHW",
            Device::CombinedHeatPower(_) => "CHP",
            Device::ElectricalVehicle(_) => "EV",
        }
    }

    pub fn has_electrical(&self) -> bool {
        !matches!(
            self,
            Device::Boiler(_)
                | Device::ThermalHeatingStorage(_)
                | Device::SpaceHeating(_)
                | Device::DomesticHotWater(_)
        )
    }

    pub fn has_thermal(&self) -> bool {
        matches!(
            self,
            Device::ElectricalHeater(_)
                | Device::HeatPump(_)
                | Device::Boiler(_)
                | Device::ThermalHeatingStorage(_)
                | Device::SpaceHeating(_)
                | Device::DomesticHotWater(_)
                | Device::CombinedHeatPower(_)
        )
    }

    /// Quantity holding the stored energy, if the device is a storage.
    pub fn storage_quantity(&self) -> Option<Quantity> {
        match self {
            Device::Battery(_) | Device::ElectricalVehicle(_) => Some(Quantity::EEl),
            Device::ThermalHeatingStorage(_) => Some(Quantity::EThHeat),
            _ => None,
        }
    }

    /// Devices whose output is given by nature or occupants rather than chosen.
    pub fn is_uncontrollable(&self) -> bool {
        matches!(
            self,
            Device::FixedLoad(_)
                | Device::SpaceHeating(_)
                | Device::DomesticHotWater(_)
                | Device::Photovoltaic(_)
                | Device::WindEnergyConverter(_)
        )
    }

    /// Devices that can be re-dispatched to absorb deviations from a plan.
    pub fn compensates(&self) -> bool {
        matches!(
            self,
            Device::Battery(_)
                | Device::ElectricalHeater(_)
                | Device::HeatPump(_)
                | Device::Boiler(_)
                | Device::CombinedHeatPower(_)
                | Device::ThermalHeatingStorage(_)
        )
    }

    /// Nominal heat output of heat producers.
    pub fn heat_supply(&self) -> Option<f64> {
        match self {
            Device::ElectricalHeater(d) => Some(d.p_th_nom),
            Device::HeatPump(d) => Some(d.p_th_nom),
            Device::Boiler(d) => Some(d.p_th_nom),
            Device::CombinedHeatPower(d) => Some(d.p_th_nom),
            _ => None,
        }
    }

    /// Forecast trajectory of an uncontrollable device in the sign convention
    /// of its primary quantity.
    pub fn forecast(&self, range: std::ops::Range<usize>) -> Option<(Quantity, Vec<f64>)> {
        let slice = |series: &[f64]| series.get(range.clone()).map(<[f64]>::to_vec);
        match self {
            Device::FixedLoad(d) => slice(&d.demand).map(|v| (Quantity::PEl, v)),
            Device::SpaceHeating(d) => slice(&d.demand).map(|v| (Quantity::PThHeat, v)),
            Device::DomesticHotWater(d) => slice(&d.demand).map(|v| (Quantity::PThHeat, v)),
            Device::Photovoltaic(d) | Device::WindEnergyConverter(d) => slice(&d.generation)
                .map(|v| (Quantity::PEl, v.into_iter().map(|g| -g).collect())),
            _ => None,
        }
    }

    /// Check parameters and forecast coverage for a window ending before `needed`.
    pub fn validate(&self, needed: usize) -> CoreResult<()> {
        match self {
            Device::FixedLoad(d) => series("fixed load demand", &d.demand, needed, true),
            Device::SpaceHeating(d) => series("space heating demand", &d.demand, needed, true),
            Device::DomesticHotWater(d) => series("hot water demand", &d.demand, needed, true),
            Device::CurtailableLoad(d) => {
                series("curtailable load demand", &d.demand, needed, true)?;
                share("max_curtailment", d.max_curtailment)
            }
            Device::DeferrableLoad(d) => {
                non_negative("p_el_nom", d.p_el_nom)?;
                non_negative("energy", d.energy)
            }
            Device::Photovoltaic(d) | Device::WindEnergyConverter(d) => {
                series("generation", &d.generation, needed, true)
            }
            Device::Battery(d) => {
                non_negative("capacity", d.capacity)?;
                non_negative("p_charge_max", d.p_charge_max)?;
                non_negative("p_discharge_max", d.p_discharge_max)?;
                share("soc_init", d.soc_init)?;
                share("self_discharge", d.self_discharge)?;
                efficiency("eta_charge", d.eta_charge)?;
                efficiency("eta_discharge", d.eta_discharge)
            }
            Device::ElectricalHeater(d) => {
                non_negative("p_th_nom", d.p_th_nom)?;
                efficiency("eta", d.eta)
            }
            Device::HeatPump(d) => {
                non_negative("p_th_nom", d.p_th_nom)?;
                if let Cop::Series { values } = &d.cop {
                    series("cop", values, needed, true)?;
                }
                Ok(())
            }
            Device::Boiler(d) => {
                non_negative("p_th_nom", d.p_th_nom)?;
                efficiency("eta", d.eta)
            }
            Device::ThermalHeatingStorage(d) => {
                non_negative("capacity", d.capacity)?;
                share("soc_init", d.soc_init)?;
                share("loss", d.loss)
            }
            Device::CombinedHeatPower(d) => {
                non_negative("p_th_nom", d.p_th_nom)?;
                non_negative("p_el_nom", d.p_el_nom)?;
                if d.p_th_nom == 0.0 && d.p_el_nom > 0.0 {
                    return Err(CoreError::Validation(
                        "p_el_nom must be zero when p_th_nom is zero".into(),
                    ));
                }
                Ok(())
            }
            Device::ElectricalVehicle(d) => {
                non_negative("capacity", d.capacity)?;
                non_negative("p_charge_max", d.p_charge_max)?;
                non_negative("p_discharge_max", d.p_discharge_max)?;
                share("soc_init", d.soc_init)?;
                share("soc_return", d.soc_return)?;
                efficiency("eta_charge", d.eta_charge)?;
                efficiency("eta_discharge", d.eta_discharge)?;
                if !d.charging.is_empty() && d.charging.len() < needed {
                    return Err(CoreError::Validation(format!(
                        "charging pattern covers {} steps but the window needs {needed}",
                        d.charging.len()
                    )));
                }
                Ok(())
            }
        }
    }
}

fn series(label: &str, values: &[f64], needed: usize, non_neg: bool) -> CoreResult<()> {
    if values.len() < needed {
        return Err(CoreError::Validation(format!(
            "{label} covers {} steps but the window needs {needed}",
            values.len()
        )));
    }
    if let Some(pos) = values[..needed]
        .iter()
        .position(|v| !v.is_finite() || (non_neg && *v < 0.0))
    {
        return Err(CoreError::Validation(format!(
            "{label} has an invalid value {} at step {pos}",
            values[pos]
        )));
    }
    Ok(())
}

fn non_negative(label: &str, value: f64) -> CoreResult<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(CoreError::Validation(format!(
            "{label} must be finite and non-negative, got {value}"
        )));
    }
    Ok(())
}

fn share(label: &str, value: f64) -> CoreResult<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(CoreError::Validation(format!(
            "{label} must lie in [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn efficiency(label: &str, value: f64) -> CoreResult<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(CoreError::Validation(format!(
            "{label} must lie in (0, 1], got {value}"
        )));
    }
    Ok(())
}
