use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cityflex_algo::{AlgorithmKind, RunReport};
use cityflex_core::metrics::{autarky, costs, peak_to_average_ratio};
use cityflex_core::{CityDistrict, Device, Entity, EntityId};
use serde::Serialize;
use tracing::info;

use cityflex_cli::OutputFormat;

use crate::commands::output::{print_json, print_table, series, write_json};

/// Electrical trajectory of one entity with its headline metrics.
#[derive(Debug, Clone, Serialize)]
pub struct EntityRow {
    pub name: String,
    pub id: EntityId,
    pub p_el: Vec<f64>,
    pub cost: f64,
    pub peak_to_average: f64,
    /// Share of consumption covered by generation at or below the entity.
    pub autarky: f64,
}

impl EntityRow {
    pub fn from_slot(district: &CityDistrict, entity: &Entity, slot: &str) -> Result<Self> {
        let schedule = district.store().require(entity.id(), slot)?;
        let p_el = schedule
            .p_el()
            .map(<[f64]>::to_vec)
            .with_context(|| format!("'{}' has no electrical schedule in '{slot}'", entity.name()))?;
        let env = district.env();
        // timelines may run past the optimisation window
        let from = env.timer.start;
        let energy = env.prices.energy.get(from..).unwrap_or_default();
        let feed_in = env.prices.feed_in.as_ref().and_then(|f| f.get(from..));
        let generation = generation(district, entity, slot, p_el.len())?;
        Ok(EntityRow {
            name: entity.name().to_string(),
            id: entity.id(),
            cost: costs(&p_el, energy, feed_in, env.timer.time_slot()),
            peak_to_average: peak_to_average_ratio(&p_el),
            autarky: autarky(&generation, &p_el),
            p_el,
        })
    }

    pub fn table_row(&self) -> String {
        format!(
            "{}\t{}\t{:.2}\t{:.3}\t{:.3}\t{}",
            self.name,
            self.id,
            self.cost,
            self.peak_to_average,
            self.autarky,
            series(&self.p_el)
        )
    }
}

/// Summed output of the generators at or below `entity`; empty without any.
fn generation(
    district: &CityDistrict,
    entity: &Entity,
    slot: &str,
    steps: usize,
) -> Result<Vec<f64>> {
    let mut total = Vec::new();
    for (device, kind) in entity.devices() {
        if !matches!(
            kind,
            Device::Photovoltaic(_) | Device::WindEnergyConverter(_) | Device::CombinedHeatPower(_)
        ) {
            continue;
        }
        let schedule = district.store().require(device.id(), slot)?;
        let p_el = schedule.p_el().unwrap_or_default();
        total.resize(steps, 0.0);
        for (sum, p) in total.iter_mut().zip(p_el) {
            *sum += p;
        }
    }
    Ok(total)
}

pub const TABLE_HEADER: &str = "NAME\tID\tCOST\tPAR\tAUTARKY\tP_EL";

#[derive(Debug, Clone, Serialize)]
struct ScheduleOutput {
    report: RunReport,
    district: EntityRow,
    nodes: Vec<EntityRow>,
}

/// District row followed by one row per building and district generator.
pub fn rows(district: &CityDistrict, slot: &str) -> Result<(EntityRow, Vec<EntityRow>)> {
    let total = EntityRow::from_slot(district, district.root(), slot)?;
    let nodes = district
        .nodes()
        .iter()
        .map(|node| EntityRow::from_slot(district, node, slot))
        .collect::<Result<Vec<_>>>()?;
    Ok((total, nodes))
}

pub fn summary(report: &RunReport) -> String {
    format!(
        "Algorithm {} finished {:?} after {} iteration(s) in {} ms, district objective {:.3}",
        report.algorithm,
        report.status,
        report.iterations,
        report.solve_time_ms,
        report.district_objective
    )
}

pub fn handle(
    path: &Path,
    algorithm: Option<AlgorithmKind>,
    format: OutputFormat,
    out: Option<&PathBuf>,
) -> Result<()> {
    let mut loaded = cityflex_cli::scenario::load(path)?;
    if let Some(kind) = algorithm {
        loaded.config.kind = kind;
    }
    info!(algorithm = %loaded.config.kind, scenario = %path.display(), "scheduling district");
    let report = cityflex_algo::run(&loaded.config, &loaded.district)
        .with_context(|| format!("{} scheduling failed", loaded.config.kind))?;

    let (district, nodes) = rows(&loaded.district, cityflex_core::CURRENT)?;
    let output = ScheduleOutput {
        report,
        district,
        nodes,
    };
    if let Some(out) = out {
        write_json(&output, out)?;
        info!(path = %out.display(), "report written");
    }
    match format {
        OutputFormat::Json => print_json(&output),
        OutputFormat::Table => {
            println!("{}", summary(&output.report));
            let mut table = vec![output.district.table_row()];
            table.extend(output.nodes.iter().map(EntityRow::table_row));
            print_table(TABLE_HEADER, &table)
        }
    }
}
