use std::path::Path;

use anyhow::{Context, Result};
use cityflex_algo::{simulate_actual, AlgorithmKind, RunReport};
use cityflex_core::CURRENT;
use serde::Serialize;
use tracing::info;

use cityflex_cli::OutputFormat;

use crate::commands::output::{print_json, print_table, series};
use crate::commands::schedule::{rows, summary, EntityRow};

#[derive(Debug, Clone, Serialize)]
struct Deviation {
    name: String,
    planned: Vec<f64>,
    actual: Vec<f64>,
    /// `actual - planned` per step.
    deviation: Vec<f64>,
    max_abs: f64,
}

impl Deviation {
    fn new(planned: EntityRow, actual: EntityRow) -> Self {
        let deviation: Vec<f64> = actual
            .p_el
            .iter()
            .zip(&planned.p_el)
            .map(|(a, p)| a - p)
            .collect();
        let max_abs = deviation.iter().fold(0.0, |m: f64, d| m.max(d.abs()));
        Deviation {
            name: planned.name,
            planned: planned.p_el,
            actual: actual.p_el,
            deviation,
            max_abs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SimulateOutput {
    report: RunReport,
    slot: String,
    district: Deviation,
    nodes: Vec<Deviation>,
}

pub fn handle(path: &Path, algorithm: Option<AlgorithmKind>, format: OutputFormat) -> Result<()> {
    let mut loaded = cityflex_cli::scenario::load(path)?;
    if let Some(kind) = algorithm {
        loaded.config.kind = kind;
    }
    let district = &loaded.district;
    let report = cityflex_algo::run(&loaded.config, district)
        .with_context(|| format!("{} scheduling failed", loaded.config.kind))?;
    let realised = simulate_actual(district, &loaded.realization, &loaded.config.options.solver)
        .context("re-dispatch against actual values failed")?;
    info!(
        slot = %realised.slot,
        max_deviation = realised.max_deviation,
        "realisation finished"
    );

    let (plan_total, plan_nodes) = rows(district, CURRENT)?;
    let (actual_total, actual_nodes) = rows(district, &realised.slot)?;
    let output = SimulateOutput {
        report,
        slot: realised.slot,
        district: Deviation::new(plan_total, actual_total),
        nodes: plan_nodes
            .into_iter()
            .zip(actual_nodes)
            .map(|(p, a)| Deviation::new(p, a))
            .collect(),
    };

    match format {
        OutputFormat::Json => print_json(&output),
        OutputFormat::Table => {
            println!("{}", summary(&output.report));
            let table: Vec<String> = std::iter::once(&output.district)
                .chain(&output.nodes)
                .map(|d| format!("{}\t{:.3}\t{}", d.name, d.max_abs, series(&d.deviation)))
                .collect();
            print_table("NAME\tMAX_DEVIATION\tDEVIATION", &table)
        }
    }
}
