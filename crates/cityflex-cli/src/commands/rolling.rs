use std::path::Path;

use anyhow::{Context, Result};
use cityflex_algo::{AlgorithmKind, RollingHorizon, SimulationReport};
use serde::Serialize;
use tracing::info;

use cityflex_cli::OutputFormat;

use crate::commands::output::{print_json, print_table};
use crate::commands::schedule::{rows, EntityRow, TABLE_HEADER};

#[derive(Debug, Clone, Serialize)]
struct RollingOutput {
    report: SimulationReport,
    district: EntityRow,
    nodes: Vec<EntityRow>,
}

pub fn handle(
    path: &Path,
    algorithm: Option<AlgorithmKind>,
    step_width: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let mut loaded = cityflex_cli::scenario::load(path)?;
    if let Some(kind) = algorithm {
        loaded.config.kind = kind;
    }
    let kind = loaded.config.kind;
    let mut runner = RollingHorizon::new(loaded.config);
    if let Some(width) = step_width {
        runner = runner.with_step_width(width);
    }
    let district = &mut loaded.district;
    info!(
        algorithm = %kind,
        simu_horizon = district.env().timer.simu_horizon(),
        "rolling horizon simulation"
    );
    let report = runner
        .run(district)
        .with_context(|| format!("{kind} rolling horizon simulation failed"))?;

    let (total, nodes) = rows(district, &report.slot)?;
    let output = RollingOutput {
        report,
        district: total,
        nodes,
    };
    match format {
        OutputFormat::Json => print_json(&output),
        OutputFormat::Table => {
            println!(
                "Algorithm {kind} planned {} window(s), {} step(s) committed to '{}'",
                output.report.windows, output.report.steps, output.report.slot
            );
            let mut table = vec![output.district.table_row()];
            table.extend(output.nodes.iter().map(EntityRow::table_row));
            print_table(TABLE_HEADER, &table)
        }
    }
}
