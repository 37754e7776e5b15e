use std::path::Path;

use anyhow::Result;
use cityflex_core::EntityKind;

use crate::commands::output::print_table;

pub fn handle(path: &Path) -> Result<()> {
    let loaded = cityflex_cli::scenario::load(path)?;
    let district = &loaded.district;
    let timer = &district.env().timer;

    let rows: Vec<String> = district
        .buildings()
        .iter()
        .map(|b| {
            let apartments = b
                .children()
                .iter()
                .filter(|c| matches!(c.kind(), EntityKind::Apartment))
                .count();
            let tags: Vec<&str> = b.devices().map(|(_, d)| d.tag()).collect();
            format!(
                "{}\t{}\t{}\t{}\t{}",
                b.name(),
                b.id(),
                b.objective().unwrap_or_default(),
                apartments,
                tags.join(",")
            )
        })
        .collect();
    print_table("BUILDING\tID\tOBJECTIVE\tAPARTMENTS\tDEVICES", &rows)?;
    for generator in district.generators() {
        let tag = generator.as_device().map(|d| d.tag()).unwrap_or_default();
        println!("District generator {} ({tag}, {})", generator.name(), generator.id());
    }
    println!(
        "Scenario OK: {} buildings, {} district generator(s), {} steps of {} s, \
         {} simulated, district objective {}, algorithm {}",
        district.buildings().len(),
        district.generators().len(),
        timer.op_horizon,
        timer.step_size,
        timer.simu_horizon(),
        district.objective(),
        loaded.config.kind
    );
    Ok(())
}
