use anyhow::Result;
use clap::Parser;
use cityflex_cli::{Cli, Commands};
use tracing_subscriber::FmtSubscriber;

mod commands;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &cli.command {
        Commands::Validate { scenario } => commands::validate::handle(scenario),
        Commands::Schedule {
            scenario,
            algorithm,
            format,
            out,
        } => commands::schedule::handle(scenario, *algorithm, *format, out.as_ref()),
        Commands::Simulate {
            scenario,
            algorithm,
            format,
        } => commands::simulate::handle(scenario, *algorithm, *format),
        Commands::Rolling {
            scenario,
            algorithm,
            step_width,
            format,
        } => commands::rolling::handle(scenario, *algorithm, *step_width, *format),
    }
}
