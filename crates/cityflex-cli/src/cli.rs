use clap::{Parser, Subcommand, ValueEnum};
use cityflex_algo::AlgorithmKind;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cityflex", author, version, about, long_about = None)]
pub struct Cli {
    /// Set the logging level
    #[arg(long, default_value = "info", global = true)]
    pub log_level: tracing::Level,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check a scenario file and summarise its district
    Validate {
        /// Path to the TOML scenario
        scenario: PathBuf,
    },
    /// Plan a district and print the committed schedules
    Schedule {
        /// Path to the TOML scenario
        scenario: PathBuf,
        /// Override the algorithm named in the scenario
        #[arg(short, long, value_parser = parse_algorithm)]
        algorithm: Option<AlgorithmKind>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
        /// Write the JSON report to a file as well
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Plan a district, then re-dispatch it against the scenario's actual values
    Simulate {
        /// Path to the TOML scenario
        scenario: PathBuf,
        /// Override the algorithm named in the scenario
        #[arg(short, long, value_parser = parse_algorithm)]
        algorithm: Option<AlgorithmKind>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Plan with a moving window over the scenario's simulation horizon
    Rolling {
        /// Path to the TOML scenario
        scenario: PathBuf,
        /// Override the algorithm named in the scenario
        #[arg(short, long, value_parser = parse_algorithm)]
        algorithm: Option<AlgorithmKind>,
        /// Steps executed per window [default: the optimisation horizon]
        #[arg(short = 'w', long)]
        step_width: Option<usize>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

fn parse_algorithm(s: &str) -> Result<AlgorithmKind, String> {
    s.parse()
}
