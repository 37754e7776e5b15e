pub mod cli;
pub mod scenario;

pub use cli::{Cli, Commands, OutputFormat};
pub use scenario::{LoadedScenario, Scenario};
