pub mod commands;
pub mod config;

pub use commands::{print_report, search, SearchArgs, SearchReport};
pub use config::{CliConfig, Overrides};
