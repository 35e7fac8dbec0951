//! CLI interface for price-relay
//!
//! Provides subcommands for:
//! - `run`: Start the relay
//! - `status`: Show current state
//! - `config`: Show the effective configuration

mod run;

pub use run::RunArgs;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "price-relay")]
#[command(about = "Real-time crypto price aggregation and broadcast relay")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the relay
    Run(RunArgs),
    /// Show current state
    Status,
    /// Show the effective configuration
    Config,
}
