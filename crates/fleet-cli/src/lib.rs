//! fleet CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// fleet - rolling upgrades for scale-set backed Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upgrade a cluster from its previous to its requested specification
    Upgrade(commands::upgrade::UpgradeArgs),
    /// Roll a new model out to a single scale set
    Rollout(commands::rollout::RolloutArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Upgrade(args) => commands::upgrade::run(args).await,
            Commands::Rollout(args) => commands::rollout::run(args).await,
        }
    }
}
