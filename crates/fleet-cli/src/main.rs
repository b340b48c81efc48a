//! fleet CLI
//!
//! Rolls image, boot-script and VM-count changes out to scale-set backed
//! Kubernetes clusters.

use clap::Parser;

use fleet_cli::{Cli, Result};
use fleet_common::telemetry::{init_tracing, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(TelemetryConfig {
        json: cli.json_logs,
        filter: None,
    })?;
    cli.run().await
}
