//! Upgrade command

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use fleet_upgrade::ClusterSpec;

use super::{build_upgrader, read_yaml, ClientArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct UpgradeArgs {
    /// Cluster specification currently deployed
    #[arg(long)]
    pub previous: PathBuf,

    /// Cluster specification to roll out
    #[arg(long)]
    pub requested: PathBuf,

    #[command(flatten)]
    pub client: ClientArgs,
}

pub async fn run(args: UpgradeArgs) -> Result<()> {
    let previous: ClusterSpec = read_yaml(&args.previous)?;
    let requested: ClusterSpec = read_yaml(&args.requested)?;
    previous.validate()?;
    requested.validate()?;

    let upgrader = build_upgrader(&requested.resource_group, &args.client).await?;
    let kind = upgrader.upgrade(&previous, &requested).await?;

    info!(cluster = %requested.name, ?kind, "cluster upgraded");
    println!("Cluster {} upgraded ({kind:?})", requested.name);
    Ok(())
}
