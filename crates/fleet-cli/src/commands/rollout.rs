//! Rollout command
//!
//! Upgrades one scale set without a cluster specification. With no image
//! and no script the VMs are only reimaged (`--in-place`) or replaced.

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use fleet_common::kube_utils::deterministic_hash;
use fleet_upgrade::{BootScript, ImageReference, Role, RolloutOptions, TargetModel};

use super::{build_upgrader, read_file, ClientArgs};
use crate::Result;

#[derive(Args, Debug)]
pub struct RolloutArgs {
    /// Scale set to upgrade
    #[arg(long)]
    pub scale_set: String,

    /// Role of the scale set's VMs: master, infra or compute
    #[arg(long)]
    pub role: Role,

    /// Resource group holding the scale set
    #[arg(long, env = "AZURE_RESOURCE_GROUP")]
    pub resource_group: String,

    /// Desired VM count
    #[arg(long)]
    pub count: u32,

    /// Custom image resource ID
    #[arg(long, conflicts_with_all = ["image_sku", "image_version"])]
    pub image_id: Option<String>,

    /// Marketplace image publisher
    #[arg(long)]
    pub image_publisher: Option<String>,

    /// Marketplace image offer
    #[arg(long)]
    pub image_offer: Option<String>,

    /// Marketplace image SKU
    #[arg(long)]
    pub image_sku: Option<String>,

    /// Marketplace image version
    #[arg(long)]
    pub image_version: Option<String>,

    /// JSON file with the boot extension settings
    #[arg(long)]
    pub script_file: Option<PathBuf>,

    /// VM size
    #[arg(long)]
    pub vm_size: Option<String>,

    /// Drain nodes before disrupting them
    #[arg(long)]
    pub drain: bool,

    /// Update VMs in place instead of replacing them
    #[arg(long)]
    pub in_place: bool,

    #[command(flatten)]
    pub client: ClientArgs,
}

impl RolloutArgs {
    fn image(&self) -> Option<ImageReference> {
        let image = ImageReference {
            id: self.image_id.clone(),
            publisher: self.image_publisher.clone(),
            offer: self.image_offer.clone(),
            sku: self.image_sku.clone(),
            version: self.image_version.clone(),
        };
        (!image.is_empty()).then_some(image)
    }

    fn options(&self) -> RolloutOptions {
        RolloutOptions {
            drain: self.drain,
            in_place: self.in_place,
            count: self.count,
        }
    }
}

/// Boot script from its settings JSON; the hash of the raw file is its identity
pub fn boot_script(content: &str) -> Result<BootScript> {
    Ok(BootScript {
        hash: deterministic_hash(content),
        settings: serde_json::from_str(content)?,
    })
}

/// Target model from the flags, `None` without an image or a script
pub fn target_model(args: &RolloutArgs) -> Result<Option<TargetModel>> {
    let script = match &args.script_file {
        Some(path) => Some(boot_script(&read_file(path)?)?),
        None => None,
    };
    let model = TargetModel {
        image: args.image(),
        script,
        vm_size: args.vm_size.clone(),
    };
    Ok((!model.is_empty()).then_some(model))
}

pub async fn run(args: RolloutArgs) -> Result<()> {
    let model = target_model(&args)?;
    let upgrader = build_upgrader(&args.resource_group, &args.client).await?;

    let strategy = upgrader
        .rollout(&args.scale_set, args.role, model.as_ref(), args.options())
        .await?;

    info!(scale_set = %args.scale_set, ?strategy, "scale set rolled out");
    println!("Scale set {} rolled out ({strategy:?})", args.scale_set);
    Ok(())
}
