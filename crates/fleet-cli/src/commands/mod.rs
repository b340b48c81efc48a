//! CLI commands

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use fleet_azure::{AzureCredentials, AzureScaleSetClient};
use fleet_common::kube_utils::create_client;
use fleet_upgrade::{KubeClusterClient, UpgradeConfig, Upgrader};

use crate::{Error, Result};

pub mod rollout;
pub mod upgrade;

/// Connection and runtime flags shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct ClientArgs {
    /// Path to the cluster kubeconfig (defaults to kube's inference)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// YAML file overriding drain, readiness and operation timings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,
}

/// Read a file, naming it in the error
pub fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and parse a YAML file
pub fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = read_file(path)?;
    serde_yaml::from_str(&content).map_err(|source| Error::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Timing configuration from `--config`, or the defaults
pub fn load_config(path: Option<&Path>) -> Result<UpgradeConfig> {
    match path {
        Some(path) => read_yaml(path),
        None => Ok(UpgradeConfig::default()),
    }
}

/// Token cancelled on Ctrl-C or once `timeout` elapses
pub fn cancellation(timeout: Option<Duration>) -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => warn!("interrupted, cancelling"),
            _ = deadline => warn!("timeout reached, cancelling"),
            _ = trigger.cancelled() => {}
        }
        trigger.cancel();
    });
    token
}

/// Wire an [`Upgrader`] to Azure and the cluster API
pub async fn build_upgrader(resource_group: &str, args: &ClientArgs) -> Result<Upgrader> {
    let config = load_config(args.config.as_deref())?;
    let credentials = AzureCredentials::from_env()?;
    let cloud = AzureScaleSetClient::new(credentials, resource_group)?;
    let client = create_client(args.kubeconfig.as_deref()).await?;

    Ok(Upgrader::new(Arc::new(cloud), Arc::new(KubeClusterClient::new(client)))
        .with_config(config)
        .with_cancellation(cancellation(args.timeout.map(Duration::from_secs))))
}
