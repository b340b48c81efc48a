//! Shared collaborators for one orchestrator invocation

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use fleet_common::{Error, Result};

use crate::cloud::{wait_for_operation, Operation, ScaleSetClient};
use crate::cluster::ClusterClient;
use crate::config::UpgradeConfig;
use crate::drain::Drainer;
use crate::inventory::Inventory;
use crate::progress::{ProgressEvent, SharedProgress};
use crate::ready::ReadinessProber;

/// Everything a driver needs, built once per invocation
#[derive(Clone)]
pub struct UpgradeContext {
    /// Scale-set control plane
    pub cloud: Arc<dyn ScaleSetClient>,
    /// Cluster API
    pub cluster: Arc<dyn ClusterClient>,
    /// Scale-set inventory
    pub inventory: Inventory,
    /// Drain engine
    pub drainer: Drainer,
    /// Readiness prober
    pub prober: ReadinessProber,
    /// Timing configuration
    pub config: UpgradeConfig,
    /// Progress sink
    pub progress: SharedProgress,
    /// Caller cancellation
    pub cancel: CancellationToken,
}

impl UpgradeContext {
    /// Wire up the collaborators
    pub fn new(
        cloud: Arc<dyn ScaleSetClient>,
        cluster: Arc<dyn ClusterClient>,
        config: UpgradeConfig,
        progress: SharedProgress,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inventory: Inventory::new(cloud.clone()),
            drainer: Drainer::new(cluster.clone(), config.drain.clone(), progress.clone()),
            prober: ReadinessProber::new(cluster.clone(), config.readiness.clone()),
            cloud,
            cluster,
            config,
            progress,
            cancel,
        }
    }

    /// Wait for a long-running cloud operation
    pub async fn wait(&self, operation: Operation) -> Result<()> {
        wait_for_operation(
            self.cloud.as_ref(),
            &operation,
            &self.config.operations,
            &self.cancel,
        )
        .await
    }

    /// Set capacity and wait for the provider to converge
    pub async fn set_capacity(&self, scale_set: &str, capacity: u32) -> Result<()> {
        let operation = self.cloud.set_capacity(scale_set, capacity).await?;
        self.wait(operation).await?;
        self.emit(ProgressEvent::CapacityChanged {
            scale_set: scale_set.to_string(),
            capacity,
        });
        Ok(())
    }

    /// Fail with [`Error::Cancelled`] if the caller has cancelled
    pub fn check_cancelled(&self, operation: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }
        Ok(())
    }

    /// Publish a progress event
    pub fn emit(&self, event: ProgressEvent) {
        self.progress.publish(event);
    }
}
