//! Scale-set control plane interface
//!
//! The orchestrator never talks to a cloud API directly. Everything it needs
//! from the provider goes through [`ScaleSetClient`]; mutating calls return an
//! [`Operation`] handle that is awaited with [`wait_for_operation`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use fleet_common::kube_utils::poll_until;
use fleet_common::{Error, Result};

use crate::config::OperationConfig;
use crate::spec::TargetModel;

/// Current state of a scale set
#[derive(Clone, Debug, PartialEq)]
pub struct ScaleSet {
    /// Scale set name
    pub name: String,
    /// Current capacity (number of VMs requested from the provider)
    pub capacity: u32,
    /// Model new and updated VMs will get
    pub model: TargetModel,
}

/// One VM of a scale set
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInstance {
    /// Provider-assigned identifier, stable for the life of the VM
    pub instance_id: String,
    /// Hostname, matching the Kubernetes node name
    pub computer_name: String,
    /// Whether the VM runs the scale set's current model
    pub latest_model_applied: bool,
}

/// Handle of a long-running operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    /// Scale set the operation acts on
    pub scale_set: String,
    /// Human-readable description for logs and errors
    pub description: String,
    /// Provider URL to poll; `None` when the call completed synchronously
    pub status_url: Option<String>,
}

impl Operation {
    /// An operation that finished as part of the call
    pub fn completed(scale_set: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            scale_set: scale_set.into(),
            description: description.into(),
            status_url: None,
        }
    }

    /// An operation still running at the provider
    pub fn pending(
        scale_set: impl Into<String>,
        description: impl Into<String>,
        status_url: impl Into<String>,
    ) -> Self {
        Self {
            scale_set: scale_set.into(),
            description: description.into(),
            status_url: Some(status_url.into()),
        }
    }
}

/// Status of a long-running operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    /// Still running
    InProgress,
    /// Finished successfully
    Succeeded,
    /// Finished with the given error
    Failed(String),
}

/// Scale-set control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScaleSetClient: Send + Sync {
    /// Read the scale set
    async fn get(&self, scale_set: &str) -> Result<ScaleSet>;

    /// List the scale set's VMs
    async fn list_instances(&self, scale_set: &str) -> Result<Vec<VmInstance>>;

    /// Replace the scale-set model (image, boot script, size)
    ///
    /// Existing VMs keep their model until updated individually.
    async fn update_model(&self, scale_set: &str, model: &TargetModel) -> Result<Operation>;

    /// Set the absolute capacity
    async fn set_capacity(&self, scale_set: &str, capacity: u32) -> Result<Operation>;

    /// Apply the scale-set model to one VM
    async fn update_instance_model(&self, scale_set: &str, instance_id: &str)
        -> Result<Operation>;

    /// Reimage one VM's OS disk
    async fn reimage(&self, scale_set: &str, instance_id: &str) -> Result<Operation>;

    /// Power off and release one VM
    async fn deallocate(&self, scale_set: &str, instance_id: &str) -> Result<Operation>;

    /// Start one VM
    async fn start(&self, scale_set: &str, instance_id: &str) -> Result<Operation>;

    /// Delete one VM, reducing capacity by one
    async fn delete(&self, scale_set: &str, instance_id: &str) -> Result<Operation>;

    /// Current status of a pending operation
    async fn operation_status(&self, operation: &Operation) -> Result<OperationStatus>;
}

/// Wait for `operation` to finish
///
/// Polling hiccups are retried; a failed operation is a non-retryable
/// cloud error and expiry is a timeout.
pub async fn wait_for_operation(
    client: &dyn ScaleSetClient,
    operation: &Operation,
    config: &OperationConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    if operation.status_url.is_none() {
        return Ok(());
    }
    debug!(scale_set = %operation.scale_set, operation = %operation.description, "waiting for operation");

    poll_until(
        config.timeout(),
        config.poll_interval(),
        format!("{} on {}", operation.description, operation.scale_set),
        cancel,
        move || async move {
            match client.operation_status(operation).await? {
                OperationStatus::InProgress => Ok(false),
                OperationStatus::Succeeded => Ok(true),
                OperationStatus::Failed(message) => Err(Error::cloud_permanent(
                    &operation.scale_set,
                    format!("{} failed: {}", operation.description, message),
                )),
            }
        },
    )
    .await
}

/// Numeric ordering key of an instance ID
///
/// Provider IDs are decimal strings; anything else sorts after them
/// lexicographically.
pub fn instance_sort_key(instance_id: &str) -> (u64, String) {
    match instance_id.parse::<u64>() {
        Ok(n) => (n, String::new()),
        Err(_) => (u64::MAX, instance_id.to_string()),
    }
}
