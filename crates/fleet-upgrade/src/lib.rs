//! Rolling-upgrade orchestrator for Kubernetes clusters backed by cloud
//! VM scale sets
//!
//! Rolls a new image, boot script or VM count out to every pool of a
//! running cluster without dropping below the desired capacity and without
//! losing control-plane quorum. Masters are updated in place one at a time;
//! workers are replaced through a temporary extra VM ("plus one").

#![deny(missing_docs)]

pub mod cloud;
pub mod cluster;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod drain;
pub mod drivers;
pub mod inventory;
pub mod plan;
pub mod progress;
pub mod ready;
pub mod spec;
pub mod step;

#[cfg(test)]
mod fake;

pub use cloud::{Operation, OperationStatus, ScaleSet, ScaleSetClient, VmInstance};
pub use cluster::{ClusterClient, EvictionOutcome, KubeClusterClient};
pub use config::UpgradeConfig;
pub use coordinator::{RolloutOptions, Upgrader};
pub use plan::{ChangeKind, Strategy};
pub use progress::{ProgressEvent, ProgressSink, TracingProgress};
pub use spec::{BootScript, ClusterSpec, ImageReference, PoolSpec, Role, TargetModel};
