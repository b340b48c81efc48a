//! Scale-set inventory and instance snapshots
//!
//! Nothing about a rollout is persisted. What makes re-running it safe is
//! that every driver re-reads the scale set and captures an immutable
//! [`InstanceSnapshot`] before changing capacity: a VM in the snapshot is
//! never mistaken for one the rollout created.

use std::collections::BTreeSet;
use std::sync::Arc;

use fleet_common::Result;

use crate::cloud::{instance_sort_key, ScaleSetClient, VmInstance};

/// Immutable set of instance IDs captured at one point in time
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceSnapshot {
    ids: BTreeSet<String>,
}

impl InstanceSnapshot {
    /// Snapshot the given instances
    pub fn of<'a>(instances: impl IntoIterator<Item = &'a VmInstance>) -> Self {
        Self {
            ids: instances
                .into_iter()
                .map(|vm| vm.instance_id.clone())
                .collect(),
        }
    }

    /// Whether the instance existed when the snapshot was taken
    pub fn contains(&self, instance_id: &str) -> bool {
        self.ids.contains(instance_id)
    }

    /// Number of instances in the snapshot
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Instances of `current` that were not part of the snapshot
    pub fn newly_created<'a>(&self, current: &'a [VmInstance]) -> Vec<&'a VmInstance> {
        current
            .iter()
            .filter(|vm| !self.contains(&vm.instance_id))
            .collect()
    }
}

/// Reads the VMs of a scale set
#[derive(Clone)]
pub struct Inventory {
    cloud: Arc<dyn ScaleSetClient>,
}

impl Inventory {
    /// Create an inventory over a scale-set client
    pub fn new(cloud: Arc<dyn ScaleSetClient>) -> Self {
        Self { cloud }
    }

    /// Current instances, ordered by numeric instance ID
    pub async fn list(&self, scale_set: &str) -> Result<Vec<VmInstance>> {
        let mut instances = self.cloud.list_instances(scale_set).await?;
        instances.sort_by_key(|vm| instance_sort_key(&vm.instance_id));
        Ok(instances)
    }

    /// Snapshot the current instances
    pub async fn snapshot(&self, scale_set: &str) -> Result<InstanceSnapshot> {
        Ok(InstanceSnapshot::of(&self.list(scale_set).await?))
    }
}
