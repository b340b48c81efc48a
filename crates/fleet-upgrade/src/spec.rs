//! Cluster specification model
//!
//! A [`ClusterSpec`] is the immutable description of what a cluster should
//! look like: one entry per agent pool, each naming its role, desired VM
//! count and target model (image + boot script). Upgrades are computed from
//! the difference between a previous and a requested spec.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use fleet_common::{Error, Result};

/// Role of an agent pool
///
/// The role decides how readiness is judged and which rollout strategy is
/// safe for the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Control-plane VMs hosting etcd and the API server
    Master,
    /// Infrastructure workers (router, registry)
    Infra,
    /// Application workers
    Compute,
}

impl Role {
    /// Order in which roles are rolled out
    pub const ROLLOUT_ORDER: [Role; 3] = [Role::Master, Role::Infra, Role::Compute];

    /// Lowercase name of the role
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Infra => "infra",
            Self::Compute => "compute",
        }
    }

    /// Position of the role in [`Role::ROLLOUT_ORDER`]
    pub fn rank(&self) -> usize {
        match self {
            Self::Master => 0,
            Self::Infra => 1,
            Self::Compute => 2,
        }
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "master" => Ok(Self::Master),
            "infra" => Ok(Self::Infra),
            "compute" => Ok(Self::Compute),
            _ => Err(Error::validation(format!(
                "invalid role: {s}, supported roles: master, infra, compute"
            ))),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// VM image reference
///
/// Either an explicit image `id`, or a marketplace reference built from
/// publisher/offer/sku/version. Mixing the two is rejected.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageReference {
    /// Full resource ID of a custom image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Marketplace publisher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    /// Marketplace offer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<String>,
    /// Marketplace SKU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    /// Image version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl ImageReference {
    /// Reject an explicit image ID combined with a SKU or version
    pub fn validate(&self) -> Result<()> {
        if self.id.is_some() && (self.sku.is_some() || self.version.is_some()) {
            return Err(Error::validation(
                "imageReference.id cannot be used with imageReference.version and imageReference.sku",
            ));
        }
        Ok(())
    }

    /// Whether nothing is set
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
            && self.publisher.is_none()
            && self.offer.is_none()
            && self.sku.is_none()
            && self.version.is_none()
    }
}

/// Boot/configuration script run by the VM extension
///
/// The `hash` is the script's identity: two scripts with equal hashes are
/// the same model. `settings` is the payload pushed to the extension.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootScript {
    /// Content hash identifying the script
    pub hash: String,
    /// Opaque extension settings carrying the script
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Target model of a scale set: what every VM should be running
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetModel {
    /// Image to boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageReference>,
    /// Boot script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<BootScript>,
    /// VM size (SKU name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_size: Option<String>,
}

impl TargetModel {
    /// Whether applying `other` would change what VMs run
    ///
    /// Scripts compare by hash only.
    pub fn differs_from(&self, other: &TargetModel) -> bool {
        self.image != other.image
            || self.script.as_ref().map(|s| &s.hash) != other.script.as_ref().map(|s| &s.hash)
            || self.vm_size != other.vm_size
    }

    /// Whether pushing this model onto a scale set running `current` would
    /// change anything
    ///
    /// Unlike [`differs_from`](Self::differs_from) only the fields this
    /// model sets are compared; an unset field is left as it is by the push.
    pub fn changes(&self, current: &TargetModel) -> bool {
        let image = self
            .image
            .as_ref()
            .filter(|image| !image.is_empty())
            .is_some_and(|image| current.image.as_ref() != Some(image));
        let script = self.script.as_ref().is_some_and(|script| {
            current.script.as_ref().map(|s| &s.hash) != Some(&script.hash)
        });
        let vm_size = self
            .vm_size
            .as_ref()
            .is_some_and(|size| current.vm_size.as_ref() != Some(size));
        image || script || vm_size
    }

    /// Whether the model sets no image, no script and no VM size
    pub fn is_empty(&self) -> bool {
        self.image.as_ref().map_or(true, ImageReference::is_empty)
            && self.script.is_none()
            && self.vm_size.is_none()
    }

    /// Validate the image reference, if any
    pub fn validate(&self) -> Result<()> {
        match &self.image {
            Some(image) => image.validate(),
            None => Ok(()),
        }
    }
}

/// One agent pool, backed by one scale set
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Pool name, unique within the cluster
    pub name: String,
    /// Role of every VM in the pool
    pub role: Role,
    /// Desired number of VMs
    pub count: u32,
    /// What every VM should be running
    #[serde(default)]
    pub model: TargetModel,
}

impl PoolSpec {
    /// Name of the scale set backing this pool
    pub fn scale_set_name(&self) -> String {
        scale_set_name(&self.name)
    }
}

/// Name of the scale set backing a pool
pub fn scale_set_name(pool: &str) -> String {
    format!("ss-{pool}")
}

/// Immutable cluster specification
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster name
    pub name: String,
    /// Resource group holding the scale sets
    pub resource_group: String,
    /// Agent pools
    pub pools: Vec<PoolSpec>,
}

impl ClusterSpec {
    /// Validate the spec structurally
    ///
    /// Requires a name and resource group, unique pool names, exactly one
    /// master pool, a positive count per pool and consistent image references.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::validation_for_field("cluster", "name", "name is required"));
        }
        if self.resource_group.is_empty() {
            return Err(Error::validation_for_field(
                &self.name,
                "resourceGroup",
                "resource group is required",
            ));
        }

        let mut seen = BTreeSet::new();
        for (i, pool) in self.pools.iter().enumerate() {
            if pool.name.is_empty() {
                return Err(Error::validation_for_field(
                    &self.name,
                    format!("pools[{i}].name"),
                    "pool name is required",
                ));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(Error::validation_for_field(
                    &self.name,
                    format!("pools[{i}].name"),
                    format!("duplicate pool name {}", pool.name),
                ));
            }
            if pool.count == 0 {
                return Err(Error::validation_for_field(
                    &self.name,
                    format!("pools[{i}].count"),
                    "replica count needs to be a positive number",
                ));
            }
            pool.model.validate().map_err(|e| {
                Error::validation_for_field(
                    &self.name,
                    format!("pools[{i}].model.image"),
                    e.to_string(),
                )
            })?;
        }

        let masters = self.pools.iter().filter(|p| p.role == Role::Master).count();
        if masters != 1 {
            return Err(Error::validation_for_field(
                &self.name,
                "pools",
                format!("exactly one master pool is required, found {masters}"),
            ));
        }

        Ok(())
    }

    /// Look up a pool by name
    pub fn pool(&self, name: &str) -> Option<&PoolSpec> {
        self.pools.iter().find(|p| p.name == name)
    }

    /// Pools of `role`, sorted by name
    pub fn pools_for(&self, role: Role) -> Vec<&PoolSpec> {
        let mut pools: Vec<&PoolSpec> = self.pools.iter().filter(|p| p.role == role).collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        pools
    }
}
