//! Change classification and strategy selection
//!
//! The set of roles and strategies is closed, so the choice is a plain
//! table over `(ChangeKind, Role)` resolved once per invocation.

use std::collections::BTreeSet;

use fleet_common::{Error, Result};

use crate::spec::{ClusterSpec, PoolSpec, Role, TargetModel};

/// What kind of change a requested spec represents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Only pool counts differ (or nothing does)
    PureScale,
    /// An image, script or other model field differs
    ModelUpdate,
}

/// How a pool is rolled out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Update each VM in place, one at a time
    InPlace,
    /// Add one replacement VM, then remove one old VM, one at a time
    PlusOne,
    /// Reimage each VM in place without changing its model
    ReimageOnly,
    /// Only converge the VM count
    PureScale,
}

/// Strategy for a pool in a full cluster upgrade
pub fn strategy_for(kind: ChangeKind, role: Role) -> Strategy {
    match (kind, role) {
        (ChangeKind::PureScale, _) => Strategy::PureScale,
        (ChangeKind::ModelUpdate, Role::Master) => Strategy::InPlace,
        (ChangeKind::ModelUpdate, Role::Infra | Role::Compute) => Strategy::PlusOne,
    }
}

/// Strategy for a standalone scale-set rollout
///
/// `in_place = false` always means PlusOne. In place with no target model
/// means the VMs are only reimaged.
pub fn rollout_strategy(in_place: bool, has_model: bool) -> Strategy {
    match (in_place, has_model) {
        (false, _) => Strategy::PlusOne,
        (true, true) => Strategy::InPlace,
        (true, false) => Strategy::ReimageOnly,
    }
}

/// Classify the difference between two cluster specs
///
/// Both specs must describe the same cluster with the same pools; adding or
/// removing pools is provisioning, not an upgrade.
pub fn classify(previous: &ClusterSpec, requested: &ClusterSpec) -> Result<ChangeKind> {
    if previous.name != requested.name || previous.resource_group != requested.resource_group {
        return Err(Error::validation_for(
            &requested.name,
            "cluster name and resource group cannot change during an upgrade",
        ));
    }

    let pool_keys = |spec: &ClusterSpec| -> BTreeSet<(String, Role)> {
        spec.pools.iter().map(|p| (p.name.clone(), p.role)).collect()
    };
    if pool_keys(previous) != pool_keys(requested) {
        return Err(Error::validation_for_field(
            &requested.name,
            "pools",
            "pool names and roles must match the previous spec",
        ));
    }

    let model_changed = requested.pools.iter().any(|req| {
        previous
            .pool(&req.name)
            .is_some_and(|prev| prev.model.differs_from(&req.model))
    });

    Ok(if model_changed {
        ChangeKind::ModelUpdate
    } else {
        ChangeKind::PureScale
    })
}

/// Per-pool rollout plan
#[derive(Clone, Debug, PartialEq)]
pub struct UpgradePlan {
    /// Pool name
    pub pool: String,
    /// Scale set backing the pool
    pub scale_set: String,
    /// Role of the pool
    pub role: Role,
    /// Strategy to run
    pub strategy: Strategy,
    /// Desired VM count
    pub target_capacity: u32,
    /// Model to roll out; `None` when the pool's model is unchanged
    pub target_model: Option<TargetModel>,
}

/// Build the ordered plan: master, infra, compute, then by pool name
pub fn build_plan(
    previous: &ClusterSpec,
    requested: &ClusterSpec,
    kind: ChangeKind,
) -> Vec<UpgradePlan> {
    Role::ROLLOUT_ORDER
        .iter()
        .flat_map(|role| requested.pools_for(*role))
        .map(|req| plan_pool(previous.pool(&req.name), req, kind))
        .collect()
}

fn plan_pool(previous: Option<&PoolSpec>, requested: &PoolSpec, kind: ChangeKind) -> UpgradePlan {
    let model_changed = previous.map_or(true, |prev| prev.model.differs_from(&requested.model));
    UpgradePlan {
        pool: requested.name.clone(),
        scale_set: requested.scale_set_name(),
        role: requested.role,
        strategy: strategy_for(kind, requested.role),
        target_capacity: requested.count,
        target_model: (kind == ChangeKind::ModelUpdate && model_changed)
            .then(|| requested.model.clone()),
    }
}
