//! PlusOne driver
//!
//! Replaces VMs one at a time without ever dropping below the desired
//! count: grow to `desired + 1`, wait for the newcomer, then drain and
//! delete one old VM.

use std::collections::BTreeSet;

use tracing::{debug, info};

use fleet_common::{Error, Result};

use crate::context::UpgradeContext;
use crate::inventory::InstanceSnapshot;
use crate::step::{UpgradeStep, VmStepper};

use super::RolloutTarget;

/// Replace every outdated VM of the scale set
///
/// The surge target is the absolute `desired + 1`, so resuming after a
/// crash that left the scale set grown never adds a second extra VM. New
/// VMs are recognised by not being in the `before` snapshot; ones already
/// waited for are remembered so each is probed once.
pub async fn run_plus_one(ctx: &UpgradeContext, target: &RolloutTarget) -> Result<()> {
    let scale_set = target.scale_set.as_str();
    let stepper = VmStepper::new(ctx, scale_set, target.role, target.drain);
    let surge = target.desired + 1;

    let instances = ctx
        .inventory
        .list(scale_set)
        .await
        .map_err(|e| target.error(UpgradeStep::ListInstances, e))?;
    let candidates = target.candidates(instances);
    let before = InstanceSnapshot::of(&candidates);

    check_surge_headroom(ctx, target).await?;

    info!(
        %scale_set,
        role = %target.role,
        replace = candidates.len(),
        desired = target.desired,
        "starting plus-one rollout"
    );

    let mut tracked: BTreeSet<String> = BTreeSet::new();
    for old in &candidates {
        ctx.check_cancelled(&format!("replacing {scale_set}/{}", old.instance_id))?;

        if current_capacity(ctx, target).await? < surge {
            ctx.set_capacity(scale_set, surge)
                .await
                .map_err(|e| target.error(UpgradeStep::SetCapacity, e))?;
        } else {
            debug!(%scale_set, surge, "scale set already at surge capacity");
        }

        let current = ctx
            .inventory
            .list(scale_set)
            .await
            .map_err(|e| target.error(UpgradeStep::ListInstances, e))?;
        for vm in before.newly_created(&current) {
            if tracked.contains(&vm.instance_id) {
                continue;
            }
            stepper.wait_ready(vm).await?;
            tracked.insert(vm.instance_id.clone());
        }

        stepper.delete(old).await?;
    }

    info!(%scale_set, replaced = candidates.len(), "plus-one rollout finished");
    Ok(())
}

/// Refuse a scale set already holding more than `desired + 1` VMs
///
/// Runs before any mutation, including the model push.
pub async fn check_surge_headroom(ctx: &UpgradeContext, target: &RolloutTarget) -> Result<()> {
    let capacity = current_capacity(ctx, target).await?;
    if capacity > target.desired + 1 {
        return Err(Error::validation_for(
            &target.scale_set,
            format!(
                "capacity {capacity} exceeds desired count {} plus one, refusing to grow further",
                target.desired
            ),
        ));
    }
    Ok(())
}

async fn current_capacity(ctx: &UpgradeContext, target: &RolloutTarget) -> Result<u32> {
    ctx.cloud
        .get(&target.scale_set)
        .await
        .map(|ss| ss.capacity)
        .map_err(|e| target.error(UpgradeStep::ListInstances, e))
}
