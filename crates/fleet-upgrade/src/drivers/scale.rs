//! PureScale driver

use tracing::info;

use fleet_common::Result;

use crate::context::UpgradeContext;
use crate::inventory::InstanceSnapshot;
use crate::step::{UpgradeStep, VmStepper};

use super::RolloutTarget;

/// Converge the VM count without touching any model
///
/// Surplus VMs are drained and deleted highest instance ID first. Missing
/// VMs are requested from the provider and each new one is waited for.
pub async fn run_pure_scale(ctx: &UpgradeContext, target: &RolloutTarget) -> Result<()> {
    let scale_set = target.scale_set.as_str();
    let instances = ctx
        .inventory
        .list(scale_set)
        .await
        .map_err(|e| target.error(UpgradeStep::ListInstances, e))?;
    let count = instances.len() as u32;

    if count > target.desired {
        let stepper = VmStepper::new(ctx, scale_set, target.role, target.drain);
        let surplus = &instances[target.desired as usize..];
        info!(%scale_set, from = count, to = target.desired, "scaling down");
        for vm in surplus.iter().rev() {
            ctx.check_cancelled(&format!("scaling down {scale_set}"))?;
            stepper.delete(vm).await?;
        }
        return Ok(());
    }

    let capacity = ctx
        .cloud
        .get(scale_set)
        .await
        .map_err(|e| target.error(UpgradeStep::ListInstances, e))?
        .capacity;
    if count == target.desired && capacity == target.desired {
        return Ok(());
    }

    info!(%scale_set, from = count, to = target.desired, "scaling up");
    let before = InstanceSnapshot::of(&instances);
    ctx.set_capacity(scale_set, target.desired)
        .await
        .map_err(|e| target.error(UpgradeStep::SetCapacity, e))?;

    let stepper = VmStepper::new(ctx, scale_set, target.role, target.drain);
    let current = ctx
        .inventory
        .list(scale_set)
        .await
        .map_err(|e| target.error(UpgradeStep::ListInstances, e))?;
    for vm in before.newly_created(&current) {
        stepper.wait_ready(vm).await?;
    }
    Ok(())
}
