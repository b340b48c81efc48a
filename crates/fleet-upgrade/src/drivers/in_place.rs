//! InPlace and ReimageOnly drivers

use tracing::{info, warn};

use fleet_common::Result;

use crate::cloud::VmInstance;
use crate::context::UpgradeContext;
use crate::spec::Role;
use crate::step::{UpgradeStep, VmStepper};

use super::RolloutTarget;

/// Update every outdated VM in place, unready VMs first
///
/// The first failure aborts the remaining VMs.
pub async fn run_in_place(ctx: &UpgradeContext, target: &RolloutTarget) -> Result<()> {
    let stepper = VmStepper::new(ctx, &target.scale_set, target.role, target.drain);
    let vms = ordered_candidates(ctx, target).await?;

    info!(scale_set = %target.scale_set, role = %target.role, vms = vms.len(), "starting in-place rollout");
    for vm in &vms {
        ctx.check_cancelled(&format!("updating {}/{}", target.scale_set, vm.instance_id))?;
        stepper.update_in_place(vm).await?;
    }
    Ok(())
}

/// Reimage every VM in place, unready VMs first
pub async fn run_reimage_only(ctx: &UpgradeContext, target: &RolloutTarget) -> Result<()> {
    let stepper = VmStepper::new(ctx, &target.scale_set, target.role, target.drain);
    let vms = ordered_candidates(ctx, target).await?;

    info!(scale_set = %target.scale_set, role = %target.role, vms = vms.len(), "starting reimage rollout");
    for vm in &vms {
        ctx.check_cancelled(&format!("reimaging {}/{}", target.scale_set, vm.instance_id))?;
        stepper.reimage(vm).await?;
    }
    Ok(())
}

/// VMs still to process, unready ones first
///
/// A VM only counts as done once it runs the latest model and passes the
/// readiness probe: an earlier run may have stopped anywhere between the
/// instance model update and the readiness wait. Done VMs still cordoned by
/// such a run are uncordoned.
async fn ordered_candidates(ctx: &UpgradeContext, target: &RolloutTarget) -> Result<Vec<VmInstance>> {
    let instances = ctx
        .inventory
        .list(&target.scale_set)
        .await
        .map_err(|e| target.error(UpgradeStep::ListInstances, e))?;
    let (mut pending, ready) = split_by_readiness(ctx, target.role, instances)
        .await
        .map_err(|e| target.error(UpgradeStep::WaitForReady, e))?;

    for vm in ready {
        if target.has_model && vm.latest_model_applied {
            if target.drain {
                ctx.drainer
                    .release_stale_cordon(&vm.computer_name)
                    .await
                    .map_err(|e| target.error(UpgradeStep::Uncordon, e))?;
            }
        } else {
            pending.push(vm);
        }
    }
    Ok(pending)
}

/// Sort VMs by hostname, then move not-ready ones to the front
pub async fn order_unready_first(
    ctx: &UpgradeContext,
    role: Role,
    vms: Vec<VmInstance>,
) -> Result<Vec<VmInstance>> {
    let (mut unready, ready) = split_by_readiness(ctx, role, vms).await?;
    unready.extend(ready);
    Ok(unready)
}

/// Unready and ready VMs, each in hostname order
///
/// More than one unready master means quorum may already be degraded; that
/// is logged but does not stop the rollout.
async fn split_by_readiness(
    ctx: &UpgradeContext,
    role: Role,
    mut vms: Vec<VmInstance>,
) -> Result<(Vec<VmInstance>, Vec<VmInstance>)> {
    vms.sort_by(|a, b| a.computer_name.cmp(&b.computer_name));

    let mut unready = Vec::new();
    let mut ready = Vec::new();
    for vm in vms {
        if ctx.prober.is_ready(role, &vm.computer_name).await? {
            ready.push(vm);
        } else {
            unready.push(vm);
        }
    }

    if role == Role::Master && unready.len() > 1 {
        let nodes: Vec<&str> = unready.iter().map(|vm| vm.computer_name.as_str()).collect();
        warn!(?nodes, "more than one master is not ready before the rollout starts");
    }
    Ok((unready, ready))
}
