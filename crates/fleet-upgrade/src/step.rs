//! Per-VM upgrade steps
//!
//! Each primitive moves one VM through a fixed sequence of phases:
//!
//! ```text
//! in place:  Ready -> Draining -> Deallocating -> ModelUpdating -> Reimaging
//!                  -> Starting -> WaitingReady -> Ready
//! reimage:   Ready -> Draining -> Reimaging -> WaitingReady -> Ready
//! delete:    Ready -> Draining -> Deleting -> Deleted
//! ```
//!
//! Any failure stops the sequence and is returned wrapped in
//! [`Error::Rollout`] naming the role, VM and step.

use std::future::Future;

use tracing::info;

use fleet_common::{Error, Result};

use crate::cloud::{Operation, VmInstance};
use crate::context::UpgradeContext;
use crate::drain::DrainSession;
use crate::progress::ProgressEvent;
use crate::spec::Role;

/// Lifecycle phase of a VM during a rollout
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VmPhase {
    /// Serving
    Ready,
    /// Pods being evicted
    Draining,
    /// Powering off
    Deallocating,
    /// Taking the scale-set model
    ModelUpdating,
    /// OS disk being rebuilt
    Reimaging,
    /// Powering on
    Starting,
    /// Waiting for the readiness probe
    WaitingReady,
    /// Being deleted
    Deleting,
    /// Gone
    Deleted,
}

/// Named step of a rollout, reported in errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpgradeStep {
    /// Cordon and evict
    Drain,
    /// Power off
    Deallocate,
    /// Apply scale-set model to the VM
    UpdateInstanceModel,
    /// Rebuild OS disk
    Reimage,
    /// Power on
    Start,
    /// Readiness wait
    WaitForReady,
    /// Mark schedulable again
    Uncordon,
    /// Remove the Node object
    DeleteNode,
    /// Delete the VM
    Delete,
    /// Read the scale set or its VMs
    ListInstances,
    /// Replace the scale-set model
    UpdateModel,
    /// Change scale-set capacity
    SetCapacity,
}

impl std::fmt::Display for UpgradeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Drain => "Drain",
            Self::Deallocate => "Deallocate",
            Self::UpdateInstanceModel => "UpdateInstanceModel",
            Self::Reimage => "Reimage",
            Self::Start => "Start",
            Self::WaitForReady => "WaitForReady",
            Self::Uncordon => "Uncordon",
            Self::DeleteNode => "DeleteNode",
            Self::Delete => "Delete",
            Self::ListInstances => "ListInstances",
            Self::UpdateModel => "UpdateModel",
            Self::SetCapacity => "SetCapacity",
        };
        f.write_str(name)
    }
}

/// Applies upgrade primitives to VMs of one scale set
pub struct VmStepper<'a> {
    ctx: &'a UpgradeContext,
    scale_set: &'a str,
    role: Role,
    drain: bool,
}

impl<'a> VmStepper<'a> {
    /// Stepper for `scale_set`; `drain = false` skips the drain engine
    pub fn new(ctx: &'a UpgradeContext, scale_set: &'a str, role: Role, drain: bool) -> Self {
        Self {
            ctx,
            scale_set,
            role,
            drain,
        }
    }

    /// Deallocate, update, reimage and restart a VM, then wait for it
    pub async fn update_in_place(&self, vm: &VmInstance) -> Result<()> {
        info!(scale_set = %self.scale_set, instance_id = %vm.instance_id, node = %vm.computer_name, "updating VM in place");
        let drained = self.drain_vm(vm).await?;

        self.phase(vm, VmPhase::Deallocating);
        self.cloud_step(vm, UpgradeStep::Deallocate, self.ctx.cloud.deallocate(self.scale_set, &vm.instance_id))
            .await?;

        self.phase(vm, VmPhase::ModelUpdating);
        self.cloud_step(
            vm,
            UpgradeStep::UpdateInstanceModel,
            self.ctx.cloud.update_instance_model(self.scale_set, &vm.instance_id),
        )
        .await?;

        self.phase(vm, VmPhase::Reimaging);
        self.cloud_step(vm, UpgradeStep::Reimage, self.ctx.cloud.reimage(self.scale_set, &vm.instance_id))
            .await?;

        self.phase(vm, VmPhase::Starting);
        self.cloud_step(vm, UpgradeStep::Start, self.ctx.cloud.start(self.scale_set, &vm.instance_id))
            .await?;

        self.wait_ready(vm).await?;
        self.finish(vm, drained).await
    }

    /// Reimage a VM without changing its model, then wait for it
    pub async fn reimage(&self, vm: &VmInstance) -> Result<()> {
        info!(scale_set = %self.scale_set, instance_id = %vm.instance_id, node = %vm.computer_name, "reimaging VM");
        let drained = self.drain_vm(vm).await?;

        self.phase(vm, VmPhase::Reimaging);
        self.cloud_step(vm, UpgradeStep::Reimage, self.ctx.cloud.reimage(self.scale_set, &vm.instance_id))
            .await?;

        self.wait_ready(vm).await?;
        self.finish(vm, drained).await
    }

    /// Drain a VM, remove its Node object and delete it
    pub async fn delete(&self, vm: &VmInstance) -> Result<()> {
        info!(scale_set = %self.scale_set, instance_id = %vm.instance_id, node = %vm.computer_name, "deleting VM");
        self.drain_vm(vm).await?;

        self.phase(vm, VmPhase::Deleting);
        self.wrap(
            vm,
            UpgradeStep::DeleteNode,
            self.ctx.cluster.delete_node(&vm.computer_name),
        )
        .await?;
        self.cloud_step(vm, UpgradeStep::Delete, self.ctx.cloud.delete(self.scale_set, &vm.instance_id))
            .await?;
        self.phase(vm, VmPhase::Deleted);
        Ok(())
    }

    /// Wait for a VM to pass the readiness probe for this role
    pub async fn wait_ready(&self, vm: &VmInstance) -> Result<()> {
        self.phase(vm, VmPhase::WaitingReady);
        self.ctx.emit(ProgressEvent::WaitingForReady {
            role: self.role,
            node: vm.computer_name.clone(),
        });
        self.wrap(
            vm,
            UpgradeStep::WaitForReady,
            self.ctx
                .prober
                .wait_for_ready(self.role, &vm.computer_name, &self.ctx.cancel),
        )
        .await
    }

    /// Drain the VM when draining is enabled; returns whether it was cordoned
    async fn drain_vm(&self, vm: &VmInstance) -> Result<bool> {
        if !self.drain {
            return Ok(false);
        }
        self.phase(vm, VmPhase::Draining);
        let session = self
            .wrap(
                vm,
                UpgradeStep::Drain,
                self.ctx.drainer.drain(&vm.computer_name, &self.ctx.cancel),
            )
            .await?;
        self.ensure_drained(vm, &session)?;
        Ok(session.cordoned)
    }

    /// A VM is only mutated once no pod is left behind
    fn ensure_drained(&self, vm: &VmInstance, session: &DrainSession) -> Result<()> {
        if session.is_complete() {
            return Ok(());
        }
        Err(self.error(
            vm,
            UpgradeStep::Drain,
            Error::drain(&session.node, "pods still pending after drain"),
        ))
    }

    async fn finish(&self, vm: &VmInstance, drained: bool) -> Result<()> {
        if drained {
            self.wrap(
                vm,
                UpgradeStep::Uncordon,
                self.ctx.drainer.uncordon(&vm.computer_name),
            )
            .await?;
        }
        self.phase(vm, VmPhase::Ready);
        Ok(())
    }

    async fn cloud_step(
        &self,
        vm: &VmInstance,
        step: UpgradeStep,
        call: impl Future<Output = Result<Operation>>,
    ) -> Result<()> {
        self.wrap(vm, step, async {
            self.ctx.check_cancelled(&format!("starting {step}"))?;
            let operation = call.await?;
            self.ctx.wait(operation).await
        })
        .await
    }

    async fn wrap<T>(
        &self,
        vm: &VmInstance,
        step: UpgradeStep,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        fut.await.map_err(|e| self.error(vm, step, e))
    }

    fn error(&self, vm: &VmInstance, step: UpgradeStep, source: Error) -> Error {
        Error::rollout(
            self.role.as_str(),
            format!("{}/{} ({})", self.scale_set, vm.instance_id, vm.computer_name),
            step.to_string(),
            source,
        )
    }

    fn phase(&self, vm: &VmInstance, phase: VmPhase) {
        self.ctx.emit(ProgressEvent::VmPhase {
            scale_set: self.scale_set.to_string(),
            instance_id: vm.instance_id.clone(),
            phase,
        });
    }
}
