//! Strategy drivers
//!
//! Each strategy has a dedicated driver that walks one scale set to its
//! target. Drivers are sequential: one VM at a time, in the order the
//! strategy requires.

mod in_place;
mod plus_one;
mod scale;

pub use in_place::{order_unready_first, run_in_place, run_reimage_only};
pub use plus_one::{check_surge_headroom, run_plus_one};
pub use scale::run_pure_scale;

use fleet_common::{Error, Result};

use crate::cloud::VmInstance;
use crate::context::UpgradeContext;
use crate::plan::Strategy;
use crate::spec::Role;
use crate::step::UpgradeStep;

/// The scale set a driver works on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RolloutTarget {
    /// Scale set name
    pub scale_set: String,
    /// Role of its VMs
    pub role: Role,
    /// Desired VM count
    pub desired: u32,
    /// Whether to drain nodes before disrupting them
    pub drain: bool,
    /// Whether a new model was pushed; if not, every VM is processed
    pub has_model: bool,
}

impl RolloutTarget {
    /// Wrap a scale-set level failure with the rollout position
    pub fn error(&self, step: UpgradeStep, source: Error) -> Error {
        Error::rollout(self.role.as_str(), &self.scale_set, step.to_string(), source)
    }

    /// VMs that still have to be replaced
    ///
    /// With a new model only VMs that have not yet applied it; otherwise all.
    /// Replacements are created on the latest model, so the flag is final
    /// here. In-place updates set it before the VM is back and also probe
    /// readiness.
    pub fn candidates(&self, instances: Vec<VmInstance>) -> Vec<VmInstance> {
        if !self.has_model {
            return instances;
        }
        instances
            .into_iter()
            .filter(|vm| !vm.latest_model_applied)
            .collect()
    }
}

/// Run the driver for `strategy`
pub async fn run(ctx: &UpgradeContext, strategy: Strategy, target: &RolloutTarget) -> Result<()> {
    match strategy {
        Strategy::InPlace => run_in_place(ctx, target).await,
        Strategy::PlusOne => run_plus_one(ctx, target).await,
        Strategy::ReimageOnly => run_reimage_only(ctx, target).await,
        Strategy::PureScale => run_pure_scale(ctx, target).await,
    }
}
