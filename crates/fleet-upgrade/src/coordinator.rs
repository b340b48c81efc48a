//! Upgrade coordinator
//!
//! Entry points of the orchestrator. [`Upgrader::upgrade`] diffs two cluster
//! specs and walks every pool in role order; [`Upgrader::rollout`] upgrades
//! a single scale set directly.
//!
//! Nothing is persisted: every invocation re-reads the scale sets and the
//! cluster, so an interrupted upgrade is resumed by calling it again with
//! the same arguments.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use fleet_common::{Error, Result};

use crate::cloud::ScaleSetClient;
use crate::cluster::ClusterClient;
use crate::config::UpgradeConfig;
use crate::context::UpgradeContext;
use crate::drivers::{self, RolloutTarget};
use crate::plan::{build_plan, classify, rollout_strategy, ChangeKind, Strategy};
use crate::progress::{ProgressEvent, SharedProgress, TracingProgress};
use crate::spec::{ClusterSpec, Role, TargetModel};
use crate::step::UpgradeStep;

/// Options for a standalone scale-set rollout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolloutOptions {
    /// Drain nodes before disrupting them
    pub drain: bool,
    /// Update VMs in place instead of replacing them
    pub in_place: bool,
    /// Desired VM count of the scale set
    pub count: u32,
}

/// Rolling-upgrade orchestrator
pub struct Upgrader {
    cloud: Arc<dyn ScaleSetClient>,
    cluster: Arc<dyn ClusterClient>,
    config: UpgradeConfig,
    progress: SharedProgress,
    cancel: CancellationToken,
}

impl Upgrader {
    /// Create an upgrader with default configuration
    pub fn new(cloud: Arc<dyn ScaleSetClient>, cluster: Arc<dyn ClusterClient>) -> Self {
        Self {
            cloud,
            cluster,
            config: UpgradeConfig::default(),
            progress: Arc::new(TracingProgress),
            cancel: CancellationToken::new(),
        }
    }

    /// Use the given timing configuration
    pub fn with_config(mut self, config: UpgradeConfig) -> Self {
        self.config = config;
        self
    }

    /// Publish progress to the given sink
    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Abort in-flight work when the token is cancelled
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn context(&self) -> UpgradeContext {
        UpgradeContext::new(
            self.cloud.clone(),
            self.cluster.clone(),
            self.config.clone(),
            self.progress.clone(),
            self.cancel.clone(),
        )
    }

    /// Upgrade the cluster from `previous` to `requested`
    ///
    /// Both specs are validated before anything is touched. Pools are
    /// processed master, infra, compute; the first failure stops the
    /// upgrade without attempting later pools.
    #[instrument(skip_all, fields(cluster = %requested.name))]
    pub async fn upgrade(&self, previous: &ClusterSpec, requested: &ClusterSpec) -> Result<ChangeKind> {
        previous.validate()?;
        requested.validate()?;
        let kind = classify(previous, requested)?;

        let ctx = self.context();
        ctx.emit(ProgressEvent::Classified { kind });
        info!(?kind, "classified requested change");

        for plan in build_plan(previous, requested, kind) {
            ctx.check_cancelled(&format!("starting {}", plan.scale_set))?;
            ctx.emit(ProgressEvent::PoolStarted {
                role: plan.role,
                scale_set: plan.scale_set.clone(),
                strategy: plan.strategy,
            });

            let target = RolloutTarget {
                scale_set: plan.scale_set.clone(),
                role: plan.role,
                desired: plan.target_capacity,
                drain: true,
                has_model: plan.target_model.is_some(),
            };

            // The model driver runs before count reconciliation so a surge VM
            // left by an interrupted PlusOne is reused, not scaled away.
            if let Some(model) = &plan.target_model {
                if plan.strategy == Strategy::PlusOne {
                    drivers::check_surge_headroom(&ctx, &target).await?;
                }
                push_model(&ctx, &target, model).await?;
                if plan.strategy != Strategy::PureScale {
                    drivers::run(&ctx, plan.strategy, &target).await?;
                }
            }
            drivers::run_pure_scale(&ctx, &target).await?;

            ctx.emit(ProgressEvent::PoolCompleted {
                role: plan.role,
                scale_set: plan.scale_set,
            });
        }

        info!(?kind, "upgrade complete");
        Ok(kind)
    }

    /// Upgrade one scale set
    ///
    /// With `options.in_place` VMs are updated in place, or only reimaged
    /// when `model` is absent or empty. Without it every VM is replaced
    /// using the PlusOne strategy.
    #[instrument(skip(self, model))]
    pub async fn rollout(
        &self,
        scale_set: &str,
        role: Role,
        model: Option<&TargetModel>,
        options: RolloutOptions,
    ) -> Result<Strategy> {
        if scale_set.is_empty() {
            return Err(Error::validation("scale set name is required"));
        }
        if options.count < 1 {
            return Err(Error::validation_for_field(
                scale_set,
                "count",
                "replica count needs to be a positive number",
            ));
        }
        let model = model.filter(|m| !m.is_empty());
        if let Some(model) = model {
            model
                .validate()
                .map_err(|e| Error::validation_for_field(scale_set, "image", e.to_string()))?;
        }

        let strategy = rollout_strategy(options.in_place, model.is_some());
        let ctx = self.context();
        let target = RolloutTarget {
            scale_set: scale_set.to_string(),
            role,
            desired: options.count,
            drain: options.drain,
            has_model: model.is_some(),
        };

        ctx.emit(ProgressEvent::PoolStarted {
            role,
            scale_set: scale_set.to_string(),
            strategy,
        });
        if strategy == Strategy::PlusOne {
            drivers::check_surge_headroom(&ctx, &target).await?;
        }
        if let Some(model) = model {
            push_model(&ctx, &target, model).await?;
        }
        drivers::run(&ctx, strategy, &target).await?;
        ctx.emit(ProgressEvent::PoolCompleted {
            role,
            scale_set: scale_set.to_string(),
        });

        info!(%scale_set, ?strategy, "rollout complete");
        Ok(strategy)
    }
}

/// Push the target model to the scale set unless it already has it
async fn push_model(ctx: &UpgradeContext, target: &RolloutTarget, model: &TargetModel) -> Result<()> {
    let scale_set = target.scale_set.as_str();
    let current = ctx
        .cloud
        .get(scale_set)
        .await
        .map_err(|e| target.error(UpgradeStep::ListInstances, e))?;
    if !model.changes(&current.model) {
        info!(%scale_set, "scale set already has the target model");
        return Ok(());
    }

    let result = async {
        let operation = ctx.cloud.update_model(scale_set, model).await?;
        ctx.wait(operation).await
    }
    .await;
    result.map_err(|e| target.error(UpgradeStep::UpdateModel, e))?;

    ctx.emit(ProgressEvent::ModelUpdated {
        scale_set: scale_set.to_string(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::fake::FakeCloud;
    use crate::progress::{MockProgressSink, RecordingProgress};
    use crate::spec::fixtures::{cluster, image, model};
    use crate::step::VmPhase;

    struct Harness {
        fake: Arc<FakeCloud>,
        progress: Arc<RecordingProgress>,
        upgrader: Upgrader,
    }

    fn harness(spec: &ClusterSpec) -> Harness {
        let fake = Arc::new(FakeCloud::from_spec(spec));
        let progress = Arc::new(RecordingProgress::default());
        let upgrader = Upgrader::new(fake.clone(), fake.clone()).with_progress(progress.clone());
        Harness {
            fake,
            progress,
            upgrader,
        }
    }

    /// Same cluster with one pool moved to image version `version`
    fn with_pool_version(spec: &ClusterSpec, pool: &str, version: &str) -> ClusterSpec {
        let mut spec = spec.clone();
        for p in spec.pools.iter_mut().filter(|p| p.name == pool) {
            p.model = model(version);
        }
        spec
    }

    fn instance_ids(fake: &FakeCloud, scale_set: &str) -> Vec<String> {
        fake.instances(scale_set)
            .into_iter()
            .map(|vm| vm.instance_id)
            .collect()
    }

    fn all_latest(fake: &FakeCloud, scale_set: &str) -> bool {
        fake.instances(scale_set)
            .iter()
            .all(|vm| vm.latest_model_applied)
    }

    /// Instance IDs in the order they entered `phase`
    fn entered(events: &[ProgressEvent], scale_set: &str, phase: VmPhase) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::VmPhase {
                    scale_set: ss,
                    instance_id,
                    phase: p,
                } if ss == scale_set && *p == phase => Some(instance_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Highest number of VMs simultaneously between Draining and Ready
    fn max_disrupted(events: &[ProgressEvent], scale_set: &str) -> usize {
        let mut phases: BTreeMap<&str, VmPhase> = BTreeMap::new();
        let mut max = 0;
        for event in events {
            if let ProgressEvent::VmPhase {
                scale_set: ss,
                instance_id,
                phase,
            } = event
            {
                if ss != scale_set {
                    continue;
                }
                phases.insert(instance_id, *phase);
                let disrupted = phases
                    .values()
                    .filter(|p| !matches!(p, VmPhase::Ready | VmPhase::Deleted))
                    .count();
                max = max.max(disrupted);
            }
        }
        max
    }

    fn pools_started(events: &[ProgressEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::PoolStarted { scale_set, .. } => Some(scale_set.clone()),
                _ => None,
            })
            .collect()
    }

    // ==========================================================================
    // Upgrade: model changes
    // ==========================================================================

    /// Story: a new infra image replaces both infra VMs through one surge VM
    /// while master and compute stay untouched
    #[tokio::test(start_paused = true)]
    async fn story_infra_image_rolls_out_plus_one() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = with_pool_version(&previous, "infra", "311.2");
        let h = harness(&previous);

        let kind = h.upgrader.upgrade(&previous, &requested).await.unwrap();

        assert_eq!(kind, ChangeKind::ModelUpdate);
        assert_eq!(h.fake.calls_matching("set_capacity ss-infra 3").len(), 2);
        assert_eq!(
            h.fake.calls_matching("delete ss-infra"),
            vec!["delete ss-infra 0", "delete ss-infra 1"]
        );
        assert_eq!(instance_ids(&h.fake, "ss-infra"), vec!["2", "3"]);
        assert!(all_latest(&h.fake, "ss-infra"));
        assert_eq!(h.fake.cordoned(), vec!["infra-000000", "infra-000001"]);
        assert!(h.fake.uncordoned().is_empty());
        assert!(h.fake.calls_matching("delete_node infra-000000").len() == 1);

        // never below desired, never above desired + 1
        let observed = h.fake.observations("ss-infra");
        assert!(!observed.is_empty());
        assert!(observed.iter().all(|o| (2..=3).contains(&o.capacity)));

        assert!(h.fake.calls_matching("update_model ss-master").is_empty());
        assert!(h.fake.calls_matching("update_model ss-compute").is_empty());
        assert!(h.fake.observations("ss-master").is_empty());
        assert!(h.fake.observations("ss-compute").is_empty());
    }

    /// Story: masters are updated in place one at a time and never grow
    #[tokio::test(start_paused = true)]
    async fn story_master_image_updates_in_place_one_at_a_time() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = with_pool_version(&previous, "master", "311.2");
        let h = harness(&previous);

        h.upgrader.upgrade(&previous, &requested).await.unwrap();

        let events = h.progress.events();
        assert_eq!(max_disrupted(&events, "ss-master"), 1);
        assert!(h
            .fake
            .observations("ss-master")
            .iter()
            .all(|o| o.not_ready <= 1 && o.capacity == 3));
        assert!(h.fake.calls_matching("set_capacity ss-master").is_empty());
        assert_eq!(
            entered(&events, "ss-master", VmPhase::Deallocating),
            vec!["0", "1", "2"]
        );
        assert_eq!(h.fake.calls_matching("update_instance_model ss-master").len(), 3);
        assert!(all_latest(&h.fake, "ss-master"));
        assert_eq!(instance_ids(&h.fake, "ss-master"), vec!["0", "1", "2"]);

        let masters = vec!["master-000000", "master-000001", "master-000002"];
        assert_eq!(h.fake.cordoned(), masters);
        assert_eq!(h.fake.uncordoned(), masters);
    }

    /// Story: an already unhealthy master is repaired before healthy ones
    /// are taken down
    #[tokio::test(start_paused = true)]
    async fn story_unready_master_goes_first() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = with_pool_version(&previous, "master", "311.2");
        let h = harness(&previous);
        h.fake.set_unready("master-000001");

        h.upgrader.upgrade(&previous, &requested).await.unwrap();

        assert_eq!(
            entered(&h.progress.events(), "ss-master", VmPhase::Deallocating),
            vec!["1", "0", "2"]
        );
        assert!(all_latest(&h.fake, "ss-master"));
    }

    /// Story: a master that never comes back stops the whole upgrade; the
    /// remaining masters and every worker pool are left alone
    #[tokio::test(start_paused = true)]
    async fn story_broken_master_halts_upgrade() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = cluster(3, 2, 2, "311.2");
        let h = harness(&previous);
        h.fake.break_on_restart("master-000001");

        let start = tokio::time::Instant::now();
        let err = h.upgrader.upgrade(&previous, &requested).await.unwrap_err();

        assert!(err.is_timeout(), "unexpected error: {err}");
        let message = err.to_string();
        assert!(message.contains("master rollout stopped at WaitForReady"), "{message}");
        assert!(message.contains("ss-master/1 (master-000001)"), "{message}");
        assert!(start.elapsed() >= std::time::Duration::from_secs(600));

        assert!(h.fake.calls_matching("deallocate ss-master 2").is_empty());
        assert!(h.fake.calls_matching("update_model ss-infra").is_empty());
        assert!(h.fake.calls_matching("update_model ss-compute").is_empty());
        assert_eq!(pools_started(&h.progress.events()), vec!["ss-master"]);
    }

    /// Story: after a master timed out, the next run goes back to that
    /// master before any healthy one and stops again while it stays broken;
    /// once repaired, the rollout finishes without redoing it
    #[tokio::test(start_paused = true)]
    async fn story_resume_after_readiness_timeout_retries_broken_master() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = cluster(3, 2, 2, "311.2");
        let h = harness(&previous);
        h.fake.break_on_restart("master-000001");

        let first = h.upgrader.upgrade(&previous, &requested).await.unwrap_err();
        assert!(first.is_timeout(), "{first}");

        let second = h.upgrader.upgrade(&previous, &requested).await.unwrap_err();
        assert!(second.is_timeout(), "{second}");
        assert!(second.to_string().contains("ss-master/1 (master-000001)"), "{second}");
        assert_eq!(h.fake.calls_matching("deallocate ss-master 1").len(), 2);
        assert!(h.fake.calls_matching("deallocate ss-master 2").is_empty());
        assert!(h.fake.calls_matching("update_model ss-infra").is_empty());
        assert!(h
            .fake
            .observations("ss-master")
            .iter()
            .all(|o| o.not_ready <= 1));

        h.fake.repair("master-000001");
        h.upgrader.upgrade(&previous, &requested).await.unwrap();

        assert_eq!(h.fake.calls_matching("deallocate ss-master 1").len(), 2);
        assert_eq!(h.fake.calls_matching("deallocate ss-master 2").len(), 1);
        assert_eq!(h.fake.calls_matching("update_model ss-master").len(), 1);
        assert!(all_latest(&h.fake, "ss-master"));
        assert!(all_latest(&h.fake, "ss-infra"));
        for master in ["master-000000", "master-000001", "master-000002"] {
            assert!(!h.fake.is_cordoned(master), "{master} left cordoned");
        }
    }

    /// Story: a master whose reimage failed after it took the new model is
    /// finished first on the next run, one master down at a time throughout
    #[tokio::test(start_paused = true)]
    async fn story_resume_after_failed_reimage_finishes_that_master_first() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = with_pool_version(&previous, "master", "311.2");
        let h = harness(&previous);
        h.fake.fail_reimage("master-000001");

        let err = h.upgrader.upgrade(&previous, &requested).await.unwrap_err();
        assert!(
            err.to_string()
                .contains("master rollout stopped at Reimage on ss-master/1 (master-000001)"),
            "{err}"
        );
        assert!(h.fake.instances("ss-master")[1].latest_model_applied);

        h.upgrader.upgrade(&previous, &requested).await.unwrap();

        let events = h.progress.events();
        assert_eq!(
            entered(&events, "ss-master", VmPhase::Deallocating),
            vec!["0", "1", "1", "2"]
        );
        assert_eq!(max_disrupted(&events, "ss-master"), 1);
        assert!(h
            .fake
            .observations("ss-master")
            .iter()
            .all(|o| o.not_ready <= 1));
        assert_eq!(h.fake.calls_matching("reimage ss-master 1").len(), 1);
        for master in ["master-000000", "master-000001", "master-000002"] {
            assert!(!h.fake.is_cordoned(master), "{master} left cordoned");
        }
    }

    /// Story: a scale set already past its surge size is refused before the
    /// new model is pushed
    #[tokio::test(start_paused = true)]
    async fn story_oversized_scale_set_refused_before_any_mutation() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = with_pool_version(&previous, "compute", "311.2");
        let h = harness(&previous);
        h.fake.add_vm("ss-compute");
        h.fake.add_vm("ss-compute");

        let err = h.upgrader.upgrade(&previous, &requested).await.unwrap_err();

        assert!(err.is_validation(), "{err}");
        assert!(err
            .to_string()
            .contains("capacity 4 exceeds desired count 2 plus one"));
        assert!(h.fake.calls().is_empty());
        assert_eq!(h.fake.capacity("ss-compute"), 4);
    }

    /// Story: running the same upgrade again finds nothing left to do
    #[tokio::test(start_paused = true)]
    async fn story_repeated_upgrade_is_a_no_op() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = cluster(3, 2, 2, "311.2");
        let h = harness(&previous);

        h.upgrader.upgrade(&previous, &requested).await.unwrap();
        let calls = h.fake.calls();
        let cordoned = h.fake.cordoned();

        h.upgrader.upgrade(&previous, &requested).await.unwrap();

        assert_eq!(h.fake.calls(), calls);
        assert_eq!(h.fake.cordoned(), cordoned);
    }

    /// Story: a rollout interrupted between drain and delete resumes without
    /// adding a second surge VM
    #[tokio::test(start_paused = true)]
    async fn story_interrupted_plus_one_resumes_without_extra_surge() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = with_pool_version(&previous, "compute", "311.2");
        let h = harness(&previous);
        h.fake.fail_deletes(1);

        let err = h.upgrader.upgrade(&previous, &requested).await.unwrap_err();
        assert!(err.to_string().contains("compute rollout stopped at Delete"), "{err}");
        assert_eq!(h.fake.capacity("ss-compute"), 3);

        h.upgrader.upgrade(&previous, &requested).await.unwrap();

        assert!(h
            .fake
            .observations("ss-compute")
            .iter()
            .all(|o| o.capacity <= 3));
        assert_eq!(h.fake.capacity("ss-compute"), 2);
        assert_eq!(instance_ids(&h.fake, "ss-compute"), vec!["2", "3"]);
        assert!(all_latest(&h.fake, "ss-compute"));
        assert_eq!(h.fake.calls_matching("update_model ss-compute").len(), 1);
    }

    /// Story: a surge VM already running the new model is reused on resume
    #[tokio::test(start_paused = true)]
    async fn story_existing_surge_vm_is_reused() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = with_pool_version(&previous, "compute", "311.2");
        let h = harness(&previous);
        // leftover of a crashed run: model pushed, one surge VM created
        let fake: &dyn ScaleSetClient = h.fake.as_ref();
        fake.update_model("ss-compute", &model("311.2")).await.unwrap();
        let surge = h.fake.add_vm("ss-compute");
        assert_eq!(surge, "2");

        h.upgrader.upgrade(&previous, &requested).await.unwrap();

        assert!(h
            .fake
            .observations("ss-compute")
            .iter()
            .all(|o| o.capacity <= 3));
        assert_eq!(h.fake.calls_matching("set_capacity ss-compute 3").len(), 1);
        assert_eq!(instance_ids(&h.fake, "ss-compute"), vec!["2", "3"]);
    }

    // ==========================================================================
    // Upgrade: count changes
    // ==========================================================================

    /// Story: adding a compute node only grows the scale set
    #[tokio::test(start_paused = true)]
    async fn story_compute_scale_out_is_pure_scale() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = cluster(3, 2, 3, "311.1");
        let h = harness(&previous);

        let kind = h.upgrader.upgrade(&previous, &requested).await.unwrap();

        assert_eq!(kind, ChangeKind::PureScale);
        assert_eq!(h.fake.calls(), vec!["set_capacity ss-compute 3"]);
        assert!(h.fake.cordoned().is_empty());
        assert_eq!(instance_ids(&h.fake, "ss-compute"), vec!["0", "1", "2"]);
    }

    /// Story: removing a compute node drains and deletes the newest VM
    #[tokio::test(start_paused = true)]
    async fn story_compute_scale_in_drains_highest_instance() {
        let previous = cluster(3, 2, 3, "311.1");
        let requested = cluster(3, 2, 2, "311.1");
        let h = harness(&previous);

        h.upgrader.upgrade(&previous, &requested).await.unwrap();

        assert_eq!(h.fake.cordoned(), vec!["compute-000002"]);
        assert!(h.fake.evicted().contains("app-compute-000002"));
        assert_eq!(
            h.fake.calls(),
            vec!["delete_node compute-000002", "delete ss-compute 2"]
        );
        assert_eq!(instance_ids(&h.fake, "ss-compute"), vec!["0", "1"]);
    }

    /// Story: a new image plus a larger count grows first, then replaces
    #[tokio::test(start_paused = true)]
    async fn story_image_and_count_change_together() {
        let previous = cluster(3, 2, 2, "311.1");
        let mut requested = with_pool_version(&previous, "compute", "311.2");
        requested.pools[0].count = 3;
        let h = harness(&previous);

        h.upgrader.upgrade(&previous, &requested).await.unwrap();

        assert_eq!(h.fake.capacity("ss-compute"), 3);
        assert!(all_latest(&h.fake, "ss-compute"));
        assert_eq!(h.fake.calls_matching("delete ss-compute").len(), 2);
        assert!(h
            .fake
            .observations("ss-compute")
            .iter()
            .all(|o| o.capacity <= 4));
    }

    // ==========================================================================
    // Upgrade: refusals
    // ==========================================================================

    /// Story: an invalid request is rejected before anything is touched
    #[tokio::test(start_paused = true)]
    async fn story_invalid_request_touches_nothing() {
        let previous = cluster(3, 2, 2, "311.1");
        let mut requested = cluster(3, 2, 2, "311.2");
        requested.pools[1].count = 0;
        let h = harness(&previous);

        let err = h.upgrader.upgrade(&previous, &requested).await.unwrap_err();

        assert!(err.is_validation());
        assert!(h.fake.calls().is_empty());
        assert!(h.progress.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renamed_pool_rejected() {
        let previous = cluster(3, 2, 2, "311.1");
        let mut requested = previous.clone();
        requested.pools[0].name = "workers".to_string();
        let h = harness(&previous);

        let err = h.upgrader.upgrade(&previous, &requested).await.unwrap_err();

        assert!(err.is_validation());
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_upgrade_does_not_start() {
        let previous = cluster(3, 2, 2, "311.1");
        let requested = cluster(3, 2, 2, "311.2");
        let fake = Arc::new(FakeCloud::from_spec(&previous));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let upgrader = Upgrader::new(fake.clone(), fake.clone()).with_cancellation(cancel);

        let err = upgrader.upgrade(&previous, &requested).await.unwrap_err();

        assert!(err.is_cancelled());
        assert!(fake.calls().is_empty());
    }

    // ==========================================================================
    // Rollout
    // ==========================================================================

    fn rollout_options(in_place: bool, drain: bool) -> RolloutOptions {
        RolloutOptions {
            drain,
            in_place,
            count: 2,
        }
    }

    /// Story: in place without a model only reimages each VM
    #[tokio::test(start_paused = true)]
    async fn story_rollout_reimage_only() {
        let spec = cluster(3, 2, 2, "311.1");
        let h = harness(&spec);

        let strategy = h
            .upgrader
            .rollout("ss-compute", Role::Compute, None, rollout_options(true, true))
            .await
            .unwrap();

        assert_eq!(strategy, Strategy::ReimageOnly);
        assert_eq!(
            h.fake.calls_matching("reimage ss-compute"),
            vec!["reimage ss-compute 0", "reimage ss-compute 1"]
        );
        assert!(h.fake.calls_matching("update_model").is_empty());
        assert!(h.fake.calls_matching("deallocate").is_empty());
        assert_eq!(h.fake.cordoned(), vec!["compute-000000", "compute-000001"]);
        assert_eq!(h.fake.uncordoned(), vec!["compute-000000", "compute-000001"]);
    }

    /// Story: in place with a model pushes it and updates every VM
    #[tokio::test(start_paused = true)]
    async fn story_rollout_in_place_with_model() {
        let spec = cluster(3, 2, 2, "311.1");
        let h = harness(&spec);
        let target = model("311.2");

        let strategy = h
            .upgrader
            .rollout("ss-infra", Role::Infra, Some(&target), rollout_options(true, true))
            .await
            .unwrap();

        assert_eq!(strategy, Strategy::InPlace);
        assert_eq!(h.fake.calls_matching("update_model ss-infra").len(), 1);
        assert_eq!(h.fake.calls_matching("update_instance_model ss-infra").len(), 2);
        assert!(all_latest(&h.fake, "ss-infra"));
        assert_eq!(max_disrupted(&h.progress.events(), "ss-infra"), 1);
    }

    /// Story: replacing without drain never cordons anything
    #[tokio::test(start_paused = true)]
    async fn story_rollout_plus_one_without_drain() {
        let spec = cluster(3, 2, 2, "311.1");
        let h = harness(&spec);

        let strategy = h
            .upgrader
            .rollout("ss-compute", Role::Compute, None, rollout_options(false, false))
            .await
            .unwrap();

        assert_eq!(strategy, Strategy::PlusOne);
        assert!(h.fake.cordoned().is_empty());
        assert!(h.fake.evicted().is_empty());
        assert_eq!(instance_ids(&h.fake, "ss-compute"), vec!["2", "3"]);
    }

    /// Story: an image-only model the scale set already runs pushes nothing
    /// and leaves every VM alone
    #[tokio::test(start_paused = true)]
    async fn story_rollout_with_current_image_is_a_no_op() {
        let spec = cluster(3, 2, 2, "311.1");
        let h = harness(&spec);
        let target = TargetModel {
            image: Some(image("311.1")),
            ..Default::default()
        };

        let strategy = h
            .upgrader
            .rollout("ss-infra", Role::Infra, Some(&target), rollout_options(true, true))
            .await
            .unwrap();

        assert_eq!(strategy, Strategy::InPlace);
        assert!(h.fake.calls().is_empty());
        assert!(h.fake.cordoned().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_refuses_oversized_scale_set() {
        let spec = cluster(3, 2, 2, "311.1");
        let h = harness(&spec);
        h.fake.add_vm("ss-compute");
        h.fake.add_vm("ss-compute");
        let target = model("311.2");

        let err = h
            .upgrader
            .rollout("ss-compute", Role::Compute, Some(&target), rollout_options(false, true))
            .await
            .unwrap_err();

        assert!(err.is_validation(), "{err}");
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_rejects_zero_count() {
        let spec = cluster(3, 2, 2, "311.1");
        let fake = Arc::new(FakeCloud::from_spec(&spec));
        let mut sink = MockProgressSink::new();
        sink.expect_publish().never();
        let upgrader = Upgrader::new(fake.clone(), fake.clone()).with_progress(Arc::new(sink));

        let options = RolloutOptions {
            drain: true,
            in_place: false,
            count: 0,
        };
        let err = upgrader
            .rollout("ss-compute", Role::Compute, None, options)
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(err.to_string().contains("replica count needs to be a positive number"));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_rejects_conflicting_image() {
        let spec = cluster(3, 2, 2, "311.1");
        let h = harness(&spec);
        let mut target = model("311.2");
        if let Some(image) = target.image.as_mut() {
            image.id = Some("/images/custom".to_string());
        }

        let err = h
            .upgrader
            .rollout("ss-compute", Role::Compute, Some(&target), rollout_options(false, true))
            .await
            .unwrap_err();

        assert!(err.is_validation());
        assert!(h.fake.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rollout_rejects_unknown_scale_set() {
        let spec = cluster(3, 2, 2, "311.1");
        let h = harness(&spec);

        let err = h
            .upgrader
            .rollout("ss-missing", Role::Compute, None, rollout_options(true, true))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("ListInstances"), "{err}");
    }
}
