//! Node drain engine
//!
//! Draining a node means marking it unschedulable and then evicting every
//! pod that can actually move. Evictions respect PodDisruptionBudgets, so a
//! throttled eviction is retried until the budget allows it. An eviction is
//! only considered done once the pod object is gone or has been replaced.
//!
//! Pods skipped during a drain:
//! - mirror pods: the kubelet recreates them from its static manifests
//! - DaemonSet pods: the DaemonSet controller ignores cordons and would
//!   reschedule them onto the same node

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::try_join_all;
use k8s_openapi::api::core::v1::{Node, Pod};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use fleet_common::kube_utils::{poll_until, sleep_or_cancel};
use fleet_common::retry::retry_with_backoff;
use fleet_common::{Error, Result};

use crate::cluster::{ClusterClient, EvictionOutcome};
use crate::config::DrainConfig;
use crate::progress::{ProgressEvent, SharedProgress};

/// Annotation the kubelet puts on mirror pods
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Namespaced pod name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodRef {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
}

impl PodRef {
    fn from_pod(pod: &Pod) -> Self {
        Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            name: pod.metadata.name.clone().unwrap_or_default(),
        }
    }
}

impl std::fmt::Display for PodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Eviction progress of one pod
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodPhase {
    /// Not yet evicted
    PendingEviction,
    /// Eviction accepted, waiting for the pod to go away
    Evicting,
    /// Pod is gone or replaced
    Deleted,
    /// Eviction or deletion wait failed
    Failed,
}

/// State of one node's drain
#[derive(Clone, Debug, PartialEq)]
pub struct DrainSession {
    /// Node being drained
    pub node: String,
    /// Whether the node was marked unschedulable
    pub cordoned: bool,
    /// Every evictable pod and where it got to
    pub pods: BTreeMap<PodRef, PodPhase>,
}

impl DrainSession {
    fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            cordoned: false,
            pods: BTreeMap::new(),
        }
    }

    /// Whether every tracked pod is deleted
    ///
    /// A VM may only be deleted or reimaged once this holds.
    pub fn is_complete(&self) -> bool {
        self.pods.values().all(|p| *p == PodPhase::Deleted)
    }
}

/// Whether the node is marked unschedulable
pub fn is_cordoned(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false)
}

/// Whether the pod mirrors a static pod
pub fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
}

/// Whether the pod is controlled by a DaemonSet
pub fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata.owner_references.as_ref().is_some_and(|refs| {
        refs.iter()
            .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
    })
}

/// Pods that a drain should evict
pub fn evictable_pods(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| {
            if is_mirror_pod(pod) {
                debug!(pod = %PodRef::from_pod(pod), "skipping mirror pod");
                return false;
            }
            if is_daemonset_pod(pod) {
                debug!(pod = %PodRef::from_pod(pod), "skipping DaemonSet pod");
                return false;
            }
            true
        })
        .collect()
}

/// Cordons nodes and evicts their pods
#[derive(Clone)]
pub struct Drainer {
    cluster: Arc<dyn ClusterClient>,
    config: DrainConfig,
    progress: SharedProgress,
}

impl Drainer {
    /// Create a drainer
    pub fn new(cluster: Arc<dyn ClusterClient>, config: DrainConfig, progress: SharedProgress) -> Self {
        Self {
            cluster,
            config,
            progress,
        }
    }

    /// Drain a node
    ///
    /// A node without a Node object never joined the cluster, so there is
    /// nothing to drain. Otherwise the node is cordoned and every evictable
    /// pod is evicted concurrently; the first hard error, the global drain
    /// timeout or cancellation aborts the whole drain.
    #[instrument(skip(self, cancel))]
    pub async fn drain(&self, node: &str, cancel: &CancellationToken) -> Result<DrainSession> {
        let mut session = DrainSession::new(node);

        if self.cluster.get_node(node).await?.is_none() {
            info!(%node, "node not found, skipping drain");
            return Ok(session);
        }

        self.progress.publish(ProgressEvent::DrainStarted {
            node: node.to_string(),
        });

        self.set_unschedulable(node, true).await?;
        session.cordoned = true;

        let pods = evictable_pods(self.cluster.list_pods_on_node(node).await?);
        for pod in &pods {
            session
                .pods
                .insert(PodRef::from_pod(pod), PodPhase::PendingEviction);
        }
        info!(%node, pods = pods.len(), "evicting pods");

        let session = Mutex::new(session);
        let evictions = pods.iter().map(|pod| self.evict_and_wait(node, pod, &session, cancel));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::cancelled(format!("draining node {node}"))),
            joined = tokio::time::timeout(self.config.timeout(), try_join_all(evictions)) => match joined {
                Ok(result) => result.map(|_| ()),
                Err(_) => Err(Error::timeout(format!("drain of node {node}"), self.config.timeout())),
            },
        };

        let session = session
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        outcome?;

        self.progress.publish(ProgressEvent::DrainCompleted {
            node: node.to_string(),
            evicted: session.pods.len(),
        });
        Ok(session)
    }

    /// Mark a node schedulable again
    ///
    /// Uses the same retry policy as cordon. Callers invoke it once the VM
    /// is healthy again; [`drain`](Self::drain) never does.
    #[instrument(skip(self))]
    pub async fn uncordon(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, false).await
    }

    /// Uncordon a node an earlier, interrupted run left unschedulable
    ///
    /// Returns whether the node had to be uncordoned.
    #[instrument(skip(self))]
    pub async fn release_stale_cordon(&self, node: &str) -> Result<bool> {
        let cordoned = self
            .cluster
            .get_node(node)
            .await?
            .is_some_and(|n| is_cordoned(&n));
        if cordoned {
            info!(%node, "uncordoning node left cordoned by an earlier run");
            self.uncordon(node).await?;
        }
        Ok(cordoned)
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<()> {
        let action = if unschedulable { "cordon" } else { "uncordon" };
        let cluster = &self.cluster;
        retry_with_backoff(&self.config.cordon_retry(), action, move || {
            cluster.set_unschedulable(node, unschedulable)
        })
        .await
        .map_err(|e| {
            Error::drain(
                node,
                format!(
                    "{action} failed after {} attempts: {e}",
                    self.config.cordon_attempts
                ),
            )
        })
    }

    async fn evict_and_wait(
        &self,
        node: &str,
        pod: &Pod,
        session: &Mutex<DrainSession>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pod_ref = PodRef::from_pod(pod);
        let result = self.evict_and_wait_inner(node, pod, &pod_ref, session, cancel).await;
        let phase = if result.is_ok() {
            PodPhase::Deleted
        } else {
            PodPhase::Failed
        };
        lock(session).pods.insert(pod_ref, phase);
        result
    }

    async fn evict_and_wait_inner(
        &self,
        node: &str,
        pod: &Pod,
        pod_ref: &PodRef,
        session: &Mutex<DrainSession>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            match self
                .cluster
                .evict_pod(&pod_ref.namespace, &pod_ref.name)
                .await
            {
                Ok(EvictionOutcome::Evicted) => break,
                Ok(EvictionOutcome::NotFound) => {
                    debug!(pod = %pod_ref, "pod already gone");
                    return Ok(());
                }
                Ok(EvictionOutcome::Throttled) => {
                    warn!(
                        pod = %pod_ref,
                        retry_secs = self.config.eviction_retry_interval_secs,
                        "eviction blocked by disruption budget, retrying"
                    );
                    sleep_or_cancel(
                        self.config.eviction_retry_interval(),
                        cancel,
                        &format!("evicting pod {pod_ref}"),
                    )
                    .await?;
                }
                Err(e) => {
                    return Err(Error::drain(node, format!("evicting pod {pod_ref}: {e}")));
                }
            }
        }

        lock(session).pods.insert(pod_ref.clone(), PodPhase::Evicting);

        let uid = pod.metadata.uid.as_deref();
        let grace = pod
            .spec
            .as_ref()
            .and_then(|s| s.termination_grace_period_seconds);
        let cluster = &self.cluster;

        poll_until(
            self.config.pod_deletion_timeout(grace),
            self.config.deletion_poll_interval(),
            format!("pod {pod_ref} to be deleted"),
            cancel,
            move || async move {
                let current = cluster.get_pod(&pod_ref.namespace, &pod_ref.name).await?;
                Ok(match current {
                    None => true,
                    Some(p) => p.metadata.uid.as_deref() != uid,
                })
            },
        )
        .await?;

        debug!(pod = %pod_ref, "pod deleted");
        Ok(())
    }
}

fn lock(session: &Mutex<DrainSession>) -> MutexGuard<'_, DrainSession> {
    session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
