//! Role-aware readiness probing
//!
//! A master is back once the etcd, API server and controller manager pods
//! on its host are Ready. A worker is back once its Node reports Ready.
//! Probes answer once; [`ReadinessProber::wait_for_ready`] polls them.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Pod};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use fleet_common::kube_utils::{has_condition, poll_until, CONDITION_READY};
use fleet_common::Result;

use crate::cluster::ClusterClient;
use crate::config::ReadinessConfig;
use crate::spec::Role;

/// Whether a pod's Ready condition is true
pub fn is_pod_ready(pod: &Pod) -> bool {
    has_condition(
        pod.status.as_ref().and_then(|s| s.conditions.as_deref()),
        CONDITION_READY,
    )
}

/// Whether a node's Ready condition is true
pub fn is_node_ready(node: &Node) -> bool {
    has_condition(
        node.status.as_ref().and_then(|s| s.conditions.as_deref()),
        CONDITION_READY,
    )
}

/// Answers "is this node healthy enough to count as upgraded?"
#[derive(Clone)]
pub struct ReadinessProber {
    cluster: Arc<dyn ClusterClient>,
    config: ReadinessConfig,
}

impl ReadinessProber {
    /// Create a prober
    pub fn new(cluster: Arc<dyn ClusterClient>, config: ReadinessConfig) -> Self {
        Self { cluster, config }
    }

    /// Probe once
    ///
    /// Missing pods or nodes mean "not ready yet", not an error.
    pub async fn is_ready(&self, role: Role, node: &str) -> Result<bool> {
        match role {
            Role::Master => self.master_ready(node).await,
            Role::Infra | Role::Compute => self.worker_ready(node).await,
        }
    }

    async fn master_ready(&self, hostname: &str) -> Result<bool> {
        let pods = &self.config.master_pods;
        for name in pods.pod_names(hostname) {
            match self.cluster.get_pod(&pods.namespace, &name).await? {
                Some(pod) if is_pod_ready(&pod) => {}
                Some(_) => {
                    debug!(node = %hostname, pod = %name, "control plane pod not ready");
                    return Ok(false);
                }
                None => {
                    debug!(node = %hostname, pod = %name, "control plane pod not found");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn worker_ready(&self, node: &str) -> Result<bool> {
        Ok(self
            .cluster
            .get_node(node)
            .await?
            .as_ref()
            .is_some_and(is_node_ready))
    }

    /// Poll [`is_ready`](Self::is_ready) until true, the configured timeout
    /// or cancellation
    #[instrument(skip(self, cancel), fields(role = %role))]
    pub async fn wait_for_ready(
        &self,
        role: Role,
        node: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        poll_until(
            self.config.timeout(),
            self.config.poll_interval(),
            format!("{role} node {node} to become ready"),
            cancel,
            move || self.is_ready(role, node),
        )
        .await
    }
}
