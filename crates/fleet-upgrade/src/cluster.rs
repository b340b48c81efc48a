//! Cluster API interface used by the drain engine and readiness prober

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use fleet_common::error::kube_status_code;
use fleet_common::Result;

/// Result of one eviction request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// The eviction was accepted
    Evicted,
    /// The pod no longer exists
    NotFound,
    /// A disruption budget blocks the eviction for now (HTTP 429)
    Throttled,
}

/// Node and pod operations needed during a rollout
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get a node, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;

    /// Set or clear the node's unschedulable flag
    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()>;

    /// List pods scheduled on a node, across namespaces
    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    /// Request eviction of a pod
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<EvictionOutcome>;

    /// Get a pod, `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Delete a node object; a missing node is not an error
    async fn delete_node(&self, name: &str) -> Result<()>;
}

/// [`ClusterClient`] backed by the Kubernetes API
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "spec": { "unschedulable": unschedulable } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        Ok(api.list(&params).await?.items)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<EvictionOutcome> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(EvictionOutcome::Evicted),
            Err(e) => match kube_status_code(&e) {
                Some(404) => Ok(EvictionOutcome::NotFound),
                Some(429) => Ok(EvictionOutcome::Throttled),
                _ => Err(e.into()),
            },
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if kube_status_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
