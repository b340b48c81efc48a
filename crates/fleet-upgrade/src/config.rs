//! Runtime configuration for upgrades
//!
//! Every timing constant of the orchestrator lives here so operators can
//! override them from a YAML file. All fields default to the values the
//! rollout was tuned with.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_common::retry::RetryConfig;

/// Top-level upgrade configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeConfig {
    /// Drain engine settings
    pub drain: DrainConfig,
    /// Readiness prober settings
    pub readiness: ReadinessConfig,
    /// Cloud long-running operation settings
    pub operations: OperationConfig,
}

/// Drain engine settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrainConfig {
    /// Attempts to mark a node (un)schedulable
    pub cordon_attempts: u32,
    /// Pause between cordon attempts
    pub cordon_interval_secs: u64,
    /// Pause before retrying an eviction blocked by a disruption budget
    pub eviction_retry_interval_secs: u64,
    /// Interval for checking whether an evicted pod is gone
    pub deletion_poll_interval_secs: u64,
    /// Grace period assumed for pods that do not declare one
    pub default_termination_grace_period_secs: u64,
    /// Bound on the whole drain of one node
    pub timeout_secs: u64,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            cordon_attempts: 5,
            cordon_interval_secs: 2,
            eviction_retry_interval_secs: 5,
            deletion_poll_interval_secs: 3,
            default_termination_grace_period_secs: 30,
            timeout_secs: 30 * 60,
        }
    }
}

impl DrainConfig {
    /// Retry policy for cordon and uncordon
    pub fn cordon_retry(&self) -> RetryConfig {
        RetryConfig::fixed(
            self.cordon_attempts,
            Duration::from_secs(self.cordon_interval_secs),
        )
    }

    /// Pause between throttled eviction attempts
    pub fn eviction_retry_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_retry_interval_secs)
    }

    /// Interval between pod deletion checks
    pub fn deletion_poll_interval(&self) -> Duration {
        Duration::from_secs(self.deletion_poll_interval_secs)
    }

    /// Global drain bound
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// How long to wait for one evicted pod to disappear
    ///
    /// Three times the pod's grace period plus a two second margin.
    pub fn pod_deletion_timeout(&self, grace_period_secs: Option<i64>) -> Duration {
        let grace = grace_period_secs
            .and_then(|g| u64::try_from(g).ok())
            .unwrap_or(self.default_termination_grace_period_secs);
        Duration::from_secs(3 * (grace + 2))
    }
}

/// Readiness prober settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessConfig {
    /// Bound on waiting for one VM to become ready
    pub timeout_secs: u64,
    /// Interval between readiness probes
    pub poll_interval_secs: u64,
    /// Control-plane pods that must be ready on a master
    pub master_pods: MasterPods,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10 * 60,
            poll_interval_secs: 2,
            master_pods: MasterPods::default(),
        }
    }
}

impl ReadinessConfig {
    /// Readiness wait bound
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Probe interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Static control-plane pods expected on every master, named `<prefix><hostname>`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MasterPods {
    /// Namespace of the control-plane pods
    pub namespace: String,
    /// etcd pod prefix
    pub etcd_prefix: String,
    /// API server pod prefix
    pub api_server_prefix: String,
    /// Controller manager pod prefix
    pub controller_manager_prefix: String,
}

impl Default for MasterPods {
    fn default() -> Self {
        Self {
            namespace: "kube-system".to_string(),
            etcd_prefix: "master-etcd-".to_string(),
            api_server_prefix: "master-api-".to_string(),
            controller_manager_prefix: "controllers-".to_string(),
        }
    }
}

impl MasterPods {
    /// Names of the pods that must be ready on `hostname`
    pub fn pod_names(&self, hostname: &str) -> [String; 3] {
        [
            format!("{}{}", self.etcd_prefix, hostname),
            format!("{}{}", self.api_server_prefix, hostname),
            format!("{}{}", self.controller_manager_prefix, hostname),
        ]
    }
}

/// Cloud long-running operation settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationConfig {
    /// Bound on one operation
    pub timeout_secs: u64,
    /// Interval between status polls
    pub poll_interval_secs: u64,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30 * 60,
            poll_interval_secs: 10,
        }
    }
}

impl OperationConfig {
    /// Operation bound
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Status poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
