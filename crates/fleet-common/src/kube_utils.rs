//! Shared Kubernetes and polling utilities

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{NodeCondition, PodCondition};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Error;

/// Kubernetes condition status value for "True"
pub const STATUS_TRUE: &str = "True";

/// Kubernetes `Ready` condition type
pub const CONDITION_READY: &str = "Ready";

/// Check if a Kubernetes condition of the given type has status "True"
///
/// Works on any condition list whose entries expose type and status,
/// such as `NodeStatus.conditions` or `PodStatus.conditions`.
pub fn has_condition<T>(conditions: Option<&[T]>, condition_type: &str) -> bool
where
    T: HasConditionFields,
{
    conditions
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_field() == condition_type && c.status_field() == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Trait for types that have condition-like fields (type and status)
pub trait HasConditionFields {
    /// Get the condition type field value
    fn type_field(&self) -> &str;
    /// Get the condition status field value
    fn status_field(&self) -> &str;
}

impl HasConditionFields for NodeCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

impl HasConditionFields for PodCondition {
    fn type_field(&self) -> &str {
        &self.type_
    }
    fn status_field(&self) -> &str {
        &self.status
    }
}

/// Poll until a condition is met, the timeout expires or the token fires
///
/// `check_fn` returns `Ok(true)` when done and `Ok(false)` to keep polling.
/// Retryable errors are logged and polled through; any other error is
/// returned immediately. Expiry yields [`Error::Timeout`] naming `what`,
/// cancellation yields [`Error::Cancelled`].
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    what: impl Into<String>,
    cancel: &CancellationToken,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let what = what.into();
    let start = Instant::now();
    let deadline = start + timeout;

    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(format!("waiting for {what}"))),
            outcome = check_fn() => outcome,
        };

        match outcome {
            Ok(true) => return Ok(()),
            Ok(false) => trace!(what = %what, "condition not yet met"),
            Err(e) if e.is_retryable() => {
                trace!(what = %what, error = %e, "poll check failed, retrying")
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::timeout(what, now - start));
        }

        let pause = poll_interval.min(deadline - now);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(format!("waiting for {what}"))),
            _ = tokio::time::sleep(pause) => {}
        }
    }
}

/// Sleep for `duration` unless the token fires first
pub async fn sleep_or_cancel(
    duration: Duration,
    cancel: &CancellationToken,
    operation: &str,
) -> Result<(), Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled(operation)),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
///
/// Without a path the configuration is inferred (in-cluster service account
/// or `KUBECONFIG`/`~/.kube/config`).
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Compact, stable SHA-256 digest of `input` (16 hex chars)
///
/// Used as the identity of a boot script so two runs with the same script
/// content compare equal.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
