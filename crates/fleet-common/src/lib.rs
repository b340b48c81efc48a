//! Common building blocks for the fleet rollout tools: errors, retry,
//! polling, Kubernetes helpers and tracing setup

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
