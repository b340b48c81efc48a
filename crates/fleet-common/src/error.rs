//! Error types for the fleet rollout tools
//!
//! Errors carry enough context (scale set, node, step) to tell an operator
//! where a rollout stopped. The variants map onto how a caller should react:
//! retry transparently, re-invoke after a timeout, or fix the input.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for fleet operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Structural error in a request, raised before anything is mutated
    #[error("validation error for {subject}: {message}")]
    Validation {
        /// What was being validated (cluster, pool, scale set)
        subject: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g. "pools[1].count")
        field: Option<String>,
    },

    /// Scale-set control plane error
    #[error("cloud error for {scale_set}: {message}")]
    Cloud {
        /// Scale set the call targeted
        scale_set: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A bounded wait expired
    #[error("timed out after {}s waiting for {operation}", waited.as_secs())]
    Timeout {
        /// What was being waited for
        operation: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// The caller cancelled the operation
    #[error("cancelled while {operation}")]
    Cancelled {
        /// The operation in flight when cancellation fired
        operation: String,
    },

    /// Drain failure that is not a timeout
    #[error("drain of node {node} failed: {message}")]
    Drain {
        /// Node being drained
        node: String,
        /// Description of what failed
        message: String,
    },

    /// A rollout stopped; names the role, target and step
    #[error("{role} rollout stopped at {step} on {target}: {source}")]
    Rollout {
        /// Role being rolled out
        role: String,
        /// Scale set or VM the step was acting on
        target: String,
        /// Step that failed
        step: String,
        /// The error that stopped the rollout
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            subject: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with subject context
    pub fn validation_for(subject: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with subject context and field path
    pub fn validation_for_field(
        subject: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            subject: subject.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable cloud error
    pub fn cloud(scale_set: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            scale_set: scale_set.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable cloud error (rejected request, failed operation)
    pub fn cloud_permanent(scale_set: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cloud {
            scale_set: scale_set.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create a drain error
    pub fn drain(node: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Drain {
            node: node.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with the rollout position it stopped at
    pub fn rollout(
        role: impl Into<String>,
        target: impl Into<String>,
        step: impl Into<String>,
        source: Error,
    ) -> Self {
        Self::Rollout {
            role: role.into(),
            target: target.into(),
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Innermost error, looking through rollout wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Rollout { source, .. } => source.root(),
            other => other,
        }
    }

    /// Check if this error is retryable
    ///
    /// Kubernetes errors are retryable unless the API answered with a 4xx.
    /// Timeouts are not retried in place: the caller decides whether to
    /// re-invoke the whole operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(resp) => !(400..500).contains(&resp.code),
                _ => true,
            },
            Error::Cloud { retryable, .. } => *retryable,
            Error::Validation { .. } => false,
            Error::Timeout { .. } => false,
            Error::Cancelled { .. } => false,
            Error::Drain { .. } => false,
            Error::Rollout { source, .. } => source.is_retryable(),
            Error::Internal { .. } => false,
        }
    }

    /// Whether the innermost error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), Error::Timeout { .. })
    }

    /// Whether the innermost error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Error::Cancelled { .. })
    }

    /// Whether the innermost error is a validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self.root(), Error::Validation { .. })
    }
}

/// HTTP status code of a kube API error, if any
pub fn kube_status_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}
