//! Progress reporting
//!
//! Every phase transition of a rollout is published as a [`ProgressEvent`]
//! to a [`ProgressSink`]. The default sink writes structured log lines.

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::plan::{ChangeKind, Strategy};
use crate::spec::Role;
use crate::step::VmPhase;

/// A rollout phase transition
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// The requested change was classified
    Classified {
        /// Kind of change
        kind: ChangeKind,
    },
    /// A pool's rollout started
    PoolStarted {
        /// Role of the pool
        role: Role,
        /// Scale set name
        scale_set: String,
        /// Strategy used
        strategy: Strategy,
    },
    /// A pool's rollout finished
    PoolCompleted {
        /// Role of the pool
        role: Role,
        /// Scale set name
        scale_set: String,
    },
    /// The scale-set model was replaced
    ModelUpdated {
        /// Scale set name
        scale_set: String,
    },
    /// Scale-set capacity was changed
    CapacityChanged {
        /// Scale set name
        scale_set: String,
        /// New capacity
        capacity: u32,
    },
    /// A VM entered a new phase
    VmPhase {
        /// Scale set name
        scale_set: String,
        /// Instance ID
        instance_id: String,
        /// Phase entered
        phase: VmPhase,
    },
    /// Drain of a node started
    DrainStarted {
        /// Node name
        node: String,
    },
    /// Drain of a node finished
    DrainCompleted {
        /// Node name
        node: String,
        /// Pods evicted
        evicted: usize,
    },
    /// Waiting for a node to become ready
    WaitingForReady {
        /// Role deciding readiness semantics
        role: Role,
        /// Node name
        node: String,
    },
}

/// Receiver of progress events
#[cfg_attr(test, automock)]
pub trait ProgressSink: Send + Sync {
    /// Publish one event
    fn publish(&self, event: ProgressEvent);
}

/// Shared progress sink handle
pub type SharedProgress = Arc<dyn ProgressSink>;

/// Sink that logs every event through `tracing`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn publish(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Classified { kind } => info!(?kind, "classified requested change"),
            ProgressEvent::PoolStarted {
                role,
                scale_set,
                strategy,
            } => info!(%role, %scale_set, ?strategy, "rollout started"),
            ProgressEvent::PoolCompleted { role, scale_set } => {
                info!(%role, %scale_set, "rollout completed")
            }
            ProgressEvent::ModelUpdated { scale_set } => info!(%scale_set, "scale set model updated"),
            ProgressEvent::CapacityChanged {
                scale_set,
                capacity,
            } => info!(%scale_set, capacity, "capacity changed"),
            ProgressEvent::VmPhase {
                scale_set,
                instance_id,
                phase,
            } => info!(%scale_set, %instance_id, ?phase, "vm phase"),
            ProgressEvent::DrainStarted { node } => info!(%node, "drain started"),
            ProgressEvent::DrainCompleted { node, evicted } => {
                info!(%node, evicted, "drain completed")
            }
            ProgressEvent::WaitingForReady { role, node } => {
                info!(%role, %node, "waiting for node to become ready")
            }
        }
    }
}

/// Sink that records every event, for assertions in tests
#[cfg(test)]
#[derive(Default)]
pub struct RecordingProgress {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl RecordingProgress {
    /// Events published so far
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl ProgressSink for RecordingProgress {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}
