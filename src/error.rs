//! Structured error types for the kernel.
//!
//! All fallible public APIs return `Result<T, KernelError>`. Three kinds of
//! failure are distinguished:
//!
//! - **configuration** errors, reported at startup before any event runs;
//! - **protocol violations** (`CancelledEventCollected`,
//!   `SnapshotUnavailable`, `GvtRegression`), which mean the synchronization
//!   machinery is broken and abort the run;
//! - **transport** errors from the communication layer, which a GVT round
//!   absorbs as "round failed, retry next epoch".
//!
//! Empty queues and lock contention are not errors.

use std::io;

use thiserror::Error;

use crate::object::{NodeId, ObjectId};
use crate::time::VirtualTime;

/// Failures reported by a [`Communication`](crate::comm::Communication)
/// implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    /// A message was addressed to a node outside the cluster.
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The cluster was shut down after a node failed.
    #[error("cluster aborted")]
    Aborted,

    /// A collective reduction could not complete.
    #[error("reduction aborted: {0}")]
    ReductionAborted(String),
}

/// The top-level error type for the kernel.
#[derive(Debug, Error)]
pub enum KernelError {
    // ── Configuration errors ──────────────────────────────

    /// The dispatcher cannot run the requested partitioning.
    #[error("dispatcher supports {supported} partition(s), {requested} requested")]
    UnsupportedPartitioning { supported: usize, requested: usize },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An object id was referenced but is not part of the placement.
    #[error("object {0} is not registered")]
    UnknownObject(ObjectId),

    /// The same object id was registered twice.
    #[error("object {0} is registered more than once")]
    DuplicateObject(ObjectId),

    // ── Scheduling errors ─────────────────────────────────

    /// An object tried to send an event into its own past.
    #[error("cannot send event at {requested} when current time is {current}")]
    NonCausalEvent {
        requested: VirtualTime,
        current: VirtualTime,
    },

    /// Adding a delay overflowed virtual time.
    #[error("virtual time overflow: {base} + {delay}")]
    TimeOverflow { base: VirtualTime, delay: u64 },

    // ── Protocol violations ───────────────────────────────

    /// An anti-message targeted an event that was already fossil-collected.
    #[error("anti-message for object {object} at {event_time} targets history below the fossil threshold {threshold}")]
    CancelledEventCollected {
        object: ObjectId,
        event_time: VirtualTime,
        threshold: VirtualTime,
    },

    /// Rollback needed a snapshot older than any retained one.
    #[error("no snapshot of object {object} precedes straggler at {straggler}")]
    SnapshotUnavailable {
        object: ObjectId,
        straggler: VirtualTime,
    },

    /// A GVT round computed a value below the published GVT.
    #[error("GVT regression: published {previous}, computed {proposed}")]
    GvtRegression {
        previous: VirtualTime,
        proposed: VirtualTime,
    },

    // ── Collaborator errors ───────────────────────────────

    /// Communication layer failure.
    #[error("communication error: {0}")]
    Comm(#[from] CommError),

    /// An output stream sink could not be created or written.
    #[error("stream `{name}`: {source}")]
    Stream {
        name: String,
        #[source]
        source: io::Error,
    },

    /// A worker thread panicked; the run cannot be trusted.
    #[error("worker thread {0} panicked")]
    WorkerPanicked(usize),
}

impl KernelError {
    /// Whether this error is a synchronization-protocol violation.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            KernelError::CancelledEventCollected { .. }
                | KernelError::SnapshotUnavailable { .. }
                | KernelError::GvtRegression { .. }
        )
    }
}

/// Convenience alias for `Result<T, KernelError>`.
pub type KernelResult<T> = Result<T, KernelError>;

/// Convenience alias for `Result<T, CommError>`.
pub type CommResult<T> = Result<T, CommError>;
