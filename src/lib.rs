//! # warpkernel: Optimistic Parallel Discrete-Event Simulation
//!
//! A Time Warp kernel. Simulation objects exchange timestamped events;
//! worker threads execute them speculatively, roll back when an event
//! arrives in an object's past, and cancel the messages the undone work
//! sent. A periodic GVT round finds the time nothing can roll back past,
//! frees what is older and commits output.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │            TimeWarpDispatcher               │ ← one per node
//! │  ┌──────────────┐   ┌────────────────────┐  │
//! │  │   workers    │──▶│     EventSet       │  │ ← input queues + schedule
//! │  │  (threads)   │   │  (LadderQueue ×N)  │  │
//! │  └──────┬───────┘   └────────────────────┘  │
//! │         │           ┌────────────────────┐  │
//! │         ├──────────▶│  ObjectRuntime     │  │ ← state, checkpoints,
//! │         │           │  (per object)      │  │   output queue, rollback
//! │         │           └────────────────────┘  │
//! │  ┌──────▼───────┐   ┌────────────────────┐  │
//! │  │  manager     │──▶│    GvtManager      │  │ ← colour counters, barrier
//! │  └──────┬───────┘   └────────────────────┘  │
//! └─────────┼──────────────────────────────────┘
//!           ▼
//!     Communication (LocalCommunication / InProcessCluster)
//! ```
//!
//! [`SequentialDispatcher`] runs the same objects on one thread without
//! rollback and serves as the reference result.
//!
//! | Module | Role |
//! |---|---|
//! | [`time`] | virtual time |
//! | [`event`] | events, anti-messages, ordering key |
//! | [`ladder`] | ladder priority queue |
//! | [`event_set`] | per-object input queues and schedule queues |
//! | [`checkpoint`] | state snapshots |
//! | [`output`] | sent-event log for cancellation |
//! | [`rollback`] | per-object runtime: execute, roll back, coast forward |
//! | [`gvt`] | synchronous GVT rounds |
//! | [`comm`] | inter-node transport |
//! | [`stream`] | speculative output streams |
//! | [`stats`] | counters and per-event statistics |
//! | [`config`] | kernel configuration |
//! | [`object`] | the simulation object API and reference models |
//! | [`dispatch`] | sequential and Time Warp dispatchers |

pub mod checkpoint;
pub mod comm;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod event_set;
pub mod gvt;
pub mod ladder;
pub mod object;
pub mod output;
pub mod rollback;
pub mod stats;
pub mod stream;
pub mod time;

// Re-exports for convenience.
pub use comm::{ClusterEndpoint, Communication, InProcessCluster, LocalCommunication};
pub use config::{CheckpointPolicy, GvtPeriod, KernelConfig};
pub use dispatch::{
    EventDispatcher, Partitions, Placement, SequentialDispatcher, SimulationReport,
    TimeWarpDispatcher,
};
pub use error::{CommError, KernelError, KernelResult};
pub use event::{Event, EventRef};
pub use object::{
    MessagePayload, NodeId, ObjectContext, ObjectId, ObjectState, PholdObject, RelayObject,
    SimObject,
};
pub use stats::{CounterSnapshot, EventStatistics, TraceStatistics};
pub use stream::{MemorySinks, StreamRegistry};
pub use time::VirtualTime;
