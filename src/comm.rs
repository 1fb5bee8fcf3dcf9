//! Inter-node communication.
//!
//! The kernel talks to other nodes through the [`Communication`] trait:
//! point-to-point kernel messages plus two collective reductions used by
//! the GVT protocol. Two implementations ship with the crate:
//!
//! - [`LocalCommunication`] for a single-node run, where reductions are the
//!   identity;
//! - [`InProcessCluster`], a set of endpoints sharing memory, used to run a
//!   multi-node simulation inside one process (and by the tests).
//!
//! A networked transport is a matter of implementing the trait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{CommError, CommResult};
use crate::event::Event;
use crate::object::NodeId;
use crate::time::VirtualTime;

// ── Messages ──────────────────────────────────────────────────────────

/// What a kernel message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum MessageType {
    /// The coordinator asks every node to join a GVT round.
    GvtSynchTrigger,
    /// An event (positive or anti) for an object hosted on the receiver.
    Event,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum KernelPayload {
    Empty,
    Event(Event),
}

/// Envelope exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct KernelMessage {
    pub sender: NodeId,
    pub receiver: NodeId,
    pub kind: MessageType,
    pub payload: KernelPayload,
}

impl KernelMessage {
    pub fn gvt_trigger(sender: NodeId, receiver: NodeId) -> Self {
        KernelMessage {
            sender,
            receiver,
            kind: MessageType::GvtSynchTrigger,
            payload: KernelPayload::Empty,
        }
    }

    pub fn event(sender: NodeId, receiver: NodeId, event: Event) -> Self {
        KernelMessage {
            sender,
            receiver,
            kind: MessageType::Event,
            payload: KernelPayload::Event(event),
        }
    }
}

// ── Trait ─────────────────────────────────────────────────────────────

/// Transport between the nodes of one simulation.
///
/// Every node must call the reductions in the same order; each call blocks
/// until all nodes have contributed.
pub trait Communication: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn num_nodes(&self) -> usize;

    /// Deliver `message` to `message.receiver`'s inbox.
    fn send(&self, message: KernelMessage) -> CommResult<()>;

    /// Take the next message from this node's inbox without blocking.
    fn try_recv(&self) -> CommResult<Option<KernelMessage>>;

    /// Cluster-wide minimum of `local`.
    fn min_all_reduce(&self, local: VirtualTime) -> CommResult<VirtualTime>;

    /// Cluster-wide sum of `local`.
    fn sum_all_reduce(&self, local: i64) -> CommResult<i64>;

    /// Give up on the cluster: pending and future operations fail on every
    /// node. Called when this node stops with an error.
    fn abort(&self) {}
}

// ── Single node ───────────────────────────────────────────────────────

/// The trivial one-node transport.
#[derive(Debug, Default)]
pub struct LocalCommunication {
    inbox: Mutex<VecDeque<KernelMessage>>,
}

impl LocalCommunication {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communication for LocalCommunication {
    fn node_id(&self) -> NodeId {
        NodeId::COORDINATOR
    }

    fn num_nodes(&self) -> usize {
        1
    }

    fn send(&self, message: KernelMessage) -> CommResult<()> {
        if message.receiver != NodeId::COORDINATOR {
            return Err(CommError::UnknownNode(message.receiver));
        }
        self.inbox.lock().push_back(message);
        Ok(())
    }

    fn try_recv(&self) -> CommResult<Option<KernelMessage>> {
        Ok(self.inbox.lock().pop_front())
    }

    fn min_all_reduce(&self, local: VirtualTime) -> CommResult<VirtualTime> {
        Ok(local)
    }

    fn sum_all_reduce(&self, local: i64) -> CommResult<i64> {
        Ok(local)
    }
}

// ── In-process cluster ────────────────────────────────────────────────

#[derive(Debug)]
struct Reduction {
    generation: u64,
    arrived: usize,
    min: u64,
    sum: i64,
    last_min: u64,
    last_sum: i64,
    aborted: bool,
}

#[derive(Debug)]
struct ClusterShared {
    inboxes: Vec<Mutex<VecDeque<KernelMessage>>>,
    reduction: Mutex<Reduction>,
    arrived: Condvar,
    aborted: AtomicBool,
}

impl ClusterShared {
    fn reduce(&self, min: u64, sum: i64) -> CommResult<(u64, i64)> {
        let n = self.inboxes.len();
        let mut state = self.reduction.lock();
        if state.aborted {
            return Err(CommError::Aborted);
        }
        let generation = state.generation;
        state.min = state.min.min(min);
        state.sum += sum;
        state.arrived += 1;
        if state.arrived == n {
            state.last_min = state.min;
            state.last_sum = state.sum;
            state.min = u64::MAX;
            state.sum = 0;
            state.arrived = 0;
            state.generation += 1;
            self.arrived.notify_all();
            return Ok((state.last_min, state.last_sum));
        }
        while state.generation == generation && !state.aborted {
            self.arrived.wait(&mut state);
        }
        if state.generation == generation {
            return Err(CommError::ReductionAborted(
                "a peer left during the reduction".into(),
            ));
        }
        Ok((state.last_min, state.last_sum))
    }
}

/// Builder for a set of in-process endpoints.
#[derive(Debug)]
pub struct InProcessCluster;

impl InProcessCluster {
    /// Create `nodes` connected endpoints, `node0` first.
    pub fn new(nodes: usize) -> Vec<ClusterEndpoint> {
        let nodes = nodes.max(1);
        let shared = Arc::new(ClusterShared {
            inboxes: (0..nodes).map(|_| Mutex::new(VecDeque::new())).collect(),
            reduction: Mutex::new(Reduction {
                generation: 0,
                arrived: 0,
                min: u64::MAX,
                sum: 0,
                last_min: u64::MAX,
                last_sum: 0,
                aborted: false,
            }),
            arrived: Condvar::new(),
            aborted: AtomicBool::new(false),
        });
        (0..nodes)
            .map(|i| ClusterEndpoint {
                node: NodeId::new(i as u32),
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

/// One node's view of an [`InProcessCluster`].
#[derive(Debug, Clone)]
pub struct ClusterEndpoint {
    node: NodeId,
    shared: Arc<ClusterShared>,
}

impl Communication for ClusterEndpoint {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn num_nodes(&self) -> usize {
        self.shared.inboxes.len()
    }

    fn send(&self, message: KernelMessage) -> CommResult<()> {
        if self.shared.aborted.load(Ordering::Acquire) {
            return Err(CommError::Aborted);
        }
        let inbox = self
            .shared
            .inboxes
            .get(message.receiver.index())
            .ok_or(CommError::UnknownNode(message.receiver))?;
        inbox.lock().push_back(message);
        Ok(())
    }

    fn try_recv(&self) -> CommResult<Option<KernelMessage>> {
        if self.shared.aborted.load(Ordering::Acquire) {
            return Err(CommError::Aborted);
        }
        Ok(self.shared.inboxes[self.node.index()].lock().pop_front())
    }

    fn min_all_reduce(&self, local: VirtualTime) -> CommResult<VirtualTime> {
        self.shared
            .reduce(local.ticks(), 0)
            .map(|(min, _)| VirtualTime::new(min))
    }

    fn sum_all_reduce(&self, local: i64) -> CommResult<i64> {
        self.shared.reduce(u64::MAX, local).map(|(_, sum)| sum)
    }

    fn abort(&self) {
        let mut state = self.shared.reduction.lock();
        if !state.aborted {
            warn!(node = %self.node, "aborting in-process cluster");
            state.aborted = true;
            self.shared.aborted.store(true, Ordering::Release);
            self.shared.arrived.notify_all();
        }
    }
}
