//! Event dispatchers: drive a model from its initial events to the end of
//! simulated time.
//!
//! | Dispatcher | Execution |
//! |---|---|
//! | [`SequentialDispatcher`] | one thread, lowest timestamp first, no rollback |
//! | [`TimeWarpDispatcher`] | worker pool per node, optimistic with rollback, GVT rounds |
//!
//! Both consume the same objects and hand them back in a
//! [`SimulationReport`], so a model can be checked by running it both ways
//! and comparing final states.

pub mod sequential;
pub mod time_warp;


use std::collections::HashSet;
use std::time::Duration;

use crate::error::{KernelError, KernelResult};
use crate::event::Event;
use crate::object::{NodeId, ObjectId, Outgoing, SimObject};
use crate::stats::CounterSnapshot;
use crate::time::VirtualTime;

pub use sequential::SequentialDispatcher;
pub use time_warp::TimeWarpDispatcher;

/// Objects grouped into partitions.
///
/// The sequential dispatcher takes exactly one partition. The Time Warp
/// dispatcher takes this node's objects, one partition per schedule queue
/// (partition `i` is served by scheduler `i % num_schedulers`).
pub type Partitions = Vec<Vec<(ObjectId, Box<dyn SimObject>)>>;

/// Common entry point of the dispatchers.
pub trait EventDispatcher {
    /// Run the simulation to completion and return the objects.
    fn start_simulation(&self, partitions: Partitions) -> KernelResult<SimulationReport>;
}

// ── Report ────────────────────────────────────────────────────────────

/// Outcome of a finished run on one node.
pub struct SimulationReport {
    pub node: NodeId,
    /// Final GVT. Past `max_sim_time` for a Time Warp run; infinite for a
    /// sequential one.
    pub gvt: VirtualTime,
    /// Time of the last committed event on this node.
    pub end_time: VirtualTime,
    pub counters: CounterSnapshot,
    /// The node's objects in their final state, sorted by id.
    pub objects: Vec<(ObjectId, Box<dyn SimObject>)>,
    pub wall_time: Duration,
}

impl SimulationReport {
    /// Downcast an object for inspection.
    pub fn object<T: SimObject + 'static>(&self, id: ObjectId) -> Option<&T> {
        let pos = self.objects.binary_search_by_key(&id, |(oid, _)| *oid).ok()?;
        self.objects[pos].1.as_any().downcast_ref::<T>()
    }

    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.objects.iter().map(|(id, _)| *id).collect()
    }
}

impl std::fmt::Debug for SimulationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationReport")
            .field("node", &self.node)
            .field("gvt", &self.gvt)
            .field("end_time", &self.end_time)
            .field("counters", &self.counters)
            .field("objects", &self.objects.len())
            .field("wall_time", &self.wall_time)
            .finish()
    }
}

// ── Placement ─────────────────────────────────────────────────────────

/// Which node hosts each object. Object ids are dense, so entry `i` is the
/// node of `O{i}`.
///
/// Computing a good placement is the caller's business; the kernel only
/// reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Placement {
    nodes: Vec<NodeId>,
}

impl Placement {
    /// All `objects` on the coordinator.
    pub fn single_node(objects: u32) -> Self {
        Placement {
            nodes: vec![NodeId::COORDINATOR; objects as usize],
        }
    }

    /// Deal `objects` out over `nodes` nodes in contiguous blocks.
    pub fn blocks(objects: u32, nodes: u32) -> Self {
        let nodes = nodes.max(1);
        let per_node = objects.div_ceil(nodes).max(1);
        Placement {
            nodes: (0..objects).map(|i| NodeId::new(i / per_node)).collect(),
        }
    }

    pub fn from_nodes(nodes: Vec<NodeId>) -> Self {
        Placement { nodes }
    }

    /// Node hosting `object`.
    pub fn node_of(&self, object: ObjectId) -> KernelResult<NodeId> {
        self.nodes
            .get(object.index())
            .copied()
            .ok_or(KernelError::UnknownObject(object))
    }

    /// Number of objects placed.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes the placement uses.
    pub fn num_nodes(&self) -> usize {
        self.nodes.iter().map(|n| n.index() + 1).max().unwrap_or(0)
    }

    /// Ids of the objects placed on `node`, ascending.
    pub fn objects_on(&self, node: NodeId) -> Vec<ObjectId> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == node)
            .map(|(i, _)| ObjectId::new(i as u32))
            .collect()
    }
}

/// Flatten partitions into `(id, object, partition)` triples, rejecting
/// duplicate ids.
pub(crate) fn flatten(
    partitions: Partitions,
) -> KernelResult<Vec<(ObjectId, Box<dyn SimObject>, usize)>> {
    let mut seen = HashSet::new();
    let mut objects = Vec::new();
    for (partition, members) in partitions.into_iter().enumerate() {
        for (id, object) in members {
            if !seen.insert(id) {
                return Err(KernelError::DuplicateObject(id));
            }
            objects.push((id, object, partition));
        }
    }
    Ok(objects)
}

/// Turn a handler's sends into events from `sender` at `now`.
///
/// Sends landing after `ceiling` are dropped before they use up a sequence
/// number.
pub(crate) fn stamp_sends(
    sender: ObjectId,
    now: VirtualTime,
    outgoing: Vec<Outgoing>,
    ceiling: VirtualTime,
    next_sequence: &mut u64,
) -> Vec<Event> {
    outgoing
        .into_iter()
        .filter(|out| out.receive_time <= ceiling)
        .map(|out| {
            let sequence = *next_sequence;
            *next_sequence += 1;
            Event::positive(sender, out.receiver, now, out.receive_time, sequence, out.payload)
        })
        .collect()
}

/// Sleep between polls of an idle loop; zero just yields.
pub(crate) fn idle(backoff: Duration) {
    if backoff.is_zero() {
        std::thread::yield_now();
    } else {
        std::thread::sleep(backoff);
    }
}
