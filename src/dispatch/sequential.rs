//! Single-threaded reference dispatcher.
//!
//! Executes every event in key order on one thread. There is nothing to
//! roll back, so it doubles as the oracle the Time Warp dispatcher is
//! checked against: both must leave every object in the same final state.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::event::EventRef;
use crate::object::{NodeId, ObjectContext, ObjectId, Outgoing, SimObject};
use crate::stats::{EventStatistics, KernelCounters, NullStatistics};
use crate::stream::StreamRegistry;
use crate::time::VirtualTime;

use super::{flatten, stamp_sends, EventDispatcher, Partitions, SimulationReport};

/// Lowest-timestamp-first queue of pending events.
///
/// A `BinaryHeap` over `Reverse` acts as a min-heap on the event key, so
/// ties in time are broken the same way on every run.
#[derive(Debug, Default)]
struct LtsfQueue {
    heap: BinaryHeap<Reverse<EventRef>>,
}

impl LtsfQueue {
    fn push(&mut self, event: EventRef) {
        self.heap.push(Reverse(event));
    }

    fn pop(&mut self) -> Option<EventRef> {
        self.heap.pop().map(|Reverse(e)| e)
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

/// The sequential dispatcher.
pub struct SequentialDispatcher {
    config: KernelConfig,
    stats: Arc<dyn EventStatistics>,
    streams: Arc<StreamRegistry>,
}

impl SequentialDispatcher {
    pub fn new(config: KernelConfig) -> Self {
        SequentialDispatcher {
            config,
            stats: Arc::new(NullStatistics),
            streams: Arc::new(StreamRegistry::discard()),
        }
    }

    /// Send a record of every execution step to `stats`.
    pub fn with_statistics(mut self, stats: Arc<dyn EventStatistics>) -> Self {
        self.stats = stats;
        self
    }

    /// Route `write_stream` calls to `streams`.
    pub fn with_streams(mut self, streams: Arc<StreamRegistry>) -> Self {
        self.streams = streams;
        self
    }
}

/// Per-object bookkeeping of a sequential run.
struct Slot {
    id: ObjectId,
    object: Box<dyn SimObject>,
    next_sequence: u64,
}

impl Slot {
    /// Stamp the handler's sends, dropping those past the end of the run.
    fn stamp(&mut self, now: VirtualTime, outgoing: Vec<Outgoing>, ceiling: VirtualTime) -> Vec<EventRef> {
        stamp_sends(self.id, now, outgoing, ceiling, &mut self.next_sequence)
            .into_iter()
            .map(Arc::new)
            .collect()
    }
}

impl EventDispatcher for SequentialDispatcher {
    fn start_simulation(&self, partitions: Partitions) -> KernelResult<SimulationReport> {
        let started = Instant::now();
        self.config.validate()?;
        if partitions.len() != 1 {
            return Err(KernelError::UnsupportedPartitioning {
                supported: 1,
                requested: partitions.len(),
            });
        }

        let ceiling = self.config.max_sim_time;
        let counters = KernelCounters::new();
        let mut slots: Vec<Slot> = flatten(partitions)?
            .into_iter()
            .map(|(id, object, _)| Slot {
                id,
                object,
                next_sequence: 0,
            })
            .collect();
        let index: HashMap<ObjectId, usize> = slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (slot.id, i))
            .collect();
        let lookup = |id: ObjectId| index.get(&id).copied().ok_or(KernelError::UnknownObject(id));

        info!(objects = slots.len(), max_sim_time = %ceiling, "starting sequential simulation");

        let mut queue = LtsfQueue::default();
        for slot in &mut slots {
            let mut ctx = ObjectContext::initial(slot.id, Some(self.streams.as_ref()));
            slot.object.create_initial_events(&mut ctx)?;
            let sent = slot.stamp(VirtualTime::ZERO, ctx.into_outgoing(), ceiling);
            self.stats.record(slot.id, VirtualTime::ZERO, &sent);
            for event in sent {
                lookup(event.receiver)?;
                queue.push(event);
            }
        }
        debug!(pending = queue.len(), "initial events scheduled");

        let mut now = VirtualTime::ZERO;
        while let Some(event) = queue.pop() {
            debug_assert!(event.receive_time >= now, "time went backwards");
            now = event.receive_time;

            let slot = &mut slots[lookup(event.receiver)?];
            let mut ctx = ObjectContext::executing(slot.id, &event, Some(self.streams.as_ref()));
            slot.object.receive_event(&mut ctx, &event)?;
            let sent = slot.stamp(now, ctx.into_outgoing(), ceiling);
            self.stats.record(slot.id, now, &sent);
            counters.add_processed(1);

            for event in sent {
                lookup(event.receiver)?;
                queue.push(event);
            }
        }
        self.streams.commit_all()?;

        let counters = counters.snapshot();
        info!(end_time = %now, %counters, "sequential simulation finished");

        let mut objects: Vec<(ObjectId, Box<dyn SimObject>)> =
            slots.into_iter().map(|s| (s.id, s.object)).collect();
        objects.sort_by_key(|(id, _)| *id);
        Ok(SimulationReport {
            node: NodeId::COORDINATOR,
            gvt: VirtualTime::INFINITY,
            end_time: now,
            counters,
            objects,
            wall_time: started.elapsed(),
        })
    }
}

impl std::fmt::Debug for SequentialDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialDispatcher")
            .field("config", &self.config)
            .field("streams", &self.streams)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::object::MessagePayload;

    fn ev(sender: u32, seq: u64, at: u64) -> EventRef {
        Arc::new(Event::positive(
            ObjectId::new(sender),
            ObjectId::new(0),
            VirtualTime::ZERO,
            VirtualTime::new(at),
            seq,
            MessagePayload::Empty,
        ))
    }

    #[test]
    fn test_ltsf_pops_in_key_order() {
        let mut queue = LtsfQueue::default();
        queue.push(ev(0, 0, 30));
        queue.push(ev(2, 0, 10));
        queue.push(ev(1, 1, 10));
        queue.push(ev(1, 0, 10));

        let order: Vec<(u64, u32, u64)> = std::iter::from_fn(|| queue.pop())
            .map(|e| (e.receive_time.ticks(), e.sender.raw(), e.sequence))
            .collect();
        assert_eq!(order, vec![(10, 1, 0), (10, 1, 1), (10, 2, 0), (30, 0, 0)]);
    }

    #[test]
    fn test_stamp_drops_sends_past_ceiling() {
        let mut slot = Slot {
            id: ObjectId::new(3),
            object: Box::new(crate::object::RelayObject::new(ObjectId::new(3), ObjectId::new(3), 1)),
            next_sequence: 0,
        };
        let out = |at: u64| Outgoing {
            receiver: ObjectId::new(0),
            receive_time: VirtualTime::new(at),
            payload: MessagePayload::Empty,
        };
        let sent = slot.stamp(VirtualTime::new(5), vec![out(8), out(50), out(9)], VirtualTime::new(10));
        let stamped: Vec<(u64, u64)> = sent.iter().map(|e| (e.receive_time.ticks(), e.sequence)).collect();
        assert_eq!(stamped, vec![(8, 0), (9, 1)]);
        assert_eq!(slot.next_sequence, 2);
    }
}
