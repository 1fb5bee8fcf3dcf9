//! Per-object kernel bookkeeping and the rollback procedure.
//!
//! A straggler (an event older than what the object has already executed)
//! undoes the object's recent past in five steps:
//!
//! 1. processed events at or after the straggler go back to the input queue;
//! 2. the newest snapshot before the straggler is restored;
//! 3. events sent by the undone executions are collected for cancellation;
//! 4. uncommitted stream writes of the undone executions are discarded;
//! 5. events between the snapshot and the straggler are re-executed with
//!    sends suppressed (coast forward), rebuilding the state the object had
//!    just before the straggler.
//!
//! The caller turns the collected sends into anti-messages; routing them
//! needs the GVT color and the placement, which live in the dispatcher.

use tracing::debug;

use crate::checkpoint::CheckpointStore;
use crate::config::CheckpointPolicy;
use crate::error::{KernelError, KernelResult};
use crate::event::{Event, EventRef};
use crate::event_set::EventSet;
use crate::object::{ObjectContext, ObjectId, Outgoing, SimObject};
use crate::output::OutputQueue;
use crate::stream::StreamRegistry;
use crate::time::VirtualTime;

/// Everything the kernel keeps about one local object.
pub struct ObjectRuntime {
    pub id: ObjectId,
    pub object: Box<dyn SimObject>,
    pub checkpoints: CheckpointStore,
    pub outputs: OutputQueue,
    /// Next sequence number for events this object sends. Never rolled
    /// back, so a re-sent event never reuses the key of a cancelled one.
    pub next_sequence: u64,
}

/// What a rollback did.
#[derive(Debug)]
pub struct Rollback {
    /// Processed events returned to the input queue.
    pub rolled_back: usize,
    /// Previously sent events that must now be cancelled, newest first.
    pub cancelled: Vec<EventRef>,
    /// Events re-executed during coast forward.
    pub coasted: usize,
}

impl ObjectRuntime {
    pub fn new(id: ObjectId, object: Box<dyn SimObject>, policy: CheckpointPolicy) -> Self {
        let initial = object.clone_state();
        ObjectRuntime {
            id,
            object,
            checkpoints: CheckpointStore::new(policy, initial),
            outputs: OutputQueue::new(),
            next_sequence: 0,
        }
    }

    /// Let the object schedule its start-up events, then make its state
    /// after that the rollback floor.
    pub fn initialize(&mut self, streams: Option<&StreamRegistry>) -> KernelResult<Vec<Outgoing>> {
        let mut ctx = ObjectContext::initial(self.id, streams);
        self.object.create_initial_events(&mut ctx)?;
        self.checkpoints.reset(self.object.clone_state());
        Ok(ctx.into_outgoing())
    }

    /// Bookkeeping after `event` executed normally.
    pub fn after_event(&mut self, event: &Event) {
        self.checkpoints.after_event(event.key(), self.object.as_ref());
    }

    /// Undo everything at or after `straggler`. `obj` is this object's
    /// index in `events`.
    pub fn rollback(
        &mut self,
        obj: usize,
        straggler: &Event,
        events: &EventSet,
        streams: &StreamRegistry,
    ) -> KernelResult<Rollback> {
        let key = straggler.key();
        let rolled_back = events.rollback(obj, straggler);

        let snapshot = self
            .checkpoints
            .rollback(&key)
            .ok_or(KernelError::SnapshotUnavailable {
                object: self.id,
                straggler: straggler.receive_time,
            })?;
        let restored = snapshot.key;
        self.object.restore_state(snapshot.state.as_ref());

        let cancelled = self.outputs.rollback(&key);
        streams.rollback(self.id, &key);

        let replay = events.coast_forward_events(obj, straggler, restored.as_ref());
        for event in &replay {
            let mut ctx = ObjectContext::replaying(self.id, event);
            self.object.receive_event(&mut ctx, event)?;
            self.after_event(event);
        }

        debug!(
            object = %self.id,
            straggler = %key,
            rolled_back,
            cancelled = cancelled.len(),
            coasted = replay.len(),
            "rolled back"
        );
        Ok(Rollback {
            rolled_back,
            cancelled,
            coasted: replay.len(),
        })
    }

    /// Release history older than `gvt`. Returns the oldest processed
    /// timestamp still retained.
    pub fn fossil_collect(
        &mut self,
        obj: usize,
        gvt: VirtualTime,
        events: &EventSet,
    ) -> Option<VirtualTime> {
        let threshold = self.checkpoints.fossil_collect(gvt);
        self.outputs.fossil_collect(gvt);
        events.fossil_collect(obj, threshold)
    }
}

impl std::fmt::Debug for ObjectRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRuntime")
            .field("id", &self.id)
            .field("snapshots", &self.checkpoints.len())
            .field("outputs", &self.outputs.len())
            .field("next_sequence", &self.next_sequence)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::stamp_sends;
    use crate::object::{downcast_state, MessagePayload, ObjectState};
    use std::sync::Arc;

    /// Records the receive time of every event it executes and echoes each
    /// one to object 1 after 10 ticks.
    struct Recorder {
        seen: Vec<u64>,
    }

    impl SimObject for Recorder {
        fn receive_event(&mut self, ctx: &mut ObjectContext<'_>, event: &Event) -> KernelResult<()> {
            self.seen.push(event.receive_time.ticks());
            ctx.send_after(ObjectId::new(1), 10, MessagePayload::Empty)
        }
        fn clone_state(&self) -> Box<dyn ObjectState> {
            Box::new(self.seen.clone())
        }
        fn restore_state(&mut self, state: &dyn ObjectState) {
            if let Some(seen) = downcast_state::<Vec<u64>>(state) {
                self.seen = seen.clone();
            }
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn ev(seq: u64, at: u64) -> EventRef {
        Arc::new(Event::positive(
            ObjectId::new(9),
            ObjectId::new(0),
            VirtualTime::ZERO,
            VirtualTime::new(at),
            seq,
            MessagePayload::Empty,
        ))
    }

    /// Execute every pending event the way the dispatcher does, without
    /// straggler handling.
    fn execute_all(rt: &mut ObjectRuntime, set: &EventSet) {
        while let Some(event) = set.next_event(0) {
            let mut ctx = ObjectContext::executing(rt.id, &event, None);
            rt.object.receive_event(&mut ctx, &event).unwrap();
            let sent = stamp_sends(
                rt.id,
                event.receive_time,
                ctx.into_outgoing(),
                VirtualTime::new(1_000),
                &mut rt.next_sequence,
            );
            for sent in sent {
                rt.outputs.record(event.key(), Arc::new(sent));
            }
            rt.after_event(&event);
            set.replenish(0);
        }
    }

    fn seen(rt: &ObjectRuntime) -> Vec<u64> {
        rt.object
            .as_any()
            .downcast_ref::<Recorder>()
            .map(|r| r.seen.clone())
            .unwrap_or_default()
    }

    fn setup(policy: CheckpointPolicy) -> (ObjectRuntime, EventSet) {
        let rt = ObjectRuntime::new(ObjectId::new(0), Box::new(Recorder { seen: Vec::new() }), policy);
        let set = EventSet::new(&[(ObjectId::new(0), 0)], 1, 1);
        for (seq, t) in [5, 7, 9].into_iter().enumerate() {
            set.insert(0, ev(seq as u64, t));
        }
        (rt, set)
    }

    #[test]
    fn test_straggler_undoes_later_events() {
        let (mut rt, set) = setup(CheckpointPolicy { period: 1 });
        execute_all(&mut rt, &set);
        assert_eq!(seen(&rt), vec![5, 7, 9]);

        set.insert(0, ev(10, 6));
        let straggler = set.next_event(0).unwrap();
        let streams = StreamRegistry::discard();
        let rb = rt.rollback(0, &straggler, &set, &streams).unwrap();

        assert_eq!(rb.rolled_back, 2);
        assert_eq!(rb.coasted, 0);
        assert_eq!(seen(&rt), vec![5]);
        let cancelled: Vec<u64> = rb.cancelled.iter().map(|e| e.receive_time.ticks()).collect();
        assert_eq!(cancelled, vec![19, 17]);
        assert_eq!(rt.outputs.len(), 1);

        // Straggler and the undone events run again in order.
        let mut ctx = ObjectContext::executing(rt.id, &straggler, None);
        rt.object.receive_event(&mut ctx, &straggler).unwrap();
        rt.after_event(&straggler);
        set.replenish(0);
        execute_all(&mut rt, &set);
        assert_eq!(seen(&rt), vec![5, 6, 7, 9]);
    }

    #[test]
    fn test_sparse_snapshots_coast_forward() {
        let (mut rt, set) = setup(CheckpointPolicy { period: 10 });
        execute_all(&mut rt, &set);

        set.insert(0, ev(10, 8));
        let straggler = set.next_event(0).unwrap();
        let rb = rt
            .rollback(0, &straggler, &set, &StreamRegistry::discard())
            .unwrap();

        // Only the initial snapshot exists: 5 and 7 are replayed.
        assert_eq!(rb.rolled_back, 1);
        assert_eq!(rb.coasted, 2);
        assert_eq!(seen(&rt), vec![5, 7]);
        // Replays do not send, and only the undone execution is cancelled.
        assert_eq!(rb.cancelled.len(), 1);
        assert_eq!(rt.outputs.len(), 2);
    }

    #[test]
    fn test_fossil_collection_limits_history() {
        let (mut rt, set) = setup(CheckpointPolicy { period: 1 });
        execute_all(&mut rt, &set);
        assert_eq!(rt.fossil_collect(0, VirtualTime::new(8), &set), Some(VirtualTime::new(7)));
        assert_eq!(rt.checkpoints.len(), 2);
        assert_eq!(rt.outputs.len(), 1);

        // A straggler at or after GVT still finds a snapshot.
        set.insert(0, ev(10, 8));
        let straggler = set.next_event(0).unwrap();
        rt.rollback(0, &straggler, &set, &StreamRegistry::discard())
            .unwrap();
        assert_eq!(seen(&rt), vec![5, 7]);
    }
}
