//! Per-node pending and processed event storage.
//!
//! Each local object owns three collections behind one lock:
//!
//! ```text
//!   input      BTreeMap by key, every event not yet processed (including
//!              the one currently scheduled)
//!   processed  VecDeque, executed events in increasing key order, kept
//!              until fossil collection so they can be replayed
//!   scheduled  the object's single representative in a schedule queue
//! ```
//!
//! Worker threads pull from schedule queues (ladder queues, one per
//! scheduler). An object is in at most one schedule queue at a time with at
//! most one event, its smallest unprocessed one, so two workers never
//! execute the same object concurrently.
//!
//! With migration on, an object moves to the next schedule queue every time
//! it finishes an event, spreading busy objects over all schedulers.
//!
//! Locks are always taken in the order object queues, then schedule queue.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{KernelError, KernelResult};
use crate::event::{Event, EventKey, EventRef};
use crate::ladder::LadderQueue;
use crate::object::ObjectId;
use crate::time::VirtualTime;

/// What `insert` did with an arriving event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// The event is pending.
    Queued,
    /// It met a parked anti-message and both are gone.
    Annihilated,
}

/// What `cancel` did with an anti-message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancellation {
    /// The matching positive event was found and removed.
    Annihilated,
    /// The positive event has not arrived yet; the anti-message waits for it.
    Parked,
}

#[derive(Debug, Default)]
struct ObjectQueues {
    input: BTreeMap<EventKey, EventRef>,
    processed: VecDeque<EventRef>,
    scheduled: Option<EventRef>,
    /// Schedule queue holding `scheduled`, or the one the next event goes to.
    scheduler: usize,
    /// Anti-messages that overtook their positive, keyed by the positive's key.
    parked: BTreeMap<EventKey, EventRef>,
    fossil_threshold: VirtualTime,
}

impl ObjectQueues {
    fn first_input(&self) -> Option<&EventRef> {
        self.input.first_key_value().map(|(_, e)| e)
    }
}

/// Pending/processed event storage for all objects on one node.
pub struct EventSet {
    ids: Vec<ObjectId>,
    objects: Vec<Mutex<ObjectQueues>>,
    schedulers: Vec<Mutex<LadderQueue<EventRef>>>,
    worker_scheduler: Vec<usize>,
    migration: bool,
}

impl EventSet {
    /// `objects[i]` is `(id, scheduler)` for local object `i`. Worker `w`
    /// pulls from scheduler `w % num_schedulers`.
    pub fn new(objects: &[(ObjectId, usize)], num_schedulers: usize, num_workers: usize) -> Self {
        let num_schedulers = num_schedulers.max(1);
        EventSet {
            ids: objects.iter().map(|(id, _)| *id).collect(),
            objects: objects
                .iter()
                .map(|(_, s)| {
                    Mutex::new(ObjectQueues {
                        scheduler: s % num_schedulers,
                        ..ObjectQueues::default()
                    })
                })
                .collect(),
            schedulers: (0..num_schedulers)
                .map(|_| Mutex::new(LadderQueue::new()))
                .collect(),
            worker_scheduler: (0..num_workers.max(1)).map(|w| w % num_schedulers).collect(),
            migration: false,
        }
    }

    /// Rotate each object to the next schedule queue after every event it
    /// executes instead of pinning it to its initial one.
    pub fn with_migration(mut self, migration: bool) -> Self {
        self.migration = migration;
        self
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn num_schedulers(&self) -> usize {
        self.schedulers.len()
    }

    /// Scheduler currently serving local object `obj`.
    pub fn scheduler_of(&self, obj: usize) -> usize {
        self.objects[obj].lock().scheduler
    }

    /// Add an arriving event to `obj`'s input queue.
    ///
    /// If the event becomes the object's new minimum and the previously
    /// scheduled event can still be pulled back from the schedule queue, the
    /// new event takes its place.
    pub fn insert(&self, obj: usize, event: EventRef) -> Insertion {
        let mut queues = self.objects[obj].lock();
        let key = event.key();

        if !event.is_anti() && queues.parked.remove(&key).is_some() {
            trace!(object = %self.ids[obj], event = %key, "annihilated with parked anti-message");
            return Insertion::Annihilated;
        }

        queues.input.insert(key, event.clone());
        match queues.scheduled.clone() {
            None => {
                self.schedulers[queues.scheduler].lock().push(event.clone());
                queues.scheduled = Some(event);
            }
            Some(current) => {
                if event < current && queues.first_input() == Some(&event) {
                    let mut schedule = self.schedulers[queues.scheduler].lock();
                    // Fails when a worker already took `current`.
                    if schedule.erase(&current) {
                        schedule.push(event.clone());
                        queues.scheduled = Some(event);
                    }
                }
            }
        }
        Insertion::Queued
    }

    /// Pop the next event for `worker`.
    pub fn next_event(&self, worker: usize) -> Option<EventRef> {
        self.schedulers[self.worker_scheduler[worker]].lock().pop()
    }

    /// Timestamp of the next event `worker` would get.
    pub fn peek_timestamp(&self, worker: usize) -> Option<VirtualTime> {
        self.schedulers[self.worker_scheduler[worker]]
            .lock()
            .peek_timestamp()
    }

    /// The most recently processed event of `obj`.
    pub fn last_processed(&self, obj: usize) -> Option<EventRef> {
        self.objects[obj].lock().processed.back().cloned()
    }

    /// Schedule `obj`'s smallest pending event, if any.
    ///
    /// Only valid when the previously scheduled event is no longer in a
    /// schedule queue: at startup, or after a worker took it.
    pub fn start_scheduling(&self, obj: usize) {
        let mut queues = self.objects[obj].lock();
        self.schedule_next(&mut queues);
    }

    /// Move the event just executed for `obj` into its processed queue and
    /// schedule the next one.
    pub fn replenish(&self, obj: usize) {
        let mut queues = self.objects[obj].lock();
        if let Some(done) = queues.scheduled.take() {
            queues.input.remove(&done.key());
            debug_assert!(queues.processed.back().map_or(true, |last| *last < done));
            queues.processed.push_back(done);
        }
        if self.migration {
            queues.scheduler = (queues.scheduler + 1) % self.schedulers.len();
        }
        self.schedule_next(&mut queues);
    }

    fn schedule_next(&self, queues: &mut ObjectQueues) {
        queues.scheduled = queues.first_input().cloned();
        if let Some(next) = &queues.scheduled {
            self.schedulers[queues.scheduler].lock().push(next.clone());
        }
    }

    /// Move every processed event at or after `straggler` back to the input
    /// queue. The schedule queue is not touched: the straggler is in flight
    /// and will be followed by `replenish` or `start_scheduling`.
    pub fn rollback(&self, obj: usize, straggler: &Event) -> usize {
        let mut queues = self.objects[obj].lock();
        let mut moved = 0;
        while queues.processed.back().is_some_and(|last| **last >= *straggler) {
            if let Some(event) = queues.processed.pop_back() {
                queues.input.insert(event.key(), event);
                moved += 1;
            }
        }
        moved
    }

    /// Processed events after `restored` (exclusive) and before `straggler`,
    /// oldest first. `restored == None` means from the beginning.
    pub fn coast_forward_events(
        &self,
        obj: usize,
        straggler: &Event,
        restored: Option<&EventKey>,
    ) -> Vec<EventRef> {
        let queues = self.objects[obj].lock();
        let mut replay: Vec<EventRef> = queues
            .processed
            .iter()
            .rev()
            .skip_while(|e| ***e >= *straggler)
            .take_while(|e| restored.map_or(true, |key| e.key() > *key))
            .cloned()
            .collect();
        replay.reverse();
        replay
    }

    /// Annihilate `anti` with its positive twin.
    ///
    /// Searches the input queue, then the processed queue. A missing twin
    /// is either still in transit (the anti-message is parked) or was
    /// fossil-collected, which means GVT was wrong.
    pub fn cancel(&self, obj: usize, anti: &EventRef) -> KernelResult<Cancellation> {
        debug_assert!(anti.is_anti());
        let mut queues = self.objects[obj].lock();
        queues.input.remove(&anti.key());

        let twin = anti.twin_key();
        if queues.input.remove(&twin).is_some() {
            return Ok(Cancellation::Annihilated);
        }
        if let Some(pos) = queues.processed.iter().position(|e| e.key() == twin) {
            queues.processed.remove(pos);
            return Ok(Cancellation::Annihilated);
        }
        if anti.receive_time < queues.fossil_threshold {
            return Err(KernelError::CancelledEventCollected {
                object: self.ids[obj],
                event_time: anti.receive_time,
                threshold: queues.fossil_threshold,
            });
        }
        trace!(object = %self.ids[obj], event = %anti.key(), "parking anti-message");
        queues.parked.insert(twin, anti.clone());
        Ok(Cancellation::Parked)
    }

    /// Discard processed events of `obj` older than `threshold`.
    ///
    /// Returns the timestamp of the oldest processed event still retained.
    pub fn fossil_collect(&self, obj: usize, threshold: VirtualTime) -> Option<VirtualTime> {
        let mut queues = self.objects[obj].lock();
        if threshold > queues.fossil_threshold {
            queues.fossil_threshold = threshold;
        }
        let mut dropped = 0usize;
        while queues
            .processed
            .front()
            .is_some_and(|e| e.receive_time < threshold)
        {
            queues.processed.pop_front();
            dropped += 1;
        }
        if dropped > 0 {
            trace!(object = %self.ids[obj], dropped, %threshold, "fossil collected");
        }
        queues.processed.front().map(|e| e.receive_time)
    }

    /// Smallest timestamp among all unprocessed events on this node.
    pub fn lowest_timestamp(&self) -> VirtualTime {
        self.objects
            .iter()
            .filter_map(|q| q.lock().first_input().map(|e| e.receive_time))
            .min()
            .unwrap_or(VirtualTime::INFINITY)
    }

    /// Snapshot of `obj`'s input queue, in order.
    pub fn input_events(&self, obj: usize) -> Vec<EventRef> {
        self.objects[obj].lock().input.values().cloned().collect()
    }

    /// Snapshot of `obj`'s processed queue, in order.
    pub fn processed_events(&self, obj: usize) -> Vec<EventRef> {
        self.objects[obj].lock().processed.iter().cloned().collect()
    }

    /// Number of anti-messages waiting for their positive.
    pub fn parked_count(&self, obj: usize) -> usize {
        self.objects[obj].lock().parked.len()
    }
}

impl std::fmt::Debug for EventSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSet")
            .field("objects", &self.objects.len())
            .field("schedulers", &self.schedulers.len())
            .field("migration", &self.migration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Color;
    use crate::object::MessagePayload;
    use proptest::prelude::*;
    use std::sync::Arc;

    const RECEIVER: ObjectId = ObjectId::new(0);

    fn single() -> EventSet {
        EventSet::new(&[(RECEIVER, 0)], 1, 1)
    }

    fn ev(sender: u32, seq: u64, at: u64) -> EventRef {
        Arc::new(Event::positive(
            ObjectId::new(sender),
            RECEIVER,
            VirtualTime::ZERO,
            VirtualTime::new(at),
            seq,
            MessagePayload::Empty,
        ))
    }

    fn anti(e: &EventRef) -> EventRef {
        Arc::new(e.anti_message(Color::White))
    }

    /// Pull one event and finish it the way a worker would.
    fn step(set: &EventSet) -> Option<EventRef> {
        let event = set.next_event(0)?;
        if event.is_anti() {
            set.cancel(0, &event).unwrap();
            set.start_scheduling(0);
        } else {
            set.replenish(0);
        }
        Some(event)
    }

    fn times(events: &[EventRef]) -> Vec<u64> {
        events.iter().map(|e| e.receive_time.ticks()).collect()
    }

    #[test]
    fn test_only_minimum_is_scheduled() {
        let set = single();
        set.insert(0, ev(1, 0, 9));
        set.insert(0, ev(1, 1, 5));
        set.insert(0, ev(1, 2, 7));
        assert_eq!(set.peek_timestamp(0), Some(VirtualTime::new(5)));
        assert_eq!(times(&[step(&set).unwrap()]), vec![5]);
        assert_eq!(set.peek_timestamp(0), Some(VirtualTime::new(7)));
    }

    #[test]
    fn test_straggler_rollback_and_coast_forward() {
        let set = single();
        for (seq, t) in [5, 7, 9].into_iter().enumerate() {
            set.insert(0, ev(1, seq as u64, t));
        }
        for _ in 0..3 {
            step(&set).unwrap();
        }
        assert_eq!(times(&set.processed_events(0)), vec![5, 7, 9]);

        let straggler = ev(2, 0, 6);
        set.insert(0, straggler.clone());
        let taken = set.next_event(0).unwrap();
        assert_eq!(taken, straggler);
        assert!(taken < set.last_processed(0).unwrap());

        assert_eq!(set.rollback(0, &taken), 2);
        assert_eq!(times(&set.processed_events(0)), vec![5]);
        assert_eq!(times(&set.input_events(0)), vec![6, 7, 9]);

        // Snapshot from before event 5: replay it.
        let replay = set.coast_forward_events(0, &taken, None);
        assert_eq!(times(&replay), vec![5]);
        // Snapshot taken right after 5: nothing to replay.
        let key5 = set.processed_events(0)[0].key();
        assert!(set.coast_forward_events(0, &taken, Some(&key5)).is_empty());

        set.replenish(0);
        let order: Vec<EventRef> = std::iter::from_fn(|| step(&set)).collect();
        assert_eq!(times(&order), vec![7, 9]);
        assert_eq!(times(&set.processed_events(0)), vec![5, 6, 7, 9]);
    }

    #[test]
    fn test_anti_after_positive_annihilates() {
        let set = single();
        let e = ev(1, 0, 10);
        set.insert(0, ev(1, 1, 20));
        set.insert(0, e.clone());
        set.insert(0, anti(&e));
        let first = set.next_event(0).unwrap();
        assert!(first.is_anti());
        assert_eq!(set.cancel(0, &first).unwrap(), Cancellation::Annihilated);
        set.start_scheduling(0);
        assert_eq!(times(&set.input_events(0)), vec![20]);
    }

    #[test]
    fn test_anti_before_positive_is_parked() {
        let set = single();
        let e = ev(1, 0, 10);
        set.insert(0, anti(&e));
        let first = set.next_event(0).unwrap();
        assert_eq!(set.cancel(0, &first).unwrap(), Cancellation::Parked);
        set.start_scheduling(0);
        assert_eq!(set.parked_count(0), 1);
        assert_eq!(set.insert(0, e), Insertion::Annihilated);
        assert_eq!(set.parked_count(0), 0);
        assert!(set.input_events(0).is_empty());
        assert!(set.next_event(0).is_none());
    }

    #[test]
    fn test_anti_finds_processed_positive() {
        let set = single();
        let e = ev(1, 0, 4);
        set.insert(0, e.clone());
        step(&set).unwrap();
        let a = anti(&e);
        set.insert(0, a.clone());
        let taken = set.next_event(0).unwrap();
        assert_eq!(set.rollback(0, &taken), 1);
        assert_eq!(set.cancel(0, &taken).unwrap(), Cancellation::Annihilated);
        set.start_scheduling(0);
        assert!(set.input_events(0).is_empty());
        assert!(set.processed_events(0).is_empty());
    }

    #[test]
    fn test_cancel_below_threshold_is_fatal() {
        let set = single();
        set.fossil_collect(0, VirtualTime::new(50));
        let err = set.cancel(0, &anti(&ev(1, 0, 10))).unwrap_err();
        assert!(matches!(err, KernelError::CancelledEventCollected { .. }));
    }

    #[test]
    fn test_fossil_collect_threshold_is_exact() {
        let set = single();
        for (seq, t) in [3, 5, 5, 8].into_iter().enumerate() {
            set.insert(0, ev(1, seq as u64, t));
        }
        while step(&set).is_some() {}
        assert_eq!(set.fossil_collect(0, VirtualTime::new(5)), Some(VirtualTime::new(5)));
        assert_eq!(times(&set.processed_events(0)), vec![5, 5, 8]);
        assert_eq!(set.fossil_collect(0, VirtualTime::new(9)), None);
    }

    #[test]
    fn test_lowest_timestamp_spans_objects() {
        let set = EventSet::new(&[(ObjectId::new(0), 0), (ObjectId::new(1), 0)], 1, 1);
        assert_eq!(set.lowest_timestamp(), VirtualTime::INFINITY);
        set.insert(0, ev(1, 0, 12));
        set.insert(1, ev(1, 1, 8));
        assert_eq!(set.lowest_timestamp(), VirtualTime::new(8));
    }

    #[test]
    fn test_workers_share_schedulers_round_robin() {
        let objects = [(ObjectId::new(0), 0), (ObjectId::new(1), 1)];
        let set = EventSet::new(&objects, 2, 4);
        assert_eq!(set.num_schedulers(), 2);
        assert_eq!(set.scheduler_of(1), 1);
        set.insert(1, ev(1, 0, 3));
        assert!(set.next_event(0).is_none());
        assert!(set.next_event(3).is_some());
    }

    #[test]
    fn test_migration_rotates_schedulers() {
        let set = EventSet::new(&[(RECEIVER, 0)], 2, 2).with_migration(true);
        for (seq, t) in [4, 6, 8].into_iter().enumerate() {
            set.insert(0, ev(1, seq as u64, t));
        }
        let first = set.next_event(0).unwrap();
        assert_eq!(first.receive_time, VirtualTime::new(4));
        set.replenish(0);
        assert_eq!(set.scheduler_of(0), 1);
        assert!(set.next_event(0).is_none());

        // A smaller arrival must displace the scheduled event in its new queue.
        set.insert(0, ev(2, 0, 5));
        assert_eq!(set.peek_timestamp(1), Some(VirtualTime::new(5)));
        assert_eq!(set.next_event(1).unwrap().receive_time, VirtualTime::new(5));
        assert!(set.next_event(1).is_none());
        set.replenish(0);
        assert_eq!(set.scheduler_of(0), 0);
        assert_eq!(set.next_event(0).unwrap().receive_time, VirtualTime::new(6));
    }

    #[test]
    fn test_pinned_object_stays_on_its_scheduler() {
        let set = EventSet::new(&[(RECEIVER, 1)], 2, 2);
        set.insert(0, ev(1, 0, 4));
        set.insert(0, ev(1, 1, 6));
        set.next_event(1).unwrap();
        set.replenish(0);
        assert_eq!(set.scheduler_of(0), 1);
        assert!(set.next_event(0).is_none());
        assert_eq!(set.peek_timestamp(1), Some(VirtualTime::new(6)));
    }

    proptest! {
        #[test]
        fn prop_extraction_follows_key_order(
            raw in proptest::collection::vec((0u64..40, any::<bool>()), 1..80)
        ) {
            let set = single();
            for (i, &(t, is_anti)) in raw.iter().enumerate() {
                let e = ev(1 + (i as u32 % 3), i as u64, t);
                // Antis here have no positive twin, so they park.
                set.insert(0, if is_anti { anti(&e) } else { e });
            }
            let order: Vec<EventRef> = std::iter::from_fn(|| step(&set)).collect();
            prop_assert_eq!(order.len(), raw.len());
            for w in order.windows(2) {
                prop_assert!(w[0] < w[1]);
            }
        }

        #[test]
        fn prop_anti_and_positive_cancel_in_any_order(
            others in proptest::collection::vec(0u64..30, 0..20),
            at in 0u64..30,
            anti_first in any::<bool>(),
            steps_between in 0usize..5,
        ) {
            let set = single();
            for (i, t) in others.iter().enumerate() {
                set.insert(0, ev(2, i as u64, *t));
            }
            let e = ev(1, 0, at);
            let (first, second) = if anti_first { (anti(&e), e.clone()) } else { (e.clone(), anti(&e)) };
            set.insert(0, first);
            // Process a few events in between; rollback when needed, as a worker would.
            let interleave = |set: &EventSet| {
                if let Some(event) = set.next_event(0) {
                    if set.last_processed(0).is_some_and(|last| event < last) {
                        set.rollback(0, &event);
                    }
                    if event.is_anti() {
                        set.cancel(0, &event).unwrap();
                        set.start_scheduling(0);
                    } else {
                        set.replenish(0);
                    }
                }
            };
            for _ in 0..steps_between {
                interleave(&set);
            }
            set.insert(0, second);
            for _ in 0..(others.len() + 4) {
                interleave(&set);
            }
            let leftovers: Vec<EventRef> = set
                .input_events(0)
                .into_iter()
                .chain(set.processed_events(0))
                .collect();
            prop_assert!(!leftovers.iter().any(|x| x.sender == ObjectId::new(1)));
            prop_assert_eq!(set.parked_count(0), 0);
        }
    }
}
