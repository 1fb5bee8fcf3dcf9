//! Per-object state snapshots for rollback.

use std::collections::VecDeque;

use crate::config::CheckpointPolicy;
use crate::event::EventKey;
use crate::object::{ObjectState, SimObject};
use crate::time::VirtualTime;

/// A saved copy of an object's state.
#[derive(Debug)]
pub struct Snapshot {
    /// Key of the last event folded into `state`; `None` for the initial
    /// state, which precedes every event.
    pub key: Option<EventKey>,
    pub state: Box<dyn ObjectState>,
}

impl Snapshot {
    /// Virtual time of the snapshot.
    pub fn time(&self) -> VirtualTime {
        self.key.map_or(VirtualTime::ZERO, |k| k.receive_time)
    }
}

/// Snapshot history of one object, oldest first.
#[derive(Debug)]
pub struct CheckpointStore {
    period: u32,
    since_last: u32,
    snapshots: VecDeque<Snapshot>,
}

impl CheckpointStore {
    /// Start a history holding `initial`.
    pub fn new(policy: CheckpointPolicy, initial: Box<dyn ObjectState>) -> Self {
        let mut snapshots = VecDeque::new();
        snapshots.push_back(Snapshot {
            key: None,
            state: initial,
        });
        CheckpointStore {
            period: policy.period.max(1),
            since_last: 0,
            snapshots,
        }
    }

    /// Replace the whole history with a single initial snapshot.
    pub fn reset(&mut self, initial: Box<dyn ObjectState>) {
        self.snapshots.clear();
        self.snapshots.push_back(Snapshot {
            key: None,
            state: initial,
        });
        self.since_last = 0;
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Keys of the retained snapshots.
    pub fn keys(&self) -> Vec<Option<EventKey>> {
        self.snapshots.iter().map(|s| s.key).collect()
    }

    /// Note that `object` has just executed the event `key`; snapshot it if
    /// the policy says so. Returns whether a snapshot was taken.
    pub fn after_event(&mut self, key: EventKey, object: &dyn SimObject) -> bool {
        self.since_last += 1;
        if self.since_last < self.period {
            return false;
        }
        self.since_last = 0;
        self.snapshots.push_back(Snapshot {
            key: Some(key),
            state: object.clone_state(),
        });
        true
    }

    /// Drop every snapshot at or after `straggler` and return the newest
    /// remaining one.
    pub fn rollback(&mut self, straggler: &EventKey) -> Option<&Snapshot> {
        while self
            .snapshots
            .back()
            .is_some_and(|s| s.key.is_some_and(|k| k >= *straggler))
        {
            self.snapshots.pop_back();
        }
        self.since_last = 0;
        self.snapshots.back()
    }

    /// Forget history no rollback can reach once GVT is `gvt`.
    ///
    /// Keeps the newest snapshot strictly before `gvt` and everything after
    /// it. Returns that snapshot's time: processed events older than it are
    /// no longer needed for coast forward.
    pub fn fossil_collect(&mut self, gvt: VirtualTime) -> VirtualTime {
        let keep_from = self
            .snapshots
            .iter()
            .rposition(|s| s.key.map_or(true, |k| k.receive_time < gvt))
            .unwrap_or(0);
        self.snapshots.drain(..keep_from);
        self.snapshots
            .front()
            .map_or(VirtualTime::ZERO, Snapshot::time)
    }
}
