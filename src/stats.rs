//! Execution statistics: per-step records and kernel counters.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::event::{EventKey, EventRef};
use crate::object::ObjectId;
use crate::time::VirtualTime;

/// Receives one record per executed event.
///
/// Under optimistic execution this includes steps that are later rolled
/// back; coast-forward replays are not recorded.
pub trait EventStatistics: Send + Sync {
    fn record(&self, object: ObjectId, time: VirtualTime, produced: &[EventRef]);
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatistics;

impl EventStatistics for NullStatistics {
    fn record(&self, _: ObjectId, _: VirtualTime, _: &[EventRef]) {}
}

/// One executed step.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceEntry {
    /// Virtual time of the step.
    pub time: VirtualTime,
    /// The object that executed.
    pub object: ObjectId,
    /// Keys of the events it sent.
    pub produced: Vec<EventKey>,
}

impl std::fmt::Display for TraceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[T={} {}] sent {}", self.time.ticks(), self.object, self.produced.len())
    }
}

/// Keeps every record in memory, in the order they were made.
#[derive(Debug, Default)]
pub struct TraceStatistics {
    entries: Mutex<Vec<TraceEntry>>,
}

impl TraceStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<TraceEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries for one object.
    pub fn for_object(&self, object: ObjectId) -> Vec<TraceEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.object == object)
            .cloned()
            .collect()
    }
}

impl EventStatistics for TraceStatistics {
    fn record(&self, object: ObjectId, time: VirtualTime, produced: &[EventRef]) {
        self.entries.lock().push(TraceEntry {
            time,
            object,
            produced: produced.iter().map(|e| e.key()).collect(),
        });
    }
}

// ── Kernel counters ───────────────────────────────────────────────────

/// Lock-free counters updated by the dispatchers.
#[derive(Debug, Default)]
pub struct KernelCounters {
    events_processed: AtomicU64,
    events_rolled_back: AtomicU64,
    rollbacks: AtomicU64,
    coast_forward_events: AtomicU64,
    anti_messages_sent: AtomicU64,
    annihilations: AtomicU64,
    remote_messages: AtomicU64,
    gvt_rounds: AtomicU64,
    failed_gvt_rounds: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl KernelCounters {
            $(
                #[inline]
                pub fn $name(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    add_processed => events_processed,
    add_rolled_back => events_rolled_back,
    add_rollback => rollbacks,
    add_coast_forward => coast_forward_events,
    add_anti_messages => anti_messages_sent,
    add_annihilation => annihilations,
    add_remote => remote_messages,
    add_gvt_round => gvt_rounds,
    add_failed_round => failed_gvt_rounds,
}

impl KernelCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            events_processed: get(&self.events_processed),
            events_rolled_back: get(&self.events_rolled_back),
            rollbacks: get(&self.rollbacks),
            coast_forward_events: get(&self.coast_forward_events),
            anti_messages_sent: get(&self.anti_messages_sent),
            annihilations: get(&self.annihilations),
            remote_messages: get(&self.remote_messages),
            gvt_rounds: get(&self.gvt_rounds),
            failed_gvt_rounds: get(&self.failed_gvt_rounds),
        }
    }
}

/// Plain copy of [`KernelCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterSnapshot {
    /// Executions, including ones later rolled back.
    pub events_processed: u64,
    pub events_rolled_back: u64,
    pub rollbacks: u64,
    pub coast_forward_events: u64,
    pub anti_messages_sent: u64,
    pub annihilations: u64,
    /// Events sent to objects on other nodes.
    pub remote_messages: u64,
    pub gvt_rounds: u64,
    pub failed_gvt_rounds: u64,
}

impl CounterSnapshot {
    /// Executions that survived: processed minus rolled back.
    pub fn committed_events(&self) -> u64 {
        self.events_processed.saturating_sub(self.events_rolled_back)
    }

    /// Element-wise sum, for aggregating the nodes of a cluster.
    pub fn merge(&self, other: &CounterSnapshot) -> CounterSnapshot {
        CounterSnapshot {
            events_processed: self.events_processed + other.events_processed,
            events_rolled_back: self.events_rolled_back + other.events_rolled_back,
            rollbacks: self.rollbacks + other.rollbacks,
            coast_forward_events: self.coast_forward_events + other.coast_forward_events,
            anti_messages_sent: self.anti_messages_sent + other.anti_messages_sent,
            annihilations: self.annihilations + other.annihilations,
            remote_messages: self.remote_messages + other.remote_messages,
            gvt_rounds: self.gvt_rounds.max(other.gvt_rounds),
            failed_gvt_rounds: self.failed_gvt_rounds.max(other.failed_gvt_rounds),
        }
    }
}

impl std::fmt::Display for CounterSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={} committed={} rollbacks={} rolled_back={} anti={} gvt_rounds={}",
            self.events_processed,
            self.committed_events(),
            self.rollbacks,
            self.events_rolled_back,
            self.anti_messages_sent,
            self.gvt_rounds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::object::MessagePayload;
    use std::sync::Arc;

    #[test]
    fn test_trace_records_in_order() {
        let stats = TraceStatistics::new();
        let sent = Arc::new(Event::positive(
            ObjectId::new(0),
            ObjectId::new(1),
            VirtualTime::new(1),
            VirtualTime::new(4),
            0,
            MessagePayload::Empty,
        ));
        stats.record(ObjectId::new(0), VirtualTime::new(1), &[sent.clone()]);
        stats.record(ObjectId::new(1), VirtualTime::new(4), &[]);
        let entries = stats.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].produced, vec![sent.key()]);
        assert_eq!(stats.for_object(ObjectId::new(1)).len(), 1);
        assert_eq!(entries[1].to_string(), "[T=4 O1] sent 0");
    }

    #[test]
    fn test_counters_snapshot_and_merge() {
        let counters = KernelCounters::new();
        counters.add_processed(10);
        counters.add_rolled_back(3);
        counters.add_gvt_round(1);
        let snap = counters.snapshot();
        assert_eq!(snap.committed_events(), 7);
        let merged = snap.merge(&snap);
        assert_eq!(merged.events_processed, 20);
        assert_eq!(merged.gvt_rounds, 1);
    }
}
