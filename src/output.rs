//! Record of events an object has sent, kept so a rollback can cancel them.

use std::collections::VecDeque;

use crate::event::{EventKey, EventRef};
use crate::time::VirtualTime;

#[derive(Debug, Clone)]
struct SentRecord {
    source: EventKey,
    sent: EventRef,
}

/// Sent events of one object, in the order of the events that caused them.
#[derive(Debug, Default)]
pub struct OutputQueue {
    records: VecDeque<SentRecord>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remember that executing `source` sent `sent`.
    pub fn record(&mut self, source: EventKey, sent: EventRef) {
        debug_assert!(self.records.back().map_or(true, |r| r.source <= source));
        self.records.push_back(SentRecord { source, sent });
    }

    /// Remove and return everything sent by events at or after `straggler`,
    /// newest first.
    pub fn rollback(&mut self, straggler: &EventKey) -> Vec<EventRef> {
        let mut cancelled = Vec::new();
        while self.records.back().is_some_and(|r| r.source >= *straggler) {
            if let Some(record) = self.records.pop_back() {
                cancelled.push(record.sent);
            }
        }
        cancelled
    }

    /// Forget records whose source event is older than `gvt`.
    pub fn fossil_collect(&mut self, gvt: VirtualTime) -> usize {
        let before = self.records.len();
        while self
            .records
            .front()
            .is_some_and(|r| r.source.receive_time < gvt)
        {
            self.records.pop_front();
        }
        before - self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Polarity};
    use crate::object::{MessagePayload, ObjectId};
    use std::sync::Arc;

    fn key(t: u64) -> EventKey {
        EventKey {
            receive_time: VirtualTime::new(t),
            polarity: Polarity::Positive,
            sender: ObjectId::new(1),
            sequence: t,
        }
    }

    fn sent(seq: u64, at: u64) -> EventRef {
        Arc::new(Event::positive(
            ObjectId::new(0),
            ObjectId::new(1),
            VirtualTime::ZERO,
            VirtualTime::new(at),
            seq,
            MessagePayload::Empty,
        ))
    }

    #[test]
    fn test_rollback_returns_later_sends_newest_first() {
        let mut out = OutputQueue::new();
        out.record(key(5), sent(0, 12));
        out.record(key(7), sent(1, 10));
        out.record(key(7), sent(2, 15));
        out.record(key(9), sent(3, 11));
        let cancelled = out.rollback(&key(6));
        let seqs: Vec<u64> = cancelled.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 2, 1]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_fossil_collect_by_source_time() {
        let mut out = OutputQueue::new();
        out.record(key(2), sent(0, 30));
        out.record(key(4), sent(1, 30));
        out.record(key(6), sent(2, 30));
        assert_eq!(out.fossil_collect(VirtualTime::new(4)), 1);
        assert_eq!(out.len(), 2);
        assert!(out.rollback(&key(1)).len() == 2);
        assert!(out.is_empty());
    }
}
