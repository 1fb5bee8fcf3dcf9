//! Ladder queue: an amortized-O(1) time-ordered priority queue.
//!
//! Three tiers hold the pending items:
//!
//! ```text
//!   top     unsorted, everything at or after `top_start`
//!   rungs   range buckets; each deeper rung subdivides one bucket of the
//!           rung above it
//!   bottom  fully sorted, the imminent items
//! ```
//!
//! `push` routes an item to the tier whose time range contains it. `pop`
//! drains `bottom`; when it runs dry the lowest non-empty bucket of the
//! deepest rung becomes the new bottom, or, if that bucket is too large, is
//! spread over a child rung first. Once `MAX_RUNGS` is reached an oversized
//! bucket is simply sorted, so skewed timestamp distributions cost an
//! `O(n log n)` sort instead of unbounded rung creation.

use std::sync::Arc;

use crate::event::Event;
use crate::time::VirtualTime;

/// Bucket size above which a bucket is subdivided instead of sorted.
const BOTTOM_THRESHOLD: usize = 50;

/// Maximum rung depth.
const MAX_RUNGS: usize = 8;

/// Anything the ladder can order by time.
pub trait Timestamped {
    fn timestamp(&self) -> VirtualTime;
}

impl Timestamped for Event {
    #[inline]
    fn timestamp(&self) -> VirtualTime {
        self.receive_time
    }
}

impl<T: Timestamped + ?Sized> Timestamped for Arc<T> {
    #[inline]
    fn timestamp(&self) -> VirtualTime {
        (**self).timestamp()
    }
}

// ── Rung ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Rung<T> {
    /// Start time of bucket 0.
    start: u64,
    /// Time span of one bucket, at least 1.
    width: u64,
    buckets: Vec<Vec<T>>,
    /// Buckets before this index are consumed.
    current: usize,
    len: usize,
}

impl<T: Timestamped> Rung<T> {
    fn spanning(items: Vec<T>, start: u64, width: u64, bucket_count: usize) -> Self {
        let mut rung = Rung {
            start,
            width: width.max(1),
            buckets: (0..bucket_count.max(1)).map(|_| Vec::new()).collect(),
            current: 0,
            len: 0,
        };
        for item in items {
            rung.push(item);
        }
        rung
    }

    /// Lower bound of the unconsumed part of this rung.
    fn current_start(&self) -> u64 {
        self.start
            .saturating_add((self.current as u64).saturating_mul(self.width))
    }

    /// Every bucket has been handed down; nothing may be added any more.
    fn is_exhausted(&self) -> bool {
        self.current >= self.buckets.len()
    }

    /// Whether an item at `ts` belongs to this rung's unconsumed range.
    fn accepts(&self, ts: u64) -> bool {
        !self.is_exhausted() && ts >= self.current_start()
    }

    /// Bucket for `ts`. Never a consumed one: the result is at least
    /// `current`, and times past the last bucket land in the last bucket.
    fn bucket_index(&self, ts: u64) -> usize {
        debug_assert!(!self.is_exhausted());
        let offset = ts.saturating_sub(self.start) / self.width;
        usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(self.buckets.len() - 1)
            .max(self.current)
    }

    fn push(&mut self, item: T) {
        let idx = self.bucket_index(item.timestamp().ticks());
        self.buckets[idx].push(item);
        self.len += 1;
    }
}

// ── LadderQueue ───────────────────────────────────────────────────────

/// Amortized-O(1) priority queue keyed by [`Timestamped::timestamp`] and
/// ordered fully by `Ord`.
#[derive(Debug, Clone)]
pub struct LadderQueue<T> {
    top: Vec<T>,
    top_min: u64,
    top_max: u64,
    /// Items with timestamp at or after this go to `top`.
    top_start: u64,
    /// `rungs[0]` is the coarsest; the last rung is the one being drained.
    rungs: Vec<Rung<T>>,
    /// Sorted descending so the minimum pops off the end.
    bottom: Vec<T>,
    len: usize,
}

impl<T: Timestamped + Ord> LadderQueue<T> {
    /// Create an empty ladder.
    pub fn new() -> Self {
        LadderQueue {
            top: Vec::new(),
            top_min: u64::MAX,
            top_max: 0,
            top_start: 0,
            rungs: Vec::new(),
            bottom: Vec::new(),
            len: 0,
        }
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of active rungs (exposed for tests and diagnostics).
    pub fn rung_count(&self) -> usize {
        self.rungs.len()
    }

    /// Insert an item.
    pub fn push(&mut self, item: T) {
        self.len += 1;
        let ts = item.timestamp().ticks();

        if ts >= self.top_start {
            self.top_min = self.top_min.min(ts);
            self.top_max = self.top_max.max(ts);
            self.top.push(item);
            return;
        }

        if let Some(rung) = self.rungs.iter_mut().find(|r| r.accepts(ts)) {
            rung.push(item);
            return;
        }

        self.push_bottom(item);
    }

    /// Remove and return the smallest item.
    pub fn pop(&mut self) -> Option<T> {
        if self.bottom.is_empty() {
            self.refill_bottom();
        }
        let item = self.bottom.pop()?;
        self.len -= 1;
        if self.len == 0 {
            self.reset();
        }
        Some(item)
    }

    /// Peek at the smallest item. Takes `&mut self` because it may
    /// materialize a new bottom tier.
    pub fn peek(&mut self) -> Option<&T> {
        if self.bottom.is_empty() {
            self.refill_bottom();
        }
        self.bottom.last()
    }

    /// Timestamp of the smallest item.
    pub fn peek_timestamp(&mut self) -> Option<VirtualTime> {
        self.peek().map(Timestamped::timestamp)
    }

    /// Remove a specific item. Returns `false` if it is not queued.
    pub fn erase(&mut self, item: &T) -> bool {
        let removed = self.erase_routed(item) || self.erase_anywhere(item);
        if removed {
            self.len -= 1;
            if self.len == 0 {
                self.reset();
            }
        }
        removed
    }

    /// Drain everything in order.
    pub fn drain_ordered(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }

    // ── internals ─────────────────────────────────────────────────

    fn reset(&mut self) {
        self.top.clear();
        self.top_min = u64::MAX;
        self.top_max = 0;
        self.top_start = 0;
        self.rungs.clear();
        self.bottom.clear();
    }

    fn push_bottom(&mut self, item: T) {
        let pos = self.bottom.partition_point(|x| *x > item);
        self.bottom.insert(pos, item);

        if self.bottom.len() > BOTTOM_THRESHOLD && self.rungs.len() < MAX_RUNGS {
            let lo = self.bottom.last().map_or(0, |x| x.timestamp().ticks());
            let hi = self.bottom.first().map_or(0, |x| x.timestamp().ticks());
            if hi > lo {
                let items = std::mem::take(&mut self.bottom);
                let n = items.len();
                let width = (hi - lo) / n as u64 + 1;
                self.rungs.push(Rung::spanning(items, lo, width, n));
            }
        }
    }

    fn spawn_rung_from_top(&mut self) {
        let items = std::mem::take(&mut self.top);
        let n = items.len();
        let (lo, hi) = (self.top_min, self.top_max);
        let width = (hi - lo) / n as u64 + 1;
        let rung = Rung::spanning(items, lo, width, n);
        self.top_start = lo.saturating_add(width.saturating_mul(n as u64));
        self.top_min = u64::MAX;
        self.top_max = 0;
        self.rungs.push(rung);
    }

    fn refill_bottom(&mut self) {
        loop {
            while self.rungs.last().is_some_and(|r| r.len == 0 || r.is_exhausted()) {
                self.rungs.pop();
            }

            let depth = self.rungs.len();
            let Some(rung) = self.rungs.last_mut() else {
                if self.top.is_empty() {
                    return;
                }
                self.spawn_rung_from_top();
                continue;
            };

            match rung.buckets[rung.current..].iter().position(|b| !b.is_empty()) {
                Some(skip) => rung.current += skip,
                None => {
                    rung.current = rung.buckets.len();
                    continue;
                }
            }
            let bucket_start = rung.current_start();
            let bucket = std::mem::take(&mut rung.buckets[rung.current]);
            rung.current += 1;
            rung.len -= bucket.len();

            if bucket.len() > BOTTOM_THRESHOLD && depth < MAX_RUNGS && rung.width > 1 {
                let child_width = rung.width.div_ceil(bucket.len() as u64);
                let child_buckets = rung.width.div_ceil(child_width);
                let child_buckets = usize::try_from(child_buckets).unwrap_or(bucket.len());
                let child = Rung::spanning(bucket, bucket_start, child_width, child_buckets);
                self.rungs.push(child);
                continue;
            }

            let mut bucket = bucket;
            bucket.sort_unstable_by(|a, b| b.cmp(a));
            self.bottom = bucket;
            return;
        }
    }

    fn erase_routed(&mut self, item: &T) -> bool {
        let ts = item.timestamp().ticks();
        if ts >= self.top_start {
            return swap_remove_item(&mut self.top, item);
        }
        if let Some(rung) = self.rungs.iter_mut().find(|r| r.accepts(ts)) {
            let idx = rung.bucket_index(ts);
            if swap_remove_item(&mut rung.buckets[idx], item) {
                rung.len -= 1;
                return true;
            }
            return false;
        }
        self.erase_bottom(item)
    }

    fn erase_anywhere(&mut self, item: &T) -> bool {
        if swap_remove_item(&mut self.top, item) {
            return true;
        }
        for rung in &mut self.rungs {
            for bucket in &mut rung.buckets {
                if swap_remove_item(bucket, item) {
                    rung.len -= 1;
                    return true;
                }
            }
        }
        self.erase_bottom(item)
    }

    fn erase_bottom(&mut self, item: &T) -> bool {
        let pos = self.bottom.partition_point(|x| x > item);
        if pos < self.bottom.len() && self.bottom[pos] == *item {
            self.bottom.remove(pos);
            true
        } else {
            false
        }
    }
}

impl<T: Timestamped + Ord> Default for LadderQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn swap_remove_item<T: PartialEq>(items: &mut Vec<T>, item: &T) -> bool {
    match items.iter().position(|x| x == item) {
        Some(pos) => {
            items.swap_remove(pos);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    struct Item(u64, u64);

    impl Timestamped for Item {
        fn timestamp(&self) -> VirtualTime {
            VirtualTime::new(self.0)
        }
    }

    #[test]
    fn test_time_ordering() {
        let mut q = LadderQueue::new();
        q.push(Item(30, 0));
        q.push(Item(10, 1));
        q.push(Item(20, 2));
        assert_eq!(q.pop(), Some(Item(10, 1)));
        assert_eq!(q.pop(), Some(Item(20, 2)));
        assert_eq!(q.pop(), Some(Item(30, 0)));
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_ties_follow_ord() {
        let mut q = LadderQueue::new();
        for seq in (0..5).rev() {
            q.push(Item(7, seq));
        }
        let seqs: Vec<u64> = q.drain_ordered().iter().map(|i| i.1).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_large_spread_builds_rungs() {
        let mut q = LadderQueue::new();
        for i in 0..1_000u64 {
            q.push(Item((i * 7919) % 10_007, i));
        }
        assert!(q.peek().is_some());
        assert!(q.rung_count() >= 1);
        let drained = q.drain_ordered();
        assert_eq!(drained.len(), 1_000);
        assert!(drained.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_insert_below_drained_range_goes_to_bottom() {
        let mut q = LadderQueue::new();
        for i in 0..200u64 {
            q.push(Item(100 + i, i));
        }
        assert_eq!(q.pop(), Some(Item(100, 0)));
        q.push(Item(50, 999));
        assert_eq!(q.pop(), Some(Item(50, 999)));
        assert_eq!(q.pop(), Some(Item(101, 1)));
    }

    #[test]
    fn test_identical_timestamps_degrade_to_sort() {
        let mut q = LadderQueue::new();
        for seq in 0..500u64 {
            q.push(Item(42, 499 - seq));
        }
        let drained = q.drain_ordered();
        assert_eq!(drained.first(), Some(&Item(42, 0)));
        assert_eq!(drained.last(), Some(&Item(42, 499)));
    }

    #[test]
    fn test_erase_from_every_tier() {
        let mut q = LadderQueue::new();
        for i in 0..300u64 {
            q.push(Item(i * 3, i));
        }
        // Materialize bottom and rungs.
        assert_eq!(q.peek(), Some(&Item(0, 0)));
        assert!(q.erase(&Item(0, 0)));
        assert!(q.erase(&Item(600, 200)));
        assert!(q.erase(&Item(897, 299)));
        assert!(!q.erase(&Item(898, 1)));
        assert_eq!(q.len(), 297);
        q.push(Item(5_000, 7));
        assert!(q.erase(&Item(5_000, 7)));
        let drained = q.drain_ordered();
        assert_eq!(drained.len(), 297);
        assert!(!drained.contains(&Item(600, 200)));
    }

    #[test]
    fn test_peek_timestamp() {
        let mut q = LadderQueue::new();
        assert!(q.peek_timestamp().is_none());
        q.push(Item(9, 0));
        q.push(Item(4, 1));
        assert_eq!(q.peek_timestamp(), Some(VirtualTime::new(4)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_push_after_rung_drained_below_top() {
        let mut q = LadderQueue::new();
        q.push(Item(10, 0));
        q.push(Item(10_000, 1));
        assert_eq!(q.pop(), Some(Item(10, 0)));
        q.push(Item(20_000, 2));
        assert_eq!(q.pop(), Some(Item(10_000, 1)));

        // Overflows the bottom into a rung that ends well below the top.
        for (seq, ts) in (100..=160u64).enumerate() {
            q.push(Item(ts, 10 + seq as u64));
        }
        for ts in 100..=150u64 {
            assert_eq!(q.pop().map(|i| i.0), Some(ts));
        }
        // Lands above the drained rung's range but below the top.
        q.push(Item(200, 99));

        let rest: Vec<u64> = q.drain_ordered().iter().map(|i| i.0).collect();
        let mut expected: Vec<u64> = (151..=160).collect();
        expected.extend([200, 20_000]);
        assert_eq!(rest, expected);
        assert!(q.is_empty());
    }

    #[test]
    fn test_erase_after_rung_drained() {
        let mut q = LadderQueue::new();
        q.push(Item(10, 0));
        q.push(Item(10_000, 1));
        q.pop();
        q.push(Item(20_000, 2));
        q.pop();
        for ts in 100..=160u64 {
            q.push(Item(ts, ts));
        }
        for _ in 0..51 {
            q.pop();
        }
        q.push(Item(300, 7));
        assert!(q.erase(&Item(300, 7)));
        assert!(!q.erase(&Item(300, 7)));
        assert_eq!(q.len(), 11);
        assert_eq!(q.pop(), Some(Item(151, 151)));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u64),
        PushRun(u64, u8),
        Pop,
        PopMany(u8),
        EraseNth(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u64..2_000).prop_map(Op::Push),
            2 => (0u64..60_000).prop_map(Op::Push),
            1 => (0u64..1_000, 1u8..120).prop_map(|(start, n)| Op::PushRun(start, n)),
            2 => Just(Op::Pop),
            1 => (1u8..80).prop_map(Op::PopMany),
            1 => (0usize..64).prop_map(Op::EraseNth),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(512))]

        #[test]
        fn prop_matches_ordered_set(ops in proptest::collection::vec(op(), 1..1_500)) {
            let mut q = LadderQueue::new();
            let mut model = BTreeSet::new();
            let mut seq = 0u64;
            for op in ops {
                match op {
                    Op::Push(ts) => {
                        let item = Item(ts, seq);
                        seq += 1;
                        q.push(item);
                        model.insert(item);
                    }
                    Op::PushRun(start, n) => {
                        for ts in start..start + u64::from(n) {
                            let item = Item(ts, seq);
                            seq += 1;
                            q.push(item);
                            model.insert(item);
                        }
                    }
                    Op::Pop => {
                        let expected = model.pop_first();
                        prop_assert_eq!(q.pop(), expected);
                    }
                    Op::PopMany(n) => {
                        for _ in 0..n {
                            let expected = model.pop_first();
                            prop_assert_eq!(q.pop(), expected);
                        }
                    }
                    Op::EraseNth(n) => {
                        if let Some(target) = model.iter().nth(n % (model.len().max(1))).copied() {
                            model.remove(&target);
                            prop_assert!(q.erase(&target));
                        }
                    }
                }
                prop_assert_eq!(q.len(), model.len());
            }
            let rest = q.drain_ordered();
            let expected: Vec<Item> = model.into_iter().collect();
            prop_assert_eq!(rest, expected);
        }
    }
}
