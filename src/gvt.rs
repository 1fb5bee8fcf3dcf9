//! Synchronous, color-based GVT (global virtual time) computation.
//!
//! GVT is the lower bound on the timestamp of any event that can still be
//! processed or rolled back anywhere in the cluster. A round runs like this:
//!
//! ```text
//!  coordinator decides a round is due ──► GvtSynchTrigger to every node
//!  every worker: report min(next event, smallest send) ──► barrier
//!  manager thread:
//!      loop { pump messages; sum_all_reduce(in-flight of current color) }
//!        until nothing of that color is in flight anywhere
//!      local  = min(worker reports, smallest unprocessed event)
//!      global = min_all_reduce(local)             ─► publish, flip color
//!  barrier ──► workers resume
//! ```
//!
//! Every event is stamped with the sender's color and counted: `+1` on the
//! sender's node, `-1` on the receiver's. Once the cluster-wide sum for the
//! current color is zero and all workers are parked, every event sent so far
//! is sitting in some input queue where the local minimum sees it.
//!
//! A failed reduction only fails the round: workers are released, the
//! published GVT stays where it was, and the next round tries again.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::comm::{Communication, KernelMessage};
use crate::config::GvtPeriod;
use crate::error::{CommError, KernelError, KernelResult};
use crate::event::Color;
use crate::object::NodeId;
use crate::time::VirtualTime;

/// With an event-based period, start a round anyway after this long so an
/// idle cluster still reaches termination.
const IDLE_ROUND_INTERVAL: Duration = Duration::from_millis(20);

/// Result of one GVT round on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// A new GVT was published (it may equal the previous one).
    Completed {
        previous: VirtualTime,
        gvt: VirtualTime,
    },
    /// A collective step failed; nothing changed.
    Failed(CommError),
}

/// Per-node GVT state shared by the manager thread and the workers.
pub struct GvtManager {
    comm: Arc<dyn Communication>,
    period: GvtPeriod,
    gvt: RwLock<VirtualTime>,
    color: AtomicUsize,
    in_flight: [AtomicI64; 2],
    round_pending: AtomicBool,
    epoch: AtomicU64,
    local_min: Box<[AtomicU64]>,
    send_min: Box<[AtomicU64]>,
    barrier: Barrier,
    round_started: Mutex<Instant>,
    events_since_round: AtomicU64,
}

fn slots(n: usize) -> Box<[AtomicU64]> {
    (0..n).map(|_| AtomicU64::new(u64::MAX)).collect()
}

impl GvtManager {
    /// `num_workers` worker threads plus the calling (manager) thread take
    /// part in every round.
    pub fn new(comm: Arc<dyn Communication>, num_workers: usize, period: GvtPeriod) -> Self {
        let num_workers = num_workers.max(1);
        GvtManager {
            comm,
            period,
            gvt: RwLock::new(VirtualTime::ZERO),
            color: AtomicUsize::new(Color::White.index()),
            in_flight: [AtomicI64::new(0), AtomicI64::new(0)],
            round_pending: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            local_min: slots(num_workers),
            send_min: slots(num_workers),
            barrier: Barrier::new(num_workers + 1),
            round_started: Mutex::new(Instant::now()),
            events_since_round: AtomicU64::new(0),
        }
    }

    /// The last published GVT.
    pub fn gvt(&self) -> VirtualTime {
        *self.gvt.read()
    }

    /// Number of completed rounds.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Color stamped on events sent now.
    pub fn color(&self) -> Color {
        Color::from_index(self.color.load(Ordering::Acquire))
    }

    /// This node's signed in-flight count for `color`.
    pub fn in_flight(&self, color: Color) -> i64 {
        self.in_flight[color.index()].load(Ordering::Acquire)
    }

    // ── Event accounting ──────────────────────────────────────────

    /// Account for an event leaving `thread` with `receive_time`; returns
    /// the color to stamp on it.
    pub fn on_send(&self, thread: usize, receive_time: VirtualTime) -> Color {
        let color = self.color();
        self.in_flight[color.index()].fetch_add(1, Ordering::AcqRel);
        if let Some(slot) = self.send_min.get(thread) {
            slot.fetch_min(receive_time.ticks(), Ordering::AcqRel);
        }
        color
    }

    /// Account for an event arriving at this node.
    pub fn on_receive(&self, color: Color) {
        self.in_flight[color.index()].fetch_sub(1, Ordering::AcqRel);
    }

    /// Count one processed event toward an event-based period.
    pub fn on_event_processed(&self) {
        self.events_since_round.fetch_add(1, Ordering::Relaxed);
    }

    // ── Triggering ────────────────────────────────────────────────

    pub fn is_coordinator(&self) -> bool {
        self.comm.node_id() == NodeId::COORDINATOR
    }

    /// Whether a round has been triggered and not finished.
    pub fn round_pending(&self) -> bool {
        self.round_pending.load(Ordering::Acquire)
    }

    /// Whether the coordinator should start a round now.
    pub fn ready_to_start(&self) -> bool {
        if !self.is_coordinator() || self.round_pending() {
            return false;
        }
        match self.period {
            GvtPeriod::Millis(ms) => {
                self.round_started.lock().elapsed() >= Duration::from_millis(ms)
            }
            GvtPeriod::Events(n) => {
                self.events_since_round.load(Ordering::Relaxed) >= n
                    || self.round_started.lock().elapsed() >= IDLE_ROUND_INTERVAL
            }
        }
    }

    /// Start a round: flag it locally and tell every other node.
    pub fn trigger(&self) -> KernelResult<()> {
        debug!(epoch = self.epoch(), "triggering GVT round");
        self.round_pending.store(true, Ordering::Release);
        let me = self.comm.node_id();
        for n in 0..self.comm.num_nodes() {
            let node = NodeId::new(n as u32);
            if node != me {
                self.comm.send(KernelMessage::gvt_trigger(me, node))?;
            }
        }
        Ok(())
    }

    /// A trigger arrived from the coordinator.
    pub fn receive_trigger(&self) {
        self.round_pending.store(true, Ordering::Release);
    }

    // ── Worker side ───────────────────────────────────────────────

    /// Record `thread`'s contribution: the smaller of its next event and
    /// anything it sent since the last round.
    pub fn report_thread_min(&self, thread: usize, next: VirtualTime) {
        if let (Some(local), Some(sent)) = (self.local_min.get(thread), self.send_min.get(thread)) {
            let value = next.ticks().min(sent.load(Ordering::Acquire));
            local.store(value, Ordering::Release);
        }
    }

    /// Park a worker for the duration of a round.
    pub fn worker_barrier_sync(&self) {
        self.barrier.wait();
        self.barrier.wait();
    }

    // ── Manager side ──────────────────────────────────────────────

    /// Drive a triggered round to completion.
    ///
    /// `pump` drains this node's inbox. `lowest_pending` reports the
    /// smallest unprocessed timestamp once all workers are parked.
    /// Workers are always released, even when the round fails.
    pub fn progress<P, L>(&self, mut pump: P, lowest_pending: L) -> KernelResult<RoundOutcome>
    where
        P: FnMut() -> KernelResult<()>,
        L: FnOnce() -> VirtualTime,
    {
        self.barrier.wait();
        let result = self.compute(&mut pump, lowest_pending);

        for slot in self.local_min.iter().chain(self.send_min.iter()) {
            slot.store(u64::MAX, Ordering::Release);
        }
        self.events_since_round.store(0, Ordering::Relaxed);
        *self.round_started.lock() = Instant::now();
        self.round_pending.store(false, Ordering::Release);
        self.barrier.wait();

        match result {
            Ok((previous, gvt)) => Ok(RoundOutcome::Completed { previous, gvt }),
            Err(KernelError::Comm(e)) => {
                warn!(error = %e, epoch = self.epoch(), "GVT round failed, retrying next epoch");
                Ok(RoundOutcome::Failed(e))
            }
            Err(e) => Err(e),
        }
    }

    fn compute<P, L>(&self, pump: &mut P, lowest_pending: L) -> KernelResult<(VirtualTime, VirtualTime)>
    where
        P: FnMut() -> KernelResult<()>,
        L: FnOnce() -> VirtualTime,
    {
        let color = self.color();
        loop {
            pump()?;
            let in_flight = self.comm.sum_all_reduce(self.in_flight(color))?;
            if in_flight == 0 {
                break;
            }
            debug_assert!(in_flight > 0, "more events received than sent");
            std::thread::yield_now();
        }

        let reported = self
            .local_min
            .iter()
            .map(|s| s.load(Ordering::Acquire))
            .min()
            .unwrap_or(u64::MAX);
        let local = VirtualTime::new(reported).min(lowest_pending());
        let global = self.comm.min_all_reduce(local)?;
        let previous = self.publish(global)?;

        // Everything of the old color has arrived on every node.
        self.in_flight[color.index()].store(0, Ordering::Release);
        self.color
            .store(color.flipped().index(), Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        Ok((previous, global))
    }

    /// Install a new GVT. GVT never moves backwards.
    pub fn publish(&self, proposed: VirtualTime) -> KernelResult<VirtualTime> {
        let mut gvt = self.gvt.write();
        let previous = *gvt;
        if proposed < previous {
            return Err(KernelError::GvtRegression { previous, proposed });
        }
        *gvt = proposed;
        if proposed > previous {
            info!(gvt = %proposed, previous = %previous, "GVT advanced");
        }
        Ok(previous)
    }
}

impl std::fmt::Debug for GvtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GvtManager")
            .field("gvt", &self.gvt())
            .field("epoch", &self.epoch())
            .field("color", &self.color())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{InProcessCluster, LocalCommunication};
    use std::thread;

    fn local(workers: usize) -> GvtManager {
        GvtManager::new(Arc::new(LocalCommunication::new()), workers, GvtPeriod::Events(1))
    }

    fn round(manager: &GvtManager, reports: &[u64], pending: u64) -> KernelResult<RoundOutcome> {
        thread::scope(|s| {
            for (thread, &next) in reports.iter().enumerate() {
                s.spawn(move || {
                    manager.report_thread_min(thread, VirtualTime::new(next));
                    manager.worker_barrier_sync();
                });
            }
            manager.progress(|| Ok(()), || VirtualTime::new(pending))
        })
    }

    #[test]
    fn test_gvt_is_minimum_of_reports() {
        let manager = local(3);
        let outcome = round(&manager, &[10, 12, 8], 11).unwrap();
        assert_eq!(
            outcome,
            RoundOutcome::Completed {
                previous: VirtualTime::ZERO,
                gvt: VirtualTime::new(8)
            }
        );
        assert_eq!(manager.gvt(), VirtualTime::new(8));
        assert_eq!(manager.epoch(), 1);
        assert_eq!(manager.color(), Color::Red);
    }

    #[test]
    fn test_send_min_counts_toward_report() {
        let manager = local(1);
        manager.on_send(0, VirtualTime::new(4));
        manager.on_receive(Color::White);
        round(&manager, &[9], 20).unwrap();
        assert_eq!(manager.gvt(), VirtualTime::new(4));
    }

    #[test]
    fn test_nothing_pending_reaches_infinity() {
        let manager = local(2);
        round(&manager, &[u64::MAX, u64::MAX], u64::MAX).unwrap();
        assert!(manager.gvt().is_infinite());
    }

    #[test]
    fn test_regression_is_rejected() {
        let manager = local(1);
        manager.publish(VirtualTime::new(30)).unwrap();
        let err = round(&manager, &[12], 12).unwrap_err();
        assert!(matches!(err, KernelError::GvtRegression { .. }));
        assert_eq!(manager.gvt(), VirtualTime::new(30));
        assert!(!manager.round_pending());
    }

    #[test]
    fn test_event_period_triggering() {
        let manager = local(1);
        assert!(manager.is_coordinator());
        assert!(!manager.ready_to_start());
        manager.on_event_processed();
        assert!(manager.ready_to_start());
        manager.trigger().unwrap();
        assert!(manager.round_pending());
        assert!(!manager.ready_to_start());
    }

    #[test]
    fn test_two_nodes_wait_for_in_flight_event() {
        let nodes = InProcessCluster::new(2);
        let managers: Vec<GvtManager> = nodes
            .into_iter()
            .map(|n| GvtManager::new(Arc::new(n), 1, GvtPeriod::Events(1)))
            .collect();
        // Node 0 sent an event at time 5 that node 1 has not received yet.
        managers[0].on_send(0, VirtualTime::new(5));
        let delivered = AtomicBool::new(false);

        let results: Vec<VirtualTime> = thread::scope(|s| {
            let handles: Vec<_> = managers
                .iter()
                .enumerate()
                .map(|(i, m)| {
                    let delivered = &delivered;
                    s.spawn(move || {
                        let worker = s.spawn(move || {
                            m.report_thread_min(0, VirtualTime::INFINITY);
                            m.worker_barrier_sync();
                        });
                        let pump = || {
                            if i == 1 && !delivered.swap(true, Ordering::AcqRel) {
                                m.on_receive(Color::White);
                            }
                            Ok(())
                        };
                        let pending = if i == 1 { 5 } else { u64::MAX };
                        let outcome = m.progress(pump, || VirtualTime::new(pending)).unwrap();
                        worker.join().unwrap();
                        match outcome {
                            RoundOutcome::Completed { gvt, .. } => gvt,
                            RoundOutcome::Failed(e) => panic!("round failed: {e}"),
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(results.iter().all(|t| *t == VirtualTime::new(5)));
        assert_eq!(managers[0].in_flight(Color::White), 0);
        assert_eq!(managers[1].color(), Color::Red);
    }

    #[test]
    fn test_aborted_cluster_fails_round_without_moving_gvt() {
        let nodes = InProcessCluster::new(2);
        nodes[1].abort();
        let manager = GvtManager::new(Arc::new(nodes[0].clone()), 1, GvtPeriod::Events(1));
        let outcome = round(&manager, &[3], 3).unwrap();
        assert!(matches!(outcome, RoundOutcome::Failed(_)));
        assert_eq!(manager.gvt(), VirtualTime::ZERO);
        assert_eq!(manager.epoch(), 0);
        assert_eq!(manager.color(), Color::White);
    }
}
