//! The optimistic (Time Warp) dispatcher.
//!
//! One instance runs per node. The calling thread becomes the node's
//! manager; `num_worker_threads` workers execute events:
//!
//! ```text
//!  worker w:   loop {
//!                 round pending?  report min, park at the GVT barrier
//!                 pop next event from scheduler w % S
//!                 straggler?      roll back, send anti-messages
//!                 anti-message?   annihilate with its twin
//!                 otherwise       execute, checkpoint, send, reschedule
//!              }
//!  manager:    loop {
//!                 pump inbox (remote events, GVT triggers)
//!                 coordinator: trigger a round when the period is up
//!                 round pending?  run it; on advance fossil-collect and
//!                                 commit stream output
//!                 GVT past max_sim_time?  stop
//!              }
//! ```
//!
//! Any error stops the whole cluster: the first one is kept and returned,
//! the transport is aborted so peers stop too.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::comm::{Communication, KernelMessage, KernelPayload, MessageType};
use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::event::{Event, EventRef};
use crate::event_set::{Cancellation, EventSet, Insertion};
use crate::gvt::{GvtManager, RoundOutcome};
use crate::object::{NodeId, ObjectContext, ObjectId, SimObject};
use crate::rollback::ObjectRuntime;
use crate::stats::{EventStatistics, KernelCounters, NullStatistics};
use crate::stream::{discard_sinks, StreamRegistry};
use crate::time::VirtualTime;

use super::{flatten, idle, stamp_sends, EventDispatcher, Partitions, Placement, SimulationReport};

/// Consecutive failed GVT rounds tolerated before the run is abandoned.
const MAX_FAILED_ROUNDS: u32 = 32;

/// The Time Warp dispatcher for one node.
pub struct TimeWarpDispatcher {
    config: KernelConfig,
    comm: Arc<dyn Communication>,
    placement: Placement,
    stats: Arc<dyn EventStatistics>,
    streams: Arc<StreamRegistry>,
}

impl TimeWarpDispatcher {
    pub fn new(config: KernelConfig, comm: Arc<dyn Communication>, placement: Placement) -> Self {
        TimeWarpDispatcher {
            config,
            comm,
            placement,
            stats: Arc::new(NullStatistics),
            streams: Arc::new(StreamRegistry::speculative(discard_sinks())),
        }
    }

    /// Send a record of every (possibly speculative) execution step to
    /// `stats`.
    pub fn with_statistics(mut self, stats: Arc<dyn EventStatistics>) -> Self {
        self.stats = stats;
        self
    }

    /// Route `write_stream` calls to `streams`. The registry must be
    /// speculative so rolled-back writes never reach the sinks; a
    /// write-through one is rejected when the run starts.
    pub fn with_streams(mut self, streams: Arc<StreamRegistry>) -> Self {
        self.streams = streams;
        self
    }

    fn check_streams(&self) -> KernelResult<()> {
        if self.streams.is_speculative() {
            Ok(())
        } else {
            Err(KernelError::InvalidConfig(
                "Time Warp needs a speculative stream registry".into(),
            ))
        }
    }

    /// Check the supplied objects against the placement and return them
    /// with their partition index.
    fn local_objects(
        &self,
        partitions: Partitions,
    ) -> KernelResult<Vec<(ObjectId, Box<dyn SimObject>, usize)>> {
        let me = self.comm.node_id();
        if self.placement.num_nodes() > self.comm.num_nodes() {
            return Err(KernelError::InvalidConfig(format!(
                "placement uses {} nodes, the transport has {}",
                self.placement.num_nodes(),
                self.comm.num_nodes()
            )));
        }

        let mut objects = flatten(partitions)?;
        for (id, _, _) in &objects {
            let node = self.placement.node_of(*id)?;
            if node != me {
                return Err(KernelError::InvalidConfig(format!(
                    "object {id} is placed on {node}, not on {me}"
                )));
            }
        }
        let expected = self.placement.objects_on(me);
        if expected.len() != objects.len() {
            let missing = expected
                .iter()
                .find(|id| !objects.iter().any(|(supplied, _, _)| supplied == *id));
            return Err(KernelError::InvalidConfig(match missing {
                Some(id) => format!("object {id} is placed on {me} but was not supplied"),
                None => format!("{me} expects {} objects", expected.len()),
            }));
        }
        objects.sort_by_key(|(id, _, _)| *id);
        Ok(objects)
    }
}

impl EventDispatcher for TimeWarpDispatcher {
    fn start_simulation(&self, partitions: Partitions) -> KernelResult<SimulationReport> {
        let started = Instant::now();
        let kernel = self
            .config
            .validate()
            .and_then(|()| self.check_streams())
            .and_then(|()| self.local_objects(partitions))
            .map(|objects| Kernel::new(self, objects))
            .and_then(|kernel| kernel.initialize().map(|()| kernel));
        let kernel = match kernel {
            Ok(kernel) => kernel,
            Err(e) => {
                error!(node = %self.comm.node_id(), error = %e, "startup failed");
                self.comm.abort();
                return Err(e);
            }
        };
        kernel.run();
        kernel.finish(started)
    }
}

impl std::fmt::Debug for TimeWarpDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeWarpDispatcher")
            .field("node", &self.comm.node_id())
            .field("config", &self.config)
            .field("objects", &self.placement.len())
            .finish()
    }
}

// ── Kernel ────────────────────────────────────────────────────────────

/// Everything shared by the threads of one run.
struct Kernel<'a> {
    config: &'a KernelConfig,
    comm: &'a dyn Communication,
    placement: &'a Placement,
    stats: &'a dyn EventStatistics,
    streams: &'a StreamRegistry,
    node: NodeId,
    ceiling: VirtualTime,
    index: HashMap<ObjectId, usize>,
    runtimes: Vec<Mutex<ObjectRuntime>>,
    events: EventSet,
    gvt: GvtManager,
    counters: KernelCounters,
    /// Set on error or completion: workers stop taking events.
    stopping: AtomicBool,
    /// Set by the manager once it will start no further round: workers exit.
    shutdown: AtomicBool,
    failure: Mutex<Option<KernelError>>,
}

impl<'a> Kernel<'a> {
    fn new(
        dispatcher: &'a TimeWarpDispatcher,
        objects: Vec<(ObjectId, Box<dyn SimObject>, usize)>,
    ) -> Self {
        let config = &dispatcher.config;
        let layout: Vec<(ObjectId, usize)> = objects.iter().map(|(id, _, p)| (*id, *p)).collect();
        let index = layout
            .iter()
            .enumerate()
            .map(|(i, (id, _))| (*id, i))
            .collect();
        let runtimes = objects
            .into_iter()
            .map(|(id, object, _)| Mutex::new(ObjectRuntime::new(id, object, config.checkpoint)))
            .collect();
        Kernel {
            config,
            comm: dispatcher.comm.as_ref(),
            placement: &dispatcher.placement,
            stats: dispatcher.stats.as_ref(),
            streams: dispatcher.streams.as_ref(),
            node: dispatcher.comm.node_id(),
            ceiling: config.max_sim_time,
            index,
            runtimes,
            events: EventSet::new(&layout, config.num_schedulers, config.num_worker_threads)
                .with_migration(config.lp_migration),
            gvt: GvtManager::new(
                Arc::clone(&dispatcher.comm),
                config.num_worker_threads,
                config.gvt_period,
            ),
            counters: KernelCounters::new(),
            stopping: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    fn local_index(&self, id: ObjectId) -> KernelResult<usize> {
        self.index
            .get(&id)
            .copied()
            .ok_or(KernelError::UnknownObject(id))
    }

    /// Let every object schedule its initial events.
    fn initialize(&self) -> KernelResult<()> {
        info!(
            node = %self.node,
            objects = self.runtimes.len(),
            workers = self.config.num_worker_threads,
            schedulers = self.config.num_schedulers,
            max_sim_time = %self.ceiling,
            "starting Time Warp simulation"
        );
        for runtime in &self.runtimes {
            let mut rt = runtime.lock();
            let outgoing = rt.initialize(Some(self.streams))?;
            let sent: Vec<EventRef> =
                stamp_sends(rt.id, VirtualTime::ZERO, outgoing, self.ceiling, &mut rt.next_sequence)
                    .into_iter()
                    .map(Arc::new)
                    .collect();
            self.stats.record(rt.id, VirtualTime::ZERO, &sent);
            for event in &sent {
                self.deliver(0, event)?;
            }
        }
        Ok(())
    }

    fn run(&self) {
        thread::scope(|s| {
            for worker in 0..self.config.num_worker_threads {
                s.spawn(move || self.worker(worker));
            }
            self.manager_loop();
        });
    }

    /// First error wins; every later one is only logged.
    fn fail(&self, err: KernelError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            error!(node = %self.node, error = %err, "simulation failed");
            *failure = Some(err);
        } else {
            debug!(node = %self.node, error = %err, "further error after failure");
        }
        drop(failure);
        self.stopping.store(true, Ordering::Release);
        self.comm.abort();
    }

    // ── Workers ───────────────────────────────────────────────────

    fn worker(&self, worker: usize) {
        loop {
            match panic::catch_unwind(AssertUnwindSafe(|| self.worker_loop(worker))) {
                Ok(()) => return,
                // Keep taking part in GVT barriers until shutdown.
                Err(_) => self.fail(KernelError::WorkerPanicked(worker)),
            }
        }
    }

    fn worker_loop(&self, worker: usize) {
        let backoff = self.config.idle_backoff();
        loop {
            if self.gvt.round_pending() {
                let next = self
                    .events
                    .peek_timestamp(worker)
                    .unwrap_or(VirtualTime::INFINITY);
                self.gvt.report_thread_min(worker, next);
                self.gvt.worker_barrier_sync();
                continue;
            }
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            if self.stopping.load(Ordering::Acquire) {
                idle(backoff);
                continue;
            }
            match self.events.next_event(worker) {
                Some(event) => {
                    if let Err(e) = self.process(worker, &event) {
                        self.fail(e);
                    }
                }
                None => idle(backoff),
            }
        }
    }

    /// Execute one event popped by `worker`.
    fn process(&self, worker: usize, event: &EventRef) -> KernelResult<()> {
        let obj = self.local_index(event.receiver)?;
        let mut runtime = self.runtimes[obj].lock();
        let rt = &mut *runtime;

        if self
            .events
            .last_processed(obj)
            .is_some_and(|last| last > *event)
        {
            let rollback = rt.rollback(obj, event, &self.events, self.streams)?;
            self.counters.add_rollback(1);
            self.counters.add_rolled_back(rollback.rolled_back as u64);
            self.counters.add_coast_forward(rollback.coasted as u64);
            self.counters.add_anti_messages(rollback.cancelled.len() as u64);
            for sent in &rollback.cancelled {
                self.deliver(worker, &sent.anti_message(self.gvt.color()))?;
            }
        }

        if event.is_anti() {
            if self.events.cancel(obj, event)? == Cancellation::Annihilated {
                self.counters.add_annihilation(1);
            }
            self.events.start_scheduling(obj);
            return Ok(());
        }

        let now = event.receive_time;
        let mut ctx = ObjectContext::executing(rt.id, event, Some(self.streams));
        rt.object.receive_event(&mut ctx, event)?;
        let outgoing = ctx.into_outgoing();
        rt.after_event(event);

        let source = event.key();
        let sent: Vec<EventRef> = stamp_sends(rt.id, now, outgoing, self.ceiling, &mut rt.next_sequence)
            .into_iter()
            .map(Arc::new)
            .collect();
        for e in &sent {
            rt.outputs.record(source, Arc::clone(e));
        }
        self.stats.record(rt.id, now, &sent);
        self.counters.add_processed(1);
        self.gvt.on_event_processed();

        for e in &sent {
            self.deliver(worker, e)?;
        }
        self.events.replenish(obj);
        Ok(())
    }

    /// Route an event to its receiver, stamped with the current color.
    fn deliver(&self, thread: usize, event: &Event) -> KernelResult<()> {
        let node = self.placement.node_of(event.receiver)?;
        let color = self.gvt.on_send(thread, event.receive_time);
        let event = event.clone().with_color(color);
        if node == self.node {
            self.gvt.on_receive(color);
            self.receive(Arc::new(event))
        } else {
            self.counters.add_remote(1);
            self.comm.send(KernelMessage::event(self.node, node, event))?;
            Ok(())
        }
    }

    /// Insert an arriving event into its receiver's input queue.
    fn receive(&self, event: EventRef) -> KernelResult<()> {
        let obj = self.local_index(event.receiver)?;
        if self.events.insert(obj, event) == Insertion::Annihilated {
            self.counters.add_annihilation(1);
        }
        Ok(())
    }

    // ── Manager ───────────────────────────────────────────────────

    /// Drain this node's inbox.
    fn pump(&self) -> KernelResult<()> {
        while let Some(message) = self.comm.try_recv()? {
            match (message.kind, message.payload) {
                (MessageType::GvtSynchTrigger, _) => self.gvt.receive_trigger(),
                (MessageType::Event, KernelPayload::Event(event)) => {
                    self.gvt.on_receive(event.color);
                    self.receive(Arc::new(event))?;
                }
                (MessageType::Event, KernelPayload::Empty) => {
                    warn!(sender = %message.sender, "event message without an event");
                }
            }
        }
        Ok(())
    }

    fn manager_loop(&self) {
        let backoff = self.config.idle_backoff();
        let mut failed_rounds = 0u32;
        loop {
            if !self.gvt.round_pending() {
                if self.stopping.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = self.pump() {
                    self.fail(e);
                    continue;
                }
                if self.gvt.ready_to_start() {
                    // A failed trigger still leaves the round pending; it
                    // runs below so the workers are released.
                    if let Err(e) = self.gvt.trigger() {
                        self.fail(e);
                    }
                }
                if !self.gvt.round_pending() {
                    idle(backoff);
                    continue;
                }
            }

            match self
                .gvt
                .progress(|| self.pump(), || self.events.lowest_timestamp())
            {
                Ok(RoundOutcome::Completed { previous, gvt }) => {
                    failed_rounds = 0;
                    self.counters.add_gvt_round(1);
                    if gvt > previous {
                        if let Err(e) = self.fossil_collect(gvt) {
                            self.fail(e);
                            continue;
                        }
                    }
                    if gvt > self.ceiling {
                        info!(node = %self.node, %gvt, "GVT passed the end of simulated time");
                        break;
                    }
                }
                Ok(RoundOutcome::Failed(e)) => {
                    self.counters.add_failed_round(1);
                    failed_rounds += 1;
                    if failed_rounds >= MAX_FAILED_ROUNDS || self.stopping.load(Ordering::Acquire) {
                        self.fail(e.into());
                    }
                }
                Err(e) => self.fail(e),
            }
        }
        // No round is pending here and none will be started.
        self.stopping.store(true, Ordering::Release);
        self.shutdown.store(true, Ordering::Release);
    }

    /// Release history below `gvt` and commit stream output before it.
    fn fossil_collect(&self, gvt: VirtualTime) -> KernelResult<()> {
        for (obj, runtime) in self.runtimes.iter().enumerate() {
            runtime.lock().fossil_collect(obj, gvt, &self.events);
        }
        let committed = self.streams.commit(gvt)?;
        trace!(node = %self.node, %gvt, committed, "fossil collection done");
        Ok(())
    }

    // ── Shutdown ──────────────────────────────────────────────────

    fn finish(self, started: Instant) -> KernelResult<SimulationReport> {
        if let Some(err) = self.failure.into_inner() {
            return Err(err);
        }
        self.streams.commit_all()?;

        let end_time = (0..self.runtimes.len())
            .filter_map(|obj| self.events.last_processed(obj))
            .map(|e| e.receive_time)
            .max()
            .unwrap_or(VirtualTime::ZERO);
        let gvt = self.gvt.gvt();
        let counters = self.counters.snapshot();
        let wall_time = started.elapsed();
        info!(
            node = %self.node,
            %gvt,
            %end_time,
            %counters,
            wall_ms = wall_time.as_millis() as u64,
            "Time Warp simulation finished"
        );

        let mut objects: Vec<(ObjectId, Box<dyn SimObject>)> = self
            .runtimes
            .into_iter()
            .map(|runtime| {
                let rt = runtime.into_inner();
                (rt.id, rt.object)
            })
            .collect();
        objects.sort_by_key(|(id, _)| *id);
        Ok(SimulationReport {
            node: self.node,
            gvt,
            end_time,
            counters,
            objects,
            wall_time,
        })
    }
}
