//! `PholdObject`: the classic PHOLD synthetic workload.
//!
//! Every object starts with a population of events. Each time one arrives
//! the object forwards it to a uniformly random object after a random
//! delay. There is no real work, so the model stresses the kernel:
//! rollbacks, cancellations and GVT all happen constantly.

use crate::error::KernelResult;
use crate::event::Event;
use crate::object::rng::DeterministicRng;
use crate::object::traits::{downcast_state, ObjectContext, ObjectState, SimObject};
use crate::object::{MessagePayload, ObjectId};

use super::hash_combine;

/// Rollback-able state of a [`PholdObject`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PholdState {
    pub rng: DeterministicRng,
    /// Events received.
    pub received: u64,
    /// Order-sensitive digest of `(time, sender, hops)` of every event.
    pub digest: u64,
    /// Largest hop count seen.
    pub max_hops: u64,
}

/// A PHOLD object.
#[derive(Debug, Clone)]
pub struct PholdObject {
    pub id: ObjectId,
    num_objects: u32,
    population: u32,
    mean_delay: u64,
    trace_stream: Option<String>,
    state: PholdState,
}

impl PholdObject {
    /// Object `id` of a model with `num_objects` objects. Every object of
    /// one model should get the same `seed`.
    pub fn new(id: ObjectId, num_objects: u32, seed: u64) -> Self {
        PholdObject {
            id,
            num_objects: num_objects.max(1),
            population: 1,
            mean_delay: 10,
            trace_stream: None,
            state: PholdState {
                rng: DeterministicRng::for_object(seed, id.raw()),
                received: 0,
                digest: u64::from(id.raw()),
                max_hops: 0,
            },
        }
    }

    /// Number of events this object starts with.
    pub fn with_population(mut self, population: u32) -> Self {
        self.population = population;
        self
    }

    /// Mean forwarding delay in ticks (delays are uniform in
    /// `[1, 2 * mean]`).
    pub fn with_mean_delay(mut self, mean: u64) -> Self {
        self.mean_delay = mean.max(1);
        self
    }

    /// Write one line per received event to the named stream.
    pub fn with_trace_stream(mut self, name: impl Into<String>) -> Self {
        self.trace_stream = Some(name.into());
        self
    }

    pub fn state(&self) -> &PholdState {
        &self.state
    }

    /// Draw the next `(target, delay)` pair.
    fn draw(&mut self) -> (ObjectId, u64) {
        let target = self.state.rng.next_range(0, u64::from(self.num_objects));
        let delay = 1 + self.state.rng.next_range(0, 2 * self.mean_delay);
        (ObjectId::new(target as u32), delay)
    }
}

impl SimObject for PholdObject {
    fn create_initial_events(&mut self, ctx: &mut ObjectContext<'_>) -> KernelResult<()> {
        for _ in 0..self.population {
            let (target, delay) = self.draw();
            ctx.send_after(target, delay, MessagePayload::Counter(0))?;
        }
        Ok(())
    }

    fn receive_event(&mut self, ctx: &mut ObjectContext<'_>, event: &Event) -> KernelResult<()> {
        let hops = match event.payload {
            MessagePayload::Counter(n) => n,
            _ => 0,
        };
        self.state.received += 1;
        self.state.max_hops = self.state.max_hops.max(hops);
        let mut h = hash_combine(self.state.digest, event.receive_time.ticks());
        h = hash_combine(h, u64::from(event.sender.raw()));
        self.state.digest = hash_combine(h, hops);

        if let Some(stream) = &self.trace_stream {
            let line = format!("{} {} <- {} hops={}\n", ctx.now().ticks(), self.id, event.sender, hops);
            ctx.write_stream(stream, line.as_bytes())?;
        }

        let (target, delay) = self.draw();
        ctx.send_after(target, delay, MessagePayload::Counter(hops + 1))
    }

    fn clone_state(&self) -> Box<dyn ObjectState> {
        Box::new(self.state.clone())
    }

    fn restore_state(&mut self, state: &dyn ObjectState) {
        if let Some(s) = downcast_state::<PholdState>(state) {
            self.state = s.clone();
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
