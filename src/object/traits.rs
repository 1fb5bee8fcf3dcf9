//! `SimObject` and `ObjectState` traits, and the `ObjectContext` handed to
//! event handlers.

use std::any::Any;
use std::fmt::Debug;

use crate::error::{KernelError, KernelResult};
use crate::event::{Event, EventKey};
use crate::stream::StreamRegistry;
use crate::time::VirtualTime;

use super::id::ObjectId;
use super::payload::MessagePayload;

// ── ObjectState ───────────────────────────────────────────────────────

/// A snapshot of an object's mutable state.
///
/// Implemented automatically for every `Clone + Debug + Send + 'static`
/// type, so a model only has to derive `Clone` on its state struct.
pub trait ObjectState: Any + Send + Debug {
    /// Deep copy; the copy shares nothing with `self`.
    fn clone_boxed(&self) -> Box<dyn ObjectState>;

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;
}

impl<T> ObjectState for T
where
    T: Any + Send + Clone + Debug,
{
    fn clone_boxed(&self) -> Box<dyn ObjectState> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Borrow a snapshot as its concrete type.
pub fn downcast_state<T: ObjectState>(state: &dyn ObjectState) -> Option<&T> {
    state.as_any().downcast_ref::<T>()
}

// ── SimObject ─────────────────────────────────────────────────────────

/// Trait implemented by every simulated object.
///
/// # Contract
///
/// Implementations **must**:
/// - Keep all mutable state behind `clone_state`/`restore_state`. Anything
///   not captured there survives a rollback and breaks determinism.
/// - Route all side effects through `ctx`.
/// - Be deterministic for equal inputs.
///
/// # Example
///
/// ```rust
/// use warpkernel::event::Event;
/// use warpkernel::error::KernelResult;
/// use warpkernel::object::{downcast_state, ObjectContext, ObjectState, SimObject};
///
/// #[derive(Debug, Clone, Default)]
/// struct Counter { seen: u64 }
///
/// struct CounterObject { state: Counter }
///
/// impl SimObject for CounterObject {
///     fn receive_event(&mut self, _ctx: &mut ObjectContext<'_>, _event: &Event) -> KernelResult<()> {
///         self.state.seen += 1;
///         Ok(())
///     }
///     fn clone_state(&self) -> Box<dyn ObjectState> { Box::new(self.state.clone()) }
///     fn restore_state(&mut self, state: &dyn ObjectState) {
///         if let Some(s) = downcast_state::<Counter>(state) { self.state = s.clone(); }
///     }
///     fn as_any(&self) -> &dyn std::any::Any { self }
/// }
/// ```
pub trait SimObject: Send {
    /// Send the events that start the simulation. Called once, at time zero.
    fn create_initial_events(&mut self, ctx: &mut ObjectContext<'_>) -> KernelResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// React to a dispatched event.
    fn receive_event(&mut self, ctx: &mut ObjectContext<'_>, event: &Event) -> KernelResult<()>;

    /// Snapshot the current state.
    fn clone_state(&self) -> Box<dyn ObjectState>;

    /// Overwrite the current state with `state`, previously produced by
    /// `clone_state` on this object.
    fn restore_state(&mut self, state: &dyn ObjectState);

    /// Downcast support, used by `SimulationReport::object::<T>()`.
    fn as_any(&self) -> &dyn Any;
}

// ── ObjectContext ─────────────────────────────────────────────────────

/// A send requested by an event handler, not yet stamped by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub receiver: ObjectId,
    pub receive_time: VirtualTime,
    pub payload: MessagePayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Initial,
    Execute,
    Replay,
}

/// Handle given to an object while one of its handlers runs.
///
/// Sends are buffered here and handed to the kernel when the handler
/// returns. While the kernel replays history after a rollback (coast
/// forward) the context swallows sends and stream writes, since their
/// effects already happened the first time round.
pub struct ObjectContext<'a> {
    id: ObjectId,
    now: VirtualTime,
    source: Option<EventKey>,
    mode: Mode,
    streams: Option<&'a StreamRegistry>,
    outgoing: Vec<Outgoing>,
}

impl<'a> ObjectContext<'a> {
    /// Context for `create_initial_events`.
    pub fn initial(id: ObjectId, streams: Option<&'a StreamRegistry>) -> Self {
        ObjectContext {
            id,
            now: VirtualTime::ZERO,
            source: None,
            mode: Mode::Initial,
            streams,
            outgoing: Vec::new(),
        }
    }

    /// Context for executing `event`.
    pub fn executing(id: ObjectId, event: &Event, streams: Option<&'a StreamRegistry>) -> Self {
        ObjectContext {
            id,
            now: event.receive_time,
            source: Some(event.key()),
            mode: Mode::Execute,
            streams,
            outgoing: Vec::new(),
        }
    }

    /// Context for re-executing `event` during coast forward.
    pub fn replaying(id: ObjectId, event: &Event) -> Self {
        ObjectContext {
            id,
            now: event.receive_time,
            source: Some(event.key()),
            mode: Mode::Replay,
            streams: None,
            outgoing: Vec::new(),
        }
    }

    /// The object this handler runs for.
    #[inline]
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Current local virtual time.
    #[inline]
    pub fn now(&self) -> VirtualTime {
        self.now
    }

    /// Whether the kernel is replaying history.
    pub fn is_replaying(&self) -> bool {
        self.mode == Mode::Replay
    }

    /// Send `payload` to `to`, arriving at absolute time `at`.
    ///
    /// Initial events may be sent at time zero; every other send must land
    /// strictly after [`now`](Self::now).
    pub fn send_at(
        &mut self,
        to: ObjectId,
        at: VirtualTime,
        payload: MessagePayload,
    ) -> KernelResult<()> {
        let causal = match self.mode {
            Mode::Initial => at >= self.now,
            Mode::Execute | Mode::Replay => at > self.now,
        };
        if !causal || at.is_infinite() {
            return Err(KernelError::NonCausalEvent {
                requested: at,
                current: self.now,
            });
        }
        if self.mode != Mode::Replay {
            self.outgoing.push(Outgoing {
                receiver: to,
                receive_time: at,
                payload,
            });
        }
        Ok(())
    }

    /// Send `payload` to `to`, arriving `delay` ticks from now.
    pub fn send_after(
        &mut self,
        to: ObjectId,
        delay: u64,
        payload: MessagePayload,
    ) -> KernelResult<()> {
        let at = self.now.plus(delay).ok_or(KernelError::TimeOverflow {
            base: self.now,
            delay,
        })?;
        self.send_at(to, at, payload)
    }

    /// Append `bytes` to the named output stream.
    ///
    /// Optimistic runs hold the bytes back until GVT passes `now`, and drop
    /// them if this execution is rolled back. Without a registry the write
    /// is a no-op.
    pub fn write_stream(&mut self, name: &str, bytes: &[u8]) -> KernelResult<()> {
        if self.mode == Mode::Replay {
            return Ok(());
        }
        match self.streams {
            Some(registry) => registry
                .stream(name)?
                .write(self.id, self.source, self.now, bytes),
            None => Ok(()),
        }
    }

    /// Sends buffered so far.
    pub fn pending_sends(&self) -> &[Outgoing] {
        &self.outgoing
    }

    /// Consume the context, returning its buffered sends.
    pub fn into_outgoing(self) -> Vec<Outgoing> {
        self.outgoing
    }
}
