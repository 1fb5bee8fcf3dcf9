//! `RelayObject`: passes tokens around a ring.

use crate::error::KernelResult;
use crate::event::Event;
use crate::object::traits::{downcast_state, ObjectContext, ObjectState, SimObject};
use crate::object::{MessagePayload, ObjectId};
use crate::time::VirtualTime;

use super::hash_combine;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayState {
    /// Tokens received.
    pub tokens_seen: u64,
    /// `(time, token)` of the last token received.
    pub last: Option<(VirtualTime, u64)>,
    pub digest: u64,
}

/// Forwards every token it receives to `next` after a fixed delay.
///
/// Deterministic and cheap, which makes it handy for checking exact event
/// orders and stream output in tests.
#[derive(Debug, Clone)]
pub struct RelayObject {
    pub id: ObjectId,
    pub next: ObjectId,
    hop_delay: u64,
    tokens: u32,
    stream: Option<String>,
    state: RelayState,
}

impl RelayObject {
    pub fn new(id: ObjectId, next: ObjectId, hop_delay: u64) -> Self {
        RelayObject {
            id,
            next,
            hop_delay: hop_delay.max(1),
            tokens: 0,
            stream: None,
            state: RelayState::default(),
        }
    }

    /// Inject `tokens` tokens into the ring at start-up.
    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    /// Log every received token to the named stream.
    pub fn with_stream(mut self, name: impl Into<String>) -> Self {
        self.stream = Some(name.into());
        self
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Build a ring of `n` relays; object `i` forwards to `i + 1`.
    pub fn ring(n: u32, hop_delay: u64) -> Vec<RelayObject> {
        (0..n)
            .map(|i| RelayObject::new(ObjectId::new(i), ObjectId::new((i + 1) % n), hop_delay))
            .collect()
    }
}

impl SimObject for RelayObject {
    fn create_initial_events(&mut self, ctx: &mut ObjectContext<'_>) -> KernelResult<()> {
        for token in 0..self.tokens {
            let token = (u64::from(self.id.raw()) << 32) | u64::from(token);
            ctx.send_after(self.next, self.hop_delay, MessagePayload::Counter(token))?;
        }
        Ok(())
    }

    fn receive_event(&mut self, ctx: &mut ObjectContext<'_>, event: &Event) -> KernelResult<()> {
        let token = match event.payload {
            MessagePayload::Counter(n) => n,
            _ => return Ok(()),
        };
        self.state.tokens_seen += 1;
        self.state.last = Some((ctx.now(), token));
        self.state.digest = hash_combine(
            hash_combine(self.state.digest, ctx.now().ticks()),
            token,
        );
        if let Some(stream) = &self.stream {
            let line = format!("{} {} token={:x}\n", ctx.now().ticks(), self.id, token);
            ctx.write_stream(stream, line.as_bytes())?;
        }
        ctx.send_after(self.next, self.hop_delay, MessagePayload::Counter(token))
    }

    fn clone_state(&self) -> Box<dyn ObjectState> {
        Box::new(self.state.clone())
    }

    fn restore_state(&mut self, state: &dyn ObjectState) {
        if let Some(s) = downcast_state::<RelayState>(state) {
            self.state = s.clone();
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_wiring() {
        let ring = RelayObject::ring(3, 2);
        assert_eq!(ring[0].next, ObjectId::new(1));
        assert_eq!(ring[2].next, ObjectId::new(0));
    }

    #[test]
    fn test_forwards_token() {
        let mut relay = RelayObject::new(ObjectId::new(1), ObjectId::new(2), 4);
        let event = Event::positive(
            ObjectId::new(0),
            ObjectId::new(1),
            VirtualTime::new(2),
            VirtualTime::new(6),
            0,
            MessagePayload::Counter(77),
        );
        let mut ctx = ObjectContext::executing(relay.id, &event, None);
        relay.receive_event(&mut ctx, &event).unwrap();
        let sends = ctx.into_outgoing();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].receiver, ObjectId::new(2));
        assert_eq!(sends[0].receive_time, VirtualTime::new(10));
        assert_eq!(relay.state().last, Some((VirtualTime::new(6), 77)));
    }

    #[test]
    fn test_ignores_non_token_payload() {
        let mut relay = RelayObject::new(ObjectId::new(0), ObjectId::new(0), 1);
        let event = Event::positive(
            ObjectId::new(3),
            ObjectId::new(0),
            VirtualTime::ZERO,
            VirtualTime::new(1),
            0,
            MessagePayload::Text("hello".into()),
        );
        let mut ctx = ObjectContext::executing(relay.id, &event, None);
        relay.receive_event(&mut ctx, &event).unwrap();
        assert!(ctx.pending_sends().is_empty());
        assert_eq!(relay.state().tokens_seen, 0);
    }
}
