//! Events exchanged between simulated objects.
//!
//! An `Event` is an immutable record: once it is wrapped in an
//! [`EventRef`] and handed to the kernel it is never modified. Cancelling an
//! event produces a second, paired event with [`Polarity::Anti`] instead of
//! touching the original.
//!
//! # Ordering
//!
//! Queues order events by [`EventKey`]:
//! `(receive_time, polarity, sender, sequence)`. Anti-messages sort before
//! positive messages at equal receive time so cancellation is always
//! processed first; `(sender, sequence)` is a stable tie-break that is the
//! same in every run, which keeps optimistic and sequential execution in the
//! same committed order.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::object::{MessagePayload, ObjectId};
use crate::time::VirtualTime;

/// Shared handle to an immutable event.
pub type EventRef = Arc<Event>;

// ── Color ─────────────────────────────────────────────────────────────

/// GVT epoch color stamped on every event at send time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Color {
    White,
    Red,
}

impl Color {
    /// The other color.
    #[inline]
    pub fn flipped(self) -> Color {
        match self {
            Color::White => Color::Red,
            Color::Red => Color::White,
        }
    }

    /// Index into per-color counter arrays.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Color::White => 0,
            Color::Red => 1,
        }
    }

    /// Inverse of [`Color::index`].
    #[inline]
    pub fn from_index(index: usize) -> Color {
        if index == 0 {
            Color::White
        } else {
            Color::Red
        }
    }
}

// ── Polarity ──────────────────────────────────────────────────────────

/// Whether an event is a real message or the cancellation of one.
///
/// The derived order puts `Anti` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum Polarity {
    Anti,
    Positive,
}

// ── EventKey ──────────────────────────────────────────────────────────

/// Total order used by every kernel queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct EventKey {
    pub receive_time: VirtualTime,
    pub polarity: Polarity,
    pub sender: ObjectId,
    pub sequence: u64,
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = match self.polarity {
            Polarity::Anti => '-',
            Polarity::Positive => '+',
        };
        write!(
            f,
            "{}{}#{}@{}",
            sign,
            self.sender,
            self.sequence,
            self.receive_time.ticks()
        )
    }
}

// ── Event ─────────────────────────────────────────────────────────────

/// A single timestamped message between two objects.
///
/// Equality and ordering look only at the [`EventKey`]: two events with the
/// same key are the same message, whatever their color.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Event {
    /// Object that sent the event.
    pub sender: ObjectId,
    /// Object the event is delivered to.
    pub receiver: ObjectId,
    /// Local time of the sender when the event was sent.
    pub send_time: VirtualTime,
    /// Virtual time at which the receiver executes the event.
    pub receive_time: VirtualTime,
    /// Per-sender sequence number; `(sender, sequence)` is unique.
    pub sequence: u64,
    /// GVT epoch color at send time.
    pub color: Color,
    /// Positive message or anti-message.
    pub polarity: Polarity,
    /// Application payload (always `Empty` on anti-messages).
    pub payload: MessagePayload,
}

impl Event {
    /// Construct a positive event with color `White`.
    pub fn positive(
        sender: ObjectId,
        receiver: ObjectId,
        send_time: VirtualTime,
        receive_time: VirtualTime,
        sequence: u64,
        payload: MessagePayload,
    ) -> Self {
        Event {
            sender,
            receiver,
            send_time,
            receive_time,
            sequence,
            color: Color::White,
            polarity: Polarity::Positive,
            payload,
        }
    }

    /// Return this event restamped with `color`.
    pub fn with_color(mut self, color: Color) -> Self {
        self.color = color;
        self
    }

    /// Build the anti-message that cancels this event.
    pub fn anti_message(&self, color: Color) -> Event {
        Event {
            sender: self.sender,
            receiver: self.receiver,
            send_time: self.send_time,
            receive_time: self.receive_time,
            sequence: self.sequence,
            color,
            polarity: Polarity::Anti,
            payload: MessagePayload::Empty,
        }
    }

    /// The queue ordering key.
    #[inline]
    pub fn key(&self) -> EventKey {
        EventKey {
            receive_time: self.receive_time,
            polarity: self.polarity,
            sender: self.sender,
            sequence: self.sequence,
        }
    }

    /// Receive time, the timestamp every queue is keyed on.
    #[inline]
    pub fn timestamp(&self) -> VirtualTime {
        self.receive_time
    }

    #[inline]
    pub fn is_anti(&self) -> bool {
        self.polarity == Polarity::Anti
    }

    /// The key of this event's opposite-polarity twin.
    pub fn twin_key(&self) -> EventKey {
        let polarity = match self.polarity {
            Polarity::Anti => Polarity::Positive,
            Polarity::Positive => Polarity::Anti,
        };
        EventKey {
            polarity,
            ..self.key()
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Event {}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}→{} {}",
            self.key(),
            self.sender,
            self.receiver,
            self.payload
        )
    }
}
