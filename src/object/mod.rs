//! Simulation objects: the application-facing half of the kernel.
//!
//! Objects own private state, never share memory, and interact only by
//! sending timestamped events through an [`ObjectContext`]. The kernel may
//! execute an object speculatively and later roll it back, so every object
//! must be able to snapshot and restore its state on demand.
//!
//! # Module structure
//!
//! | Sub-module | Contents |
//! |---|---|
//! | [`id`] | [`ObjectId`], [`NodeId`] newtypes |
//! | [`payload`] | [`MessagePayload`] |
//! | [`traits`] | [`SimObject`], [`ObjectState`], [`ObjectContext`] |
//! | [`rng`] | [`DeterministicRng`] for reproducible models |
//! | [`builtin`] | [`PholdObject`], [`RelayObject`] |

pub mod builtin;
pub mod id;
pub mod payload;
pub mod rng;
pub mod traits;

pub use builtin::{PholdObject, RelayObject};
pub use id::{NodeId, ObjectId};
pub use payload::MessagePayload;
pub use rng::DeterministicRng;
pub use traits::{downcast_state, ObjectContext, ObjectState, Outgoing, SimObject};
