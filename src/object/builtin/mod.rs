//! Built-in objects: PHOLD and Relay.
//!
//! Reference models used by the tests, the benchmarks-by-hand in the CLI,
//! and as templates for real models.

pub mod phold;
pub mod relay;

pub use phold::{PholdObject, PholdState};
pub use relay::{RelayObject, RelayState};

/// Combine two hashes. Order-sensitive, so a running digest of the events
/// an object saw changes if they arrive in a different order.
pub fn hash_combine(a: u64, b: u64) -> u64 {
    let mut h = a;
    h = h.wrapping_mul(0x517c_c1b7_2722_0a95);
    h = h.wrapping_add(b);
    h ^= h >> 32;
    h
}
