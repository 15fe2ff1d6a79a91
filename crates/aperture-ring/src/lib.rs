//! Push-buffer ring used by every command-submitting channel.
//!
//! A [`PushRing`] is a fixed-capacity circular buffer of 32-bit command words
//! with a software producer cursor and a hardware-read consumer cursor:
//!
//! - [`PushRing::reserve`] makes room for a command, winding the producer back
//!   to offset 0 when the tail of the buffer is too short and polling the
//!   hardware `get` cursor (bounded deadline) until enough space has drained.
//! - [`PushRing::append`] copies words at the producer cursor; no hardware
//!   visibility change.
//! - [`PushRing::kick`] publishes the producer cursor as the new hardware
//!   `put`, after running the consumer's flush hook for non-coherent
//!   apertures.
//!
//! The ring is single-producer / single-consumer: the owning channel produces,
//! the device consumes. Concurrent producers must be serialized by the caller.
//!
//! The producer-owned invariant: the circular region `[get, current)` belongs
//! to the consumer and is never overwritten, not even when a reservation times
//! out.

mod consumer;
mod ring;
pub mod sim;

pub use consumer::RingConsumer;
pub use ring::{
    PushRing, RingError, RingStats, POLL_INTERVAL, RESERVE_TIMEOUT, SAFETY_MARGIN_WORDS,
    WIND_MARKER,
};
