//! Wire-stable control protocol for the Aperture object broker.
//!
//! Every request to the broker travels in a small versioned envelope:
//!
//! ```text
//! version:u8  kind:u8  owner:u8  route:u8  token:u64  target_object:u64  payload...
//! ```
//!
//! The envelope is deliberately transport-agnostic: the same bytes work for the
//! in-process transport and for an out-of-process channel. Class ids and method
//! numbers carried in the payloads are resource-specific and opaque here; this
//! crate only knows the framing.
//!
//! All integers are little-endian. Decoding never panics; malformed input maps
//! to [`DecodeError`].

mod envelope;
mod event;
mod status;

pub use envelope::{
    ControlKind, DecodeError, Envelope, MthdPayload, NewPayload, ENVELOPE_HEADER_BYTES,
    SUPPORTED_VERSION,
};
pub use event::{EventPrefix, EventRequest, EVENT_REQUEST_BYTES};
pub use status::Status;
