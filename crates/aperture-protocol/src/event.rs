//! Event subscription / delivery ABI.
//!
//! A subscription request carries the protocol version and a bit-mask of the
//! event types the caller is interested in. Every delivery is prefixed with
//! the same `{version, types}` pair so the caller can demultiplex by type bit
//! before looking at the resource-specific remainder.

use crate::envelope::{DecodeError, SUPPORTED_VERSION};

/// Fixed size of both [`EventRequest`] and [`EventPrefix`] on the wire.
pub const EVENT_REQUEST_BYTES: usize = 5;

/// Subscription payload for the synthetic event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRequest {
    pub version: u8,
    /// Bit-mask of event types to deliver; resource-specific bit meanings.
    pub types: u32,
}

impl EventRequest {
    pub fn new(types: u32) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            types,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EVENT_REQUEST_BYTES);
        out.push(self.version);
        out.extend_from_slice(&self.types.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < EVENT_REQUEST_BYTES {
            return Err(DecodeError::Truncated {
                need: EVENT_REQUEST_BYTES,
                have: buf.len(),
            });
        }
        let version = buf[0];
        if version != SUPPORTED_VERSION {
            return Err(DecodeError::BadVersion { found: version });
        }
        Ok(Self {
            version,
            types: u32::from_le_bytes(buf[1..5].try_into().unwrap()),
        })
    }
}

/// Delivery prefix mirroring the subscription request.
///
/// `types` carries only the bits that actually fired for this occurrence
/// (always a subset of the subscribed mask).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPrefix {
    pub version: u8,
    pub types: u32,
}

impl EventPrefix {
    pub fn encode(&self) -> [u8; EVENT_REQUEST_BYTES] {
        let mut out = [0u8; EVENT_REQUEST_BYTES];
        out[0] = self.version;
        out[1..5].copy_from_slice(&self.types.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < EVENT_REQUEST_BYTES {
            return Err(DecodeError::Truncated {
                need: EVENT_REQUEST_BYTES,
                have: buf.len(),
            });
        }
        Ok(Self {
            version: buf[0],
            types: u32::from_le_bytes(buf[1..5].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_round_trips() {
        let req = EventRequest::new(0b1010);
        assert_eq!(EventRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn request_rejects_foreign_version() {
        let mut bytes = EventRequest::new(1).encode();
        bytes[0] = 2;
        assert_eq!(
            EventRequest::decode(&bytes).unwrap_err(),
            DecodeError::BadVersion { found: 2 }
        );
    }

    #[test]
    fn prefix_mirrors_request_layout() {
        let req = EventRequest::new(0xAABB_CCDD);
        let prefix = EventPrefix {
            version: req.version,
            types: req.types,
        };
        assert_eq!(prefix.encode().as_slice(), req.encode().as_slice());
    }
}
