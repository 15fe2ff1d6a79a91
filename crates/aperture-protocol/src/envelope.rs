//! Request envelope framing.

/// Protocol version understood by this implementation.
pub const SUPPORTED_VERSION: u8 = 1;

/// Byte size of the fixed envelope header preceding the payload.
pub const ENVELOPE_HEADER_BYTES: usize = 20;

/// The four request kinds the broker dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlKind {
    /// Enumerate the target's constructible subclasses.
    Sclass = 1,
    /// Construct a new child object under the target.
    New = 2,
    /// Finalize and destroy the target.
    Del = 3,
    /// Invoke a class-specific method on the target.
    Mthd = 4,
}

impl ControlKind {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Sclass),
            2 => Some(Self::New),
            3 => Some(Self::Del),
            4 => Some(Self::Mthd),
            _ => None,
        }
    }
}

/// Decode failure for envelopes and their kind-specific payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended before the fixed header (or fixed payload prefix) was complete.
    Truncated { need: usize, have: usize },
    /// The envelope declares a protocol version this implementation does not speak.
    BadVersion { found: u8 },
    /// The envelope declares a request kind outside the known set.
    BadKind { found: u8 },
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::Truncated { need, have } => {
                write!(f, "truncated input: need {need} bytes, have {have}")
            }
            DecodeError::BadVersion { found } => {
                write!(f, "unsupported protocol version {found}")
            }
            DecodeError::BadKind { found } => write!(f, "unknown request kind {found}"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A parsed control request.
///
/// `target_object == 0` addresses the client root. `owner` and `route` are
/// opaque transport demux bytes echoed back in completions; `token` correlates
/// a completion with its request on asynchronous transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub version: u8,
    pub kind: ControlKind,
    pub owner: u8,
    pub route: u8,
    pub token: u64,
    pub target_object: u64,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Convenience constructor for in-process callers; `owner`/`route`/`token`
    /// are zero, which the in-process transport ignores.
    pub fn local(kind: ControlKind, target_object: u64, payload: Vec<u8>) -> Self {
        Self {
            version: SUPPORTED_VERSION,
            kind,
            owner: 0,
            route: 0,
            token: 0,
            target_object,
            payload,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_HEADER_BYTES + self.payload.len());
        out.push(self.version);
        out.push(self.kind as u8);
        out.push(self.owner);
        out.push(self.route);
        out.extend_from_slice(&self.token.to_le_bytes());
        out.extend_from_slice(&self.target_object.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < ENVELOPE_HEADER_BYTES {
            return Err(DecodeError::Truncated {
                need: ENVELOPE_HEADER_BYTES,
                have: buf.len(),
            });
        }

        let version = buf[0];
        if version != SUPPORTED_VERSION {
            return Err(DecodeError::BadVersion { found: version });
        }
        let kind = ControlKind::from_wire(buf[1]).ok_or(DecodeError::BadKind { found: buf[1] })?;

        Ok(Self {
            version,
            kind,
            owner: buf[2],
            route: buf[3],
            token: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            target_object: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
            payload: buf[ENVELOPE_HEADER_BYTES..].to_vec(),
        })
    }
}

/// Payload of a NEW request: the caller-chosen handle for the child, the class
/// to construct, and the class-specific construction arguments.
///
/// The wire handle is 32 bits (spec'd ABI); the broker widens it into its
/// 64-bit handle space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayload {
    pub handle: u32,
    pub class_id: i32,
    pub class_payload: Vec<u8>,
}

impl NewPayload {
    pub const FIXED_BYTES: usize = 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_BYTES + self.class_payload.len());
        out.extend_from_slice(&self.handle.to_le_bytes());
        out.extend_from_slice(&self.class_id.to_le_bytes());
        out.extend_from_slice(&self.class_payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::FIXED_BYTES {
            return Err(DecodeError::Truncated {
                need: Self::FIXED_BYTES,
                have: buf.len(),
            });
        }
        Ok(Self {
            handle: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            class_id: i32::from_le_bytes(buf[4..8].try_into().unwrap()),
            class_payload: buf[Self::FIXED_BYTES..].to_vec(),
        })
    }
}

/// Payload of a MTHD request. Method numbers and argument layout belong to the
/// target class; the broker forwards them untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MthdPayload {
    pub method: u8,
    pub method_payload: Vec<u8>,
}

impl MthdPayload {
    pub const FIXED_BYTES: usize = 1;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_BYTES + self.method_payload.len());
        out.push(self.method);
        out.extend_from_slice(&self.method_payload);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::Truncated {
                need: Self::FIXED_BYTES,
                have: 0,
            });
        }
        Ok(Self {
            method: buf[0],
            method_payload: buf[Self::FIXED_BYTES..].to_vec(),
        })
    }
}
