//! Completion status codes.

/// Result code returned for every broker request.
///
/// `ObjectGone` is the DEL success sentinel: it is deliberately distinct from
/// `Ok` so a transport can tell "the target no longer exists" apart from an
/// ordinary success that may carry payload. Every request kind has a total
/// outcome space drawn from this enum; errors never unwind across the
/// protocol boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    /// Successful DEL; the handle is free for reuse.
    ObjectGone = 1,
    /// Unknown protocol version or request kind.
    NotSupported = 2,
    /// Handle or class lookup miss.
    NotFound = 3,
    /// Resource already claimed (duplicate handle, duplicate subscription).
    Busy = 4,
    /// A bounded hardware-state or ring-space wait expired.
    Timeout = 5,
    /// The hardware reported an unrecoverable condition.
    Fatal = 6,
}

impl Status {
    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Ok),
            1 => Some(Self::ObjectGone),
            2 => Some(Self::NotSupported),
            3 => Some(Self::NotFound),
            4 => Some(Self::Busy),
            5 => Some(Self::Timeout),
            6 => Some(Self::Fatal),
            _ => None,
        }
    }

    /// True for both success sentinels.
    pub fn is_success(self) -> bool {
        matches!(self, Status::Ok | Status::ObjectGone)
    }
}
