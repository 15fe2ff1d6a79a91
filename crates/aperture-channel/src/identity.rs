//! Channel identity: where the channel's instance block lives and which
//! doorbell rings it.

use thiserror::Error;

/// Instance blocks must sit on a 4 KiB boundary.
pub const INSTANCE_ALIGN: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("instance block address {address:#x} is not 4 KiB aligned")]
    MisalignedInstance { address: u64 },

    #[error("instance block address must be nonzero")]
    NullInstance,

    #[error("unknown aperture kind {found}")]
    BadAperture { found: u8 },

    #[error("channel id {id} out of range for a doorbell token")]
    IdOutOfRange { id: u32 },

    #[error("runlist {runlist} out of range for a doorbell token")]
    RunlistOutOfRange { runlist: u32 },
}

/// Memory aperture the instance block (and ring, if any) lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApertureKind {
    VidMem = 0,
    SysMemCoherent = 1,
    SysMemNonCoherent = 2,
}

impl ApertureKind {
    pub fn from_wire(raw: u8) -> Result<Self, IdentityError> {
        match raw {
            0 => Ok(Self::VidMem),
            1 => Ok(Self::SysMemCoherent),
            2 => Ok(Self::SysMemNonCoherent),
            found => Err(IdentityError::BadAperture { found }),
        }
    }
}

/// Validated instance-block descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceBlock {
    pub aperture: ApertureKind,
    pub address: u64,
}

impl InstanceBlock {
    pub fn new(aperture: ApertureKind, address: u64) -> Result<Self, IdentityError> {
        if address == 0 {
            return Err(IdentityError::NullInstance);
        }
        if address % INSTANCE_ALIGN != 0 {
            return Err(IdentityError::MisalignedInstance { address });
        }
        Ok(Self { aperture, address })
    }
}

/// Token the producer writes to the doorbell page to kick a channel:
/// runlist in the high half, channel id in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoorbellToken(u32);

impl DoorbellToken {
    pub fn new(runlist: u32, chan_id: u32) -> Result<Self, IdentityError> {
        if chan_id > 0xffff {
            return Err(IdentityError::IdOutOfRange { id: chan_id });
        }
        if runlist > 0xffff {
            return Err(IdentityError::RunlistOutOfRange { runlist });
        }
        Ok(Self((runlist << 16) | chan_id))
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Identity record carried by every channel. `chan_id` is unique within its
/// runlist; the group enforces that at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelIdentity {
    pub runlist: u32,
    pub chan_id: u32,
    pub instance: InstanceBlock,
    pub doorbell: DoorbellToken,
}

impl ChannelIdentity {
    pub fn new(
        runlist: u32,
        chan_id: u32,
        instance: InstanceBlock,
    ) -> Result<Self, IdentityError> {
        Ok(Self {
            runlist,
            chan_id,
            instance,
            doorbell: DoorbellToken::new(runlist, chan_id)?,
        })
    }

    /// Wire form of the identity, for the channel's identity-query method.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(21);
        out.extend_from_slice(&self.chan_id.to_le_bytes());
        out.extend_from_slice(&self.runlist.to_le_bytes());
        out.extend_from_slice(&self.doorbell.raw().to_le_bytes());
        out.push(self.instance.aperture as u8);
        out.extend_from_slice(&self.instance.address.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn instance_block_rejects_bad_addresses() {
        assert_eq!(
            InstanceBlock::new(ApertureKind::VidMem, 0).unwrap_err(),
            IdentityError::NullInstance
        );
        assert_eq!(
            InstanceBlock::new(ApertureKind::VidMem, 0x1234).unwrap_err(),
            IdentityError::MisalignedInstance { address: 0x1234 }
        );
        InstanceBlock::new(ApertureKind::SysMemCoherent, 0x4000).unwrap();
    }

    #[test]
    fn doorbell_packs_runlist_and_channel() {
        let token = DoorbellToken::new(3, 0x120).unwrap();
        assert_eq!(token.raw(), 0x0003_0120);

        assert_eq!(
            DoorbellToken::new(0, 0x1_0000).unwrap_err(),
            IdentityError::IdOutOfRange { id: 0x1_0000 }
        );
        assert_eq!(
            DoorbellToken::new(0x1_0000, 0).unwrap_err(),
            IdentityError::RunlistOutOfRange { runlist: 0x1_0000 }
        );
    }

    #[test]
    fn identity_encodes_stably() {
        let identity = ChannelIdentity::new(
            1,
            7,
            InstanceBlock::new(ApertureKind::VidMem, 0x2000).unwrap(),
        )
        .unwrap();
        let wire = identity.encode();
        assert_eq!(wire.len(), 21);
        assert_eq!(&wire[0..4], &7u32.to_le_bytes());
        assert_eq!(&wire[4..8], &1u32.to_le_bytes());
        assert_eq!(&wire[8..12], &0x0001_0007u32.to_le_bytes());
        assert_eq!(wire[12], 0);
        assert_eq!(&wire[13..21], &0x2000u64.to_le_bytes());
    }
}
