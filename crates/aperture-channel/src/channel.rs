//! The channel object: a push ring, an identity record and a kill state,
//! dispatched as a broker object.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aperture_broker::{ApiError, NotifySource, ObjectImpl, Result};
use aperture_ring::{PushRing, RingError};
use bitflags::bitflags;
use tracing::{debug, trace};

use crate::engine::{ChannelGroup, EngineId};
use crate::identity::ChannelIdentity;

bitflags! {
    /// Event type bits a channel publishes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelEvents: u32 {
        /// The device reported the channel errored; the channel is dead.
        const KILLED = 1 << 0;
    }
}

/// Kill state shared between a channel and the device's fault-reporting
/// path. Tripping is one-way and publishes the kill event exactly once.
pub struct ChannelFault {
    killed: AtomicBool,
    notify: Arc<NotifySource>,
}

impl Default for ChannelFault {
    fn default() -> Self {
        Self {
            killed: AtomicBool::new(false),
            notify: NotifySource::new("channel"),
        }
    }
}

impl ChannelFault {
    pub fn trip(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            debug!("channel killed by device");
            self.notify.notify(ChannelEvents::KILLED.bits(), &[]);
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn notify_source(&self) -> Arc<NotifySource> {
        self.notify.clone()
    }
}

impl std::fmt::Debug for ChannelFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelFault")
            .field("killed", &self.is_tripped())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Constructed, no ring attached (PIO-only channel).
    Created,
    /// Ring attached, hardware armed, nothing kicked yet.
    Bound,
    /// At least one kick published.
    Running,
    /// Terminal: the device reported the channel errored.
    Killed,
    /// Terminal: torn down through DEL.
    Removed,
}

/// A command channel. Single producer: the owning caller serializes ring
/// access, which the broker's per-client lock already guarantees for
/// method-driven use.
pub struct Channel {
    identity: ChannelIdentity,
    group: Arc<ChannelGroup>,
    ring: Option<PushRing>,
    engines: Vec<EngineId>,
    fault: Arc<ChannelFault>,
    phase: ChannelState,
    removed: bool,
}

impl Channel {
    pub const MTHD_KICK: u8 = 1;
    pub const MTHD_IDENTITY: u8 = 2;
    pub const MTHD_FREE_SPACE: u8 = 3;
    pub const MTHD_APPEND: u8 = 4;
    pub const MTHD_RESERVE: u8 = 5;

    /// Admit the identity into `group`, bind `engines`, attach the ring.
    ///
    /// Any failure rolls back the admissions and bindings already made;
    /// a half-constructed channel never stays registered anywhere.
    pub fn new(
        group: Arc<ChannelGroup>,
        identity: ChannelIdentity,
        ring: Option<PushRing>,
        engines: Vec<EngineId>,
    ) -> Result<Self> {
        let key = (identity.runlist, identity.chan_id);
        let fault = group.admit(key)?;

        let mut bound = Vec::new();
        for &engine in &engines {
            if let Err(err) = group.bind(key, engine) {
                for &undo in &bound {
                    group.unbind(key, undo);
                }
                group.evict(key);
                return Err(err);
            }
            bound.push(engine);
        }

        let phase = if ring.is_some() {
            ChannelState::Bound
        } else {
            ChannelState::Created
        };
        debug!(
            runlist = identity.runlist,
            chan = identity.chan_id,
            engines = engines.len(),
            ring = ring.is_some(),
            "channel constructed"
        );
        Ok(Self {
            identity,
            group,
            ring,
            engines,
            fault,
            phase,
            removed: false,
        })
    }

    pub fn identity(&self) -> &ChannelIdentity {
        &self.identity
    }

    pub fn state(&self) -> ChannelState {
        if self.removed {
            ChannelState::Removed
        } else if self.fault.is_tripped() {
            ChannelState::Killed
        } else {
            self.phase
        }
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state() {
            ChannelState::Killed => Err(ApiError::Fatal("channel was killed by the device")),
            ChannelState::Removed => Err(ApiError::NotFound("channel already removed")),
            _ => Ok(()),
        }
    }

    fn ring_mut(&mut self) -> Result<&mut PushRing> {
        self.ring
            .as_mut()
            .ok_or(ApiError::NotSupported("channel has no push ring"))
    }

    /// Make room for a `size`-word command on the ring.
    pub fn reserve(&mut self, size: usize) -> Result<()> {
        self.ensure_live()?;
        self.ring_mut()?.reserve(size).map_err(ring_timeout)
    }

    /// Reserve space for `words` and copy them at the producer cursor. The
    /// words become device-visible at the next [`kick`].
    ///
    /// [`kick`]: Channel::kick
    pub fn append(&mut self, words: &[u32]) -> Result<()> {
        self.ensure_live()?;
        let ring = self.ring_mut()?;
        ring.reserve(words.len()).map_err(ring_timeout)?;
        ring.append(words);
        Ok(())
    }

    /// Ring the doorbell: publish everything appended since the last kick.
    pub fn kick(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.ring_mut()?.kick();
        if self.phase == ChannelState::Bound {
            self.phase = ChannelState::Running;
            trace!(chan = self.identity.chan_id, "channel running");
        }
        Ok(())
    }

    pub fn free_space(&self) -> Result<usize> {
        self.ensure_live()?;
        let ring = self
            .ring
            .as_ref()
            .ok_or(ApiError::NotSupported("channel has no push ring"))?;
        Ok(ring.free_space())
    }
}

fn ring_timeout(err: RingError) -> ApiError {
    match err {
        RingError::Timeout { .. } => ApiError::Timeout("ring space wait expired"),
    }
}

fn decode_words(payload: &[u8]) -> Result<Vec<u32>> {
    if payload.len() % 4 != 0 {
        return Err(ApiError::NotSupported("command payload not word-aligned"));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}

fn decode_u32(payload: &[u8]) -> Result<u32> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(ApiError::NotSupported("malformed method payload"))?;
    Ok(u32::from_le_bytes(bytes))
}

impl ObjectImpl for Channel {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn fini(&mut self, suspend: bool) {
        // Flush whatever the producer already appended so a suspend does
        // not strand half a command batch.
        if suspend && self.ensure_live().is_ok() {
            if let Some(ring) = self.ring.as_mut() {
                ring.kick();
            }
        }
    }

    fn destroy(&mut self) {
        let key = (self.identity.runlist, self.identity.chan_id);
        for &engine in &self.engines {
            self.group.unbind(key, engine);
        }
        self.group.evict(key);
        self.removed = true;
        debug!(
            runlist = key.0,
            chan = key.1,
            "channel removed"
        );
    }

    fn mthd(&mut self, method: u8, payload: &[u8]) -> Result<Vec<u8>> {
        match method {
            Self::MTHD_KICK => {
                self.kick()?;
                Ok(Vec::new())
            }
            Self::MTHD_IDENTITY => Ok(self.identity.encode()),
            Self::MTHD_FREE_SPACE => {
                let free = self.free_space()? as u32;
                Ok(free.to_le_bytes().to_vec())
            }
            Self::MTHD_APPEND => {
                let words = decode_words(payload)?;
                self.append(&words)?;
                Ok(Vec::new())
            }
            Self::MTHD_RESERVE => {
                let size = decode_u32(payload)?;
                self.reserve(size as usize)?;
                Ok(Vec::new())
            }
            _ => Err(ApiError::NotSupported("unknown channel method")),
        }
    }

    fn notify_source(&self) -> Option<Arc<NotifySource>> {
        Some(self.fault.notify_source())
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("engines", &self.engines)
            .finish_non_exhaustive()
    }
}
