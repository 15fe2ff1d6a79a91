//! Broker class registrations: DEVICE, CHANNEL_GROUP and CHANNEL, so the
//! whole channel lifecycle runs through `submit()`.

use std::sync::{Arc, Mutex};

use aperture_broker::{ApiError, ClassRegistry, NotifySource, ObjectImpl, Result};
use aperture_ring::{PushRing, RingConsumer};
use tracing::debug;

use crate::channel::Channel;
use crate::engine::{ChannelGroup, EngineId, EngineOps};
use crate::identity::{ApertureKind, ChannelIdentity, InstanceBlock};

pub const DEVICE_CLASS: i32 = 0x0080;
pub const CHANNEL_GROUP_CLASS: i32 = 0x0240;
pub const CHANNEL_CLASS: i32 = 0x026f;

const DEVICE_SCLASSES: [i32; 2] = [CHANNEL_GROUP_CLASS, CHANNEL_CLASS];
const GROUP_SCLASSES: [i32; 1] = [CHANNEL_CLASS];

/// Supplies the hardware-facing side of each new channel's ring.
pub type ConsumerFactory = Box<dyn Fn(&ChannelIdentity) -> Box<dyn RingConsumer> + Send + Sync>;

/// The device half the broker objects talk to: engine hooks, channel
/// groups, ring consumers and the device-level notify source.
pub struct DeviceBackend {
    ops: Arc<dyn EngineOps>,
    notify: Arc<NotifySource>,
    consumers: ConsumerFactory,
    /// Default group plus every group constructed over the protocol; the
    /// fault-reporting path searches them all.
    groups: Mutex<Vec<Arc<ChannelGroup>>>,
}

impl DeviceBackend {
    pub fn new(ops: Arc<dyn EngineOps>, consumers: ConsumerFactory) -> Arc<Self> {
        let default_group = ChannelGroup::new(ops.clone());
        Arc::new(Self {
            ops,
            notify: NotifySource::new("device"),
            consumers,
            groups: Mutex::new(vec![default_group]),
        })
    }

    /// Group channels constructed directly under the device land in.
    pub fn default_group(&self) -> Arc<ChannelGroup> {
        self.groups.lock().unwrap()[0].clone()
    }

    pub fn notify(&self) -> &Arc<NotifySource> {
        &self.notify
    }

    fn new_group(&self) -> Arc<ChannelGroup> {
        let group = ChannelGroup::new(self.ops.clone());
        self.groups.lock().unwrap().push(group.clone());
        group
    }

    /// Device fault path: mark a channel killed wherever it lives. Returns
    /// false if no admitted channel matches.
    pub fn kill_channel(&self, runlist: u32, chan_id: u32) -> bool {
        let groups = self.groups.lock().unwrap().clone();
        let killed = groups.iter().any(|g| g.kill((runlist, chan_id)));
        if !killed {
            debug!(runlist, chan_id, "kill report for unknown channel");
        }
        killed
    }
}

impl std::fmt::Debug for DeviceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBackend")
            .field("groups", &self.groups.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

struct Device {
    backend: Arc<DeviceBackend>,
}

impl ObjectImpl for Device {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn sclasses(&self) -> &[i32] {
        &DEVICE_SCLASSES
    }
    fn notify_source(&self) -> Option<Arc<NotifySource>> {
        Some(self.backend.notify.clone())
    }
}

struct GroupObject {
    group: Arc<ChannelGroup>,
    backend: Arc<DeviceBackend>,
}

impl ObjectImpl for GroupObject {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
    fn sclasses(&self) -> &[i32] {
        &GROUP_SCLASSES
    }
}

/// Construction arguments of a CHANNEL object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelParams {
    pub runlist: u32,
    pub chan_id: u32,
    /// Ring capacity in words; 0 makes a PIO-only channel with no ring.
    pub ring_words: u32,
    pub aperture: ApertureKind,
    pub instance_address: u64,
    pub engines: Vec<EngineId>,
}

impl ChannelParams {
    const FIXED_BYTES: usize = 22;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_BYTES + self.engines.len() * 4);
        out.extend_from_slice(&self.runlist.to_le_bytes());
        out.extend_from_slice(&self.chan_id.to_le_bytes());
        out.extend_from_slice(&self.ring_words.to_le_bytes());
        out.push(self.aperture as u8);
        out.extend_from_slice(&self.instance_address.to_le_bytes());
        out.push(self.engines.len() as u8);
        for engine in &self.engines {
            out.extend_from_slice(&engine.to_le_bytes());
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        const MALFORMED: ApiError = ApiError::NotSupported("malformed channel parameters");
        if buf.len() < Self::FIXED_BYTES {
            return Err(MALFORMED);
        }
        let runlist = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let chan_id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let ring_words = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let aperture = ApertureKind::from_wire(buf[12])
            .map_err(|_| ApiError::NotSupported("unknown aperture kind"))?;
        let instance_address = u64::from_le_bytes(buf[13..21].try_into().unwrap());
        let engine_count = buf[21] as usize;
        let tail = &buf[Self::FIXED_BYTES..];
        if tail.len() != engine_count * 4 {
            return Err(MALFORMED);
        }
        let engines = tail
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        Ok(Self {
            runlist,
            chan_id,
            ring_words,
            aperture,
            instance_address,
            engines,
        })
    }
}

/// Register the device, group and channel classes against `backend`.
pub fn register(registry: &mut ClassRegistry, backend: &Arc<DeviceBackend>) {
    let b = backend.clone();
    registry.register(
        DEVICE_CLASS,
        Box::new(move |_ctx| {
            Ok(Box::new(Device { backend: b.clone() }) as Box<dyn ObjectImpl>)
        }),
    );

    registry.register(
        CHANNEL_GROUP_CLASS,
        Box::new(move |ctx| {
            let device = ctx
                .parent
                .as_any()
                .downcast_ref::<Device>()
                .ok_or(ApiError::NotSupported("group parent must be a device"))?;
            let backend = device.backend.clone();
            Ok(Box::new(GroupObject {
                group: backend.new_group(),
                backend,
            }) as Box<dyn ObjectImpl>)
        }),
    );

    registry.register(
        CHANNEL_CLASS,
        Box::new(move |ctx| {
            let params = ChannelParams::decode(ctx.class_payload)?;
            let (group, backend) = channel_home(&*ctx.parent)?;

            let instance = InstanceBlock::new(params.aperture, params.instance_address)
                .map_err(|_| ApiError::NotSupported("invalid instance block"))?;
            let identity = ChannelIdentity::new(params.runlist, params.chan_id, instance)
                .map_err(|_| ApiError::NotSupported("invalid channel identity"))?;

            let ring = if params.ring_words > 0 {
                Some(PushRing::new(
                    params.ring_words as usize,
                    (backend.consumers)(&identity),
                ))
            } else {
                None
            };
            let channel = Channel::new(group, identity, ring, params.engines)?;
            Ok(Box::new(channel) as Box<dyn ObjectImpl>)
        }),
    );
}

fn channel_home(parent: &dyn ObjectImpl) -> Result<(Arc<ChannelGroup>, Arc<DeviceBackend>)> {
    if let Some(device) = parent.as_any().downcast_ref::<Device>() {
        return Ok((device.backend.default_group(), device.backend.clone()));
    }
    if let Some(group) = parent.as_any().downcast_ref::<GroupObject>() {
        return Ok((group.group.clone(), group.backend.clone()));
    }
    Err(ApiError::NotSupported(
        "channel parent must be a device or group",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn channel_params_round_trip() {
        let params = ChannelParams {
            runlist: 1,
            chan_id: 4,
            ring_words: 8192,
            aperture: ApertureKind::SysMemNonCoherent,
            instance_address: 0x20_0000,
            engines: vec![2, 7],
        };
        assert_eq!(ChannelParams::decode(&params.encode()).unwrap(), params);
    }

    #[test]
    fn channel_params_reject_garbage() {
        assert!(ChannelParams::decode(&[0; 10]).is_err());

        let mut wire = ChannelParams {
            runlist: 0,
            chan_id: 1,
            ring_words: 0,
            aperture: ApertureKind::VidMem,
            instance_address: 0x1000,
            engines: vec![3],
        }
        .encode();
        wire.truncate(wire.len() - 2);
        assert!(ChannelParams::decode(&wire).is_err(), "short engine list");

        wire[12] = 0x7f;
        assert!(matches!(
            ChannelParams::decode(&wire),
            Err(ApiError::NotSupported("unknown aperture kind"))
        ));
    }
}
