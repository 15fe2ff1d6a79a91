//! Channels, channel groups and engine contexts on top of the object
//! broker and the push ring.
//!
//! A channel is a broker object owning an optional command ring and an
//! identity record; groups scope engine-context refcounts to one address
//! space; [`classes::register`] wires the whole lifecycle into a broker
//! class registry so it runs over the standard request protocol.

mod channel;
pub mod classes;
mod engine;
mod identity;

pub use channel::{Channel, ChannelEvents, ChannelFault, ChannelState};
pub use classes::{
    ChannelParams, ConsumerFactory, DeviceBackend, CHANNEL_CLASS, CHANNEL_GROUP_CLASS,
    DEVICE_CLASS,
};
pub use engine::{ChannelGroup, ChannelKey, EngineId, EngineOps};
pub use identity::{
    ApertureKind, ChannelIdentity, DoorbellToken, IdentityError, InstanceBlock, INSTANCE_ALIGN,
};
