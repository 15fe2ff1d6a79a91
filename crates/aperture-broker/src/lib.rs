//! Handle-addressed object broker.
//!
//! Clients name every resource by a caller-chosen 64-bit handle. Objects
//! form a tree rooted at the client; the broker dispatches four request
//! kinds over that tree (subclass enumeration, construction, deletion,
//! class methods) and forwards asynchronous notifications back through the
//! client's event sink. Class behavior lives behind [`ObjectImpl`]; the
//! broker itself knows nothing about any particular engine or resource.

mod arena;
mod broker;
mod client;
mod error;
mod event;
mod object;
mod transport;

pub use arena::SlotId;
pub use broker::{Broker, Completion};
pub use client::{Client, ClientRoot, EventSink};
pub use error::{ApiError, Result};
pub use event::{Disposition, EventCallback, EventSubscription, NotifySource};
pub use object::{
    Capability, ClassRegistry, Constructor, CtorCtx, ObjectEntry, ObjectImpl, EVENT_CLASS_ID,
};
pub use transport::{DriverTransport, InProcessTransport};
