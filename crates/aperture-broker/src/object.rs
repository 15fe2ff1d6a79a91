//! Broker object model: the per-class capability vtable and the registry of
//! constructors.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::arena::SlotId;
use crate::error::{ApiError, Result};
use crate::event::NotifySource;

/// Class id of the synthetic event subclass every notification-capable
/// object implicitly enumerates.
pub const EVENT_CLASS_ID: i32 = 0x0079;

/// Capability filter for handle lookups: a found object that does not
/// satisfy the filter reports NotFound, so a wrongly-typed handle is never
/// handed back to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Exposes a notification source (can parent event subscriptions).
    Notify,
    /// Exposes CPU-mappable memory.
    Mappable,
}

/// Per-class capability vtable.
///
/// Default implementations make a method-less leaf object: no constructible
/// subclasses, no notifications, no mappable memory, every method
/// `NotSupported`. Classes override what they implement.
pub trait ObjectImpl: Any + Send {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Power/arm the object after construction (and again on resume).
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Finalize before destruction, or disarm reversibly when `suspend`.
    fn fini(&mut self, _suspend: bool) {}

    /// Last hook before the object is dropped and its slot freed.
    fn destroy(&mut self) {}

    /// Class-specific method dispatch; numbers and payload layout are opaque
    /// to the broker.
    fn mthd(&mut self, _method: u8, _payload: &[u8]) -> Result<Vec<u8>> {
        Err(ApiError::NotSupported("object has no methods"))
    }

    /// Subclasses constructible under this object, in enumeration order.
    /// The synthetic event class is appended by the broker and must not be
    /// listed here.
    fn sclasses(&self) -> &[i32] {
        &[]
    }

    /// Notification source, for objects that publish asynchronous events.
    fn notify_source(&self) -> Option<Arc<NotifySource>> {
        None
    }

    /// Size of the object's CPU-mappable region, if it has one.
    fn map_len(&self) -> Option<u64> {
        None
    }
}

/// Arena entry: object identity and tree links around the class body.
#[derive(Debug)]
pub struct ObjectEntry {
    pub handle: u64,
    pub class_id: i32,
    pub parent: Option<SlotId>,
    pub children: Vec<SlotId>,
    /// Taken while the body is being dispatched into; `None` therefore also
    /// flags re-entrant dispatch.
    pub body: Option<Box<dyn ObjectImpl>>,
}

impl ObjectEntry {
    pub fn new(handle: u64, class_id: i32, body: Option<Box<dyn ObjectImpl>>) -> Self {
        Self {
            handle,
            class_id,
            parent: None,
            children: Vec::new(),
            body,
        }
    }

    pub fn satisfies(&self, capability: Capability) -> bool {
        let Some(body) = self.body.as_ref() else {
            return false;
        };
        match capability {
            Capability::Notify => body.notify_source().is_some(),
            Capability::Mappable => body.map_len().is_some(),
        }
    }
}

impl std::fmt::Debug for dyn ObjectImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<object body>")
    }
}

/// Construction context handed to class constructors.
pub struct CtorCtx<'a> {
    pub client_id: u64,
    /// Handle the new object will be indexed under.
    pub handle: u64,
    pub class_id: i32,
    pub class_payload: &'a [u8],
    /// Body of the parent the object is being constructed under.
    pub parent: &'a mut dyn ObjectImpl,
}

pub type Constructor = Box<dyn Fn(&mut CtorCtx<'_>) -> Result<Box<dyn ObjectImpl>> + Send + Sync>;

/// Flat class-id-keyed constructor table.
///
/// Kept deliberately flat (class id to closure) rather than any inheritance
/// scheme; a class that wants to share construction logic shares a function.
#[derive(Default)]
pub struct ClassRegistry {
    ctors: HashMap<i32, Constructor>,
}

impl ClassRegistry {
    pub fn register(&mut self, class_id: i32, ctor: Constructor) {
        self.ctors.insert(class_id, ctor);
    }

    pub fn construct(&self, ctx: &mut CtorCtx<'_>) -> Result<Box<dyn ObjectImpl>> {
        let ctor = self
            .ctors
            .get(&ctx.class_id)
            .ok_or(ApiError::NotFound("no constructor for class"))?;
        ctor(ctx)
    }

    pub fn knows(&self, class_id: i32) -> bool {
        self.ctors.contains_key(&class_id)
    }
}

impl std::fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.ctors.keys().collect();
        ids.sort();
        f.debug_struct("ClassRegistry").field("classes", &ids).finish()
    }
}
