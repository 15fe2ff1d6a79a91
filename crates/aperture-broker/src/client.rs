//! Per-connection object tree and handle table.
//!
//! Each client owns a generational arena of objects, an index from the
//! caller-chosen 64-bit handle to the arena slot, and an event sink the
//! broker uses to forward asynchronous notifications to whoever opened the
//! connection. Handle 0 always resolves to the client's root object.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use aperture_protocol::EventPrefix;
use tracing::debug;

use crate::arena::{ObjectArena, SlotId};
use crate::error::{ApiError, Result};
use crate::object::{Capability, ObjectEntry, ObjectImpl};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Delivery callback for events: `(subscription_handle, prefix, payload)`.
pub type EventSink = Arc<dyn Fn(u64, EventPrefix, &[u8]) + Send + Sync>;

/// Root object body. Its only job is to enumerate which top-level classes
/// (devices, typically) this connection may construct.
pub struct ClientRoot {
    classes: Vec<i32>,
}

impl ClientRoot {
    pub fn new(classes: Vec<i32>) -> Self {
        Self { classes }
    }
}

impl ObjectImpl for ClientRoot {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn sclasses(&self) -> &[i32] {
        &self.classes
    }
}

pub(crate) struct ClientInner {
    arena: ObjectArena,
    index: HashMap<u64, SlotId>,
    root: SlotId,
}

/// One connection's view of the broker.
pub struct Client {
    id: u64,
    event_sink: EventSink,
    inner: Mutex<ClientInner>,
}

impl Client {
    /// Create a client whose root enumerates `root_classes`. Events on any
    /// of this client's subscriptions are forwarded through `event_sink`.
    pub fn new(root_classes: Vec<i32>, event_sink: EventSink) -> Arc<Self> {
        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let mut arena = ObjectArena::default();
        let root = arena.allocate(ObjectEntry::new(
            0,
            0,
            Some(Box::new(ClientRoot::new(root_classes))),
        ));
        debug!(client = id, "client created");
        Arc::new(Self {
            id,
            event_sink,
            inner: Mutex::new(ClientInner {
                arena,
                index: HashMap::new(),
                root,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_sink(&self) -> EventSink {
        self.event_sink.clone()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ClientInner> {
        self.inner.lock().unwrap()
    }

    /// Number of live objects, excluding the root.
    pub fn live_objects(&self) -> usize {
        self.lock().arena.live() - 1
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("live", &self.lock().arena.live())
            .finish()
    }
}

impl ClientInner {
    pub fn root(&self) -> SlotId {
        self.root
    }

    /// Resolve a wire handle. Handle 0 is the root.
    pub fn resolve(&self, handle: u64) -> Result<SlotId> {
        if handle == 0 {
            return Ok(self.root);
        }
        self.index
            .get(&handle)
            .copied()
            .ok_or(ApiError::NotFound("no such handle"))
    }

    /// Resolve with a capability filter: a live handle whose object does not
    /// satisfy the filter reports `NotFound`, never a wrongly-typed object.
    pub fn resolve_with(&self, handle: u64, capability: Capability) -> Result<SlotId> {
        let slot = self.resolve(handle)?;
        let entry = self.entry(slot)?;
        if !entry.satisfies(capability) {
            return Err(ApiError::NotFound("handle lacks required capability"));
        }
        Ok(slot)
    }

    pub fn entry(&self, slot: SlotId) -> Result<&ObjectEntry> {
        self.arena.get(slot).ok_or(ApiError::NotFound("stale slot"))
    }

    pub fn entry_mut(&mut self, slot: SlotId) -> Result<&mut ObjectEntry> {
        self.arena
            .get_mut(slot)
            .ok_or(ApiError::NotFound("stale slot"))
    }

    /// Take an object's body for dispatch. A body that is already out means
    /// the object is mid-dispatch on this same call stack.
    pub fn take_body(&mut self, slot: SlotId) -> Result<Box<dyn ObjectImpl>> {
        self.entry_mut(slot)?
            .body
            .take()
            .ok_or(ApiError::Busy("object is mid-dispatch"))
    }

    /// Return a body taken by [`take_body`]. The slot may have been freed
    /// while the body was out (delete from inside a method); the body is
    /// then dropped here.
    pub fn put_body(&mut self, slot: SlotId, body: Box<dyn ObjectImpl>) {
        if let Some(entry) = self.arena.get_mut(slot) {
            entry.body = Some(body);
        }
    }

    /// Index and link a fully-built object under `parent`.
    ///
    /// The handle must be unused; a duplicate reports `Busy` and the entry
    /// is handed back to the caller for rollback.
    pub fn insert(
        &mut self,
        parent: SlotId,
        entry: ObjectEntry,
    ) -> std::result::Result<SlotId, (ApiError, ObjectEntry)> {
        if entry.handle == 0 || self.index.contains_key(&entry.handle) {
            return Err((ApiError::Busy("handle already in use"), entry));
        }
        let handle = entry.handle;
        let mut entry = entry;
        entry.parent = Some(parent);
        let slot = self.arena.allocate(entry);
        self.index.insert(handle, slot);
        if let Some(parent_entry) = self.arena.get_mut(parent) {
            parent_entry.children.push(slot);
        }
        Ok(slot)
    }

    /// Unlink and free one object, returning its entry. Idempotent on stale
    /// slots.
    pub fn remove(&mut self, slot: SlotId) -> Option<ObjectEntry> {
        let entry = self.arena.release(slot)?;
        self.index.remove(&entry.handle);
        if let Some(parent) = entry.parent {
            if let Some(parent_entry) = self.arena.get_mut(parent) {
                parent_entry.children.retain(|&c| c != slot);
            }
        }
        Some(entry)
    }

    /// Subtree rooted at `start`, parents before children.
    pub fn collect_subtree(&self, start: SlotId) -> Vec<SlotId> {
        let mut out = Vec::new();
        let mut stack = vec![start];
        while let Some(slot) = stack.pop() {
            if let Some(entry) = self.arena.get(slot) {
                out.push(slot);
                stack.extend(entry.children.iter().copied());
            }
        }
        out
    }

    /// Tear down a whole subtree: children finalized and destroyed before
    /// their parents, every handle freed.
    pub fn teardown_subtree(&mut self, start: SlotId) {
        let order = self.collect_subtree(start);
        for &slot in order.iter().rev() {
            if let Some(mut entry) = self.remove(slot) {
                if let Some(body) = entry.body.as_mut() {
                    body.fini(false);
                    body.destroy();
                }
            }
        }
    }

    /// Reversibly quiesce every object, children before parents.
    pub fn suspend(&mut self) {
        let order = self.collect_subtree(self.root);
        for &slot in order.iter().rev() {
            if let Some(entry) = self.arena.get_mut(slot) {
                if let Some(body) = entry.body.as_mut() {
                    body.fini(true);
                }
            }
        }
    }

    /// Re-arm every object, parents before children. The first failure
    /// aborts the walk and is reported.
    pub fn resume(&mut self) -> Result<()> {
        let order = self.collect_subtree(self.root);
        for &slot in &order {
            if let Some(entry) = self.arena.get_mut(slot) {
                if let Some(body) = entry.body.as_mut() {
                    body.init()?;
                }
            }
        }
        Ok(())
    }
}
