//! Per-resource publish/subscribe.
//!
//! A resource that can report asynchronous occurrences owns a
//! [`NotifySource`]. Subscribers register a callback plus a type mask and
//! get back a registration id; the broker wraps the registration in an
//! [`EventSubscription`] object so allow/block/delete travel over the same
//! object protocol as everything else.
//!
//! Quiesce discipline: delivery runs with the source's mutex held, and
//! `set_armed(false)` takes the same mutex. `block` returning therefore
//! guarantees no further delivery completes — at the price that callbacks
//! must never re-enter their own source (or the broker lock of the client
//! that owns them).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use aperture_protocol::{EventPrefix, EventRequest, SUPPORTED_VERSION};
use tracing::trace;

use crate::error::{ApiError, Result};
use crate::object::ObjectImpl;

/// What the dispatcher should do with a subscription after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Stay armed for further occurrences.
    Keep,
    /// Release the registration: deliver-then-forget, without a second
    /// explicit delete racing the delivery. The dispatcher owns the removal,
    /// never the callback.
    Drop,
}

pub type EventCallback = Box<dyn FnMut(EventPrefix, &[u8]) -> Disposition + Send>;

struct Registration {
    id: u64,
    /// Owner token for duplicate detection (client id for broker-made
    /// subscriptions).
    owner: u64,
    types: u32,
    armed: bool,
    callback: EventCallback,
}

/// Notification source owned by one resource (engine, channel, device).
pub struct NotifySource {
    name: &'static str,
    next_id: AtomicU64,
    subs: Mutex<Vec<Registration>>,
}

impl NotifySource {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            next_id: AtomicU64::new(1),
            subs: Mutex::new(Vec::new()),
        })
    }

    /// Register a callback for the types in `mask`. Starts disarmed.
    ///
    /// An owner already holding a registration with the same mask on this
    /// source is reported `Busy`.
    pub fn register(&self, owner: u64, mask: u32, callback: EventCallback) -> Result<u64> {
        let mut subs = self.subs.lock().unwrap();
        if subs.iter().any(|r| r.owner == owner && r.types == mask) {
            return Err(ApiError::Busy("duplicate subscription"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subs.push(Registration {
            id,
            owner,
            types: mask,
            armed: false,
            callback,
        });
        Ok(id)
    }

    /// Arm or disarm a registration. Idempotent; unknown ids are ignored
    /// (the registration may already be gone via [`Disposition::Drop`]).
    ///
    /// Disarming synchronously quiesces delivery: this call takes the
    /// dispatch mutex, so it cannot return while a delivery is in flight.
    pub fn set_armed(&self, id: u64, armed: bool) {
        let mut subs = self.subs.lock().unwrap();
        if let Some(reg) = subs.iter_mut().find(|r| r.id == id) {
            reg.armed = armed;
        }
    }

    /// Drop a registration. Idempotent.
    pub fn unregister(&self, id: u64) {
        let mut subs = self.subs.lock().unwrap();
        subs.retain(|r| r.id != id);
    }

    /// Report an occurrence.
    ///
    /// Every armed registration whose mask intersects `types` is invoked
    /// once, with the delivery prefix carrying only the intersecting bits.
    /// Occurrences seen by blocked registrations are not queued; there is no
    /// replay on re-arm. Returns the number of deliveries made.
    pub fn notify(&self, types: u32, payload: &[u8]) -> usize {
        let mut subs = self.subs.lock().unwrap();
        let mut delivered = 0;
        let mut i = 0;
        while i < subs.len() {
            let reg = &mut subs[i];
            let fired = reg.types & types;
            if !reg.armed || fired == 0 {
                i += 1;
                continue;
            }
            let prefix = EventPrefix {
                version: SUPPORTED_VERSION,
                types: fired,
            };
            delivered += 1;
            match (reg.callback)(prefix, payload) {
                Disposition::Keep => i += 1,
                Disposition::Drop => {
                    trace!(source = self.name, id = reg.id, "dropping one-shot subscription");
                    subs.remove(i);
                }
            }
        }
        delivered
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for NotifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifySource")
            .field("name", &self.name)
            .field("subs", &self.subs.lock().unwrap().len())
            .finish()
    }
}

/// Broker object wrapping one registration on a [`NotifySource`].
///
/// State machine: registered disarmed; `init` arms it when the stored
/// allowed flag is set (true at construction, so a fresh subscription is
/// live once the broker initializes it, and a suspend/resume cycle re-arms
/// automatically); `ALLOW`/`BLOCK` methods flip both the flag and the armed
/// state; destruction unregisters.
pub struct EventSubscription {
    source: Arc<NotifySource>,
    reg_id: u64,
    /// Stored allowed-state applied by `init`/`fini`.
    should_allow: bool,
}

impl EventSubscription {
    pub const MTHD_ALLOW: u8 = 1;
    pub const MTHD_BLOCK: u8 = 2;

    /// Register on `source` for the types in `request`.
    pub fn subscribe(
        source: Arc<NotifySource>,
        request: EventRequest,
        owner: u64,
        callback: EventCallback,
    ) -> Result<Self> {
        let reg_id = source.register(owner, request.types, callback)?;
        Ok(Self {
            source,
            reg_id,
            should_allow: true,
        })
    }

    /// Allow delivery. Idempotent.
    pub fn allow(&mut self) {
        self.should_allow = true;
        self.source.set_armed(self.reg_id, true);
    }

    /// Block delivery and quiesce: no delivery completes after this
    /// returns, until the next allow. Idempotent.
    pub fn block(&mut self) {
        self.should_allow = false;
        self.source.set_armed(self.reg_id, false);
    }
}

impl ObjectImpl for EventSubscription {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn init(&mut self) -> Result<()> {
        if self.should_allow {
            self.source.set_armed(self.reg_id, true);
        }
        Ok(())
    }

    fn fini(&mut self, _suspend: bool) {
        // Disarm but keep the stored flag: a resume re-arms via init.
        self.source.set_armed(self.reg_id, false);
    }

    fn destroy(&mut self) {
        self.source.unregister(self.reg_id);
    }

    fn mthd(&mut self, method: u8, _payload: &[u8]) -> Result<Vec<u8>> {
        match method {
            Self::MTHD_ALLOW => {
                self.allow();
                Ok(Vec::new())
            }
            Self::MTHD_BLOCK => {
                self.block();
                Ok(Vec::new())
            }
            _ => Err(ApiError::NotSupported("unknown event method")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(count: Arc<AtomicUsize>) -> EventCallback {
        Box::new(move |_prefix, _payload| {
            count.fetch_add(1, Ordering::SeqCst);
            Disposition::Keep
        })
    }

    #[test]
    fn delivery_respects_mask_and_armed_state() {
        let source = NotifySource::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let id = source
            .register(1, 0b01, counting_callback(count.clone()))
            .unwrap();

        // Disarmed: nothing delivered.
        assert_eq!(source.notify(0b01, &[]), 0);

        source.set_armed(id, true);
        assert_eq!(source.notify(0b10, &[]), 0, "mask miss");
        assert_eq!(source.notify(0b11, &[]), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delivery_prefix_carries_only_fired_bits() {
        let source = NotifySource::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let id = source
            .register(
                1,
                0b0110,
                Box::new(move |prefix, _| {
                    seen2.lock().unwrap().push(prefix.types);
                    Disposition::Keep
                }),
            )
            .unwrap();
        source.set_armed(id, true);

        source.notify(0b0010, &[]);
        source.notify(0b1111, &[]);
        assert_eq!(*seen.lock().unwrap(), vec![0b0010, 0b0110]);
    }

    #[test]
    fn drop_disposition_removes_registration() {
        let source = NotifySource::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let id = source
            .register(
                1,
                1,
                Box::new(move |_, _| {
                    count2.fetch_add(1, Ordering::SeqCst);
                    Disposition::Drop
                }),
            )
            .unwrap();
        source.set_armed(id, true);

        assert_eq!(source.notify(1, &[]), 1);
        assert_eq!(source.notify(1, &[]), 0, "one-shot must be gone");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Stale disarm/unregister of the dropped id are harmless.
        source.set_armed(id, true);
        source.unregister(id);
    }

    #[test]
    fn duplicate_owner_and_mask_is_busy() {
        let source = NotifySource::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        source
            .register(7, 1, counting_callback(count.clone()))
            .unwrap();
        let err = source
            .register(7, 1, counting_callback(count.clone()))
            .unwrap_err();
        assert_eq!(err, ApiError::Busy("duplicate subscription"));

        // Same owner, different mask is a distinct subscription.
        source.register(7, 2, counting_callback(count)).unwrap();
    }

    #[test]
    fn block_allow_idempotence() {
        let source = NotifySource::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let mut sub = EventSubscription::subscribe(
            source.clone(),
            EventRequest::new(1),
            1,
            counting_callback(count.clone()),
        )
        .unwrap();
        sub.init().unwrap();

        source.notify(1, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        sub.block();
        sub.block();
        source.notify(1, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 1, "blocked: no delivery, no backlog");

        sub.allow();
        sub.allow();
        source.notify(1, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 2, "no replay of missed occurrences");
    }

    #[test]
    fn fini_disarms_and_init_rearms_from_stored_flag() {
        let source = NotifySource::new("test");
        let count = Arc::new(AtomicUsize::new(0));
        let mut sub = EventSubscription::subscribe(
            source.clone(),
            EventRequest::new(1),
            1,
            counting_callback(count.clone()),
        )
        .unwrap();
        sub.init().unwrap();

        // Suspend cycle: disarmed while down, re-armed on resume.
        sub.fini(true);
        source.notify(1, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        sub.init().unwrap();
        source.notify(1, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A blocked subscription stays blocked across the cycle.
        sub.block();
        sub.fini(true);
        sub.init().unwrap();
        source.notify(1, &[]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
