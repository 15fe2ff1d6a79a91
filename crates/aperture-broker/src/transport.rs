//! Driver transport capability set.
//!
//! Callers reach the broker through five operations: request submission,
//! map/unmap of object memory, and whole-tree suspend/resume. Proxy layers
//! depend only on [`DriverTransport`], so the same caller code runs whether
//! the broker is in-process or behind a remote channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aperture_protocol::{Envelope, Status};
use tracing::debug;

use crate::broker::{Broker, Completion};
use crate::client::Client;
use crate::error::{ApiError, Result};
use crate::object::Capability;

pub trait DriverTransport: Send + Sync {
    fn submit_request(&self, env: &Envelope) -> Completion;

    /// Map `len` bytes of the object's CPU-visible region, returning the
    /// address. Address translation belongs to the platform; the broker only
    /// validates the handle and the length.
    fn map(&self, handle: u64, len: u64) -> Result<u64>;

    fn unmap(&self, address: u64, len: u64) -> Result<()>;

    /// Reversibly quiesce the whole tree, children before parents.
    fn suspend(&self);

    /// Re-arm the whole tree, parents before children.
    fn resume(&self) -> Result<()>;
}

const MAP_BASE: u64 = 0x1000;
const MAP_ALIGN: u64 = 0x1000;

#[derive(Default)]
struct MapSpace {
    next: u64,
    live: HashMap<u64, (u64, u64)>,
}

/// Transport for callers living in the broker's own process. Addresses
/// handed out by `map` are cookies from a bump allocator, not real
/// pointers.
pub struct InProcessTransport {
    broker: Arc<Broker>,
    client: Arc<Client>,
    maps: Mutex<MapSpace>,
}

impl InProcessTransport {
    pub fn new(broker: Arc<Broker>, client: Arc<Client>) -> Self {
        Self {
            broker,
            client,
            maps: Mutex::new(MapSpace {
                next: MAP_BASE,
                live: HashMap::new(),
            }),
        }
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Decode and submit raw request bytes. An unrecognized version or kind
    /// fails as `NotSupported` before any dispatch side effect.
    pub fn submit_bytes(&self, buf: &[u8]) -> Completion {
        match Envelope::decode(buf) {
            Ok(env) => self.submit_request(&env),
            Err(err) => {
                debug!(client = self.client.id(), %err, "rejecting undecodable request");
                Completion {
                    status: Status::NotSupported,
                    token: 0,
                    new_handle: None,
                    payload: Vec::new(),
                }
            }
        }
    }
}

impl DriverTransport for InProcessTransport {
    fn submit_request(&self, env: &Envelope) -> Completion {
        self.broker.submit(&self.client, env)
    }

    fn map(&self, handle: u64, len: u64) -> Result<u64> {
        let region_len = {
            let inner = self.client.lock();
            let slot = inner.resolve_with(handle, Capability::Mappable)?;
            inner.entry(slot)?.body.as_ref().and_then(|b| b.map_len())
        };
        let region_len = region_len.ok_or(ApiError::NotFound("handle lacks required capability"))?;
        if len == 0 || len > region_len {
            return Err(ApiError::NotSupported("map length out of range"));
        }

        let mut maps = self.maps.lock().unwrap();
        let address = maps.next;
        let span = len.div_ceil(MAP_ALIGN) * MAP_ALIGN;
        maps.next = address
            .checked_add(span)
            .ok_or(ApiError::Fatal("map address space exhausted"))?;
        maps.live.insert(address, (handle, len));
        debug!(client = self.client.id(), handle, address, len, "mapped");
        Ok(address)
    }

    fn unmap(&self, address: u64, len: u64) -> Result<()> {
        let mut maps = self.maps.lock().unwrap();
        match maps.live.get(&address) {
            Some(&(_, mapped_len)) if mapped_len == len => {
                maps.live.remove(&address);
                Ok(())
            }
            Some(_) => Err(ApiError::NotSupported("unmap length mismatch")),
            None => Err(ApiError::NotFound("no mapping at address")),
        }
    }

    fn suspend(&self) {
        debug!(client = self.client.id(), "suspending object tree");
        self.client.lock().suspend();
    }

    fn resume(&self) -> Result<()> {
        debug!(client = self.client.id(), "resuming object tree");
        self.client.lock().resume()
    }
}
