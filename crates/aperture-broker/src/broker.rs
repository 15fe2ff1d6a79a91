//! Control-request dispatch: SCLASS, NEW, DEL and MTHD over a client's
//! object tree.

use std::sync::Arc;

use aperture_protocol::{
    ControlKind, DecodeError, Envelope, EventRequest, MthdPayload, NewPayload, Status,
    SUPPORTED_VERSION,
};
use tracing::debug;

use crate::client::Client;
use crate::error::{ApiError, Result};
use crate::event::{Disposition, EventSubscription};
use crate::object::{ClassRegistry, CtorCtx, ObjectEntry, ObjectImpl, EVENT_CLASS_ID};

/// Outcome of one control request.
///
/// `status` is total over the request space; nothing unwinds past the
/// broker. `new_handle` is set only for a successful NEW.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: Status,
    pub token: u64,
    pub new_handle: Option<u64>,
    pub payload: Vec<u8>,
}

impl Completion {
    fn failed(token: u64, status: Status) -> Self {
        Self {
            status,
            token,
            new_handle: None,
            payload: Vec::new(),
        }
    }
}

struct Done {
    status: Status,
    new_handle: Option<u64>,
    payload: Vec<u8>,
}

impl Done {
    fn ok(payload: Vec<u8>) -> Self {
        Self {
            status: Status::Ok,
            new_handle: None,
            payload,
        }
    }
}

fn malformed(err: DecodeError) -> ApiError {
    match err {
        DecodeError::BadVersion { .. } => ApiError::NotSupported("unsupported request version"),
        _ => ApiError::NotSupported("malformed request payload"),
    }
}

/// The object broker: one shared class registry, any number of clients.
pub struct Broker {
    registry: ClassRegistry,
}

impl Broker {
    pub fn new(registry: ClassRegistry) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    /// Dispatch one request against `client`'s tree.
    pub fn submit(&self, client: &Client, env: &Envelope) -> Completion {
        match self.dispatch(client, env) {
            Ok(done) => Completion {
                status: done.status,
                token: env.token,
                new_handle: done.new_handle,
                payload: done.payload,
            },
            Err(err) => {
                debug!(
                    client = client.id(),
                    kind = ?env.kind,
                    target = env.target_object,
                    %err,
                    "request failed"
                );
                Completion::failed(env.token, Status::from(&err))
            }
        }
    }

    fn dispatch(&self, client: &Client, env: &Envelope) -> Result<Done> {
        // Envelopes built in-process bypass the wire decoder, so the
        // version gate must sit on the dispatch path itself.
        if env.version != SUPPORTED_VERSION {
            return Err(ApiError::NotSupported("unsupported request version"));
        }
        match env.kind {
            ControlKind::Sclass => self.dispatch_sclass(client, env),
            ControlKind::New => self.dispatch_new(client, env),
            ControlKind::Del => self.dispatch_del(client, env),
            ControlKind::Mthd => self.dispatch_mthd(client, env),
        }
    }

    /// Search the target's constructible subclasses for a class id.
    ///
    /// Enumeration order is the class's own list, terminated early by a zero
    /// entry, with the synthetic event class appended last when the target
    /// publishes notifications. The reply carries the matching enumeration
    /// index.
    fn dispatch_sclass(&self, client: &Client, env: &Envelope) -> Result<Done> {
        let wanted = decode_class_id(&env.payload)?;
        let inner = client.lock();
        let entry = inner.entry(inner.resolve(env.target_object)?)?;
        let body = entry
            .body
            .as_ref()
            .ok_or(ApiError::Busy("object is mid-dispatch"))?;

        let index = sclass_search(body.as_ref(), wanted)
            .ok_or(ApiError::NotFound("class not enumerable under target"))?;
        Ok(Done::ok(index.to_le_bytes().to_vec()))
    }

    fn dispatch_new(&self, client: &Client, env: &Envelope) -> Result<Done> {
        let req = NewPayload::decode(&env.payload).map_err(malformed)?;
        let handle = u64::from(req.handle);
        let mut inner = client.lock();
        let parent_slot = inner.resolve(env.target_object)?;

        // Re-run the subclass search: only enumerable classes construct.
        let notify_source = {
            let entry = inner.entry(parent_slot)?;
            let body = entry
                .body
                .as_ref()
                .ok_or(ApiError::Busy("object is mid-dispatch"))?;
            if sclass_search(body.as_ref(), req.class_id).is_none() {
                return Err(ApiError::NotFound("class not constructible under target"));
            }
            body.notify_source()
        };

        let mut body: Box<dyn ObjectImpl> = if req.class_id == EVENT_CLASS_ID {
            let source =
                notify_source.ok_or(ApiError::NotFound("target publishes no notifications"))?;
            let request = EventRequest::decode(&req.class_payload).map_err(malformed)?;
            let sink = client.event_sink();
            let sub = EventSubscription::subscribe(
                source,
                request,
                client.id(),
                Box::new(move |prefix, payload| {
                    sink(handle, prefix, payload);
                    Disposition::Keep
                }),
            )?;
            Box::new(sub)
        } else {
            let mut parent_body = inner.take_body(parent_slot)?;
            let mut ctx = CtorCtx {
                client_id: client.id(),
                handle,
                class_id: req.class_id,
                class_payload: &req.class_payload,
                parent: parent_body.as_mut(),
            };
            let built = self.registry.construct(&mut ctx);
            inner.put_body(parent_slot, parent_body);
            built?
        };

        // Init, then index. Either failure unwinds the partial object so
        // nothing half-built stays reachable.
        if let Err(err) = body.init() {
            body.destroy();
            return Err(err);
        }
        let entry = ObjectEntry::new(handle, req.class_id, Some(body));
        match inner.insert(parent_slot, entry) {
            Ok(_) => {
                debug!(
                    client = client.id(),
                    handle,
                    class = req.class_id,
                    "object constructed"
                );
                Ok(Done {
                    status: Status::Ok,
                    new_handle: Some(handle),
                    payload: Vec::new(),
                })
            }
            Err((err, mut entry)) => {
                if let Some(body) = entry.body.as_mut() {
                    body.fini(false);
                    body.destroy();
                }
                Err(err)
            }
        }
    }

    /// Delete the target and everything under it, children first. Success is
    /// the `ObjectGone` sentinel: the handle space no longer contains the
    /// target.
    fn dispatch_del(&self, client: &Client, env: &Envelope) -> Result<Done> {
        if env.target_object == 0 {
            return Err(ApiError::NotSupported("client root is not deletable"));
        }
        let mut inner = client.lock();
        let slot = inner.resolve(env.target_object)?;
        inner.teardown_subtree(slot);
        debug!(client = client.id(), handle = env.target_object, "object deleted");
        Ok(Done {
            status: Status::ObjectGone,
            new_handle: None,
            payload: Vec::new(),
        })
    }

    fn dispatch_mthd(&self, client: &Client, env: &Envelope) -> Result<Done> {
        let req = MthdPayload::decode(&env.payload).map_err(malformed)?;
        let mut inner = client.lock();
        let slot = inner.resolve(env.target_object)?;
        let mut body = inner.take_body(slot)?;
        let reply = body.mthd(req.method, &req.method_payload);
        inner.put_body(slot, body);
        Ok(Done::ok(reply?))
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker").field("registry", &self.registry).finish()
    }
}

fn decode_class_id(payload: &[u8]) -> Result<i32> {
    let bytes: [u8; 4] = payload
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(ApiError::NotSupported("malformed request payload"))?;
    Ok(i32::from_le_bytes(bytes))
}

fn sclass_search(body: &dyn ObjectImpl, wanted: i32) -> Option<u32> {
    let mut index = 0u32;
    for &class in body.sclasses() {
        if class == 0 {
            // Terminal empty entry cuts enumeration short.
            return None;
        }
        if class == wanted {
            return Some(index);
        }
        index += 1;
    }
    if wanted == EVENT_CLASS_ID && body.notify_source().is_some() {
        return Some(index);
    }
    None
}
