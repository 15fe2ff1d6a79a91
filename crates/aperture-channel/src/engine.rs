//! Channel groups and engine-context refcounting.
//!
//! A group is the set of channels sharing one address space. Engine
//! contexts are the only state shared across channels, so every use-count
//! mutation happens under the group mutex, and the mutex stays held across
//! decrement-and-maybe-finalize. Lock order: group mutex before any engine
//! init/fini hook; hooks must never take a group mutex.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aperture_broker::{ApiError, Result};
use tracing::{debug, trace};

use crate::channel::ChannelFault;

pub type EngineId = u32;

/// Key of one channel within its group: `(runlist, channel id)`.
pub type ChannelKey = (u32, u32);

/// Hardware hooks behind engine-context refcounting, all run with the
/// group mutex held.
///
/// `init`/`fini` back the engine-global resource: `init` on the group-wide
/// 0→1 use transition, `fini` on 1→0. `ctx_init`/`ctx_fini` back the
/// per-(channel, engine) context wrapper and run on that pair's own 0→1
/// and 1→0 transitions — `ctx_init` after the engine-global `init`,
/// `ctx_fini` before the engine-global `fini`. Engines whose wrappers hold
/// no state keep the defaults.
pub trait EngineOps: Send + Sync {
    fn init(&self, engine: EngineId) -> Result<()>;
    fn fini(&self, engine: EngineId);

    fn ctx_init(&self, key: ChannelKey, engine: EngineId) -> Result<()> {
        let _ = (key, engine);
        Ok(())
    }

    fn ctx_fini(&self, key: ChannelKey, engine: EngineId) {
        let _ = (key, engine);
    }
}

#[derive(Default)]
struct GroupInner {
    /// Engine-global use counts.
    engines: HashMap<EngineId, u32>,
    /// Per-(channel, engine) use counts.
    channel_engines: HashMap<(ChannelKey, EngineId), u32>,
    /// Admitted channels, keyed by identity; the value carries the kill
    /// state shared with the device's fault reporting path.
    channels: HashMap<ChannelKey, Arc<ChannelFault>>,
}

pub struct ChannelGroup {
    ops: Arc<dyn EngineOps>,
    inner: Mutex<GroupInner>,
}

impl ChannelGroup {
    pub fn new(ops: Arc<dyn EngineOps>) -> Arc<Self> {
        Arc::new(Self {
            ops,
            inner: Mutex::new(GroupInner::default()),
        })
    }

    /// Admit a channel identity into the group. The id must be unused on its
    /// runlist.
    pub fn admit(&self, key: ChannelKey) -> Result<Arc<ChannelFault>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.channels.contains_key(&key) {
            return Err(ApiError::Busy("channel id already in use on runlist"));
        }
        let fault = Arc::new(ChannelFault::default());
        inner.channels.insert(key, fault.clone());
        Ok(fault)
    }

    /// Forget an admitted channel, freeing its id. Idempotent.
    pub fn evict(&self, key: ChannelKey) {
        self.inner.lock().unwrap().channels.remove(&key);
    }

    /// Mark a channel killed, publishing its kill event exactly once.
    /// Returns false if the key is unknown.
    pub fn kill(&self, key: ChannelKey) -> bool {
        let fault = {
            let inner = self.inner.lock().unwrap();
            inner.channels.get(&key).cloned()
        };
        match fault {
            Some(fault) => {
                // Publish outside the group mutex; delivery callbacks may
                // take client locks.
                fault.trip();
                true
            }
            None => false,
        }
    }

    /// Bind `engine` for one channel. The first binding of an engine across
    /// the whole group runs the engine's `init`; a failed `init` leaves
    /// every count untouched.
    pub fn bind(&self, key: ChannelKey, engine: EngineId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let per = inner
            .channel_engines
            .get(&(key, engine))
            .copied()
            .unwrap_or(0);
        if per == 0 {
            let global = inner.engines.get(&engine).copied().unwrap_or(0);
            if global == 0 {
                self.ops.init(engine)?;
                debug!(engine, "engine context initialized");
            }
            if let Err(err) = self.ops.ctx_init(key, engine) {
                if global == 0 {
                    self.ops.fini(engine);
                }
                return Err(err);
            }
            inner.engines.insert(engine, global + 1);
        }
        inner.channel_engines.insert((key, engine), per + 1);
        trace!(?key, engine, "engine bound");
        Ok(())
    }

    /// Release one binding of `engine` for one channel. The last release
    /// across the whole group runs the engine's `fini` before the mutex is
    /// dropped, so no other channel can observe a half-finalized context.
    /// Idempotent on unbound pairs.
    pub fn unbind(&self, key: ChannelKey, engine: EngineId) {
        let mut inner = self.inner.lock().unwrap();
        let per = match inner.channel_engines.get(&(key, engine)).copied() {
            Some(per) => per,
            None => return,
        };
        if per > 1 {
            inner.channel_engines.insert((key, engine), per - 1);
            return;
        }
        inner.channel_engines.remove(&(key, engine));
        self.ops.ctx_fini(key, engine);

        let global = inner.engines.get(&engine).copied().unwrap_or(0);
        debug_assert!(global > 0);
        if global > 1 {
            inner.engines.insert(engine, global - 1);
        } else {
            inner.engines.remove(&engine);
            self.ops.fini(engine);
            debug!(engine, "engine context finalized");
        }
        trace!(?key, engine, "engine unbound");
    }

    /// Engine-global use count (diagnostics and tests).
    pub fn engine_uses(&self, engine: EngineId) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .engines
            .get(&engine)
            .copied()
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ChannelGroup")
            .field("channels", &inner.channels.len())
            .field("engines", &inner.engines)
            .finish()
    }
}
