//! Reference ring consumer draining at a configurable rate.
//!
//! Used by this crate's tests and by channel-level integration tests. The
//! simulated engine tracks published `put` cursors in FIFO order and advances
//! its `get` through them, wrapping to offset 0 whenever the next published
//! cursor is behind it (the producer wound and the jump marker was taken).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::consumer::RingConsumer;

#[derive(Debug, Default)]
struct SimState {
    get: u32,
    /// Published `put` cursors not yet fully consumed, oldest first.
    targets: VecDeque<u32>,
    last_put: Option<u32>,
}

/// Simulated engine behind a push ring.
///
/// `auto_drain` words are consumed on every `get` read-back, which lets a
/// single-threaded producer make progress while polling for space;
/// [`SimConsumer::drain`] drains explicitly for step-by-step tests.
#[derive(Debug)]
pub struct SimConsumer {
    auto_drain: usize,
    state: Mutex<SimState>,
}

impl SimConsumer {
    pub fn new(auto_drain: usize) -> Self {
        Self {
            auto_drain,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Consume up to `words` words toward the oldest published cursor,
    /// following wraps. Consuming a wrap costs nothing: the jump marker is
    /// control flow, not data.
    pub fn drain(&self, words: usize) {
        let mut st = self.state.lock().unwrap();
        Self::drain_locked(&mut st, words);
    }

    /// The most recently published `put`, if any.
    pub fn published_put(&self) -> Option<u32> {
        self.state.lock().unwrap().last_put
    }

    fn drain_locked(st: &mut SimState, words: usize) {
        let mut budget = words as u32;
        loop {
            let Some(&target) = st.targets.front() else {
                return;
            };
            if target == st.get {
                st.targets.pop_front();
                continue;
            }
            if target < st.get {
                // The producer wound: take the jump back to the ring start.
                st.get = 0;
                continue;
            }
            if budget == 0 {
                return;
            }
            let step = budget.min(target - st.get);
            st.get += step;
            budget -= step;
        }
    }
}

impl RingConsumer for SimConsumer {
    fn get(&self) -> u32 {
        let mut st = self.state.lock().unwrap();
        Self::drain_locked(&mut st, self.auto_drain);
        st.get
    }

    fn publish_put(&self, put: u32) {
        let mut st = self.state.lock().unwrap();
        if st.last_put != Some(put) {
            st.targets.push_back(put);
            st.last_put = Some(put);
        }
    }
}
