//! Producer-side ring state and flow control.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{trace, warn};

use crate::consumer::RingConsumer;

/// Jump-to-start marker written at the producer cursor on a wind. The
/// consumer wraps its fetch offset to 0 when it reaches this word.
///
/// The encoding is consumer-specific in real hardware; the core only needs a
/// single reserved word that cannot appear as the first word of a command.
pub const WIND_MARKER: u32 = 0x2000_0000;

/// Words the producer always leaves between `put` and `get`.
///
/// Some consumer generations cannot distinguish `put == get` (empty) from a
/// full ring, so `put` must never catch `get` exactly.
pub const SAFETY_MARGIN_WORDS: usize = 5;

/// Default bound on how long [`PushRing::reserve`] polls for ring space.
pub const RESERVE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Interval between hardware `get` read-backs while polling for space.
pub const POLL_INTERVAL: Duration = Duration::from_micros(10);

/// The only ring error: a bounded space or wind wait expired.
///
/// Callers must treat this as fatal to the in-flight command. The ring itself
/// stays consistent; no consumer-owned data was overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("ring space wait timed out after {timeout_ms} ms (need {need} words, free {free})")]
    Timeout {
        need: usize,
        free: usize,
        timeout_ms: u64,
    },
}

/// Always-on ring counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// `put` publishes that moved the cursor forward (winds not included).
    pub kicks: u64,
    /// Winds (producer wraps back to offset 0).
    pub winds: u64,
    /// Reservations that expired.
    pub timeouts: u64,
}

/// Fixed-size circular command buffer with a software write cursor and a
/// hardware-visible read cursor.
///
/// Cursor invariant: `begin <= current <= end <= capacity`. `[begin,
/// current)` holds appended-but-unpublished words; `[current, end)` is the
/// remaining reservation. The circular region `[get, current)` is owned by
/// the consumer and is never written.
pub struct PushRing {
    buf: Vec<u32>,
    /// Start of the in-flight (unpublished) command span.
    begin: usize,
    /// Producer write cursor.
    current: usize,
    /// Upper bound of the active reservation.
    end: usize,
    /// Last `put` published to the consumer.
    last_put: usize,
    /// Last `get` read back from the consumer.
    last_get: usize,
    reserve_timeout: Duration,
    stats: RingStats,
    consumer: Box<dyn RingConsumer>,
}

impl PushRing {
    /// Create a ring of `capacity_words` 32-bit words on top of `consumer`.
    pub fn new(capacity_words: usize, consumer: Box<dyn RingConsumer>) -> Self {
        assert!(
            capacity_words > SAFETY_MARGIN_WORDS + 1,
            "ring capacity {capacity_words} too small"
        );
        Self {
            buf: vec![0; capacity_words],
            begin: 0,
            current: 0,
            end: 0,
            last_put: 0,
            last_get: 0,
            reserve_timeout: RESERVE_TIMEOUT,
            stats: RingStats::default(),
            consumer,
        }
    }

    /// Override the reservation deadline (tests and diagnostics).
    pub fn with_reserve_timeout(mut self, timeout: Duration) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn capacity_words(&self) -> usize {
        self.buf.len()
    }

    pub fn stats(&self) -> RingStats {
        self.stats
    }

    /// Producer write cursor (words from ring base).
    pub fn current(&self) -> usize {
        self.current
    }

    /// Last published `put` cursor.
    pub fn put(&self) -> usize {
        self.last_put
    }

    /// The ring words as last written by the producer (the CPU-visible
    /// mapping of the command aperture).
    pub fn words(&self) -> &[u32] {
        &self.buf
    }

    /// Make room for a `size`-word command.
    ///
    /// Winds the producer back to offset 0 first when `current + size` would
    /// reach or exceed the capacity, then polls the hardware `get` cursor
    /// until the free-space formula admits `size`, or the deadline (computed
    /// once on entry) expires.
    pub fn reserve(&mut self, size: usize) -> Result<(), RingError> {
        debug_assert!(
            size + SAFETY_MARGIN_WORDS + 1 <= self.buf.len(),
            "command of {size} words can never fit a {} word ring",
            self.buf.len()
        );
        if size == 0 {
            return Ok(());
        }

        let deadline = Instant::now() + self.reserve_timeout;

        if self.current + size >= self.buf.len() {
            self.wind(deadline, size)?;
        }

        loop {
            let free = self.poll_free();
            if free >= size {
                self.end = self.current + size;
                self.check_cursors();
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.stats.timeouts += 1;
                warn!(
                    need = size,
                    free,
                    get = self.last_get,
                    current = self.current,
                    "ring space reservation timed out"
                );
                return Err(RingError::Timeout {
                    need: size,
                    free,
                    timeout_ms: self.reserve_timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Copy `words` at the producer cursor and advance it. The words become
    /// consumer-visible only at the next [`kick`].
    ///
    /// Panics (debug) if the append overruns the active reservation — the
    /// reservation contract belongs to the caller.
    ///
    /// [`kick`]: PushRing::kick
    pub fn append(&mut self, words: &[u32]) {
        debug_assert!(
            self.current + words.len() <= self.end,
            "append of {} words overruns reservation (current {}, end {})",
            words.len(),
            self.current,
            self.end
        );
        self.buf[self.current..self.current + words.len()].copy_from_slice(words);
        self.current += words.len();
        self.check_cursors();
    }

    /// Publish the producer cursor as the new hardware `put`.
    ///
    /// No-op when nothing was appended since the last publish. Runs the
    /// consumer's flush hook first so non-coherent apertures are drained
    /// before the cursor moves.
    pub fn kick(&mut self) {
        if self.current == self.last_put {
            return;
        }
        self.consumer.flush();
        self.consumer.publish_put(self.current as u32);
        self.last_put = self.current;
        self.begin = self.current;
        self.stats.kicks += 1;
    }

    /// Read-only diagnostic: words available right now, by the same formula
    /// [`reserve`] uses. Does not touch producer state (not even the cached
    /// `get`).
    ///
    /// [`reserve`]: PushRing::reserve
    pub fn free_space(&self) -> usize {
        self.free_for(self.consumer.get() as usize)
    }

    /// Wrap the producer back to offset 0.
    ///
    /// Sequence:
    /// 1. write the jump marker at the current cursor and reset the cursor;
    /// 2. publish the already-produced tail if it was never kicked, so the
    ///    consumer can start draining;
    /// 3. if the consumer's `get` sits at offset 0, spin (bounded) until it
    ///    departs — otherwise `put == get == 0` after the wrap publish would
    ///    be ambiguous between empty and full;
    /// 4. publish `put = 0`, which the consumer reaches by following the
    ///    marker back to the ring start.
    fn wind(&mut self, deadline: Instant, need: usize) -> Result<(), RingError> {
        let tail = self.current;
        self.stats.winds += 1;
        trace!(tail, "ring wind");

        self.buf[tail] = WIND_MARKER;
        self.begin = 0;
        self.current = 0;
        self.end = 0;

        if self.last_put != tail {
            // Force a kick of the produced tail; the consumer cannot reach
            // the marker before the tail is published.
            self.consumer.flush();
            self.consumer.publish_put(tail as u32);
            self.last_put = tail;
            self.stats.kicks += 1;
        }

        loop {
            let get = self.consumer.get() as usize;
            if get != 0 {
                self.last_get = get;
                break;
            }
            if Instant::now() >= deadline {
                self.stats.timeouts += 1;
                warn!(tail, "consumer never departed ring offset 0 after wind");
                return Err(RingError::Timeout {
                    need,
                    free: 0,
                    timeout_ms: self.reserve_timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        // Publish the wrap itself. From here `get == 0` unambiguously means
        // the consumer followed the marker and drained everything.
        self.consumer.flush();
        self.consumer.publish_put(0);
        self.last_put = 0;
        self.check_cursors();
        Ok(())
    }

    fn poll_free(&mut self) -> usize {
        let get = self.consumer.get() as usize;
        self.last_get = get;
        self.free_for(get)
    }

    fn free_for(&self, get: usize) -> usize {
        if get > self.current {
            // Consumer is ahead (circularly): stay SAFETY_MARGIN_WORDS short
            // of it so put never catches get exactly.
            (get - self.current).saturating_sub(SAFETY_MARGIN_WORDS)
        } else {
            // Consumer is at or behind the cursor; the tail up to capacity is
            // free. `get == current` means empty: the margin guarantees put
            // never caught get with data outstanding.
            self.buf.len() - self.current
        }
    }

    fn check_cursors(&self) {
        debug_assert!(self.begin <= self.current);
        debug_assert!(self.current <= self.end || self.end == 0);
        debug_assert!(self.end <= self.buf.len());
    }
}

impl std::fmt::Debug for PushRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushRing")
            .field("capacity", &self.buf.len())
            .field("begin", &self.begin)
            .field("current", &self.current)
            .field("end", &self.end)
            .field("last_put", &self.last_put)
            .field("last_get", &self.last_get)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimConsumer;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ring_with_sim(capacity: usize, auto_drain: usize) -> (PushRing, Arc<SimConsumer>) {
        let sim = Arc::new(SimConsumer::new(auto_drain));
        let ring = PushRing::new(capacity, Box::new(sim.clone()))
            .with_reserve_timeout(Duration::from_millis(50));
        (ring, sim)
    }

    #[test]
    fn append_then_kick_publishes_put() {
        let (mut ring, sim) = ring_with_sim(64, 0);
        ring.reserve(4).unwrap();
        ring.append(&[1, 2, 3, 4]);
        assert_eq!(ring.put(), 0, "append alone must not move put");

        ring.kick();
        assert_eq!(ring.put(), 4);
        assert_eq!(sim.published_put(), Some(4));
        assert_eq!(ring.stats().kicks, 1);
    }

    #[test]
    fn kick_without_new_words_is_a_no_op() {
        let (mut ring, _sim) = ring_with_sim(64, 0);
        ring.reserve(2).unwrap();
        ring.append(&[7, 8]);
        ring.kick();
        ring.kick();
        assert_eq!(ring.stats().kicks, 1);
    }

    #[test]
    fn zero_size_reserve_is_free() {
        let (mut ring, _sim) = ring_with_sim(16, 0);
        ring.reserve(0).unwrap();
        assert_eq!(ring.current(), 0);
    }

    #[test]
    fn reserve_times_out_when_consumer_never_drains() {
        let (mut ring, _sim) = ring_with_sim(16, 0);
        ring.reserve(8).unwrap();
        ring.append(&[0xAA; 8]);
        ring.kick();

        // The tail is too short: this reservation winds, and the stalled
        // consumer never departs offset 0.
        let err = ring.reserve(8).unwrap_err();
        assert!(matches!(err, RingError::Timeout { need: 8, .. }));
        assert_eq!(ring.stats().timeouts, 1);
    }

    #[test]
    fn wind_resets_current_and_preserves_published_words() {
        let (mut ring, _sim) = ring_with_sim(16, 4);
        ring.reserve(10).unwrap();
        let pattern: Vec<u32> = (100..110).collect();
        ring.append(&pattern);
        ring.kick();

        // 10 words used of 16: reserving 8 more forces a wind.
        ring.reserve(8).unwrap();
        assert_eq!(ring.stats().winds, 1);
        assert_eq!(ring.current(), 0, "reservation after a wind starts at 0");
        assert_eq!(
            &ring.words()[..10],
            pattern.as_slice(),
            "wind must not disturb the produced prefix"
        );
        assert_eq!(ring.words()[10], WIND_MARKER);
    }

    #[test]
    fn wind_kicks_unpublished_tail_first() {
        let (mut ring, sim) = ring_with_sim(16, 4);
        ring.reserve(10).unwrap();
        ring.append(&[1; 10]);
        // No explicit kick: the wind must publish the tail itself, or the
        // consumer could never drain it.
        ring.reserve(8).unwrap();
        assert_eq!(ring.stats().winds, 1);
        assert_eq!(sim.published_put(), Some(0), "wrap publish follows the tail kick");
    }

    #[test]
    fn free_space_reads_without_touching_producer_state() {
        let (mut ring, sim) = ring_with_sim(64, 0);
        ring.reserve(8).unwrap();
        ring.append(&[1; 8]);
        ring.kick();
        sim.drain(8);

        // Through a shared borrow: a diagnostic read must not be able to
        // move cursors or refresh the cached get.
        let ring = &ring;
        assert_eq!(ring.free_space(), 64 - 8);
        assert_eq!(ring.free_space(), 64 - 8, "repeated reads are stable");
        assert_eq!(ring.current(), 8);
    }

    #[test]
    fn free_space_respects_safety_margin() {
        let (mut ring, sim) = ring_with_sim(64, 0);
        ring.reserve(32).unwrap();
        ring.append(&[3; 32]);
        ring.kick();
        sim.drain(32);

        ring.reserve(30).unwrap();
        ring.append(&[4; 30]);
        ring.kick();
        sim.drain(2);

        // Winds: producer back at 0 with the consumer at get == 34.
        ring.reserve(8).unwrap();
        let free = ring.free_space();
        let get = sim.get() as usize;
        assert!(get > ring.current());
        assert_eq!(free, get - ring.current() - SAFETY_MARGIN_WORDS);
    }

    #[test]
    fn producer_never_enters_consumer_owned_region() {
        let (mut ring, sim) = ring_with_sim(32, 1);
        let mut next_word = 0u32;
        for _ in 0..200 {
            let size = 3;
            ring.reserve(size).unwrap();
            let cur = ring.current();
            let get = sim.get() as usize;
            if get > cur {
                // Space was granted with an even older (smaller) get, so the
                // margin must still separate the reservation from get.
                assert!(
                    cur + size + SAFETY_MARGIN_WORDS <= get,
                    "reservation [{cur}, {}) too close to get {get}",
                    cur + size
                );
            }
            ring.append(&[next_word, next_word + 1, next_word + 2]);
            next_word = next_word.wrapping_add(3);
            ring.kick();
        }
        assert!(ring.stats().winds > 0, "workload must have wrapped");
    }
}
