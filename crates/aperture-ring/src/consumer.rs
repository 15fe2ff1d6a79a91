//! Consumer-side interface of a push ring.

/// Hardware-facing half of a push ring.
///
/// The producer only ever learns about drain progress through [`get`]; it
/// never infers progress from its own state. Implementations are the device
/// model (or, in tests, a simulated engine draining at an arbitrary rate).
///
/// Offsets are in 32-bit words from the ring base.
///
/// Consumers are shared with the device side, so the trait carries the
/// `Send + Sync` bounds of that sharing.
///
/// [`get`]: RingConsumer::get
pub trait RingConsumer: Send + Sync {
    /// Read back the hardware `get` cursor: the offset of the next word the
    /// consumer will fetch.
    fn get(&self) -> u32;

    /// Publish a new `put` cursor. Words below `put` (in publish order) are
    /// fetchable by the consumer.
    fn publish_put(&self, put: u32);

    /// Flush-and-poll hook run before a `put` publish when the ring lives in
    /// a non-coherent memory aperture. Coherent consumers keep the default
    /// no-op.
    fn flush(&self) {}
}

impl<C: RingConsumer + ?Sized> RingConsumer for std::sync::Arc<C> {
    fn get(&self) -> u32 {
        (**self).get()
    }

    fn publish_put(&self, put: u32) {
        (**self).publish_put(put)
    }

    fn flush(&self) {
        (**self).flush()
    }
}
