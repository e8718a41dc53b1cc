/// An optional per-worker event source.
///
/// When installed, the worker's quiescent step calls [`poll`](Poller::poll)
/// instead of sleeping on its inbox signal. A poller typically dispatches
/// ready I/O handlers back into the same worker through
/// [`Worker::with_current`](crate::Worker::with_current).
pub trait Poller: Send {
    /// Drain ready events, blocking for at most `timeout_ms` milliseconds.
    ///
    /// Must not block at all when `timeout_ms` is zero.
    fn poll(&mut self, timeout_ms: u64);
}

/// Factory invoked once per worker during group construction. Returning
/// `None` leaves that worker without a poller.
pub type PollerSupplier = Box<dyn FnMut(usize) -> Option<Box<dyn Poller>> + Send>;
