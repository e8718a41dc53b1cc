//! The strategy boundary between concurrent pointers and reclamation.

use crate::deleter::Deleter;

/// A pluggable memory-reclamation strategy backing one atomic pointer cell.
///
/// The strategy owns the cell itself; [`ConcurrentPtr`](crate::ConcurrentPtr)
/// only ever speaks this protocol, so it cannot depend on any one strategy's
/// representation.
///
/// Protection is a per-thread, non-nested scope: a thread calls
/// [`protect`](Reclaim::protect), dereferences the returned pointer, then
/// calls [`release`](Reclaim::release). Implementations detect mismatched
/// pairs in debug builds.
///
/// # Safety
///
/// Implementations must guarantee that a pointer returned by `protect` is
/// not freed before the matching `release` on the same thread, that
/// `replace` retires the previous referent through `D` exactly once, and
/// that a referent observed by any `protect` call is fully constructed.
pub unsafe trait Reclaim<T, D>: Send + Sync
where
    T: Send + Sync + 'static,
    D: Deleter<T>,
{
    /// Create an empty cell.
    fn empty() -> Self;

    /// Begin a protected read of the current referent.
    ///
    /// Returns null when the cell is empty. Must be paired with
    /// [`release`](Reclaim::release) on the same thread; protection scopes
    /// do not nest.
    fn protect(&self) -> *mut T;

    /// End the protection scope opened by the last [`protect`](Reclaim::protect).
    fn release(&self);

    /// Publish `new` (which may be null) and retire the previous referent.
    ///
    /// Takes ownership of `new`; it will eventually be freed through `D`.
    /// Concurrent readers observe either the old or the new referent, never
    /// a torn state.
    fn replace(&self, new: *mut T);

    /// Whether the cell currently holds no referent.
    fn is_empty(&self) -> bool;

    /// Reclaim retirements that are provably safe to free right now.
    ///
    /// Called after a final `replace(null)` when the caller guarantees no
    /// readers remain, so that allocation counts return to their baseline
    /// without waiting for the cell to be dropped. Strategies that free
    /// immediately have nothing to do.
    fn flush(&self) {}
}
