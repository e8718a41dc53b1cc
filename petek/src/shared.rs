//! `ConcurrentSharedPtr<T>` — an atomic cell over shared ownership.

use crate::deleter::ArcDeleter;
use crate::ptr::ConcurrentPtr;
use crate::reclaim::Reclaim;
use crate::refcount::RefCount;
use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;

/// An atomically swappable `Arc<T>`.
///
/// The cell stores the raw pointer of an `Arc` and the strategies retire
/// the *control block* — a retired pointer's deleter releases one strong
/// count, so clones handed out by [`get`](Self::get) keep the value alive
/// past any number of [`reset`](Self::reset) calls.
pub struct ConcurrentSharedPtr<T, R = RefCount<T, ArcDeleter>>
where
    T: Send + Sync + 'static,
    R: Reclaim<T, ArcDeleter>,
{
    cell: ConcurrentPtr<T, ArcDeleter, R>,
}

impl<T, R> ConcurrentSharedPtr<T, R>
where
    T: Send + Sync + 'static,
    R: Reclaim<T, ArcDeleter>,
{
    /// Create an empty cell.
    pub fn new() -> Self {
        Self {
            cell: ConcurrentPtr::new(),
        }
    }

    /// Create a cell already holding `value`.
    pub fn with_value(value: T) -> Self {
        let cell = Self::new();
        cell.reset(Arc::new(value));
        cell
    }

    /// Clone out the current value as a full owning handle.
    ///
    /// The strong count is incremented under protection, so the returned
    /// `Arc` is valid no matter how many resets race this call.
    pub fn get(&self) -> Option<Arc<T>> {
        let ptr = self.cell.read_lock();
        let arc = NonNull::new(ptr).map(|ptr| {
            // SAFETY: the protection scope guarantees the control block is
            // alive; incrementing before from_raw makes this a clone.
            unsafe {
                Arc::increment_strong_count(ptr.as_ptr() as *const T);
                Arc::from_raw(ptr.as_ptr() as *const T)
            }
        });
        self.cell.read_unlock();
        arc
    }

    /// Publish `value`, retiring the previous referent's strong count.
    pub fn reset(&self, value: Arc<T>) {
        self.cell.replace_raw(Arc::into_raw(value) as *mut T);
    }

    /// Publish a fresh value without constructing the `Arc` at the call site.
    pub fn reset_value(&self, value: T) {
        self.reset(Arc::new(value));
    }

    /// Publish null and retire the previous referent, then reclaim whatever
    /// is provably safe. Teardown path: the caller guarantees no future
    /// readers.
    pub fn clear(&self) {
        self.cell.replace_raw(core::ptr::null_mut());
        self.cell.flush();
    }

    /// Whether the cell currently holds no referent.
    pub fn is_empty(&self) -> bool {
        self.cell.is_empty()
    }
}

impl<T, R> Default for ConcurrentSharedPtr<T, R>
where
    T: Send + Sync + 'static,
    R: Reclaim<T, ArcDeleter>,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> fmt::Debug for ConcurrentSharedPtr<T, R>
where
    T: Send + Sync + 'static,
    R: Reclaim<T, ArcDeleter>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentSharedPtr")
            .field("empty", &self.is_empty())
            .finish()
    }
}
