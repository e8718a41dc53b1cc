//! Deleters: how a retired raw pointer is returned to the allocator.
//!
//! A reclamation strategy decides *when* a retired pointer may be freed;
//! the deleter decides *how*. [`BoxDeleter`] frees a pointer produced by
//! `Box::into_raw`. [`ArcDeleter`] releases one strong count of a pointer
//! produced by `Arc::into_raw`, which is what lets the shared-pointer cell
//! retire control blocks instead of bare values.

use std::sync::Arc;

/// Frees a retired raw pointer.
///
/// Deleters are stateless; the strategy invokes them through the type only.
pub trait Deleter<T>: Send + Sync + 'static {
    /// Free `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must originate from this deleter's paired allocation scheme,
    /// must not be null, and must be deleted exactly once.
    unsafe fn delete(ptr: *mut T);
}

/// Deleter for pointers produced by `Box::into_raw`.
pub struct BoxDeleter;

impl<T: 'static> Deleter<T> for BoxDeleter {
    unsafe fn delete(ptr: *mut T) {
        drop(unsafe { Box::from_raw(ptr) });
    }
}

/// Deleter for pointers produced by `Arc::into_raw`.
///
/// Releases one strong count; the pointee is dropped only when the last
/// outstanding `Arc` clone goes away.
pub struct ArcDeleter;

impl<T: Send + Sync + 'static> Deleter<T> for ArcDeleter {
    unsafe fn delete(ptr: *mut T) {
        unsafe { Arc::decrement_strong_count(ptr as *const T) };
    }
}
