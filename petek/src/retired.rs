//! Type-erased retirement records.

use crate::deleter::Deleter;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A retired pointer paired with the deleter that will free it.
pub(crate) struct Retired {
    ptr: *mut (),
    free: unsafe fn(*mut ()),
}

// SAFETY: a Retired entry is exclusively owned; the pointee is unreachable
// from anywhere but the reclamation machinery.
unsafe impl Send for Retired {}

impl Retired {
    pub(crate) fn new<T, D>(ptr: *mut T) -> Self
    where
        T: Send + Sync + 'static,
        D: Deleter<T>,
    {
        unsafe fn free_with<T, D>(ptr: *mut ())
        where
            T: Send + Sync + 'static,
            D: Deleter<T>,
        {
            unsafe { D::delete(ptr as *mut T) };
        }
        Self {
            ptr: ptr as *mut (),
            free: free_with::<T, D>,
        }
    }

    pub(crate) fn addr(&self) -> u64 {
        self.ptr as u64
    }

    /// Free the pointee.
    ///
    /// # Safety
    ///
    /// No protected view of the pointee may exist in any thread.
    pub(crate) unsafe fn reclaim(self) {
        unsafe { (self.free)(self.ptr) };
    }
}

struct RetiredLink {
    entry: Retired,
    /// Epoch the entry was retired under; the sweep frees an entry only
    /// once this is at least two epochs behind.
    epoch: u64,
    next: *mut RetiredLink,
}

/// Lock-free stack of epoch-tagged retirements (Treiber push, swap-drain).
pub(crate) struct RetireList {
    head: AtomicPtr<RetiredLink>,
}

impl RetireList {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub(crate) fn push(&self, entry: Retired, epoch: u64) {
        let link = Box::into_raw(Box::new(RetiredLink {
            entry,
            epoch,
            next: core::ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*link).next = head };
            match self
                .head
                .compare_exchange_weak(head, link, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Steal the whole list. Pushes that race the steal stay behind for the
    /// next drain.
    pub(crate) fn take_all(&self) -> Vec<(u64, Retired)> {
        let mut link = self.head.swap(core::ptr::null_mut(), Ordering::AcqRel);
        let mut entries = Vec::new();
        while !link.is_null() {
            let boxed = unsafe { Box::from_raw(link) };
            link = boxed.next;
            entries.push((boxed.epoch, boxed.entry));
        }
        entries
    }
}

impl Drop for RetireList {
    fn drop(&mut self) {
        // The list is only dropped once no cell and no thread references it.
        for (_, entry) in self.take_all() {
            unsafe { entry.reclaim() };
        }
    }
}
