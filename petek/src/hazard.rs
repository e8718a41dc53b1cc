//! Hazard-pointer reclamation.
//!
//! A reader publishes the exact pointer it is about to dereference into its
//! hazard slot, then re-reads the cell; if the cell moved on, the
//! publication is retried. A writer retires swapped-out pointers into a
//! thread-local list and, once the list exceeds [`SCAN_THRESHOLD`], scans
//! every hazard slot and frees whatever nobody protects. Threads that exit
//! with pending retirements park them in an orphan list absorbed by later
//! scans.

use crate::deleter::{BoxDeleter, Deleter};
use crate::reclaim::Reclaim;
use crate::retired::Retired;
use crate::slots::SlotTable;
use crate::tls;
use core::cell::RefCell;
use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicPtr, Ordering};
use crossbeam_utils::Backoff;
use std::sync::{Arc, Mutex};

/// Pending retirements per thread before a scan is forced.
const SCAN_THRESHOLD: usize = 64;

struct HazardShared {
    slots: SlotTable,
    orphans: Mutex<Vec<Retired>>,
}

impl Drop for HazardShared {
    fn drop(&mut self) {
        // Reached only when no cell and no thread reference the table.
        for entry in self.orphans.get_mut().unwrap().drain(..) {
            unsafe { entry.reclaim() };
        }
    }
}

/// Per-thread hazard slot plus the local retire list.
struct ThreadState {
    shared: Arc<HazardShared>,
    index: usize,
    retired: RefCell<Vec<Retired>>,
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        self.shared.slots.release(self.index);
        let mut retired = self.retired.borrow_mut();
        if !retired.is_empty() {
            self.shared.orphans.lock().unwrap().append(&mut retired);
        }
    }
}

/// Hazard-pointer reclamation strategy.
///
/// One hazard slot per thread per cell (protection scopes do not nest, so
/// one is enough). A protected pointer is guaranteed not to be freed while
/// the slot holds it.
pub struct Hazard<T: Send + Sync + 'static, D: Deleter<T> = BoxDeleter> {
    cell: AtomicPtr<T>,
    shared: Arc<HazardShared>,
    id: u64,
    _marker: PhantomData<(fn(T) -> T, D)>,
}

// SAFETY: the raw cell contents are only handed out under the protection
// protocol; T itself is Send + Sync.
unsafe impl<T: Send + Sync + 'static, D: Deleter<T>> Send for Hazard<T, D> {}
unsafe impl<T: Send + Sync + 'static, D: Deleter<T>> Sync for Hazard<T, D> {}

impl<T: Send + Sync + 'static, D: Deleter<T>> Hazard<T, D> {
    fn thread_state<R>(&self, f: impl FnOnce(&ThreadState) -> R) -> R {
        let shared = &self.shared;
        tls::with_instance(
            self.id,
            || ThreadState {
                shared: shared.clone(),
                index: shared.slots.claim(),
                retired: RefCell::new(Vec::new()),
            },
            f,
        )
    }

    /// Partition `retired` into safe-to-free entries (returned) and still
    /// hazardous ones (left in place).
    fn scan(shared: &HazardShared, retired: &mut Vec<Retired>) -> Vec<Retired> {
        if let Ok(mut orphans) = shared.orphans.try_lock() {
            retired.append(&mut orphans);
        }
        // Pairs with the SeqCst slot publication in protect().
        fence(Ordering::SeqCst);
        let hazards: Vec<u64> = shared.slots.values().filter(|&v| v != 0).collect();
        let mut safe = Vec::with_capacity(retired.len());
        let mut kept = Vec::new();
        for entry in retired.drain(..) {
            if hazards.contains(&entry.addr()) {
                kept.push(entry);
            } else {
                safe.push(entry);
            }
        }
        *retired = kept;
        safe
    }
}

unsafe impl<T: Send + Sync + 'static, D: Deleter<T>> Reclaim<T, D> for Hazard<T, D> {
    fn empty() -> Self {
        Self {
            cell: AtomicPtr::new(core::ptr::null_mut()),
            shared: Arc::new(HazardShared {
                slots: SlotTable::new(0),
                orphans: Mutex::new(Vec::new()),
            }),
            id: tls::next_instance_id(),
            _marker: PhantomData,
        }
    }

    fn protect(&self) -> *mut T {
        let index = self.thread_state(|state| state.index);
        debug_assert_eq!(
            self.shared.slots.get(index),
            0,
            "read_lock while a read is already active on this thread"
        );
        let backoff = Backoff::new();
        loop {
            let ptr = self.cell.load(Ordering::Acquire);
            if ptr.is_null() {
                self.shared.slots.retract(index);
                return core::ptr::null_mut();
            }
            self.shared.slots.publish(index, ptr as u64);
            // StoreLoad: the publication must be visible to any writer that
            // could free what the next load confirms.
            fence(Ordering::SeqCst);
            if self.cell.load(Ordering::Acquire) == ptr {
                return ptr;
            }
            backoff.spin();
        }
    }

    fn release(&self) {
        let index = self.thread_state(|state| state.index);
        self.shared.slots.retract(index);
    }

    fn replace(&self, new: *mut T) {
        let old = self.cell.swap(new, Ordering::AcqRel);
        if old.is_null() {
            return;
        }
        let safe = self.thread_state(|state| {
            let mut retired = state.retired.borrow_mut();
            retired.push(Retired::new::<T, D>(old));
            if retired.len() >= SCAN_THRESHOLD {
                Some(Self::scan(&self.shared, &mut retired))
            } else {
                None
            }
        });
        // Deleters run outside the thread-state borrow; a destructor may
        // itself touch concurrent pointers.
        if let Some(safe) = safe {
            for entry in safe {
                unsafe { entry.reclaim() };
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.cell.load(Ordering::Acquire).is_null()
    }

    fn flush(&self) {
        let safe = self.thread_state(|state| {
            let mut retired = state.retired.borrow_mut();
            Self::scan(&self.shared, &mut retired)
        });
        for entry in safe {
            unsafe { entry.reclaim() };
        }
    }
}

impl<T: Send + Sync + 'static, D: Deleter<T>> Drop for Hazard<T, D> {
    fn drop(&mut self) {
        let current = self.cell.swap(core::ptr::null_mut(), Ordering::Relaxed);
        if !current.is_null() {
            unsafe { D::delete(current) };
        }
        // No readers can exist here; everything pending on this thread and
        // in the orphan list is safe.
        let mut pending: Vec<Retired> = tls::try_with_instance(self.id, |state: &ThreadState| {
            core::mem::take(&mut *state.retired.borrow_mut())
        })
        .unwrap_or_default();
        tls::remove_instance(self.id);
        if let Ok(mut orphans) = self.shared.orphans.lock() {
            pending.append(&mut orphans);
        }
        for entry in pending {
            unsafe { entry.reclaim() };
        }
    }
}
