//! Epoch-based reclamation.
//!
//! One epoch counter and three retirement buckets per cell. A reader
//! publishes the epoch it observed into its slot for the duration of the
//! critical section. A writer pins itself the same way before unlinking:
//! it publishes an epoch, fences, and confirms the counter still matches,
//! so from that point the global epoch can move at most one step ahead of
//! the pin. The swapped-out pointer is filed into the bucket of the pinned
//! epoch, which ties "the object left the cell" and "which bucket holds
//! it" to one epoch value a concurrent sweep must respect.
//!
//! Advancing from `E` to `E + 1` requires every active slot to read
//! exactly `E`; the winner then sweeps the bucket of epoch `E - 2`
//! (mod 3). Bucket numbers cycle every three epochs, so a retirement
//! pinned at `E + 1` can race into the very bucket number being swept.
//! Every entry therefore carries the epoch it was retired under, and the
//! sweep frees only entries at least two epochs behind — anything fresher
//! goes back on the list for a later pass.
//!
//! A reader or writer that published a stale epoch only delays
//! reclamation, never breaks it: advances stall until the slot retracts.

use crate::deleter::{BoxDeleter, Deleter};
use crate::reclaim::Reclaim;
use crate::retired::{Retired, RetireList};
use crate::slots::SlotTable;
use crate::tls;
use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

/// Slot value of a thread with no critical section in flight.
const IDLE: u64 = u64::MAX;

/// Retirements between advance attempts.
const ADVANCE_EVERY: u64 = 64;

struct EpochShared {
    epoch: AtomicU64,
    slots: SlotTable,
    buckets: [RetireList; 3],
    retire_count: AtomicU64,
}

/// Per-thread reservation; releases the slot when the thread exits.
struct ThreadSlot {
    shared: Arc<EpochShared>,
    index: usize,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        self.shared.slots.release(self.index);
    }
}

/// Epoch-based reclamation strategy.
///
/// Reads cost one slot publication and one fence; writes pin the slot the
/// same way around the swap and push onto a lock-free bucket, with an
/// inline sweep every [`ADVANCE_EVERY`] retirements.
pub struct Epoch<T: Send + Sync + 'static, D: Deleter<T> = BoxDeleter> {
    cell: AtomicPtr<T>,
    shared: Arc<EpochShared>,
    id: u64,
    _marker: PhantomData<(fn(T) -> T, D)>,
}

// SAFETY: the raw cell contents are only handed out under the protection
// protocol; T itself is Send + Sync.
unsafe impl<T: Send + Sync + 'static, D: Deleter<T>> Send for Epoch<T, D> {}
unsafe impl<T: Send + Sync + 'static, D: Deleter<T>> Sync for Epoch<T, D> {}

impl<T: Send + Sync + 'static, D: Deleter<T>> Epoch<T, D> {
    fn thread_slot(&self) -> usize {
        let shared = &self.shared;
        tls::with_instance(
            self.id,
            || ThreadSlot {
                shared: shared.clone(),
                index: shared.slots.claim(),
            },
            |slot| slot.index,
        )
    }

    /// Advance the epoch and sweep the newly safe bucket. Fails if any
    /// active reader or writer is not at the current epoch, or if another
    /// thread wins the advance.
    fn try_advance(&self) -> bool {
        let shared = &self.shared;
        let epoch = shared.epoch.load(Ordering::SeqCst);
        // Pairs with the SeqCst slot publication in protect()/replace().
        fence(Ordering::SeqCst);
        for value in shared.slots.values() {
            if value != IDLE && value != epoch {
                return false;
            }
        }
        if shared
            .epoch
            .compare_exchange(epoch, epoch + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        // (epoch + 1) % 3 == (epoch - 2) % 3: the settled entries here are
        // two epochs old. A retirement pinned at the just-advanced epoch
        // can race into this same bucket number, so each entry's own epoch
        // decides: only those at least two epochs behind are freed, the
        // rest are re-filed for a later sweep.
        let bucket = &shared.buckets[((epoch + 1) % 3) as usize];
        for (retired_at, entry) in bucket.take_all() {
            if retired_at + 2 <= epoch {
                unsafe { entry.reclaim() };
            } else {
                bucket.push(entry, retired_at);
            }
        }
        true
    }
}

unsafe impl<T: Send + Sync + 'static, D: Deleter<T>> Reclaim<T, D> for Epoch<T, D> {
    fn empty() -> Self {
        Self {
            cell: AtomicPtr::new(core::ptr::null_mut()),
            shared: Arc::new(EpochShared {
                epoch: AtomicU64::new(0),
                slots: SlotTable::new(IDLE),
                buckets: [RetireList::new(), RetireList::new(), RetireList::new()],
                retire_count: AtomicU64::new(0),
            }),
            id: tls::next_instance_id(),
            _marker: PhantomData,
        }
    }

    fn protect(&self) -> *mut T {
        let index = self.thread_slot();
        debug_assert_eq!(
            self.shared.slots.get(index),
            IDLE,
            "read_lock while a read is already active on this thread"
        );
        let epoch = self.shared.epoch.load(Ordering::Acquire);
        self.shared.slots.publish(index, epoch);
        // StoreLoad: the publication must be visible to any writer that
        // could free what the next load observes.
        fence(Ordering::SeqCst);
        self.cell.load(Ordering::Acquire)
    }

    fn release(&self) {
        let index = self.thread_slot();
        debug_assert_ne!(
            self.shared.slots.get(index),
            IDLE,
            "read_unlock without a matching read_lock"
        );
        self.shared.slots.retract(index);
    }

    fn replace(&self, new: *mut T) {
        let shared = &self.shared;
        let index = self.thread_slot();
        let pinned = shared.slots.get(index);
        let epoch = if pinned != IDLE {
            // The thread is already inside a critical section; its slot is
            // holding advances back, so the unlink files under that epoch.
            pinned
        } else {
            // Pin before the unlink. The confirm load is SeqCst: an
            // advance whose scan ran before this publication is ordered
            // before the confirm, so the confirm observes it and re-pins.
            // Once confirmed, the epoch can move at most one step ahead
            // while the slot is held, and the bucket chosen here can never
            // be one a sweep is freeing settled entries from.
            let mut epoch = shared.epoch.load(Ordering::Acquire);
            loop {
                shared.slots.publish(index, epoch);
                fence(Ordering::SeqCst);
                let current = shared.epoch.load(Ordering::SeqCst);
                if current == epoch {
                    break;
                }
                epoch = current;
            }
            epoch
        };

        let old = self.cell.swap(new, Ordering::AcqRel);
        let retired = !old.is_null();
        if retired {
            shared.buckets[(epoch % 3) as usize].push(Retired::new::<T, D>(old), epoch);
        }

        if pinned == IDLE {
            shared.slots.retract(index);
        }

        if retired
            && shared.retire_count.fetch_add(1, Ordering::Relaxed) % ADVANCE_EVERY
                == ADVANCE_EVERY - 1
        {
            self.try_advance();
        }
    }

    fn is_empty(&self) -> bool {
        self.cell.load(Ordering::Acquire).is_null()
    }

    fn flush(&self) {
        for _ in 0..3 {
            if !self.try_advance() {
                break;
            }
        }
    }
}

impl<T: Send + Sync + 'static, D: Deleter<T>> Drop for Epoch<T, D> {
    fn drop(&mut self) {
        tls::remove_instance(self.id);
        let current = self.cell.swap(core::ptr::null_mut(), Ordering::Relaxed);
        if !current.is_null() {
            unsafe { D::delete(current) };
        }
        for bucket in &self.shared.buckets {
            for (_, entry) in bucket.take_all() {
                unsafe { entry.reclaim() };
            }
        }
    }
}
