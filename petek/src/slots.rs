//! Fixed table of per-thread publication slots.
//!
//! Epoch reservations and hazard pointers share the same shape: a fixed
//! array of cache-padded atomic words, one claimed per participating thread,
//! written by its owner and scanned by retiring writers. Fixed slots rather
//! than per-thread structures keep the scan bounded and allocation-free.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crossbeam_utils::CachePadded;

/// Maximum number of concurrently registered threads per table.
///
/// Slots are released on thread exit, so this bounds *concurrent* threads,
/// not the total over a table's lifetime.
pub(crate) const MAX_THREADS: usize = 128;

struct Slot {
    claimed: AtomicBool,
    value: AtomicU64,
}

pub(crate) struct SlotTable {
    slots: Box<[CachePadded<Slot>]>,
    vacant: u64,
}

impl SlotTable {
    /// Create a table whose unclaimed and freshly claimed slots read `vacant`.
    pub(crate) fn new(vacant: u64) -> Self {
        let slots = (0..MAX_THREADS)
            .map(|_| {
                CachePadded::new(Slot {
                    claimed: AtomicBool::new(false),
                    value: AtomicU64::new(vacant),
                })
            })
            .collect();
        Self { slots, vacant }
    }

    /// Claim a free slot for the calling thread.
    pub(crate) fn claim(&self) -> usize {
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.claimed.load(Ordering::Relaxed)
                && slot
                    .claimed
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                slot.value.store(self.vacant, Ordering::Release);
                return index;
            }
        }
        panic!(
            "slot table exhausted: more than {} threads concurrently using one cell",
            MAX_THREADS
        );
    }

    /// Release a slot claimed by [`claim`](Self::claim).
    pub(crate) fn release(&self, index: usize) {
        let slot = &self.slots[index];
        slot.value.store(self.vacant, Ordering::Release);
        slot.claimed.store(false, Ordering::Release);
    }

    /// Publish `value` into `index` with sequentially consistent ordering.
    ///
    /// Pairs with the `fence(SeqCst)` retiring writers issue before
    /// [`values`](Self::values).
    #[inline]
    pub(crate) fn publish(&self, index: usize, value: u64) {
        self.slots[index].value.store(value, Ordering::SeqCst);
    }

    /// Clear `index` back to the vacant value.
    #[inline]
    pub(crate) fn retract(&self, index: usize) {
        self.slots[index].value.store(self.vacant, Ordering::Release);
    }

    /// Value currently published in `index`. Exact only for the slot's
    /// owning thread, which is the sole writer.
    #[inline]
    pub(crate) fn get(&self, index: usize) -> u64 {
        self.slots[index].value.load(Ordering::Relaxed)
    }

    /// Snapshot every slot value. Callers fence before scanning.
    pub(crate) fn values(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots.iter().map(|slot| slot.value.load(Ordering::Acquire))
    }

}
