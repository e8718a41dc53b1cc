//! Integration tests for `ConcurrentPtr` across all three reclamation
//! strategies. Each suite is instantiated once per strategy so every
//! invariant is checked against every protect/release/retire protocol.

use petek::{BoxDeleter, ConcurrentPtr, Epoch, Hazard, Reclaim, RefCount};
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;
use std::thread;

// ============================================================================
// Helper: allocation-traced value
// ============================================================================

/// Tracks live instances through a shared counter and poisons `val` on drop,
/// so a use-after-free read shows up as `val != 1`.
struct Traceable {
    val: u32,
    live: Arc<AtomicIsize>,
}

impl Traceable {
    fn new(live: &Arc<AtomicIsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            val: 1,
            live: live.clone(),
        }
    }
}

impl Drop for Traceable {
    fn drop(&mut self) {
        self.val = 0;
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

macro_rules! strategy_suite {
    ($name:ident, $strategy:ty) => {
        mod $name {
            use super::*;

            type Cell = ConcurrentPtr<Traceable, BoxDeleter, $strategy>;

            #[test]
            fn read_lock_roundtrip() {
                let live = Arc::new(AtomicIsize::new(0));
                let cell = Cell::new();

                let value = Box::new(Traceable::new(&live));
                let raw = &*value as *const Traceable as *mut Traceable;
                cell.reset(value);
                assert_eq!(live.load(Ordering::SeqCst), 1);

                let ptr = cell.read_lock();
                assert_eq!(ptr, raw);
                assert_eq!(unsafe { (*ptr).val }, 1);
                cell.read_unlock();

                cell.clear();
                assert_eq!(live.load(Ordering::SeqCst), 0);
            }

            #[test]
            fn reader_guard() {
                let live = Arc::new(AtomicIsize::new(0));
                let cell = Cell::new();
                cell.reset(Box::new(Traceable::new(&live)));
                {
                    let reader = cell.read().expect("cell holds a value");
                    assert_eq!(reader.val, 1);
                    assert!(!reader.get().is_null());
                }
                cell.clear();
                assert_eq!(live.load(Ordering::SeqCst), 0);
            }

            #[test]
            fn reset_replaces_value() {
                let live = Arc::new(AtomicIsize::new(0));
                let cell = Cell::new();

                cell.reset(Box::new(Traceable::new(&live)));
                {
                    let reader = cell.read().unwrap();
                    assert_eq!(reader.val, 1);
                }
                cell.reset(Box::new(Traceable::new(&live)));
                {
                    let reader = cell.read().unwrap();
                    assert_eq!(reader.val, 1);
                }
                cell.clear();
                assert_eq!(live.load(Ordering::SeqCst), 0);
            }

            #[test]
            fn empty_cell_reads_null() {
                let cell = Cell::new();
                assert!(cell.is_empty());
                assert!(cell.read_lock().is_null());
                cell.read_unlock();
                assert!(cell.read().is_none());
            }

            #[test]
            fn clear_is_idempotent() {
                let live = Arc::new(AtomicIsize::new(0));
                let cell = Cell::new();
                cell.reset(Box::new(Traceable::new(&live)));
                cell.clear();
                assert_eq!(live.load(Ordering::SeqCst), 0);
                cell.clear();
                assert_eq!(live.load(Ordering::SeqCst), 0);
                assert!(cell.is_empty());
            }

            #[test]
            fn with_value_starts_filled() {
                let live = Arc::new(AtomicIsize::new(0));
                let cell = Cell::with_value(Box::new(Traceable::new(&live)));
                assert!(!cell.is_empty());
                cell.clear();
                assert_eq!(live.load(Ordering::SeqCst), 0);
            }

            /// Many resets from one thread: exercises the retire batching
            /// thresholds (epoch advances, hazard scans) end to end.
            #[test]
            fn sequential_resets_reclaim_everything() {
                let live = Arc::new(AtomicIsize::new(0));
                let cell = Cell::new();
                for _ in 0..1_000 {
                    cell.reset(Box::new(Traceable::new(&live)));
                }
                cell.clear();
                assert_eq!(live.load(Ordering::SeqCst), 0);
            }

            /// Two readers spin on the cell while a writer keeps resetting.
            /// Readers must always observe a live value; after teardown the
            /// allocation count returns to zero.
            #[test]
            #[cfg_attr(miri, ignore)]
            fn concurrent_readers_and_writer() {
                const RESETS: usize = 20_000;

                let live = Arc::new(AtomicIsize::new(0));
                let cell = Arc::new(Cell::new());
                cell.reset(Box::new(Traceable::new(&live)));

                let stop = Arc::new(AtomicBool::new(false));
                let mut readers = Vec::new();
                for _ in 0..2 {
                    let cell = cell.clone();
                    let stop = stop.clone();
                    readers.push(thread::spawn(move || {
                        while !stop.load(Ordering::Relaxed) {
                            if let Some(reader) = cell.read() {
                                for _ in 0..100 {
                                    assert_eq!(reader.val, 1);
                                }
                            }
                        }
                    }));
                }

                let writer = {
                    let cell = cell.clone();
                    let live = live.clone();
                    thread::spawn(move || {
                        for _ in 0..RESETS {
                            cell.reset(Box::new(Traceable::new(&live)));
                        }
                    })
                };

                writer.join().unwrap();
                stop.store(true, Ordering::Relaxed);
                for reader in readers {
                    reader.join().unwrap();
                }

                cell.clear();
                assert_eq!(live.load(Ordering::SeqCst), 0);
            }

            /// A guard taken before a reset keeps observing the old value.
            #[test]
            fn guard_survives_reset() {
                let live = Arc::new(AtomicIsize::new(0));
                let cell = Cell::new();
                cell.reset(Box::new(Traceable::new(&live)));

                let reader = cell.read().unwrap();
                cell.reset(Box::new(Traceable::new(&live)));
                assert_eq!(reader.val, 1);
                drop(reader);

                cell.clear();
                assert_eq!(live.load(Ordering::SeqCst), 0);
            }
        }
    };
}

strategy_suite!(refcount, RefCount<Traceable>);
strategy_suite!(epoch, Epoch<Traceable>);
strategy_suite!(hazard, Hazard<Traceable>);

// ============================================================================
// Value round-trip
// ============================================================================

fn roundtrip<R: Reclaim<u64, BoxDeleter> + 'static>() {
    let cell: ConcurrentPtr<u64, BoxDeleter, R> = ConcurrentPtr::new();
    cell.reset(Box::new(1234));
    {
        let reader = cell.read().unwrap();
        assert_eq!(*reader, 1234);
    }
    cell.reset(Box::new(5678));
    assert_eq!(*cell.read().unwrap(), 5678);
    cell.clear();
    assert!(cell.is_empty());
}

#[test]
fn value_roundtrip_refcount() {
    roundtrip::<RefCount<u64>>();
}

#[test]
fn value_roundtrip_epoch() {
    roundtrip::<Epoch<u64>>();
}

#[test]
fn value_roundtrip_hazard() {
    roundtrip::<Hazard<u64>>();
}
