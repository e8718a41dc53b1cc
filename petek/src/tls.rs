//! Instance-tagged thread-local registry.
//!
//! Every strategy instance draws a process-unique id and keeps its per-thread
//! state (claimed slot index, pending retire list, active read record) in a
//! thread-local map keyed by that id. Two instances therefore never alias
//! each other's thread state, and a thread that exits drops its entries,
//! releasing whatever they hold.

use core::any::Any;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};
use foldhash::fast::FixedState;
use std::collections::HashMap;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Issue a process-unique instance id. Never reused.
pub(crate) fn next_instance_id() -> u64 {
    NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static REGISTRY: RefCell<HashMap<u64, Box<dyn Any>, FixedState>> =
        RefCell::new(HashMap::with_hasher(FixedState::default()));
}

/// Run `f` with this thread's state for instance `id`, creating it with
/// `init` on first use.
///
/// `f` must not re-enter the registry (no nested `with_instance` and no user
/// code such as destructors); callers collect work inside `f` and perform it
/// after returning.
pub(crate) fn with_instance<V, R>(id: u64, init: impl FnOnce() -> V, f: impl FnOnce(&V) -> R) -> R
where
    V: 'static,
{
    REGISTRY.with(|registry| {
        let mut registry = registry.borrow_mut();
        let entry = registry.entry(id).or_insert_with(|| Box::new(init()));
        let value = entry
            .downcast_ref::<V>()
            .expect("instance id reused with a different state type");
        f(value)
    })
}

/// Like [`with_instance`] but never creates the entry.
pub(crate) fn try_with_instance<V, R>(id: u64, f: impl FnOnce(&V) -> R) -> Option<R>
where
    V: 'static,
{
    REGISTRY.with(|registry| {
        let registry = registry.borrow();
        registry.get(&id).and_then(|entry| entry.downcast_ref::<V>()).map(f)
    })
}

/// Drop this thread's state for instance `id`, if any.
///
/// Entries of other threads are untouched; they go away when those threads
/// exit.
pub(crate) fn remove_instance(id: u64) {
    REGISTRY.with(|registry| {
        registry.borrow_mut().remove(&id);
    });
}
