//! Reference-counted reclamation over a tagged-pointer cell.
//!
//! The cell is a single `AtomicU64` packing a 48-bit node pointer with a
//! 16-bit generation tag; the tag is bumped on every swap so a compare
//! against the full word detects that the cell changed under a reader.
//!
//! Readers increment the node's count, then revalidate the cell word. The
//! increment can land on a node that was already retired — which is why
//! nodes are type-stable: a node freed of its payload goes onto a per-cell
//! free pool and is reused for later publications, never returned to the
//! allocator until the cell itself is dropped. A stale increment therefore
//! touches valid memory, fails revalidation (the tag moved on), and undoes
//! itself.
//!
//! Progress: lock-free for readers and writers. Frees are immediate once
//! the count drops to zero.

use crate::deleter::{BoxDeleter, Deleter};
use crate::reclaim::Reclaim;
use crate::tls;
use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use crossbeam_utils::Backoff;

#[cfg(not(target_pointer_width = "64"))]
compile_error!(
    "RefCount packs a 48-bit pointer and a 16-bit tag into one word; \
     only 64-bit targets are supported"
);

const PTR_MASK: u64 = (1 << 48) - 1;

#[inline]
fn pack<T>(ptr: *mut RcNode<T>, tag: u16) -> u64 {
    (ptr as u64 & PTR_MASK) | ((tag as u64) << 48)
}

#[inline]
fn unpack<T>(word: u64) -> (*mut RcNode<T>, u16) {
    ((word & PTR_MASK) as usize as *mut RcNode<T>, (word >> 48) as u16)
}

/// Type-stable node: stays allocated for the lifetime of the cell.
///
/// `refs` counts the cell's own reference plus active readers. `pooled`
/// arbitrates the single transition into the free pool so a stale
/// reader's increment/decrement pair can never push a node twice.
struct RcNode<T> {
    refs: AtomicUsize,
    pooled: AtomicBool,
    pool_next: AtomicPtr<RcNode<T>>,
    payload: AtomicPtr<T>,
}

/// Reference-counting reclamation strategy.
///
/// See the [module docs](self) for the protocol. The 16-bit tag wraps after
/// 65536 swaps; an ABA requires an exact wrap-around inside a single
/// reader's load-to-revalidate window, which also requires the same node to
/// cycle through the pool back into the cell in that window.
pub struct RefCount<T: Send + Sync + 'static, D: Deleter<T> = BoxDeleter> {
    /// `[node:48 | tag:16]`, tag incremented on every swap.
    cell: AtomicU64,
    /// Treiber stack of recycled nodes, same packing (tag defeats pop ABA).
    pool: AtomicU64,
    id: u64,
    _marker: PhantomData<(fn(T) -> T, D)>,
}

unsafe impl<T: Send + Sync + 'static, D: Deleter<T>> Send for RefCount<T, D> {}
unsafe impl<T: Send + Sync + 'static, D: Deleter<T>> Sync for RefCount<T, D> {}

impl<T: Send + Sync + 'static, D: Deleter<T>> RefCount<T, D> {
    /// Record the node protected by this thread's active read.
    fn set_active(&self, node: *mut ()) {
        tls::with_instance(
            self.id,
            || Cell::new(ptr::null_mut::<()>()),
            |active| {
                debug_assert!(
                    active.get().is_null(),
                    "read_lock while a read is already active on this thread"
                );
                active.set(node);
            },
        );
    }

    fn take_active(&self) -> *mut () {
        tls::with_instance(
            self.id,
            || Cell::new(ptr::null_mut::<()>()),
            |active| active.replace(ptr::null_mut()),
        )
    }

    /// Drop one reference; the zero transition moves the payload to the
    /// deleter and the node to the pool.
    fn dec_ref(&self, node: *mut RcNode<T>) {
        unsafe {
            if (*node).refs.fetch_sub(1, Ordering::AcqRel) == 1
                && (*node)
                    .pooled
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                let payload = (*node).payload.swap(ptr::null_mut(), Ordering::AcqRel);
                if !payload.is_null() {
                    D::delete(payload);
                }
                self.pool_push(node);
            }
        }
    }

    /// Take a node from the pool or allocate a fresh one, install `payload`
    /// and revive the count.
    ///
    /// Order matters: `pooled` flips to `false` only after `refs >= 1`, so
    /// a stale reader's decrement can never win the pool transition while
    /// the node is being revived.
    fn alloc(&self, payload: *mut T) -> *mut RcNode<T> {
        let node = self.pool_pop().unwrap_or_else(|| {
            Box::into_raw(Box::new(RcNode {
                refs: AtomicUsize::new(0),
                pooled: AtomicBool::new(true),
                pool_next: AtomicPtr::new(ptr::null_mut()),
                payload: AtomicPtr::new(ptr::null_mut()),
            }))
        });
        unsafe {
            (*node).payload.store(payload, Ordering::Relaxed);
            (*node).refs.fetch_add(1, Ordering::AcqRel);
            (*node).pooled.store(false, Ordering::Release);
        }
        node
    }

    fn pool_pop(&self) -> Option<*mut RcNode<T>> {
        let mut word = self.pool.load(Ordering::Acquire);
        loop {
            let (node, tag) = unpack::<T>(word);
            if node.is_null() {
                return None;
            }
            let next = unsafe { (*node).pool_next.load(Ordering::Relaxed) };
            match self.pool.compare_exchange_weak(
                word,
                pack(next, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(node),
                Err(current) => word = current,
            }
        }
    }

    fn pool_push(&self, node: *mut RcNode<T>) {
        let mut word = self.pool.load(Ordering::Relaxed);
        loop {
            let (head, tag) = unpack::<T>(word);
            unsafe { (*node).pool_next.store(head, Ordering::Relaxed) };
            match self.pool.compare_exchange_weak(
                word,
                pack(node, tag.wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(current) => word = current,
            }
        }
    }
}

unsafe impl<T: Send + Sync + 'static, D: Deleter<T>> Reclaim<T, D> for RefCount<T, D> {
    fn empty() -> Self {
        Self {
            cell: AtomicU64::new(0),
            pool: AtomicU64::new(0),
            id: tls::next_instance_id(),
            _marker: PhantomData,
        }
    }

    fn protect(&self) -> *mut T {
        let backoff = Backoff::new();
        loop {
            let word = self.cell.load(Ordering::Acquire);
            let (node, _) = unpack::<T>(word);
            if node.is_null() {
                self.set_active(ptr::null_mut());
                return ptr::null_mut();
            }
            unsafe { (*node).refs.fetch_add(1, Ordering::AcqRel) };
            // Revalidate the full word: the tag catches a swap that recycled
            // the same node address.
            if self.cell.load(Ordering::Acquire) == word {
                self.set_active(node as *mut ());
                return unsafe { (*node).payload.load(Ordering::Acquire) };
            }
            self.dec_ref(node);
            backoff.spin();
        }
    }

    fn release(&self) {
        let node = self.take_active();
        if !node.is_null() {
            self.dec_ref(node as *mut RcNode<T>);
        }
    }

    fn replace(&self, new: *mut T) {
        let node = if new.is_null() {
            ptr::null_mut()
        } else {
            self.alloc(new)
        };
        let mut word = self.cell.load(Ordering::Relaxed);
        loop {
            let (old_node, tag) = unpack::<T>(word);
            match self.cell.compare_exchange_weak(
                word,
                pack(node, tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if !old_node.is_null() {
                        self.dec_ref(old_node);
                    }
                    return;
                }
                Err(current) => word = current,
            }
        }
    }

    fn is_empty(&self) -> bool {
        unpack::<T>(self.cell.load(Ordering::Acquire)).0.is_null()
    }
}

impl<T: Send + Sync + 'static, D: Deleter<T>> Drop for RefCount<T, D> {
    fn drop(&mut self) {
        tls::remove_instance(self.id);

        let (node, _) = unpack::<T>(self.cell.load(Ordering::Relaxed));
        if !node.is_null() {
            unsafe {
                let payload = (*node).payload.swap(ptr::null_mut(), Ordering::Relaxed);
                if !payload.is_null() {
                    D::delete(payload);
                }
                drop(Box::from_raw(node));
            }
        }

        let (mut node, _) = unpack::<T>(self.pool.load(Ordering::Relaxed));
        while !node.is_null() {
            let next = unsafe { (*node).pool_next.load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }
}
