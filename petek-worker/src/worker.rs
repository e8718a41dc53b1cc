use crate::error::PostError;
use crate::group::GroupCore;
use crate::poller::Poller;
use crate::wheel::{Expired, TimerTask, TimerWheel};
use petek_queue::Inbox;
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// Tasks drained per loop iteration before timers get a turn.
pub(crate) const BATCH_MAX: usize = 32;

/// Longest a worker blocks in its poller or inbox wait before re-checking
/// timers and the stop flag.
pub(crate) const POLL_QUANTUM_MS: u64 = 10;

/// A posted unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: Cell<*const Worker> = const { Cell::new(ptr::null()) };
}

/// A pinned worker: one thread, one inbox, one timer wheel, optionally one
/// poller. Lives on its own thread for the whole lifetime of the group.
///
/// Inside a task, [`Worker::with_current`] resolves to the executing
/// worker, which can then inspect its identity, post follow-up work, or
/// install timers directly into its own wheel.
pub struct Worker {
    core: Arc<GroupCore>,
    id: usize,
    wheel: RefCell<TimerWheel>,
    poller: RefCell<Option<Box<dyn Poller>>>,
}

impl Worker {
    /// Run `f` against the worker executing on this thread, or return
    /// `None` when called from a non-worker thread.
    pub fn with_current<F, R>(f: F) -> Option<R>
    where
        F: FnOnce(&Worker) -> R,
    {
        CURRENT.with(|cell| {
            let worker = cell.get();
            if worker.is_null() {
                None
            } else {
                // SAFETY: the pointer is installed by the worker loop and
                // cleared before the Worker leaves the stack; it is only
                // observable from the worker's own thread.
                Some(f(unsafe { &*worker }))
            }
        })
    }

    /// Whether the calling thread is a worker of any group.
    pub fn on_worker_thread() -> bool {
        CURRENT.with(|cell| !cell.get().is_null())
    }

    /// This worker's id within its group, in `[0, group_size)`.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The owning group's process-unique instance id.
    pub fn group_id(&self) -> u64 {
        self.core.instance_id
    }

    /// Number of workers in the owning group.
    pub fn group_size(&self) -> usize {
        self.core.worker_num
    }

    /// Post a task back to this worker. Shorthand for targeting one's own
    /// id through the group; the worker thread acts as an ordinary
    /// producer, so per-producer FIFO applies.
    pub fn post_task(&self, f: impl FnOnce() + Send + 'static) -> Result<(), PostError> {
        self.core.post_to(self.id, Box::new(f))
    }

    /// Install a one-shot timer in this worker's wheel.
    pub fn schedule(&self, delay_ms: u64, f: impl FnOnce() + Send + 'static) {
        self.schedule_boxed(delay_ms, Box::new(f));
    }

    /// Install a periodic timer in this worker's wheel. It re-arms after
    /// every firing and stops when the worker exits its loop.
    pub fn schedule_periodic(&self, period_ms: u64, f: impl FnMut() + Send + 'static) {
        self.schedule_periodic_boxed(period_ms, Box::new(f));
    }

    pub(crate) fn schedule_boxed(&self, delay_ms: u64, f: Task) {
        let mut wheel = self.wheel.borrow_mut();
        let now = self.core.now_ms().max(wheel.now());
        wheel.schedule_at(now + delay_ms.max(1), TimerTask::Once(f));
    }

    pub(crate) fn schedule_periodic_boxed(&self, period_ms: u64, f: Box<dyn FnMut() + Send>) {
        let period_ms = period_ms.max(1);
        let mut wheel = self.wheel.borrow_mut();
        let now = self.core.now_ms().max(wheel.now());
        wheel.schedule_at(now + period_ms, TimerTask::Every { period_ms, f });
    }

    /// Whether this worker has a poller installed.
    pub fn has_poller(&self) -> bool {
        self.poller.borrow().is_some()
    }

    /// Run `f` against this worker's poller, if any.
    ///
    /// Must not be called from inside `Poller::poll` itself.
    pub fn with_poller<R>(&self, f: impl FnOnce(&mut dyn Poller) -> R) -> Option<R> {
        self.poller.borrow_mut().as_mut().map(|poller| f(poller.as_mut()))
    }

    fn invoke(&self, task: Task) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
            (self.core.panic_hook)(payload);
        }
    }

    /// Advance the wheel and run what came due. Periodic entries re-arm
    /// from their own deadline; after an overrun of more than one period
    /// they re-arm from now instead, so a stalled worker does not replay a
    /// storm of missed ticks.
    fn fire_due(&self, now: u64, scratch: &mut Vec<Expired>) -> usize {
        self.wheel.borrow_mut().advance_to(now, scratch);
        let fired = scratch.len();
        for expired in scratch.drain(..) {
            match expired.task {
                TimerTask::Once(f) => self.invoke(f),
                TimerTask::Every { period_ms, mut f } => {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(&mut f)) {
                        (self.core.panic_hook)(payload);
                    }
                    let target = expired.deadline + period_ms;
                    let next = if target > now { target } else { now + period_ms };
                    self.wheel
                        .borrow_mut()
                        .schedule_at(next, TimerTask::Every { period_ms, f });
                }
            }
        }
        fired
    }

    /// Milliseconds the quiescent step may block: zero if a timer is due,
    /// otherwise the time to the nearest timer capped at the poll quantum.
    fn idle_timeout(&self, now: u64) -> u64 {
        match self.wheel.borrow_mut().next_deadline() {
            Some(deadline) if deadline <= now => 0,
            Some(deadline) => (deadline - now).min(POLL_QUANTUM_MS),
            None => POLL_QUANTUM_MS,
        }
    }
}

pub(crate) fn run(
    core: Arc<GroupCore>,
    id: usize,
    mut inbox: Inbox<Task>,
    poller: Option<Box<dyn Poller>>,
) {
    let worker = Worker {
        wheel: RefCell::new(TimerWheel::new(core.now_ms())),
        poller: RefCell::new(poller),
        core,
        id,
    };
    CURRENT.with(|cell| cell.set(&worker as *const Worker));
    tracing::debug!(group = worker.core.instance_id, worker = id, "worker started");

    let mut scratch = Vec::new();
    loop {
        let batched = inbox.pop_batch(BATCH_MAX, |task| worker.invoke(task));

        let now = worker.core.now_ms();
        let fired = worker.fire_due(now, &mut scratch);

        if worker.core.stops[id].load(Ordering::Acquire) {
            break;
        }

        let timeout_ms = if batched > 0 || fired > 0 {
            0
        } else {
            worker.idle_timeout(now)
        };
        let polled = worker.with_poller(|poller| poller.poll(timeout_ms)).is_some();
        if !polled && timeout_ms > 0 {
            inbox.wait(Duration::from_millis(timeout_ms));
        }

        if worker.core.stops[id].load(Ordering::Acquire) {
            break;
        }
    }

    CURRENT.with(|cell| cell.set(ptr::null()));
    tracing::debug!(group = worker.core.instance_id, worker = id, "worker stopped");
}
