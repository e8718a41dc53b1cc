use crate::error::PostError;
use crate::poller::{Poller, PollerSupplier};
use crate::worker::{self, Task, Worker};
use foldhash::fast::FixedState;
use petek_queue::{DispatchQueue, Outbox};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// Invoked with the panic payload when a posted task panics.
pub type PanicHook = Box<dyn Fn(Box<dyn Any + Send + 'static>) + Send + Sync>;

/// A panicking task is an unrecoverable caller bug by default.
fn default_panic_hook(payload: Box<dyn Any + Send>) {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()));
    tracing::error!(message, "worker task panicked; aborting");
    std::process::abort();
}

/// State shared between the group handle and its worker threads.
///
/// The group owns its workers; each worker holds this back-reference. The
/// join handles live outside it, so teardown order is: stop flags, wake,
/// join, and only then does the core unwind with the last worker.
pub(crate) struct GroupCore {
    pub(crate) queue: DispatchQueue<Task>,
    pub(crate) instance_id: u64,
    pub(crate) worker_num: usize,
    pub(crate) stopping: AtomicBool,
    pub(crate) stops: Box<[AtomicBool]>,
    epoch: Instant,
    pub(crate) panic_hook: PanicHook,
}

impl GroupCore {
    /// Milliseconds since group construction; the time base of every
    /// worker's wheel.
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn post(&self, task: Task) -> Result<(), PostError> {
        if self.stopping.load(Ordering::Acquire) {
            return Err(PostError::ShuttingDown);
        }
        let worker_num = self.worker_num;
        with_context(self, |context| {
            let target = context.cursor % worker_num;
            context.cursor = context.cursor.wrapping_add(1);
            context.push_to(target, task)
        })
    }

    pub(crate) fn post_to(&self, worker_id: usize, task: Task) -> Result<(), PostError> {
        if worker_id >= self.worker_num {
            return Err(PostError::InvalidWorker(worker_id));
        }
        if self.stopping.load(Ordering::Acquire) {
            return Err(PostError::ShuttingDown);
        }
        with_context(self, |context| context.push_to(worker_id, task))
    }
}

/// Per-producer-thread state for one group: the queue handle plus one
/// lazily registered outbox per worker and the round-robin cursor.
///
/// Outbox identity is stable across posts from the same thread, which is
/// what gives per-producer FIFO per worker. Dropping the context (thread
/// exit) unregisters every outbox.
struct ClientContext {
    queue: DispatchQueue<Task>,
    outboxes: Vec<Option<Outbox<Task>>>,
    cursor: usize,
}

impl ClientContext {
    fn new(queue: DispatchQueue<Task>, worker_num: usize) -> Self {
        Self {
            queue,
            outboxes: (0..worker_num).map(|_| None).collect(),
            cursor: 0,
        }
    }

    fn push_to(&mut self, worker_id: usize, task: Task) -> Result<(), PostError> {
        let outbox = match &mut self.outboxes[worker_id] {
            Some(outbox) => outbox,
            slot => {
                let outbox = self
                    .queue
                    .register_outbox(worker_id)
                    .map_err(|_| PostError::QueueFull)?;
                slot.insert(outbox)
            }
        };
        outbox.push(task).map_err(|_| PostError::QueueFull)
    }
}

thread_local! {
    /// Client contexts of this thread, keyed by group instance id. Two
    /// coexisting groups never alias because instance ids are never reused.
    static CONTEXTS: RefCell<HashMap<u64, ClientContext, FixedState>> =
        RefCell::new(HashMap::with_hasher(FixedState::default()));
}

fn with_context<R>(core: &GroupCore, f: impl FnOnce(&mut ClientContext) -> R) -> R {
    CONTEXTS.with(|contexts| {
        let mut contexts = contexts.borrow_mut();
        let context = contexts
            .entry(core.instance_id)
            .or_insert_with(|| ClientContext::new(core.queue.clone(), core.worker_num));
        f(context)
    })
}

/// Configuration for [`WorkerGroup::with_options`].
pub struct GroupOptions {
    worker_num: usize,
    queue_size: usize,
    poller_supplier: Option<PollerSupplier>,
    panic_hook: Option<PanicHook>,
}

impl GroupOptions {
    /// `worker_num` threads, `queue_size` slots per outbox ring.
    pub fn new(worker_num: usize, queue_size: usize) -> Self {
        Self {
            worker_num,
            queue_size,
            poller_supplier: None,
            panic_hook: None,
        }
    }

    /// Install a poller factory, called once per worker id.
    pub fn poller_supplier(
        mut self,
        supplier: impl FnMut(usize) -> Option<Box<dyn Poller>> + Send + 'static,
    ) -> Self {
        self.poller_supplier = Some(Box::new(supplier));
        self
    }

    /// Replace the default task-panic policy (log and abort the process).
    pub fn panic_hook(
        mut self,
        hook: impl Fn(Box<dyn Any + Send + 'static>) + Send + Sync + 'static,
    ) -> Self {
        self.panic_hook = Some(Box::new(hook));
        self
    }
}

/// A fixed pool of pinned worker threads.
///
/// All workers start before the constructor returns. Dropping the group
/// sets every worker's stop flag, wakes them, joins their threads, and
/// discards whatever was still queued; in-flight tasks complete first.
pub struct WorkerGroup {
    core: Arc<GroupCore>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// A group with `worker_num` workers and `queue_size`-slot outboxes.
    ///
    /// # Panics
    ///
    /// Panics if either argument is zero, or if a worker thread cannot be
    /// spawned (construction is all-or-nothing).
    pub fn new(worker_num: usize, queue_size: usize) -> Self {
        Self::with_options(GroupOptions::new(worker_num, queue_size))
    }

    /// Like [`new`](Self::new), with a poller installed per worker.
    pub fn with_pollers(
        worker_num: usize,
        queue_size: usize,
        supplier: impl FnMut(usize) -> Option<Box<dyn Poller>> + Send + 'static,
    ) -> Self {
        Self::with_options(GroupOptions::new(worker_num, queue_size).poller_supplier(supplier))
    }

    /// Build from explicit options.
    pub fn with_options(options: GroupOptions) -> Self {
        assert!(options.worker_num > 0, "worker_num must be positive");
        assert!(options.queue_size > 0, "queue_size must be positive");

        let queue = DispatchQueue::new(options.worker_num, options.queue_size);
        let core = Arc::new(GroupCore {
            queue: queue.clone(),
            instance_id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            worker_num: options.worker_num,
            stopping: AtomicBool::new(false),
            stops: (0..options.worker_num).map(|_| AtomicBool::new(false)).collect(),
            epoch: Instant::now(),
            panic_hook: options.panic_hook.unwrap_or_else(|| Box::new(default_panic_hook)),
        });

        let mut supplier = options.poller_supplier;
        let mut handles = Vec::with_capacity(options.worker_num);
        for id in 0..options.worker_num {
            let inbox = queue.take_inbox(id);
            let poller = supplier.as_mut().and_then(|supplier| supplier(id));
            let core = core.clone();
            let handle = thread::Builder::new()
                .name(format!("petek-worker-{}", id))
                .spawn(move || worker::run(core, id, inbox, poller))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        tracing::debug!(
            group = core.instance_id,
            workers = core.worker_num,
            "worker group started"
        );
        Self { core, handles }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.core.worker_num
    }

    /// Process-unique instance id of this group.
    pub fn id(&self) -> u64 {
        self.core.instance_id
    }

    /// Whether the calling thread is one of this group's workers.
    pub fn is_current_thread(&self) -> bool {
        Worker::with_current(|worker| worker.group_id() == self.core.instance_id).unwrap_or(false)
    }

    /// Whether the calling thread is this group's worker `worker_id`.
    pub fn is_current_thread_on(&self, worker_id: usize) -> bool {
        Worker::with_current(|worker| {
            worker.group_id() == self.core.instance_id && worker.id() == worker_id
        })
        .unwrap_or(false)
    }

    /// Post a task, round-robin across workers (per-producer cursor).
    pub fn post_task(&self, f: impl FnOnce() + Send + 'static) -> Result<(), PostError> {
        self.core.post(Box::new(f))
    }

    /// Post a task to a specific worker.
    pub fn post_task_to(
        &self,
        worker_id: usize,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), PostError> {
        self.core.post_to(worker_id, Box::new(f))
    }

    /// Post a task that runs after `delay_ms` milliseconds, round-robin.
    ///
    /// The delay counts from posting. The wheel is worker-private, so this
    /// posts a wake-up task that installs the timer on its worker.
    pub fn post_delay_task(
        &self,
        delay_ms: u64,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), PostError> {
        self.core.post(delay_bounce(delay_ms, Box::new(f)))
    }

    /// Post a delayed task to a specific worker.
    pub fn post_delay_task_to(
        &self,
        worker_id: usize,
        delay_ms: u64,
        f: impl FnOnce() + Send + 'static,
    ) -> Result<(), PostError> {
        self.core.post_to(worker_id, delay_bounce(delay_ms, Box::new(f)))
    }

    /// Post a task that fires every `period_ms` milliseconds, round-robin.
    /// Cancelled implicitly when the group is dropped.
    pub fn post_period_task(
        &self,
        period_ms: u64,
        f: impl FnMut() + Send + 'static,
    ) -> Result<(), PostError> {
        self.core.post(period_bounce(period_ms, Box::new(f)))
    }

    /// Post a periodic task to a specific worker.
    pub fn post_period_task_to(
        &self,
        worker_id: usize,
        period_ms: u64,
        f: impl FnMut() + Send + 'static,
    ) -> Result<(), PostError> {
        self.core.post_to(worker_id, period_bounce(period_ms, Box::new(f)))
    }
}

/// The wake-up task that installs a one-shot timer on whichever worker
/// executes it, keeping the wheel single-threaded.
fn delay_bounce(delay_ms: u64, f: Task) -> Task {
    Box::new(move || {
        Worker::with_current(move |worker| worker.schedule_boxed(delay_ms, f));
    })
}

fn period_bounce(period_ms: u64, f: Box<dyn FnMut() + Send>) -> Task {
    Box::new(move || {
        Worker::with_current(move |worker| worker.schedule_periodic_boxed(period_ms, f));
    })
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        tracing::debug!(group = self.core.instance_id, "worker group shutting down");
        self.core.stopping.store(true, Ordering::Release);
        for (id, stop) in self.core.stops.iter().enumerate() {
            stop.store(true, Ordering::Release);
            self.core.queue.notify(id);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
