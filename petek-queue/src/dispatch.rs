use crate::ring::Ring;
use crate::signal::Signal;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Registration cap per lane.
pub const MAX_OUTBOXES_PER_LANE: usize = 1024;

/// One registered producer endpoint: its private ring plus the closed flag
/// the consumer observes to unlink it.
struct Channel<T> {
    ring: Ring<T>,
    closed: AtomicBool,
}

struct Lane<T> {
    signal: Signal,
    /// Registered outboxes. Locked only to register and to unlink closed
    /// outboxes; the pop path works off the inbox's own snapshot.
    registry: Mutex<Vec<Arc<Channel<T>>>>,
    /// Bumped on registration so the inbox refreshes its snapshot.
    version: AtomicU64,
    inbox_taken: AtomicBool,
}

struct Shared<T> {
    lanes: Box<[Lane<T>]>,
    outbox_capacity: usize,
}

/// Registration failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// The lane already carries [`MAX_OUTBOXES_PER_LANE`] outboxes.
    LaneFull,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::LaneFull => {
                write!(f, "lane already has {} outboxes", MAX_OUTBOXES_PER_LANE)
            }
        }
    }
}

impl std::error::Error for RegisterError {}

/// A bounded MPMC queue partitioned into per-consumer lanes, each fed by
/// per-producer outboxes.
///
/// This handle is a cheap clone over shared state; hand clones to producer
/// threads and take each lane's inbox from wherever the consumer runs.
/// See the [crate docs](crate) for the ownership and ordering rules.
pub struct DispatchQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for DispatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send> DispatchQueue<T> {
    /// Creates a queue with `lanes` consumer lanes; every outbox ring gets
    /// `queue_size` slots (rounded up to a power of two).
    ///
    /// # Panics
    ///
    /// Panics if `lanes` or `queue_size` is zero.
    pub fn new(lanes: usize, queue_size: usize) -> Self {
        assert!(lanes > 0, "dispatch queue needs at least one lane");
        assert!(queue_size > 0, "queue_size must be positive");
        let lanes = (0..lanes)
            .map(|_| Lane {
                signal: Signal::new(),
                registry: Mutex::new(Vec::new()),
                version: AtomicU64::new(0),
                inbox_taken: AtomicBool::new(false),
            })
            .collect();
        Self {
            shared: Arc::new(Shared {
                lanes,
                outbox_capacity: queue_size,
            }),
        }
    }

    /// Number of consumer lanes.
    pub fn lanes(&self) -> usize {
        self.shared.lanes.len()
    }

    /// Registers a fresh outbox addressed to `lane`.
    ///
    /// # Panics
    ///
    /// Panics if `lane` is out of range.
    pub fn register_outbox(&self, lane: usize) -> Result<Outbox<T>, RegisterError> {
        let target = &self.shared.lanes[lane];
        let channel = Arc::new(Channel {
            ring: Ring::with_capacity(self.shared.outbox_capacity),
            closed: AtomicBool::new(false),
        });
        {
            let mut registry = target.registry.lock().unwrap();
            if registry.len() >= MAX_OUTBOXES_PER_LANE {
                return Err(RegisterError::LaneFull);
            }
            registry.push(channel.clone());
        }
        target.version.fetch_add(1, Ordering::Release);
        Ok(Outbox {
            channel,
            shared: self.shared.clone(),
            lane,
        })
    }

    /// Takes the single inbox of `lane`.
    ///
    /// # Panics
    ///
    /// Panics if `lane` is out of range or its inbox was already taken.
    pub fn take_inbox(&self, lane: usize) -> Inbox<T> {
        let taken = self.shared.lanes[lane].inbox_taken.swap(true, Ordering::AcqRel);
        assert!(!taken, "inbox for lane {} already taken", lane);
        Inbox {
            shared: self.shared.clone(),
            lane,
            scan: Vec::new(),
            seen_version: 0,
            cursor: 0,
        }
    }

    /// Wakes the consumer of `lane` if it sleeps in [`Inbox::wait`].
    pub fn notify(&self, lane: usize) {
        self.shared.lanes[lane].signal.notify();
    }
}

/// Producer endpoint: pushes into one lane.
///
/// Owned by exactly one producer thread (`push` takes `&mut self`).
/// Dropping the outbox schedules its removal; the consumer unlinks it once
/// drained.
pub struct Outbox<T: Send> {
    channel: Arc<Channel<T>>,
    shared: Arc<Shared<T>>,
    lane: usize,
}

impl<T: Send> Outbox<T> {
    /// Pushes `value`, handing it back if the outbox is full.
    ///
    /// Wait-free for the owning producer.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        self.channel.ring.push(value)?;
        self.shared.lanes[self.lane].signal.notify();
        Ok(())
    }

    /// The lane this outbox feeds.
    pub fn lane(&self) -> usize {
        self.lane
    }

    /// Ring capacity of this outbox.
    pub fn capacity(&self) -> usize {
        self.channel.ring.capacity()
    }

    /// Schedules removal. Equivalent to dropping the outbox.
    pub fn unregister(self) {}
}

impl<T: Send> Drop for Outbox<T> {
    fn drop(&mut self) {
        self.channel.closed.store(true, Ordering::Release);
        // Wake the consumer so an idle lane still unlinks promptly.
        self.shared.lanes[self.lane].signal.notify();
    }
}

/// Consumer endpoint: drains every outbox of one lane.
pub struct Inbox<T: Send> {
    shared: Arc<Shared<T>>,
    lane: usize,
    scan: Vec<Arc<Channel<T>>>,
    seen_version: u64,
    cursor: usize,
}

impl<T: Send> Inbox<T> {
    fn refresh(&mut self) {
        let lane = &self.shared.lanes[self.lane];
        let version = lane.version.load(Ordering::Acquire);
        if version != self.seen_version {
            self.scan = lane.registry.lock().unwrap().clone();
            self.seen_version = version;
        }
    }

    /// Drains up to `max` items, invoking `f` for each.
    ///
    /// Round-robin, one item per outbox per pass: per-outbox FIFO is
    /// preserved and no outbox starves while another streams.
    pub fn pop_batch(&mut self, max: usize, mut f: impl FnMut(T)) -> usize {
        self.refresh();
        if self.scan.is_empty() || max == 0 {
            return 0;
        }
        let mut popped = 0;
        let mut saw_closed = false;
        'outer: loop {
            let mut progress = false;
            for offset in 0..self.scan.len() {
                let index = (self.cursor + offset) % self.scan.len();
                let channel = &self.scan[index];
                if let Some(value) = channel.ring.pop() {
                    f(value);
                    popped += 1;
                    progress = true;
                    if popped == max {
                        self.cursor = (index + 1) % self.scan.len();
                        break 'outer;
                    }
                } else if channel.closed.load(Ordering::Acquire) {
                    saw_closed = true;
                }
            }
            if !progress {
                break;
            }
        }
        if saw_closed {
            self.unlink_closed();
        }
        popped
    }

    /// Unlinks outboxes that are both closed and drained. The closed flag
    /// is read before the ring, so an item pushed before the close is never
    /// left behind.
    fn unlink_closed(&mut self) {
        self.scan
            .retain(|channel| !(channel.closed.load(Ordering::Acquire) && channel.ring.is_empty()));
        let lane = &self.shared.lanes[self.lane];
        lane.registry
            .lock()
            .unwrap()
            .retain(|channel| !(channel.closed.load(Ordering::Acquire) && channel.ring.is_empty()));
        self.cursor = 0;
    }

    /// Sleeps until a producer pushes, someone calls
    /// [`DispatchQueue::notify`], or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) {
        self.shared.lanes[self.lane].signal.wait_timeout(timeout);
    }

    /// The lane this inbox drains.
    pub fn lane(&self) -> usize {
        self.lane
    }
}
