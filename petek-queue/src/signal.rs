use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

const IDLE: usize = 0;
const SLEEPING: usize = 1;
const NOTIFIED: usize = 2;

/// Wakes one sleeping consumer.
///
/// The notification is sticky: a notify that lands while the consumer is
/// between its emptiness check and its sleep is not lost, the next
/// [`wait_timeout`](Signal::wait_timeout) returns immediately. Producers
/// pay one acquire load per notify while the consumer is busy; the RMW and
/// the unpark only happen against a sleeping or idle consumer.
pub struct Signal {
    state: AtomicUsize,
    sleeper: Mutex<Option<Thread>>,
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl Signal {
    /// Creates a signal with no registered sleeper.
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(IDLE),
            sleeper: Mutex::new(None),
        }
    }

    /// Blocks the calling thread until notified or `timeout` elapses.
    ///
    /// Only the consumer thread may call this; the first call registers it
    /// as the sleeper.
    pub fn wait_timeout(&self, timeout: Duration) {
        {
            let mut sleeper = self.sleeper.lock().unwrap();
            if sleeper.is_none() {
                *sleeper = Some(thread::current());
            }
        }

        if self.state.swap(SLEEPING, Ordering::AcqRel) == NOTIFIED {
            self.state.store(IDLE, Ordering::Release);
            return;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline || self.state.load(Ordering::Acquire) == NOTIFIED {
                break;
            }
            thread::park_timeout(deadline - now);
        }
        self.state.store(IDLE, Ordering::Release);
    }

    /// Wakes the sleeper, or marks the signal so the next wait returns
    /// immediately.
    pub fn notify(&self) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            if state == NOTIFIED {
                return;
            }
            match self.state.compare_exchange_weak(
                state,
                NOTIFIED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if state == SLEEPING {
                        if let Some(thread) = self.sleeper.lock().unwrap().clone() {
                            thread.unpark();
                        }
                    }
                    return;
                }
                Err(current) => state = current,
            }
        }
    }
}
