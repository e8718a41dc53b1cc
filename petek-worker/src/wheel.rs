//! Worker-private hierarchical timer wheel.
//!
//! Four levels of 64 slots over millisecond ticks give a ~4.6 hour horizon;
//! deadlines beyond it wait in an overflow list that is re-examined when
//! the top level turns over. The wheel is single-threaded by design —
//! cross-thread delayed posts are bounced through a task that schedules on
//! the owning worker — so there is not a single atomic in here.
//!
//! `advance_to` hands expired entries back to the caller instead of firing
//! callbacks itself, so callbacks are free to schedule into the wheel.

use std::mem;

const LEVEL_BITS: u32 = 6;
const SLOTS: usize = 1 << LEVEL_BITS;
const LEVELS: usize = 4;
const SLOT_MASK: u64 = SLOTS as u64 - 1;
const HORIZON: u64 = 1 << (LEVEL_BITS * LEVELS as u32);

/// What to do when an entry fires.
pub(crate) enum TimerTask {
    Once(Box<dyn FnOnce() + Send>),
    Every {
        period_ms: u64,
        f: Box<dyn FnMut() + Send>,
    },
}

/// An entry due at `deadline`; periodic entries are re-armed by the caller.
pub(crate) struct Expired {
    pub deadline: u64,
    pub task: TimerTask,
}

struct Entry {
    deadline: u64,
    task: TimerTask,
}

pub(crate) struct TimerWheel {
    now: u64,
    levels: [[Vec<Entry>; SLOTS]; LEVELS],
    overflow: Vec<Entry>,
    len: usize,
    /// Lower bound on the earliest pending deadline; recomputed when it
    /// falls behind `now`.
    earliest: Option<u64>,
}

impl TimerWheel {
    pub(crate) fn new(now: u64) -> Self {
        Self {
            now,
            levels: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
            overflow: Vec::new(),
            len: 0,
            earliest: None,
        }
    }

    pub(crate) fn now(&self) -> u64 {
        self.now
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Schedule `task` at absolute millisecond `deadline`, clamped to the
    /// next tick so it always fires on a future advance.
    pub(crate) fn schedule_at(&mut self, deadline: u64, task: TimerTask) {
        let deadline = deadline.max(self.now + 1);
        self.earliest = Some(match self.earliest {
            Some(earliest) => earliest.min(deadline),
            None => deadline,
        });
        self.len += 1;
        self.insert(Entry { deadline, task });
    }

    fn insert(&mut self, entry: Entry) {
        // Cascaded entries may be due exactly now; external schedules were
        // already clamped past it.
        let deadline = entry.deadline.max(self.now);
        let delta = deadline - self.now;
        if delta >= HORIZON {
            self.overflow.push(entry);
            return;
        }
        let mut level = 0;
        while level + 1 < LEVELS && delta >= 1 << (LEVEL_BITS * (level as u32 + 1)) {
            level += 1;
        }
        let slot = ((deadline >> (LEVEL_BITS * level as u32)) & SLOT_MASK) as usize;
        self.levels[level][slot].push(entry);
    }

    /// Advance the wheel to `target` milliseconds, collecting every entry
    /// that came due into `fired` in tick order.
    pub(crate) fn advance_to(&mut self, target: u64, fired: &mut Vec<Expired>) {
        if target <= self.now {
            return;
        }
        if self.len() == 0 {
            self.now = target;
            return;
        }
        while self.now < target {
            self.now += 1;
            self.tick(fired);
            if self.len() == 0 {
                self.now = target;
                break;
            }
        }
    }

    fn tick(&mut self, fired: &mut Vec<Expired>) {
        let now = self.now;

        // Cascade top-down on level boundaries so entries settle into their
        // final lower-level slot before level 0 drains.
        for level in (1..LEVELS).rev() {
            let stride = 1u64 << (LEVEL_BITS * level as u32);
            if now % stride == 0 {
                let slot = ((now >> (LEVEL_BITS * level as u32)) & SLOT_MASK) as usize;
                let entries = mem::take(&mut self.levels[level][slot]);
                for entry in entries {
                    self.insert(entry);
                }
            }
        }

        // The horizon window moved: pull overflow entries that now fit.
        let top_stride = 1u64 << (LEVEL_BITS * (LEVELS as u32 - 1));
        if now % top_stride == 0 && !self.overflow.is_empty() {
            let mut index = 0;
            while index < self.overflow.len() {
                if self.overflow[index].deadline.saturating_sub(now) < HORIZON {
                    let entry = self.overflow.swap_remove(index);
                    self.insert(entry);
                } else {
                    index += 1;
                }
            }
        }

        let slot = (now & SLOT_MASK) as usize;
        if !self.levels[0][slot].is_empty() {
            let entries = mem::take(&mut self.levels[0][slot]);
            for entry in entries {
                debug_assert!(entry.deadline <= now);
                self.len -= 1;
                fired.push(Expired {
                    deadline: entry.deadline,
                    task: entry.task,
                });
            }
        }
    }

    /// The earliest pending deadline, strictly after `now`.
    pub(crate) fn next_deadline(&mut self) -> Option<u64> {
        if self.len() == 0 {
            return None;
        }
        match self.earliest {
            Some(earliest) if earliest > self.now => Some(earliest),
            _ => {
                let earliest = self.recompute_earliest();
                self.earliest = earliest;
                earliest
            }
        }
    }

    fn recompute_earliest(&self) -> Option<u64> {
        let mut earliest: Option<u64> = None;
        let mut fold = |deadline: u64| {
            earliest = Some(match earliest {
                Some(e) => e.min(deadline),
                None => deadline,
            });
        };
        for level in &self.levels {
            for slot in level {
                for entry in slot {
                    fold(entry.deadline);
                }
            }
        }
        for entry in &self.overflow {
            fold(entry.deadline);
        }
        earliest
    }
}
