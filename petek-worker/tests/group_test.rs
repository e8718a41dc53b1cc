use petek_worker::{GroupOptions, Poller, PostError, Worker, WorkerGroup};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Spin-wait with a deadline; returns whether the condition held.
fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Post with retry so a full outbox never fails the test.
fn post_until_ok(group: &WorkerGroup, f: impl Fn() + Send + Sync + 'static) {
    let f = Arc::new(f);
    loop {
        let f = f.clone();
        match group.post_task(move || f()) {
            Ok(()) => return,
            Err(PostError::QueueFull) => thread::yield_now(),
            Err(err) => panic!("unexpected post error: {}", err),
        }
    }
}

fn post_to_until_ok(group: &WorkerGroup, worker_id: usize, f: impl Fn() + Send + Sync + 'static) {
    let f = Arc::new(f);
    loop {
        let f = f.clone();
        match group.post_task_to(worker_id, move || f()) {
            Ok(()) => return,
            Err(PostError::QueueFull) => thread::yield_now(),
            Err(err) => panic!("unexpected post error: {}", err),
        }
    }
}

// ============================================================================
// Posting and distribution
// ============================================================================

#[test]
fn round_robin_distributes_evenly() {
    const TASKS: usize = 10_000;
    const WORKERS: usize = 4;

    let group = WorkerGroup::new(WORKERS, 1024);
    let total = Arc::new(AtomicUsize::new(0));
    let per_worker: Arc<Vec<AtomicUsize>> =
        Arc::new((0..WORKERS).map(|_| AtomicUsize::new(0)).collect());

    for _ in 0..TASKS {
        let total = total.clone();
        let per_worker = per_worker.clone();
        post_until_ok(&group, move || {
            if let Some(id) = Worker::with_current(|worker| worker.id()) {
                per_worker[id].fetch_add(1, Ordering::Relaxed);
            }
            total.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert!(
        wait_for(Duration::from_secs(10), || total.load(Ordering::Relaxed) == TASKS),
        "only {} of {} tasks ran",
        total.load(Ordering::Relaxed),
        TASKS
    );

    let share = TASKS / WORKERS;
    for (id, count) in per_worker.iter().enumerate() {
        let count = count.load(Ordering::Relaxed);
        assert!(
            count >= share * 9 / 10 && count <= share * 11 / 10,
            "worker {} ran {} tasks, expected about {}",
            id,
            count,
            share
        );
    }
}

#[test]
fn targeted_posts_stay_on_target() {
    const TASKS: usize = 1_000;

    let group = WorkerGroup::new(2, 64);
    let executed = Arc::new(AtomicUsize::new(0));
    let strays = Arc::new(AtomicUsize::new(0));

    for _ in 0..TASKS {
        let executed = executed.clone();
        let strays = strays.clone();
        post_to_until_ok(&group, 1, move || {
            if Worker::with_current(|worker| worker.id()) != Some(1) {
                strays.fetch_add(1, Ordering::Relaxed);
            }
            executed.fetch_add(1, Ordering::Relaxed);
        });
    }

    assert!(wait_for(Duration::from_secs(10), || {
        executed.load(Ordering::Relaxed) == TASKS
    }));
    assert_eq!(strays.load(Ordering::Relaxed), 0);
}

#[test]
fn per_producer_fifo_on_one_worker() {
    const TASKS: usize = 2_000;

    let group = WorkerGroup::new(1, 256);
    let order = Arc::new(Mutex::new(Vec::with_capacity(TASKS)));

    for seq in 0..TASKS {
        let order = order.clone();
        loop {
            let order = order.clone();
            match group.post_task_to(0, move || order.lock().unwrap().push(seq)) {
                Ok(()) => break,
                Err(PostError::QueueFull) => thread::yield_now(),
                Err(err) => panic!("unexpected post error: {}", err),
            }
        }
    }

    assert!(wait_for(Duration::from_secs(10), || {
        order.lock().unwrap().len() == TASKS
    }));
    let order = order.lock().unwrap();
    assert_eq!(*order, (0..TASKS).collect::<Vec<_>>());
}

#[test]
fn invalid_worker_is_reported_not_fatal() {
    let group = WorkerGroup::new(2, 16);
    let result = group.post_task_to(5, || {});
    assert_eq!(result, Err(PostError::InvalidWorker(5)));
    // The group is still healthy.
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    group.post_task(move || flag.store(true, Ordering::SeqCst)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || ran.load(Ordering::SeqCst)));
}

// ============================================================================
// Worker identity
// ============================================================================

#[test]
fn current_worker_resolves_inside_tasks_only() {
    assert!(Worker::with_current(|worker| worker.id()).is_none());
    assert!(!Worker::on_worker_thread());

    let group = Arc::new(WorkerGroup::new(2, 64));
    assert!(!group.is_current_thread());

    let checked = Arc::new(AtomicBool::new(false));
    {
        let group = group.clone();
        let checked = checked.clone();
        let group_id = group.id();
        let group_for_task = group.clone();
        group
            .post_task_to(0, move || {
                assert!(group_for_task.is_current_thread());
                assert!(group_for_task.is_current_thread_on(0));
                assert!(!group_for_task.is_current_thread_on(1));
                Worker::with_current(|worker| {
                    assert_eq!(worker.id(), 0);
                    assert_eq!(worker.group_id(), group_id);
                    assert_eq!(worker.group_size(), 2);
                    assert!(!worker.has_poller());
                });
                checked.store(true, Ordering::SeqCst);
            })
            .unwrap();
    }
    assert!(wait_for(Duration::from_secs(5), || checked.load(Ordering::SeqCst)));
}

#[test]
fn worker_self_post_keeps_fifo() {
    let group = WorkerGroup::new(1, 64);
    let order = Arc::new(Mutex::new(Vec::new()));

    let outer = order.clone();
    group
        .post_task_to(0, move || {
            outer.lock().unwrap().push(1);
            let inner = outer.clone();
            Worker::with_current(|worker| {
                worker
                    .post_task(move || inner.lock().unwrap().push(3))
                    .unwrap();
            });
            outer.lock().unwrap().push(2);
        })
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        order.lock().unwrap().len() == 3
    }));
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn coexisting_groups_do_not_alias() {
    let first = WorkerGroup::new(1, 64);
    let second = WorkerGroup::new(1, 64);
    assert_ne!(first.id(), second.id());

    let hits = Arc::new(AtomicUsize::new(0));
    for group in [&first, &second] {
        let expected = group.id();
        let hits = hits.clone();
        group
            .post_task(move || {
                assert_eq!(Worker::with_current(|worker| worker.group_id()), Some(expected));
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    assert!(wait_for(Duration::from_secs(5), || {
        hits.load(Ordering::SeqCst) == 2
    }));
}

// ============================================================================
// Timers
// ============================================================================

#[test]
fn delayed_task_fires_after_its_delay() {
    let group = WorkerGroup::new(1, 64);
    let fired_after = Arc::new(Mutex::new(None::<Duration>));

    let start = Instant::now();
    let slot = fired_after.clone();
    group
        .post_delay_task(50, move || {
            *slot.lock().unwrap() = Some(start.elapsed());
        })
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || {
        fired_after.lock().unwrap().is_some()
    }));
    let elapsed = fired_after.lock().unwrap().unwrap();
    assert!(elapsed >= Duration::from_millis(50), "fired early: {:?}", elapsed);
    // Bounded by delay + poll quantum + batch time, with scheduler slack.
    assert!(elapsed < Duration::from_millis(500), "fired late: {:?}", elapsed);
}

#[test]
fn delayed_targeted_task_runs_on_target() {
    let group = WorkerGroup::new(2, 64);
    let done = Arc::new(AtomicBool::new(false));
    let flag = done.clone();
    group
        .post_delay_task_to(1, 30, move || {
            assert_eq!(Worker::with_current(|worker| worker.id()), Some(1));
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();
    assert!(wait_for(Duration::from_secs(5), || done.load(Ordering::SeqCst)));
}

#[test]
fn periodic_task_keeps_firing_until_drop() {
    let group = WorkerGroup::new(1, 64);
    let fires = Arc::new(AtomicUsize::new(0));

    let counter = fires.clone();
    group
        .post_period_task(25, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    // A 25 ms period reaches 6 firings within the 2 s budget even on a
    // loaded machine.
    assert!(wait_for(Duration::from_millis(2_000), || {
        fires.load(Ordering::SeqCst) >= 6
    }));

    drop(group);
    let after_drop = fires.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(fires.load(Ordering::SeqCst), after_drop, "task ran after drop");
}

// ============================================================================
// Pollers
// ============================================================================

struct CountingPoller {
    polls: Arc<AtomicUsize>,
}

impl Poller for CountingPoller {
    fn poll(&mut self, timeout_ms: u64) {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if timeout_ms > 0 {
            thread::sleep(Duration::from_millis(timeout_ms.min(1)));
        }
    }
}

#[test]
fn poller_is_driven_by_its_worker() {
    let polls = Arc::new(AtomicUsize::new(0));
    let supplier_polls = polls.clone();
    let group = WorkerGroup::with_pollers(2, 64, move |worker_id| {
        if worker_id == 0 {
            Some(Box::new(CountingPoller {
                polls: supplier_polls.clone(),
            }) as Box<dyn Poller>)
        } else {
            None
        }
    });

    assert!(wait_for(Duration::from_secs(5), || {
        polls.load(Ordering::SeqCst) > 10
    }));

    // Both workers still execute tasks, poller or not.
    let ran = Arc::new(AtomicUsize::new(0));
    for id in 0..2 {
        let ran = ran.clone();
        group
            .post_task_to(id, move || {
                let has_poller = Worker::with_current(|worker| worker.has_poller());
                assert_eq!(has_poller, Some(id == 0));
                ran.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }
    assert!(wait_for(Duration::from_secs(5), || ran.load(Ordering::SeqCst) == 2));
}

// ============================================================================
// Panics
// ============================================================================

#[test]
fn panic_hook_replaces_abort() {
    let panics = Arc::new(AtomicUsize::new(0));
    let hook_panics = panics.clone();
    let group = WorkerGroup::with_options(
        GroupOptions::new(1, 64).panic_hook(move |_payload| {
            hook_panics.fetch_add(1, Ordering::SeqCst);
        }),
    );

    group.post_task(|| panic!("boom")).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        panics.load(Ordering::SeqCst) == 1
    }));

    // The worker survived and keeps executing.
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    group.post_task(move || flag.store(true, Ordering::SeqCst)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || ran.load(Ordering::SeqCst)));
}

// ============================================================================
// Teardown
// ============================================================================

#[test]
fn drop_discards_queued_tasks_without_running_them_later() {
    let executed = Arc::new(AtomicUsize::new(0));
    let group = WorkerGroup::new(1, 64);

    // Stuff the queue far beyond what one worker drains instantly; most of
    // these are discarded at drop.
    let mut posted = 0usize;
    for _ in 0..10_000 {
        let executed = executed.clone();
        let task = move || {
            executed.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_micros(50));
        };
        if group.post_task(task).is_ok() {
            posted += 1;
        }
    }

    drop(group);
    let at_drop = executed.load(Ordering::SeqCst);
    assert!(at_drop <= posted);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(executed.load(Ordering::SeqCst), at_drop, "task ran after drop");
}

#[test]
#[cfg_attr(miri, ignore)]
fn teardown_races_cleanly_with_producers() {
    let group = Arc::new(WorkerGroup::new(2, 64));
    let stop = Arc::new(AtomicBool::new(false));

    let mut producers = Vec::new();
    for _ in 0..3 {
        let group = group.clone();
        let stop = stop.clone();
        producers.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                match group.post_task(|| {}) {
                    Ok(()) | Err(PostError::QueueFull) => {}
                    Err(PostError::ShuttingDown) => break,
                    Err(err) => panic!("unexpected post error: {}", err),
                }
            }
        }));
    }

    thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::Relaxed);
    for producer in producers {
        producer.join().unwrap();
    }
    // Last Arc drops here: stop flags, wake, join. Nothing to assert beyond
    // a clean return.
    drop(group);
}
