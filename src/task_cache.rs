//! Task object cache (C5).
//!
//! The original (`original_source/src/core/fiber_task_cache.h`/`.cpp`) parks
//! reusable stackful-fiber objects on a condition variable and re-links them
//! into a thread-local list once their work closure returns, because
//! allocating a fiber's stack is the expensive part to amortize. This
//! crate's tasks are heap-boxed `Future`s (`scheduler.rs`), and
//! `slab::Slab`'s free list already reuses a finished task's slot for the
//! next `spawn` without any extra bookkeeping — so there is no separate
//! stack allocation left to amortize by hand.
//!
//! What *does* carry over is the cache's externally observable contract:
//! track how many tasks are live versus parked, so shutdown can poll until
//! every spawned task has returned to parked (spec.md §4.5, property 7)
//! before the pool is torn down. [`TaskObjectCache`] wraps
//! [`crate::scheduler::Scheduler::spawn`] with exactly that bookkeeping.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use crate::scheduler::Scheduler;

struct Counts {
    live: Cell<usize>,
    parked: Cell<usize>,
}

/// Thread-local pool of in-flight task bookkeeping. `!Send`/`!Sync`: exactly
/// one instance per worker, matching [`Scheduler`]. Cheaply `Clone` (an `Rc`
/// bump) so spawned session tasks can hold their own handle back to it.
#[derive(Clone)]
pub struct TaskObjectCache {
    counts: Rc<Counts>,
}

impl Default for TaskObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskObjectCache {
    pub fn new() -> Self {
        TaskObjectCache {
            counts: Rc::new(Counts {
                live: Cell::new(0),
                parked: Cell::new(0),
            }),
        }
    }

    /// Runs `work` as a cooperative task on `scheduler`. Equivalent to the
    /// original's `run(work)`: acquire-or-create a task object, hand it the
    /// work, let it re-park on completion.
    pub fn run(&self, scheduler: &Scheduler, work: impl Future<Output = ()> + 'static) {
        let counts = Rc::clone(&self.counts);
        counts.live.set(counts.live.get() + 1);
        scheduler.spawn(async move {
            work.await;
            counts.live.set(counts.live.get() - 1);
            counts.parked.set(counts.parked.get() + 1);
        });
    }

    /// Tasks currently executing (not yet returned to the parked state).
    pub fn live_count(&self) -> usize {
        self.counts.live.get()
    }

    /// Tasks that have completed their work and are available for reuse.
    pub fn parked_count(&self) -> usize {
        self.counts.parked.get()
    }

    /// True once no task is mid-execution — the precondition spec.md §4.5
    /// requires before a worker may tear down its task cache.
    pub fn quiescent(&self) -> bool {
        self.counts.live.get() == 0
    }
}

/// Polls `scheduler`/`cache` with the given backoff until
/// [`TaskObjectCache::quiescent`] holds, running scheduler turns so any
/// in-flight tasks actually get a chance to finish. Used by worker shutdown
/// (spec.md §4.6).
pub fn drain_until_quiescent(scheduler: &Scheduler, cache: &TaskObjectCache, poll_backoff: Duration) {
    while !cache.quiescent() {
        let _ = scheduler.run_once(|_| {});
        std::thread::sleep(poll_backoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn run_tracks_live_then_parked() {
        let scheduler = Scheduler::new().unwrap();
        let cache = TaskObjectCache::new();
        let ran = Rc::new(RefCell::new(false));
        let ran2 = Rc::clone(&ran);

        cache.run(&scheduler, async move {
            *ran2.borrow_mut() = true;
        });
        assert_eq!(cache.live_count(), 1);

        scheduler.run_once(|_| {}).unwrap();
        assert!(*ran.borrow());
        assert_eq!(cache.live_count(), 0);
        assert_eq!(cache.parked_count(), 1);
        assert!(cache.quiescent());
    }

    #[test]
    fn drain_until_quiescent_waits_for_in_flight_tasks() {
        let scheduler = Scheduler::new().unwrap();
        let cache = TaskObjectCache::new();
        cache.run(&scheduler, async {});
        drain_until_quiescent(&scheduler, &cache, Duration::from_millis(1));
        assert!(cache.quiescent());
        assert_eq!(cache.parked_count(), 1);
    }
}
