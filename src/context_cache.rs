//! Handler-context cache (C4): a mutex-guarded shared pool backed by a
//! background filler, fronted by a lock-free per-worker pool.
//!
//! Grounded on `original_source/src/lua/lua_state_manager.cpp`'s
//! `get_state`/`free_state`/filler-thread triad. §9's re-architecture
//! guidance says to model a context as an owned resource living in exactly
//! one of {shared pool, worker-local pool, running task} — `Box<dyn
//! ScriptEngine>` moving by value through `get_state`/`free_state` makes a
//! double-free or double-issue a type error rather than a runtime bug.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::handler::{LibraryDescriptor, NativeEngine, ScriptEngine};

/// The shared reservoir, replenished once per second by
/// [`spawn_background_filler`] and drawn down by every worker's
/// [`WorkerContextPool::get_state`] fast-path miss.
pub struct SharedContextPool {
    libraries: Vec<LibraryDescriptor>,
    pool: Mutex<VecDeque<Box<dyn ScriptEngine>>>,
    buffer_size: usize,
    code_version: AtomicU64,
    dev_mode: bool,
}

impl SharedContextPool {
    pub fn new(libraries: Vec<LibraryDescriptor>, buffer_size: usize, dev_mode: bool) -> Arc<Self> {
        Arc::new(SharedContextPool {
            libraries,
            pool: Mutex::new(VecDeque::new()),
            buffer_size,
            code_version: AtomicU64::new(1),
            dev_mode,
        })
    }

    fn build_context(&self) -> Box<dyn ScriptEngine> {
        Box::new(NativeEngine::new(&self.libraries, self.code_version.load(Ordering::Acquire)))
    }

    fn pop(&self) -> Option<Box<dyn ScriptEngine>> {
        self.pool.lock().pop_back()
    }

    fn push(&self, ctx: Box<dyn ScriptEngine>) {
        self.pool.lock().push_back(ctx);
    }

    /// Creates and appends contexts until the shared pool holds at least
    /// `buffer_size`. Called once per second by the filler thread.
    pub fn fill_shortfall(&self) {
        let mut pool = self.pool.lock();
        while pool.len() < self.buffer_size {
            pool.push_back(self.build_context());
        }
    }

    pub fn shared_len(&self) -> usize {
        self.pool.lock().len()
    }

    /// Bumps the monotonic `code_version`; contexts whose own version is
    /// older are refreshed lazily on their next `get_state`.
    pub fn bump_code_version(&self) -> u64 {
        self.code_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn code_version(&self) -> u64 {
        self.code_version.load(Ordering::Acquire)
    }
}

/// Spawns the background filler thread described by spec.md §4.4. Returns a
/// handle plus a stop flag the server flips during shutdown.
pub fn spawn_background_filler(shared: Arc<SharedContextPool>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = Arc::clone(&stop);
    let handle = std::thread::Builder::new()
        .name("fiberweb-context-filler".to_string())
        .spawn(move || {
            while !stop_for_thread.load(Ordering::Acquire) {
                shared.fill_shortfall();
                std::thread::sleep(Duration::from_secs(1));
            }
        })
        .expect("failed to spawn handler-context filler thread");
    (handle, stop)
}

/// One worker's lock-free fast path in front of a [`SharedContextPool`].
/// `!Send`/`!Sync` by construction (the `RefCell`): exactly one worker
/// thread ever touches its own instance.
pub struct WorkerContextPool {
    shared: Arc<SharedContextPool>,
    local: RefCell<VecDeque<Box<dyn ScriptEngine>>>,
}

impl WorkerContextPool {
    pub fn new(shared: Arc<SharedContextPool>) -> Self {
        WorkerContextPool {
            shared,
            local: RefCell::new(VecDeque::new()),
        }
    }

    /// Acquires a context: thread-local pop, then shared-pool pop, then an
    /// inline build as a last resort (logged, since it means the operator
    /// should raise `--lua.statebuffer`).
    pub fn get_state(&self) -> Box<dyn ScriptEngine> {
        let mut ctx = if let Some(ctx) = self.local.borrow_mut().pop_back() {
            ctx
        } else if let Some(ctx) = self.shared.pop() {
            ctx
        } else {
            tracing::warn!("handler-context pools empty, building inline; consider raising --lua.statebuffer");
            self.shared.build_context()
        };

        let target_version = self.shared.code_version();
        ctx.reload(target_version, self.shared.dev_mode);
        ctx
    }

    /// Releases a context: clears its transient-objects list, then pushes
    /// into the thread-local pool (the owning worker always has one while
    /// running).
    pub fn free_state(&self, mut ctx: Box<dyn ScriptEngine>) {
        ctx.clear_transients();
        self.local.borrow_mut().push_back(ctx);
    }

    /// Drains every context from the local pool back into the shared pool.
    /// Called once, from the worker thread, as the second half of the
    /// shutdown barrier described in spec.md §4.4.
    pub fn drain_into_shared(&self) {
        let mut local = self.local.borrow_mut();
        while let Some(ctx) = local.pop_back() {
            self.shared.push(ctx);
        }
    }

    pub fn local_len(&self) -> usize {
        self.local.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Request, Response};
    use std::collections::HashMap;
    use std::sync::Arc as StdArc;

    fn noop_request() -> Request {
        Request {
            timestamp: 0,
            method: "GET".to_string(),
            proto: "HTTP/1.1".to_string(),
            host: "h".to_string(),
            path: "/".to_string(),
            headers: HashMap::new(),
            remote_addr_str: "127.0.0.1".to_string(),
            remote_addr_ip_ver: 4,
            cookies: None,
            content: None,
        }
    }

    #[test]
    fn thread_local_fast_path_avoids_shared_pool() {
        let shared = SharedContextPool::new(Vec::new(), 0, false);
        let worker = WorkerContextPool::new(shared);
        let ctx = worker.get_state();
        worker.free_state(ctx);
        assert_eq!(worker.local_len(), 1);
        let _ = worker.get_state();
        assert_eq!(worker.local_len(), 0);
    }

    #[test]
    fn falls_back_to_shared_pool_then_inline_build() {
        let shared = SharedContextPool::new(Vec::new(), 0, false);
        shared.pool.lock().push_back(Box::new(NativeEngine::new(&[], 1)));
        let worker = WorkerContextPool::new(StdArc::clone(&shared));

        // First acquire drains the one context seeded into the shared pool.
        let first = worker.get_state();
        assert_eq!(shared.shared_len(), 0);

        // Second acquire finds both pools empty and builds inline instead
        // of panicking.
        let second = worker.get_state();
        let _ = noop_request();
        worker.free_state(first);
        worker.free_state(second);
    }

    #[test]
    fn fill_shortfall_tops_up_to_buffer_size() {
        let shared = SharedContextPool::new(Vec::new(), 3, false);
        shared.fill_shortfall();
        assert_eq!(shared.shared_len(), 3);
        shared.pool.lock().pop_back();
        shared.fill_shortfall();
        assert_eq!(shared.shared_len(), 3);
    }

    #[test]
    fn drain_into_shared_moves_every_local_context() {
        let shared = SharedContextPool::new(Vec::new(), 0, false);
        let worker = WorkerContextPool::new(StdArc::clone(&shared));
        for _ in 0..3 {
            let ctx = worker.get_state();
            worker.free_state(ctx);
        }
        assert_eq!(worker.local_len(), 1);
        worker.free_state(worker.get_state());
        worker.free_state(worker.get_state());
        assert!(worker.local_len() >= 1);
        worker.drain_into_shared();
        assert_eq!(worker.local_len(), 0);
    }

    #[test]
    fn code_version_bump_propagates_on_next_reload() {
        let shared = SharedContextPool::new(Vec::new(), 0, false);
        let worker = WorkerContextPool::new(StdArc::clone(&shared));
        let ctx = worker.get_state();
        assert_eq!(ctx.code_version(), 1);
        worker.free_state(ctx);
        shared.bump_code_version();
        let ctx = worker.get_state();
        assert_eq!(ctx.code_version(), 2);
        worker.free_state(ctx);
    }
}
