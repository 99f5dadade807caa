//! Worker (C6): one OS thread owning one [`Scheduler`], one TCP acceptor,
//! one two-stage accept queue, and the thread-local handler-context/task
//! caches every session on this thread shares.
//!
//! Grounded on `rask`'s `Listener::accept` (drain-until-`WouldBlock` accept
//! loop, `Slab`-keyed connection token) and `Worker::run` (pulling queued
//! connection work and driving it to completion) — collapsed onto a single
//! thread per worker instead of split listener/worker threads, since
//! spec.md §4.6 assigns a whole connection to one worker for its entire
//! lifetime, leaving no cross-thread connection handoff to route around.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::{Interest, Token};
use slab::Slab;

use crate::context_cache::{SharedContextPool, WorkerContextPool};
use crate::metrics::MetricsRegistry;
use crate::net::tcp_listener::TcpListener;
use crate::net::tcp_stream::TcpStream as CrateTcpStream;
use crate::router::Router;
use crate::scheduler::Scheduler;
use crate::session::{self, Readiness, SessionContext};
use crate::task_cache::TaskObjectCache;

/// Token reserved for this worker's acceptor. Distinct from the scheduler's
/// own cross-thread-wake token (`usize::MAX`).
const LISTEN_TOKEN: Token = Token(usize::MAX - 1);

/// One worker thread's full runtime.
pub struct Worker<L, S>
where
    L: TcpListener<S> + mio::event::Source,
    S: CrateTcpStream + Read + Write + mio::event::Source + 'static,
{
    scheduler: Rc<Scheduler>,
    listener: RefCell<L>,
    sessions: RefCell<Slab<Rc<Readiness>>>,
    incoming: RefCell<VecDeque<(S, SocketAddr)>>,
    contexts: Rc<WorkerContextPool>,
    task_cache: TaskObjectCache,
    session_ctx: SessionContext,
    stop: Arc<AtomicBool>,
}

impl<L, S> Worker<L, S>
where
    L: TcpListener<S> + mio::event::Source,
    S: CrateTcpStream + Read + Write + mio::event::Source + 'static,
{
    /// Builds a worker bound to `listener`, registering it for readable
    /// events at [`LISTEN_TOKEN`] on a fresh, worker-owned [`Scheduler`].
    pub fn new(
        mut listener: L,
        shared_contexts: Arc<SharedContextPool>,
        router: Arc<Router>,
        metrics: Arc<MetricsRegistry>,
        product: Arc<str>,
        stop: Arc<AtomicBool>,
    ) -> io::Result<Rc<Self>> {
        let scheduler = Rc::new(Scheduler::new()?);
        scheduler
            .registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let contexts = Rc::new(WorkerContextPool::new(shared_contexts));

        let session_ctx = SessionContext {
            router,
            contexts: Rc::clone(&contexts),
            metrics,
            scheduler: Rc::clone(&scheduler),
            product,
        };

        Ok(Rc::new(Worker {
            scheduler,
            listener: RefCell::new(listener),
            sessions: RefCell::new(Slab::new()),
            incoming: RefCell::new(VecDeque::new()),
            contexts,
            task_cache: TaskObjectCache::new(),
            session_ctx,
            stop,
        }))
    }

    /// Runs this worker's reactor loop until the shared stop flag is
    /// observed and every in-flight session has returned to parked (spec.md
    /// §4.5, property 7 — tracked by [`TaskObjectCache::quiescent`], since
    /// every session task is spawned through `self.task_cache.run`), then
    /// drains this worker's local handler-context pool back into the shared
    /// one (§4.4's shutdown barrier).
    pub fn run(self: &Rc<Self>) -> io::Result<()> {
        loop {
            let _tasks_remain = self.scheduler.run_once(|event| self.on_event(event))?;
            self.dispatch_incoming();

            if self.stop.load(Ordering::Acquire) {
                self.scheduler.request_stop();
                if self.task_cache.quiescent() {
                    self.contexts.drain_into_shared();
                    return Ok(());
                }
            }
        }
    }

    fn on_event(&self, event: &mio::event::Event) {
        if event.token() == LISTEN_TOKEN {
            self.accept();
            return;
        }

        if let Some(readiness) = self.sessions.borrow().get(event.token().0) {
            if event.is_readable() {
                readiness.mark_readable();
            }
            if event.is_writable() {
                readiness.mark_writable();
            }
        }
    }

    /// Drains the acceptor until `WouldBlock`, queuing every accepted
    /// stream — the first stage of the two-stage accept.
    fn accept(&self) {
        loop {
            match self.listener.borrow().accept() {
                Ok((stream, addr)) => self.incoming.borrow_mut().push_back((stream, addr)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    /// Registers each queued stream with the reactor and spawns its session
    /// task — the second stage of the two-stage accept, run once per
    /// scheduler turn so a burst of accepts doesn't register sockets from
    /// inside the event-dispatch callback itself.
    fn dispatch_incoming(self: &Rc<Self>) {
        while let Some((mut stream, _addr)) = self.incoming.borrow_mut().pop_front() {
            let readiness = Readiness::new();
            let token = {
                let mut sessions = self.sessions.borrow_mut();
                let entry = sessions.vacant_entry();
                let token = Token(entry.key());
                entry.insert(Rc::clone(&readiness));
                token
            };

            if let Err(e) = self
                .scheduler
                .registry()
                .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            {
                tracing::error!(error = %e, "failed to register session stream");
                self.sessions.borrow_mut().remove(token.0);
                continue;
            }

            let ctx = self.session_ctx.clone();
            let worker = Rc::clone(self);
            self.task_cache.run(&self.scheduler, async move {
                let mut stream = session::run(stream, readiness, ctx).await;
                let _ = worker.scheduler.registry().deregister(&mut stream);
                worker.sessions.borrow_mut().remove(token.0);
            });
        }
    }

    /// Number of sessions with a stream currently registered with this
    /// worker's reactor, for diagnostics.
    pub fn session_count(&self) -> usize {
        self.sessions.borrow().len()
    }

    /// A cloneable handle to this worker's scheduler waker, usable from any
    /// thread to break it out of a blocking `poll()` — e.g. to deliver the
    /// shutdown signal from [`crate::server::watch_for_shutdown`].
    pub fn scheduler_waker(&self) -> Arc<mio::Waker> {
        self.scheduler.waker()
    }
}
