//! Per-connection session (C8): `reading → dispatched → writing → reading`,
//! with the default/aborted-close classification from spec.md §4.8 and §7.
//!
//! Grounded on `rask`'s `connection.rs` (`PlainConnection::read`/`write`,
//! its `ConnectionVersion` detection) and `worker.rs`'s read/parse/respond
//! sequence, simplified to own its bytes (via [`crate::buffer::Buffer`])
//! instead of borrowing from a shared slab-indexed `Arc<Mutex<Connection>>>`
//! — every session here runs its whole lifetime as one cooperative task on
//! exactly one worker, so there is no cross-thread connection lock to take.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::buffer::Buffer;
use crate::context_cache::WorkerContextPool;
use crate::error::IoError;
use crate::handler::{self, RuntimeHandle};
use crate::metrics::MetricsRegistry;
use crate::net::tcp_stream::TcpStream as CrateTcpStream;
use crate::parser::h1::{Request, Response};
use crate::parser::{Progress, Status, Version};
use crate::router::Router;
use crate::scheduler::Scheduler;

/// Per-token readiness state, set by the worker's event dispatch and
/// consulted by [`AwaitReadable`]/[`AwaitWritable`]. `mio`'s readiness
/// model is edge-triggered: a session clears its own flag after observing
/// `WouldBlock` and only trusts it again once the worker marks it from a
/// fresh event.
#[derive(Default)]
pub struct Readiness {
    readable: Cell<bool>,
    writable: Cell<bool>,
    waker: RefCell<Option<Waker>>,
}

impl Readiness {
    pub fn new() -> Rc<Self> {
        Rc::new(Readiness::default())
    }

    pub fn mark_readable(&self) {
        self.readable.set(true);
        self.wake();
    }

    pub fn mark_writable(&self) {
        self.writable.set(true);
        self.wake();
    }

    fn wake(&self) {
        if let Some(waker) = self.waker.borrow_mut().take() {
            waker.wake();
        }
    }
}

struct AwaitReadable<'a> {
    readiness: &'a Readiness,
}

impl Future for AwaitReadable<'_> {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        if self.readiness.readable.get() {
            Poll::Ready(())
        } else {
            *self.readiness.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct AwaitWritable<'a> {
    readiness: &'a Readiness,
}

impl Future for AwaitWritable<'_> {
    type Output = ();
    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        if self.readiness.writable.get() {
            Poll::Ready(())
        } else {
            *self.readiness.waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

/// Everything a session needs that outlives any single request: the route
/// table, the worker's handler-context pool, shared metrics, the scheduler
/// (for `reset_idle_counter`), and the configured product string for the
/// default `server` header.
#[derive(Clone)]
pub struct SessionContext {
    pub router: std::sync::Arc<Router>,
    pub contexts: Rc<WorkerContextPool>,
    pub metrics: std::sync::Arc<MetricsRegistry>,
    pub scheduler: Rc<Scheduler>,
    pub product: std::sync::Arc<str>,
}

/// Drives one connection's `reading → dispatched → writing → reading` loop
/// until the peer disconnects or an unrecoverable I/O error occurs, then
/// hands the stream back so the caller can deregister it from the reactor.
pub async fn run<S>(mut stream: S, readiness: Rc<Readiness>, ctx: SessionContext) -> S
where
    S: CrateTcpStream + Read + Write,
{
    let remote = stream.peer_addr().ok();
    let mut read_buf = Buffer::new();

    'session: loop {
        let mut request = Request::new();

        match read_request(&mut stream, &readiness, &mut read_buf, &mut request).await {
            Ok(true) => {}
            Ok(false) => break 'session, // clean EOF between requests
            Err(err) => {
                log_session_error(&err);
                break 'session;
            }
        }

        if request.expects_continue() {
            let interim = b"HTTP/1.1 100 Continue\r\n\r\n";
            if write_all(&mut stream, &readiness, interim).await.is_err() {
                break 'session;
            }
        }

        ctx.scheduler.reset_idle_counter();
        let response = dispatch(&request, &ctx, remote);
        let wire = response.serialize();

        if write_all(&mut stream, &readiness, &wire).await.is_err() {
            break 'session;
        }
    }

    stream
}

/// Reads and parses one request. `Ok(false)` signals a clean close between
/// pipelined requests (EOF with nothing buffered); anything else not
/// classified as EOF/aborted/reset is returned so the caller can log it at
/// error level before closing (spec.md §4.8).
async fn read_request<S>(
    stream: &mut S,
    readiness: &Readiness,
    buf: &mut Buffer,
    request: &mut Request,
) -> Result<bool, IoError>
where
    S: Read,
{
    let mut scratch = [0u8; 8192];
    loop {
        match request.parse(buf) {
            Ok(Progress::Complete) => return Ok(true),
            Ok(Progress::Partial) => {}
            Err(_) => return Err(IoError::Other(io::Error::new(io::ErrorKind::InvalidData, "malformed request"))),
        }

        match stream.read(&mut scratch) {
            Ok(0) => {
                return if buf.is_empty() {
                    Ok(false)
                } else {
                    Err(IoError::Eof)
                };
            }
            Ok(n) => buf.extend(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                readiness.readable.set(false);
                AwaitReadable { readiness }.await;
            }
            Err(e) => return Err(IoError::from(e)),
        }
    }
}

async fn write_all<S>(stream: &mut S, readiness: &Readiness, mut bytes: &[u8]) -> Result<(), IoError>
where
    S: Write,
{
    while !bytes.is_empty() {
        match stream.write(bytes) {
            Ok(0) => return Err(IoError::from(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                readiness.writable.set(false);
                AwaitWritable { readiness }.await;
            }
            Err(e) => return Err(IoError::from(e)),
        }
    }
    Ok(())
}

/// Routes and executes one parsed request, returning the response to write.
/// Implements `add_route`'s closure contract (spec.md §4.7). Ground truth
/// in `original_source/src/core/router.h`'s `m_http_default` sends 404
/// unconditionally for any unmatched path; the 501 branch in
/// `server_impl.cpp`'s `add_route_http` only exists inside a matched
/// route's installed closure. So: unmatched path ⇒ 404 regardless of
/// method, non-GET/POST on a matched route ⇒ 501, handler failure ⇒ 500,
/// success ⇒ the handler's response with the default `server` header
/// filled in if absent.
fn dispatch(request: &Request, ctx: &SessionContext, remote: Option<std::net::SocketAddr>) -> Response {
    let version = request.version.unwrap_or(Version::Http11);
    let method = request.method;
    let handler_id = ctx.router.find(&request.target);

    ctx.metrics.requests.increment();

    if handler_id == crate::router::DEFAULT_HANDLER {
        let mut response = Response::new(version, Status::NotFound);
        response.ensure_server_header(&ctx.product);
        return response;
    }

    // Registered at bootstrap by `Server::add_route`/`add_directory_route`;
    // a lock-free lookup, never an insert, on the request path.
    let route_metrics = ctx.metrics.route(handler_id);
    if let Some(route_metrics) = &route_metrics {
        route_metrics.requests.increment();
    }

    let is_routable = matches!(method, Some(crate::parser::Method::Get) | Some(crate::parser::Method::Post));
    if !is_routable {
        ctx.metrics.not_implemented.increment();
        if let Some(route_metrics) = &route_metrics {
            route_metrics.not_implemented.increment();
        }
        let mut response = Response::new(version, Status::NotImplemented);
        response.ensure_server_header(&ctx.product);
        return response;
    }

    let handler_request = handler::Request {
        timestamp: unix_timestamp(),
        method: method.map(|m| m.to_string()).unwrap_or_default(),
        proto: version.to_string(),
        host: request.headers.get("host").cloned().unwrap_or_default(),
        path: request.target.clone(),
        headers: request.headers.clone(),
        remote_addr_str: remote.map(|a| a.ip().to_string()).unwrap_or_default(),
        remote_addr_ip_ver: remote.map(|a| if a.is_ipv4() { 4 } else { 6 }).unwrap_or(4),
        cookies: None,
        content: if request.body.is_empty() { None } else { Some(request.body.clone()) },
    };

    let sample = route_metrics.as_ref().is_some_and(|m| m.should_sample());
    let started = sample.then(std::time::Instant::now);

    let engine_ctx = ctx.contexts.get_state();
    let (status, headers, body) = run_handler(engine_ctx, ctx, handler_id, &handler_request);

    if let (Some(route_metrics), Some(started)) = (&route_metrics, started) {
        route_metrics.record_sample(started.elapsed());
    }

    let mut response = Response::from_handler(version, status, headers, body);
    response.ensure_server_header(&ctx.product);
    response
}

fn run_handler(
    mut engine_ctx: Box<dyn handler::ScriptEngine>,
    ctx: &SessionContext,
    handler_id: &str,
    request: &handler::Request,
) -> (u16, std::collections::HashMap<String, String>, Vec<u8>) {
    let runtime = RuntimeHandle { worker_id: 0 };
    let result = engine_ctx.call(handler_id, request, runtime);
    ctx.contexts.free_state(engine_ctx);

    match result {
        Ok(response) => (response.status, response.headers, response.content),
        Err(err) => {
            tracing::debug!(handler = handler_id, error = %err, "handler error");
            ctx.metrics.errors.increment();
            if let Some(route_metrics) = ctx.metrics.route(handler_id) {
                route_metrics.errors.increment();
            }
            (500, std::collections::HashMap::new(), Vec::new())
        }
    }
}

fn log_session_error(err: &IoError) {
    match err {
        IoError::Eof | IoError::OperationAborted | IoError::ConnectionReset => {}
        IoError::Other(source) => tracing::error!(error = %source, "session i/o error"),
    }
}

fn unix_timestamp() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_cache::SharedContextPool;
    use crate::router::Router as RouterType;
    use std::sync::Arc;

    fn base_ctx() -> SessionContext {
        let mut router = RouterType::new();
        router.add("/a", "handler-a").unwrap();
        let shared = SharedContextPool::new(Vec::new(), 0, false);
        SessionContext {
            router: Arc::new(router),
            contexts: Rc::new(WorkerContextPool::new(shared)),
            metrics: Arc::new(MetricsRegistry::new()),
            scheduler: Rc::new(Scheduler::new().unwrap()),
            product: Arc::from("fiberweb-test/0.1"),
        }
    }

    fn parsed(bytes: &[u8]) -> Request {
        let mut buf = Buffer::new();
        buf.extend(bytes);
        let mut req = Request::new();
        req.parse(&mut buf).unwrap();
        req
    }

    #[test]
    fn non_get_post_yields_501() {
        let ctx = base_ctx();
        let req = parsed(b"PATCH / HTTP/1.1\r\n\r\n");
        let response = dispatch(&req, &ctx, None);
        assert_eq!(response.status_code, 501);
        assert!(response.headers.contains_key("server"));
    }

    #[test]
    fn unmatched_route_yields_404() {
        let ctx = base_ctx();
        let req = parsed(b"GET /missing HTTP/1.1\r\n\r\n");
        let response = dispatch(&req, &ctx, None);
        assert_eq!(response.status_code, 404);
    }

    #[test]
    fn non_get_post_on_unmatched_path_still_yields_404() {
        let ctx = base_ctx();
        let req = parsed(b"PATCH /missing HTTP/1.1\r\n\r\n");
        let response = dispatch(&req, &ctx, None);
        assert_eq!(response.status_code, 404);
    }

    #[test]
    fn missing_handler_behind_matched_route_yields_500() {
        let ctx = base_ctx();
        let req = parsed(b"GET /a HTTP/1.1\r\n\r\n");
        let response = dispatch(&req, &ctx, None);
        assert_eq!(response.status_code, 500);
    }
}
