//! End-to-end coverage driving a real [`Worker`] over a loopback socket,
//! exercising C1 (router), C4 (handler context), C6 (worker), and C8
//! (session) together the way `Server::run` wires them, without the
//! process-wide signal handling `Server::run` installs.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fiberweb::context_cache::SharedContextPool;
use fiberweb::handler::{LibraryDescriptor, NativeEngine, Request as HandlerRequest, Response as HandlerResponse};
use fiberweb::metrics::MetricsRegistry;
use fiberweb::router::Router;
use fiberweb::worker::Worker;

fn echo_library() -> LibraryDescriptor {
    LibraryDescriptor {
        name: "echo",
        install: Arc::new(|engine: &mut NativeEngine| {
            engine.register(
                "echo",
                Arc::new(|req: &HandlerRequest| {
                    Ok(HandlerResponse {
                        status: 200,
                        content: req.path.clone().into_bytes(),
                        headers: HashMap::new(),
                    })
                }),
            );
        }),
    }
}

fn failing_library() -> LibraryDescriptor {
    LibraryDescriptor {
        name: "boom",
        install: Arc::new(|engine: &mut NativeEngine| {
            engine.register(
                "boom",
                Arc::new(|_req: &HandlerRequest| {
                    Err(fiberweb::error::HandlerError::Raised {
                        handler: "boom".to_string(),
                        message: "deliberate failure".to_string(),
                    })
                }),
            );
        }),
    }
}

struct RunningWorker {
    addr: std::net::SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
    handle: std::thread::JoinHandle<()>,
}

impl RunningWorker {
    fn start(router: Router, libraries: Vec<LibraryDescriptor>) -> Self {
        let shared = SharedContextPool::new(libraries, 1, false);
        let metrics = Arc::new(MetricsRegistry::new());
        let stop = Arc::new(AtomicBool::new(false));

        let listener = mio::net::TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let (waker_tx, waker_rx) = std::sync::mpsc::channel();
        let stop_for_thread = Arc::clone(&stop);
        let router = Arc::new(router);
        let product: Arc<str> = Arc::from("fiberweb-test/0.1");

        let handle = std::thread::spawn(move || {
            let worker = Worker::new(listener, shared, router, metrics, product, stop_for_thread).unwrap();
            waker_tx.send(worker.scheduler_waker()).unwrap();
            worker.run().unwrap();
        });

        let waker = waker_rx.recv_timeout(Duration::from_secs(5)).expect("worker failed to start");

        RunningWorker { addr, stop, waker, handle }
    }

    fn request(&self, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream.write_all(raw).unwrap();

        let mut buf = [0u8; 8192];
        let n = stream.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    fn shutdown(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
        self.handle.join().unwrap();
    }
}

#[test]
fn routed_get_is_answered_by_its_handler() {
    let mut router = Router::new();
    router.add("/echo", "echo").unwrap();

    let worker = RunningWorker::start(router, vec![echo_library()]);
    let response = worker.request(b"GET /echo HTTP/1.1\r\nHost: test\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
    assert!(response.ends_with("/echo"), "{response}");
    assert!(response.contains("server: fiberweb-test/0.1"), "{response}");

    worker.shutdown();
}

#[test]
fn non_get_post_method_yields_501() {
    let mut router = Router::new();
    router.add("/echo", "echo").unwrap();

    let worker = RunningWorker::start(router, vec![echo_library()]);
    let response = worker.request(b"PATCH /echo HTTP/1.1\r\nHost: test\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 501"), "{response}");
    worker.shutdown();
}

#[test]
fn unmatched_path_yields_404() {
    let router = Router::new();
    let worker = RunningWorker::start(router, Vec::new());

    let response = worker.request(b"GET /nowhere HTTP/1.1\r\nHost: test\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    worker.shutdown();
}

#[test]
fn non_get_post_method_on_unmatched_path_still_yields_404() {
    let router = Router::new();
    let worker = RunningWorker::start(router, Vec::new());

    let response = worker.request(b"PATCH /nowhere HTTP/1.1\r\nHost: test\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 404"), "{response}");

    worker.shutdown();
}

#[test]
fn handler_failure_yields_500_and_session_stays_open_for_next_request() {
    let mut router = Router::new();
    router.add("/boom", "boom").unwrap();

    let worker = RunningWorker::start(router, vec![failing_library()]);

    let mut stream = TcpStream::connect(worker.addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"GET /boom HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();
    let mut buf = [0u8; 4096];
    let n = stream.read(&mut buf).unwrap();
    let first = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(first.starts_with("HTTP/1.1 500"), "{first}");

    // Pipelined follow-up on the same connection still gets served (§8 S3:
    // one handler failure does not poison the connection or the worker).
    stream.write_all(b"GET /boom HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();
    let n = stream.read(&mut buf).unwrap();
    let second = String::from_utf8_lossy(&buf[..n]).to_string();
    assert!(second.starts_with("HTTP/1.1 500"), "{second}");

    drop(stream);
    worker.shutdown();
}

#[test]
fn pipelined_requests_on_one_connection_are_each_answered() {
    let mut router = Router::new();
    router.add("/echo", "echo").unwrap();
    let worker = RunningWorker::start(router, vec![echo_library()]);

    let mut stream = TcpStream::connect(worker.addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
        .write_all(b"GET /echo HTTP/1.1\r\nHost: test\r\n\r\nGET /echo HTTP/1.1\r\nHost: test\r\n\r\n")
        .unwrap();

    let mut collected = Vec::new();
    let mut buf = [0u8; 8192];
    // Two responses should arrive; read until both status lines have shown
    // up or the read times out.
    loop {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&collected);
        if text.matches("HTTP/1.1 200 OK").count() >= 2 {
            break;
        }
    }
    let text = String::from_utf8_lossy(&collected);
    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2, "{text}");

    drop(stream);
    worker.shutdown();
}
