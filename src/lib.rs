//! fiberweb — an HTTP request server (HTTP/1 implemented; HTTP/2 selected
//! by default per `--server.http1`'s contract but not yet built, see
//! [`server::Server::run`]) whose route handlers are authored as plain Rust
//! closures dispatched through a pluggable handler-context engine, built
//! around a cooperative single-threaded-per-worker task scheduler,
//! thread-local resource caches, and a byte-trie path router.
//!
//! See [`server::Server`] for the top-level entry point.

pub mod buffer;
pub mod config;
pub mod context_cache;
pub mod error;
pub mod file_cache;
pub mod handler;
pub mod metrics;
pub mod net;
pub mod parser;
pub mod resolver;
pub mod router;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod task_cache;
pub mod worker;
