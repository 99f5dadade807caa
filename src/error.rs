//! Error taxonomy shared across the crate.
//!
//! Mirrors the original implementation's informal exception hierarchy
//! (`std::runtime_error` subclasses thrown from `server_impl`, `session` and
//! `resolver_cache`) with a `thiserror` enum per category.

use std::io;

use thiserror::Error;

/// Top-level error type returned by fallible, non-per-request operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad CLI flags, bad config file, or an invalid route registration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The user-defined `bootstrap` routine did not run to completion.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// DNS resolution failed or returned no usable endpoints.
    #[error("dns resolution failed for {host}:{service}: {reason}")]
    Resolve {
        /// Host that was being resolved.
        host: String,
        /// Service/port that was being resolved.
        service: String,
        /// Human-readable reason.
        reason: String,
    },

    /// I/O failure, classified per §7.
    #[error(transparent)]
    Io(#[from] IoError),
}

/// Configuration-time errors. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An unknown CLI flag or config key was supplied.
    #[error("unknown option: {0}")]
    UnknownOption(String),

    /// A flag value failed to parse (e.g. a non-integer `--server.workers`).
    #[error("invalid value for {flag}: {value}")]
    InvalidValue {
        /// The flag name.
        flag: String,
        /// The offending value.
        value: String,
    },

    /// A route with an empty path prefix was registered.
    #[error("empty route prefixes are not allowed")]
    InvalidRoute,

    /// The config file could not be read or parsed.
    #[error("failed to load config file {path}: {source}")]
    ConfigFile {
        /// Path to the config file.
        path: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// A flag selects a mode this build does not implement.
    #[error("{flag} selects an unsupported mode: {reason}")]
    UnsupportedValue {
        /// The flag name.
        flag: String,
        /// Why the requested mode cannot run.
        reason: String,
    },
}

/// I/O failure classification used by the session loop (§7).
#[derive(Debug, Error)]
pub enum IoError {
    /// The peer closed the connection cleanly.
    #[error("end of stream")]
    Eof,

    /// A pending operation was cancelled (timeout, shutdown).
    #[error("operation aborted")]
    OperationAborted,

    /// The peer reset the connection.
    #[error("connection reset")]
    ConnectionReset,

    /// Any other I/O failure, logged at error level before the session closes.
    #[error("io error: {0}")]
    Other(#[source] io::Error),
}

impl From<io::Error> for IoError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            UnexpectedEof => IoError::Eof,
            ConnectionReset => IoError::ConnectionReset,
            ConnectionAborted | Interrupted if is_aborted(&e) => IoError::OperationAborted,
            _ => IoError::Other(e),
        }
    }
}

fn is_aborted(e: &io::Error) -> bool {
    e.raw_os_error().is_some() && e.kind() == io::ErrorKind::ConnectionAborted
}

/// A malformed or failing request handler invocation. Reported to the client
/// as HTTP 500; never fatal to the worker.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler routine panicked or raised inside the script engine.
    #[error("handler {handler} raised: {message}")]
    Raised {
        /// The handler identifier that was invoked.
        handler: String,
        /// The error message surfaced by the script engine.
        message: String,
    },

    /// The handler returned a response object that does not satisfy the
    /// handler interface contract (§6): non-integer status, bad header map,
    /// etc.
    #[error("handler {handler} returned a malformed response: {reason}")]
    MalformedResponse {
        /// The handler identifier that was invoked.
        handler: String,
        /// Why the response was rejected.
        reason: String,
    },
}
