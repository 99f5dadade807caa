//! Handler interface contract (spec.md §6) and the stand-in scripting
//! engine.
//!
//! No scripting language is embedded here — spec.md's Non-goals explicitly
//! exclude scripting-language semantics, and nothing in the retrieval pack
//! pulls in an embeddable interpreter (`mlua`/`rlua` do not appear anywhere
//! in the corpus). The "handler context" from §3/§4.4 is instead a trait
//! object, [`ScriptEngine`], with one concrete implementation,
//! [`NativeEngine`], that dispatches to handlers registered as plain Rust
//! closures. Everything C4 specifies about a context — library-load hook,
//! `code_version`, transient objects, dev-mode reload — is modeled on this
//! trait rather than on a real interpreter handle.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::HandlerError;

/// The request object handed to a handler (§6's core→handler contract).
#[derive(Debug, Clone)]
pub struct Request {
    pub timestamp: u64,
    pub method: String,
    pub proto: String,
    pub host: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub remote_addr_str: String,
    pub remote_addr_ip_ver: u8,
    pub cookies: Option<HashMap<String, String>>,
    pub content: Option<Vec<u8>>,
}

/// The mutable response object a handler fills in (§6's handler→core
/// contract). `status=200`, empty content, and an empty header map are the
/// prescribed defaults.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub content: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            status: 200,
            content: Vec::new(),
            headers: HashMap::new(),
        }
    }
}

/// A handler routine. Grounded on the library-load hook in
/// `original_source/src/lua/lua_state_manager.cpp`'s `register_lib`: a named
/// entry point invoked by identifier, not a virtual dispatch table.
pub type HandlerFn = Arc<dyn Fn(&Request) -> Result<Response, HandlerError> + Send + Sync>;

/// One externally-provided library to install into every handler context at
/// construction time. Per spec.md §9's re-architecture guidance, this is an
/// explicit, server-construction-time list rather than a process-wide static
/// vector populated at static-init time.
#[derive(Clone)]
pub struct LibraryDescriptor {
    pub name: &'static str,
    pub install: Arc<dyn Fn(&mut NativeEngine) + Send + Sync>,
}

impl fmt::Debug for LibraryDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryDescriptor").field("name", &self.name).finish()
    }
}

/// Handle to resources a handler context needs beyond the request/response
/// pair — the worker's event loop and a back-reference to the server,
/// modeled on `original_source`'s `petrel_context` (§3 of SPEC_FULL.md).
#[derive(Debug, Clone, Copy)]
pub struct RuntimeHandle {
    pub worker_id: usize,
}

/// A reusable handler-execution context (C4's "opaque scripting-interpreter
/// instance"). One concrete implementation, [`NativeEngine`], stands in for
/// the externally-specified embedded interpreter.
pub trait ScriptEngine: Send {
    /// Invokes the named handler. `HandlerError::Raised` if no handler by
    /// that name is registered or the handler itself fails.
    fn call(&mut self, handler_id: &str, request: &Request, runtime: RuntimeHandle) -> Result<Response, HandlerError>;

    /// Clears the context's transient-objects list (§3's invariant: empty
    /// whenever the context is idle). Called by C4's `free_state`.
    fn clear_transients(&mut self);

    /// The `code_version` this context was last refreshed against.
    fn code_version(&self) -> u64;

    /// Reloads user code if `target_version` is newer than
    /// [`ScriptEngine::code_version`], or unconditionally in dev mode.
    fn reload(&mut self, target_version: u64, force: bool);
}

/// Stand-in for the embedded scripting interpreter: dispatches to handlers
/// registered as Rust closures, with the same context lifecycle (library
/// install at construction, transient-object tracking, code-version
/// refresh) an interpreter-backed implementation would have.
pub struct NativeEngine {
    handlers: HashMap<String, HandlerFn>,
    transient_objects: Vec<Box<dyn std::any::Any + Send>>,
    code_version: u64,
}

impl fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEngine")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("transient_objects", &self.transient_objects.len())
            .field("code_version", &self.code_version)
            .finish()
    }
}

impl NativeEngine {
    /// Builds a context and runs every library's install hook, mirroring
    /// `lua_state_manager.cpp`'s `load_libs` call during `create_state`.
    pub fn new(libraries: &[LibraryDescriptor], code_version: u64) -> Self {
        let mut engine = NativeEngine {
            handlers: HashMap::new(),
            transient_objects: Vec::new(),
            code_version,
        };
        for library in libraries {
            (library.install)(&mut engine);
        }
        engine
    }

    /// Registers a handler under `handler_id`, invoked by
    /// [`crate::router::Router::find`]'s returned identifier.
    pub fn register(&mut self, handler_id: impl Into<String>, handler: HandlerFn) {
        self.handlers.insert(handler_id.into(), handler);
    }

    /// Hands the context a transient object that lives until the next
    /// `clear_transients` (§3's handler-context invariant).
    pub fn push_transient(&mut self, object: Box<dyn std::any::Any + Send>) {
        self.transient_objects.push(object);
    }
}

impl ScriptEngine for NativeEngine {
    fn call(&mut self, handler_id: &str, request: &Request, _runtime: RuntimeHandle) -> Result<Response, HandlerError> {
        let handler = self.handlers.get(handler_id).ok_or_else(|| HandlerError::Raised {
            handler: handler_id.to_string(),
            message: "no handler registered under this identifier".to_string(),
        })?;
        handler(request)
    }

    fn clear_transients(&mut self) {
        self.transient_objects.clear();
    }

    fn code_version(&self) -> u64 {
        self.code_version
    }

    fn reload(&mut self, target_version: u64, force: bool) {
        if force || target_version > self.code_version {
            self.code_version = target_version;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_library() -> LibraryDescriptor {
        LibraryDescriptor {
            name: "echo",
            install: Arc::new(|engine: &mut NativeEngine| {
                engine.register(
                    "echo",
                    Arc::new(|req: &Request| {
                        Ok(Response {
                            status: 200,
                            content: req.path.clone().into_bytes(),
                            headers: HashMap::new(),
                        })
                    }),
                );
            }),
        }
    }

    fn sample_request() -> Request {
        Request {
            timestamp: 0,
            method: "GET".to_string(),
            proto: "HTTP/1.1".to_string(),
            host: "example.test".to_string(),
            path: "/a/b".to_string(),
            headers: HashMap::new(),
            remote_addr_str: "127.0.0.1".to_string(),
            remote_addr_ip_ver: 4,
            cookies: None,
            content: None,
        }
    }

    #[test]
    fn installs_libraries_at_construction() {
        let mut engine = NativeEngine::new(&[echo_library()], 1);
        let response = engine
            .call("echo", &sample_request(), RuntimeHandle { worker_id: 0 })
            .unwrap();
        assert_eq!(response.content, b"/a/b");
    }

    #[test]
    fn missing_handler_raises() {
        let mut engine = NativeEngine::new(&[], 1);
        let err = engine
            .call("missing", &sample_request(), RuntimeHandle { worker_id: 0 })
            .unwrap_err();
        assert!(matches!(err, HandlerError::Raised { .. }));
    }

    #[test]
    fn clear_transients_empties_list() {
        let mut engine = NativeEngine::new(&[], 1);
        engine.push_transient(Box::new(42i32));
        engine.clear_transients();
        assert_eq!(engine.transient_objects.len(), 0);
    }

    #[test]
    fn reload_only_advances_version_when_newer_or_forced() {
        let mut engine = NativeEngine::new(&[], 1);
        engine.reload(1, false);
        assert_eq!(engine.code_version(), 1);
        engine.reload(2, false);
        assert_eq!(engine.code_version(), 2);
        engine.reload(2, true);
        assert_eq!(engine.code_version(), 2);
    }
}
