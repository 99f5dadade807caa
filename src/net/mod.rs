//! Generic TCP abstractions over `mio`/`std` sockets (grounded on `rask`'s
//! `net` module), kept so sessions and listeners can be exercised against
//! `std::net` sockets in tests without a live reactor.

pub mod tcp_listener;
pub mod tcp_stream;
