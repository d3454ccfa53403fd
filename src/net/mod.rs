//! The TCP base transport (§4.4, component C5's foundation): a [`Layer`]
//! wrapping a non-blocking `socket2::Socket`, usable standalone or as
//! layer 0 under a PROXY-protocol or other wrapping layer.
//!
//! Grounded on the teacher's `net::tcp::stream`/`net::tcp::listener`: a
//! non-blocking socket created via `socket2` (for the portable
//! `nonblocking()` constructor), exposed to the rest of the crate through
//! the same [`crate::sys::Pollable`] seam mio uses for its `Registry`.

mod tcp_base;

pub use tcp_base::{TcpBase, TcpListenerBase};
