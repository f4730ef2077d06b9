//! Minimal mio-backed readiness layer.
//!
//! This crate deliberately stops at "give me readiness events for tokens I
//! registered". Framing, buffering, and protocol parsing belong to the
//! caller. See `vecs::reactor` for the event loop built on top of it.

mod listener;
mod poller;

pub use listener::{accept_all, bind_listener, prepare_stream};
pub use mio::{Interest, Token, event::Event, net::TcpListener, net::TcpStream};
pub use poller::Poller;
