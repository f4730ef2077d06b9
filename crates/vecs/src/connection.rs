//! Per-client state owned exclusively by the reactor thread.

use std::io;
use std::os::fd::RawFd;

use mio::net::TcpStream;

use crate::buffer::DynBuf;
use crate::protocol::Parser;

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Reading,
    Closing,
}

/// A single client connection: its socket, both directions' buffers, the
/// in-progress parser, and a stable id that survives fd reuse.
///
/// `destroy` is a controlled single-shot operation: the socket is dropped
/// and the fd set to the `-1` sentinel, so a double-destroy is a no-op.
pub struct Connection {
    stream: Option<TcpStream>,
    fd: RawFd,
    pub id: ConnId,
    pub read_buf: DynBuf,
    pub write_buf: DynBuf,
    pub parser: Parser,
    pub state: LifecycleState,
}

impl Connection {
    pub fn new(stream: TcpStream, fd: RawFd, id: ConnId) -> Self {
        Self {
            stream: Some(stream),
            fd,
            id,
            read_buf: DynBuf::with_capacity(4096),
            write_buf: DynBuf::with_capacity(4096),
            parser: Parser::new(),
            state: LifecycleState::Reading,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Issues one non-blocking write of the backlog directly against the
    /// socket.
    pub fn write_once(&mut self) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => self.write_buf.write_to(stream),
            None => Ok(0),
        }
    }

    /// Issues one non-blocking read into the read buffer directly from the
    /// socket. See `write_once` for why this isn't decomposed further.
    pub fn read_once(&mut self) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => self.read_buf.read_from(stream),
            None => Ok(0),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.fd != -1
    }

    /// Closes the socket and marks the connection destroyed. Safe to call
    /// more than once: the `-1` sentinel makes the second call a no-op.
    pub fn destroy(&mut self) {
        if self.fd == -1 {
            return;
        }
        self.stream = None;
        self.fd = -1;
    }
}
