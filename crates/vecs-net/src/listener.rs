use std::{io, net::SocketAddr};

use mio::net::{TcpListener, TcpStream};
use tracing::warn;

/// Binds a non-blocking listening socket. `mio::net::TcpListener` is
/// non-blocking by construction.
pub fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    TcpListener::bind(addr)
}

/// Repeatedly accepts connections from `listener`, invoking `on_accept` for
/// each one, until the kernel backlog would block. mio listeners are
/// edge-triggered, so a single `accept()` per readable event would silently
/// strand queued connections.
pub fn accept_all<F>(listener: &TcpListener, mut on_accept: F) -> io::Result<()>
where
    F: FnMut(TcpStream, SocketAddr),
{
    loop {
        match listener.accept() {
            Ok((stream, addr)) => on_accept(stream, addr),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(?e, "accept() failed");
                return Err(e);
            }
        }
    }
}

/// Disables Nagle's algorithm; request/response traffic otherwise sees
/// 40ms+ of coalescing delay on small frames.
pub fn prepare_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
