use std::{io, time::Duration};

use mio::{Events, Interest, Poll, Token, event::Event, event::Source};

/// Cross-platform readiness multiplexer, edge-triggered where the OS supports
/// it (mio falls back to level-triggered emulation on platforms without
/// epoll/kqueue).
///
/// Every registered source carries an opaque [`Token`] supplied at
/// registration time. Callers use the token to discriminate the listener,
/// the worker-completion source, and individual client connections without a
/// second lookup.
///
/// Edge-triggered callers MUST drain readable/writable sources in a loop
/// until the operation returns `WouldBlock`; a single read/write per event is
/// not sufficient.
pub struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self { poll: Poll::new()?, events: Events::with_capacity(capacity) })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Registers `source` for read-readiness under `tag`.
    pub fn add_readable<S: Source + ?Sized>(&self, source: &mut S, tag: Token) -> io::Result<()> {
        self.poll.registry().register(source, tag, Interest::READABLE)
    }

    /// Deregisters `source`. Deregistering something never registered (or
    /// already removed) is not an error.
    pub fn delete<S: Source + ?Sized>(&self, source: &mut S) -> io::Result<()> {
        match self.poll.registry().deregister(source) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Arms write-readiness alongside the existing read interest.
    pub fn enable_write<S: Source + ?Sized>(&self, source: &mut S, tag: Token) -> io::Result<()> {
        self.poll.registry().reregister(source, tag, Interest::READABLE | Interest::WRITABLE)
    }

    /// Drops write-readiness, keeping read interest armed. Callers should
    /// only do this once their write backlog is fully drained, to avoid
    /// spinning at 100% CPU on a perpetually-writable socket.
    pub fn disable_write<S: Source + ?Sized>(&self, source: &mut S, tag: Token) -> io::Result<()> {
        self.poll.registry().reregister(source, tag, Interest::READABLE)
    }

    /// Blocks up to `timeout` (`None` = forever) for readiness events.
    /// A transient signal interruption is reported as zero events, not
    /// an error.
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => Ok(self.events.iter().count()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Events produced by the most recent [`Poller::poll`] call.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }
}
