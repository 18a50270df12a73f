//! Readiness multiplexing for channels and the native resolver.
//!
//! One [`Reactor`] per session, wrapping a `polling::Poller` (epoll or the
//! platform equivalent). Participants are keyed by token; the session
//! recomputes every participant's interest each tick and re-arms before
//! blocking, which also squares with the poller's oneshot delivery. The
//! poller's notify handle doubles as the wakeup path for the resolver
//! worker thread.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use polling::{Event, Events, Poller};

/// Readiness interest for one participant, recomputed every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const NONE: Interest = Interest {
        readable: false,
        writable: false,
    };
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };

    fn to_event(self, key: usize) -> Event {
        match (self.readable, self.writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// Structured result of driving a participant, replacing any ambient
/// close signalling: the reactor caller decides what happens next.
#[derive(Debug)]
pub enum Drive {
    /// Keep the participant registered.
    Continue,
    /// Tear the participant down; requests it still holds fail with the
    /// given reason.
    Close(crate::error::ErrorKind, String),
    /// Transport died but the engine still holds answerable requests;
    /// re-enqueue them on a fresh transport.
    NeedsReconnect,
}

/// A readiness event delivered to the session loop.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub key: usize,
    pub readable: bool,
    pub writable: bool,
}

pub struct Reactor {
    poller: Arc<Poller>,
    /// Token -> fd currently armed with the poller.
    armed: HashMap<usize, RawFd>,
    events: Events,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            armed: HashMap::new(),
            events: Events::new(),
        })
    }

    /// Handle that wakes a blocked [`Reactor::wait`] from another thread.
    pub fn waker(&self) -> Arc<Poller> {
        self.poller.clone()
    }

    /// Register or re-arm `fd` under `key` with the given interest.
    pub fn arm(&mut self, key: usize, fd: RawFd, interest: Interest) -> io::Result<()> {
        match self.armed.get(&key) {
            Some(&old_fd) if old_fd == fd => {
                let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
                self.poller.modify(fd, interest.to_event(key))?;
            }
            Some(&old_fd) => {
                // Same participant, new socket (reconnect): swap registrations.
                let old = unsafe { std::os::fd::BorrowedFd::borrow_raw(old_fd) };
                let _ = self.poller.delete(old);
                unsafe { self.poller.add(fd, interest.to_event(key))? };
                self.armed.insert(key, fd);
            }
            None => {
                unsafe { self.poller.add(fd, interest.to_event(key))? };
                self.armed.insert(key, fd);
            }
        }
        Ok(())
    }

    /// Drop `key`'s registration, if present.
    pub fn disarm(&mut self, key: usize) {
        if let Some(fd) = self.armed.remove(&key) {
            let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
            let _ = self.poller.delete(fd);
        }
    }

    /// Block until readiness or timeout. Fills `out` with delivered events.
    pub fn wait(&mut self, out: &mut Vec<Readiness>, timeout: Option<Duration>) -> io::Result<()> {
        out.clear();
        self.events.clear();
        self.poller.wait(&mut self.events, timeout)?;
        for event in self.events.iter() {
            out.push(Readiness {
                key: event.key,
                readable: event.readable,
                writable: event.writable,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn writable_socket_fires() {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        reactor.arm(1, a.as_raw_fd(), Interest::WRITE).unwrap();

        let mut events = Vec::new();
        reactor
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, 1);
        assert!(events[0].writable);
    }

    #[test]
    fn readable_fires_after_peer_write() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        reactor.arm(7, a.as_raw_fd(), Interest::READ).unwrap();

        let mut events = Vec::new();
        reactor
            .wait(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(events.is_empty());

        b.write_all(b"x").unwrap();
        reactor
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);
    }

    #[test]
    fn oneshot_requires_rearm() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        reactor.arm(3, a.as_raw_fd(), Interest::READ).unwrap();
        b.write_all(b"x").unwrap();

        let mut events = Vec::new();
        reactor
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events.len(), 1);

        // Without re-arming, the same readiness is not delivered again.
        reactor
            .wait(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(events.is_empty());

        reactor.arm(3, a.as_raw_fd(), Interest::READ).unwrap();
        reactor
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn timeout_elapses_without_events() {
        let mut reactor = Reactor::new().unwrap();
        let mut events = Vec::new();
        let start = Instant::now();
        reactor
            .wait(&mut events, Some(Duration::from_millis(40)))
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(events.is_empty());
    }

    #[test]
    fn waker_unblocks_wait() {
        let mut reactor = Reactor::new().unwrap();
        let waker = reactor.waker();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.notify().unwrap();
        });
        let mut events = Vec::new();
        let start = Instant::now();
        reactor
            .wait(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn disarm_stops_delivery() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut reactor = Reactor::new().unwrap();
        reactor.arm(5, a.as_raw_fd(), Interest::READ).unwrap();
        reactor.disarm(5);
        b.write_all(b"x").unwrap();
        let mut events = Vec::new();
        reactor
            .wait(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        assert!(events.is_empty());
    }
}
