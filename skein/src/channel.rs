//! A channel couples one transport to one protocol engine.
//!
//! It owns the read and write buffers, the pending-request queue, and the
//! connect lifecycle. The session drives it through structured [`Drive`]
//! results; nothing here throws its way out of the reactor.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use rustls::pki_types::{CertificateDer, ServerName};

use crate::buffer::Buffer;
use crate::engine::{Engine, EngineEvent, H1Engine, H2Engine, PeerClose};
use crate::error::{Error, ErrorKind};
use crate::options::Options;
use crate::reactor::{Drive, Interest};
use crate::session::{RequestId, Requests};
use crate::stats;
use crate::tls;
use crate::transport::{Protocol, ReadOutcome, Transport, TransportError};
use crate::uri::{Origin, Scheme};

const READ_BUF_CAP: usize = 64 * 1024;
const WRITE_BUF_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No live transport. Pending requests may be queued.
    Idle,
    /// Waiting on the resolver.
    Resolving,
    /// Transport allocated, connect/handshake in progress.
    Connecting,
    /// Connected; engine matches the negotiated protocol.
    Open,
    /// Torn down; buffers cleared.
    Closed,
}

/// Timer verdicts the session acts on.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelTimer {
    Idle,
    ConnectTimedOut,
    /// Reaped after sitting idle past the keep-alive window.
    Reaped,
}

pub struct Channel {
    pub origin: Origin,
    pub state: ChannelState,
    snapshot: Arc<Options>,
    transport: Option<Transport>,
    engine: Option<Engine>,
    read_buf: Buffer,
    write_buf: Buffer,
    /// Requests waiting for connect or for engine capacity. FIFO.
    pub pending: VecDeque<RequestId>,
    addrs: Vec<IpAddr>,
    addr_idx: usize,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Sticky across reconnects on this origin.
    pipelining_refused: bool,
    last_activity: Instant,
    connect_deadline: Option<Instant>,
    pub peer_cert: Option<CertificateDer<'static>>,
}

impl Channel {
    pub fn new(origin: Origin, snapshot: Arc<Options>) -> Result<Self, Error> {
        let tls_config = if origin.scheme.is_tls() {
            Some(tls::build_client_config(&snapshot.ssl)?)
        } else {
            None
        };
        Ok(Self {
            origin,
            state: ChannelState::Idle,
            snapshot,
            transport: None,
            engine: None,
            read_buf: Buffer::new(READ_BUF_CAP),
            write_buf: Buffer::new(WRITE_BUF_CAP),
            pending: VecDeque::new(),
            addrs: Vec::new(),
            addr_idx: 0,
            tls_config,
            pipelining_refused: false,
            last_activity: Instant::now(),
            connect_deadline: None,
            peer_cert: None,
        })
    }

    /// Hand a request to the engine now if it has room, otherwise queue it.
    pub fn send(&mut self, id: RequestId) {
        if self.state == ChannelState::Open {
            if let Some(engine) = self.engine.as_mut() {
                if engine.can_accept() {
                    engine.enqueue(id);
                    return;
                }
            }
        }
        self.pending.push_back(id);
    }

    pub fn needs_resolve(&self) -> bool {
        self.state == ChannelState::Idle && self.addrs.is_empty() && !self.pending.is_empty()
    }

    pub fn set_resolving(&mut self) {
        self.state = ChannelState::Resolving;
    }

    pub fn set_addrs(&mut self, addrs: Vec<IpAddr>) {
        self.addrs = addrs;
        self.addr_idx = 0;
        if self.state == ChannelState::Resolving {
            self.state = ChannelState::Idle;
        }
    }

    pub fn wants_connect(&self) -> bool {
        self.state == ChannelState::Idle && !self.addrs.is_empty() && !self.pending.is_empty()
    }

    /// The Idle -> Connecting transition: the only place a transport is
    /// allocated.
    pub fn start_connect(&mut self, now: Instant) {
        debug_assert!(self.wants_connect());
        let ip = self.addrs[self.addr_idx];
        let addr = SocketAddr::new(ip, self.origin.port);
        let transport = match self.origin.scheme {
            Scheme::Http => Transport::tcp(addr),
            Scheme::Https => {
                let config = self
                    .tls_config
                    .clone()
                    .expect("https channel carries a tls config");
                let name = match ServerName::try_from(self.origin.host.clone()) {
                    Ok(name) => name,
                    Err(_) => ServerName::IpAddress(ip.into()),
                };
                Transport::tls(addr, config, name)
            }
        };
        self.transport = Some(transport);
        self.state = ChannelState::Connecting;
        self.connect_deadline = self.snapshot.timeout.connect.map(|d| now + d);
        self.last_activity = now;
    }

    /// Readiness interest, derived from buffer state.
    pub fn interest(&self) -> Interest {
        match self.state {
            ChannelState::Connecting => Interest::BOTH,
            ChannelState::Open => {
                let engine_pending = self.engine.as_ref().is_some_and(|e| e.wants_write());
                let transport_pending = self.transport.as_ref().is_some_and(|t| t.wants_flush());
                let writable = !self.write_buf.is_empty() || engine_pending || transport_pending;
                if self.read_buf.is_full() {
                    Interest::WRITE
                } else if !writable {
                    Interest::READ
                } else {
                    Interest::BOTH
                }
            }
            _ => Interest::NONE,
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.transport.as_ref().and_then(|t| t.fd())
    }

    pub fn is_h2(&self) -> bool {
        matches!(self.engine, Some(Engine::H2(_)))
    }

    /// The address this channel is connected (or connecting) to.
    pub fn connected_ip(&self) -> Option<IpAddr> {
        self.addrs.get(self.addr_idx).copied()
    }

    pub fn has_outstanding(&self) -> bool {
        !self.pending.is_empty() || self.engine.as_ref().is_some_and(|e| e.has_outstanding())
    }

    /// Reactor callback: progress connect or move bytes both ways.
    pub fn on_ready(
        &mut self,
        readable: bool,
        writable: bool,
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) -> Drive {
        self.last_activity = Instant::now();
        match self.state {
            ChannelState::Connecting => self.poll_connect(reqs, events),
            ChannelState::Open => self.pump(readable, writable, reqs, events),
            _ => Drive::Continue,
        }
    }

    /// Make progress without a readiness event (new requests enqueued,
    /// engine output pending). Write-side only.
    pub fn drive(&mut self, reqs: &mut Requests, events: &mut Vec<EngineEvent>) -> Drive {
        match self.state {
            ChannelState::Connecting => self.poll_connect(reqs, events),
            ChannelState::Open => self.pump(false, true, reqs, events),
            _ => Drive::Continue,
        }
    }

    fn poll_connect(&mut self, reqs: &mut Requests, events: &mut Vec<EngineEvent>) -> Drive {
        let transport = self.transport.as_mut().expect("connecting without transport");
        match transport.poll_connect() {
            Ok(true) => {
                let protocol = transport.protocol();
                self.peer_cert = transport.peer_cert().cloned();
                self.engine = Some(self.make_engine(protocol));
                self.state = ChannelState::Open;
                self.connect_deadline = None;
                self.flush_pending();
                self.pump(false, true, reqs, events)
            }
            Ok(false) => Drive::Continue,
            Err(TransportError::Io(e)) => {
                // Other resolved addresses may still accept us.
                if self.addr_idx + 1 < self.addrs.len() {
                    self.addr_idx += 1;
                    self.transport = None;
                    self.state = ChannelState::Idle;
                    Drive::Continue
                } else {
                    Drive::Close(ErrorKind::Connect, e.to_string())
                }
            }
            Err(TransportError::Tls(e)) => Drive::Close(ErrorKind::Tls, e.to_string()),
        }
    }

    fn make_engine(&self, protocol: Protocol) -> Engine {
        let ua = self.snapshot.user_agent.clone();
        match protocol {
            Protocol::H1 => {
                let absolute_form =
                    self.snapshot.proxy.is_some() && self.origin.scheme == Scheme::Http;
                let pipelining = self.snapshot.pipelining && !self.pipelining_refused;
                Engine::H1(H1Engine::new(ua, pipelining, absolute_form))
            }
            Protocol::H2 => Engine::H2(H2Engine::new(
                self.snapshot.http2_settings.clone(),
                self.snapshot.max_concurrent_requests,
                ua,
            )),
        }
    }

    fn flush_pending(&mut self) {
        let Some(engine) = self.engine.as_mut() else {
            return;
        };
        while engine.can_accept() {
            let Some(id) = self.pending.pop_front() else {
                return;
            };
            engine.enqueue(id);
        }
    }

    fn pump(
        &mut self,
        readable: bool,
        _writable: bool,
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) -> Drive {
        // Bytes a previous tick could not parse (full buffer, engine at
        // capacity) get another chance before any new I/O.
        if !self.read_buf.is_empty() {
            let engine = self.engine.as_mut().expect("open without engine");
            match engine.consume(self.read_buf.view(), reqs, events) {
                Ok(used) => {
                    if used == 0 && self.read_buf.is_full() {
                        return Drive::Close(
                            ErrorKind::Protocol,
                            "response element exceeds buffer capacity".into(),
                        );
                    }
                    self.read_buf.consume(used);
                }
                Err((kind, msg)) => return Drive::Close(kind, msg),
            }
        }

        if let Err((kind, msg)) = self.pump_write(reqs) {
            return Drive::Close(kind, msg);
        }

        if readable {
            loop {
                if self.read_buf.is_full() {
                    break;
                }
                let transport = self.transport.as_mut().expect("open without transport");
                match transport.read(&mut self.read_buf) {
                    Ok(ReadOutcome::Data(_)) => {
                        let engine = self.engine.as_mut().expect("open without engine");
                        match engine.consume(self.read_buf.view(), reqs, events) {
                            Ok(used) => {
                                if used == 0 && self.read_buf.is_full() {
                                    // A single element larger than the whole
                                    // buffer can never complete.
                                    return Drive::Close(
                                        ErrorKind::Protocol,
                                        "response element exceeds buffer capacity".into(),
                                    );
                                }
                                self.read_buf.consume(used);
                            }
                            Err((kind, msg)) => return Drive::Close(kind, msg),
                        }
                    }
                    Ok(ReadOutcome::WouldBlock) => break,
                    Ok(ReadOutcome::Closed) => return self.peer_closed(reqs, events),
                    Err(TransportError::Io(e)) => {
                        return Drive::Close(ErrorKind::PeerClosed, e.to_string())
                    }
                    Err(TransportError::Tls(e)) => {
                        return Drive::Close(ErrorKind::Tls, e.to_string())
                    }
                }
            }
            // Reading usually generates output (acks, window updates) and
            // frees engine capacity for pending requests.
            self.flush_pending();
            if let Err((kind, msg)) = self.pump_write(reqs) {
                return Drive::Close(kind, msg);
            }
        }

        // A connection marked close-per-exchange is done once the current
        // responses are in; anything still queued replays elsewhere.
        if let Some(engine) = self.engine.as_ref() {
            if engine.close_after() && !engine.has_outstanding() && self.write_buf.is_empty() {
                return if self.pending.is_empty() {
                    Drive::Close(ErrorKind::PeerClosed, "connection closed by exchange".into())
                } else {
                    Drive::NeedsReconnect
                };
            }
        }

        Drive::Continue
    }

    /// Fill from the engine and flush to the transport until neither side
    /// makes progress.
    fn pump_write(&mut self, reqs: &mut Requests) -> Result<(), (ErrorKind, String)> {
        loop {
            if let Some(engine) = self.engine.as_mut() {
                engine.fill(&mut self.write_buf, reqs);
            }
            let transport = self.transport.as_mut().expect("open without transport");
            let had_output = !self.write_buf.is_empty() || transport.wants_flush();
            let wrote = transport.write(&mut self.write_buf).map_err(|e| match e {
                TransportError::Io(e) => (ErrorKind::PeerClosed, e.to_string()),
                TransportError::Tls(e) => (ErrorKind::Tls, e.to_string()),
            })?;
            if wrote == 0 || !had_output {
                return Ok(());
            }
        }
    }

    fn peer_closed(&mut self, reqs: &mut Requests, events: &mut Vec<EngineEvent>) -> Drive {
        let engine = self.engine.as_mut().expect("open without engine");
        match engine.on_peer_close(reqs, events) {
            PeerClose::Clean => Drive::Close(ErrorKind::PeerClosed, "connection closed".into()),
            PeerClose::Reconnect => Drive::NeedsReconnect,
        }
    }

    /// Deadline the reactor must wake for: connect timeout while
    /// connecting, keep-alive reap when idle.
    pub fn next_timeout(&self) -> Option<Instant> {
        match self.state {
            ChannelState::Connecting => self.connect_deadline,
            ChannelState::Open if !self.has_outstanding() => {
                Some(self.last_activity + self.snapshot.keep_alive_timeout)
            }
            _ => None,
        }
    }

    pub fn on_timer(&mut self, now: Instant) -> ChannelTimer {
        match self.state {
            ChannelState::Connecting => match self.connect_deadline {
                Some(deadline) if now >= deadline => ChannelTimer::ConnectTimedOut,
                _ => ChannelTimer::Idle,
            },
            ChannelState::Open
                if !self.has_outstanding()
                    && now >= self.last_activity + self.snapshot.keep_alive_timeout =>
            {
                ChannelTimer::Reaped
            }
            _ => ChannelTimer::Idle,
        }
    }

    /// Remove one request. Returns true when the whole connection has to
    /// come down with it (an HTTP/1.1 request already on the wire).
    pub fn cancel(&mut self, id: RequestId) -> bool {
        self.pending.retain(|p| *p != id);
        match self.engine.as_mut() {
            Some(engine) => engine.cancel(id),
            None => false,
        }
    }

    /// Tear down and report every request this channel still owes.
    pub fn close(&mut self, reqs: &mut Requests) -> Vec<RequestId> {
        let mut ids = Vec::new();
        if let Some(mut engine) = self.engine.take() {
            ids.extend(engine.take_outstanding(reqs));
        }
        ids.extend(self.pending.drain(..));
        self.teardown();
        self.state = ChannelState::Closed;
        ids
    }

    /// Peer-initiated loss with answerable requests: back to Idle, ready
    /// for a fresh transport. Returns the requests to replay, in order.
    pub fn recycle(&mut self, reqs: &mut Requests) -> Vec<RequestId> {
        stats::CHANNEL_RECYCLED.increment();
        let mut ids = Vec::new();
        if let Some(mut engine) = self.engine.take() {
            self.pipelining_refused |= engine.pipelining_refused();
            ids.extend(engine.take_outstanding(reqs));
        }
        ids.extend(self.pending.drain(..));
        self.teardown();
        self.state = ChannelState::Idle;
        ids
    }

    fn teardown(&mut self) {
        self.transport = None;
        self.engine = None;
        self.read_buf.clear();
        self.write_buf.clear();
        self.connect_deadline = None;
        self.peer_cert = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Method, Request};
    use crate::session::RequestEntry;

    fn channel(scheme: Scheme) -> Channel {
        let origin = Origin {
            scheme,
            host: "example.test".to_string(),
            port: if scheme == Scheme::Https { 443 } else { 80 },
        };
        Channel::new(origin, Arc::new(Options::default())).unwrap()
    }

    fn add_request(reqs: &mut Requests) -> RequestId {
        let request = Request::new(Method::Get, "http://example.test/").unwrap();
        reqs.insert(RequestEntry::new(request, Arc::new(Options::default()), 0))
    }

    #[test]
    fn idle_channel_queues_sends() {
        let mut reqs = Requests::new();
        let mut ch = channel(Scheme::Http);
        let id = add_request(&mut reqs);
        ch.send(id);
        assert_eq!(ch.pending.len(), 1);
        assert!(ch.needs_resolve());
        assert!(!ch.wants_connect());
    }

    #[test]
    fn addrs_enable_connect() {
        let mut reqs = Requests::new();
        let mut ch = channel(Scheme::Http);
        ch.send(add_request(&mut reqs));
        ch.set_resolving();
        assert_eq!(ch.state, ChannelState::Resolving);
        ch.set_addrs(vec!["127.0.0.1".parse().unwrap()]);
        assert_eq!(ch.state, ChannelState::Idle);
        assert!(ch.wants_connect());

        ch.start_connect(Instant::now());
        assert_eq!(ch.state, ChannelState::Connecting);
        assert_eq!(ch.interest(), Interest::BOTH);
    }

    #[test]
    fn connect_timeout_fires() {
        let mut reqs = Requests::new();
        let mut ch = channel(Scheme::Http);
        ch.send(add_request(&mut reqs));
        ch.set_addrs(vec!["10.255.255.1".parse().unwrap()]);
        let start = Instant::now();
        ch.start_connect(start);
        let deadline = ch.next_timeout().unwrap();
        assert_eq!(ch.on_timer(start), ChannelTimer::Idle);
        assert_eq!(ch.on_timer(deadline), ChannelTimer::ConnectTimedOut);
    }

    #[test]
    fn close_returns_pending() {
        let mut reqs = Requests::new();
        let mut ch = channel(Scheme::Http);
        let a = add_request(&mut reqs);
        let b = add_request(&mut reqs);
        ch.send(a);
        ch.send(b);
        let ids = ch.close(&mut reqs);
        assert_eq!(ids, vec![a, b]);
        assert_eq!(ch.state, ChannelState::Closed);
        assert!(ch.pending.is_empty());
    }

    #[test]
    fn recycle_keeps_addrs_and_returns_idle() {
        let mut reqs = Requests::new();
        let mut ch = channel(Scheme::Http);
        let id = add_request(&mut reqs);
        ch.send(id);
        ch.set_addrs(vec!["127.0.0.1".parse().unwrap()]);
        let ids = ch.recycle(&mut reqs);
        assert_eq!(ids, vec![id]);
        assert_eq!(ch.state, ChannelState::Idle);
        // Re-sending makes it connectable again without another resolve.
        ch.send(id);
        assert!(ch.wants_connect());
    }
}
