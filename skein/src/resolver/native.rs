//! The in-process UDP resolver, driven by the reactor.
//!
//! One UDP socket, connected to the current nameserver. Queries carry a
//! per-attempt timeout list: when the head expires the query is sent again,
//! and when the list runs dry the lookup fails. An unreachable nameserver
//! rotates to the next one in the list; running off the end fails every
//! query in flight.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::options::ResolverOptions;
use crate::reactor::Interest;
use crate::stats;

use super::wire::{self, RData};
use super::{cache, RecordType, ResolveEvent};

const MAX_CNAME_HOPS: u32 = 8;

struct Query {
    /// Hostname as requested: the cache key and event key.
    host: String,
    /// Name currently being asked about (changes while chasing CNAMEs).
    qname: String,
    rtypes: VecDeque<RecordType>,
    timeouts: VecDeque<Duration>,
    /// None = a (re)send is due.
    sent_at: Option<Instant>,
    attempts: u32,
    txid: u16,
    waiters: Vec<usize>,
    cname_hops: u32,
}

pub struct NativeResolver {
    nameservers: Vec<SocketAddr>,
    ns_idx: usize,
    socket: Option<UdpSocket>,
    queries: Vec<Query>,
    packet_size: usize,
    timeouts: Vec<Duration>,
    record_types: Vec<RecordType>,
    use_cache: bool,
    txid_seq: u16,
    events: Vec<ResolveEvent>,
}

/// Immediate outcome of asking for a hostname.
pub enum Begin {
    Ready(Vec<IpAddr>),
    Pending,
    Failed(String),
}

impl NativeResolver {
    pub fn new(opts: &ResolverOptions) -> Self {
        let nameservers = if opts.nameservers.is_empty() {
            super::default_nameservers()
        } else {
            opts.nameservers.clone()
        };
        Self {
            nameservers,
            ns_idx: 0,
            socket: None,
            queries: Vec::new(),
            packet_size: opts.packet_size,
            timeouts: opts.timeouts.clone(),
            record_types: opts.record_types.clone(),
            use_cache: opts.cache,
            txid_seq: seed_txid(),
            events: Vec::new(),
        }
    }

    /// Start (or join) resolution of `host` on behalf of channel `waiter`.
    pub fn begin(&mut self, host: &str, waiter: usize) -> Begin {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Begin::Ready(vec![ip]);
        }
        if self.use_cache {
            if let Some(addrs) = cache::get(host) {
                stats::RESOLVE_CACHE_HIT.increment();
                return Begin::Ready(addrs);
            }
        }
        if self.nameservers.is_empty() {
            return Begin::Failed("no nameserver configured".into());
        }
        if let Some(query) = self.queries.iter_mut().find(|q| q.host == host) {
            query.waiters.push(waiter);
            return Begin::Pending;
        }

        self.txid_seq = self.txid_seq.wrapping_add(1);
        self.queries.push(Query {
            host: host.to_string(),
            qname: host.to_string(),
            rtypes: self.record_types.iter().copied().collect(),
            timeouts: self.timeouts.iter().copied().collect(),
            sent_at: None,
            attempts: 0,
            txid: self.txid_seq,
            waiters: vec![waiter],
            cname_hops: 0,
        });
        Begin::Pending
    }

    pub fn is_idle(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn fd(&mut self) -> io::Result<Option<RawFd>> {
        if self.queries.is_empty() {
            return Ok(None);
        }
        if self.socket.is_none() {
            self.open_socket()?;
        }
        Ok(self.socket.as_ref().map(|s| s.as_raw_fd()))
    }

    /// Same rule a channel uses: write interest while sends are due, read
    /// interest while answers are awaited.
    pub fn interest(&self) -> Interest {
        let wants_send = self.queries.iter().any(|q| q.sent_at.is_none());
        let wants_recv = self.queries.iter().any(|q| q.sent_at.is_some());
        Interest {
            readable: wants_recv,
            writable: wants_send,
        }
    }

    pub fn on_ready(&mut self, readable: bool, writable: bool) {
        if writable {
            self.flush_sends();
        }
        if readable {
            self.drain_answers();
        }
    }

    /// Earliest retransmit deadline across in-flight queries.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.queries
            .iter()
            .filter_map(|q| {
                let sent = q.sent_at?;
                q.timeouts.front().map(|t| sent + *t)
            })
            .min()
    }

    /// Pop expired attempt timeouts: retry while any remain, fail when the
    /// list is exhausted.
    pub fn on_timer(&mut self, now: Instant) {
        let mut failed = Vec::new();
        for (idx, query) in self.queries.iter_mut().enumerate() {
            let Some(sent) = query.sent_at else { continue };
            let Some(timeout) = query.timeouts.front().copied() else {
                continue;
            };
            if now.duration_since(sent) >= timeout {
                query.timeouts.pop_front();
                if query.timeouts.is_empty() {
                    failed.push(idx);
                } else {
                    query.sent_at = None; // resend on next writable tick
                }
            }
        }
        for idx in failed.into_iter().rev() {
            let query = self.queries.remove(idx);
            self.events.push(ResolveEvent {
                host: query.host.clone(),
                waiters: query.waiters,
                result: Err(format!(
                    "no answer for {} after {} attempts",
                    query.host, query.attempts
                )),
            });
        }
        // Sends that just became due should go out without waiting for the
        // next writable event; UDP sends rarely block anyway.
        self.flush_sends();
    }

    pub fn take_events(&mut self) -> Vec<ResolveEvent> {
        std::mem::take(&mut self.events)
    }

    fn open_socket(&mut self) -> io::Result<()> {
        let ns = self.nameservers[self.ns_idx];
        let bind: SocketAddr = if ns.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        socket.connect(ns)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn flush_sends(&mut self) {
        if self.socket.is_none() && self.open_socket().is_err() {
            self.fail_all("cannot open resolver socket");
            return;
        }
        let mut unreachable = false;
        let mut unencodable = Vec::new();
        {
            let socket = self.socket.as_ref().expect("socket just opened");
            for (idx, query) in self.queries.iter_mut().enumerate() {
                if query.sent_at.is_some() {
                    continue;
                }
                let Some(rtype) = query.rtypes.front().copied() else {
                    continue;
                };
                let mut packet = Vec::with_capacity(64);
                if wire::encode_query(query.txid, &query.qname, rtype, &mut packet).is_err() {
                    unencodable.push(idx);
                    continue;
                }
                match socket.send(&packet) {
                    Ok(_) => {
                        stats::RESOLVE_QUERY.increment();
                        query.attempts += 1;
                        query.sent_at = Some(Instant::now());
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => {
                        unreachable = true;
                        break;
                    }
                }
            }
        }
        for idx in unencodable.into_iter().rev() {
            let query = self.queries.remove(idx);
            self.events.push(ResolveEvent {
                host: query.host.clone(),
                waiters: query.waiters,
                result: Err(format!("{}: not a resolvable name", query.host)),
            });
        }
        if unreachable {
            self.rotate_nameserver();
        }
    }

    fn drain_answers(&mut self) {
        let mut buf = vec![0u8; self.packet_size.max(512)];
        loop {
            let Some(socket) = self.socket.as_ref() else { return };
            match socket.recv(&mut buf) {
                Ok(n) => {
                    if let Ok(msg) = wire::decode_message(&buf[..n]) {
                        self.handle_message(msg);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if is_unreachable(&e) => {
                    self.rotate_nameserver();
                    return;
                }
                Err(_) => return,
            }
        }
    }

    fn handle_message(&mut self, msg: wire::Message) {
        let Some(idx) = self.queries.iter().position(|q| q.txid == msg.id) else {
            return;
        };

        if msg.rcode == wire::RCODE_NXDOMAIN {
            let query = self.queries.remove(idx);
            self.events.push(ResolveEvent {
                host: query.host.clone(),
                waiters: query.waiters,
                result: Err(format!("{}: no such host", query.host)),
            });
            return;
        }

        let mut addrs: Vec<IpAddr> = Vec::new();
        let mut min_ttl = u32::MAX;
        let mut cname: Option<String> = None;
        for answer in &msg.answers {
            match &answer.data {
                RData::A(ip) => {
                    addrs.push(IpAddr::V4(*ip));
                    min_ttl = min_ttl.min(answer.ttl);
                }
                RData::Aaaa(ip) => {
                    addrs.push(IpAddr::V6(*ip));
                    min_ttl = min_ttl.min(answer.ttl);
                }
                RData::Cname(target) => cname = Some(target.clone()),
                RData::Other(_) => {}
            }
        }

        if !addrs.is_empty() {
            let query = self.queries.remove(idx);
            if self.use_cache {
                let ttl = if min_ttl == u32::MAX { 60 } else { min_ttl };
                cache::put(&query.host, &addrs, Duration::from_secs(u64::from(ttl)));
            }
            self.events.push(ResolveEvent {
                host: query.host.clone(),
                waiters: query.waiters,
                result: Ok(addrs),
            });
            return;
        }

        if let Some(target) = cname {
            // Alias with no address records in the same answer: chase it,
            // consulting the cache first.
            let query = &mut self.queries[idx];
            if query.cname_hops >= MAX_CNAME_HOPS {
                let query = self.queries.remove(idx);
                self.events.push(ResolveEvent {
                    host: query.host.clone(),
                    waiters: query.waiters,
                    result: Err(format!("{}: CNAME chain too long", query.host)),
                });
                return;
            }
            if self.use_cache {
                if let Some(addrs) = cache::get(&target) {
                    let query = self.queries.remove(idx);
                    cache::put(&query.host, &addrs, Duration::from_secs(60));
                    self.events.push(ResolveEvent {
                        host: query.host.clone(),
                        waiters: query.waiters,
                        result: Ok(addrs),
                    });
                    return;
                }
            }
            let query = &mut self.queries[idx];
            query.qname = target;
            query.cname_hops += 1;
            query.sent_at = None;
            self.txid_seq = self.txid_seq.wrapping_add(1);
            query.txid = self.txid_seq;
            self.flush_sends();
            return;
        }

        // Empty answer for the current record type: fall through to the
        // next type, or fail when none remain.
        let query = &mut self.queries[idx];
        query.rtypes.pop_front();
        if query.rtypes.is_empty() {
            let query = self.queries.remove(idx);
            self.events.push(ResolveEvent {
                host: query.host.clone(),
                waiters: query.waiters,
                result: Err(format!("{}: no address records", query.host)),
            });
        } else {
            query.timeouts = self.timeouts.iter().copied().collect();
            query.sent_at = None;
            self.txid_seq = self.txid_seq.wrapping_add(1);
            query.txid = self.txid_seq;
            self.flush_sends();
        }
    }

    fn rotate_nameserver(&mut self) {
        self.ns_idx += 1;
        self.socket = None;
        if self.ns_idx >= self.nameservers.len() {
            self.fail_all("nameserver unreachable");
            return;
        }
        for query in &mut self.queries {
            query.sent_at = None;
        }
        self.flush_sends();
    }

    fn fail_all(&mut self, reason: &str) {
        for query in self.queries.drain(..) {
            self.events.push(ResolveEvent {
                host: query.host.clone(),
                waiters: query.waiters,
                result: Err(reason.to_string()),
            });
        }
    }
}

fn is_unreachable(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) | Some(libc::ECONNREFUSED)
    )
}

fn seed_txid() -> u16 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos & 0xffff) as u16 ^ (nanos >> 16) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn opts_with(nameservers: Vec<SocketAddr>, timeouts: Vec<Duration>) -> ResolverOptions {
        ResolverOptions {
            nameservers,
            timeouts,
            cache: false,
            ..Default::default()
        }
    }

    /// A loopback nameserver answering every query with one A record.
    fn spawn_fake_ns(answer: [u8; 4]) -> (SocketAddr, mpsc::Receiver<u16>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = socket.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = socket.recv_from(&mut buf) {
                let id = u16::from_be_bytes([buf[0], buf[1]]);
                let _ = tx.send(id);
                // Response: header + echoed question + one A answer.
                let mut resp = Vec::new();
                resp.extend_from_slice(&id.to_be_bytes());
                resp.extend_from_slice(&0x8180u16.to_be_bytes());
                resp.extend_from_slice(&1u16.to_be_bytes());
                resp.extend_from_slice(&1u16.to_be_bytes());
                resp.extend_from_slice(&[0; 4]);
                resp.extend_from_slice(&buf[12..n]); // question section
                resp.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 1, 44, 0, 4]);
                resp.extend_from_slice(&answer);
                let _ = socket.send_to(&resp, peer);
            }
        });
        (addr, rx)
    }

    fn drive_until_event(resolver: &mut NativeResolver, budget: Duration) -> Vec<ResolveEvent> {
        let deadline = Instant::now() + budget;
        loop {
            resolver.on_ready(true, true);
            resolver.on_timer(Instant::now());
            let events = resolver.take_events();
            if !events.is_empty() || Instant::now() >= deadline {
                return events;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn ip_literals_short_circuit() {
        let mut resolver = NativeResolver::new(&opts_with(vec![], vec![Duration::from_secs(1)]));
        match resolver.begin("127.0.0.1", 1) {
            Begin::Ready(addrs) => assert_eq!(addrs, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]),
            _ => panic!("expected Ready"),
        }
    }

    #[test]
    fn no_nameservers_fails_immediately() {
        let mut resolver = NativeResolver::new(&opts_with(vec![], vec![Duration::from_secs(1)]));
        assert!(matches!(resolver.begin("host.test", 1), Begin::Failed(_)));
    }

    #[test]
    fn resolves_against_fake_nameserver() {
        let (ns, _queries) = spawn_fake_ns([93, 184, 216, 34]);
        let mut resolver =
            NativeResolver::new(&opts_with(vec![ns], vec![Duration::from_secs(2)]));
        assert!(matches!(resolver.begin("fake-a.test", 42), Begin::Pending));

        let events = drive_until_event(&mut resolver, Duration::from_secs(3));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].host, "fake-a.test");
        assert_eq!(events[0].waiters, vec![42]);
        let addrs = events[0].result.as_ref().unwrap();
        assert_eq!(addrs[0], "93.184.216.34".parse::<IpAddr>().unwrap());
        assert!(resolver.is_idle());
    }

    #[test]
    fn blackholed_nameserver_retries_then_fails() {
        // A bound-but-silent socket: queries go nowhere.
        let blackhole = UdpSocket::bind("127.0.0.1:0").unwrap();
        let ns = blackhole.local_addr().unwrap();
        let timeouts = vec![Duration::from_millis(100), Duration::from_millis(100)];
        let mut resolver = NativeResolver::new(&opts_with(vec![ns], timeouts));
        assert!(matches!(resolver.begin("dark.test", 7), Begin::Pending));

        let start = Instant::now();
        let events = drive_until_event(&mut resolver, Duration::from_secs(3));
        let elapsed = start.elapsed();

        assert_eq!(events.len(), 1);
        let err = events[0].result.as_ref().unwrap_err();
        assert!(err.contains("2 attempts"), "unexpected error: {err}");
        assert!(elapsed >= Duration::from_millis(200), "failed too early: {elapsed:?}");
    }

    #[test]
    fn waiters_coalesce_on_one_query() {
        let (ns, queries) = spawn_fake_ns([10, 0, 0, 1]);
        let mut resolver =
            NativeResolver::new(&opts_with(vec![ns], vec![Duration::from_secs(2)]));
        assert!(matches!(resolver.begin("shared.test", 1), Begin::Pending));
        assert!(matches!(resolver.begin("shared.test", 2), Begin::Pending));

        let events = drive_until_event(&mut resolver, Duration::from_secs(3));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].waiters, vec![1, 2]);
        // Exactly one query hit the wire.
        let first = queries.recv_timeout(Duration::from_secs(1));
        assert!(first.is_ok());
        assert!(queries.try_recv().is_err());
    }

    #[test]
    fn interest_follows_query_state() {
        let (ns, _q) = spawn_fake_ns([1, 1, 1, 1]);
        let mut resolver =
            NativeResolver::new(&opts_with(vec![ns], vec![Duration::from_secs(2)]));
        assert_eq!(resolver.interest(), Interest::NONE);
        let _ = resolver.begin("interest.test", 1);
        assert!(resolver.interest().writable);
        resolver.on_ready(false, true); // send goes out
        assert!(resolver.interest().readable);
        assert!(!resolver.interest().writable);
    }
}
