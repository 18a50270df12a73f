//! Asynchronous name resolution behind one interface.
//!
//! Three variants share the cache and the event shape:
//! - [`native`]: an in-process UDP stub resolver, a full reactor participant;
//! - system: the OS resolver, called on a worker thread so the reactor
//!   never blocks;
//! - https: DNS-over-HTTPS through an internal session, also on the worker
//!   thread, against a statically-addressed endpoint.

pub mod cache;
mod doh;
mod native;
mod wire;

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use polling::Poller;

use crate::options::{ResolverKind, ResolverOptions};
use crate::stats;

pub use native::{Begin, NativeResolver};

/// DNS record types this client queries for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
    Cname,
}

impl RecordType {
    pub fn to_qtype(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
            RecordType::Cname => 5,
        }
    }
}

/// A finished resolution, fanned out to every channel that asked.
#[derive(Debug)]
pub struct ResolveEvent {
    pub host: String,
    pub waiters: Vec<usize>,
    pub result: Result<Vec<IpAddr>, String>,
}

/// Nameservers from resolv.conf, with public resolvers as the fallback.
pub fn default_nameservers() -> Vec<SocketAddr> {
    let mut out = Vec::new();
    if let Ok(text) = std::fs::read_to_string("/etc/resolv.conf") {
        for line in text.lines() {
            let line = line.trim();
            let Some(rest) = line.strip_prefix("nameserver") else {
                continue;
            };
            if let Ok(ip) = rest.trim().parse::<IpAddr>() {
                out.push(SocketAddr::new(ip, 53));
            }
        }
    }
    if out.is_empty() {
        out.push(SocketAddr::from(([1, 1, 1, 1], 53)));
        out.push(SocketAddr::from(([8, 8, 8, 8], 53)));
    }
    out
}

struct WorkerJob {
    host: String,
}

struct WorkerOutcome {
    host: String,
    result: Result<(Vec<IpAddr>, Duration), String>,
}

/// System and DoH resolution, executed off-reactor on a single worker
/// thread. Completion lands in a mailbox and wakes the reactor.
pub struct WorkerResolver {
    kind: ResolverKind,
    opts: ResolverOptions,
    jobs: Option<mpsc::Sender<WorkerJob>>,
    mailbox: Arc<Mutex<Vec<WorkerOutcome>>>,
    waker: Arc<Poller>,
    pending: Vec<(String, Vec<usize>)>,
    use_cache: bool,
}

impl WorkerResolver {
    pub fn new(opts: &ResolverOptions, waker: Arc<Poller>) -> Self {
        Self {
            kind: opts.kind,
            opts: opts.clone(),
            jobs: None,
            mailbox: Arc::new(Mutex::new(Vec::new())),
            waker,
            pending: Vec::new(),
            use_cache: opts.cache,
        }
    }

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
        if let Some((_, waiters)) = self.pending.iter_mut().find(|(h, _)| h == host) {
            waiters.push(waiter);
            return Begin::Pending;
        }
        let jobs = self.ensure_worker();
        if jobs
            .send(WorkerJob {
                host: host.to_string(),
            })
            .is_err()
        {
            return Begin::Failed("resolver worker gone".into());
        }
        stats::RESOLVE_QUERY.increment();
        self.pending.push((host.to_string(), vec![waiter]));
        Begin::Pending
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn take_events(&mut self) -> Vec<ResolveEvent> {
        let outcomes: Vec<WorkerOutcome> =
            std::mem::take(&mut *self.mailbox.lock().expect("resolver mailbox poisoned"));
        let mut events = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let idx = self.pending.iter().position(|(h, _)| *h == outcome.host);
            let waiters = match idx {
                Some(i) => self.pending.remove(i).1,
                None => Vec::new(),
            };
            let result = match outcome.result {
                Ok((addrs, ttl)) => {
                    if self.use_cache {
                        cache::put(&outcome.host, &addrs, ttl);
                    }
                    Ok(addrs)
                }
                Err(e) => Err(e),
            };
            events.push(ResolveEvent {
                host: outcome.host,
                waiters,
                result,
            });
        }
        events
    }

    fn ensure_worker(&mut self) -> mpsc::Sender<WorkerJob> {
        if let Some(jobs) = &self.jobs {
            return jobs.clone();
        }
        let (tx, rx) = mpsc::channel::<WorkerJob>();
        let mailbox = self.mailbox.clone();
        let waker = self.waker.clone();
        let kind = self.kind;
        let opts = self.opts.clone();
        std::thread::Builder::new()
            .name("skein-resolver".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let result = match kind {
                        ResolverKind::Https => doh::resolve(&opts, &job.host),
                        _ => system_lookup(&job.host),
                    };
                    mailbox
                        .lock()
                        .expect("resolver mailbox poisoned")
                        .push(WorkerOutcome {
                            host: job.host,
                            result,
                        });
                    let _ = waker.notify();
                }
            })
            .expect("spawn resolver worker");
        self.jobs = Some(tx.clone());
        tx
    }
}

fn system_lookup(host: &str) -> Result<(Vec<IpAddr>, Duration), String> {
    let addrs: Vec<IpAddr> = (host, 0u16)
        .to_socket_addrs()
        .map_err(|e| format!("{host}: {e}"))?
        .map(|sa| sa.ip())
        .collect();
    if addrs.is_empty() {
        return Err(format!("{host}: no addresses"));
    }
    // The OS gives no TTL; cache briefly.
    Ok((addrs, Duration::from_secs(60)))
}

/// The session's resolver: one of the three variants.
pub enum Resolver {
    Native(NativeResolver),
    Worker(WorkerResolver),
}

impl Resolver {
    pub fn new(opts: &ResolverOptions, waker: Arc<Poller>) -> Self {
        match opts.kind {
            ResolverKind::Native => Resolver::Native(NativeResolver::new(opts)),
            ResolverKind::System | ResolverKind::Https => {
                Resolver::Worker(WorkerResolver::new(opts, waker))
            }
        }
    }

    pub fn begin(&mut self, host: &str, waiter: usize) -> Begin {
        match self {
            Resolver::Native(r) => r.begin(host, waiter),
            Resolver::Worker(r) => r.begin(host, waiter),
        }
    }

    pub fn take_events(&mut self) -> Vec<ResolveEvent> {
        match self {
            Resolver::Native(r) => r.take_events(),
            Resolver::Worker(r) => r.take_events(),
        }
    }

    /// The native variant is a reactor participant; the worker variants
    /// wake the reactor through the poller instead.
    pub fn as_participant(&mut self) -> Option<&mut NativeResolver> {
        match self {
            Resolver::Native(r) => Some(r),
            Resolver::Worker(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_type_wire_values() {
        assert_eq!(RecordType::A.to_qtype(), 1);
        assert_eq!(RecordType::Aaaa.to_qtype(), 28);
        assert_eq!(RecordType::Cname.to_qtype(), 5);
    }

    #[test]
    fn default_nameservers_nonempty() {
        assert!(!default_nameservers().is_empty());
    }

    #[test]
    fn worker_resolver_ip_literal_short_circuits() {
        let poller = Arc::new(Poller::new().unwrap());
        let opts = ResolverOptions {
            kind: ResolverKind::System,
            ..Default::default()
        };
        let mut resolver = WorkerResolver::new(&opts, poller);
        match resolver.begin("::1", 9) {
            Begin::Ready(addrs) => assert_eq!(addrs, vec!["::1".parse::<IpAddr>().unwrap()]),
            _ => panic!("expected Ready"),
        }
    }

    #[test]
    fn worker_resolver_localhost() {
        let poller = Arc::new(Poller::new().unwrap());
        let opts = ResolverOptions {
            kind: ResolverKind::System,
            cache: false,
            ..Default::default()
        };
        let mut resolver = WorkerResolver::new(&opts, poller);
        assert!(matches!(resolver.begin("localhost", 3), Begin::Pending));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let events = resolver.take_events();
            if !events.is_empty() {
                assert_eq!(events[0].host, "localhost");
                assert_eq!(events[0].waiters, vec![3]);
                assert!(events[0].result.is_ok());
                break;
            }
            assert!(std::time::Instant::now() < deadline, "lookup never completed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
