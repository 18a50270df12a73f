//! The session facade: enqueue requests, drive the reactor, return
//! responses.
//!
//! A session owns the pool (which owns the channels), the resolver, the
//! reactor, and the request table. Requests are shared by index: the
//! session keeps the caller's handle, engines keep the id in their stream
//! or pipeline tables. One session is single-threaded by construction;
//! the only helper thread is the worker-resolver, which communicates
//! through a mailbox and the poller's notify handle.

use std::sync::Arc;
use std::time::Instant;

use slab::Slab;

use crate::cookies::CookieJar;
use crate::engine::EngineEvent;
use crate::error::{Error, ErrorKind, ErrorResponse};
use crate::options::Options;
use crate::pool::{ChannelId, Pool};
use crate::reactor::{Drive, Reactor, Readiness};
use crate::request::{Body, Method, Request, RequestState};
use crate::resolver::{Begin, ResolveEvent, Resolver};
use crate::response::Response;
use crate::stats;
use crate::uri::{Origin, Scheme};

/// Index of a request in the session's table. Engines hold these as
/// back-references; the table owns the entries.
pub type RequestId = usize;

pub type Requests = Slab<RequestEntry>;

/// Per-request result: a response, or a structured error.
pub type Outcome = Result<Response, ErrorResponse>;

/// Reactor token of the native resolver.
const RESOLVER_TOKEN: usize = usize::MAX;

/// One request's slot in the session table.
pub struct RequestEntry {
    pub request: Request,
    /// Immutable option snapshot taken when the request entered the
    /// session; later session reconfiguration cannot race it.
    pub snapshot: Arc<Options>,
    pub state: RequestState,
    /// Response under construction (headers in, body filling).
    pub response: Option<Response>,
    /// Final result; set exactly once.
    pub outcome: Option<Outcome>,
    pub deadline: Option<Instant>,
    pub retries_left: u32,
    pub retries_used: u32,
    /// The Expect plugin already re-sent once.
    pub expect_used: bool,
    /// Redirect hops taken so far.
    pub hops: u32,
    /// Drain position into the request body.
    pub body_cursor: usize,
    /// Channel currently responsible for this request.
    pub channel: Option<ChannelId>,
    /// Position in the caller's batch.
    pub batch_slot: usize,
}

impl RequestEntry {
    pub fn new(request: Request, snapshot: Arc<Options>, batch_slot: usize) -> Self {
        let deadline = snapshot.timeout.total.map(|d| Instant::now() + d);
        let retries_left = snapshot.max_retries;
        Self {
            request,
            snapshot,
            state: RequestState::Idle,
            response: None,
            outcome: None,
            deadline,
            retries_left,
            retries_used: 0,
            expect_used: false,
            hops: 0,
            body_cursor: 0,
            channel: None,
            batch_slot,
        }
    }
}

/// An observed ALTSVC advertisement (never acted on automatically).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltSvc {
    pub origin: String,
    pub value: String,
}

pub struct Session {
    options: Arc<Options>,
    reactor: Reactor,
    pool: Pool,
    resolver: Resolver,
    requests: Requests,
    jar: CookieJar,
    alt_svcs: Vec<AltSvc>,
}

impl Session {
    pub fn new(options: Options) -> Result<Self, Error> {
        let reactor = Reactor::new()?;
        let resolver = Resolver::new(&options.resolver, reactor.waker());
        let jar = CookieJar::with_cookies(options.cookies.clone());
        Ok(Self {
            options: Arc::new(options),
            reactor,
            pool: Pool::new(),
            resolver,
            requests: Requests::new(),
            jar,
            alt_svcs: Vec::new(),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// ALTSVC advertisements seen on HTTP/2 channels this session.
    pub fn alt_svcs(&self) -> &[AltSvc] {
        &self.alt_svcs
    }

    pub fn cookies(&self) -> &CookieJar {
        &self.jar
    }

    // -- Public request API --

    pub fn send(&mut self, request: Request) -> Outcome {
        self.send_all(vec![request]).pop().expect("one outcome per request")
    }

    /// Batch form: all requests progress concurrently; outcomes come back
    /// in request order.
    pub fn send_all(&mut self, requests: Vec<Request>) -> Vec<Outcome> {
        let ids: Vec<RequestId> = requests
            .into_iter()
            .enumerate()
            .map(|(slot, request)| self.submit(request, slot))
            .collect();
        self.run(&ids);
        ids.into_iter()
            .map(|id| {
                self.requests
                    .remove(id)
                    .outcome
                    .unwrap_or_else(|| Err(ErrorResponse::new(ErrorKind::Connect, "request lost")))
            })
            .collect()
    }

    pub fn request(&mut self, method: Method, uri: &str) -> Result<Response, Error> {
        let request = Request::new(method, uri)?;
        Ok(self.send(request)?)
    }

    pub fn get(&mut self, uri: &str) -> Result<Response, Error> {
        self.request(Method::Get, uri)
    }

    pub fn head(&mut self, uri: &str) -> Result<Response, Error> {
        self.request(Method::Head, uri)
    }

    pub fn post(&mut self, uri: &str, body: impl Into<Body>) -> Result<Response, Error> {
        let request = Request::new(Method::Post, uri)?.body(body);
        Ok(self.send(request)?)
    }

    pub fn put(&mut self, uri: &str, body: impl Into<Body>) -> Result<Response, Error> {
        let request = Request::new(Method::Put, uri)?.body(body);
        Ok(self.send(request)?)
    }

    pub fn delete(&mut self, uri: &str) -> Result<Response, Error> {
        self.request(Method::Delete, uri)
    }

    pub fn patch(&mut self, uri: &str, body: impl Into<Body>) -> Result<Response, Error> {
        let request = Request::new(Method::Patch, uri)?.body(body);
        Ok(self.send(request)?)
    }

    pub fn options_request(&mut self, uri: &str) -> Result<Response, Error> {
        self.request(Method::Options, uri)
    }

    pub fn trace(&mut self, uri: &str) -> Result<Response, Error> {
        self.request(Method::Trace, uri)
    }

    // -- Submission --

    fn submit(&mut self, mut request: Request, batch_slot: usize) -> RequestId {
        let snapshot = Arc::new(request.overrides.apply(&self.options));

        // Session-level headers underlay the request's own.
        let mut headers = snapshot.headers.clone();
        headers.merge(&request.headers);
        request.headers = headers;

        // pre-send hook: cookies.
        if let Some(cookie) = self.jar.header_for(&request.uri) {
            request.headers.set_default("cookie", cookie);
        }

        let id = self.requests.insert(RequestEntry::new(request, snapshot, batch_slot));
        self.route(id);
        id
    }

    /// Attach a request to the channel for its origin (or the proxy's).
    fn route(&mut self, id: RequestId) {
        let (origin, snapshot) = {
            let entry = &self.requests[id];
            (self.target_origin(entry), entry.snapshot.clone())
        };
        let now = Instant::now();
        match self.pool.checkout(&origin, &snapshot, &mut self.requests, now) {
            Ok(chan) => {
                self.requests[id].channel = Some(chan);
                self.pool
                    .get_mut(chan)
                    .expect("channel just checked out")
                    .send(id);
            }
            Err(e) => {
                self.requests[id].outcome =
                    Some(Err(ErrorResponse::new(ErrorKind::Connect, e.to_string())));
            }
        }
    }

    /// Where the bytes go: the origin itself, or a plain-HTTP forward
    /// proxy when one is configured.
    fn target_origin(&self, entry: &RequestEntry) -> Origin {
        if entry.request.uri.scheme == Scheme::Http {
            if let Some(proxy) = &entry.snapshot.proxy {
                return proxy.origin();
            }
        }
        entry.request.uri.origin()
    }

    // -- The drive loop --

    fn run(&mut self, ids: &[RequestId]) {
        loop {
            let done = ids
                .iter()
                .all(|id| self.requests.get(*id).map_or(true, |e| e.outcome.is_some()));
            if done {
                return;
            }
            if let Err(e) = self.tick() {
                let message = format!("reactor failure: {e}");
                for &id in ids {
                    if let Some(entry) = self.requests.get_mut(id) {
                        if entry.outcome.is_none() {
                            entry.outcome =
                                Some(Err(ErrorResponse::new(ErrorKind::Connect, message.clone())));
                        }
                    }
                }
                return;
            }
        }
    }

    fn tick(&mut self) -> Result<(), Error> {
        let mut engine_events: Vec<EngineEvent> = Vec::new();

        // 1. Start resolution and connects; push pending writes.
        self.start_resolves(&mut engine_events);
        self.start_connects(&mut engine_events);

        // 2. Re-arm every participant's interest.
        for chan in self.pool.ids() {
            let Some(channel) = self.pool.get_mut(chan) else {
                continue;
            };
            match channel.fd() {
                Some(fd) => self.reactor.arm(chan, fd, channel.interest())?,
                None => self.reactor.disarm(chan),
            }
        }
        if let Some(native) = self.resolver.as_participant() {
            if let Some(fd) = native.fd()? {
                let interest = native.interest();
                self.reactor.arm(RESOLVER_TOKEN, fd, interest)?;
            }
        }

        // 3. Sleep until readiness or the earliest deadline.
        let timeout = self.earliest_deadline().map(|deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        let mut ready = Vec::new();
        self.reactor.wait(&mut ready, timeout)?;

        // 4. Dispatch readiness.
        for Readiness {
            key,
            readable,
            writable,
        } in ready
        {
            if key == RESOLVER_TOKEN {
                if let Some(native) = self.resolver.as_participant() {
                    native.on_ready(readable, writable);
                }
                continue;
            }
            let Some(channel) = self.pool.get_mut(key) else {
                continue;
            };
            let drive = channel.on_ready(readable, writable, &mut self.requests, &mut engine_events);
            self.apply_drive(key, drive);
        }

        // 5. Resolver completions (native events and worker mailbox).
        let resolved = self.resolver.take_events();
        for event in resolved {
            self.finish_resolve(event, &mut engine_events);
        }

        // 6. Timers: resolver retransmits, connect deadlines, keep-alive
        //    reaping, request deadlines.
        let now = Instant::now();
        if let Some(native) = self.resolver.as_participant() {
            native.on_timer(now);
            let resolved = native.take_events();
            for event in resolved {
                self.finish_resolve(event, &mut engine_events);
            }
        }
        self.channel_timers(now);
        self.request_deadlines(now);

        // 7. Engine events: completions, failures, observations.
        self.process_engine_events(engine_events);

        Ok(())
    }

    fn start_resolves(&mut self, engine_events: &mut Vec<EngineEvent>) {
        for chan in self.pool.ids() {
            let needs = self
                .pool
                .get(chan)
                .is_some_and(|c| c.needs_resolve());
            if !needs {
                continue;
            }
            let host = self.pool.get(chan).expect("checked above").origin.host.clone();
            match self.resolver.begin(&host, chan) {
                Begin::Ready(addrs) => self.finish_resolve(
                    ResolveEvent {
                        host,
                        waiters: vec![chan],
                        result: Ok(addrs),
                    },
                    engine_events,
                ),
                Begin::Pending => {
                    if let Some(channel) = self.pool.get_mut(chan) {
                        channel.set_resolving();
                    }
                }
                Begin::Failed(msg) => self.finish_resolve(
                    ResolveEvent {
                        host,
                        waiters: vec![chan],
                        result: Err(msg),
                    },
                    engine_events,
                ),
            }
        }
    }

    fn start_connects(&mut self, engine_events: &mut Vec<EngineEvent>) {
        let now = Instant::now();
        for chan in self.pool.ids() {
            let Some(channel) = self.pool.get_mut(chan) else {
                continue;
            };
            if channel.wants_connect() {
                channel.start_connect(now);
            }
            let drive = channel.drive(&mut self.requests, engine_events);
            self.apply_drive(chan, drive);
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut fold = |candidate: Option<Instant>| {
            if let Some(c) = candidate {
                earliest = Some(match earliest {
                    Some(e) => e.min(c),
                    None => c,
                });
            }
        };
        for chan in self.pool.ids() {
            if let Some(channel) = self.pool.get(chan) {
                fold(channel.next_timeout());
            }
        }
        for (_, entry) in self.requests.iter() {
            if entry.outcome.is_none() {
                fold(entry.deadline);
            }
        }
        if let Resolver::Native(native) = &self.resolver {
            fold(native.next_timeout());
        }
        earliest
    }

    // -- Event application --

    fn apply_drive(&mut self, chan: ChannelId, drive: Drive) {
        match drive {
            Drive::Continue => {}
            Drive::Close(kind, message) => {
                let ids = match self.pool.get_mut(chan) {
                    Some(channel) => channel.close(&mut self.requests),
                    None => Vec::new(),
                };
                self.reactor.disarm(chan);
                self.pool.remove(chan);
                for id in ids {
                    self.retry_or_fail(id, kind, message.clone());
                }
            }
            Drive::NeedsReconnect => {
                let ids = match self.pool.get_mut(chan) {
                    Some(channel) => channel.recycle(&mut self.requests),
                    None => Vec::new(),
                };
                self.reactor.disarm(chan);
                for id in ids {
                    self.retry_or_fail(id, ErrorKind::PeerClosed, "peer closed mid-exchange".into());
                }
            }
        }
    }

    /// Retriable failures go back through the pool while retries remain;
    /// everything else becomes the request's outcome.
    fn retry_or_fail(&mut self, id: RequestId, kind: ErrorKind, message: String) {
        let Some(entry) = self.requests.get_mut(id) else {
            return;
        };
        if entry.outcome.is_some() {
            return;
        }
        if kind.is_retriable() && entry.retries_left > 0 {
            entry.retries_left -= 1;
            entry.retries_used += 1;
            entry.state = RequestState::Idle;
            entry.response = None;
            entry.body_cursor = 0;
            stats::REQUEST_RETRIED.increment();
            self.route(id);
        } else {
            let retries = entry.retries_used;
            entry.outcome =
                Some(Err(ErrorResponse::new(kind, message).with_retries(retries)));
        }
    }

    fn finish_resolve(&mut self, event: ResolveEvent, _engine_events: &mut Vec<EngineEvent>) {
        match event.result {
            Ok(addrs) => {
                for chan in event.waiters {
                    let Some(channel) = self.pool.get(chan) else {
                        continue;
                    };
                    let origin = channel.origin.clone();

                    // Cross-host HTTP/2 coalescing: reuse an open channel
                    // to the same address when its certificate covers the
                    // new hostname.
                    if origin.scheme == Scheme::Https {
                        if let Some(target) = self.pool.coalesce_target(&origin, &addrs) {
                            if target != chan {
                                let pending: Vec<RequestId> = self
                                    .pool
                                    .get_mut(chan)
                                    .map(|c| c.pending.drain(..).collect())
                                    .unwrap_or_default();
                                self.reactor.disarm(chan);
                                self.pool.remove(chan);
                                self.pool.alias(origin, target);
                                for id in pending {
                                    if let Some(entry) = self.requests.get_mut(id) {
                                        entry.channel = Some(target);
                                    }
                                    if let Some(channel) = self.pool.get_mut(target) {
                                        channel.send(id);
                                    }
                                }
                                continue;
                            }
                        }
                    }

                    if let Some(channel) = self.pool.get_mut(chan) {
                        channel.set_addrs(addrs.clone());
                    }
                }
            }
            Err(message) => {
                for chan in event.waiters {
                    let ids = match self.pool.get_mut(chan) {
                        Some(channel) => channel.close(&mut self.requests),
                        None => Vec::new(),
                    };
                    self.reactor.disarm(chan);
                    self.pool.remove(chan);
                    for id in ids {
                        self.retry_or_fail(id, ErrorKind::Resolve, message.clone());
                    }
                }
            }
        }
    }

    fn channel_timers(&mut self, now: Instant) {
        for chan in self.pool.ids() {
            let Some(channel) = self.pool.get_mut(chan) else {
                continue;
            };
            match channel.on_timer(now) {
                crate::channel::ChannelTimer::Idle => {}
                crate::channel::ChannelTimer::ConnectTimedOut => {
                    let ids = channel.close(&mut self.requests);
                    self.reactor.disarm(chan);
                    self.pool.remove(chan);
                    for id in ids {
                        self.retry_or_fail(id, ErrorKind::Timeout, "connect timed out".into());
                    }
                }
                crate::channel::ChannelTimer::Reaped => {
                    let _ = channel.close(&mut self.requests);
                    self.reactor.disarm(chan);
                    self.pool.remove(chan);
                }
            }
        }
    }

    fn request_deadlines(&mut self, now: Instant) {
        let expired: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, e)| {
                e.outcome.is_none() && e.deadline.is_some_and(|d| now >= d)
            })
            .map(|(id, _)| id)
            .collect();
        for id in expired {
            self.expire(id);
        }
    }

    /// Cancellation: drop from pending, RST the stream (HTTP/2), or tear
    /// the connection down (HTTP/1.1 mid-wire), then surface the timeout.
    fn expire(&mut self, id: RequestId) {
        let chan = self.requests.get(id).and_then(|e| e.channel);
        if let Some(chan) = chan {
            let needs_recycle = match self.pool.get_mut(chan) {
                Some(channel) => channel.cancel(id),
                None => false,
            };
            if needs_recycle {
                let victims: Vec<RequestId> = match self.pool.get_mut(chan) {
                    Some(channel) => channel
                        .recycle(&mut self.requests)
                        .into_iter()
                        .filter(|v| *v != id)
                        .collect(),
                    None => Vec::new(),
                };
                self.reactor.disarm(chan);
                // Innocent bystanders replay without burning a retry.
                for victim in victims {
                    if let Some(entry) = self.requests.get_mut(victim) {
                        entry.state = RequestState::Idle;
                        entry.response = None;
                        entry.body_cursor = 0;
                    }
                    if let Some(channel) = self.pool.get_mut(chan) {
                        channel.send(victim);
                    }
                }
            }
        }
        if let Some(entry) = self.requests.get_mut(id) {
            let retries = entry.retries_used;
            entry.outcome = Some(Err(ErrorResponse::new(
                ErrorKind::Timeout,
                "deadline exceeded",
            )
            .with_retries(retries)));
        }
    }

    fn process_engine_events(&mut self, events: Vec<EngineEvent>) {
        for event in events {
            match event {
                EngineEvent::Completed(id) => self.on_response(id),
                EngineEvent::Failed(id, kind, message) => self.retry_or_fail(id, kind, message),
                EngineEvent::AltSvc { origin, value } => {
                    let record = AltSvc { origin, value };
                    if !self.alt_svcs.contains(&record) {
                        self.alt_svcs.push(record);
                    }
                }
            }
        }
    }

    /// on-response hooks, in order: cookie capture, the Expect retry, the
    /// redirect follower. Whatever survives becomes the outcome.
    fn on_response(&mut self, id: RequestId) {
        let Some(entry) = self.requests.get_mut(id) else {
            return;
        };
        let Some(response) = entry.response.take() else {
            return;
        };
        if entry.outcome.is_some() {
            return;
        }

        let uri = entry.request.uri.clone();
        for set_cookie in response.headers().get_all("set-cookie") {
            self.jar.store(&uri, set_cookie);
        }
        let entry = self.requests.get_mut(id).expect("entry still present");

        // Expect plugin: one transparent retry without the header.
        if response.status() == 417
            && entry.request.headers.contains("expect")
            && !entry.expect_used
        {
            entry.expect_used = true;
            entry.request.headers.remove("expect");
            entry.state = RequestState::Idle;
            entry.body_cursor = 0;
            self.route(id);
            return;
        }

        // Redirect plugin (the `follow` option).
        if let Some(max_hops) = entry.snapshot.follow {
            if matches!(response.status(), 301 | 302 | 303 | 307 | 308)
                && entry.hops < max_hops
            {
                if let Some(location) = response.header("location") {
                    if let Ok(next) = entry.request.uri.join(location) {
                        entry.hops += 1;
                        // 303 (and legacy 301/302 on POST) demote to GET.
                        let demote = response.status() == 303
                            || (matches!(response.status(), 301 | 302)
                                && entry.request.method == Method::Post);
                        if demote {
                            entry.request.method = Method::Get;
                            entry.request.body = Body::Empty;
                            entry.request.headers.remove("content-type");
                            entry.request.headers.remove("content-length");
                        }
                        entry.request.uri = next;
                        entry.state = RequestState::Idle;
                        entry.body_cursor = 0;
                        entry.response = None;
                        self.route(id);
                        return;
                    }
                }
            }
        }

        entry.outcome = Some(Ok(response));
    }
}
