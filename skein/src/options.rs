//! Session and request configuration.
//!
//! [`Options`] is immutable once built. A request can carry
//! [`RequestOverrides`]; the session merges them into a per-request
//! snapshot before the request enters the reactor, so nothing rewrites
//! shared configuration mid-flight.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cookies::Cookie;
use crate::error::Error;
use crate::headers::HeaderMap;
use crate::resolver::RecordType;
use crate::uri::Uri;

pub const DEFAULT_USER_AGENT: &str = concat!("skein/", env!("CARGO_PKG_VERSION"));

/// Per-request deadline policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutOptions {
    /// Budget for resolve + connect + handshake.
    pub connect: Option<Duration>,
    /// Budget for the whole exchange, headers to end-of-body.
    pub total: Option<Duration>,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            total: None,
        }
    }
}

/// TLS context parameters.
#[derive(Debug, Clone, Default)]
pub struct SslOptions {
    /// Disable server certificate verification. Off means off; intended
    /// for test rigs with self-signed certificates.
    pub danger_accept_invalid_certs: bool,
    /// Extra trust anchors, PEM file.
    pub ca_file: Option<PathBuf>,
    /// Client certificate chain + key, PEM files.
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Which resolver implementation a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
    /// In-process UDP DNS client, driven by the reactor.
    Native,
    /// OS resolver on a worker thread.
    System,
    /// DNS-over-HTTPS through an internal session, on a worker thread.
    Https,
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub kind: ResolverKind,
    /// Nameservers for the native resolver. Empty = read resolv.conf.
    pub nameservers: Vec<SocketAddr>,
    /// UDP receive size for DNS answers.
    pub packet_size: usize,
    /// Per-attempt timeouts; one query retransmit per entry after the first.
    pub timeouts: Vec<Duration>,
    /// Record types tried in order until one yields addresses.
    pub record_types: Vec<RecordType>,
    /// DoH endpoint; its host must be an IP literal.
    pub doh_endpoint: Option<String>,
    /// Consult and fill the process-wide cache.
    pub cache: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            kind: ResolverKind::Native,
            nameservers: Vec::new(),
            packet_size: 512,
            timeouts: vec![Duration::from_secs(5)],
            record_types: vec![RecordType::A, RecordType::Aaaa],
            doh_endpoint: None,
            cache: true,
        }
    }
}

/// Immutable session configuration. Build with [`Options::builder`].
#[derive(Debug, Clone)]
pub struct Options {
    pub headers: HeaderMap,
    pub user_agent: String,
    /// Redirect-follow hook: `Some(max_hops)` enables the redirect plugin.
    pub follow: Option<u32>,
    pub ssl: SslOptions,
    /// Plain HTTP forward proxy, applied to `http` URIs.
    pub proxy: Option<Uri>,
    /// How long a pooled channel may sit idle before the pool reaps it.
    pub keep_alive_timeout: Duration,
    pub timeout: TimeoutOptions,
    pub cookies: Vec<Cookie>,
    pub resolver: ResolverOptions,
    /// Local ceiling on concurrent HTTP/2 requests per channel.
    pub max_concurrent_requests: u32,
    pub http2_settings: skein_h2::Settings,
    /// Connection-level retries for retriable failures.
    pub max_retries: u32,
    /// Response bodies beyond this spill to a temp file.
    pub body_threshold_size: usize,
    /// Allow HTTP/1.1 pipelining on keep-alive channels.
    pub pipelining: bool,
}

impl Options {
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }
}

impl Default for Options {
    fn default() -> Self {
        OptionsBuilder::default().build().expect("defaults are valid")
    }
}

#[derive(Debug, Default)]
pub struct OptionsBuilder {
    headers: HeaderMap,
    user_agent: Option<String>,
    follow: Option<u32>,
    ssl: SslOptions,
    proxy: Option<String>,
    keep_alive_timeout: Option<Duration>,
    timeout: Option<TimeoutOptions>,
    cookies: Vec<Cookie>,
    resolver: Option<ResolverOptions>,
    max_concurrent_requests: Option<u32>,
    http2_settings: Option<skein_h2::Settings>,
    max_retries: Option<u32>,
    body_threshold_size: Option<usize>,
    pipelining: bool,
}

impl OptionsBuilder {
    /// Headers sent with every request.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn user_agent(mut self, ua: &str) -> Self {
        self.user_agent = Some(ua.to_string());
        self
    }

    /// Enable redirect following with the default hop budget.
    pub fn follow(mut self) -> Self {
        self.follow = Some(5);
        self
    }

    pub fn follow_max_hops(mut self, hops: u32) -> Self {
        self.follow = Some(hops);
        self
    }

    pub fn ssl(mut self, ssl: SslOptions) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn proxy(mut self, url: &str) -> Self {
        self.proxy = Some(url.to_string());
        self
    }

    pub fn keep_alive_timeout(mut self, d: Duration) -> Self {
        self.keep_alive_timeout = Some(d);
        self
    }

    pub fn timeout(mut self, t: TimeoutOptions) -> Self {
        self.timeout = Some(t);
        self
    }

    pub fn cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.push(cookie);
        self
    }

    pub fn resolver(mut self, r: ResolverOptions) -> Self {
        self.resolver = Some(r);
        self
    }

    pub fn max_concurrent_requests(mut self, n: u32) -> Self {
        self.max_concurrent_requests = Some(n);
        self
    }

    pub fn http2_settings(mut self, s: skein_h2::Settings) -> Self {
        self.http2_settings = Some(s);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }

    pub fn body_threshold_size(mut self, n: usize) -> Self {
        self.body_threshold_size = Some(n);
        self
    }

    pub fn pipelining(mut self) -> Self {
        self.pipelining = true;
        self
    }

    pub fn build(self) -> Result<Options, Error> {
        let resolver = self.resolver.unwrap_or_default();
        if resolver.timeouts.is_empty() {
            return Err(Error::InvalidOption("resolver timeouts list is empty".into()));
        }
        if resolver.record_types.is_empty() {
            return Err(Error::InvalidOption("resolver record types list is empty".into()));
        }
        if resolver.packet_size < 512 {
            return Err(Error::InvalidOption("resolver packet_size below 512".into()));
        }
        if resolver.kind == ResolverKind::Https {
            // A DoH resolver resolving its own hostname would be circular;
            // the endpoint must be reachable by IP.
            let endpoint = resolver.doh_endpoint.as_deref().ok_or_else(|| {
                Error::InvalidOption("https resolver requires doh_endpoint".into())
            })?;
            let parsed = Uri::parse(endpoint)?;
            if !parsed.is_ip_literal() {
                return Err(Error::InvalidOption(
                    "doh_endpoint host must be an IP literal".into(),
                ));
            }
        }
        let proxy = match self.proxy {
            Some(url) => Some(Uri::parse(&url)?),
            None => None,
        };
        let max_concurrent = self.max_concurrent_requests.unwrap_or(100);
        if max_concurrent == 0 {
            return Err(Error::InvalidOption("max_concurrent_requests is zero".into()));
        }

        Ok(Options {
            headers: self.headers,
            user_agent: self
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            follow: self.follow,
            ssl: self.ssl,
            proxy,
            keep_alive_timeout: self
                .keep_alive_timeout
                .unwrap_or(Duration::from_secs(5)),
            timeout: self.timeout.unwrap_or_default(),
            cookies: self.cookies,
            resolver,
            max_concurrent_requests: max_concurrent,
            http2_settings: self
                .http2_settings
                .unwrap_or_else(skein_h2::Settings::client),
            max_retries: self.max_retries.unwrap_or(3),
            body_threshold_size: self.body_threshold_size.unwrap_or(112 * 1024),
            pipelining: self.pipelining,
        })
    }
}

/// Per-request deviations from the session options.
#[derive(Debug, Clone, Default)]
pub struct RequestOverrides {
    pub follow: Option<Option<u32>>,
    pub timeout: Option<TimeoutOptions>,
    pub max_retries: Option<u32>,
    pub body_threshold_size: Option<usize>,
}

impl RequestOverrides {
    /// Merge onto `base`, producing the request's immutable snapshot.
    pub fn apply(&self, base: &Options) -> Options {
        let mut merged = base.clone();
        if let Some(follow) = self.follow {
            merged.follow = follow;
        }
        if let Some(timeout) = self.timeout {
            merged.timeout = timeout;
        }
        if let Some(retries) = self.max_retries {
            merged.max_retries = retries;
        }
        if let Some(threshold) = self.body_threshold_size {
            merged.body_threshold_size = threshold;
        }
        merged
    }
}
