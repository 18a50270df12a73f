//! skein — a non-blocking, multi-protocol HTTP client.
//!
//! One single-threaded reactor drives everything: DNS resolution, TCP and
//! TLS connects, HTTP/1.1 exchanges (with opt-in pipelining), and HTTP/2
//! multiplexing over the sans-IO `skein-h2` framing layer. Connections are
//! pooled per origin, HTTP/2 channels coalesce across hostnames when the
//! certificate allows it, and transport loss with requests outstanding is
//! recovered by transparent replay.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use skein::{Options, Session};
//!
//! fn main() -> Result<(), skein::Error> {
//!     let mut session = Session::new(Options::default())?;
//!     let mut response = session.get("http://example.com/")?;
//!     assert_eq!(response.status(), 200);
//!     println!("{}", response.text()?);
//!     Ok(())
//! }
//! ```
//!
//! # Batch requests
//!
//! ```rust,no_run
//! use skein::{Method, Options, Request, Session};
//!
//! # fn main() -> Result<(), skein::Error> {
//! let mut session = Session::new(Options::default())?;
//! let outcomes = session.send_all(vec![
//!     Request::new(Method::Get, "http://example.com/a")?,
//!     Request::new(Method::Get, "http://example.com/b")?,
//! ]);
//! for outcome in outcomes {
//!     match outcome {
//!         Ok(response) => println!("{}", response.status()),
//!         Err(error) => eprintln!("{error}"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//!   Session ── owns ──> Pool ── owns ──> Channel
//!                                          ├── Transport (TCP / TLS+ALPN)
//!                                          ├── Engine (HTTP/1.1 | HTTP/2)
//!                                          └── read/write Buffers
//!   Session ── owns ──> Resolver (native UDP | system | DoH)
//!   Session ── owns ──> Reactor (readiness + timers)
//! ```
//!
//! The reactor is cooperative: the only suspension point is its wait, and
//! every participant is driven by readiness callbacks returning structured
//! results. Nothing inside a callback blocks.

mod buffer;
mod channel;
mod cookies;
mod engine;
mod error;
mod headers;
mod options;
mod pool;
mod reactor;
mod request;
mod resolver;
mod response;
mod session;
mod stats;
mod tls;
mod transport;
mod uri;

pub use cookies::{Cookie, CookieJar};
pub use error::{Error, ErrorKind, ErrorResponse};
pub use headers::HeaderMap;
pub use options::{
    Options, OptionsBuilder, RequestOverrides, ResolverKind, ResolverOptions, SslOptions,
    TimeoutOptions,
};
pub use request::{Body, Method, Request};
pub use resolver::RecordType;
pub use response::{Response, ResponseBody, Version};
pub use session::{AltSvc, Outcome, Session};
pub use uri::{Origin, Scheme, Uri};
