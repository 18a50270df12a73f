//! Client-wide counters, exposed through the metriken registry.

use metriken::{metric, Counter};

#[metric(name = "skein/connect/attempt")]
pub static CONNECT_ATTEMPT: Counter = Counter::new();

#[metric(name = "skein/connect/established")]
pub static CONNECT_ESTABLISHED: Counter = Counter::new();

#[metric(name = "skein/connect/tls_handshake")]
pub static TLS_HANDSHAKE: Counter = Counter::new();

#[metric(name = "skein/request/sent")]
pub static REQUEST_SENT: Counter = Counter::new();

#[metric(name = "skein/request/retried")]
pub static REQUEST_RETRIED: Counter = Counter::new();

#[metric(name = "skein/response/complete")]
pub static RESPONSE_COMPLETE: Counter = Counter::new();

#[metric(name = "skein/channel/recycled")]
pub static CHANNEL_RECYCLED: Counter = Counter::new();

#[metric(name = "skein/resolver/query")]
pub static RESOLVE_QUERY: Counter = Counter::new();

#[metric(name = "skein/resolver/cache_hit")]
pub static RESOLVE_CACHE_HIT: Counter = Counter::new();

#[metric(name = "skein/bytes/rx")]
pub static BYTES_RX: Counter = Counter::new();

#[metric(name = "skein/bytes/tx")]
pub static BYTES_TX: Counter = Counter::new();
