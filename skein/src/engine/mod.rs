//! Protocol engines: the state machines a channel couples to its transport.
//!
//! Both engines are sans-IO with the same surface: requests go in with
//! `enqueue`, wire bytes come out of `fill` (bounded by the channel's write
//! buffer, which is the back-pressure signal), and received bytes go
//! through `consume`, which mutates the request table and emits
//! [`EngineEvent`]s for the session.

pub mod h1;
pub mod h2;

use crate::buffer::Buffer;
use crate::error::ErrorKind;
use crate::session::{RequestId, Requests};

pub use h1::H1Engine;
pub use h2::H2Engine;

/// What an engine tells the session about a request.
#[derive(Debug)]
pub enum EngineEvent {
    /// The response (headers and body) is complete in the request entry.
    Completed(RequestId),
    /// The request failed inside the engine.
    Failed(RequestId, ErrorKind, String),
    /// The peer advertised an alternative service (observational).
    AltSvc { origin: String, value: String },
}

/// Outcome of the peer closing the transport underneath an engine.
#[derive(Debug, PartialEq, Eq)]
pub enum PeerClose {
    /// Nothing was owed; a clean goodbye.
    Clean,
    /// Requests remain answerable; replay them on a fresh transport.
    Reconnect,
}

/// The protocol engine attached to an open channel. An explicit
/// two-variant dispatch; each capability is named here, nothing is
/// forwarded blindly.
pub enum Engine {
    H1(H1Engine),
    H2(H2Engine),
}

impl Engine {
    pub fn can_accept(&self) -> bool {
        match self {
            Engine::H1(e) => e.can_accept(),
            Engine::H2(e) => e.can_accept(),
        }
    }

    pub fn enqueue(&mut self, id: RequestId) {
        match self {
            Engine::H1(e) => e.enqueue(id),
            Engine::H2(e) => e.enqueue(id),
        }
    }

    pub fn fill(&mut self, out: &mut Buffer, reqs: &mut Requests) {
        match self {
            Engine::H1(e) => e.fill(out, reqs),
            Engine::H2(e) => e.fill(out, reqs),
        }
    }

    pub fn consume(
        &mut self,
        data: &[u8],
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) -> Result<usize, (ErrorKind, String)> {
        match self {
            Engine::H1(e) => e.consume(data, reqs, events),
            Engine::H2(e) => e.consume(data, reqs, events),
        }
    }

    pub fn on_peer_close(
        &mut self,
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) -> PeerClose {
        match self {
            Engine::H1(e) => e.on_peer_close(reqs, events),
            Engine::H2(e) => e.on_peer_close(reqs, events),
        }
    }

    pub fn has_outstanding(&self) -> bool {
        match self {
            Engine::H1(e) => e.has_outstanding(),
            Engine::H2(e) => e.has_outstanding(),
        }
    }

    /// Every request the engine still answers for, leaving it empty.
    pub fn take_outstanding(&mut self, reqs: &mut Requests) -> Vec<RequestId> {
        match self {
            Engine::H1(e) => e.take_outstanding(reqs),
            Engine::H2(e) => e.take_outstanding(reqs),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            Engine::H1(e) => e.wants_write(),
            Engine::H2(e) => e.wants_write(),
        }
    }

    /// The connection must not be reused after the current exchange.
    pub fn close_after(&self) -> bool {
        match self {
            Engine::H1(e) => e.close_after(),
            Engine::H2(_) => false,
        }
    }

    /// Pipelining was refused by the peer; sticky, consulted on replay.
    pub fn pipelining_refused(&self) -> bool {
        match self {
            Engine::H1(e) => e.pipelining_refused(),
            Engine::H2(_) => false,
        }
    }

    /// Remove a request. Returns true when the removal requires the whole
    /// connection to be torn down (HTTP/1.1 request already on the wire).
    pub fn cancel(&mut self, id: RequestId) -> bool {
        match self {
            Engine::H1(e) => {
                let needs_close = e.cancel_needs_close(id);
                e.cancel(id);
                needs_close
            }
            Engine::H2(e) => {
                e.cancel(id);
                false
            }
        }
    }
}
