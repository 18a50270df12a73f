//! Connection pool: one live channel per origin, plus HTTP/2 coalescing.
//!
//! Channels live in a slab; the slab key doubles as the channel's reactor
//! token. A closed channel is replaced on the next checkout, and idle
//! channels past their keep-alive window are reaped at the same point.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use slab::Slab;

use crate::channel::{Channel, ChannelState, ChannelTimer};
use crate::error::Error;
use crate::options::Options;
use crate::session::Requests;
use crate::tls;
use crate::uri::Origin;

pub type ChannelId = usize;

#[derive(Default)]
pub struct Pool {
    channels: Slab<Channel>,
    by_origin: HashMap<Origin, ChannelId>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A live channel for `origin`, creating one if needed. At most one
    /// channel per key; a dead or reaped one is replaced here.
    pub fn checkout(
        &mut self,
        origin: &Origin,
        snapshot: &Arc<Options>,
        reqs: &mut Requests,
        now: Instant,
    ) -> Result<ChannelId, Error> {
        if let Some(&id) = self.by_origin.get(origin) {
            let reusable = match self.channels.get_mut(id) {
                Some(channel) => {
                    if channel.on_timer(now) == ChannelTimer::Reaped {
                        let _ = channel.close(reqs);
                        false
                    } else {
                        channel.state != ChannelState::Closed
                    }
                }
                None => false,
            };
            if reusable {
                return Ok(id);
            }
            self.remove(id);
        }

        let channel = Channel::new(origin.clone(), snapshot.clone())?;
        let id = self.channels.insert(channel);
        self.by_origin.insert(origin.clone(), id);
        Ok(id)
    }

    /// HTTP/2 coalescing: an open h2 channel whose connected address is in
    /// `addrs`, on the same scheme and port, whose certificate covers the
    /// new hostname, may serve this origin too.
    pub fn coalesce_target(&self, origin: &Origin, addrs: &[IpAddr]) -> Option<ChannelId> {
        for (id, channel) in self.channels.iter() {
            if channel.state != ChannelState::Open || !channel.is_h2() {
                continue;
            }
            if channel.origin.scheme != origin.scheme || channel.origin.port != origin.port {
                continue;
            }
            let Some(ip) = channel.connected_ip() else {
                continue;
            };
            if !addrs.contains(&ip) {
                continue;
            }
            let Some(cert) = channel.peer_cert.as_ref() else {
                continue;
            };
            if tls::cert_covers_host(cert, &origin.host) {
                return Some(id);
            }
        }
        None
    }

    /// Point `origin` at an existing channel (after coalescing).
    pub fn alias(&mut self, origin: Origin, id: ChannelId) {
        self.by_origin.insert(origin, id);
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.channels.get_mut(id)
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|(id, _)| id).collect()
    }

    /// Drop a channel and every alias pointing at it.
    pub fn remove(&mut self, id: ChannelId) {
        if self.channels.contains(id) {
            self.channels.remove(id);
        }
        self.by_origin.retain(|_, v| *v != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::Scheme;

    fn origin(host: &str) -> Origin {
        Origin {
            scheme: Scheme::Http,
            host: host.to_string(),
            port: 80,
        }
    }

    #[test]
    fn checkout_is_deduplicated_per_origin() {
        let mut pool = Pool::new();
        let mut reqs = Requests::new();
        let snapshot = Arc::new(Options::default());
        let now = Instant::now();
        let a = pool
            .checkout(&origin("one.test"), &snapshot, &mut reqs, now)
            .unwrap();
        let same = pool
            .checkout(&origin("one.test"), &snapshot, &mut reqs, now)
            .unwrap();
        let b = pool
            .checkout(&origin("two.test"), &snapshot, &mut reqs, now)
            .unwrap();
        assert_eq!(a, same);
        assert_ne!(a, b);
    }

    #[test]
    fn closed_channel_replaced_on_checkout() {
        let mut pool = Pool::new();
        let mut reqs = Requests::new();
        let snapshot = Arc::new(Options::default());
        let now = Instant::now();
        let a = pool
            .checkout(&origin("gone.test"), &snapshot, &mut reqs, now)
            .unwrap();
        pool.get_mut(a).unwrap().close(&mut reqs);
        let b = pool
            .checkout(&origin("gone.test"), &snapshot, &mut reqs, now)
            .unwrap();
        assert!(pool.get(b).is_some());
        assert_eq!(pool.get(b).unwrap().state, ChannelState::Idle);
    }

    #[test]
    fn remove_clears_aliases() {
        let mut pool = Pool::new();
        let mut reqs = Requests::new();
        let snapshot = Arc::new(Options::default());
        let id = pool
            .checkout(&origin("a.test"), &snapshot, &mut reqs, Instant::now())
            .unwrap();
        pool.alias(origin("b.test"), id);
        pool.remove(id);
        assert!(pool.get(id).is_none());
        let fresh = pool
            .checkout(&origin("b.test"), &snapshot, &mut reqs, Instant::now())
            .unwrap();
        assert!(pool.get(fresh).is_some());
    }

    #[test]
    fn no_coalescing_without_certificate() {
        let pool = Pool::new();
        let target = pool.coalesce_target(&origin("x.test"), &["127.0.0.1".parse().unwrap()]);
        assert!(target.is_none());
    }
}
