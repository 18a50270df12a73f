//! DNS-over-HTTPS (RFC 8484) resolution through an internal session.
//!
//! The endpoint host must be an IP literal (enforced at option-build time),
//! so the internal session's own resolution short-circuits and the
//! bootstrap is never circular. Runs on the resolver worker thread; the
//! outer reactor only ever sees the mailbox.

use std::net::IpAddr;
use std::time::Duration;

use crate::options::{Options, ResolverOptions};
use crate::request::{Method, Request};
use crate::session::Session;

use super::wire::{self, RData};
use super::RecordType;

pub fn resolve(opts: &ResolverOptions, host: &str) -> Result<(Vec<IpAddr>, Duration), String> {
    let endpoint = opts
        .doh_endpoint
        .as_deref()
        .ok_or("doh endpoint not configured")?;

    let mut last_error = format!("{host}: no address records");
    for rtype in &opts.record_types {
        let rtype = *rtype;
        if rtype == RecordType::Cname {
            continue;
        }
        match query_once(endpoint, host, rtype) {
            Ok((addrs, ttl)) if !addrs.is_empty() => return Ok((addrs, ttl)),
            Ok(_) => {}
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

fn query_once(
    endpoint: &str,
    host: &str,
    rtype: RecordType,
) -> Result<(Vec<IpAddr>, Duration), String> {
    // RFC 8484 Section 4.1: DNS ID zero aids HTTP-level caching.
    let mut packet = Vec::with_capacity(64);
    wire::encode_query(0, host, rtype, &mut packet).map_err(|e| e.to_string())?;

    let request = Request::new(Method::Post, endpoint)
        .map_err(|e| e.to_string())?
        .header("accept", "application/dns-message")
        .header("content-type", "application/dns-message")
        .body(packet);

    let options = Options::builder()
        .build()
        .map_err(|e| e.to_string())?;
    let mut session = Session::new(options).map_err(|e| e.to_string())?;
    let mut response = session.send(request).map_err(|e| e.to_string())?;
    if response.status() != 200 {
        return Err(format!("doh endpoint returned {}", response.status()));
    }

    let body = response
        .body_mut()
        .to_vec()
        .map_err(|e| e.to_string())?;
    let message = wire::decode_message(&body)?;
    if message.rcode != wire::RCODE_OK {
        return Err(format!("{host}: doh rcode {}", message.rcode));
    }

    let mut addrs = Vec::new();
    let mut min_ttl = u32::MAX;
    for answer in &message.answers {
        match answer.data {
            RData::A(ip) => {
                addrs.push(IpAddr::V4(ip));
                min_ttl = min_ttl.min(answer.ttl);
            }
            RData::Aaaa(ip) => {
                addrs.push(IpAddr::V6(ip));
                min_ttl = min_ttl.min(answer.ttl);
            }
            _ => {}
        }
    }
    let ttl = if min_ttl == u32::MAX { 60 } else { min_ttl.max(1) };
    Ok((addrs, Duration::from_secs(u64::from(ttl))))
}
