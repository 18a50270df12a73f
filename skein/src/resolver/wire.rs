//! DNS message codec, the RFC 1035 subset a stub resolver needs:
//! queries out, A/AAAA/CNAME answers (with name compression) back in.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::RecordType;

const CLASS_IN: u16 = 1;
const FLAG_RD: u16 = 0x0100;
const HEADER_LEN: usize = 12;

pub const RCODE_OK: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;

/// One resource record from the answer section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub name: String,
    pub ttl: u32,
    pub data: RData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    /// Types this resolver does not interpret.
    Other(u16),
}

/// A decoded response, reduced to what the resolver acts on.
#[derive(Debug)]
pub struct Message {
    pub id: u16,
    pub rcode: u8,
    pub answers: Vec<Answer>,
}

/// Serialize a recursive query for `host`/`rtype` into `out`.
pub fn encode_query(
    id: u16,
    host: &str,
    rtype: RecordType,
    out: &mut Vec<u8>,
) -> Result<(), String> {
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&FLAG_RD.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&[0; 6]); // AN/NS/AR counts

    encode_name(host, out)?;
    out.extend_from_slice(&rtype.to_qtype().to_be_bytes());
    out.extend_from_slice(&CLASS_IN.to_be_bytes());
    Ok(())
}

fn encode_name(host: &str, out: &mut Vec<u8>) -> Result<(), String> {
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || host.len() > 253 {
        return Err(format!("hostname {host:?} out of range"));
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("bad label in {host:?}"));
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Ok(())
}

/// Parse a response packet down to id, rcode, and the answer records.
pub fn decode_message(packet: &[u8]) -> Result<Message, String> {
    if packet.len() < HEADER_LEN {
        return Err("packet shorter than header".into());
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let flags = u16::from_be_bytes([packet[2], packet[3]]);
    if flags & 0x8000 == 0 {
        return Err("not a response".into());
    }
    let rcode = (flags & 0x000f) as u8;
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    let ancount = u16::from_be_bytes([packet[6], packet[7]]);

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(packet, pos)?;
        pos = pos.checked_add(4).filter(|p| *p <= packet.len())
            .ok_or("truncated question")?;
    }

    let mut answers = Vec::with_capacity(ancount as usize);
    for _ in 0..ancount {
        let (name, after_name) = decode_name(packet, pos)?;
        pos = after_name;
        if pos + 10 > packet.len() {
            return Err("truncated answer".into());
        }
        let rtype = u16::from_be_bytes([packet[pos], packet[pos + 1]]);
        let ttl = u32::from_be_bytes([
            packet[pos + 4],
            packet[pos + 5],
            packet[pos + 6],
            packet[pos + 7],
        ]);
        let rdlength = u16::from_be_bytes([packet[pos + 8], packet[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlength > packet.len() {
            return Err("truncated rdata".into());
        }
        let rdata = &packet[pos..pos + rdlength];

        let data = match rtype {
            1 => {
                if rdlength != 4 {
                    return Err("bad A rdata length".into());
                }
                RData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
            }
            28 => {
                if rdlength != 16 {
                    return Err("bad AAAA rdata length".into());
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            5 => {
                let (target, _) = decode_name(packet, pos)?;
                RData::Cname(target)
            }
            other => RData::Other(other),
        };
        pos += rdlength;
        answers.push(Answer { name, ttl, data });
    }

    Ok(Message { id, rcode, answers })
}

/// Advance past a (possibly compressed) name without materializing it.
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, String> {
    loop {
        let len = *packet.get(pos).ok_or("truncated name")?;
        if len & 0xc0 == 0xc0 {
            return Ok(pos + 2);
        }
        if len == 0 {
            return Ok(pos + 1);
        }
        pos += 1 + len as usize;
    }
}

/// Decode a name, following compression pointers. Returns the dotted name
/// and the position just past the name's first encoding.
fn decode_name(packet: &[u8], start: usize) -> Result<(String, usize), String> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *packet.get(pos).ok_or("truncated name")?;
        if len & 0xc0 == 0xc0 {
            let second = *packet.get(pos + 1).ok_or("truncated pointer")?;
            if end.is_none() {
                end = Some(pos + 2);
            }
            pos = (usize::from(len & 0x3f) << 8) | usize::from(second);
            jumps += 1;
            if jumps > 16 {
                return Err("compression pointer loop".into());
            }
            continue;
        }
        if len == 0 {
            if end.is_none() {
                end = Some(pos + 1);
            }
            break;
        }
        let label_start = pos + 1;
        let label_end = label_start + len as usize;
        let label = packet
            .get(label_start..label_end)
            .ok_or("truncated label")?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos = label_end;
    }

    Ok((labels.join("."), end.expect("end set before break")))
}
