//! Frame codec (RFC 7540 Section 4, plus ALTSVC from RFC 7838).
//!
//! Every frame starts with a 9-octet head: a 24-bit payload length, an 8-bit
//! type, an 8-bit flag set, and a 31-bit stream identifier (the high bit is
//! reserved and always cleared on both paths).

use crate::error::{Error, ErrorCode};
use crate::settings::Settings;

pub const FRAME_HEAD_LEN: usize = 9;

pub mod kind {
    pub const DATA: u8 = 0x0;
    pub const HEADERS: u8 = 0x1;
    pub const PRIORITY: u8 = 0x2;
    pub const RST_STREAM: u8 = 0x3;
    pub const SETTINGS: u8 = 0x4;
    pub const PUSH_PROMISE: u8 = 0x5;
    pub const PING: u8 = 0x6;
    pub const GOAWAY: u8 = 0x7;
    pub const WINDOW_UPDATE: u8 = 0x8;
    pub const CONTINUATION: u8 = 0x9;
    pub const ALTSVC: u8 = 0xa;
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const ACK: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const PADDED: u8 = 0x8;
    pub const PRIORITY: u8 = 0x20;
}

/// Decoded 9-octet frame head.
#[derive(Debug, Clone, Copy)]
pub struct FrameHead {
    pub len: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream: u32,
}

impl FrameHead {
    /// Parse a head from the front of `buf`, or `None` if under 9 octets.
    pub fn parse(buf: &[u8]) -> Option<FrameHead> {
        if buf.len() < FRAME_HEAD_LEN {
            return None;
        }
        Some(FrameHead {
            len: get_u24(buf),
            kind: buf[3],
            flags: buf[4],
            stream: get_u31(&buf[5..]),
        })
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        put_u24(out, self.len);
        out.push(self.kind);
        out.push(self.flags);
        put_u31(out, self.stream);
    }
}

/// A single HTTP/2 frame, owned form.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data {
        stream: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    Headers {
        stream: u32,
        block: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream: u32,
    },
    RstStream {
        stream: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        settings: Settings,
    },
    PushPromise {
        stream: u32,
        promised: u32,
        block: Vec<u8>,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream: u32,
        code: ErrorCode,
        debug: Vec<u8>,
    },
    WindowUpdate {
        stream: u32,
        increment: u32,
    },
    Continuation {
        stream: u32,
        block: Vec<u8>,
        end_headers: bool,
    },
    /// ALTSVC (RFC 7838 Section 4): origin plus an Alt-Svc field value.
    AltSvc {
        stream: u32,
        origin: Vec<u8>,
        value: Vec<u8>,
    },
    /// Frame types this implementation does not know; must be ignored.
    Unknown {
        kind: u8,
        stream: u32,
    },
}

impl Frame {
    /// Append the wire form of this frame to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Data {
                stream,
                data,
                end_stream,
            } => {
                let flags = if *end_stream { flags::END_STREAM } else { 0 };
                head(data.len(), kind::DATA, flags, *stream).write(out);
                out.extend_from_slice(data);
            }
            Frame::Headers {
                stream,
                block,
                end_stream,
                end_headers,
            } => {
                let mut f = 0;
                if *end_stream {
                    f |= flags::END_STREAM;
                }
                if *end_headers {
                    f |= flags::END_HEADERS;
                }
                head(block.len(), kind::HEADERS, f, *stream).write(out);
                out.extend_from_slice(block);
            }
            Frame::Priority { stream } => {
                head(5, kind::PRIORITY, 0, *stream).write(out);
                // Default dependency on stream 0, weight 16.
                put_u31(out, 0);
                out.push(15);
            }
            Frame::RstStream { stream, code } => {
                head(4, kind::RST_STREAM, 0, *stream).write(out);
                out.extend_from_slice(&code.to_wire().to_be_bytes());
            }
            Frame::Settings { ack, settings } => {
                if *ack {
                    head(0, kind::SETTINGS, flags::ACK, 0).write(out);
                } else {
                    let mut payload = Vec::new();
                    settings.encode(&mut payload);
                    head(payload.len(), kind::SETTINGS, 0, 0).write(out);
                    out.extend_from_slice(&payload);
                }
            }
            Frame::PushPromise {
                stream,
                promised,
                block,
                end_headers,
            } => {
                let f = if *end_headers { flags::END_HEADERS } else { 0 };
                head(4 + block.len(), kind::PUSH_PROMISE, f, *stream).write(out);
                put_u31(out, *promised);
                out.extend_from_slice(block);
            }
            Frame::Ping { ack, payload } => {
                let f = if *ack { flags::ACK } else { 0 };
                head(8, kind::PING, f, 0).write(out);
                out.extend_from_slice(payload);
            }
            Frame::GoAway {
                last_stream,
                code,
                debug,
            } => {
                head(8 + debug.len(), kind::GOAWAY, 0, 0).write(out);
                put_u31(out, *last_stream);
                out.extend_from_slice(&code.to_wire().to_be_bytes());
                out.extend_from_slice(debug);
            }
            Frame::WindowUpdate { stream, increment } => {
                head(4, kind::WINDOW_UPDATE, 0, *stream).write(out);
                put_u31(out, *increment);
            }
            Frame::Continuation {
                stream,
                block,
                end_headers,
            } => {
                let f = if *end_headers { flags::END_HEADERS } else { 0 };
                head(block.len(), kind::CONTINUATION, f, *stream).write(out);
                out.extend_from_slice(block);
            }
            Frame::AltSvc {
                stream,
                origin,
                value,
            } => {
                head(2 + origin.len() + value.len(), kind::ALTSVC, 0, *stream).write(out);
                out.extend_from_slice(&(origin.len() as u16).to_be_bytes());
                out.extend_from_slice(origin);
                out.extend_from_slice(value);
            }
            Frame::Unknown { kind, stream } => {
                head(0, *kind, 0, *stream).write(out);
            }
        }
    }

    /// Parse one frame from the front of `buf`.
    ///
    /// `Ok(Some((frame, consumed)))` on success, `Ok(None)` when more bytes
    /// are needed, `Err` on a connection-fatal decode problem.
    pub fn parse(buf: &[u8], max_frame_size: u32) -> Result<Option<(Frame, usize)>, Error> {
        let head = match FrameHead::parse(buf) {
            Some(h) => h,
            None => return Ok(None),
        };
        if head.len > max_frame_size {
            return Err(Error::FrameSize);
        }
        let total = FRAME_HEAD_LEN + head.len as usize;
        if buf.len() < total {
            return Ok(None);
        }
        let payload = &buf[FRAME_HEAD_LEN..total];
        let frame = Self::parse_payload(head, payload)?;
        Ok(Some((frame, total)))
    }

    fn parse_payload(head: FrameHead, payload: &[u8]) -> Result<Frame, Error> {
        let stream = head.stream;
        let flags = head.flags;
        let frame = match head.kind {
            kind::DATA => {
                require_stream(stream, "DATA")?;
                let data = unpad(payload, flags)?;
                Frame::Data {
                    stream,
                    data: data.to_vec(),
                    end_stream: flags & flags::END_STREAM != 0,
                }
            }
            kind::HEADERS => {
                require_stream(stream, "HEADERS")?;
                let mut body = unpad(payload, flags)?;
                if flags & flags::PRIORITY != 0 {
                    // Exclusivity, dependency, and weight are advisory; skip.
                    if body.len() < 5 {
                        return Err(Error::FrameSize);
                    }
                    body = &body[5..];
                }
                Frame::Headers {
                    stream,
                    block: body.to_vec(),
                    end_stream: flags & flags::END_STREAM != 0,
                    end_headers: flags & flags::END_HEADERS != 0,
                }
            }
            kind::PRIORITY => {
                require_stream(stream, "PRIORITY")?;
                if payload.len() != 5 {
                    return Err(Error::FrameSize);
                }
                Frame::Priority { stream }
            }
            kind::RST_STREAM => {
                require_stream(stream, "RST_STREAM")?;
                if payload.len() != 4 {
                    return Err(Error::FrameSize);
                }
                Frame::RstStream {
                    stream,
                    code: ErrorCode::from_wire(get_u32(payload)),
                }
            }
            kind::SETTINGS => {
                if stream != 0 {
                    return Err(Error::protocol("SETTINGS on a stream"));
                }
                if flags & flags::ACK != 0 {
                    if !payload.is_empty() {
                        return Err(Error::FrameSize);
                    }
                    Frame::Settings {
                        ack: true,
                        settings: Settings::default(),
                    }
                } else {
                    Frame::Settings {
                        ack: false,
                        settings: Settings::decode(payload)?,
                    }
                }
            }
            kind::PUSH_PROMISE => {
                require_stream(stream, "PUSH_PROMISE")?;
                let body = unpad(payload, flags)?;
                if body.len() < 4 {
                    return Err(Error::FrameSize);
                }
                Frame::PushPromise {
                    stream,
                    promised: get_u31(body),
                    block: body[4..].to_vec(),
                    end_headers: flags & flags::END_HEADERS != 0,
                }
            }
            kind::PING => {
                if stream != 0 {
                    return Err(Error::protocol("PING on a stream"));
                }
                if payload.len() != 8 {
                    return Err(Error::FrameSize);
                }
                let mut p = [0u8; 8];
                p.copy_from_slice(payload);
                Frame::Ping {
                    ack: flags & flags::ACK != 0,
                    payload: p,
                }
            }
            kind::GOAWAY => {
                if stream != 0 {
                    return Err(Error::protocol("GOAWAY on a stream"));
                }
                if payload.len() < 8 {
                    return Err(Error::FrameSize);
                }
                Frame::GoAway {
                    last_stream: get_u31(payload),
                    code: ErrorCode::from_wire(get_u32(&payload[4..])),
                    debug: payload[8..].to_vec(),
                }
            }
            kind::WINDOW_UPDATE => {
                if payload.len() != 4 {
                    return Err(Error::FrameSize);
                }
                let increment = get_u31(payload);
                if increment == 0 {
                    return Err(Error::protocol("WINDOW_UPDATE of zero"));
                }
                Frame::WindowUpdate { stream, increment }
            }
            kind::CONTINUATION => {
                require_stream(stream, "CONTINUATION")?;
                Frame::Continuation {
                    stream,
                    block: payload.to_vec(),
                    end_headers: flags & flags::END_HEADERS != 0,
                }
            }
            kind::ALTSVC => {
                if payload.len() < 2 {
                    return Err(Error::FrameSize);
                }
                let origin_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
                if payload.len() < 2 + origin_len {
                    return Err(Error::FrameSize);
                }
                Frame::AltSvc {
                    stream,
                    origin: payload[2..2 + origin_len].to_vec(),
                    value: payload[2 + origin_len..].to_vec(),
                }
            }
            other => Frame::Unknown {
                kind: other,
                stream,
            },
        };
        Ok(frame)
    }
}

fn head(len: usize, kind: u8, flags: u8, stream: u32) -> FrameHead {
    FrameHead {
        len: len as u32,
        kind,
        flags,
        stream,
    }
}

fn require_stream(stream: u32, what: &str) -> Result<(), Error> {
    if stream == 0 {
        return Err(Error::protocol(format!("{what} on stream 0")));
    }
    Ok(())
}

/// Strip the pad-length octet and trailing padding when PADDED is set.
fn unpad(payload: &[u8], flags: u8) -> Result<&[u8], Error> {
    if flags & flags::PADDED == 0 {
        return Ok(payload);
    }
    let pad = *payload.first().ok_or(Error::FrameSize)? as usize;
    if pad + 1 > payload.len() {
        return Err(Error::protocol("padding longer than payload"));
    }
    Ok(&payload[1..payload.len() - pad])
}

fn get_u24(buf: &[u8]) -> u32 {
    u32::from(buf[0]) << 16 | u32::from(buf[1]) << 8 | u32::from(buf[2])
}

fn get_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn get_u31(buf: &[u8]) -> u32 {
    get_u32(buf) & 0x7fff_ffff
}

fn put_u24(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

fn put_u31(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&(v & 0x7fff_ffff).to_be_bytes());
}
