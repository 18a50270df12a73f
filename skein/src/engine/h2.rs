//! HTTP/2 engine: an explicit adapter over the sans-IO `skein_h2::Conn`.
//!
//! The adapter owns the request-to-stream table and the concurrency gate
//! (the lower of the configured cap and the peer's
//! MAX_CONCURRENT_STREAMS, which `Conn` tracks from SETTINGS). Requests
//! past the gate queue here. Body bytes drain through the connection's
//! flow-control windows; when the channel's write buffer fills, frame
//! production stops until it drains, and an undelivered body simply keeps
//! its cursor.

use std::collections::{HashMap, HashSet, VecDeque};

use skein_h2::{Conn, ErrorCode, Event, Field, Settings};

use crate::buffer::Buffer;
use crate::error::ErrorKind;
use crate::request::RequestState;
use crate::response::{Response, Version};
use crate::session::{RequestId, Requests};
use crate::stats;

use super::{EngineEvent, PeerClose};

/// Headers that are connection-specific in HTTP/1.1 and must not cross
/// into HTTP/2 (RFC 7540 Section 8.1.2.2).
const HOP_BY_HOP: [&str; 6] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

pub struct H2Engine {
    conn: Conn,
    user_agent: String,
    by_stream: HashMap<u32, RequestId>,
    by_req: HashMap<RequestId, u32>,
    /// Accepted but not yet opened (waiting on SETTINGS or the cap).
    queue: VecDeque<RequestId>,
    /// Streams whose request body is still draining.
    sending: Vec<RequestId>,
    /// Streams holding their body for a 100 Continue.
    parked: HashSet<RequestId>,
    /// Local concurrency ceiling (`max_concurrent_requests`).
    local_cap: u32,
    goaway: bool,
}

impl H2Engine {
    pub fn new(settings: Settings, local_cap: u32, user_agent: String) -> Self {
        Self {
            conn: Conn::new(settings),
            user_agent,
            by_stream: HashMap::new(),
            by_req: HashMap::new(),
            queue: VecDeque::new(),
            sending: Vec::new(),
            parked: HashSet::new(),
            local_cap,
            goaway: false,
        }
    }

    pub fn can_accept(&self) -> bool {
        !self.goaway
    }

    pub fn enqueue(&mut self, id: RequestId) {
        self.queue.push_back(id);
    }

    pub fn has_outstanding(&self) -> bool {
        !self.by_req.is_empty() || !self.queue.is_empty()
    }

    pub fn wants_write(&self) -> bool {
        self.conn.has_output() || !self.queue.is_empty() || !self.sending.is_empty()
    }

    pub fn take_outstanding(&mut self, reqs: &mut Requests) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = Vec::new();
        let mut streams: Vec<(u32, RequestId)> =
            self.by_stream.iter().map(|(s, r)| (*s, *r)).collect();
        streams.sort_unstable();
        for (_, id) in streams {
            ids.push(id);
        }
        for id in self.queue.drain(..) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.by_stream.clear();
        self.by_req.clear();
        self.sending.clear();
        self.parked.clear();
        for &id in &ids {
            if let Some(entry) = reqs.get_mut(id) {
                entry.state = RequestState::Idle;
                entry.body_cursor = 0;
                entry.response = None;
            }
        }
        ids
    }

    pub fn cancel(&mut self, id: RequestId) {
        self.queue.retain(|q| *q != id);
        self.sending.retain(|q| *q != id);
        self.parked.remove(&id);
        if let Some(stream) = self.by_req.remove(&id) {
            self.by_stream.remove(&stream);
            self.conn.reset(stream, ErrorCode::Cancel);
            self.conn.forget(stream);
        }
    }

    // -- Writing --

    pub fn fill(&mut self, out: &mut Buffer, reqs: &mut Requests) {
        self.open_streams(out, reqs);
        self.pump_bodies(out, reqs);
        if !out.is_full() && self.conn.has_output() {
            let bytes = self.conn.take_output(out.remaining());
            out.append(&bytes).expect("bounded take fits");
        }
    }

    fn active(&self) -> u32 {
        self.by_req.len() as u32
    }

    fn open_streams(&mut self, out: &mut Buffer, reqs: &mut Requests) {
        while !out.is_full()
            && !self.goaway
            && self.conn.can_open()
            && self.active() < self.local_cap
        {
            let Some(id) = self.queue.pop_front() else {
                return;
            };
            let Some(entry) = reqs.get_mut(id) else {
                continue;
            };

            let expects = entry
                .request
                .headers
                .get("expect")
                .map(str::to_ascii_lowercase)
                == Some("100-continue".to_string())
                && !entry.request.body.is_empty();
            let empty_body = entry.request.body.is_empty();
            let fields = build_fields(entry, &self.user_agent);

            match self.conn.open_request(&fields, empty_body && !expects) {
                Ok(stream) => {
                    stats::REQUEST_SENT.increment();
                    self.by_stream.insert(stream, id);
                    self.by_req.insert(id, stream);
                    if expects {
                        entry.state = RequestState::Expects;
                        self.parked.insert(id);
                    } else if empty_body {
                        entry.state = RequestState::Done;
                    } else {
                        entry.state = RequestState::Body;
                        self.sending.push(id);
                    }
                }
                Err(_) => {
                    self.queue.push_front(id);
                    return;
                }
            }
        }
    }

    fn pump_bodies(&mut self, out: &mut Buffer, reqs: &mut Requests) {
        let ids: Vec<RequestId> = self.sending.clone();
        for id in ids {
            if out.is_full() {
                return;
            }
            let Some(&stream) = self.by_req.get(&id) else {
                self.sending.retain(|q| *q != id);
                continue;
            };
            let Some(entry) = reqs.get_mut(id) else {
                self.sending.retain(|q| *q != id);
                continue;
            };
            loop {
                if out.is_full() {
                    return;
                }
                match entry.request.body.chunk_at(entry.body_cursor) {
                    Some(chunk) => {
                        match self.conn.send_data(stream, chunk, false) {
                            Ok(0) => break, // window closed; retry later
                            Ok(n) => {
                                entry.body_cursor += n;
                                if n < chunk.len() {
                                    break;
                                }
                            }
                            Err(_) => {
                                self.sending.retain(|q| *q != id);
                                break;
                            }
                        }
                    }
                    None => {
                        // Body exhausted: close our side with an empty
                        // END_STREAM frame.
                        let _ = self.conn.send_data(stream, &[], true);
                        entry.state = RequestState::Done;
                        self.sending.retain(|q| *q != id);
                        break;
                    }
                }
            }
        }
    }

    // -- Reading --

    pub fn consume(
        &mut self,
        data: &[u8],
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) -> Result<usize, (ErrorKind, String)> {
        self.conn
            .feed(data)
            .map_err(|e| (ErrorKind::Protocol, e.to_string()))?;

        while let Some(event) = self.conn.next_event() {
            match event {
                Event::Headers {
                    stream,
                    fields,
                    end_stream,
                } => self.on_headers(stream, fields, end_stream, reqs, events)?,
                Event::Trailers { stream, fields } => {
                    if let Some(&id) = self.by_stream.get(&stream) {
                        if let Some(entry) = reqs.get_mut(id) {
                            if let Some(response) = entry.response.as_mut() {
                                for field in fields {
                                    if !field.name.starts_with(b":") {
                                        response.headers_mut().append(
                                            &String::from_utf8_lossy(&field.name),
                                            String::from_utf8_lossy(&field.value).into_owned(),
                                        );
                                    }
                                }
                            }
                        }
                    }
                }
                Event::Data {
                    stream,
                    data,
                    end_stream,
                } => {
                    if let Some(&id) = self.by_stream.get(&stream) {
                        if let Some(entry) = reqs.get_mut(id) {
                            if let Some(response) = entry.response.as_mut() {
                                response.body_mut().write(&data).map_err(|e| {
                                    (ErrorKind::Protocol, format!("body sink: {e}"))
                                })?;
                            }
                        }
                    }
                    // Window credit goes back as soon as the sink took the
                    // bytes; the spill file is the slow-reader cushion.
                    self.conn.release(stream, data.len());
                    if end_stream {
                        self.complete_stream(stream, reqs, events);
                    }
                }
                Event::Reset { stream, code } => {
                    if let Some(id) = self.by_stream.remove(&stream) {
                        self.by_req.remove(&id);
                        self.sending.retain(|q| *q != id);
                        self.parked.remove(&id);
                        self.conn.forget(stream);
                        let (kind, msg) = match code {
                            ErrorCode::RefusedStream => (
                                ErrorKind::PeerClosed,
                                "stream refused before processing".to_string(),
                            ),
                            other => (
                                ErrorKind::Protocol,
                                format!("stream reset: {other:?}"),
                            ),
                        };
                        events.push(EngineEvent::Failed(id, kind, msg));
                    }
                }
                Event::GoAway { .. } => {
                    // Streams at or below the watermark finish normally;
                    // the refused ones already came back as Reset events.
                    self.goaway = true;
                }
                Event::AltSvc { origin, value } => {
                    events.push(EngineEvent::AltSvc {
                        origin: String::from_utf8_lossy(&origin).into_owned(),
                        value: String::from_utf8_lossy(&value).into_owned(),
                    });
                }
                Event::PushPromise { promised, .. } => {
                    // Push is disabled; refuse anything that slips through.
                    self.conn.reset(promised, ErrorCode::RefusedStream);
                }
                Event::RemoteSettings(_) | Event::SettingsAcked => {}
            }
        }
        Ok(data.len())
    }

    fn on_headers(
        &mut self,
        stream: u32,
        fields: Vec<Field>,
        end_stream: bool,
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), (ErrorKind, String)> {
        let Some(&id) = self.by_stream.get(&stream) else {
            return Ok(());
        };
        let status = parse_status(&fields)
            .ok_or((ErrorKind::Protocol, "response without :status".to_string()))?;

        if (100..200).contains(&status) {
            if status == 100 && self.parked.remove(&id) {
                if let Some(entry) = reqs.get_mut(id) {
                    entry.state = RequestState::Body;
                }
                self.sending.push(id);
            }
            return Ok(());
        }

        let Some(entry) = reqs.get_mut(id) else {
            return Ok(());
        };
        let mut response = Response::new(
            status,
            Version::H2,
            crate::headers::HeaderMap::new(),
            entry.snapshot.body_threshold_size,
        );
        for field in fields {
            if !field.name.starts_with(b":") {
                response.headers_mut().append(
                    &String::from_utf8_lossy(&field.name),
                    String::from_utf8_lossy(&field.value).into_owned(),
                );
            }
        }
        entry.response = Some(response);
        if end_stream {
            self.complete_stream(stream, reqs, events);
        }
        Ok(())
    }

    fn complete_stream(
        &mut self,
        stream: u32,
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) {
        let Some(id) = self.by_stream.remove(&stream) else {
            return;
        };
        self.by_req.remove(&id);
        // A held or half-sent body will never be wanted now; close our
        // side so the stream can be forgotten.
        if self.parked.remove(&id) || self.sending.contains(&id) {
            self.sending.retain(|q| *q != id);
            let _ = self.conn.send_data(stream, &[], true);
        }
        self.conn.forget(stream);
        if let Some(entry) = reqs.get_mut(id) {
            if let Some(response) = entry.response.as_mut() {
                response.mark_complete();
            }
            entry.state = RequestState::Done;
        }
        stats::RESPONSE_COMPLETE.increment();
        events.push(EngineEvent::Completed(id));
    }

    pub fn on_peer_close(
        &mut self,
        _reqs: &mut Requests,
        _events: &mut Vec<EngineEvent>,
    ) -> PeerClose {
        if self.has_outstanding() {
            PeerClose::Reconnect
        } else {
            PeerClose::Clean
        }
    }
}

fn build_fields(entry: &crate::session::RequestEntry, user_agent: &str) -> Vec<Field> {
    let request = &entry.request;
    let mut fields = Vec::with_capacity(8 + request.headers.len());
    fields.push(Field::new(b":method".as_slice(), request.method.as_str()));
    fields.push(Field::new(b":scheme".as_slice(), request.uri.scheme.as_str()));
    fields.push(Field::new(b":authority".as_slice(), request.uri.authority()));
    fields.push(Field::new(b":path".as_slice(), request.uri.request_target()));
    let mut saw_user_agent = false;
    let mut saw_content_length = false;
    for (name, value) in request.headers.iter() {
        if HOP_BY_HOP.contains(&name) {
            continue;
        }
        if name == "user-agent" {
            saw_user_agent = true;
        }
        if name == "content-length" {
            saw_content_length = true;
        }
        fields.push(Field::new(name.as_bytes(), value.as_bytes()));
    }
    if !saw_user_agent {
        fields.push(Field::new(b"user-agent".as_slice(), user_agent));
    }
    if !saw_content_length {
        if let Some(size) = request.body.size() {
            if size > 0 {
                fields.push(Field::new(b"content-length".as_slice(), size.to_string()));
            }
        }
    }
    fields
}

fn parse_status(fields: &[Field]) -> Option<u16> {
    fields
        .iter()
        .find(|f| f.name == b":status")
        .and_then(|f| std::str::from_utf8(&f.value).ok())
        .and_then(|s| s.parse().ok())
}
