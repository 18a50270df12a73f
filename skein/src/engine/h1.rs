//! HTTP/1.1 engine: serialize requests, incrementally parse responses.
//!
//! Sans-IO like its HTTP/2 sibling: the channel feeds received bytes to
//! [`H1Engine::consume`] and drains request bytes with [`H1Engine::fill`].
//! One request at a time by default; opt-in pipelining overlaps writes with
//! reads and falls back to replay-on-a-fresh-channel the moment the peer
//! shows it does not cooperate.

use std::collections::VecDeque;

use crate::buffer::Buffer;
use crate::error::ErrorKind;
use crate::headers::HeaderMap;
use crate::request::RequestState;
use crate::response::{Response, Version};
use crate::session::{RequestId, Requests};
use crate::stats;

use super::{EngineEvent, PeerClose};

/// Largest run of body bytes framed into one chunk.
const CHUNK_RUN: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    Status,
    /// Discarding the header block of a 1xx interim response.
    SkipInterim,
    Headers,
    BodyLength(u64),
    ChunkSize,
    ChunkData(u64),
    ChunkCrlf,
    /// Body runs to connection close.
    BodyEof,
    /// Trailer lines of a chunked body.
    Trailers,
}

#[derive(Debug)]
enum WritePhase {
    Head,
    Body,
    BodyChunked,
}

#[derive(Debug)]
struct WriteJob {
    id: RequestId,
    phase: WritePhase,
    head: Vec<u8>,
    head_sent: usize,
    body_cursor: usize,
    /// Framed-but-unsent chunk bytes (chunked bodies only).
    chunk_buf: Vec<u8>,
    chunk_sent: usize,
    terminator_queued: bool,
}

pub struct H1Engine {
    user_agent: String,
    pipelining_allowed: bool,
    /// Request target in absolute form (talking through a forward proxy).
    absolute_form: bool,

    write_q: VecDeque<RequestId>,
    job: Option<WriteJob>,
    /// Body writer parked until the peer's 100 Continue.
    parked: Option<WriteJob>,
    inflight: VecDeque<RequestId>,

    read: ReadPhase,
    /// Status/version of the response being parsed, before headers finish.
    partial_status: u16,
    partial_headers: HeaderMap,

    close_after: bool,
    /// Peer refused pipelining (closed mid-pipeline); sticky per channel.
    pipelining_refused: bool,
}

impl H1Engine {
    pub fn new(user_agent: String, pipelining: bool, absolute_form: bool) -> Self {
        Self {
            user_agent,
            pipelining_allowed: pipelining,
            absolute_form,
            write_q: VecDeque::new(),
            job: None,
            parked: None,
            inflight: VecDeque::new(),
            read: ReadPhase::Status,
            partial_status: 0,
            partial_headers: HeaderMap::new(),
            close_after: false,
            pipelining_refused: false,
        }
    }

    fn outstanding_count(&self) -> usize {
        let mut ids: Vec<RequestId> = self.inflight.iter().copied().collect();
        for id in &self.write_q {
            ids.push(*id);
        }
        if let Some(job) = &self.job {
            if !ids.contains(&job.id) {
                ids.push(job.id);
            }
        }
        if let Some(parked) = &self.parked {
            if !ids.contains(&parked.id) {
                ids.push(parked.id);
            }
        }
        ids.len()
    }

    /// Whether another request may enter the engine right now.
    pub fn can_accept(&self) -> bool {
        if self.close_after || self.parked.is_some() {
            return false;
        }
        if self.pipelining_allowed && !self.pipelining_refused {
            true
        } else {
            self.outstanding_count() == 0
        }
    }

    pub fn enqueue(&mut self, id: RequestId) {
        self.write_q.push_back(id);
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding_count() > 0
    }

    pub fn close_after(&self) -> bool {
        self.close_after
    }

    pub fn pipelining_refused(&self) -> bool {
        self.pipelining_refused
    }

    pub fn wants_write(&self) -> bool {
        self.job.is_some() || !self.write_q.is_empty()
    }

    /// All requests the engine still answers for, in send order, leaving
    /// the engine empty. Used by the channel's reconnect path.
    pub fn take_outstanding(&mut self, reqs: &mut Requests) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = Vec::new();
        for id in self.inflight.drain(..) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if let Some(job) = self.job.take() {
            if !ids.contains(&job.id) {
                ids.push(job.id);
            }
        }
        if let Some(parked) = self.parked.take() {
            if !ids.contains(&parked.id) {
                ids.push(parked.id);
            }
        }
        for id in self.write_q.drain(..) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        for &id in &ids {
            if let Some(entry) = reqs.get_mut(id) {
                entry.state = RequestState::Idle;
                entry.body_cursor = 0;
                entry.response = None;
            }
        }
        self.read = ReadPhase::Status;
        self.partial_headers = HeaderMap::new();
        ids
    }

    pub fn cancel(&mut self, id: RequestId) {
        self.write_q.retain(|q| *q != id);
        // A request already on the wire cannot be unsent; the channel
        // closes the connection instead.
    }

    /// True when cancelling `id` requires tearing the connection down.
    pub fn cancel_needs_close(&self, id: RequestId) -> bool {
        self.inflight.contains(&id)
            || self.job.as_ref().is_some_and(|j| j.id == id)
            || self.parked.as_ref().is_some_and(|j| j.id == id)
    }

    // -- Writing --

    /// Move request bytes into `out` until it fills or there is nothing
    /// more to write.
    pub fn fill(&mut self, out: &mut Buffer, reqs: &mut Requests) {
        loop {
            if out.is_full() {
                return;
            }
            if self.job.is_none() {
                // The pipeline stalls while a 100-continue answer is
                // pending; anything else would reorder the stream.
                if self.parked.is_some() || self.close_after {
                    return;
                }
                let Some(id) = self.write_q.pop_front() else {
                    return;
                };
                let head = self.build_head(id, reqs);
                if let Some(entry) = reqs.get_mut(id) {
                    entry.state = RequestState::Headers;
                }
                stats::REQUEST_SENT.increment();
                self.job = Some(WriteJob {
                    id,
                    phase: WritePhase::Head,
                    head,
                    head_sent: 0,
                    body_cursor: 0,
                    chunk_buf: Vec::new(),
                    chunk_sent: 0,
                    terminator_queued: false,
                });
            }
            if !self.advance_job(out, reqs) {
                return;
            }
        }
    }

    /// Returns false when the write buffer filled up mid-job.
    fn advance_job(&mut self, out: &mut Buffer, reqs: &mut Requests) -> bool {
        let Some(job) = self.job.as_mut() else {
            return true;
        };
        let id = job.id;

        if matches!(job.phase, WritePhase::Head) {
            let n = out.append_partial(&job.head[job.head_sent..]);
            job.head_sent += n;
            if job.head_sent < job.head.len() {
                return false;
            }
            // Head fully written: the response order is now fixed.
            self.inflight.push_back(id);
            let entry = match reqs.get_mut(id) {
                Some(e) => e,
                None => {
                    self.job = None;
                    return true;
                }
            };
            if entry.request.headers.get("expect").map(str::to_ascii_lowercase)
                == Some("100-continue".to_string())
                && !entry.request.body.is_empty()
            {
                entry.state = RequestState::Expects;
                let mut job = self.job.take().expect("job present");
                job.phase = match entry.request.body.size() {
                    Some(_) => WritePhase::Body,
                    None => WritePhase::BodyChunked,
                };
                self.parked = Some(job);
                return true;
            }
            if entry.request.body.is_empty() {
                entry.state = RequestState::Done;
                self.job = None;
                return true;
            }
            entry.state = RequestState::Body;
            job.phase = match entry.request.body.size() {
                Some(_) => WritePhase::Body,
                None => WritePhase::BodyChunked,
            };
        }

        let job = self.job.as_mut().expect("job present");
        let Some(entry) = reqs.get_mut(id) else {
            self.job = None;
            return true;
        };
        match job.phase {
            WritePhase::Body => {
                while let Some(chunk) = entry.request.body.chunk_at(job.body_cursor) {
                    let n = out.append_partial(chunk);
                    job.body_cursor += n;
                    entry.body_cursor = job.body_cursor;
                    if n < chunk.len() {
                        return false;
                    }
                }
                entry.state = RequestState::Done;
                self.job = None;
                true
            }
            WritePhase::BodyChunked => {
                loop {
                    if job.chunk_sent < job.chunk_buf.len() {
                        let n = out.append_partial(&job.chunk_buf[job.chunk_sent..]);
                        job.chunk_sent += n;
                        if job.chunk_sent < job.chunk_buf.len() {
                            return false;
                        }
                    }
                    if job.terminator_queued {
                        entry.state = RequestState::Done;
                        self.job = None;
                        return true;
                    }
                    job.chunk_buf.clear();
                    job.chunk_sent = 0;
                    match entry.request.body.chunk_at(job.body_cursor) {
                        Some(run) => {
                            let take = run.len().min(CHUNK_RUN);
                            job.chunk_buf
                                .extend_from_slice(format!("{take:x}\r\n").as_bytes());
                            job.chunk_buf.extend_from_slice(&run[..take]);
                            job.chunk_buf.extend_from_slice(b"\r\n");
                            job.body_cursor += take;
                            entry.body_cursor = job.body_cursor;
                        }
                        None => {
                            job.chunk_buf.extend_from_slice(b"0\r\n\r\n");
                            job.terminator_queued = true;
                        }
                    }
                }
            }
            WritePhase::Head => unreachable!("head handled above"),
        }
    }

    fn build_head(&self, id: RequestId, reqs: &Requests) -> Vec<u8> {
        let Some(entry) = reqs.get(id) else {
            return Vec::new();
        };
        let request = &entry.request;
        let target = if self.absolute_form {
            request.uri.absolute_form()
        } else {
            request.uri.request_target()
        };

        let mut headers = request.headers.clone();
        headers.set_default("host", request.uri.authority());
        headers.set_default("user-agent", self.user_agent.clone());
        match request.body.size() {
            Some(0) => {}
            Some(n) => headers.set_default("content-length", n.to_string()),
            None => headers.set_default("transfer-encoding", "chunked"),
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(request.method.as_str().as_bytes());
        head.push(b' ');
        head.extend_from_slice(target.as_bytes());
        head.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in headers.iter() {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        head
    }

    // -- Reading --

    /// Parse received bytes. Returns how many were consumed; the channel
    /// keeps the remainder buffered for the next read.
    pub fn consume(
        &mut self,
        data: &[u8],
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) -> Result<usize, (ErrorKind, String)> {
        let mut pos = 0;
        loop {
            match self.read {
                ReadPhase::Status => {
                    let Some(line_end) = find_crlf(&data[pos..]) else {
                        return Ok(pos);
                    };
                    let line = &data[pos..pos + line_end];
                    let (version_10, status) = parse_status_line(line)
                        .ok_or((ErrorKind::Protocol, "malformed status line".to_string()))?;
                    pos += line_end + 2;
                    if (100..200).contains(&status) {
                        if status == 100 {
                            self.resume_parked(reqs);
                        }
                        self.read = ReadPhase::SkipInterim;
                        continue;
                    }
                    if self.inflight.is_empty() {
                        return Err((
                            ErrorKind::Protocol,
                            "response without a pending request".to_string(),
                        ));
                    }
                    self.partial_status = status;
                    self.partial_headers = HeaderMap::new();
                    if version_10 {
                        // HTTP/1.0 is close-per-request unless told otherwise.
                        self.close_after = true;
                    }
                    self.read = ReadPhase::Headers;
                }
                ReadPhase::SkipInterim => {
                    let Some(line_end) = find_crlf(&data[pos..]) else {
                        return Ok(pos);
                    };
                    let blank = line_end == 0;
                    pos += line_end + 2;
                    if blank {
                        self.read = ReadPhase::Status;
                    }
                }
                ReadPhase::Headers => {
                    let Some(line_end) = find_crlf(&data[pos..]) else {
                        return Ok(pos);
                    };
                    let line = &data[pos..pos + line_end];
                    if !line.is_empty() {
                        let (name, value) = parse_header_line(line)
                            .ok_or((ErrorKind::Protocol, "malformed header".to_string()))?;
                        pos += line_end + 2;
                        self.partial_headers.append(&name, value);
                        continue;
                    }
                    pos += line_end + 2;
                    self.begin_body(reqs, events)?;
                }
                ReadPhase::BodyLength(remaining) => {
                    let avail = (data.len() - pos).min(remaining as usize);
                    if avail == 0 {
                        return Ok(pos);
                    }
                    self.append_body(&data[pos..pos + avail], reqs)?;
                    pos += avail;
                    if avail as u64 == remaining {
                        self.finish_response(reqs, events);
                    } else {
                        self.read = ReadPhase::BodyLength(remaining - avail as u64);
                        return Ok(pos);
                    }
                }
                ReadPhase::ChunkSize => {
                    let Some(line_end) = find_crlf(&data[pos..]) else {
                        return Ok(pos);
                    };
                    let line = &data[pos..pos + line_end];
                    let size = parse_chunk_size(line)
                        .ok_or((ErrorKind::Protocol, "malformed chunk size".to_string()))?;
                    pos += line_end + 2;
                    self.read = if size == 0 {
                        ReadPhase::Trailers
                    } else {
                        ReadPhase::ChunkData(size)
                    };
                }
                ReadPhase::ChunkData(remaining) => {
                    let avail = (data.len() - pos).min(remaining as usize);
                    if avail == 0 {
                        return Ok(pos);
                    }
                    self.append_body(&data[pos..pos + avail], reqs)?;
                    pos += avail;
                    if avail as u64 == remaining {
                        self.read = ReadPhase::ChunkCrlf;
                    } else {
                        self.read = ReadPhase::ChunkData(remaining - avail as u64);
                        return Ok(pos);
                    }
                }
                ReadPhase::ChunkCrlf => {
                    if data.len() - pos < 2 {
                        return Ok(pos);
                    }
                    if &data[pos..pos + 2] != b"\r\n" {
                        return Err((
                            ErrorKind::Protocol,
                            "chunk not terminated by CRLF".to_string(),
                        ));
                    }
                    pos += 2;
                    self.read = ReadPhase::ChunkSize;
                }
                ReadPhase::BodyEof => {
                    self.append_body(&data[pos..], reqs)?;
                    return Ok(data.len());
                }
                ReadPhase::Trailers => {
                    let Some(line_end) = find_crlf(&data[pos..]) else {
                        return Ok(pos);
                    };
                    let line = data[pos..pos + line_end].to_vec();
                    pos += line_end + 2;
                    if line.is_empty() {
                        self.finish_response(reqs, events);
                    } else if let Some((name, value)) = parse_header_line(&line) {
                        self.set_response_trailer(reqs, &name, value);
                    }
                }
            }
        }
    }

    /// The transport hit EOF. Either a clean idle close, the terminator of
    /// an EOF-framed body, or grounds for replay.
    pub fn on_peer_close(
        &mut self,
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) -> PeerClose {
        if self.read == ReadPhase::BodyEof {
            self.finish_response(reqs, events);
        }
        if self.outstanding_count() == 0 {
            return PeerClose::Clean;
        }
        if self.inflight.len() + self.write_q.len() > 1 {
            // The peer bailed with responses owed: treat as a pipelining
            // refusal so the replay channel goes one-at-a-time.
            self.pipelining_refused = true;
        }
        PeerClose::Reconnect
    }

    fn resume_parked(&mut self, reqs: &mut Requests) {
        if let Some(job) = self.parked.take() {
            if let Some(entry) = reqs.get_mut(job.id) {
                entry.state = RequestState::Body;
            }
            self.job = Some(job);
        }
    }

    fn begin_body(
        &mut self,
        reqs: &mut Requests,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), (ErrorKind, String)> {
        let front = *self
            .inflight
            .front()
            .ok_or((ErrorKind::Protocol, "no request awaiting body".to_string()))?;
        let status = self.partial_status;
        let headers = std::mem::take(&mut self.partial_headers);

        let connection = headers.get("connection").map(str::to_ascii_lowercase);
        if connection.as_deref() == Some("close") {
            self.close_after = true;
        } else if connection.as_deref() == Some("keep-alive") {
            self.close_after = false;
        }

        // A response before the body went out (417 or an early final):
        // the announced body will never be sent, so the connection state
        // is unrecoverable past this response.
        if self.parked.as_ref().is_some_and(|j| j.id == front)
            || self.job.as_ref().is_some_and(|j| j.id == front)
        {
            self.parked = None;
            self.job = None;
            self.close_after = true;
        }

        let entry = reqs
            .get_mut(front)
            .ok_or((ErrorKind::Protocol, "request entry vanished".to_string()))?;
        let method_head = !entry.request.method.expects_response_body();
        let threshold = entry.snapshot.body_threshold_size;
        let mut response = Response::new(status, Version::Http11, headers, threshold);

        let framing = if method_head || status == 204 || status == 304 {
            None
        } else if response
            .headers()
            .get("transfer-encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
        {
            Some(ReadPhase::ChunkSize)
        } else if let Some(len) = response.content_length() {
            if len == 0 {
                None
            } else {
                Some(ReadPhase::BodyLength(len))
            }
        } else {
            // No framing at all: the body runs to connection close. Only
            // meaningful when the connection is in fact closing.
            self.close_after = true;
            Some(ReadPhase::BodyEof)
        };

        match framing {
            None => {
                response.mark_complete();
                entry.response = Some(response);
                self.read = ReadPhase::Status;
                self.emit_complete(reqs, events);
            }
            Some(phase) => {
                entry.response = Some(response);
                self.read = phase;
            }
        }
        Ok(())
    }

    fn append_body(
        &mut self,
        bytes: &[u8],
        reqs: &mut Requests,
    ) -> Result<(), (ErrorKind, String)> {
        if bytes.is_empty() {
            return Ok(());
        }
        let Some(&front) = self.inflight.front() else {
            return Ok(());
        };
        let Some(entry) = reqs.get_mut(front) else {
            return Ok(());
        };
        if let Some(response) = entry.response.as_mut() {
            response
                .body_mut()
                .write(bytes)
                .map_err(|e| (ErrorKind::Protocol, format!("body sink: {e}")))?;
        }
        Ok(())
    }

    fn set_response_trailer(&mut self, reqs: &mut Requests, name: &str, value: String) {
        if let Some(&front) = self.inflight.front() {
            if let Some(entry) = reqs.get_mut(front) {
                if let Some(response) = entry.response.as_mut() {
                    response.headers_mut().append(name, value);
                }
            }
        }
    }

    fn finish_response(&mut self, reqs: &mut Requests, events: &mut Vec<EngineEvent>) {
        if let Some(&front) = self.inflight.front() {
            if let Some(entry) = reqs.get_mut(front) {
                if let Some(response) = entry.response.as_mut() {
                    response.mark_complete();
                }
            }
        }
        self.read = ReadPhase::Status;
        self.emit_complete(reqs, events);
    }

    fn emit_complete(&mut self, reqs: &mut Requests, events: &mut Vec<EngineEvent>) {
        if let Some(front) = self.inflight.pop_front() {
            if let Some(entry) = reqs.get_mut(front) {
                entry.state = RequestState::Done;
            }
            stats::RESPONSE_COMPLETE.increment();
            events.push(EngineEvent::Completed(front));
        }
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == b"\r\n")
}

/// Parse "HTTP/1.x NNN reason". Returns (is_http_10, status).
fn parse_status_line(line: &[u8]) -> Option<(bool, u16)> {
    let text = std::str::from_utf8(line).ok()?;
    let mut parts = text.splitn(3, ' ');
    let version = parts.next()?;
    let version_10 = match version {
        "HTTP/1.1" => false,
        "HTTP/1.0" => true,
        _ => return None,
    };
    let status: u16 = parts.next()?.parse().ok()?;
    if !(100..600).contains(&status) {
        return None;
    }
    Some((version_10, status))
}

fn parse_header_line(line: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(line).ok()?;
    let (name, value) = text.split_once(':')?;
    let name = name.trim();
    if name.is_empty() || name.contains(' ') {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

fn parse_chunk_size(line: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(line).ok()?;
    let hex = text.split(';').next()?.trim();
    u64::from_str_radix(hex, 16).ok()
}
