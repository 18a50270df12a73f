//! Client connection state machine.
//!
//! [`Conn`] is sans-IO: feed peer bytes with [`Conn::feed`], drain wire
//! output with [`Conn::take_output`], and pull decoded activity from
//! [`Conn::next_event`]. Flow-control credit for received DATA is returned
//! explicitly through [`Conn::release`] once the application has consumed
//! the bytes, so a slow reader translates directly into back-pressure on
//! the peer.

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, ErrorCode};
use crate::frame::Frame;
use crate::hpack::{Decoder, Encoder, Field};
use crate::settings::Settings;
use crate::stream::{Stream, StreamState};
use crate::window::{Window, INITIAL_WINDOW};

/// Connection preface sent by the client (RFC 7540 Section 3.5).
const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Preface queued; waiting for the server SETTINGS.
    AwaitingSettings,
    Ready,
    /// GOAWAY seen or sent. Existing streams may finish.
    Closing,
    Closed,
}

/// Decoded connection activity, in arrival order.
#[derive(Debug)]
pub enum Event {
    /// The server's SETTINGS arrived (initial or update).
    RemoteSettings(Settings),
    /// The server acknowledged our SETTINGS.
    SettingsAcked,
    /// Response headers for a stream.
    Headers {
        stream: u32,
        fields: Vec<Field>,
        end_stream: bool,
    },
    /// Trailing headers for a stream.
    Trailers { stream: u32, fields: Vec<Field> },
    /// Response body bytes. Credit must be returned via [`Conn::release`].
    Data {
        stream: u32,
        data: Vec<u8>,
        end_stream: bool,
    },
    /// The stream was terminated abnormally.
    Reset { stream: u32, code: ErrorCode },
    /// The peer is shutting the connection down.
    GoAway {
        last_stream: u32,
        code: ErrorCode,
        debug: Vec<u8>,
    },
    /// Alternative service advertisement (RFC 7838). Observational only.
    AltSvc { origin: Vec<u8>, value: Vec<u8> },
    /// Server push attempt. Observational only; push is disabled here.
    PushPromise {
        stream: u32,
        promised: u32,
        fields: Vec<Field>,
    },
}

/// Client-side HTTP/2 connection.
pub struct Conn {
    state: State,
    local: Settings,
    remote: Settings,
    streams: HashMap<u32, Stream>,
    next_stream: u32,
    recv_window: Window,
    send_window: Window,
    /// Connection-level credit consumed by the app, pending WINDOW_UPDATE.
    released: u32,
    encoder: Encoder,
    decoder: Decoder,
    in_buf: Vec<u8>,
    out_buf: Vec<u8>,
    events: VecDeque<Event>,
    /// Stream whose header block is mid-flight; only CONTINUATION for it
    /// may arrive until END_HEADERS.
    continuation: Option<u32>,
    goaway: Option<u32>,
}

impl Conn {
    /// Create a connection and queue the preface, our SETTINGS, and any
    /// initial connection-window top-up.
    pub fn new(local: Settings) -> Self {
        let mut out_buf = Vec::with_capacity(256);
        out_buf.extend_from_slice(PREFACE);
        Frame::Settings {
            ack: false,
            settings: local.clone(),
        }
        .write(&mut out_buf);

        let initial = i64::from(local.initial_window_size);
        if initial > INITIAL_WINDOW {
            Frame::WindowUpdate {
                stream: 0,
                increment: (initial - INITIAL_WINDOW) as u32,
            }
            .write(&mut out_buf);
        }

        Self {
            state: State::AwaitingSettings,
            encoder: Encoder::new(Settings::default().header_table_size as usize),
            decoder: Decoder::new(local.header_table_size as usize),
            remote: Settings::default(),
            streams: HashMap::new(),
            next_stream: 1,
            recv_window: Window::new(initial),
            send_window: Window::default(),
            released: 0,
            in_buf: Vec::new(),
            out_buf,
            events: VecDeque::new(),
            continuation: None,
            goaway: None,
            local,
        }
    }

    /// The server's current SETTINGS.
    pub fn remote_settings(&self) -> &Settings {
        &self.remote
    }

    /// Whether the SETTINGS exchange has completed.
    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Streams that are not yet fully closed.
    pub fn open_streams(&self) -> usize {
        self.streams.values().filter(|s| !s.is_closed()).count()
    }

    /// Whether a new request may be opened right now: the exchange is done,
    /// no GOAWAY was seen, and the peer's concurrency limit has room.
    pub fn can_open(&self) -> bool {
        if self.state != State::Ready || self.goaway.is_some() {
            return false;
        }
        match self.remote.max_concurrent_streams {
            Some(cap) => (self.open_streams() as u32) < cap,
            None => true,
        }
    }

    // -- Output --

    pub fn has_output(&self) -> bool {
        !self.out_buf.is_empty()
    }

    /// Drain up to `limit` queued wire bytes. Bounded so the caller's write
    /// buffer stays the unit of back-pressure.
    pub fn take_output(&mut self, limit: usize) -> Vec<u8> {
        let n = limit.min(self.out_buf.len());
        self.out_buf.drain(..n).collect()
    }

    // -- Sending --

    /// Open a stream and send its HEADERS (split into CONTINUATION frames
    /// when the block exceeds the peer's frame-size limit). Returns the new
    /// stream id.
    pub fn open_request(&mut self, fields: &[Field], end_stream: bool) -> Result<u32, Error> {
        if self.state != State::Ready || self.goaway.is_some() {
            return Err(Error::Closed);
        }
        let stream = self.next_stream;
        self.next_stream += 2;

        let mut block = Vec::new();
        self.encoder.encode(fields, &mut block);

        let max = self.remote.max_frame_size as usize;
        if block.len() <= max {
            Frame::Headers {
                stream,
                block,
                end_stream,
                end_headers: true,
            }
            .write(&mut self.out_buf);
        } else {
            let mut chunks = block.chunks(max);
            let first = chunks.next().unwrap_or(&[]);
            Frame::Headers {
                stream,
                block: first.to_vec(),
                end_stream,
                end_headers: false,
            }
            .write(&mut self.out_buf);
            let mut rest: Vec<&[u8]> = chunks.collect();
            let last = rest.pop();
            for chunk in rest {
                Frame::Continuation {
                    stream,
                    block: chunk.to_vec(),
                    end_headers: false,
                }
                .write(&mut self.out_buf);
            }
            if let Some(chunk) = last {
                Frame::Continuation {
                    stream,
                    block: chunk.to_vec(),
                    end_headers: true,
                }
                .write(&mut self.out_buf);
            }
        }

        let mut entry = Stream::new(
            i64::from(self.local.initial_window_size),
            i64::from(self.remote.initial_window_size),
        );
        if end_stream {
            entry.close_local();
        }
        self.streams.insert(stream, entry);
        Ok(stream)
    }

    /// Send body bytes on a stream, as much as flow control and the peer's
    /// frame-size limit allow. Returns how many bytes were accepted; the
    /// caller retries the remainder after the next WINDOW_UPDATE.
    /// `end_stream` takes effect only once the final byte is accepted (or
    /// immediately for an empty body).
    pub fn send_data(
        &mut self,
        stream: u32,
        data: &[u8],
        end_stream: bool,
    ) -> Result<usize, Error> {
        let entry = self
            .streams
            .get_mut(&stream)
            .ok_or(Error::Stream {
                id: stream,
                code: ErrorCode::StreamClosed,
            })?;
        if !entry.can_send_data() {
            return Err(Error::Stream {
                id: stream,
                code: ErrorCode::StreamClosed,
            });
        }

        if data.is_empty() {
            if end_stream {
                Frame::Data {
                    stream,
                    data: Vec::new(),
                    end_stream: true,
                }
                .write(&mut self.out_buf);
                entry.close_local();
            }
            return Ok(0);
        }

        let budget = self
            .send_window
            .available()
            .min(entry.send_window.available())
            .max(0) as usize;
        let max_frame = self.remote.max_frame_size as usize;
        let mut sent = 0;
        while sent < data.len() {
            let chunk = (data.len() - sent).min(max_frame).min(budget - sent);
            if chunk == 0 {
                break;
            }
            let fin = end_stream && sent + chunk == data.len();
            self.send_window.charge(chunk)?;
            entry.send_window.charge(chunk)?;
            Frame::Data {
                stream,
                data: data[sent..sent + chunk].to_vec(),
                end_stream: fin,
            }
            .write(&mut self.out_buf);
            sent += chunk;
            if fin {
                entry.close_local();
            }
        }
        Ok(sent)
    }

    /// Abort a stream.
    pub fn reset(&mut self, stream: u32, code: ErrorCode) {
        if let Some(entry) = self.streams.get_mut(&stream) {
            if !entry.is_closed() {
                Frame::RstStream { stream, code }.write(&mut self.out_buf);
                entry.state = StreamState::Closed;
            }
        }
    }

    /// Begin a graceful local shutdown.
    pub fn go_away(&mut self, code: ErrorCode) {
        Frame::GoAway {
            last_stream: 0,
            code,
            debug: Vec::new(),
        }
        .write(&mut self.out_buf);
        self.state = State::Closing;
    }

    /// Return `n` consumed body bytes as flow-control credit. Updates are
    /// batched and go on the wire once half a window has accumulated.
    pub fn release(&mut self, stream: u32, n: usize) {
        let threshold = (self.local.initial_window_size / 2).max(1);
        self.released = self.released.saturating_add(n as u32);
        if self.released >= threshold {
            let increment = self.released;
            Frame::WindowUpdate {
                stream: 0,
                increment,
            }
            .write(&mut self.out_buf);
            let _ = self.recv_window.grant(increment);
            self.released = 0;
        }
        if let Some(entry) = self.streams.get_mut(&stream) {
            if entry.is_closed() || entry.state == StreamState::HalfClosedRemote {
                return;
            }
            entry.released = entry.released.saturating_add(n as u32);
            if entry.released >= threshold {
                let increment = entry.released;
                Frame::WindowUpdate { stream, increment }.write(&mut self.out_buf);
                let _ = entry.recv_window.grant(increment);
                entry.released = 0;
            }
        }
    }

    /// Drop the table entry for a fully-closed stream.
    pub fn forget(&mut self, stream: u32) {
        if let Some(entry) = self.streams.get(&stream) {
            if entry.is_closed() {
                self.streams.remove(&stream);
            }
        }
    }

    // -- Receiving --

    /// Feed bytes from the transport. Decoded activity is queued as events;
    /// a returned error is connection-fatal.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.in_buf.extend_from_slice(bytes);
        loop {
            let parsed = Frame::parse(&self.in_buf, self.local.max_frame_size)?;
            match parsed {
                Some((frame, used)) => {
                    self.in_buf.drain(..used);
                    self.apply(frame)?;
                }
                None => return Ok(()),
            }
        }
    }

    pub fn next_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn apply(&mut self, frame: Frame) -> Result<(), Error> {
        if let Some(expected) = self.continuation {
            match &frame {
                Frame::Continuation { stream, .. } if *stream == expected => {}
                _ => return Err(Error::protocol("header block interrupted")),
            }
        }

        match frame {
            Frame::Settings { ack, settings } => self.on_settings(ack, settings)?,
            Frame::Headers {
                stream,
                block,
                end_stream,
                end_headers,
            } => self.on_headers(stream, block, end_stream, end_headers)?,
            Frame::Continuation {
                stream,
                block,
                end_headers,
            } => self.on_continuation(stream, block, end_headers)?,
            Frame::Data {
                stream,
                data,
                end_stream,
            } => self.on_data(stream, data, end_stream)?,
            Frame::WindowUpdate { stream, increment } => {
                if stream == 0 {
                    self.send_window.grant(increment)?;
                } else if let Some(entry) = self.streams.get_mut(&stream) {
                    entry.send_window.grant(increment)?;
                }
            }
            Frame::RstStream { stream, code } => {
                if let Some(entry) = self.streams.get_mut(&stream) {
                    entry.state = StreamState::Closed;
                }
                self.events.push_back(Event::Reset { stream, code });
            }
            Frame::Ping { ack, payload } => {
                if !ack {
                    Frame::Ping { ack: true, payload }.write(&mut self.out_buf);
                }
            }
            Frame::GoAway {
                last_stream,
                code,
                debug,
            } => self.on_goaway(last_stream, code, debug),
            Frame::PushPromise {
                stream,
                promised,
                block,
                end_headers,
            } => {
                // Push is disabled in our SETTINGS; a compliant peer never
                // sends this. The block still has to run through the decoder
                // to keep HPACK state coherent before we object.
                if !end_headers {
                    return Err(Error::protocol("fragmented PUSH_PROMISE"));
                }
                let fields = self.decoder.decode(&block).map_err(|_| Error::Compression)?;
                if !self.local.enable_push {
                    return Err(Error::protocol("PUSH_PROMISE with push disabled"));
                }
                self.events.push_back(Event::PushPromise {
                    stream,
                    promised,
                    fields,
                });
            }
            Frame::AltSvc { origin, value, .. } => {
                self.events.push_back(Event::AltSvc { origin, value });
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => {}
        }
        Ok(())
    }

    fn on_settings(&mut self, ack: bool, settings: Settings) -> Result<(), Error> {
        if ack {
            self.events.push_back(Event::SettingsAcked);
            return Ok(());
        }

        // A change to the initial window resizes every open stream's send
        // window by the delta (RFC 7540 Section 6.9.2).
        let delta =
            i64::from(settings.initial_window_size) - i64::from(self.remote.initial_window_size);
        if delta != 0 {
            for entry in self.streams.values_mut() {
                if !entry.is_closed() {
                    entry.send_window.resize(delta)?;
                }
            }
        }

        self.encoder.resize(settings.header_table_size as usize);
        self.remote = settings.clone();

        Frame::Settings {
            ack: true,
            settings: Settings::default(),
        }
        .write(&mut self.out_buf);

        if self.state == State::AwaitingSettings {
            self.state = State::Ready;
        }
        self.events.push_back(Event::RemoteSettings(settings));
        Ok(())
    }

    fn on_headers(
        &mut self,
        stream: u32,
        block: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
    ) -> Result<(), Error> {
        let Some(entry) = self.streams.get_mut(&stream) else {
            // Stale stream (already reset and forgotten); the block still
            // must pass through the decoder.
            if end_headers {
                self.decoder.decode(&block)?;
            } else {
                return Err(Error::protocol("fragmented block on unknown stream"));
            }
            return Ok(());
        };

        if end_headers {
            let mut full = std::mem::take(&mut entry.block);
            full.extend_from_slice(&block);
            self.deliver_block(stream, &full, end_stream)?;
        } else {
            entry.block = block;
            entry.block_end_stream = end_stream;
            self.continuation = Some(stream);
        }
        Ok(())
    }

    fn on_continuation(
        &mut self,
        stream: u32,
        block: Vec<u8>,
        end_headers: bool,
    ) -> Result<(), Error> {
        let Some(entry) = self.streams.get_mut(&stream) else {
            return Err(Error::protocol("CONTINUATION for unknown stream"));
        };
        entry.block.extend_from_slice(&block);
        if end_headers {
            self.continuation = None;
            let (full, end_stream) = {
                let entry = self.streams.get_mut(&stream).expect("stream just seen");
                (std::mem::take(&mut entry.block), entry.block_end_stream)
            };
            self.deliver_block(stream, &full, end_stream)?;
        }
        Ok(())
    }

    fn deliver_block(&mut self, stream: u32, block: &[u8], end_stream: bool) -> Result<(), Error> {
        let fields = self.decoder.decode(block)?;
        let Some(entry) = self.streams.get_mut(&stream) else {
            return Ok(());
        };

        // Interim responses (1xx) do not occupy the headers slot; the real
        // response block still counts as initial when it arrives.
        let interim = fields
            .iter()
            .find(|f| f.name == b":status")
            .map_or(false, |f| f.value.first() == Some(&b'1'));
        let initial = !entry.got_headers;
        if !interim {
            entry.got_headers = true;
        }
        if end_stream {
            entry.close_remote();
        }

        if initial {
            self.events.push_back(Event::Headers {
                stream,
                fields,
                end_stream,
            });
        } else {
            self.events.push_back(Event::Trailers { stream, fields });
        }
        Ok(())
    }

    fn on_data(&mut self, stream: u32, data: Vec<u8>, end_stream: bool) -> Result<(), Error> {
        // Connection-level accounting applies even to unknown streams.
        if !data.is_empty() {
            self.recv_window.charge(data.len())?;
        }
        let Some(entry) = self.streams.get_mut(&stream) else {
            // Already reset locally; silently return the credit.
            self.release_connection_only(data.len());
            return Ok(());
        };
        if !data.is_empty() {
            entry.recv_window.charge(data.len())?;
        }
        if end_stream {
            entry.close_remote();
        }
        self.events.push_back(Event::Data {
            stream,
            data,
            end_stream,
        });
        Ok(())
    }

    fn release_connection_only(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let threshold = (self.local.initial_window_size / 2).max(1);
        self.released = self.released.saturating_add(n as u32);
        if self.released >= threshold {
            let increment = self.released;
            Frame::WindowUpdate {
                stream: 0,
                increment,
            }
            .write(&mut self.out_buf);
            let _ = self.recv_window.grant(increment);
            self.released = 0;
        }
    }

    fn on_goaway(&mut self, last_stream: u32, code: ErrorCode, debug: Vec<u8>) {
        self.state = State::Closing;
        self.goaway = Some(last_stream);
        // Streams the server will never process are refused; the caller can
        // safely retry them elsewhere.
        let refused: Vec<u32> = self
            .streams
            .iter()
            .filter(|(id, s)| **id > last_stream && !s.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in refused {
            if let Some(entry) = self.streams.get_mut(&id) {
                entry.state = StreamState::Closed;
            }
            self.events.push_back(Event::Reset {
                stream: id,
                code: ErrorCode::RefusedStream,
            });
        }
        self.events.push_back(Event::GoAway {
            last_stream,
            code,
            debug,
        });
    }
}
