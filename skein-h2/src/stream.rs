//! Per-stream bookkeeping (RFC 7540 Section 5.1).

use crate::window::Window;

/// Lifecycle of a client-initiated stream. Client streams skip `idle`: the
/// entry is created at the moment HEADERS goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

#[derive(Debug)]
pub(crate) struct Stream {
    pub state: StreamState,
    pub recv_window: Window,
    pub send_window: Window,
    /// Header block fragments across HEADERS + CONTINUATION.
    pub block: Vec<u8>,
    /// END_STREAM flag seen on the HEADERS that started `block`.
    pub block_end_stream: bool,
    /// Initial response headers already delivered; later blocks are trailers.
    pub got_headers: bool,
    /// Body bytes consumed by the application but not yet returned to the
    /// peer as WINDOW_UPDATE credit.
    pub released: u32,
}

impl Stream {
    pub fn new(recv_window: i64, send_window: i64) -> Self {
        Self {
            state: StreamState::Open,
            recv_window: Window::new(recv_window),
            send_window: Window::new(send_window),
            block: Vec::new(),
            block_end_stream: false,
            got_headers: false,
            released: 0,
        }
    }

    /// We sent END_STREAM.
    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedRemote | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedLocal,
        };
    }

    /// Peer sent END_STREAM.
    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::HalfClosedLocal | StreamState::Closed => StreamState::Closed,
            _ => StreamState::HalfClosedRemote,
        };
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn can_send_data(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_both_sides() {
        let mut s = Stream::new(65_535, 65_535);
        assert!(s.can_send_data());
        s.close_local();
        assert_eq!(s.state, StreamState::HalfClosedLocal);
        assert!(!s.can_send_data());
        s.close_remote();
        assert!(s.is_closed());
    }

    #[test]
    fn close_order_is_symmetric() {
        let mut s = Stream::new(65_535, 65_535);
        s.close_remote();
        assert_eq!(s.state, StreamState::HalfClosedRemote);
        assert!(s.can_send_data());
        s.close_local();
        assert!(s.is_closed());
    }
}
