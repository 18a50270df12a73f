//! Sans-IO HTTP/2 client framing.
//!
//! No sockets, no clocks, no dependencies: [`Conn`] is a pure state machine.
//! Bytes from the transport go in through [`Conn::feed`], wire output comes
//! back out through [`Conn::take_output`], and decoded activity is drained
//! from [`Conn::next_event`]. The embedding client decides when to move
//! bytes, which makes the machine equally usable from a readiness loop, a
//! completion loop, or a test harness feeding hand-built frames.
//!
//! # Example
//!
//! ```rust,ignore
//! use skein_h2::{Conn, Event, Field, Settings};
//!
//! let mut conn = Conn::new(Settings::client());
//! transport_send(&conn.take_output(usize::MAX)); // preface + SETTINGS
//!
//! conn.feed(&transport_recv())?;                 // server SETTINGS
//! let stream = conn.open_request(&[
//!     Field::new(b":method", b"GET"),
//!     Field::new(b":scheme", b"https"),
//!     Field::new(b":authority", b"example.com"),
//!     Field::new(b":path", b"/"),
//! ], true)?;
//! transport_send(&conn.take_output(usize::MAX));
//!
//! conn.feed(&transport_recv())?;
//! while let Some(event) = conn.next_event() {
//!     match event {
//!         Event::Headers { stream, fields, .. } => { /* ... */ }
//!         Event::Data { stream, data, .. } => {
//!             // Hand the bytes to the application, then return the
//!             // flow-control credit.
//!             conn.release(stream, data.len());
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! Received DATA does not refresh the peer's window by itself; call
//! [`Conn::release`] as the application consumes body bytes. A reader that
//! stalls therefore stalls the sender, which is the point.

mod conn;
mod error;
mod frame;
mod hpack;
mod settings;
mod stream;
mod window;

pub use conn::{Conn, Event};
pub use error::{Error, ErrorCode};
pub use frame::{Frame, FrameHead};
pub use hpack::{Decoder, Encoder, Field};
pub use settings::Settings;
pub use stream::StreamState;
pub use window::Window;
