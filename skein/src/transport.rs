//! Non-blocking transports: plain TCP and TLS-over-TCP.
//!
//! Both expose the same surface: an idempotent [`poll_connect`] state
//! machine, `read` into a [`Buffer`], `write` from one, and the negotiated
//! application protocol once the connection is usable. TLS ciphertext moves
//! directly between rustls and the socket; the channel's buffers only ever
//! see plaintext.
//!
//! [`poll_connect`]: Transport::poll_connect

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ClientConnection};
use socket2::{Domain, Protocol as IpProtocol, Socket, Type};

use crate::buffer::Buffer;
use crate::stats;

/// Application protocol selected for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    H1,
    H2,
}

/// Transport failures, kept apart so TLS problems can surface as their own
/// error kind.
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    Tls(rustls::Error),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}

impl From<rustls::Error> for TransportError {
    fn from(e: rustls::Error) -> Self {
        TransportError::Tls(e)
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "{e}"),
            TransportError::Tls(e) => write!(f, "{e}"),
        }
    }
}

/// Result of a transport read.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes landed in the buffer.
    Data(usize),
    /// Nothing available right now.
    WouldBlock,
    /// Peer closed (EOF or reset).
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

pub struct TcpTransport {
    addr: SocketAddr,
    socket: Option<Socket>,
    state: TcpState,
}

impl TcpTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            socket: None,
            state: TcpState::Idle,
        }
    }

    /// Drive the connect state machine one step. `Ok(true)` once the socket
    /// is writable-connected. Safe to call repeatedly.
    pub fn poll_connect(&mut self) -> io::Result<bool> {
        match self.state {
            TcpState::Connected => Ok(true),
            TcpState::Failed => Err(io::Error::new(io::ErrorKind::Other, "connect failed")),
            TcpState::Idle => {
                stats::CONNECT_ATTEMPT.increment();
                let domain = match self.addr {
                    SocketAddr::V4(_) => Domain::IPV4,
                    SocketAddr::V6(_) => Domain::IPV6,
                };
                let socket = Socket::new(domain, Type::STREAM, Some(IpProtocol::TCP))?;
                socket.set_nonblocking(true)?;
                socket.set_nodelay(true)?;
                match socket.connect(&self.addr.into()) {
                    Ok(()) => {
                        self.state = TcpState::Connected;
                        stats::CONNECT_ESTABLISHED.increment();
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        self.state = TcpState::Connecting;
                    }
                    Err(e) => {
                        self.state = TcpState::Failed;
                        return Err(e);
                    }
                }
                self.socket = Some(socket);
                Ok(self.state == TcpState::Connected)
            }
            TcpState::Connecting => {
                let socket = self.socket.as_ref().expect("connecting without socket");
                if let Some(err) = socket.take_error()? {
                    self.state = TcpState::Failed;
                    return Err(err);
                }
                match socket.peer_addr() {
                    Ok(_) => {
                        self.state = TcpState::Connected;
                        stats::CONNECT_ESTABLISHED.increment();
                        Ok(true)
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.raw_os_error() == Some(libc::ENOTCONN) =>
                    {
                        Ok(false)
                    }
                    Err(e) => {
                        self.state = TcpState::Failed;
                        Err(e)
                    }
                }
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == TcpState::Connected
    }

    pub fn read(&mut self, buf: &mut Buffer) -> io::Result<ReadOutcome> {
        let socket = self.socket.as_mut().expect("read before connect");
        match buf.read_from(|spare| socket.read(spare)) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => {
                stats::BYTES_RX.add(n as u64);
                Ok(ReadOutcome::Data(n))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                Ok(ReadOutcome::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Write buffered bytes out; returns how many left the buffer
    /// (0 = would block).
    pub fn write(&mut self, buf: &mut Buffer) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let socket = self.socket.as_mut().expect("write before connect");
        let n = buf.write_to(|data| match socket.write(data) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        })?;
        stats::BYTES_TX.add(n as u64);
        Ok(n)
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }
}

pub struct TlsTransport {
    tcp: TcpTransport,
    session: Option<ClientConnection>,
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    handshake_done: bool,
    alpn_h2: bool,
    peer_cert: Option<CertificateDer<'static>>,
}

impl TlsTransport {
    pub fn new(addr: SocketAddr, config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self {
            tcp: TcpTransport::new(addr),
            session: None,
            config,
            server_name,
            handshake_done: false,
            alpn_h2: false,
            peer_cert: None,
        }
    }

    /// TCP connect, then the TLS handshake, one non-blocking step at a
    /// time. `Ok(true)` once application data can flow.
    pub fn poll_connect(&mut self) -> Result<bool, TransportError> {
        if self.handshake_done {
            return Ok(true);
        }
        if !self.tcp.poll_connect()? {
            return Ok(false);
        }
        if self.session.is_none() {
            self.session = Some(ClientConnection::new(
                self.config.clone(),
                self.server_name.clone(),
            )?);
        }
        self.pump_handshake()?;
        Ok(self.handshake_done)
    }

    fn pump_handshake(&mut self) -> Result<(), TransportError> {
        let session = self.session.as_mut().expect("handshake without session");
        let socket = self.tcp.socket.as_mut().expect("handshake without socket");

        loop {
            let mut progressed = false;
            while session.wants_write() {
                match session.write_tls(socket) {
                    Ok(0) => break,
                    Ok(_) => progressed = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e.into()),
                }
            }
            if session.wants_read() {
                match session.read_tls(socket) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed during TLS handshake",
                        )
                        .into());
                    }
                    Ok(_) => {
                        session.process_new_packets()?;
                        progressed = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e.into()),
                }
            }
            if !session.is_handshaking() {
                self.handshake_done = true;
                self.alpn_h2 = session.alpn_protocol() == Some(b"h2");
                self.peer_cert = session
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|c| c.clone().into_owned());
                stats::TLS_HANDSHAKE.increment();
                return Ok(());
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    pub fn read(&mut self, buf: &mut Buffer) -> Result<ReadOutcome, TransportError> {
        let session = self.session.as_mut().expect("read before handshake");
        let socket = self.tcp.socket.as_mut().expect("read before connect");

        // Pull ciphertext, decrypt, then drain plaintext into the buffer.
        let mut saw_eof = false;
        match session.read_tls(socket) {
            Ok(0) => saw_eof = true,
            Ok(n) => {
                stats::BYTES_RX.add(n as u64);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e)
                if e.kind() == io::ErrorKind::ConnectionReset
                    || e.kind() == io::ErrorKind::BrokenPipe =>
            {
                saw_eof = true
            }
            Err(e) => return Err(e.into()),
        }
        let state = session.process_new_packets()?;

        let mut total = 0;
        while !buf.is_full() {
            let mut reader = session.reader();
            match buf.read_from(|spare| reader.read(spare)) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }

        if total > 0 {
            Ok(ReadOutcome::Data(total))
        } else if state.peer_has_closed() || saw_eof {
            Ok(ReadOutcome::Closed)
        } else {
            Ok(ReadOutcome::WouldBlock)
        }
    }

    pub fn write(&mut self, buf: &mut Buffer) -> Result<usize, TransportError> {
        let session = self.session.as_mut().expect("write before handshake");

        let taken = if buf.is_empty() {
            0
        } else {
            buf.write_to(|data| session.writer().write(data))?
        };

        let socket = self.tcp.socket.as_mut().expect("write before connect");
        while session.wants_write() {
            match session.write_tls(socket) {
                Ok(0) => break,
                Ok(n) => {
                    stats::BYTES_TX.add(n as u64);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(taken)
    }

    /// Ciphertext still queued inside rustls, wanting socket writability.
    pub fn wants_flush(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.wants_write())
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.tcp.fd()
    }
}

/// A connection's byte pipe: plain TCP or TLS.
pub enum Transport {
    Tcp(TcpTransport),
    Tls(Box<TlsTransport>),
}

impl Transport {
    pub fn tcp(addr: SocketAddr) -> Self {
        Transport::Tcp(TcpTransport::new(addr))
    }

    pub fn tls(addr: SocketAddr, config: Arc<ClientConfig>, name: ServerName<'static>) -> Self {
        Transport::Tls(Box::new(TlsTransport::new(addr, config, name)))
    }

    pub fn poll_connect(&mut self) -> Result<bool, TransportError> {
        match self {
            Transport::Tcp(t) => Ok(t.poll_connect()?),
            Transport::Tls(t) => t.poll_connect(),
        }
    }

    /// Negotiated application protocol. Plain TCP is always HTTP/1.1; TLS
    /// follows ALPN, defaulting to HTTP/1.1 when the server picked nothing.
    pub fn protocol(&self) -> Protocol {
        match self {
            Transport::Tcp(_) => Protocol::H1,
            Transport::Tls(t) => {
                if t.alpn_h2 {
                    Protocol::H2
                } else {
                    Protocol::H1
                }
            }
        }
    }

    pub fn read(&mut self, buf: &mut Buffer) -> Result<ReadOutcome, TransportError> {
        match self {
            Transport::Tcp(t) => Ok(t.read(buf)?),
            Transport::Tls(t) => t.read(buf),
        }
    }

    pub fn write(&mut self, buf: &mut Buffer) -> Result<usize, TransportError> {
        match self {
            Transport::Tcp(t) => Ok(t.write(buf)?),
            Transport::Tls(t) => t.write(buf),
        }
    }

    /// Transport-internal output pending, independent of the write buffer.
    pub fn wants_flush(&self) -> bool {
        match self {
            Transport::Tcp(_) => false,
            Transport::Tls(t) => t.wants_flush(),
        }
    }

    pub fn peer_cert(&self) -> Option<&CertificateDer<'static>> {
        match self {
            Transport::Tcp(_) => None,
            Transport::Tls(t) => t.peer_cert.as_ref(),
        }
    }

    pub fn fd(&self) -> Option<RawFd> {
        match self {
            Transport::Tcp(t) => t.fd(),
            Transport::Tls(t) => t.fd(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn tcp_connect_completes_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut transport = TcpTransport::new(addr);
        // Drive until connected; loopback finishes in a handful of polls.
        let mut done = transport.poll_connect().unwrap();
        for _ in 0..100 {
            if done {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
            done = transport.poll_connect().unwrap();
        }
        assert!(done);
        assert!(transport.fd().is_some());
    }

    #[test]
    fn tcp_round_trip_through_buffers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            peer.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            peer.write_all(b"world").unwrap();
        });

        let mut transport = TcpTransport::new(addr);
        while !transport.poll_connect().unwrap() {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let mut out = Buffer::new(64);
        out.append(b"hello").unwrap();
        while !out.is_empty() {
            transport.write(&mut out).unwrap();
        }

        let mut incoming = Buffer::new(64);
        loop {
            match transport.read(&mut incoming).unwrap() {
                ReadOutcome::Data(_) if incoming.len() >= 5 => break,
                ReadOutcome::Closed => break,
                _ => std::thread::sleep(std::time::Duration::from_millis(1)),
            }
        }
        assert_eq!(incoming.view(), b"world");
        server.join().unwrap();
    }

    #[test]
    fn refused_connect_errors() {
        // Port 1 on loopback is almost certainly closed; the error may
        // surface on the first poll or the next one.
        let mut transport = TcpTransport::new("127.0.0.1:1".parse().unwrap());
        let mut result = transport.poll_connect();
        for _ in 0..200 {
            match &result {
                Ok(false) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    result = transport.poll_connect();
                }
                _ => break,
            }
        }
        assert!(result.is_err());
    }
}
