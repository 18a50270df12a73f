//! Session-level resolver behavior: failures surface as error responses,
//! and the process-wide cache keeps repeat lookups off the wire.

use std::io::Write;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skein::{ErrorKind, Method, Options, Request, ResolverOptions, Session};

/// A nameserver that answers every A query with the given address and
/// counts queries.
fn spawn_counting_dns(answer: [u8; 4]) -> (SocketAddr, Arc<AtomicUsize>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        while let Ok((n, peer)) = socket.recv_from(&mut buf) {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut resp = Vec::new();
            resp.extend_from_slice(&buf[..2]);
            resp.extend_from_slice(&0x8180u16.to_be_bytes());
            resp.extend_from_slice(&1u16.to_be_bytes());
            resp.extend_from_slice(&1u16.to_be_bytes());
            resp.extend_from_slice(&[0; 4]);
            resp.extend_from_slice(&buf[12..n]);
            resp.extend_from_slice(&[0xc0, 0x0c, 0, 1, 0, 1, 0, 0, 1, 44, 0, 4]);
            resp.extend_from_slice(&answer);
            let _ = socket.send_to(&resp, peer);
        }
    });
    (addr, count)
}

fn session_with_ns(ns: SocketAddr, timeouts: Vec<Duration>) -> Session {
    let options = Options::builder()
        .resolver(ResolverOptions {
            nameservers: vec![ns],
            timeouts,
            ..Default::default()
        })
        .build()
        .unwrap();
    Session::new(options).unwrap()
}

#[test]
fn blackholed_nameserver_yields_resolve_error_after_retries() {
    // Bound but never answering.
    let blackhole = UdpSocket::bind("127.0.0.1:0").unwrap();
    let ns = blackhole.local_addr().unwrap();
    let mut session = session_with_ns(
        ns,
        vec![Duration::from_millis(100), Duration::from_millis(100)],
    );

    let start = Instant::now();
    let outcome = session.send(
        Request::new(Method::Get, "http://resolver-dark.skein.invalid/").unwrap(),
    );
    let elapsed = start.elapsed();
    let err = outcome.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Resolve, "{err}");
    assert!(
        elapsed >= Duration::from_millis(200),
        "gave up too early: {elapsed:?}"
    );
}

#[test]
fn cache_hit_keeps_second_lookup_off_the_wire() {
    // An HTTP origin the resolved address points at.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().unwrap();
            // Minimal read: wait for the blank line.
            let mut buf = [0u8; 1024];
            let mut seen = Vec::new();
            loop {
                use std::io::Read;
                let n = stream.read(&mut buf).unwrap();
                seen.extend_from_slice(&buf[..n]);
                if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nconnection: close\r\ncontent-length: 0\r\n\r\n")
                .unwrap();
        }
    });

    let (ns, count) = spawn_counting_dns([127, 0, 0, 1]);
    let host = "cache-prop.skein.invalid";

    // Two sessions: the cache is process-wide, so the second lookup never
    // reaches the nameserver.
    for _ in 0..2 {
        let mut session = session_with_ns(ns, vec![Duration::from_secs(2)]);
        let response = session
            .get(&format!("http://{host}:{port}/"))
            .unwrap();
        assert_eq!(response.status(), 200);
    }
    assert_eq!(count.load(Ordering::SeqCst), 1, "expected one wire query");
}

#[test]
fn system_resolver_handles_localhost() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        let mut seen = Vec::new();
        loop {
            use std::io::Read;
            let n = stream.read(&mut buf).unwrap();
            seen.extend_from_slice(&buf[..n]);
            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
            .unwrap();
    });

    let options = Options::builder()
        .resolver(ResolverOptions {
            kind: skein::ResolverKind::System,
            cache: false,
            ..Default::default()
        })
        .build()
        .unwrap();
    let mut session = Session::new(options).unwrap();
    let mut response = session.get(&format!("http://localhost:{port}/")).unwrap();
    assert_eq!(response.text().unwrap(), "ok");
}
