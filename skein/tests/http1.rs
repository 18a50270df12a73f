//! End-to-end HTTP/1.1 tests against thread-local origin servers.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::JoinHandle;

use skein::{ErrorKind, Method, Options, Request, Session, Version};

/// One parsed request as the origin saw it.
struct SeenRequest {
    head: String,
    body: Vec<u8>,
}

impl SeenRequest {
    fn line(&self) -> &str {
        self.head.lines().next().unwrap_or("")
    }

    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{name}:");
        self.head
            .lines()
            .find(|l| l.to_ascii_lowercase().starts_with(&prefix))
            .map(|l| l[prefix.len()..].trim().to_string())
    }
}

/// Read request head lines up to the blank line.
fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) => return None,
            Ok(_) => raw.push(byte[0]),
            Err(_) => return None,
        }
    }
    Some(String::from_utf8_lossy(&raw).into_owned())
}

/// Read one request (head + content-length body) off the stream.
fn read_request(stream: &mut TcpStream) -> Option<SeenRequest> {
    let head = read_head(stream)?;
    let content_length: usize = head
        .lines()
        .find(|l| l.to_ascii_lowercase().starts_with("content-length:"))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        stream.read_exact(&mut body).ok()?;
    }
    Some(SeenRequest { head, body })
}

/// Spawn an origin handling connections with `serve` until it returns
/// false. Returns the address and the join handle producing what was seen.
fn origin<F>(mut serve: F) -> (SocketAddr, JoinHandle<Vec<SeenRequest>>)
where
    F: FnMut(&mut TcpStream, &mut Vec<SeenRequest>, usize) -> bool + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let mut seen = Vec::new();
        let mut conn = 0;
        loop {
            let (mut stream, _) = listener.accept().unwrap();
            let keep_going = serve(&mut stream, &mut seen, conn);
            conn += 1;
            if !keep_going {
                return seen;
            }
        }
    });
    (addr, handle)
}

fn session() -> Session {
    Session::new(Options::default()).unwrap()
}

#[test]
fn get_round_trip() {
    let (addr, server) = origin(|stream, seen, _| {
        let req = read_request(stream).unwrap();
        seen.push(req);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nhi")
            .unwrap();
        false
    });

    let mut session = session();
    let mut response = session.get(&format!("http://{addr}/")).unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.version(), Version::Http11);
    assert_eq!(response.text().unwrap(), "hi");

    let seen = server.join().unwrap();
    assert_eq!(seen[0].line(), "GET / HTTP/1.1");
    assert!(seen[0].header("host").is_some());
    assert!(seen[0].header("user-agent").unwrap().starts_with("skein/"));
}

#[test]
fn head_has_length_but_no_body() {
    let (addr, server) = origin(|stream, seen, _| {
        seen.push(read_request(stream).unwrap());
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n")
            .unwrap();
        false
    });

    let mut session = session();
    let response = session.head(&format!("http://{addr}/")).unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.content_length(), Some(5));
    assert!(response.body().is_empty());
    assert_eq!(server.join().unwrap()[0].line(), "HEAD / HTTP/1.1");
}

#[test]
fn post_json_carries_content_type_and_body() {
    let (addr, server) = origin(|stream, seen, _| {
        seen.push(read_request(stream).unwrap());
        stream
            .write_all(b"HTTP/1.1 201 Created\r\ncontent-length: 0\r\n\r\n")
            .unwrap();
        false
    });

    let mut session = session();
    let request = Request::new(Method::Post, &format!("http://{addr}/e"))
        .unwrap()
        .json(&serde_json::json!({"a": "b"}))
        .unwrap();
    let response = session.send(request).unwrap();
    assert_eq!(response.status(), 201);

    let seen = server.join().unwrap();
    assert_eq!(seen[0].header("content-type").as_deref(), Some("application/json"));
    assert_eq!(seen[0].body, br#"{"a":"b"}"#);
}

#[test]
fn batch_on_one_channel_answers_in_order() {
    let (addr, server) = origin(|stream, seen, _| {
        for i in 0..3 {
            let Some(req) = read_request(stream) else { return false };
            seen.push(req);
            let body = format!("resp{i}");
            let msg = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(msg.as_bytes()).unwrap();
        }
        false
    });

    let mut session = session();
    let requests = (0..3)
        .map(|i| Request::new(Method::Get, &format!("http://{addr}/{i}")).unwrap())
        .collect();
    let outcomes = session.send_all(requests);
    assert_eq!(outcomes.len(), 3);
    for (i, outcome) in outcomes.into_iter().enumerate() {
        let mut response = outcome.unwrap();
        assert_eq!(response.text().unwrap(), format!("resp{i}"));
    }

    let seen = server.join().unwrap();
    let paths: Vec<&str> = seen.iter().map(|r| r.line()).collect();
    assert_eq!(paths, ["GET /0 HTTP/1.1", "GET /1 HTTP/1.1", "GET /2 HTTP/1.1"]);
}

#[test]
fn keep_alive_reuses_the_channel() {
    let (addr, server) = origin(|stream, seen, conn| {
        assert_eq!(conn, 0, "second connection should not happen");
        for _ in 0..2 {
            let Some(req) = read_request(stream) else { return false };
            seen.push(req);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .unwrap();
        }
        false
    });

    let mut session = session();
    for _ in 0..2 {
        let response = session.get(&format!("http://{addr}/")).unwrap();
        assert_eq!(response.status(), 200);
    }
    assert_eq!(server.join().unwrap().len(), 2);
}

#[test]
fn chunked_response_is_decoded() {
    let (addr, server) = origin(|stream, seen, _| {
        seen.push(read_request(stream).unwrap());
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n\
                  4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
            )
            .unwrap();
        false
    });

    let mut session = session();
    let mut response = session.get(&format!("http://{addr}/")).unwrap();
    assert_eq!(response.text().unwrap(), "Wikipedia");
    server.join().unwrap();
}

#[test]
fn peer_close_mid_pipeline_replays_remaining() {
    // First connection: answer one of three pipelined requests, then slam
    // the door. The rest must complete on a fresh connection.
    let (addr, server) = origin(|stream, seen, conn| {
        if conn == 0 {
            let req = read_request(stream).unwrap();
            seen.push(req);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\nA")
                .unwrap();
            // Drop the connection with the other requests unanswered.
            true
        } else {
            while let Some(req) = read_request(stream) {
                seen.push(req);
                stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1\r\n\r\nB")
                    .unwrap();
                if seen.len() >= 3 {
                    return false;
                }
            }
            true
        }
    });

    let options = Options::builder().pipelining().build().unwrap();
    let mut session = Session::new(options).unwrap();
    let requests = (0..3)
        .map(|i| Request::new(Method::Get, &format!("http://{addr}/{i}")).unwrap())
        .collect();
    let outcomes = session.send_all(requests);
    for outcome in outcomes {
        assert!(outcome.is_ok(), "{outcome:?}");
    }
    // All three eventually served.
    assert_eq!(server.join().unwrap().len(), 3);
}

#[test]
fn redirect_followed_when_enabled() {
    let (addr, server) = origin(|stream, seen, _| {
        // Same connection serves the redirect and the follow-up.
        let req = read_request(stream).unwrap();
        seen.push(req);
        stream
            .write_all(b"HTTP/1.1 302 Found\r\nlocation: /dest\r\ncontent-length: 0\r\n\r\n")
            .unwrap();
        let req = read_request(stream).unwrap();
        seen.push(req);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\ndone")
            .unwrap();
        false
    });

    let options = Options::builder().follow().build().unwrap();
    let mut session = Session::new(options).unwrap();
    let mut response = session.get(&format!("http://{addr}/start")).unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().unwrap(), "done");

    let seen = server.join().unwrap();
    assert_eq!(seen[0].line(), "GET /start HTTP/1.1");
    assert_eq!(seen[1].line(), "GET /dest HTTP/1.1");
}

#[test]
fn redirect_is_a_plain_response_by_default() {
    let (addr, server) = origin(|stream, _, _| {
        let _ = read_request(stream);
        stream
            .write_all(b"HTTP/1.1 302 Found\r\nlocation: /dest\r\ncontent-length: 0\r\n\r\n")
            .unwrap();
        false
    });

    let mut session = session();
    let response = session.get(&format!("http://{addr}/")).unwrap();
    assert_eq!(response.status(), 302);
    assert_eq!(response.header("location"), Some("/dest"));
    server.join().unwrap();
}

#[test]
fn expect_417_strips_header_and_resends_once() {
    let (addr, server) = origin(|stream, seen, conn| {
        if conn == 0 {
            let req = read_request(stream).unwrap();
            seen.push(req);
            stream
                .write_all(b"HTTP/1.1 417 Expectation Failed\r\ncontent-length: 0\r\n\r\n")
                .unwrap();
            true
        } else {
            let req = read_request(stream).unwrap();
            seen.push(req);
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .unwrap();
            false
        }
    });

    let mut session = session();
    let request = Request::new(Method::Post, &format!("http://{addr}/upload"))
        .unwrap()
        .header("expect", "100-continue")
        .body("payload");
    let response = session.send(request).unwrap();
    assert_eq!(response.status(), 200);

    let seen = server.join().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].header("expect").as_deref(), Some("100-continue"));
    assert!(seen[1].header("expect").is_none(), "expect must be stripped");
    assert_eq!(seen[1].body, b"payload");
}

#[test]
fn expect_100_continue_then_body() {
    let (addr, server) = origin(|stream, seen, _| {
        // Head only: the body is deliberately held back by the client.
        let head = read_head(stream).unwrap();
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();
        // Body arrives only after the interim response.
        let mut body = vec![0u8; 7];
        stream.read_exact(&mut body).unwrap();
        seen.push(SeenRequest { head, body });
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .unwrap();
        false
    });

    let mut session = session();
    let request = Request::new(Method::Post, &format!("http://{addr}/upload"))
        .unwrap()
        .header("expect", "100-continue")
        .body("payload");
    let response = session.send(request).unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(server.join().unwrap()[0].body, b"payload");
}

#[test]
fn cookies_flow_between_requests() {
    let (addr, server) = origin(|stream, seen, _| {
        let req = read_request(stream).unwrap();
        seen.push(req);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nset-cookie: sid=s3cr3t; Path=/\r\ncontent-length: 0\r\n\r\n")
            .unwrap();
        let req = read_request(stream).unwrap();
        seen.push(req);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
            .unwrap();
        false
    });

    let mut session = session();
    session.get(&format!("http://{addr}/login")).unwrap();
    session.get(&format!("http://{addr}/account")).unwrap();

    let seen = server.join().unwrap();
    assert!(seen[0].header("cookie").is_none());
    assert_eq!(seen[1].header("cookie").as_deref(), Some("sid=s3cr3t"));
}

#[test]
fn large_body_spills_to_disk_and_copies_back() {
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let body = payload.clone();
    let (addr, server) = origin(move |stream, _, _| {
        let _ = read_request(stream);
        let head = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", body.len());
        stream.write_all(head.as_bytes()).unwrap();
        stream.write_all(&body).unwrap();
        false
    });

    let mut overrides = skein::RequestOverrides::default();
    overrides.body_threshold_size = Some(1024);
    let mut session = session();
    let request = Request::new(Method::Get, &format!("http://{addr}/big"))
        .unwrap()
        .overrides(overrides);
    let mut response = session.send(request).unwrap();
    assert!(response.body().is_file_backed());
    assert_eq!(response.body().len(), payload.len() as u64);

    let mut copied = Vec::new();
    response.body_mut().copy_to(&mut copied).unwrap();
    assert_eq!(copied, payload);
    server.join().unwrap();
}

#[test]
fn http_status_errors_only_via_raise_for_status() {
    let (addr, server) = origin(|stream, _, _| {
        let _ = read_request(stream);
        stream
            .write_all(b"HTTP/1.1 503 Unavailable\r\ncontent-length: 0\r\n\r\n")
            .unwrap();
        false
    });

    let mut session = session();
    let response = session.get(&format!("http://{addr}/")).unwrap();
    assert_eq!(response.status(), 503);
    let err = response.raise_for_status().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Http);
    assert_eq!(err.status(), Some(503));
    server.join().unwrap();
}

#[test]
fn refused_connect_is_a_connect_error() {
    // Bind then drop, so the port is very likely closed.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let mut session = session();
    let outcome = session.send(Request::new(Method::Get, &format!("http://{addr}/")).unwrap());
    let err = outcome.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connect, "{err}");
}
