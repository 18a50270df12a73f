//! Full client-connection exchanges against hand-built server frames.

use skein_h2::{Conn, Encoder, ErrorCode, Event, Field, Frame, Settings};

fn server_settings() -> Vec<u8> {
    let mut buf = Vec::new();
    Frame::Settings {
        ack: false,
        settings: Settings::default(),
    }
    .write(&mut buf);
    buf
}

fn ready_conn() -> Conn {
    let mut conn = Conn::new(Settings::client());
    let _ = conn.take_output(usize::MAX);
    conn.feed(&server_settings()).unwrap();
    let _ = conn.take_output(usize::MAX);
    conn
}

fn get_request(authority: &str, path: &str) -> Vec<Field> {
    vec![
        Field::new(b":method".as_slice(), b"GET".as_slice()),
        Field::new(b":scheme".as_slice(), b"https".as_slice()),
        Field::new(b":authority".as_slice(), authority.as_bytes()),
        Field::new(b":path".as_slice(), path.as_bytes()),
    ]
}

#[test]
fn request_body_response_cycle() {
    let mut conn = ready_conn();

    let mut fields = get_request("origin.test", "/upload");
    fields[0] = Field::new(b":method".as_slice(), b"POST".as_slice());
    let stream = conn.open_request(&fields, false).unwrap();
    let sent = conn.send_data(stream, b"request payload", true).unwrap();
    assert_eq!(sent, 15);
    assert!(conn.has_output());
    let _ = conn.take_output(usize::MAX);

    // Server: headers, two data frames, trailers.
    let mut encoder = Encoder::new(4096);
    let mut wire = Vec::new();
    let mut block = Vec::new();
    encoder.encode(
        &[
            Field::new(b":status".as_slice(), b"200".as_slice()),
            Field::new(b"content-type".as_slice(), b"application/octet-stream".as_slice()),
        ],
        &mut block,
    );
    Frame::Headers {
        stream,
        block,
        end_stream: false,
        end_headers: true,
    }
    .write(&mut wire);
    Frame::Data {
        stream,
        data: b"part one ".to_vec(),
        end_stream: false,
    }
    .write(&mut wire);
    Frame::Data {
        stream,
        data: b"part two".to_vec(),
        end_stream: false,
    }
    .write(&mut wire);
    let mut trailer_block = Vec::new();
    encoder.encode(
        &[Field::new(b"x-checksum".as_slice(), b"abc123".as_slice())],
        &mut trailer_block,
    );
    Frame::Headers {
        stream,
        block: trailer_block,
        end_stream: true,
        end_headers: true,
    }
    .write(&mut wire);

    conn.feed(&wire).unwrap();

    match conn.next_event().unwrap() {
        Event::Headers {
            stream: s,
            fields,
            end_stream,
        } => {
            assert_eq!(s, stream);
            assert!(!end_stream);
            assert!(fields.contains(&Field::new(b":status".as_slice(), b"200".as_slice())));
        }
        other => panic!("unexpected {other:?}"),
    }
    let mut body = Vec::new();
    for _ in 0..2 {
        match conn.next_event().unwrap() {
            Event::Data { data, .. } => body.extend_from_slice(&data),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(body, b"part one part two");
    match conn.next_event().unwrap() {
        Event::Trailers { fields, .. } => {
            assert_eq!(fields[0], Field::new(b"x-checksum".as_slice(), b"abc123".as_slice()));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(conn.open_streams(), 0);
}

#[test]
fn window_exhaustion_and_refill() {
    let mut conn = ready_conn();
    let stream = conn
        .open_request(&get_request("origin.test", "/big"), false)
        .unwrap();
    let _ = conn.take_output(usize::MAX);

    let payload = vec![7u8; 200_000];
    let mut sent = conn.send_data(stream, &payload, true).unwrap();
    assert_eq!(sent, 65_535, "both windows start at the protocol default");

    // Credit arrives in two steps; sending resumes each time.
    for _ in 0..3 {
        let mut wire = Vec::new();
        Frame::WindowUpdate {
            stream: 0,
            increment: 65_535,
        }
        .write(&mut wire);
        Frame::WindowUpdate {
            stream,
            increment: 65_535,
        }
        .write(&mut wire);
        conn.feed(&wire).unwrap();
        sent += conn.send_data(stream, &payload[sent..], true).unwrap();
        if sent == payload.len() {
            break;
        }
    }
    assert_eq!(sent, payload.len());
}

#[test]
fn interim_response_does_not_eat_the_headers_slot() {
    let mut conn = ready_conn();
    let stream = conn
        .open_request(&get_request("origin.test", "/expect"), false)
        .unwrap();
    let _ = conn.take_output(usize::MAX);

    let mut encoder = Encoder::new(4096);
    let mut wire = Vec::new();
    let mut interim = Vec::new();
    encoder.encode(&[Field::new(b":status".as_slice(), b"100".as_slice())], &mut interim);
    Frame::Headers {
        stream,
        block: interim,
        end_stream: false,
        end_headers: true,
    }
    .write(&mut wire);
    let mut real = Vec::new();
    encoder.encode(&[Field::new(b":status".as_slice(), b"204".as_slice())], &mut real);
    Frame::Headers {
        stream,
        block: real,
        end_stream: true,
        end_headers: true,
    }
    .write(&mut wire);
    conn.feed(&wire).unwrap();

    // Both blocks surface as Headers, never as Trailers.
    for expected in ["100", "204"] {
        match conn.next_event().unwrap() {
            Event::Headers { fields, .. } => {
                assert!(fields
                    .contains(&Field::new(b":status".as_slice(), expected.as_bytes())));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn reset_stream_surfaces_and_closes() {
    let mut conn = ready_conn();
    let stream = conn
        .open_request(&get_request("origin.test", "/"), true)
        .unwrap();
    let _ = conn.take_output(usize::MAX);

    let mut wire = Vec::new();
    Frame::RstStream {
        stream,
        code: ErrorCode::Internal,
    }
    .write(&mut wire);
    conn.feed(&wire).unwrap();

    match conn.next_event().unwrap() {
        Event::Reset { stream: s, code } => {
            assert_eq!(s, stream);
            assert_eq!(code, ErrorCode::Internal);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(conn.open_streams(), 0);
}
