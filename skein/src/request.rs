//! Request model: method, URI, headers, body, and per-request overrides.

use std::collections::VecDeque;

use bytes::Bytes;
use serde::Serialize;

use crate::error::Error;
use crate::headers::HeaderMap;
use crate::options::RequestOverrides;
use crate::uri::{self, Uri};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Trace,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
        }
    }

    /// HEAD responses never carry a body, whatever the headers claim.
    pub fn expects_response_body(self) -> bool {
        self != Method::Head
    }
}

/// Lifecycle of a request inside an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Not yet handed to an engine, or returned for replay.
    Idle,
    /// Request line / HEADERS going out.
    Headers,
    /// Body going out.
    Body,
    /// Fully written; awaiting or reading the response.
    Done,
    /// Waiting on a 100-continue round trip.
    Expects,
}

/// Request body. Either a known-size byte run or a chunk sequence with no
/// declared length (chunked transfer / open-ended DATA).
#[derive(Debug, Clone, Default)]
pub enum Body {
    #[default]
    Empty,
    Bytes(Bytes),
    Chunks(VecDeque<Bytes>),
}

impl Body {
    /// Declared size, when the body can state one up-front.
    pub fn size(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(b) => Some(b.len()),
            Body::Chunks(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(b) => b.is_empty(),
            Body::Chunks(c) => c.iter().all(|b| b.is_empty()),
        }
    }

    /// Chunked drain: the bytes at `cursor`, or `None` past the end.
    pub fn chunk_at(&self, cursor: usize) -> Option<&[u8]> {
        match self {
            Body::Empty => None,
            Body::Bytes(b) => {
                if cursor < b.len() {
                    Some(&b[cursor..])
                } else {
                    None
                }
            }
            Body::Chunks(chunks) => {
                let mut skip = cursor;
                for chunk in chunks {
                    if skip < chunk.len() {
                        return Some(&chunk[skip..]);
                    }
                    skip -= chunk.len();
                }
                None
            }
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        if v.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(Bytes::from(v))
        }
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::from(s.as_bytes().to_vec())
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(b)
        }
    }
}

/// An HTTP request. Built up front, then immutable once it enters the
/// session (engines only advance a drain cursor held elsewhere).
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Body,
    pub overrides: RequestOverrides,
}

impl Request {
    pub fn new(method: Method, uri: &str) -> Result<Self, Error> {
        Ok(Self {
            method,
            uri: Uri::parse(uri)?,
            headers: HeaderMap::new(),
            body: Body::Empty,
            overrides: RequestOverrides::default(),
        })
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.set(name, value);
        self
    }

    /// Append query-string parameters to the URI.
    pub fn params(mut self, pairs: &[(&str, &str)]) -> Self {
        let owned: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.uri.append_params(&owned);
        self
    }

    /// Raw body bytes.
    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// JSON body with the matching content type.
    pub fn json<T: Serialize>(mut self, value: &T) -> Result<Self, Error> {
        let bytes = serde_json::to_vec(value)?;
        self.headers.set("content-type", "application/json");
        self.body = Body::from(bytes);
        Ok(self)
    }

    /// Form-encoded body with the matching content type.
    pub fn form(mut self, pairs: &[(&str, &str)]) -> Self {
        let owned: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.headers
            .set("content-type", "application/x-www-form-urlencoded");
        self.body = Body::from(uri::encode_form(&owned).into_bytes());
        self
    }

    /// A streaming body: chunks sent with chunked framing (HTTP/1.1) or as
    /// successive DATA frames (HTTP/2).
    pub fn chunked_body(mut self, chunks: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let chunks: VecDeque<Bytes> = chunks.into_iter().map(Bytes::from).collect();
        self.body = Body::Chunks(chunks);
        self
    }

    /// Per-request option overrides.
    pub fn overrides(mut self, overrides: RequestOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_sets_content_type_and_bytes() {
        let req = Request::new(Method::Post, "http://e/x")
            .unwrap()
            .json(&serde_json::json!({"a": "b"}))
            .unwrap();
        assert_eq!(req.headers.get("content-type"), Some("application/json"));
        match &req.body {
            Body::Bytes(b) => assert_eq!(&b[..], br#"{"a":"b"}"#),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn form_encodes_pairs() {
        let req = Request::new(Method::Post, "http://e/x")
            .unwrap()
            .form(&[("a", "1"), ("b", "x y")]);
        assert_eq!(
            req.headers.get("content-type"),
            Some("application/x-www-form-urlencoded")
        );
        match &req.body {
            Body::Bytes(b) => assert_eq!(&b[..], b"a=1&b=x%20y"),
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn params_extend_query() {
        let req = Request::new(Method::Get, "http://e/s?q=1")
            .unwrap()
            .params(&[("page", "2")]);
        assert_eq!(req.uri.query.as_deref(), Some("q=1&page=2"));
    }

    #[test]
    fn body_size_reporting() {
        assert_eq!(Body::Empty.size(), Some(0));
        assert_eq!(Body::from("abc").size(), Some(3));
        let chunks = Body::Chunks(VecDeque::from([Bytes::from("ab"), Bytes::from("cd")]));
        assert_eq!(chunks.size(), None);
    }

    #[test]
    fn chunk_cursor_walks_chunks() {
        let body = Body::Chunks(VecDeque::from([Bytes::from("abc"), Bytes::from("defg")]));
        assert_eq!(body.chunk_at(0), Some(&b"abc"[..]));
        assert_eq!(body.chunk_at(2), Some(&b"c"[..]));
        assert_eq!(body.chunk_at(3), Some(&b"defg"[..]));
        assert_eq!(body.chunk_at(6), Some(&b"g"[..]));
        assert_eq!(body.chunk_at(7), None);
    }

    #[test]
    fn head_expects_no_body() {
        assert!(!Method::Head.expects_response_body());
        assert!(Method::Get.expects_response_body());
    }
}
