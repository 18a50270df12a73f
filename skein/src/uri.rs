//! Minimal URI handling: just what an HTTP client needs.
//!
//! Parses `scheme://host[:port]/path[?query]` with IPv6 literals in
//! brackets. No userinfo, no fragments kept, no normalization beyond the
//! default port and an implied "/" path.

use std::fmt;
use std::net::IpAddr;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_tls(self) -> bool {
        self == Scheme::Https
    }
}

/// The pool key: where a connection terminates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

impl Uri {
    pub fn parse(input: &str) -> Result<Uri, Error> {
        let bad = || Error::InvalidUri(input.to_string());

        let (scheme, rest) = if let Some(rest) = input.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else if let Some(rest) = input.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else {
            return Err(bad());
        };

        // Authority runs to the first '/', '?' or '#'.
        let authority_end = rest
            .find(|c| c == '/' || c == '?' || c == '#')
            .unwrap_or(rest.len());
        let authority = &rest[..authority_end];
        let tail = &rest[authority_end..];
        if authority.is_empty() || authority.contains('@') {
            return Err(bad());
        }

        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            // IPv6 literal: [::1] or [::1]:8080
            let close = v6.find(']').ok_or_else(bad)?;
            let host = &v6[..close];
            let port = match &v6[close + 1..] {
                "" => scheme.default_port(),
                p => p
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(bad)?,
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => {
                    (host.to_string(), port.parse().map_err(|_| bad())?)
                }
                None => (authority.to_string(), scheme.default_port()),
            }
        };
        if host.is_empty() {
            return Err(bad());
        }

        // Drop any fragment, then split path from query.
        let tail = tail.split('#').next().unwrap_or("");
        let (path, query) = match tail.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (tail, None),
        };
        let path = if path.is_empty() { "/" } else { path };

        Ok(Uri {
            scheme,
            host: host.to_ascii_lowercase(),
            port,
            path: path.to_string(),
            query: query.filter(|q| !q.is_empty()),
        })
    }

    pub fn origin(&self) -> Origin {
        Origin {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn is_ip_literal(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Value for the Host header / :authority pseudo-header.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }

    /// Origin-form request target: path plus query.
    pub fn request_target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{q}", self.path),
            None => self.path.clone(),
        }
    }

    /// Absolute-form target, used when speaking through a forward proxy.
    pub fn absolute_form(&self) -> String {
        format!(
            "{}://{}{}",
            self.scheme.as_str(),
            self.authority(),
            self.request_target()
        )
    }

    /// Append query-string pairs, percent-encoded.
    pub fn append_params(&mut self, params: &[(String, String)]) {
        if params.is_empty() {
            return;
        }
        let mut extra = String::new();
        for (i, (k, v)) in params.iter().enumerate() {
            if i > 0 {
                extra.push('&');
            }
            extra.push_str(&encode_component(k));
            extra.push('=');
            extra.push_str(&encode_component(v));
        }
        self.query = Some(match self.query.take() {
            Some(q) => format!("{q}&{extra}"),
            None => extra,
        });
    }

    /// Resolve a Location header against this URI.
    pub fn join(&self, location: &str) -> Result<Uri, Error> {
        if location.starts_with("http://") || location.starts_with("https://") {
            return Uri::parse(location);
        }
        let mut next = self.clone();
        next.query = None;
        if let Some(abs) = location.strip_prefix('/') {
            let (path, query) = split_target(abs);
            next.path = format!("/{path}");
            next.query = query;
        } else {
            // Relative reference: replace the last path segment.
            let base = self.path.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
            let (path, query) = split_target(location);
            next.path = format!("{base}/{path}");
            next.query = query;
        }
        Ok(next)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.absolute_form())
    }
}

fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    }
}

/// Percent-encode a query component (RFC 3986 unreserved set passes).
pub fn encode_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push_str("%20"),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Serialize pairs as application/x-www-form-urlencoded.
pub fn encode_form(pairs: &[(String, String)]) -> String {
    let mut out = String::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(&encode_component(k));
        out.push('=');
        out.push_str(&encode_component(v));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let uri = Uri::parse("http://example.com/a/b?x=1").unwrap();
        assert_eq!(uri.scheme, Scheme::Http);
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 80);
        assert_eq!(uri.path, "/a/b");
        assert_eq!(uri.query.as_deref(), Some("x=1"));
    }

    #[test]
    fn parse_defaults() {
        let uri = Uri::parse("https://example.com").unwrap();
        assert_eq!(uri.port, 443);
        assert_eq!(uri.path, "/");
        assert_eq!(uri.query, None);
        assert_eq!(uri.request_target(), "/");
    }

    #[test]
    fn parse_explicit_port() {
        let uri = Uri::parse("http://localhost:8080/x").unwrap();
        assert_eq!(uri.port, 8080);
        assert_eq!(uri.authority(), "localhost:8080");
    }

    #[test]
    fn parse_ipv6_literal() {
        let uri = Uri::parse("http://[::1]:9000/z").unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.port, 9000);
        assert!(uri.is_ip_literal());
        assert_eq!(uri.authority(), "[::1]:9000");
    }

    #[test]
    fn authority_hides_default_port() {
        let uri = Uri::parse("https://example.com:443/").unwrap();
        assert_eq!(uri.authority(), "example.com");
        let uri = Uri::parse("https://example.com:8443/").unwrap();
        assert_eq!(uri.authority(), "example.com:8443");
    }

    #[test]
    fn rejects_garbage() {
        assert!(Uri::parse("ftp://example.com/").is_err());
        assert!(Uri::parse("http://").is_err());
        assert!(Uri::parse("http://user@example.com/").is_err());
        assert!(Uri::parse("example.com/plain").is_err());
    }

    #[test]
    fn params_are_encoded_and_appended() {
        let mut uri = Uri::parse("http://h/search?q=base").unwrap();
        uri.append_params(&[("lang".into(), "en US".into()), ("k".into(), "a&b".into())]);
        assert_eq!(uri.query.as_deref(), Some("q=base&lang=en%20US&k=a%26b"));
    }

    #[test]
    fn join_absolute_location() {
        let uri = Uri::parse("http://a.example/x").unwrap();
        let next = uri.join("https://b.example/y").unwrap();
        assert_eq!(next.scheme, Scheme::Https);
        assert_eq!(next.host, "b.example");
    }

    #[test]
    fn join_rooted_and_relative() {
        let uri = Uri::parse("http://a.example/dir/page?old=1").unwrap();
        let rooted = uri.join("/other?n=2").unwrap();
        assert_eq!(rooted.path, "/other");
        assert_eq!(rooted.query.as_deref(), Some("n=2"));
        assert_eq!(rooted.host, "a.example");

        let relative = uri.join("sibling").unwrap();
        assert_eq!(relative.path, "/dir/sibling");
        assert_eq!(relative.query, None);
    }

    #[test]
    fn form_encoding() {
        let body = encode_form(&[("a".into(), "1+2".into()), ("b".into(), "x y".into())]);
        assert_eq!(body, "a=1%2B2&b=x%20y");
    }

    #[test]
    fn absolute_form_round_trips() {
        let uri = Uri::parse("http://example.com:8080/p?q=1").unwrap();
        assert_eq!(uri.absolute_form(), "http://example.com:8080/p?q=1");
    }
}
