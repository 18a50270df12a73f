//! A small cookie jar: enough to carry sessions across requests.
//!
//! Parses the name/value plus the Domain, Path, and Secure attributes of a
//! Set-Cookie field. Expiry and Max-Age are honored only as far as
//! recognizing `Max-Age=0` deletions; a client-lifetime jar has no
//! persistence to age out of.

use crate::uri::{Scheme, Uri};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Cookie domain without a leading dot; `None` = exact request host.
    pub domain: Option<String>,
    pub path: String,
    pub secure: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: "/".to_string(),
            secure: false,
        }
    }

    fn matches(&self, uri: &Uri, request_host: &str) -> bool {
        if self.secure && uri.scheme != Scheme::Https {
            return false;
        }
        let domain_ok = match &self.domain {
            Some(domain) => {
                request_host == domain
                    || request_host
                        .strip_suffix(domain)
                        .is_some_and(|prefix| prefix.ends_with('.'))
            }
            None => request_host == uri.host,
        };
        if !domain_ok {
            return false;
        }
        uri.path == self.path
            || (uri.path.starts_with(&self.path)
                && (self.path.ends_with('/')
                    || uri.path.as_bytes().get(self.path.len()) == Some(&b'/')))
    }
}

#[derive(Debug, Default)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cookies(cookies: Vec<Cookie>) -> Self {
        Self { cookies }
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Record a Set-Cookie field received for `uri`.
    pub fn store(&mut self, uri: &Uri, set_cookie: &str) {
        let Some(cookie) = parse_set_cookie(uri, set_cookie) else {
            return;
        };
        // Same (name, domain, path) replaces.
        self.cookies.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });
        if !cookie.value.is_empty() {
            self.cookies.push(cookie);
        }
    }

    /// The Cookie header value for a request to `uri`, if any cookie applies.
    pub fn header_for(&self, uri: &Uri) -> Option<String> {
        let host = uri.host.as_str();
        let mut parts: Vec<String> = Vec::new();
        for cookie in &self.cookies {
            if cookie.matches(uri, host) {
                parts.push(format!("{}={}", cookie.name, cookie.value));
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("; "))
        }
    }
}

fn parse_set_cookie(uri: &Uri, input: &str) -> Option<Cookie> {
    let mut segments = input.split(';');
    let (name, value) = segments.next()?.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let mut cookie = Cookie::new(name, value.trim());
    let mut max_age_zero = false;
    for segment in segments {
        let (key, val) = match segment.split_once('=') {
            Some((k, v)) => (k.trim(), v.trim()),
            None => (segment.trim(), ""),
        };
        if key.eq_ignore_ascii_case("domain") {
            let domain = val.trim_start_matches('.').to_ascii_lowercase();
            // A server may only set cookies for its own host or a parent.
            let legal = uri.host == domain
                || uri
                    .host
                    .strip_suffix(&domain)
                    .is_some_and(|p| p.ends_with('.'));
            if legal && !domain.is_empty() {
                cookie.domain = Some(domain);
            }
        } else if key.eq_ignore_ascii_case("path") && val.starts_with('/') {
            cookie.path = val.to_string();
        } else if key.eq_ignore_ascii_case("secure") {
            cookie.secure = true;
        } else if key.eq_ignore_ascii_case("max-age") && val == "0" {
            max_age_zero = true;
        }
    }
    if max_age_zero {
        cookie.value = String::new();
    }
    Some(cookie)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Uri {
        Uri::parse(s).unwrap()
    }

    #[test]
    fn round_trip_same_host() {
        let mut jar = CookieJar::new();
        jar.store(&uri("http://example.com/login"), "sid=abc123; Path=/");
        assert_eq!(
            jar.header_for(&uri("http://example.com/account")),
            Some("sid=abc123".to_string())
        );
    }

    #[test]
    fn host_scoping_without_domain() {
        let mut jar = CookieJar::new();
        jar.store(&uri("http://example.com/"), "sid=1");
        assert_eq!(jar.header_for(&uri("http://other.com/")), None);
        assert_eq!(jar.header_for(&uri("http://sub.example.com/")), None);
    }

    #[test]
    fn domain_attribute_covers_subdomains() {
        let mut jar = CookieJar::new();
        jar.store(
            &uri("http://app.example.com/"),
            "sid=1; Domain=example.com",
        );
        assert!(jar.header_for(&uri("http://example.com/")).is_some());
        assert!(jar.header_for(&uri("http://api.example.com/")).is_some());
        assert!(jar.header_for(&uri("http://notexample.com/")).is_none());
    }

    #[test]
    fn foreign_domain_attribute_ignored() {
        let mut jar = CookieJar::new();
        jar.store(&uri("http://example.com/"), "sid=1; Domain=evil.com");
        // Falls back to host-only scoping.
        assert!(jar.header_for(&uri("http://evil.com/")).is_none());
        assert!(jar.header_for(&uri("http://example.com/")).is_some());
    }

    #[test]
    fn path_scoping() {
        let mut jar = CookieJar::new();
        jar.store(&uri("http://e.com/app/x"), "a=1; Path=/app");
        assert!(jar.header_for(&uri("http://e.com/app")).is_some());
        assert!(jar.header_for(&uri("http://e.com/app/deeper")).is_some());
        assert!(jar.header_for(&uri("http://e.com/application")).is_none());
        assert!(jar.header_for(&uri("http://e.com/")).is_none());
    }

    #[test]
    fn secure_requires_https() {
        let mut jar = CookieJar::new();
        jar.store(&uri("https://e.com/"), "s=1; Secure");
        assert!(jar.header_for(&uri("http://e.com/")).is_none());
        assert!(jar.header_for(&uri("https://e.com/")).is_some());
    }

    #[test]
    fn replacement_and_deletion() {
        let mut jar = CookieJar::new();
        let u = uri("http://e.com/");
        jar.store(&u, "sid=old");
        jar.store(&u, "sid=new");
        assert_eq!(jar.header_for(&u), Some("sid=new".to_string()));
        jar.store(&u, "sid=gone; Max-Age=0");
        assert_eq!(jar.header_for(&u), None);
    }

    #[test]
    fn multiple_cookies_joined() {
        let mut jar = CookieJar::new();
        let u = uri("http://e.com/");
        jar.store(&u, "a=1");
        jar.store(&u, "b=2");
        assert_eq!(jar.header_for(&u), Some("a=1; b=2".to_string()));
    }
}
