//! Per-flow cookie jar
//!
//! Verification servers keep their session in cookies while bouncing the
//! device between hosts, so every `Set-Cookie` seen along a redirect chain
//! is replayed on later hops. A store lives for one flow only.

use crate::http::{Headers, CRLF};

/// A stored cookie
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub secure: bool,
    pub http_only: bool,
}

impl Cookie {
    /// Parse a `Set-Cookie` value received from `request_host`
    ///
    /// Returns `None` when the leading `name=value` pair is missing.
    /// Unknown or malformed attributes are skipped.
    pub fn parse(line: &str, request_host: &str) -> Option<Self> {
        let mut parts = line.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().to_string(),
            domain: request_host.to_string(),
            path: "/".to_string(),
            secure: false,
            http_only: false,
        };

        for attr in parts {
            let (attr_name, attr_value) = match attr.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v.trim())),
                None => (attr.trim(), None),
            };

            match (attr_name, attr_value) {
                ("Secure" | "secure", _) => cookie.secure = true,
                ("HttpOnly", _) => cookie.http_only = true,
                (n, Some(v)) if n.eq_ignore_ascii_case("domain") && !v.is_empty() => {
                    cookie.domain = v.to_string();
                }
                (n, Some(v)) if n.eq_ignore_ascii_case("path") && !v.is_empty() => {
                    cookie.path = v.to_string();
                }
                _ => {}
            }
        }

        Some(cookie)
    }

    /// Whether this cookie goes with a request to `host` and `path`
    pub fn matches(&self, host: &str, path: &str) -> bool {
        host.contains(self.domain.as_str()) && path.starts_with(self.path.as_str())
    }
}

/// Cookies collected during one flow
#[derive(Debug, Clone, Default)]
pub struct CookieStore {
    cookies: Vec<Cookie>,
}

impl CookieStore {
    pub fn new() -> Self {
        CookieStore::default()
    }

    /// Store one `Set-Cookie` value
    ///
    /// A cookie with the same name under the same domain is replaced.
    /// Returns false when the line was not a cookie.
    pub fn absorb(&mut self, line: &str, request_host: &str) -> bool {
        let Some(cookie) = Cookie::parse(line, request_host) else {
            tracing::debug!("ignoring malformed Set-Cookie: {}", line);
            return false;
        };

        tracing::debug!(
            "cookie {} stored for domain {} path {}",
            cookie.name,
            cookie.domain,
            cookie.path
        );

        match self
            .cookies
            .iter_mut()
            .find(|c| c.domain == cookie.domain && c.name == cookie.name)
        {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
        true
    }

    /// Store every `Set-Cookie` header of a response from `request_host`
    pub fn absorb_response(&mut self, headers: &Headers, request_host: &str) -> usize {
        headers
            .get_all("Set-Cookie")
            .into_iter()
            .filter(|line| self.absorb(line, request_host))
            .count()
    }

    /// Render the `Cookie:` request line for `host` and `path`
    ///
    /// Yields `Cookie: a=1; b=2; \r\n`, or an empty string when nothing
    /// matches so the request carries no cookie line at all.
    pub fn render(&self, host: &str, path: &str) -> String {
        let mut matching = self.cookies.iter().filter(|c| c.matches(host, path)).peekable();
        if matching.peek().is_none() {
            return String::new();
        }

        let mut line = String::from("Cookie: ");
        for cookie in matching {
            line.push_str(&cookie.name);
            line.push('=');
            line.push_str(&cookie.value);
            line.push_str("; ");
        }
        line.push_str(CRLF);
        line
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cookie> {
        self.cookies.iter()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }
}
