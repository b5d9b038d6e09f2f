//! Request targets
//!
//! An `Endpoint` is the immutable `{scheme, host, port, path, query}` view of
//! a URL that one connection attempt is made against.

use super::{Error, Result, DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;
use url::{Host, Url};

/// Characters escaped when a redirect query arrives unescaped.
///
/// Everything outside the URL query character set is encoded; the query
/// delimiters themselves (`&`, `=`, `?`, `/`, `:`) stay as they are.
const QUERY_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    /// Default port for this scheme
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => DEFAULT_HTTP_PORT,
            Scheme::Https => DEFAULT_HTTPS_PORT,
        }
    }

    /// Whether connections for this scheme need TLS
    pub fn requires_tls(&self) -> bool {
        matches!(self, Scheme::Https)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of a single connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
}

impl Endpoint {
    /// Parse an absolute `http`/`https` URL
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidUrl {
            url: input.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(input).map_err(|e| invalid(&e.to_string()))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(invalid(&format!("unsupported scheme {}", other))),
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(invalid("missing host")),
        };

        let port = url.port().unwrap_or_else(|| scheme.default_port());
        let path = if url.path().is_empty() {
            "/".to_string()
        } else {
            url.path().to_string()
        };

        Ok(Endpoint {
            scheme,
            host,
            port,
            path,
            query: url.query().map(str::to_string),
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Host name or bare IP address, as used for resolution and cookies
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host as written in a URL authority; IPv6 literals are bracketed
    pub fn authority_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Path plus `?query` when a query is present
    pub fn request_target(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.authority_host())?;
        if self.port != self.scheme.default_port() {
            write!(f, ":{}", self.port)?;
        }
        f.write_str(&self.request_target())
    }
}

/// Whether a string already carries percent-escapes
fn is_escaped(input: &str) -> bool {
    percent_decode_str(input).decode_utf8_lossy() != input
}

/// Percent-encode the query portion of a redirect target unless it is
/// already escaped
pub fn escape_query(target: &str) -> String {
    let Some((base, query)) = target.split_once('?') else {
        return target.to_string();
    };

    if is_escaped(query) {
        return target.to_string();
    }

    format!("{}?{}", base, utf8_percent_encode(query, QUERY_ESCAPE))
}

/// Look up a query parameter of a URL
///
/// Returns `None` when the URL does not parse or the key is absent. The
/// value is percent-decoded.
pub fn query_param(url: &str, key: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    url.query_pairs()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}
