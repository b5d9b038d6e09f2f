//! HTTP message types
//!
//! This module defines the parsed form of a verification server response.

use super::Headers;
use std::fmt;

/// HTTP status code
///
/// Any three-digit code found on the status line is kept as-is; verification
/// servers are not guaranteed to stay inside the registered ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status {
    code: u16,
}

impl Status {
    /// Create a status from its numeric code
    pub fn new(code: u16) -> Self {
        Status { code }
    }

    /// Get the status code
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Get the canonical reason phrase for this status code
    pub fn reason_phrase(&self) -> &'static str {
        match self.code {
            200 => "OK",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            307 => "Temporary Redirect",
            308 => "Permanent Redirect",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            429 => "Too Many Requests",
            500 => "Internal Server Error",
            502 => "Bad Gateway",
            503 => "Service Unavailable",
            504 => "Gateway Timeout",
            _ => "Unknown",
        }
    }

    /// Check if this is a success status (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Check if this is a redirection status (3xx)
    pub fn is_redirection(&self) -> bool {
        (300..400).contains(&self.code)
    }

    pub const OK: Status = Status { code: 200 };
    pub const FOUND: Status = Status { code: 302 };
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason_phrase())
    }
}

/// A response as received from the verification server
///
/// Built once per connection attempt from the accumulated bytes and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    status: Status,
    headers: Headers,
    body: String,
    raw: String,
}

impl ParsedResponse {
    pub fn new(status: Status, headers: Headers, body: String, raw: String) -> Self {
        ParsedResponse {
            status,
            headers,
            body,
            raw,
        }
    }

    /// Get the status code
    pub fn status(&self) -> Status {
        self.status
    }

    /// Get the headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Get the body
    pub fn body(&self) -> &str {
        &self.body
    }

    /// The full response text, head included
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// `Location` header, in either casing
    pub fn location(&self) -> Option<&str> {
        self.headers.get("Location")
    }

    /// Best-effort error text for a failed response
    ///
    /// The body when there is one; otherwise the status line without its
    /// `HTTP/1.1` token, or the first header line when that leaves nothing.
    pub fn error_message(&self) -> String {
        if !self.body.is_empty() {
            return self.body.clone();
        }

        let lines: Vec<&str> = self.raw.split("\r\n").collect();
        if lines.len() < 2 {
            return self.raw.clone();
        }

        let status_line = lines[0].replace("HTTP/1.1", "");
        let status_line = status_line.trim();
        if status_line.is_empty() {
            lines[1].to_string()
        } else {
            status_line.to_string()
        }
    }
}
