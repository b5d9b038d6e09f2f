//! HTTP headers handling
//!
//! This module provides a type for managing HTTP headers with case-insensitive
//! lookups and support for multiple values per header name. Verification
//! servers are inconsistent about casing (`Location` vs `location`,
//! `Set-Cookie` vs `set-cookie`), so every lookup ignores ASCII case.

use super::{Error, Result, CRLF};
use std::fmt;

/// HTTP headers collection
///
/// Headers are stored in insertion order and support:
/// - Case-insensitive header name lookups
/// - Multiple values for the same header name
/// - Iteration over all headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    headers: Vec<(String, String)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            headers: Vec::new(),
        }
    }

    /// Insert a header
    ///
    /// If a header with the same name (case-insensitive) already exists,
    /// this adds another value rather than replacing it.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a header (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Get the number of headers
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Iterate over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Render every header as `Name: value\r\n`, in insertion order
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str(CRLF);
        }
        out
    }

    /// Parse a header line into name and value
    ///
    /// The value is everything after the first `": "`. Lines that only use a
    /// bare colon are accepted too, with surrounding whitespace trimmed.
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let (name, value) = match line.split_once(": ") {
            Some((name, value)) => (name.trim(), value),
            None => match line.split_once(':') {
                Some((name, value)) => (name.trim(), value.trim()),
                None => {
                    return Err(Error::InvalidHeader(format!("No colon in header: {}", line)))
                }
            },
        };

        if name.is_empty() {
            return Err(Error::InvalidHeader("Empty header name".to_string()));
        }

        Ok((name.to_string(), value.to_string()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.headers {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}
