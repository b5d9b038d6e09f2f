//! Response accumulation and parsing
//!
//! The parser collects transport chunks until it decides the response is
//! complete, then splits the text into status, headers and body.
//!
//! Completion is decided in two ways. When the head has arrived and declares
//! `Content-Length` or `Transfer-Encoding: chunked`, that framing is honoured.
//! Otherwise the chunk-length plateau heuristic applies: a chunk shorter than
//! the previous one, or shorter than `READ_CHUNK_SIZE`, ends the response.
//! The heuristic is intentional; verification servers answer with short
//! redirect responses that rarely carry framing the client can rely on.

use super::chunked::{decode_chunked_body, ChunkedDecoder};
use super::{
    Error, Headers, ParsedResponse, Result, Status, CRLF, HEAD_TERMINATOR, MAX_RESPONSE_SIZE,
    READ_CHUNK_SIZE,
};
use bytes::BytesMut;
use regex::Regex;
use std::sync::LazyLock;

static STATUS_CODE: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\d{3}"));

/// Outcome of feeding one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// More bytes are expected
    NeedMore,
    /// The response is complete and can be parsed
    Complete,
    /// More than `MAX_RESPONSE_SIZE` bytes arrived without completing
    Overflow,
}

/// How the end of the body is recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    /// Head not complete yet, or no framing declared
    Heuristic,
    ContentLength(usize),
    Chunked,
}

/// Incremental HTTP response parser
#[derive(Debug)]
pub struct ResponseParser {
    buffer: BytesMut,
    previous_chunk_len: usize,
    framing: Framing,
}

impl ResponseParser {
    /// Create a new response parser
    pub fn new() -> Self {
        ResponseParser {
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            previous_chunk_len: 0,
            framing: Framing::Heuristic,
        }
    }

    /// Feed one transport chunk
    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_RESPONSE_SIZE {
            tracing::warn!("response exceeds {} bytes", MAX_RESPONSE_SIZE);
            return Feed::Overflow;
        }

        if self.framing == Framing::Heuristic {
            self.framing = self.detect_framing();
        }

        match self.framing {
            Framing::ContentLength(len) => {
                let complete = self
                    .body_offset()
                    .is_some_and(|offset| self.buffer.len() - offset >= len);
                if complete {
                    Feed::Complete
                } else {
                    Feed::NeedMore
                }
            }
            Framing::Chunked => {
                let complete = self.body_offset().is_some_and(|offset| {
                    let mut decoder = ChunkedDecoder::new();
                    let mut sink = Vec::new();
                    matches!(decoder.decode(&self.buffer[offset..], &mut sink), Ok((_, true)))
                });
                if complete {
                    Feed::Complete
                } else {
                    Feed::NeedMore
                }
            }
            Framing::Heuristic => {
                let len = chunk.len();
                tracing::trace!(
                    "chunk received: {} bytes, previous: {}",
                    len,
                    self.previous_chunk_len
                );
                if len < self.previous_chunk_len || len < READ_CHUNK_SIZE {
                    Feed::Complete
                } else {
                    self.previous_chunk_len = len;
                    Feed::NeedMore
                }
            }
        }
    }

    /// Whether any byte has been received
    pub fn has_data(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Number of bytes accumulated so far
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Parse everything accumulated so far
    pub fn parse(&self) -> Result<ParsedResponse> {
        parse_response(&self.buffer)
    }

    /// Reset the parser for reuse
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.previous_chunk_len = 0;
        self.framing = Framing::Heuristic;
    }

    fn body_offset(&self) -> Option<usize> {
        self.buffer
            .windows(HEAD_TERMINATOR.len())
            .position(|w| w == HEAD_TERMINATOR.as_bytes())
            .map(|pos| pos + HEAD_TERMINATOR.len())
    }

    fn detect_framing(&self) -> Framing {
        let Some(offset) = self.body_offset() else {
            return Framing::Heuristic;
        };

        let head = String::from_utf8_lossy(&self.buffer[..offset]);
        let headers = parse_header_lines(&head);

        if headers
            .get("Transfer-Encoding")
            .is_some_and(|te| te.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
        {
            return Framing::Chunked;
        }

        match headers.get("Content-Length").map(|cl| cl.trim().parse::<usize>()) {
            Some(Ok(len)) => Framing::ContentLength(len),
            _ => Framing::Heuristic,
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Header lines of a response head, skipping the status line
///
/// Malformed lines are ignored rather than failing the whole response.
fn parse_header_lines(head: &str) -> Headers {
    let mut headers = Headers::new();
    for line in head.split(CRLF).skip(1) {
        if line.is_empty() {
            continue;
        }
        match Headers::parse_header_line(line) {
            Ok((name, value)) => headers.insert(name, value),
            Err(e) => tracing::debug!("skipping header line: {}", e),
        }
    }
    headers
}

/// Extract the three-digit status code from a status line
fn parse_status_code(status_line: &str) -> Option<u16> {
    match &*STATUS_CODE {
        Ok(re) => re.find(status_line).and_then(|m| m.as_str().parse().ok()),
        Err(e) => {
            tracing::error!("status code pattern failed to compile: {}", e);
            None
        }
    }
}

/// Parse a complete raw response
pub fn parse_response(raw: &[u8]) -> Result<ParsedResponse> {
    let text = String::from_utf8_lossy(raw).into_owned();

    let Some((head, body)) = text.split_once(HEAD_TERMINATOR) else {
        return Err(Error::IncompleteResponse(text));
    };

    let status_line = head.split(CRLF).next().unwrap_or_default();
    let Some(code) = parse_status_code(status_line) else {
        return Err(Error::StatusCodeNotFound(text));
    };

    let headers = parse_header_lines(head);

    let is_chunked = headers
        .get("Transfer-Encoding")
        .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
    let body = if is_chunked {
        match decode_chunked_body(body.as_bytes()) {
            Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
            Err(e) => {
                tracing::debug!("keeping raw chunked body: {}", e);
                body.to_string()
            }
        }
    } else {
        body.to_string()
    };

    Ok(ParsedResponse::new(Status::new(code), headers, body, text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_code() {
        assert_eq!(parse_status_code("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(parse_status_code("HTTP/1.1 302"), Some(302));
        assert_eq!(parse_status_code("HTTP/1.1 OK"), None);
    }

    #[test]
    fn test_short_chunk_completes() {
        let mut parser = ResponseParser::new();
        let feed =
            parser.feed(b"HTTP/1.1 302 Found\r\nLocation: https://idp.example/step2\r\n\r\n");
        assert_eq!(feed, Feed::Complete);

        let resp = parser.parse().unwrap();
        assert_eq!(resp.status().code(), 302);
        assert_eq!(resp.location(), Some("https://idp.example/step2"));
        assert_eq!(resp.body(), "");
    }

    #[test]
    fn test_full_chunks_wait_for_shorter_chunk() {
        let mut parser = ResponseParser::new();
        let mut first = b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\n".to_vec();
        first.resize(READ_CHUNK_SIZE, b'a');

        assert_eq!(parser.feed(&first), Feed::NeedMore);
        assert_eq!(parser.feed(&vec![b'b'; READ_CHUNK_SIZE]), Feed::NeedMore);
        assert_eq!(parser.feed(b"tail"), Feed::Complete);

        let resp = parser.parse().unwrap();
        assert_eq!(resp.status(), Status::OK);
        assert!(resp.body().ends_with("bbbtail"));
    }

    #[test]
    fn test_content_length_overrides_heuristic() {
        let mut parser = ResponseParser::new();
        assert_eq!(
            parser.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 18\r\n\r\n{\"avail"),
            Feed::NeedMore
        );
        assert_eq!(parser.feed(b"able\":true}"), Feed::Complete);
        assert_eq!(parser.parse().unwrap().body(), "{\"available\":true}");
    }

    #[test]
    fn test_chunked_framing() {
        let mut parser = ResponseParser::new();
        assert_eq!(
            parser.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n"),
            Feed::NeedMore
        );
        assert_eq!(parser.feed(b"0\r\n\r\n"), Feed::Complete);
        assert_eq!(parser.parse().unwrap().body(), "Hello");
    }

    #[test]
    fn test_missing_separator_is_incomplete() {
        let mut parser = ResponseParser::new();
        assert_eq!(parser.feed(b"HTTP/1.1 200 OK\r\nServer: x"), Feed::Complete);
        assert!(matches!(parser.parse(), Err(Error::IncompleteResponse(_))));
    }

    #[test]
    fn test_missing_status_code() {
        let result = parse_response(b"HTTP/1.1 OK\r\nServer: x\r\n\r\nbody");
        assert!(matches!(result, Err(Error::StatusCodeNotFound(_))));
    }

    #[test]
    fn test_headers_case_insensitive_and_malformed_lines_skipped() {
        let resp = parse_response(
            b"HTTP/1.1 302 Found\r\nlocation: https://app.example/cb?code=1\r\n\
              garbage\r\nSet-Cookie: a=1\r\n\r\n",
        )
        .unwrap();
        assert_eq!(resp.location(), Some("https://app.example/cb?code=1"));
        assert_eq!(resp.headers().get("set-cookie"), Some("a=1"));
        assert_eq!(resp.headers().len(), 2);
    }

    #[test]
    fn test_endless_full_chunks_overflow() {
        let mut parser = ResponseParser::new();
        let mut first = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        first.resize(READ_CHUNK_SIZE, b'a');
        assert_eq!(parser.feed(&first), Feed::NeedMore);

        let chunk = vec![b'a'; READ_CHUNK_SIZE];
        let mut feed = Feed::NeedMore;
        while feed == Feed::NeedMore {
            feed = parser.feed(&chunk);
        }
        assert_eq!(feed, Feed::Overflow);
        assert!(parser.len() > MAX_RESPONSE_SIZE);
        assert!(parser.len() <= MAX_RESPONSE_SIZE + READ_CHUNK_SIZE);
    }

    #[test]
    fn test_huge_content_length_overflows() {
        let mut parser = ResponseParser::new();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n",
            MAX_RESPONSE_SIZE * 4
        );
        assert_eq!(parser.feed(head.as_bytes()), Feed::NeedMore);
        assert_eq!(parser.feed(&vec![b'x'; MAX_RESPONSE_SIZE]), Feed::Overflow);
    }

    #[test]
    fn test_many_set_cookie_lines_keep_location() {
        let mut raw = String::from("HTTP/1.1 302 Found\r\n");
        for i in 0..70 {
            raw.push_str(&format!("Set-Cookie: c{}=v{}; Path=/\r\n", i, i));
        }
        raw.push_str("Location: https://app.example/cb?code=XYZ\r\nContent-Length: 0\r\n\r\n");

        let resp = parse_response(raw.as_bytes()).unwrap();
        assert_eq!(resp.headers().get_all("Set-Cookie").len(), 70);
        assert_eq!(resp.location(), Some("https://app.example/cb?code=XYZ"));
    }

    #[test]
    fn test_reset() {
        let mut parser = ResponseParser::new();
        parser.feed(b"HTTP/1.1 200 OK\r\n\r\n");
        assert!(parser.has_data());
        parser.reset();
        assert!(!parser.has_data());
        assert!(parser.is_empty());
    }
}
