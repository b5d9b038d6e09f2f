//! HTTP/1.1 wire layer for verification flows
//!
//! This module provides the minimal HTTP/1.1 client pieces the flow engine
//! drives by hand: request framing, incremental response accumulation and
//! parsing, header lookup and the transport session abstraction.
//!
//! # Architecture
//!
//! The HTTP layer uses a session operations abstraction pattern that allows
//! seamless switching between plain TCP and TLS connections:
//!
//! - `SessionOps` trait defines operations (poll, read, write, close)
//! - `HttpSession` wraps an implementation and applies a poll timeout to every read
//! - All HTTP I/O code is transparent to the underlying transport
//!
//! # Examples
//!
//! ```
//! use cellverify::http::{build_request, Endpoint, Headers, ResponseParser, Feed};
//!
//! let endpoint = Endpoint::parse("http://example.com/cb?x=1").unwrap();
//! let wire = build_request(&endpoint, "", &Headers::new());
//! assert!(wire.starts_with(b"GET /cb?x=1 HTTP/1.1\r\n"));
//!
//! let mut parser = ResponseParser::new();
//! let feed = parser.feed(b"HTTP/1.1 302 Found\r\nLocation: https://idp.example/step2\r\n\r\n");
//! assert_eq!(feed, Feed::Complete);
//! let response = parser.parse().unwrap();
//! assert_eq!(response.status().code(), 302);
//! assert_eq!(response.location(), Some("https://idp.example/step2"));
//! ```

pub mod chunked;
pub mod endpoint;
pub mod headers;
pub mod message;
pub mod parser;
pub mod request;
pub mod session;
pub mod tls;

pub use endpoint::{escape_query, query_param, Endpoint, Scheme};
pub use headers::Headers;
pub use message::{ParsedResponse, Status};
pub use parser::{Feed, ResponseParser};
pub use request::build_request;
pub use session::{HttpSession, SessionOps};

/// Result type for HTTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Incomplete response : {0}")]
    IncompleteResponse(String),

    #[error("Status code not found in headers : {0}")]
    StatusCodeNotFound(String),

    #[error("Incomplete message")]
    Incomplete,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Largest chunk requested from the transport per read
pub const READ_CHUNK_SIZE: usize = 4096;

/// Largest response accepted before the attempt fails
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// Default HTTPS port
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// CRLF line ending
pub const CRLF: &str = "\r\n";

/// Separator between the response head and its body
pub const HEAD_TERMINATOR: &str = "\r\n\r\n";
