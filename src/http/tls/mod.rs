//! TLS support for verification connections
//!
//! Every `https` hop of a flow is wrapped in TLS before the request is
//! written. The client side is all that is needed: the verification
//! servers are never impersonated.
//!
//! # Architecture
//!
//! The TLS implementation uses the session operations abstraction pattern:
//!
//! 1. `TlsConfig` holds the immutable OpenSSL context (versions, trust roots, verification)
//! 2. `TlsSessionOps` implements the `SessionOps` trait for encrypted I/O
//! 3. The flow engine reads and writes through `HttpSession` and never sees the difference
//!
//! The server name is supplied per connection, because a single flow visits
//! several hosts while redirecting.
//!
//! # Examples
//!
//! ```no_run
//! use cellverify::http::tls::{TlsConfig, TlsVersion};
//! use std::net::TcpStream;
//!
//! let tls_config = TlsConfig::client()
//!     .unwrap()
//!     .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
//!     .unwrap()
//!     .build()
//!     .unwrap();
//!
//! let tcp_stream = TcpStream::connect("api.ipification.com:443").unwrap();
//! let _tls_session = tls_config.connect(tcp_stream, "api.ipification.com").unwrap();
//! ```

pub mod config;
pub mod session;

pub use config::{ClientConfigBuilder, TlsConfig, TlsError, TlsVersion};
pub use session::TlsSessionOps;

/// Result type for TLS operations
pub type Result<T> = std::result::Result<T, TlsError>;
