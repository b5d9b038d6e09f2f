//! cellverify - phone-number verification over the cellular network path
//!
//! The verification server recognises a subscriber by the mobile network a
//! request arrives from. This crate sends those requests over a pinned
//! network path, follows the server's redirect chain with its own small
//! HTTP/1.1 client and reports exactly one terminal result per flow.
//!
//! # Layout
//!
//! - `http`: endpoints, request frames, the response parser and client TLS
//! - `net`: network path binding and connection establishment
//! - `cookies`: per-flow cookie jar
//! - `flow`: the redirect-following flow engine
//! - `verify`: the public verifier, its configuration and IM handoff

pub mod cookies;
pub mod flow;
pub mod http;
pub mod net;
pub mod verify;

pub use flow::{CancelToken, FlowError, FlowOutcome};
pub use verify::{
    AuthRequest, AuthResult, AuthSuccess, CoverageReport, CoverageRequest, Verifier,
    VerifierConfig, VerifyError,
};
