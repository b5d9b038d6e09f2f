//! Redirect-following verification flow engine
//!
//! A flow is a chain of connection attempts. Each attempt sends one `GET`
//! over the selected network path, accumulates the response and has it
//! classified. A redirect that stays outside the caller's redirect URI
//! starts the next attempt with the cookies collected so far; anything else
//! ends the flow with exactly one terminal `FlowOutcome`.
//!
//! # Architecture
//!
//! - `attempt` is the per-connection event machine (ready, sent, data,
//!   closed, timed out, network down, cancelled)
//! - `classify` maps a parsed response to an outcome
//! - `controller` drives attempts over real connections and follows hops
//! - `CancelToken` is the single-assignment guard shared with the caller

pub mod attempt;
pub mod classify;
pub mod controller;
pub mod im;

pub use attempt::{Attempt, AttemptEnd, AttemptState, Event};
pub use classify::{classify, ClassifyContext};
pub use controller::{FlowConfig, FlowController, FlowHandle, FlowRequest};
pub use im::{ImApp, ImSession};

use crate::net;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// What a request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Coverage check, answered with a JSON body
    Coverage,
    /// First request of an authorization
    Auth,
    /// Any later hop of an authorization
    Redirect,
}

/// Why a flow failed
///
/// The display text is the failure message handed to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowError {
    #[error("{0}")]
    NetworkUnavailable(String),

    #[error("Connect timeout: {0}")]
    ConnectTimeout(String),

    #[error("Cannot connect to server: {0}")]
    ConnectFailed(String),

    #[error("Cellular network is not active: the connection was lost")]
    CellularInactive,

    #[error("connect/read timeout")]
    Timeout,

    #[error("Cannot connect to server")]
    Disconnected,

    #[error("Incomplete response : {0}")]
    IncompleteResponse(String),

    #[error("Status code not found in headers : {0}")]
    StatusCodeNotFound(String),

    #[error("{0}")]
    InvalidRedirectTarget(String),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("Received error status {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("{0}")]
    CoverageUnavailable(String),

    #[error("{0}")]
    AuthorizationFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl From<net::Error> for FlowError {
    fn from(err: net::Error) -> Self {
        match err {
            net::Error::NetworkUnavailable(msg) => FlowError::NetworkUnavailable(msg),
            net::Error::NetworkDown(_) => FlowError::CellularInactive,
            net::Error::ConnectTimeout(after) => FlowError::ConnectTimeout(format!("{:?}", after)),
            net::Error::ConnectFailed(e) => FlowError::ConnectFailed(e.to_string()),
            e @ net::Error::Resolve { .. } => FlowError::ConnectFailed(e.to_string()),
            net::Error::Tls(e) => FlowError::ConnectFailed(e.to_string()),
            net::Error::Cancelled => FlowError::Disconnected,
        }
    }
}

/// Result of classifying one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// Terminal success with its payload
    Success(String),
    /// Follow the redirect; never leaves the controller
    ContinueRedirect(String),
    /// The server handed the verification to a messaging app
    ImHandoff(ImSession),
    /// Coverage answer
    CoverageResult { available: bool, raw: String },
    /// Terminal failure
    Failure(FlowError),
}

impl FlowOutcome {
    /// Whether this outcome ends the flow
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FlowOutcome::ContinueRedirect(_))
    }
}

#[derive(Debug, Default)]
struct CancelInner {
    settled: AtomicBool,
    cancelled: AtomicBool,
    socket: Mutex<Option<TcpStream>>,
}

/// Cancellation handle and terminal-outcome guard for one flow
///
/// Cancelling and delivering a terminal outcome both claim the same
/// single-assignment flag; whichever comes first wins and the other is a
/// no-op.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Cancel the flow and close its socket
    ///
    /// Returns false when the flow had already settled.
    pub fn cancel(&self) -> bool {
        if !self.claim() {
            return false;
        }
        self.inner.cancelled.store(true, Ordering::SeqCst);
        tracing::debug!("flow cancelled");

        if let Some(socket) = self.take_socket() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        true
    }

    /// Whether `cancel` won the race
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Whether a terminal outcome or a cancel has happened
    pub fn is_settled(&self) -> bool {
        self.inner.settled.load(Ordering::SeqCst)
    }

    /// Claim the right to deliver the terminal outcome
    pub(crate) fn claim_terminal(&self) -> bool {
        self.claim()
    }

    fn claim(&self) -> bool {
        self.inner
            .settled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Register the socket of the current attempt
    pub(crate) fn attach(&self, socket: TcpStream) {
        if self.is_cancelled() {
            let _ = socket.shutdown(Shutdown::Both);
            return;
        }
        if let Ok(mut slot) = self.inner.socket.lock() {
            *slot = Some(socket);
        }
        // A cancel may have slipped in before the socket was stored
        if self.is_cancelled() {
            if let Some(socket) = self.take_socket() {
                let _ = socket.shutdown(Shutdown::Both);
            }
        }
    }

    pub(crate) fn detach(&self) {
        drop(self.take_socket());
    }

    fn take_socket(&self) -> Option<TcpStream> {
        self.inner
            .socket
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }
}

impl net::ConnectWatch for CancelToken {
    fn is_cancelled(&self) -> bool {
        CancelToken::is_cancelled(self)
    }

    fn connected(&self, stream: TcpStream) {
        self.attach(stream);
    }
}
