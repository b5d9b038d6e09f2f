//! Per-connection event machine
//!
//! One `Attempt` follows one connection from connect-ready to its end. The
//! driver turns transport activity into `Event`s and feeds them in the order
//! the connection delivers them. The machine answers at most once with an
//! `AttemptEnd`; every event after that is ignored.
//!
//! ```text
//! Connecting -> Connected -> AwaitingResponse -> Terminal
//!       \___________\_______________\__________-> Cancelled
//! ```

use super::FlowError;
use crate::http::{self, Feed, ParsedResponse, ResponseParser, MAX_RESPONSE_SIZE};

/// Transport activity, in delivery order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Connection established
    Ready,
    /// Request frame fully written
    Sent,
    /// Writing the request failed
    SendFailed(String),
    /// A chunk of response bytes
    Data(Vec<u8>),
    /// Peer closed the stream
    Closed,
    /// Reading failed
    ReadFailed(String),
    /// The bound interface went away
    NetworkDown,
    /// Nothing arrived within the response timeout
    TimedOut,
    /// The caller cancelled the flow
    Cancelled,
}

/// Attempt state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Connecting,
    Connected,
    AwaitingResponse,
    Terminal,
    Cancelled,
}

/// How an attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEnd {
    /// A complete response, ready for classification
    Response(ParsedResponse),
    /// The attempt failed
    Failed(FlowError),
    /// Cancelled; nothing is reported
    Cancelled,
}

/// State of one connection attempt
#[derive(Debug)]
pub struct Attempt {
    state: AttemptState,
    parser: ResponseParser,
    received_data: bool,
}

impl Attempt {
    pub fn new() -> Self {
        Attempt {
            state: AttemptState::Connecting,
            parser: ResponseParser::new(),
            received_data: false,
        }
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Whether any response byte has arrived
    pub fn has_received_data(&self) -> bool {
        self.received_data
    }

    /// Whether the attempt has ended
    pub fn is_finished(&self) -> bool {
        matches!(self.state, AttemptState::Terminal | AttemptState::Cancelled)
    }

    /// Apply one event
    ///
    /// Returns the end of the attempt the first time one is reached, and
    /// `None` otherwise.
    pub fn handle(&mut self, event: Event) -> Option<AttemptEnd> {
        if self.is_finished() {
            tracing::trace!("ignoring {:?} after the attempt ended", event);
            return None;
        }

        match event {
            Event::Cancelled => {
                self.state = AttemptState::Cancelled;
                Some(AttemptEnd::Cancelled)
            }
            Event::Ready => {
                if self.state == AttemptState::Connecting {
                    self.state = AttemptState::Connected;
                }
                None
            }
            Event::Sent => {
                if self.state == AttemptState::Connected {
                    self.state = AttemptState::AwaitingResponse;
                }
                None
            }
            Event::Data(bytes) => {
                if bytes.is_empty() {
                    return self.end_of_stream();
                }
                self.received_data = true;
                tracing::trace!("received {} bytes", bytes.len());
                match self.parser.feed(&bytes) {
                    Feed::Complete => Some(self.finish()),
                    Feed::NeedMore => None,
                    Feed::Overflow => Some(self.fail(FlowError::IncompleteResponse(format!(
                        "response exceeds {} bytes",
                        MAX_RESPONSE_SIZE
                    )))),
                }
            }
            Event::Closed => self.end_of_stream(),
            Event::SendFailed(reason) | Event::ReadFailed(reason) => {
                tracing::debug!("transport error: {}", reason);
                self.end_of_stream()
            }
            Event::NetworkDown => {
                if self.received_data {
                    Some(self.finish())
                } else {
                    Some(self.fail(FlowError::CellularInactive))
                }
            }
            Event::TimedOut => {
                if self.received_data {
                    // Idle after data: take what arrived
                    Some(self.finish())
                } else {
                    Some(self.fail(FlowError::Timeout))
                }
            }
        }
    }

    fn end_of_stream(&mut self) -> Option<AttemptEnd> {
        if self.received_data {
            Some(self.finish())
        } else {
            Some(self.fail(FlowError::Disconnected))
        }
    }

    fn fail(&mut self, err: FlowError) -> AttemptEnd {
        self.state = AttemptState::Terminal;
        AttemptEnd::Failed(err)
    }

    fn finish(&mut self) -> AttemptEnd {
        self.state = AttemptState::Terminal;
        match self.parser.parse() {
            Ok(response) => AttemptEnd::Response(response),
            Err(http::Error::IncompleteResponse(raw)) => {
                AttemptEnd::Failed(FlowError::IncompleteResponse(raw))
            }
            Err(http::Error::StatusCodeNotFound(raw)) => {
                AttemptEnd::Failed(FlowError::StatusCodeNotFound(raw))
            }
            Err(e) => AttemptEnd::Failed(FlowError::IncompleteResponse(e.to_string())),
        }
    }
}

impl Default for Attempt {
    fn default() -> Self {
        Self::new()
    }
}
