//! Phone-number verification over the cellular path
//!
//! `Verifier` is the public entry point. It acquires the cellular path from
//! a `NetworkPathProvider`, runs coverage and authorization flows through
//! the flow engine and maps their terminal outcome to a `Result`.
//!
//! # Examples
//!
//! ```no_run
//! use cellverify::net::InterfacePathProvider;
//! use cellverify::verify::{AuthRequest, Verifier, VerifierConfig};
//!
//! let config = VerifierConfig::builder()
//!     .sdk_header("ip-sdk-version", "0.1.0")
//!     .build()?;
//! let verifier = Verifier::new(config, InterfacePathProvider::new("rmnet_data0"));
//!
//! let request = AuthRequest::builder("my-client", "https://app.example/callback")
//!     .login_hint("381123456789")
//!     .build()?;
//! let success = verifier.authenticate(&request)?;
//! println!("code: {:?}", success.code);
//! # Ok::<(), cellverify::verify::VerifyError>(())
//! ```

pub mod config;
pub mod im;
pub mod orchestrator;
pub mod request;
pub mod state;

pub use config::{Environment, VerifierConfig, VerifierConfigBuilder};
pub use im::LinkOpener;
pub use orchestrator::{AuthResult, AuthSuccess, CoverageReport, Verifier};
pub use request::{AuthRequest, AuthRequestBuilder, CoverageRequest, DEFAULT_SCOPE};
pub use state::generate_state;

use crate::flow::{FlowError, ImApp};
use std::fmt;

/// The two flows a verifier runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Coverage,
    Auth,
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::Coverage => write!(f, "coverage"),
            FlowKind::Auth => write!(f, "authorization"),
        }
    }
}

/// Why a verification failed
///
/// The display text is the message for the end user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("The {0} request is already in progress")]
    AlreadyInProgress(FlowKind),

    #[error("Your cellular network is not active or not available")]
    NetworkUnavailable,

    #[error("Failed to request network. Timeout error")]
    NetworkTimeout,

    #[error("The request was cancelled")]
    Cancelled,

    #[error("The server did not offer any messaging app link")]
    MissingImSession,

    #[error("No supported messaging apps are available on your phone.")]
    NoSupportedImApp,

    #[error("Cannot open {} link: {reason}", app.display_name())]
    LinkOpenFailed { app: ImApp, reason: String },
}

/// Result type for verification calls
pub type Result<T> = std::result::Result<T, VerifyError>;
