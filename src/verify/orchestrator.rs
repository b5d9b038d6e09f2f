//! Verification orchestrator
//!
//! Sequences path acquisition, the coverage check and the authorization
//! flow, and turns the flow engine's terminal outcome into the public
//! result. Only one flow per kind may be in flight; a second call is
//! rejected with `AlreadyInProgress`.

use super::config::VerifierConfig;
use super::im::{open_link, resolve_link, select_app, LinkOpener};
use super::request::{AuthRequest, CoverageRequest};
use super::{FlowKind, Result, VerifyError};
use crate::flow::{
    CancelToken, FlowController, FlowError, FlowOutcome, FlowRequest, ImApp, ImSession,
};
use crate::http::query_param;
use crate::net::{NetworkPathProvider, PathAvailability};
use std::sync::{Mutex, MutexGuard};

/// Answer of a coverage check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageReport {
    pub available: bool,
    /// Response body as received
    pub raw: String,
}

/// Completed authorization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSuccess {
    /// Location that reached the redirect URI
    pub redirect_url: String,
    pub code: Option<String>,
    /// State echoed by the server, or the one that was sent
    pub state: String,
}

impl AuthSuccess {
    fn from_redirect(redirect_url: String, sent_state: &str) -> Self {
        let code = query_param(&redirect_url, "code").filter(|c| !c.is_empty());
        let state = query_param(&redirect_url, "state")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| sent_state.to_string());
        AuthSuccess {
            redirect_url,
            code,
            state,
        }
    }
}

/// Result of an authorization that may be handed to a messaging app
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    /// The flow reached the redirect URI without a handoff
    Completed(AuthSuccess),
    /// The verification continues in `app`
    LinkOpened {
        app: ImApp,
        link: String,
        session: ImSession,
        state: String,
    },
}

/// Marks a flow kind busy until dropped
struct InFlight<'a> {
    slot: &'a Mutex<Option<CancelToken>>,
    token: CancelToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

/// Verification client
///
/// Calls block the calling thread until the flow ends. `cancel` may be
/// called from any other thread.
pub struct Verifier<P: NetworkPathProvider> {
    config: VerifierConfig,
    provider: P,
    coverage: Mutex<Option<CancelToken>>,
    auth: Mutex<Option<CancelToken>>,
}

impl<P: NetworkPathProvider> Verifier<P> {
    pub fn new(config: VerifierConfig, provider: P) -> Self {
        Verifier {
            config,
            provider,
            coverage: Mutex::new(None),
            auth: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Check whether the operator of `request.phone` is supported
    pub fn check_coverage(&self, request: &CoverageRequest) -> Result<CoverageReport> {
        request.validate()?;
        let flight = self.begin(FlowKind::Coverage)?;
        let controller = self.controller()?;

        let flow = FlowRequest::coverage(request.to_url(self.config.coverage_url()));
        match controller.run(&flow, &flight.token) {
            None => Err(VerifyError::Cancelled),
            Some(FlowOutcome::CoverageResult { available, raw }) => {
                Ok(CoverageReport { available, raw })
            }
            Some(FlowOutcome::Failure(err)) => Err(err.into()),
            Some(other) => {
                tracing::warn!("unexpected coverage outcome: {:?}", other);
                let msg = "Unexpected coverage response".to_string();
                Err(FlowError::CoverageUnavailable(msg).into())
            }
        }
    }

    /// Run the authorization flow to the redirect URI
    pub fn authenticate(&self, request: &AuthRequest) -> Result<AuthSuccess> {
        let flight = self.begin(FlowKind::Auth)?;
        let controller = self.controller()?;

        let url = request.to_url(self.config.auth_url());
        let flow = FlowRequest::auth(url, request.redirect_uri());
        match controller.run(&flow, &flight.token) {
            None => Err(VerifyError::Cancelled),
            Some(FlowOutcome::Success(location)) => {
                Ok(AuthSuccess::from_redirect(location, request.state()))
            }
            Some(FlowOutcome::Failure(err)) => Err(err.into()),
            Some(other) => {
                tracing::warn!("unexpected authorization outcome: {:?}", other);
                let msg = "Unexpected authorization response".to_string();
                Err(FlowError::AuthorizationFailed(msg).into())
            }
        }
    }

    /// Run the authorization flow, handing it to a messaging app when the
    /// server asks for it
    pub fn authenticate_im(
        &self,
        request: &AuthRequest,
        opener: &dyn LinkOpener,
    ) -> Result<AuthResult> {
        let flight = self.begin(FlowKind::Auth)?;
        let controller = self.controller()?;

        let offered = request.with_default_channel(self.config.im_priority_apps());
        let url = offered.to_url(self.config.auth_url());
        let flow = FlowRequest::auth(url, offered.redirect_uri()).im_mode(true);
        let session = match controller.run(&flow, &flight.token) {
            None => return Err(VerifyError::Cancelled),
            Some(FlowOutcome::ImHandoff(session)) => session,
            Some(FlowOutcome::Success(location)) => {
                return Ok(AuthResult::Completed(AuthSuccess::from_redirect(
                    location,
                    request.state(),
                )))
            }
            Some(FlowOutcome::Failure(err)) => return Err(err.into()),
            Some(other) => {
                tracing::warn!("unexpected authorization outcome: {:?}", other);
                return Err(FlowError::AuthorizationFailed(
                    "Unexpected authorization response".to_string(),
                )
                .into());
            }
        };

        if session.apps().is_empty() {
            return Err(VerifyError::MissingImSession);
        }
        let (app, mut link) = select_app(&session, self.config.im_priority_apps(), opener)
            .ok_or(VerifyError::NoSupportedImApp)?;
        if self.config.resolve_im_links() {
            link = resolve_link(&controller, &link);
        }

        open_link(opener, app, &link)?;
        tracing::info!("verification {} continues in {}", session.session_id, app.display_name());
        Ok(AuthResult::LinkOpened {
            app,
            link,
            session,
            state: request.state().to_string(),
        })
    }

    /// Coverage check when enabled, then authorization
    pub fn verify(&self, coverage: &CoverageRequest, auth: &AuthRequest) -> Result<AuthSuccess> {
        if self.config.check_coverage_first() {
            let report = self.check_coverage(coverage)?;
            if !report.available {
                return Err(FlowError::CoverageUnavailable(
                    "available = false. telco is not supported".to_string(),
                )
                .into());
            }
        }
        self.authenticate(auth)
    }

    /// Cancel the in-flight flow of `kind`
    ///
    /// Returns false when nothing was running or the flow had already
    /// settled.
    pub fn cancel(&self, kind: FlowKind) -> bool {
        let token = match self.lock_slot(kind) {
            Ok(slot) => slot.as_ref().cloned(),
            Err(_) => None,
        };
        match token {
            Some(token) => token.cancel(),
            None => false,
        }
    }

    /// Whether a flow of `kind` is running
    pub fn is_in_progress(&self, kind: FlowKind) -> bool {
        self.lock_slot(kind).map(|slot| slot.is_some()).unwrap_or(false)
    }

    fn slot(&self, kind: FlowKind) -> &Mutex<Option<CancelToken>> {
        match kind {
            FlowKind::Coverage => &self.coverage,
            FlowKind::Auth => &self.auth,
        }
    }

    fn lock_slot(&self, kind: FlowKind) -> Result<MutexGuard<'_, Option<CancelToken>>> {
        self.slot(kind)
            .lock()
            .map_err(|_| VerifyError::InvalidConfiguration(format!("{} state poisoned", kind)))
    }

    fn begin(&self, kind: FlowKind) -> Result<InFlight<'_>> {
        let mut slot = self.lock_slot(kind)?;
        if slot.is_some() {
            tracing::warn!("rejecting second {} request", kind);
            return Err(VerifyError::AlreadyInProgress(kind));
        }
        let token = CancelToken::new();
        *slot = Some(token.clone());
        Ok(InFlight {
            slot: self.slot(kind),
            token,
        })
    }

    /// Acquire the cellular path and build an engine bound to it
    fn controller(&self) -> Result<FlowController> {
        let timeout = self.config.network_request_timeout();
        let path = match self.provider.acquire(timeout) {
            PathAvailability::Available(path) => path,
            PathAvailability::Unavailable => {
                tracing::warn!("cellular path unavailable");
                return Err(VerifyError::NetworkUnavailable);
            }
            PathAvailability::Timeout => {
                tracing::warn!("cellular path not up after {:?}", timeout);
                return Err(VerifyError::NetworkTimeout);
            }
        };
        tracing::debug!("using network path {}", path.name());

        FlowController::new(self.config.flow_config().clone(), path)
            .map_err(|e| VerifyError::InvalidConfiguration(e.to_string()))
    }
}
