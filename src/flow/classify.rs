//! Response classification
//!
//! Rules, in precedence order:
//!
//! 1. IM variant only: a 200 or 3xx response carrying `imbox_session_id`
//!    hands off to a messaging app.
//! 2. 200 on a coverage request: the JSON `available` field decides.
//! 3. 200 otherwise: the body is the success payload.
//! 4. 3xx: the `Location` header decides between following the redirect,
//!    finishing at the redirect URI boundary, or treating a non-http
//!    location as an already resolved deep link.
//! 5. Anything else is a server error.

use super::{FlowError, FlowOutcome, ImSession, RequestKind};
use crate::http::{query_param, ParsedResponse};
use serde_json::Value;

/// Per-flow inputs of the classifier
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext<'a> {
    pub kind: RequestKind,
    /// Registered redirect URI; empty for coverage flows
    pub redirect_uri: &'a str,
    /// Whether `imbox_session_id` responses end the flow
    pub im_mode: bool,
}

/// Classify one parsed response
pub fn classify(response: &ParsedResponse, ctx: &ClassifyContext<'_>) -> FlowOutcome {
    let status = response.status();
    let code = status.code();

    if ctx.im_mode && (code == 200 || status.is_redirection()) {
        if let Some(session) = ImSession::from_headers(response.headers()) {
            tracing::debug!("IM session {} announced", session.session_id);
            return FlowOutcome::ImHandoff(session);
        }
    }

    if code == 200 {
        return match ctx.kind {
            RequestKind::Coverage => classify_coverage(response.body()),
            RequestKind::Auth | RequestKind::Redirect => {
                FlowOutcome::Success(response.body().to_string())
            }
        };
    }

    if status.is_redirection() {
        return classify_redirect(code, response.location(), ctx);
    }

    FlowOutcome::Failure(FlowError::ServerError {
        status: code,
        message: response.error_message(),
    })
}

fn classify_coverage(body: &str) -> FlowOutcome {
    match serde_json::from_str::<Value>(body) {
        Ok(json) => match json.get("available").and_then(Value::as_bool) {
            Some(true) => FlowOutcome::CoverageResult {
                available: true,
                raw: body.to_string(),
            },
            Some(false) => FlowOutcome::Failure(FlowError::CoverageUnavailable(
                "available = false. telco is not supported".to_string(),
            )),
            None => FlowOutcome::Failure(FlowError::CoverageUnavailable(format!(
                "coverage response has no available flag: {}",
                body
            ))),
        },
        Err(e) => FlowOutcome::Failure(FlowError::CoverageUnavailable(format!(
            "invalid coverage response ({}): {}",
            e, body
        ))),
    }
}

fn classify_redirect(code: u16, location: Option<&str>, ctx: &ClassifyContext<'_>) -> FlowOutcome {
    let Some(location) = location.filter(|l| !l.is_empty()) else {
        return FlowOutcome::Failure(FlowError::InvalidRedirectTarget(format!(
            "{} but invalid or missing redirect URL",
            code
        )));
    };

    // Same rule for every kind: the boundary only counts with a code
    if is_boundary(location, ctx.redirect_uri) {
        return match query_param(location, "code").filter(|c| !c.is_empty()) {
            Some(_) => FlowOutcome::Success(location.to_string()),
            None => FlowOutcome::Failure(FlowError::AuthorizationFailed(authorization_error(
                location,
            ))),
        };
    }

    if location.starts_with("http") {
        return FlowOutcome::ContinueRedirect(location.to_string());
    }

    // Deep link such as an IM app URI
    FlowOutcome::Success(location.to_string())
}

/// Whether `location` lands on the registered redirect URI
fn is_boundary(location: &str, redirect_uri: &str) -> bool {
    !redirect_uri.is_empty()
        && location
            .get(..redirect_uri.len())
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case(redirect_uri))
}

/// `error error_description` from the redirect query, or the location itself
pub fn authorization_error(location: &str) -> String {
    let error = query_param(location, "error");
    let description = query_param(location, "error_description");
    match (error, description) {
        (Some(error), Some(description)) => format!("{} {}", error, description),
        (None, Some(description)) => description,
        (Some(error), None) => error,
        (None, None) => location.to_string(),
    }
}
