//! Handing a verification over to a messaging app
//!
//! The host application knows which apps are installed and how to open a
//! deep link; it exposes both through `LinkOpener`. The verifier picks the
//! first installed app of the configured priority list that the server
//! offered a link for.

use super::VerifyError;
use crate::flow::{FlowController, ImApp, ImSession};

/// Host capability to inspect and launch messaging apps
pub trait LinkOpener: Send + Sync {
    /// Whether `app` is installed on the device
    fn is_installed(&self, app: ImApp) -> bool;

    /// Open `link` in `app`
    fn open(&self, app: ImApp, link: &str) -> Result<(), String>;
}

/// First installed app, in priority order, that has a link in `session`
pub fn select_app(
    session: &ImSession,
    priority: &[ImApp],
    opener: &dyn LinkOpener,
) -> Option<(ImApp, String)> {
    priority.iter().find_map(|&app| {
        let link = session.link(app)?;
        if opener.is_installed(app) {
            Some((app, link.to_string()))
        } else {
            tracing::debug!("{} offered but not installed", app.display_name());
            None
        }
    })
}

/// Resolve an IM link with one plain request
///
/// The `Location` of the answer wins over its body. When the request fails
/// or yields nothing, the link is used as given.
pub fn resolve_link(controller: &FlowController, link: &str) -> String {
    if !link.starts_with("http") {
        return link.to_string();
    }

    match controller.fetch_once(link) {
        Ok(response) => {
            let status = response.status();
            if !status.is_success() && !status.is_redirection() {
                tracing::warn!("IM link {} answered {}", link, status);
                return link.to_string();
            }
            let resolved = response
                .location()
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| response.body().trim());
            if resolved.is_empty() {
                link.to_string()
            } else {
                resolved.to_string()
            }
        }
        Err(e) => {
            tracing::warn!("cannot resolve IM link {}: {}", link, e);
            link.to_string()
        }
    }
}

/// Open the chosen link
pub fn open_link(opener: &dyn LinkOpener, app: ImApp, link: &str) -> Result<(), VerifyError> {
    tracing::info!("opening {} link", app.display_name());
    opener
        .open(app, link)
        .map_err(|reason| VerifyError::LinkOpenFailed { app, reason })
}
