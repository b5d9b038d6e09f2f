//! Instant-messaging handoff data
//!
//! In the IM variant the verification server answers with an
//! `imbox_session_id` header and deep links into the messaging apps that
//! can complete the verification.

use crate::http::Headers;
use std::fmt;
use std::str::FromStr;

/// Header carrying the IM session identifier
pub const IM_SESSION_ID: &str = "imbox_session_id";
pub const IM_WA_LINK: &str = "wa_link";
pub const IM_TELEGRAM_LINK: &str = "telegram_link";
pub const IM_VIBER_LINK: &str = "viber_link";
/// Header carrying the URL that completes the IM session
pub const IMBOX_ENDPOINT: &str = "imbox_endpoint";

/// Messaging app that can complete a verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImApp {
    WhatsApp,
    Telegram,
    Viber,
}

impl ImApp {
    /// Short identifier used in priority lists and the `channel` parameter
    pub fn brand(&self) -> &'static str {
        match self {
            ImApp::WhatsApp => "wa",
            ImApp::Telegram => "telegram",
            ImApp::Viber => "viber",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ImApp::WhatsApp => "whatsapp",
            ImApp::Telegram => "telegram",
            ImApp::Viber => "viber",
        }
    }

    pub const ALL: [ImApp; 3] = [ImApp::WhatsApp, ImApp::Telegram, ImApp::Viber];
}

impl fmt::Display for ImApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.brand())
    }
}

impl FromStr for ImApp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wa" | "whatsapp" => Ok(ImApp::WhatsApp),
            "telegram" => Ok(ImApp::Telegram),
            "viber" => Ok(ImApp::Viber),
            other => Err(format!("unknown IM app: {}", other)),
        }
    }
}

/// IM session announced by the verification server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImSession {
    pub session_id: String,
    pub wa_link: Option<String>,
    pub telegram_link: Option<String>,
    pub viber_link: Option<String>,
    pub complete_session_url: Option<String>,
}

impl ImSession {
    /// Compose the session from response headers
    ///
    /// Returns `None` without an `imbox_session_id` header. When no app link
    /// header is present, a `Location` header is assigned to the app its
    /// URL names.
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        let session_id = headers.get(IM_SESSION_ID)?.to_string();
        let link = |name: &str| {
            headers
                .get(name)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let mut session = ImSession {
            session_id,
            wa_link: link(IM_WA_LINK),
            telegram_link: link(IM_TELEGRAM_LINK),
            viber_link: link(IM_VIBER_LINK),
            complete_session_url: link(IMBOX_ENDPOINT),
        };

        let no_links = session.wa_link.is_none()
            && session.telegram_link.is_none()
            && session.viber_link.is_none();
        if no_links {
            if let Some(location) = link("Location") {
                if location.contains("viber") {
                    session.viber_link = Some(location);
                } else if location.contains("telegram") {
                    session.telegram_link = Some(location);
                } else if location.contains("wa") {
                    session.wa_link = Some(location);
                }
            }
        }

        Some(session)
    }

    /// Link for `app`, if the server offered one
    pub fn link(&self, app: ImApp) -> Option<&str> {
        match app {
            ImApp::WhatsApp => self.wa_link.as_deref(),
            ImApp::Telegram => self.telegram_link.as_deref(),
            ImApp::Viber => self.viber_link.as_deref(),
        }
    }

    /// Apps with a link, in WhatsApp, Telegram, Viber order
    pub fn apps(&self) -> Vec<ImApp> {
        ImApp::ALL
            .into_iter()
            .filter(|app| self.link(*app).is_some())
            .collect()
    }
}
