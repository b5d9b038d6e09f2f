//! Coverage and authorization requests
//!
//! Both requests are validated before any network activity and rendered to
//! the URL the first flow hop is sent to.

use super::state::generate_state;
use super::VerifyError;
use crate::flow::ImApp;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left as-is in query components (RFC 3986 unreserved)
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Scope requested when none is given
pub const DEFAULT_SCOPE: &str = "openid ip:phone_verify";

/// Scope that needs a phone number as login hint
const PHONE_VERIFY_SCOPE: &str = "ip:phone_verify";

fn append_query(base: &str, params: &[(&str, &str)]) -> String {
    let mut url = base.to_string();
    let mut separator = if base.contains('?') { '&' } else { '?' };
    for (key, value) in params {
        url.push(separator);
        url.push_str(&utf8_percent_encode(key, COMPONENT).to_string());
        url.push('=');
        url.push_str(&utf8_percent_encode(value, COMPONENT).to_string());
        separator = '&';
    }
    url
}

/// `channel` value: brands joined by spaces, in priority order
fn channel_value(apps: &[ImApp]) -> String {
    apps.iter().map(ImApp::brand).collect::<Vec<_>>().join(" ")
}

/// Coverage check for one phone number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverageRequest {
    pub client_id: String,
    pub phone: String,
}

impl CoverageRequest {
    pub fn new(client_id: impl Into<String>, phone: impl Into<String>) -> Self {
        CoverageRequest {
            client_id: client_id.into(),
            phone: phone.into(),
        }
    }

    pub fn validate(&self) -> Result<(), VerifyError> {
        if self.client_id.trim().is_empty() {
            return Err(VerifyError::InvalidConfiguration(
                "The client_id parameter is empty".to_string(),
            ));
        }
        if self.phone.trim().is_empty() {
            return Err(VerifyError::InvalidConfiguration(
                "The phone number cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// `<endpoint>?client_id=..&phone=..`
    pub fn to_url(&self, endpoint: &str) -> String {
        append_query(
            endpoint,
            &[("client_id", self.client_id.as_str()), ("phone", self.phone.as_str())],
        )
    }
}

/// Authorization request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    client_id: String,
    redirect_uri: String,
    login_hint: Option<String>,
    scope: String,
    state: String,
    channel: Option<String>,
    extra_params: Vec<(String, String)>,
}

impl AuthRequest {
    pub fn builder(
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> AuthRequestBuilder {
        AuthRequestBuilder {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            login_hint: None,
            scope: DEFAULT_SCOPE.to_string(),
            state: None,
            channel: None,
            extra_params: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub fn login_hint(&self) -> Option<&str> {
        self.login_hint.as_deref()
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// State sent with the request and expected back on the redirect
    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    /// Copy that offers `apps` when no channel was chosen
    pub(crate) fn with_default_channel(&self, apps: &[ImApp]) -> AuthRequest {
        let mut request = self.clone();
        if request.channel.is_none() && !apps.is_empty() {
            request.channel = Some(channel_value(apps));
        }
        request
    }

    /// Request URL for `endpoint`
    pub fn to_url(&self, endpoint: &str) -> String {
        let mut params: Vec<(&str, &str)> = vec![
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("response_type", "code"),
            ("scope", self.scope.as_str()),
            ("state", self.state.as_str()),
        ];
        if let Some(hint) = &self.login_hint {
            params.push(("login_hint", hint.as_str()));
        }
        if let Some(channel) = &self.channel {
            params.push(("channel", channel.as_str()));
        }
        params.extend(
            self.extra_params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        append_query(endpoint, &params)
    }
}

/// Builder for `AuthRequest`
#[derive(Debug, Clone)]
pub struct AuthRequestBuilder {
    client_id: String,
    redirect_uri: String,
    login_hint: Option<String>,
    scope: String,
    state: Option<String>,
    channel: Option<String>,
    extra_params: Vec<(String, String)>,
}

impl AuthRequestBuilder {
    /// Phone number of the subscription being verified
    pub fn login_hint(mut self, phone: impl Into<String>) -> Self {
        self.login_hint = Some(phone.into());
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Use a caller-chosen state instead of a generated one
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Messaging apps offered to the server, in priority order
    pub fn channel(mut self, apps: &[ImApp]) -> Self {
        self.channel = Some(channel_value(apps));
        self
    }

    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_params.push((key.into(), value.into()));
        self
    }

    pub fn build(self) -> Result<AuthRequest, VerifyError> {
        if self.client_id.trim().is_empty() {
            return Err(VerifyError::InvalidConfiguration(
                "The client_id parameter is empty".to_string(),
            ));
        }
        if self.redirect_uri.trim().is_empty() {
            return Err(VerifyError::InvalidConfiguration(
                "The redirect_uri parameter is empty".to_string(),
            ));
        }
        if self.scope.trim().is_empty() {
            return Err(VerifyError::InvalidConfiguration(
                "The scope parameter cannot be empty".to_string(),
            ));
        }
        let hint_missing = self
            .login_hint
            .as_deref()
            .map_or(true, |hint| hint.trim().is_empty());
        if self.scope.contains(PHONE_VERIFY_SCOPE) && hint_missing {
            return Err(VerifyError::InvalidConfiguration(format!(
                "The login_hint parameter cannot be empty when the scope includes '{}'",
                PHONE_VERIFY_SCOPE
            )));
        }
        if self.channel.as_deref() == Some("") {
            return Err(VerifyError::InvalidConfiguration(
                "The IM priority app list cannot be empty".to_string(),
            ));
        }

        let state = match self.state {
            Some(state) if !state.is_empty() => state,
            _ => generate_state(),
        };

        Ok(AuthRequest {
            client_id: self.client_id,
            redirect_uri: self.redirect_uri,
            login_hint: self.login_hint,
            scope: self.scope,
            state,
            channel: self.channel,
            extra_params: self.extra_params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::query_param;
    use crate::verify::state::STATE_PREFIX;

    #[test]
    fn test_coverage_url() {
        let request = CoverageRequest::new("C", "+84 123");
        assert!(request.validate().is_ok());
        assert_eq!(
            request.to_url("https://api.example/coverage"),
            "https://api.example/coverage?client_id=C&phone=%2B84%20123"
        );
        assert!(CoverageRequest::new("", "1").validate().is_err());
        assert!(CoverageRequest::new("C", " ").validate().is_err());
    }

    #[test]
    fn test_auth_url() {
        let request = AuthRequest::builder("C", "https://app.example/cb")
            .login_hint("381123456789")
            .state("S1")
            .build()
            .unwrap();
        assert_eq!(
            request.to_url("https://api.example/auth"),
            "https://api.example/auth?client_id=C&redirect_uri=https%3A%2F%2Fapp.example%2Fcb\
             &response_type=code&scope=openid%20ip%3Aphone_verify&state=S1&login_hint=381123456789"
        );
    }

    #[test]
    fn test_generated_state_and_channel() {
        let request = AuthRequest::builder("C", "https://app.example/cb")
            .scope("openid ip:mobile_id")
            .channel(&[ImApp::WhatsApp, ImApp::Viber])
            .query_param("lang", "en")
            .build()
            .unwrap();
        assert!(request.state().starts_with(STATE_PREFIX));
        assert_eq!(request.channel(), Some("wa viber"));

        let url = request.to_url("https://api.example/auth");
        assert_eq!(query_param(&url, "channel").as_deref(), Some("wa viber"));
        assert_eq!(query_param(&url, "lang").as_deref(), Some("en"));
        assert_eq!(query_param(&url, "state").as_deref(), Some(request.state()));
    }

    #[test]
    fn test_default_channel_fills_only_missing() {
        let request = AuthRequest::builder("C", "https://app.example/cb")
            .scope("openid")
            .build()
            .unwrap();
        let filled = request.with_default_channel(&[ImApp::WhatsApp, ImApp::Telegram]);
        assert_eq!(filled.channel(), Some("wa telegram"));
        assert_eq!(filled.state(), request.state());
        assert_eq!(
            query_param(&filled.to_url("https://api.example/auth"), "channel").as_deref(),
            Some("wa telegram")
        );

        let chosen = AuthRequest::builder("C", "https://app.example/cb")
            .scope("openid")
            .channel(&[ImApp::Viber])
            .build()
            .unwrap();
        let kept = chosen.with_default_channel(&[ImApp::WhatsApp]);
        assert_eq!(kept.channel(), Some("viber"));
    }

    #[test]
    fn test_validation() {
        let missing_client = AuthRequest::builder("", "https://app.example/cb").build();
        assert!(matches!(missing_client, Err(VerifyError::InvalidConfiguration(_))));

        let missing_redirect = AuthRequest::builder("C", "").login_hint("1").build();
        assert!(matches!(missing_redirect, Err(VerifyError::InvalidConfiguration(_))));

        let missing_hint = AuthRequest::builder("C", "https://app.example/cb").build();
        assert!(matches!(missing_hint, Err(VerifyError::InvalidConfiguration(_))));

        let empty_scope = AuthRequest::builder("C", "https://app.example/cb")
            .scope("")
            .build();
        assert!(matches!(empty_scope, Err(VerifyError::InvalidConfiguration(_))));

        let empty_channel = AuthRequest::builder("C", "https://app.example/cb")
            .scope("openid")
            .channel(&[])
            .build();
        assert!(matches!(empty_channel, Err(VerifyError::InvalidConfiguration(_))));
    }
}
