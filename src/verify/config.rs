//! Verifier configuration
//!
//! Built once through `VerifierConfig::builder()` and immutable afterwards.

use super::VerifyError;
use crate::flow::{FlowConfig, ImApp};
use crate::http::tls::TlsVersion;
use crate::http::{Endpoint, Headers};
use std::path::PathBuf;
use std::time::Duration;

const COVERAGE_PATH: &str = "/auth/realms/ipification/coverage";
const AUTH_PATH: &str = "/auth/realms/ipification/protocol/openid-connect/auth";

/// Verification service deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Live,
    Stage,
}

impl Environment {
    pub fn base_url(&self) -> &'static str {
        match self {
            Environment::Live => "https://api.ipification.com",
            Environment::Stage => "https://stage.ipification.com",
        }
    }
}

/// Verifier configuration (immutable after building)
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    environment: Environment,
    coverage_url: String,
    auth_url: String,
    network_request_timeout: Duration,
    flow: FlowConfig,
    im_priority_apps: Vec<ImApp>,
    check_coverage_first: bool,
    resolve_im_links: bool,
}

impl VerifierConfig {
    pub fn builder() -> VerifierConfigBuilder {
        VerifierConfigBuilder::default()
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn coverage_url(&self) -> &str {
        &self.coverage_url
    }

    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    /// How long to wait for the cellular path
    pub fn network_request_timeout(&self) -> Duration {
        self.network_request_timeout
    }

    pub fn flow_config(&self) -> &FlowConfig {
        &self.flow
    }

    pub fn im_priority_apps(&self) -> &[ImApp] {
        &self.im_priority_apps
    }

    pub fn check_coverage_first(&self) -> bool {
        self.check_coverage_first
    }

    pub fn resolve_im_links(&self) -> bool {
        self.resolve_im_links
    }
}

/// Configuration builder
#[derive(Debug, Clone)]
pub struct VerifierConfigBuilder {
    environment: Environment,
    coverage_url: Option<String>,
    auth_url: Option<String>,
    network_request_timeout: Duration,
    flow: FlowConfig,
    im_priority_apps: Vec<ImApp>,
    check_coverage_first: bool,
    resolve_im_links: bool,
}

impl Default for VerifierConfigBuilder {
    fn default() -> Self {
        VerifierConfigBuilder {
            environment: Environment::Live,
            coverage_url: None,
            auth_url: None,
            network_request_timeout: Duration::from_secs(5),
            flow: FlowConfig::default(),
            im_priority_apps: vec![ImApp::WhatsApp, ImApp::Telegram, ImApp::Viber],
            check_coverage_first: true,
            resolve_im_links: true,
        }
    }
}

impl VerifierConfigBuilder {
    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Use a custom coverage endpoint instead of the environment's
    pub fn coverage_url(mut self, url: impl Into<String>) -> Self {
        self.coverage_url = Some(url.into());
        self
    }

    /// Use a custom authorization endpoint instead of the environment's
    pub fn auth_url(mut self, url: impl Into<String>) -> Self {
        self.auth_url = Some(url.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.flow.connect_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.flow.response_timeout = timeout;
        self
    }

    pub fn network_request_timeout(mut self, timeout: Duration) -> Self {
        self.network_request_timeout = timeout;
        self
    }

    pub fn max_redirects(mut self, hops: usize) -> Self {
        self.flow.max_redirects = hops;
        self
    }

    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.flow.verify_peer = verify;
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.flow.ca_file = Some(path.into());
        self
    }

    pub fn min_tls_version(mut self, version: TlsVersion) -> Self {
        self.flow.min_tls_version = version;
        self
    }

    /// Header sent with the first request of every flow
    pub fn sdk_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.flow.extra_headers.insert(name, value);
        self
    }

    pub fn sdk_headers(mut self, headers: Headers) -> Self {
        self.flow.extra_headers = headers;
        self
    }

    pub fn im_priority_apps(mut self, apps: Vec<ImApp>) -> Self {
        self.im_priority_apps = apps;
        self
    }

    pub fn check_coverage_first(mut self, enabled: bool) -> Self {
        self.check_coverage_first = enabled;
        self
    }

    /// Resolve the chosen IM link with one plain request before opening it
    pub fn resolve_im_links(mut self, enabled: bool) -> Self {
        self.resolve_im_links = enabled;
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<VerifierConfig, VerifyError> {
        let base = self.environment.base_url();
        let coverage_url = self
            .coverage_url
            .unwrap_or_else(|| format!("{}{}", base, COVERAGE_PATH));
        let auth_url = self
            .auth_url
            .unwrap_or_else(|| format!("{}{}", base, AUTH_PATH));

        for (name, url) in [("coverage", &coverage_url), ("auth", &auth_url)] {
            Endpoint::parse(url).map_err(|e| {
                VerifyError::InvalidConfiguration(format!("{} endpoint: {}", name, e))
            })?;
        }

        for (name, timeout) in [
            ("connect", self.flow.connect_timeout),
            ("response", self.flow.response_timeout),
            ("network request", self.network_request_timeout),
        ] {
            if timeout.is_zero() {
                return Err(VerifyError::InvalidConfiguration(format!(
                    "{} timeout must be positive",
                    name
                )));
            }
        }

        if self.im_priority_apps.is_empty() {
            return Err(VerifyError::InvalidConfiguration(
                "The IM priority app list cannot be empty".to_string(),
            ));
        }

        Ok(VerifierConfig {
            environment: self.environment,
            coverage_url,
            auth_url,
            network_request_timeout: self.network_request_timeout,
            flow: self.flow,
            im_priority_apps: self.im_priority_apps,
            check_coverage_first: self.check_coverage_first,
            resolve_im_links: self.resolve_im_links,
        })
    }
}
