//! TLS configuration
//!
//! This module provides the client configuration builder.

use super::session::TlsSessionOps;
use openssl::ssl::{SslContext, SslContextBuilder, SslMethod, SslVerifyMode};
use std::net::TcpStream;
use std::path::Path;

/// TLS version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    /// TLS 1.0
    Tls10,
    /// TLS 1.1
    Tls11,
    /// TLS 1.2
    Tls12,
    /// TLS 1.3
    Tls13,
}

impl TlsVersion {
    /// Get OpenSSL protocol version constant
    pub fn to_openssl_version(&self) -> openssl::ssl::SslVersion {
        use openssl::ssl::SslVersion;
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    /// Get version as string
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1.0",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

/// TLS errors
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// TLS configuration (immutable after building)
#[derive(Clone)]
pub struct TlsConfig {
    pub(crate) ctx: SslContext,
    pub(crate) verify_peer: bool,
}

impl TlsConfig {
    /// Create a new client configuration builder
    ///
    /// The system trust store is loaded and peer verification is on.
    pub fn client() -> Result<ClientConfigBuilder, TlsError> {
        ClientConfigBuilder::new()
    }

    /// Whether the peer certificate chain and host name are verified
    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    /// Run the client handshake on `stream` for `servername`
    pub fn connect(&self, stream: TcpStream, servername: &str) -> Result<TlsSessionOps, TlsError> {
        TlsSessionOps::connect(stream, self, servername)
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("verify_peer", &self.verify_peer)
            .finish_non_exhaustive()
    }
}

/// Client configuration builder
pub struct ClientConfigBuilder {
    ctx_builder: SslContextBuilder,
    verify_peer: bool,
}

impl ClientConfigBuilder {
    fn new() -> Result<Self, TlsError> {
        let mut ctx_builder = SslContextBuilder::new(SslMethod::tls_client())?;
        ctx_builder.set_default_verify_paths()?;
        ctx_builder.set_min_proto_version(Some(TlsVersion::Tls12.to_openssl_version()))?;
        ctx_builder.set_verify(SslVerifyMode::PEER);

        Ok(ClientConfigBuilder {
            ctx_builder,
            verify_peer: true,
        })
    }

    /// Set TLS version range
    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Result<Self, TlsError> {
        if min > max {
            return Err(TlsError::InvalidConfig(format!(
                "minimum version {} is above maximum {}",
                min.as_str(),
                max.as_str()
            )));
        }
        self.ctx_builder
            .set_min_proto_version(Some(min.to_openssl_version()))?;
        self.ctx_builder
            .set_max_proto_version(Some(max.to_openssl_version()))?;
        Ok(self)
    }

    /// Enable/disable peer certificate verification
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        if verify {
            self.ctx_builder.set_verify(SslVerifyMode::PEER);
        } else {
            self.ctx_builder.set_verify(SslVerifyMode::NONE);
        }
        self
    }

    /// Trust the CA certificates in a PEM file in addition to the system store
    pub fn ca_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, TlsError> {
        self.ctx_builder.set_ca_file(path.as_ref())?;
        Ok(self)
    }

    /// Build the TLS configuration
    pub fn build(self) -> Result<TlsConfig, TlsError> {
        Ok(TlsConfig {
            ctx: self.ctx_builder.build(),
            verify_peer: self.verify_peer,
        })
    }
}
