//! TLS session operations
//!
//! This module implements the SessionOps trait for TLS connections,
//! enabling transparent switching between plain TCP and TLS I/O.

use super::config::{TlsConfig, TlsError};
use crate::http::session::{poll_fd, PollEvents, SessionOps};
use crate::http::{Error, Result as HttpResult};
use openssl::ssl::{Ssl, SslStream};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// TLS session operations
///
/// Implements SessionOps trait for TLS-encrypted connections.
/// Wraps an OpenSSL SslStream and provides poll/read/write/close operations.
pub struct TlsSessionOps {
    stream: SslStream<TcpStream>,
    failed: bool,
}

impl TlsSessionOps {
    /// Create a client TLS connection (perform handshake)
    ///
    /// SNI is sent for host names only. When the configuration verifies
    /// peers, the certificate must also match `servername`.
    pub fn connect(
        tcp_stream: TcpStream,
        config: &TlsConfig,
        servername: &str,
    ) -> std::result::Result<Self, TlsError> {
        let mut ssl = Ssl::new(&config.ctx)?;

        let ip = servername.parse::<IpAddr>().ok();
        if ip.is_none() {
            ssl.set_hostname(servername)?;
        }

        if config.verify_peer {
            match ip {
                Some(ip) => ssl.param_mut().set_ip(ip)?,
                None => ssl.param_mut().set_host(servername)?,
            }
        }

        // Blocking handshake; the caller bounds it with socket timeouts
        let stream = ssl
            .connect(tcp_stream)
            .map_err(|e| TlsError::HandshakeFailed(format!("{}: {}", servername, e)))?;

        tracing::debug!(
            "TLS established with {} ({})",
            servername,
            stream.ssl().version_str()
        );

        Ok(TlsSessionOps {
            stream,
            failed: false,
        })
    }

    /// Check if TLS failed
    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Negotiated protocol version, e.g. `TLSv1.3`
    pub fn version(&self) -> &'static str {
        self.stream.ssl().version_str()
    }

    /// Get reference to underlying TCP stream
    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }
}

impl SessionOps for TlsSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> HttpResult<bool> {
        // Decrypted bytes may already be buffered inside OpenSSL
        if events == PollEvents::Read && self.stream.ssl().pending() > 0 {
            return Ok(true);
        }

        poll_fd(self.stream.get_ref().as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> HttpResult<usize> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> HttpResult<usize> {
        match self.stream.write(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = true;
                Err(Error::Io(e))
            }
        }
    }

    fn close(&mut self) -> HttpResult<()> {
        // Perform SSL shutdown if not failed
        if !self.failed {
            let _ = self.stream.shutdown();
        }

        match self.stream.get_mut().shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}
