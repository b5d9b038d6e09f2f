//! Network path selection and connection establishment
//!
//! A verification request only proves anything when it leaves the device
//! over the cellular interface. The engine never picks that interface
//! itself: an external `NetworkPathProvider` hands out a `NetworkPath`, and
//! every socket the transport opens is bound through it before connecting.
//!
//! # Examples
//!
//! ```no_run
//! use cellverify::net::{DevicePath, NetworkPath};
//! use std::sync::Arc;
//!
//! // Pin traffic to the modem interface on Linux
//! let path: Arc<dyn NetworkPath> = Arc::new(DevicePath::new("rmnet_data0"));
//! assert_eq!(path.name(), "rmnet_data0");
//! ```

pub mod transport;

pub use transport::{Connection, Transport, TransportStream, CONNECT_POLL_SLICE};

use crate::http::tls::TlsError;
use socket2::Socket;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Network down: {0}")]
    NetworkDown(#[source] io::Error),

    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Connect failed: {0}")]
    ConnectFailed(#[source] io::Error),

    #[error("Cannot resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Connect cancelled")]
    Cancelled,
}

/// Caller's view of a connection being opened
///
/// `Transport::open` polls `is_cancelled` while the TCP connect is pending
/// and hands over a second socket handle once it is up, so a cancel can
/// abort the TLS handshake too.
pub trait ConnectWatch {
    fn is_cancelled(&self) -> bool;

    /// The TCP connection is established
    fn connected(&self, stream: TcpStream);
}

/// Whether an I/O error means the bound interface has gone away
pub fn is_network_down(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENETDOWN) | Some(libc::ENETUNREACH) | Some(libc::ENODEV)
    )
}

/// A selected network path
///
/// Opaque handle for "the interface requests must leave through". The
/// transport binds every socket with it and resolves host names through it.
pub trait NetworkPath: Send + Sync + fmt::Debug {
    /// Human readable name for logs
    fn name(&self) -> &str;

    /// Pin `socket` to this path before it connects
    fn bind(&self, socket: &Socket) -> io::Result<()>;

    /// Resolve `host` for a connection over this path
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Whatever route the operating system picks
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPath;

impl NetworkPath for DefaultPath {
    fn name(&self) -> &str {
        "default"
    }

    fn bind(&self, _socket: &Socket) -> io::Result<()> {
        Ok(())
    }
}

/// A path pinned to a network interface by name
#[derive(Debug, Clone)]
pub struct DevicePath {
    interface: String,
}

impl DevicePath {
    pub fn new(interface: impl Into<String>) -> Self {
        DevicePath {
            interface: interface.into(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl NetworkPath for DevicePath {
    fn name(&self) -> &str {
        &self.interface
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
    fn bind(&self, socket: &Socket) -> io::Result<()> {
        socket.bind_device(Some(self.interface.as_bytes()))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "fuchsia")))]
    fn bind(&self, _socket: &Socket) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "binding to a device is not supported on this platform",
        ))
    }
}

/// A path selected by the local address of the interface
#[derive(Debug, Clone)]
pub struct SourceAddrPath {
    addr: IpAddr,
    name: String,
}

impl SourceAddrPath {
    pub fn new(addr: IpAddr) -> Self {
        SourceAddrPath {
            addr,
            name: addr.to_string(),
        }
    }
}

impl NetworkPath for SourceAddrPath {
    fn name(&self) -> &str {
        &self.name
    }

    fn bind(&self, socket: &Socket) -> io::Result<()> {
        socket.bind(&SocketAddr::new(self.addr, 0).into())
    }

    /// Only addresses of the same family as the source address are usable
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port)
            .to_socket_addrs()?
            .filter(|addr| addr.is_ipv4() == self.addr.is_ipv4())
            .collect())
    }
}

/// Answer of a network path provider
#[derive(Debug, Clone)]
pub enum PathAvailability {
    /// The path is up and usable
    Available(Arc<dyn NetworkPath>),
    /// The path does not exist or was refused
    Unavailable,
    /// The path did not come up in time
    Timeout,
}

/// External collaborator that obtains the cellular path
pub trait NetworkPathProvider: Send + Sync {
    /// Wait up to `timeout` for the path
    fn acquire(&self, timeout: Duration) -> PathAvailability;
}

/// Provider that always answers the same way
#[derive(Debug, Clone)]
pub struct FixedPathProvider {
    path: Option<Arc<dyn NetworkPath>>,
}

impl FixedPathProvider {
    /// Always hand out `path`
    pub fn new(path: Arc<dyn NetworkPath>) -> Self {
        FixedPathProvider { path: Some(path) }
    }

    /// Always report the path as unavailable
    pub fn unavailable() -> Self {
        FixedPathProvider { path: None }
    }
}

impl NetworkPathProvider for FixedPathProvider {
    fn acquire(&self, _timeout: Duration) -> PathAvailability {
        match &self.path {
            Some(path) => PathAvailability::Available(Arc::clone(path)),
            None => PathAvailability::Unavailable,
        }
    }
}

/// Provider that waits for a named interface to report `up`
///
/// Reads the interface state from sysfs, so it only finds interfaces on
/// Linux and Android.
#[derive(Debug, Clone)]
pub struct InterfacePathProvider {
    interface: String,
    sysfs_root: PathBuf,
    poll_interval: Duration,
}

impl InterfacePathProvider {
    pub fn new(interface: impl Into<String>) -> Self {
        InterfacePathProvider {
            interface: interface.into(),
            sysfs_root: PathBuf::from("/sys/class/net"),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Read interface state from another directory
    pub fn sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn operstate(&self) -> Option<String> {
        let path = self.sysfs_root.join(&self.interface).join("operstate");
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }
}

impl NetworkPathProvider for InterfacePathProvider {
    fn acquire(&self, timeout: Duration) -> PathAvailability {
        let deadline = Instant::now() + timeout;

        loop {
            match self.operstate() {
                None => {
                    tracing::debug!("interface {} not present", self.interface);
                    return PathAvailability::Unavailable;
                }
                Some(state) if state == "up" => {
                    tracing::debug!("interface {} is up", self.interface);
                    return PathAvailability::Available(Arc::new(DevicePath::new(
                        self.interface.clone(),
                    )));
                }
                Some(state) => {
                    tracing::trace!("interface {} is {}", self.interface, state);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return PathAvailability::Timeout;
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }
}
