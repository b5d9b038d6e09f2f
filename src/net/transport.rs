//! Transport: one bound socket per connection attempt
//!
//! `Transport::open` resolves and connects through the caller's
//! `NetworkPath`, adds TLS for `https` endpoints and hands back a
//! `Connection`. The connection owns the only socket of the attempt and
//! closes it when dropped.

use super::{is_network_down, ConnectWatch, Error, NetworkPath, Result};
use crate::http::session::{poll_fd, FdSessionOps, HttpSession, PollEvents, SessionOps};
use crate::http::tls::{TlsConfig, TlsSessionOps};
use crate::http::{self, Endpoint};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

/// Longest wait between cancel checks while a connect is pending
pub const CONNECT_POLL_SLICE: Duration = Duration::from_millis(50);

/// Plain or encrypted byte stream
pub enum TransportStream {
    Plain(FdSessionOps),
    Tls(TlsSessionOps),
}

impl TransportStream {
    fn tcp(&self) -> &TcpStream {
        match self {
            TransportStream::Plain(s) => s.stream(),
            TransportStream::Tls(s) => s.get_ref(),
        }
    }
}

impl SessionOps for TransportStream {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> http::Result<bool> {
        match self {
            TransportStream::Plain(s) => s.poll(events, timeout),
            TransportStream::Tls(s) => s.poll(events, timeout),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> http::Result<usize> {
        match self {
            TransportStream::Plain(s) => s.read(buf),
            TransportStream::Tls(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> http::Result<usize> {
        match self {
            TransportStream::Plain(s) => s.write(buf),
            TransportStream::Tls(s) => s.write(buf),
        }
    }

    fn close(&mut self) -> http::Result<()> {
        match self {
            TransportStream::Plain(s) => s.close(),
            TransportStream::Tls(s) => s.close(),
        }
    }
}

/// Opens connections over a network path
pub struct Transport;

impl Transport {
    /// Connect to `endpoint` through `path`
    ///
    /// Every resolved address is tried in order; the error of the last
    /// attempt is reported. TLS is added when the scheme requires it, with
    /// the handshake bounded by `connect_timeout` as well. `watch` can
    /// abort a pending connect and receives the socket before the
    /// handshake starts.
    pub fn open(
        endpoint: &Endpoint,
        path: &dyn NetworkPath,
        tls: &TlsConfig,
        connect_timeout: Duration,
        watch: &dyn ConnectWatch,
    ) -> Result<Connection> {
        let addrs = path
            .resolve(endpoint.host(), endpoint.port())
            .map_err(|source| classify_resolve_error(endpoint.host(), source))?;

        if addrs.is_empty() {
            return Err(Error::Resolve {
                host: endpoint.host().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no usable address"),
            });
        }

        let mut last_err = None;
        let mut connected = None;
        for addr in addrs {
            match connect_one(addr, path, connect_timeout, watch) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::debug!("connect to {} via {} failed: {}", addr, path.name(), e);
                    last_err = Some(e);
                }
            }
        }

        let stream = match (connected, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(e),
            (None, None) => {
                return Err(Error::NetworkUnavailable(format!(
                    "no address for {}",
                    endpoint.host()
                )))
            }
        };

        if watch.is_cancelled() {
            return Err(Error::Cancelled);
        }
        stream.set_nodelay(true).map_err(Error::ConnectFailed)?;
        match stream.try_clone() {
            Ok(handle) => watch.connected(handle),
            Err(e) => tracing::debug!("no shutdown handle for {}: {}", endpoint, e),
        }

        let transport = if endpoint.scheme().requires_tls() {
            stream
                .set_read_timeout(Some(connect_timeout))
                .map_err(Error::ConnectFailed)?;
            stream
                .set_write_timeout(Some(connect_timeout))
                .map_err(Error::ConnectFailed)?;

            let session = match tls.connect(stream, endpoint.host()) {
                Ok(session) => session,
                Err(_) if watch.is_cancelled() => return Err(Error::Cancelled),
                Err(e) => return Err(e.into()),
            };

            // Reads are bounded by poll from here on
            session
                .get_ref()
                .set_read_timeout(None)
                .map_err(Error::ConnectFailed)?;
            session
                .get_ref()
                .set_write_timeout(None)
                .map_err(Error::ConnectFailed)?;

            TransportStream::Tls(session)
        } else {
            TransportStream::Plain(FdSessionOps::new(stream))
        };

        tracing::info!("connected to {} via {}", endpoint, path.name());

        Ok(Connection {
            session: HttpSession::new(transport),
            endpoint: endpoint.clone(),
            closed: false,
        })
    }
}

fn classify_resolve_error(host: &str, source: io::Error) -> Error {
    if is_network_down(&source) {
        Error::NetworkDown(source)
    } else {
        Error::Resolve {
            host: host.to_string(),
            source,
        }
    }
}

fn classify_connect_error(e: io::Error, timeout: Duration) -> Error {
    if is_network_down(&e) {
        Error::NetworkDown(e)
    } else if e.kind() == io::ErrorKind::TimedOut {
        Error::ConnectTimeout(timeout)
    } else {
        Error::ConnectFailed(e)
    }
}

/// Non-blocking connect, polled in slices so `watch` can abort it
fn connect_one(
    addr: SocketAddr,
    path: &dyn NetworkPath,
    timeout: Duration,
    watch: &dyn ConnectWatch,
) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::ConnectFailed)?;
    path.bind(&socket)
        .map_err(|e| classify_connect_error(e, timeout))?;
    socket.set_nonblocking(true).map_err(Error::ConnectFailed)?;

    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            wait_connected(&socket, timeout, watch)?;
        }
        Err(e) => return Err(classify_connect_error(e, timeout)),
    }

    socket.set_nonblocking(false).map_err(Error::ConnectFailed)?;
    Ok(socket.into())
}

fn wait_connected(socket: &Socket, timeout: Duration, watch: &dyn ConnectWatch) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if watch.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::ConnectTimeout(timeout));
        }

        let slice = CONNECT_POLL_SLICE.min(deadline - now);
        let writable = match poll_fd(socket.as_raw_fd(), PollEvents::Write, Some(slice)) {
            Ok(ready) => ready,
            Err(http::Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => false,
            Err(http::Error::Io(e)) => return Err(classify_connect_error(e, timeout)),
            Err(e) => return Err(Error::ConnectFailed(io::Error::other(e.to_string()))),
        };
        if writable {
            return match socket.take_error().map_err(Error::ConnectFailed)? {
                Some(e) => Err(classify_connect_error(e, timeout)),
                None => Ok(()),
            };
        }
    }
}

/// An open connection for one request/response exchange
pub struct Connection {
    session: HttpSession<TransportStream>,
    endpoint: Endpoint,
    closed: bool,
}

impl Connection {
    /// Endpoint this connection was opened for
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether TLS wraps this connection
    pub fn is_tls(&self) -> bool {
        matches!(self.session.get_ref(), TransportStream::Tls(_))
    }

    /// Send the whole request frame
    pub fn write(&mut self, bytes: &[u8]) -> http::Result<()> {
        self.session.write_all(bytes)
    }

    /// Read one chunk of at most `buf.len()` bytes
    ///
    /// Returns 0 at end of stream. Fails with `http::Error::Timeout` when
    /// nothing arrives within `timeout`.
    pub fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> http::Result<usize> {
        self.session.set_timeout(timeout);
        self.session.read(buf)
    }

    /// Second handle on the socket, used to abort a blocked read
    pub fn shutdown_handle(&self) -> io::Result<TcpStream> {
        self.session.get_ref().tcp().try_clone()
    }

    /// Close the socket; later calls do nothing
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.session.close() {
            tracing::debug!("closing connection to {}: {}", self.endpoint, e);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
