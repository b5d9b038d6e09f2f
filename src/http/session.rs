//! Session operations abstraction
//!
//! This module provides the session operations pattern that allows
//! transparent switching between plain TCP and TLS connections.
//!
//! The flow engine only ever talks to an `HttpSession`; whether the bytes
//! travel in the clear or through OpenSSL is decided once, when the
//! transport opens the connection.

use super::{Error, Result};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Session operations trait
///
/// This trait defines the operations that can be performed on a session,
/// abstracting over plain TCP and TLS connections.
pub trait SessionOps {
    /// Poll the session for events
    ///
    /// Returns true if the session is ready for the requested operation
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool>;

    /// Read data from the session
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write data to the session
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Close the session
    fn close(&mut self) -> Result<()>;
}

/// Poll events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvents {
    Read,
    Write,
}

/// Wait for `events` on a raw socket
pub(crate) fn poll_fd(fd: i32, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
    use libc::{poll, pollfd, POLLIN, POLLOUT};

    let mut pfd = pollfd {
        fd,
        events: match events {
            PollEvents::Read => POLLIN,
            PollEvents::Write => POLLOUT,
        },
        revents: 0,
    };

    let timeout_ms = timeout
        .map(|d| i32::try_from(d.as_millis()).unwrap_or(i32::MAX))
        .unwrap_or(-1); // -1 = infinite

    // SAFETY: `pfd` is a valid, exclusively borrowed pollfd and nfds is 1.
    let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };

    if result < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }

    Ok(result > 0)
}

/// HTTP session wrapping a transport with session operations
pub struct HttpSession<S: SessionOps> {
    session: S,
    timeout: Option<Duration>,
}

impl<S: SessionOps> HttpSession<S> {
    /// Create a new HTTP session
    pub fn new(session: S) -> Self {
        HttpSession {
            session,
            timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Set the timeout for operations
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Get the timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Read data, failing with `Error::Timeout` when nothing arrives in time
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Read, self.timeout)? {
            return Err(Error::Timeout);
        }

        self.session.read(buf)
    }

    /// Write data with timeout
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.session.poll(PollEvents::Write, self.timeout)? {
            return Err(Error::Timeout);
        }

        self.session.write(buf)
    }

    /// Write the whole buffer
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let mut written = 0;

        while written < buf.len() {
            let n = self.write(&buf[written..])?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            written += n;
        }

        Ok(())
    }

    /// Close the session
    pub fn close(&mut self) -> Result<()> {
        self.session.close()
    }

    /// Get a reference to the underlying session
    pub fn get_ref(&self) -> &S {
        &self.session
    }
}

/// Plain file descriptor session operations
pub struct FdSessionOps {
    stream: TcpStream,
}

impl FdSessionOps {
    /// Create a new FD session operations from a TCP stream
    pub fn new(stream: TcpStream) -> Self {
        FdSessionOps { stream }
    }

    /// Get a reference to the underlying stream
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl SessionOps for FdSessionOps {
    fn poll(&self, events: PollEvents, timeout: Option<Duration>) -> Result<bool> {
        poll_fd(self.stream.as_raw_fd(), events, timeout)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(Error::from)
    }

    fn close(&mut self) -> Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // Already shut down by a cancel or by the peer
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}
