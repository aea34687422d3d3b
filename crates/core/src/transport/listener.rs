use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{RelayError, Result};

const BACKLOG: i32 = 10;

/// Listening socket that accepts transparently redirected connections.
pub struct ProxyListener {
    inner: TcpListener,
}

impl ProxyListener {
    /// Create, configure, bind and listen.
    ///
    /// `SO_REUSEADDR` is always set. With `transparent`, `IP_TRANSPARENT`
    /// is set before bind so the socket may accept connections addressed
    /// to non-local IPs; this requires `CAP_NET_ADMIN`.
    pub fn bind(addr: SocketAddr, transparent: bool) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|source| RelayError::Bind { addr, source })?;

        socket
            .set_reuse_address(true)
            .map_err(|source| RelayError::SocketOption {
                option: "SO_REUSEADDR",
                source,
            })?;

        if transparent {
            set_transparent(&socket).map_err(|source| RelayError::SocketOption {
                option: "IP_TRANSPARENT",
                source,
            })?;
        }

        socket
            .bind(&addr.into())
            .map_err(|source| RelayError::Bind { addr, source })?;
        socket
            .listen(BACKLOG)
            .map_err(|source| RelayError::Bind { addr, source })?;

        Ok(Self {
            inner: socket.into(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Block until a client connects.
    pub fn accept_next(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept()
    }

    /// Switch the listener to non-blocking accepts so a stop flag can be
    /// polled between them.
    pub(crate) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.inner.set_nonblocking(nonblocking)
    }
}

#[cfg(target_os = "linux")]
fn set_transparent(socket: &Socket) -> io::Result<()> {
    socket.set_ip_transparent(true)
}

#[cfg(not(target_os = "linux"))]
fn set_transparent(_socket: &Socket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "transparent interception is only available on Linux",
    ))
}
