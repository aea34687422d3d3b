use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};

use crate::error::{RelayError, Result};

/// An IPv4 address/port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    address: Ipv4Addr,
    port: u16,
}

impl Endpoint {
    pub const fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Same address, different port.
    ///
    /// The intercepted socket carries the port the client dialed; the
    /// upstream leg always goes to the RTSP control port.
    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

impl From<SocketAddrV4> for Endpoint {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(*addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Recover the endpoint the client originally dialed.
///
/// Under TPROXY the accepted socket is bound to the client's intended
/// destination, so `getsockname()` returns it directly. Without
/// interception this is simply the listener's own address.
pub fn original_destination(stream: &TcpStream) -> Result<Endpoint> {
    match stream.local_addr().map_err(RelayError::Resolve)? {
        SocketAddr::V4(addr) => Ok(Endpoint::from(addr)),
        other => Err(RelayError::UnsupportedAddressFamily(other)),
    }
}
