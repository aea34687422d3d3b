//! Error types for the RTSP relay.

use std::net::SocketAddr;

/// Errors that end the relay process.
///
/// Everything in here is unrecoverable for a single-session daemon: a
/// listener that cannot be configured, a destination that cannot be
/// recovered or reached, or a failing wait primitive. Conditions that
/// only end the current session (idle timeout, peer close, send/receive
/// failures) are reported as [`SessionEnd`](crate::session::SessionEnd)
/// instead.
///
/// - **Listener**: [`Bind`](Self::Bind), [`SocketOption`](Self::SocketOption).
/// - **Destination**: [`Resolve`](Self::Resolve),
///   [`UnsupportedAddressFamily`](Self::UnsupportedAddressFamily),
///   [`UpstreamConnect`](Self::UpstreamConnect).
/// - **Session**: [`Wait`](Self::Wait).
/// - **Server**: [`AlreadyRunning`](Self::AlreadyRunning),
///   [`NotStarted`](Self::NotStarted).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Creating, binding or listening on the intercepting socket failed.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A socket option required at bind time could not be set.
    ///
    /// `IP_TRANSPARENT` needs `CAP_NET_ADMIN`; this is the usual failure
    /// when the relay is started unprivileged.
    #[error("setsockopt ({option}) failed: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// Querying the accepted socket's local address failed.
    #[error("failed to recover original destination: {0}")]
    Resolve(#[source] std::io::Error),

    /// The intercepted connection was not addressed to an IPv4 endpoint.
    #[error("original destination {0} is not IPv4")]
    UnsupportedAddressFamily(SocketAddr),

    /// The second leg to the original destination could not be opened.
    #[error("connect to {destination} failed: {source}")]
    UpstreamConnect {
        destination: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the client's first message failed for a reason other
    /// than the idle timeout.
    #[error("waiting for client data failed: {0}")]
    Wait(#[source] std::io::Error),

    /// [`ProxyServer::start`](crate::ProxyServer::start) was called while already running.
    #[error("relay already running")]
    AlreadyRunning,

    /// [`ProxyServer::wait`](crate::ProxyServer::wait) was called before `start`.
    #[error("relay not started")]
    NotStarted,
}

/// Convenience alias for `Result<T, RelayError>`.
pub type Result<T> = std::result::Result<T, RelayError>;
