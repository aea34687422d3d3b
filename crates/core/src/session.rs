//! One client/destination relay, from acceptance to both legs closing.
//!
//! ```text
//! Connecting -> AwaitingClient --timeout--------------------> Closing
//!                     |
//!                     +--ready--> Relaying --(EOF, error, TEARDOWN)--> Closing
//! ```
//!
//! Each relaying round is strictly request-then-response: one receive from
//! the client, rewritten and forwarded in full, then one receive from the
//! destination, forwarded back unmodified. Only the first client read is
//! guarded by the idle timeout; later rounds block without a bound.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{RelayError, Result};
use crate::rewrite;
use crate::server::ProxyConfig;
use crate::transport::Endpoint;

/// Literal keyword that ends the session once its round completes.
pub const TEARDOWN_MARKER: &[u8] = b"TEARDOWN";

/// How long a fresh session waits for the client's first message.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Capacity of the per-session message buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 2000;

/// Which side of the relay an I/O failure happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Upstream,
}

/// Why a session reached Closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client sent nothing within the idle timeout.
    IdleTimeout,
    /// The client closed its side (zero-byte read).
    ClientClosed,
    /// The destination closed its side (zero-byte reply).
    UpstreamClosed,
    /// The client's message carried the teardown marker.
    Teardown,
    SendFailed(Leg),
    ReceiveFailed(Leg),
}

impl SessionEnd {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::IdleTimeout => "idle timeout",
            Self::ClientClosed => "connection closed by client",
            Self::UpstreamClosed => "connection closed by destination",
            Self::Teardown => "teardown",
            Self::SendFailed(Leg::Client) => "send to client failed",
            Self::SendFailed(Leg::Upstream) => "send to destination failed",
            Self::ReceiveFailed(Leg::Client) => "receive from client failed",
            Self::ReceiveFailed(Leg::Upstream) => "receive from destination failed",
        }
    }
}

/// Snapshot of the session currently being relayed.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub destination: Endpoint,
    pub started: Instant,
}

/// An intercepted client connection paired with its upstream connection.
///
/// Both streams are owned here and closed together when [`run`](Self::run)
/// returns; neither can outlive the session.
pub struct ProxySession {
    client: TcpStream,
    upstream: TcpStream,
    info: SessionInfo,
    config: Arc<ProxyConfig>,
    buffer: Vec<u8>,
}

impl ProxySession {
    /// Open the upstream leg to `destination` on the configured control
    /// port and build the session around both connections.
    pub fn connect(
        client: TcpStream,
        peer: SocketAddr,
        destination: Endpoint,
        config: Arc<ProxyConfig>,
    ) -> Result<Self> {
        let upstream_addr = destination.with_port(config.upstream_port).socket_addr();

        let upstream = TcpStream::connect(upstream_addr).map_err(|source| {
            RelayError::UpstreamConnect {
                destination: upstream_addr,
                source,
            }
        })?;

        tracing::info!(%peer, destination = %upstream_addr, "connected to destination");

        Ok(Self::new(client, upstream, peer, destination, config))
    }

    /// Build a session from two already-connected streams.
    pub fn new(
        client: TcpStream,
        upstream: TcpStream,
        peer: SocketAddr,
        destination: Endpoint,
        config: Arc<ProxyConfig>,
    ) -> Self {
        let buffer = vec![0u8; config.buffer_size.max(1)];
        Self {
            client,
            upstream,
            info: SessionInfo {
                peer,
                destination,
                started: Instant::now(),
            },
            config,
            buffer,
        }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Relay until a terminal condition, then close both legs.
    ///
    /// Session-local endings are `Ok`; only a failing wait primitive is an
    /// error.
    pub fn run(mut self) -> Result<SessionEnd> {
        let end = if self.await_client()? {
            self.relay()
        } else {
            tracing::warn!(
                peer = %self.info.peer,
                timeout = ?self.config.idle_timeout,
                "no data from client, closing"
            );
            SessionEnd::IdleTimeout
        };

        self.close(end);
        Ok(end)
    }

    /// Wait up to the idle timeout for the client to have data ready.
    ///
    /// Peeks instead of reading so the first unit is still consumed by the
    /// relay loop. A peer that closed or reset counts as ready: the next
    /// receive reports it.
    fn await_client(&mut self) -> Result<bool> {
        // A zero read timeout is rejected by the OS.
        let timeout = self.config.idle_timeout.max(Duration::from_millis(1));
        self.client
            .set_read_timeout(Some(timeout))
            .map_err(RelayError::Wait)?;

        let mut probe = [0u8; 1];
        let ready = match self.client.peek(&mut probe) {
            Ok(_) => true,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => false,
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
                ) =>
            {
                true
            }
            Err(e) => return Err(RelayError::Wait(e)),
        };

        self.client
            .set_read_timeout(None)
            .map_err(RelayError::Wait)?;
        Ok(ready)
    }

    fn relay(&mut self) -> SessionEnd {
        let peer = self.info.peer;

        loop {
            let received = match recv_unit(&mut self.client, &mut self.buffer) {
                Ok(0) => return SessionEnd::ClientClosed,
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(%peer, error = %e, "receive from client failed");
                    return SessionEnd::ReceiveFailed(Leg::Client);
                }
            };

            let unit = &self.buffer[..received];
            tracing::trace!(
                %peer,
                bytes = received,
                message = %String::from_utf8_lossy(unit),
                "client message"
            );

            let teardown = rewrite::find(unit, TEARDOWN_MARKER).is_some();
            let outbound = self.config.rewrite.apply(unit);

            if let Err(e) = self.upstream.write_all(&outbound) {
                tracing::error!(%peer, error = %e, "send to destination failed");
                return SessionEnd::SendFailed(Leg::Upstream);
            }
            tracing::trace!(
                %peer,
                bytes = outbound.len(),
                message = %String::from_utf8_lossy(&outbound),
                "forwarded to destination"
            );

            let replied = match recv_unit(&mut self.upstream, &mut self.buffer) {
                Ok(0) => return SessionEnd::UpstreamClosed,
                Ok(n) => n,
                Err(e) => {
                    tracing::error!(%peer, error = %e, "receive from destination failed");
                    return SessionEnd::ReceiveFailed(Leg::Upstream);
                }
            };

            let reply = &self.buffer[..replied];
            tracing::trace!(
                %peer,
                bytes = replied,
                message = %String::from_utf8_lossy(reply),
                "destination reply"
            );

            if let Err(e) = self.client.write_all(reply) {
                tracing::error!(%peer, error = %e, "send to client failed");
                return SessionEnd::SendFailed(Leg::Client);
            }

            if teardown {
                tracing::info!(%peer, "TEARDOWN received");
                return SessionEnd::Teardown;
            }
        }
    }

    fn close(self, end: SessionEnd) {
        // Errors here only mean the peer already went away.
        let _ = self.upstream.shutdown(Shutdown::Both);
        let _ = self.client.shutdown(Shutdown::Both);

        tracing::info!(
            peer = %self.info.peer,
            destination = %self.info.destination,
            reason = end.reason(),
            elapsed = ?self.info.started.elapsed(),
            "session closed"
        );
    }
}

/// One receive into `buffer`, retrying on EINTR.
fn recv_unit(stream: &mut TcpStream, buffer: &mut [u8]) -> io::Result<usize> {
    loop {
        match stream.read(buffer) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    /// A connected loopback pair: (dialing side, accepted side).
    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let near = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (far, _) = listener.accept().unwrap();
        (near, far)
    }

    struct Harness {
        client: TcpStream,
        upstream: TcpStream,
        session: thread::JoinHandle<Result<SessionEnd>>,
    }

    fn spawn_session(idle_timeout: Duration) -> Harness {
        let (client, relay_client_leg) = pair();
        let (relay_upstream_leg, upstream) = pair();
        let config = Arc::new(ProxyConfig {
            idle_timeout,
            ..ProxyConfig::default()
        });
        let session = ProxySession::new(
            relay_client_leg,
            relay_upstream_leg,
            client.local_addr().unwrap(),
            Endpoint::new(Ipv4Addr::new(198, 51, 100, 10), 554),
            config,
        );
        for s in [&client, &upstream] {
            s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        }
        Harness {
            client,
            upstream,
            session: thread::spawn(move || session.run()),
        }
    }

    /// Close with `SO_LINGER` 0 so the peer sees RST instead of FIN.
    fn reset(stream: TcpStream) {
        socket2::SockRef::from(&stream).set_linger(Some(Duration::ZERO)).unwrap();
        drop(stream);
    }

    fn read_some(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = [0u8; 4096];
        let n = stream.read(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    #[test]
    fn round_trip_rewrites_request_and_passes_reply_through() {
        let mut h = spawn_session(DEFAULT_IDLE_TIMEOUT);

        h.client
            .write_all(b"SETUP rtsp://10.1.1.32/stream1 RTSP/1.0\r\n")
            .unwrap();
        assert_eq!(
            read_some(&mut h.upstream),
            b"SETUP rtsp://109.205.200.75/stream1 RTSP/1.0\r\n"
        );

        h.upstream.write_all(b"RTSP/1.0 200 OK\r\n").unwrap();
        assert_eq!(read_some(&mut h.client), b"RTSP/1.0 200 OK\r\n");

        // Still open for another round.
        h.client.write_all(b"PLAY rtsp://10.1.1.32/stream1 RTSP/1.0\r\n").unwrap();
        assert_eq!(
            read_some(&mut h.upstream),
            b"PLAY rtsp://109.205.200.75/stream1 RTSP/1.0\r\n"
        );
        h.upstream.write_all(b"RTSP/1.0 200 OK\r\n").unwrap();
        assert_eq!(read_some(&mut h.client), b"RTSP/1.0 200 OK\r\n");

        drop(h.client);
        assert_eq!(h.session.join().unwrap().unwrap(), SessionEnd::ClientClosed);
        assert!(read_some(&mut h.upstream).is_empty());
    }

    #[test]
    fn teardown_closes_both_legs_after_reply() {
        let mut h = spawn_session(DEFAULT_IDLE_TIMEOUT);

        h.client
            .write_all(b"TEARDOWN rtsp://10.1.1.32/stream1 RTSP/1.0\r\nCSeq: 5\r\n\r\n")
            .unwrap();
        read_some(&mut h.upstream);
        h.upstream.write_all(b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n").unwrap();

        assert_eq!(read_some(&mut h.client), b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n");
        assert_eq!(h.session.join().unwrap().unwrap(), SessionEnd::Teardown);
        assert!(read_some(&mut h.client).is_empty());
        assert!(read_some(&mut h.upstream).is_empty());
    }

    #[test]
    fn stale_reply_bytes_do_not_trigger_teardown() {
        let mut h = spawn_session(DEFAULT_IDLE_TIMEOUT);

        h.client.write_all(b"OPTIONS * RTSP/1.0\r\n").unwrap();
        read_some(&mut h.upstream);
        h.upstream
            .write_all(b"RTSP/1.0 200 OK\r\nPublic: DESCRIBE, SETUP, PLAY, TEARDOWN\r\n\r\n")
            .unwrap();
        read_some(&mut h.client);

        // Shorter than the previous reply, which is still in the buffer.
        h.client.write_all(b"GET_PARAMETER *\r\n").unwrap();
        read_some(&mut h.upstream);
        h.upstream.write_all(b"RTSP/1.0 200 OK\r\n").unwrap();
        read_some(&mut h.client);

        h.client.write_all(b"OPTIONS * RTSP/1.0\r\n").unwrap();
        assert_eq!(read_some(&mut h.upstream), b"OPTIONS * RTSP/1.0\r\n");
        h.upstream.write_all(b"RTSP/1.0 200 OK\r\n").unwrap();
        assert_eq!(read_some(&mut h.client), b"RTSP/1.0 200 OK\r\n");

        drop(h.client);
        assert_eq!(h.session.join().unwrap().unwrap(), SessionEnd::ClientClosed);
    }

    #[test]
    fn idle_client_times_out_without_forwarding() {
        let mut h = spawn_session(Duration::from_millis(200));

        assert_eq!(h.session.join().unwrap().unwrap(), SessionEnd::IdleTimeout);
        assert!(read_some(&mut h.upstream).is_empty());
        assert!(read_some(&mut h.client).is_empty());
    }

    #[test]
    fn client_closing_early_ends_session() {
        let h = spawn_session(DEFAULT_IDLE_TIMEOUT);
        let mut upstream = h.upstream;

        drop(h.client);
        assert_eq!(h.session.join().unwrap().unwrap(), SessionEnd::ClientClosed);
        assert!(read_some(&mut upstream).is_empty());
    }

    #[test]
    fn destination_closing_ends_session() {
        let mut h = spawn_session(DEFAULT_IDLE_TIMEOUT);

        h.client.write_all(b"DESCRIBE rtsp://10.1.1.32/ RTSP/1.0\r\n").unwrap();
        read_some(&mut h.upstream);
        drop(h.upstream);

        assert_eq!(h.session.join().unwrap().unwrap(), SessionEnd::UpstreamClosed);
        assert!(read_some(&mut h.client).is_empty());
    }

    #[test]
    fn client_reset_before_reply_is_a_send_failure() {
        let mut h = spawn_session(DEFAULT_IDLE_TIMEOUT);

        h.client.write_all(b"OPTIONS * RTSP/1.0\r\n").unwrap();
        read_some(&mut h.upstream);
        reset(h.client);
        thread::sleep(Duration::from_millis(50));

        h.upstream.write_all(b"RTSP/1.0 200 OK\r\n").unwrap();
        assert_eq!(h.session.join().unwrap().unwrap(), SessionEnd::SendFailed(Leg::Client));
        assert!(read_some(&mut h.upstream).is_empty());
    }

    #[test]
    fn destination_reset_is_a_receive_failure() {
        let mut h = spawn_session(DEFAULT_IDLE_TIMEOUT);

        h.client.write_all(b"SETUP rtsp://10.1.1.32/stream1 RTSP/1.0\r\n").unwrap();
        read_some(&mut h.upstream);
        reset(h.upstream);

        assert_eq!(h.session.join().unwrap().unwrap(), SessionEnd::ReceiveFailed(Leg::Upstream));
        assert!(read_some(&mut h.client).is_empty());
    }

    #[test]
    fn end_reasons_are_distinct() {
        let ends = [
            SessionEnd::IdleTimeout,
            SessionEnd::ClientClosed,
            SessionEnd::UpstreamClosed,
            SessionEnd::Teardown,
            SessionEnd::SendFailed(Leg::Client),
            SessionEnd::SendFailed(Leg::Upstream),
            SessionEnd::ReceiveFailed(Leg::Client),
            SessionEnd::ReceiveFailed(Leg::Upstream),
        ];
        let mut reasons: Vec<_> = ends.iter().map(SessionEnd::reason).collect();
        reasons.sort_unstable();
        reasons.dedup();
        assert_eq!(reasons.len(), ends.len());
    }
}
