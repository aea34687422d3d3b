use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::RwLock;

use crate::error::{RelayError, Result};
use crate::rewrite::RewriteRule;
use crate::session::{
    DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT, ProxySession, SessionEnd, SessionInfo,
};
use crate::transport::{ProxyListener, original_destination};

/// Port the relay listens on; TPROXY rules redirect port 554 here.
pub const DEFAULT_LISTEN_PORT: u16 = 5540;

/// RTSP control port on the real destination.
pub const RTSP_PORT: u16 = 554;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Process-wide relay configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the intercepting socket binds to.
    pub listen_addr: SocketAddr,
    /// Port the upstream leg connects to on the original destination.
    pub upstream_port: u16,
    /// How long a new session waits for the client's first message.
    pub idle_timeout: Duration,
    /// Capacity of each session's message buffer.
    pub buffer_size: usize,
    /// Set `IP_TRANSPARENT` on the listener. Needs `CAP_NET_ADMIN`.
    pub transparent: bool,
    /// Address substitution applied to client-to-destination messages.
    pub rewrite: RewriteRule,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::UNSPECIFIED,
                DEFAULT_LISTEN_PORT,
            )),
            upstream_port: RTSP_PORT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            transparent: true,
            rewrite: RewriteRule::default(),
        }
    }
}

/// Shared view of the session being relayed and how many have finished.
#[derive(Clone, Default)]
struct SessionTracker {
    active: Arc<RwLock<Option<SessionInfo>>>,
    served: Arc<AtomicU64>,
}

impl SessionTracker {
    fn begin(&self, info: SessionInfo) {
        *self.active.write() = Some(info);
    }

    /// Clear the active session; only sessions that reached Closing count
    /// as served.
    fn finish(&self, closed: bool) {
        *self.active.write() = None;
        if closed {
            self.served.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Transparent RTSP relay.
///
/// Accepts intercepted connections one at a time: each session is relayed
/// to completion before the next connection is accepted. Fatal errors
/// (listener setup, destination recovery, upstream connect) stop the
/// accept loop and are returned to the caller.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    running: Arc<AtomicBool>,
    tracker: SessionTracker,
    worker: Option<JoinHandle<Result<()>>>,
    local_addr: Option<SocketAddr>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
            running: Arc::new(AtomicBool::new(false)),
            tracker: SessionTracker::default(),
            worker: None,
            local_addr: None,
        }
    }

    /// Bind and serve on the calling thread.
    ///
    /// Only returns on a fatal error; a healthy relay runs until the
    /// process is killed.
    pub fn run(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        let result = self.bind().and_then(|listener| {
            accept_loop(
                listener,
                self.config.clone(),
                self.running.clone(),
                self.tracker.clone(),
            )
        });
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// Bind and serve on a background thread.
    ///
    /// Returns the bound address, which differs from the configured one
    /// when port 0 was requested.
    pub fn start(&mut self) -> Result<SocketAddr> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        let listener = self.bind()?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        self.running.store(true, Ordering::SeqCst);
        self.local_addr = Some(local_addr);

        let config = self.config.clone();
        let running = self.running.clone();
        let tracker = self.tracker.clone();

        self.worker = Some(thread::spawn(move || {
            let result = accept_loop(listener, config, running.clone(), tracker);
            if let Err(e) = &result {
                tracing::error!(error = %e, "relay stopped");
            }
            running.store(false, Ordering::SeqCst);
            result
        }));

        Ok(local_addr)
    }

    /// Ask the accept loop to exit. A session in progress is relayed to
    /// completion first.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("relay stopping");
    }

    /// Wait for the background accept loop to exit and return its outcome.
    pub fn wait(&mut self) -> Result<()> {
        let worker = self.worker.take().ok_or(RelayError::NotStarted)?;
        worker
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("accept loop panicked").into()))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address bound by [`start`](Self::start).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// The session currently being relayed, if any.
    pub fn active_session(&self) -> Option<SessionInfo> {
        self.tracker.active.read().clone()
    }

    /// Number of sessions that reached Closing.
    pub fn sessions_served(&self) -> u64 {
        self.tracker.served.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config.clone()
    }

    fn bind(&self) -> Result<ProxyListener> {
        let listener = ProxyListener::bind(self.config.listen_addr, self.config.transparent)?;
        tracing::info!(
            addr = %listener.local_addr()?,
            transparent = self.config.transparent,
            "RTSP relay listening"
        );
        Ok(listener)
    }
}

/// Sequential accept loop.
///
/// With a non-blocking listener the `running` flag is polled every 50ms;
/// with a blocking one it is only checked between sessions.
fn accept_loop(
    listener: ProxyListener,
    config: Arc<ProxyConfig>,
    running: Arc<AtomicBool>,
    tracker: SessionTracker,
) -> Result<()> {
    while running.load(Ordering::SeqCst) {
        match listener.accept_next() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::warn!(%peer, error = %e, "failed to configure accepted socket");
                    continue;
                }
                serve(stream, peer, &config, &tracker)?;
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    tracing::warn!(error = %e, "TCP accept error");
                }
                if let Some(delay) = accept_backoff(&e) {
                    thread::sleep(delay);
                }
            }
        }
    }
    tracing::debug!("accept loop exited");
    Ok(())
}

/// How long to pause after a failed accept.
///
/// Nothing pending and persistent failures (e.g. EMFILE) both wait a poll
/// interval so a blocking listener cannot spin; EINTR retries at once.
fn accept_backoff(error: &io::Error) -> Option<Duration> {
    match error.kind() {
        io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_POLL_INTERVAL),
    }
}

/// Resolve, connect and relay one intercepted connection.
fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    config: &Arc<ProxyConfig>,
    tracker: &SessionTracker,
) -> Result<SessionEnd> {
    let destination = original_destination(&stream)?;
    tracing::info!(%peer, %destination, "connection accepted");

    let session = ProxySession::connect(stream, peer, destination, config.clone())?;
    tracker.begin(session.info().clone());
    let result = session.run();
    tracker.finish(result.is_ok());
    result
}
