//! Transparent relay for RTSP control connections.
//!
//! Sits between an RTSP client and the camera it dialed. Connections to
//! port 554 are redirected here by TPROXY (see [`transport`]); the relay
//! recovers the original destination, connects to it, and shuttles
//! request/response rounds between the two, rewriting the camera's
//! internal address into its public one on the way out. A `TEARDOWN`
//! from the client closes the pair once its reply has been delivered.

pub mod error;
pub mod rewrite;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{RelayError, Result};
pub use rewrite::RewriteRule;
pub use server::{ProxyConfig, ProxyServer};
pub use session::{Leg, ProxySession, SessionEnd, SessionInfo};
pub use transport::{Endpoint, ProxyListener};
