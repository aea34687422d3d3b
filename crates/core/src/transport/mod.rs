//! Socket plumbing for transparent interception.
//!
//! The relay expects the kernel to steer RTSP control traffic to it with
//! TPROXY while leaving the original destination on the accepted socket:
//!
//! ```text
//! iptables -t mangle -N DIVERT
//! iptables -t mangle -A PREROUTING -p tcp -m socket -j DIVERT
//! iptables -t mangle -A DIVERT -j MARK --set-mark 1
//! iptables -t mangle -A DIVERT -j ACCEPT
//! ip rule add fwmark 1 lookup 100
//! ip route add local 0.0.0.0/0 dev lo table 100
//! iptables -t mangle -A PREROUTING -p tcp --dport 554 -j TPROXY --tproxy-mark 0x1/0x1 --on-port 5540
//! ```
//!
//! - [`listener`]: the `IP_TRANSPARENT` listening socket.
//! - [`destination`]: recovering the dialed endpoint from an accepted socket.

pub mod destination;
pub mod listener;

pub use destination::{Endpoint, original_destination};
pub use listener::ProxyListener;
