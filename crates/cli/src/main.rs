use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rtsp_relay::rewrite::{DEFAULT_REPLACE_ADDRESS, DEFAULT_SEARCH_ADDRESS};
use rtsp_relay::{ProxyConfig, ProxyServer, RewriteRule};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "Transparent RTSP relay that rewrites an internal camera address"
)]
struct Args {
    /// Address to accept TPROXY-redirected connections on
    #[arg(long, short, default_value = "0.0.0.0:5540")]
    listen: SocketAddr,

    /// RTSP port on the original destination
    #[arg(long, default_value_t = 554)]
    upstream_port: u16,

    /// Address to look for in client messages
    #[arg(long, default_value = DEFAULT_SEARCH_ADDRESS)]
    search: String,

    /// Address substituted for the first match
    #[arg(long, default_value = DEFAULT_REPLACE_ADDRESS)]
    replace: String,

    /// Seconds to wait for a client's first message
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u64).range(1..))]
    idle_timeout: u64,

    /// Per-session message buffer size in bytes
    #[arg(long, default_value_t = 2000)]
    buffer_size: usize,

    /// Do not set IP_TRANSPARENT on the listener (REDIRECT setups, testing)
    #[arg(long)]
    no_transparent: bool,

    /// Stay in the foreground and trace every relayed message
    #[arg(long, short)]
    debug: bool,
}

impl Args {
    fn config(&self) -> ProxyConfig {
        ProxyConfig {
            listen_addr: self.listen,
            upstream_port: self.upstream_port,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            buffer_size: self.buffer_size,
            transparent: !self.no_transparent,
            rewrite: RewriteRule::new(self.search.as_str(), self.replace.as_str()),
        }
    }
}

/// Console tracing in debug mode; plain lifecycle lines otherwise, left for
/// the supervising init system to timestamp and collect.
fn init_logging(debug: bool) {
    let default_level = if debug { "trace" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if debug {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_target(false)
            .without_time()
            .init();
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.debug);

    let server = ProxyServer::new(args.config());
    tracing::info!(
        search = %args.search,
        replace = %args.replace,
        upstream_port = args.upstream_port,
        "starting RTSP relay"
    );

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}
