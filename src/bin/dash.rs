use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use drover::config::DiscoveryConfig;
use drover::dashboard::{discovery_loop, run_dashboard, status_loop, DashboardState};
use drover::shutdown::shutdown_token;

#[derive(Parser, Debug)]
#[command(name = "drover-dash")]
#[command(about = "A read-only dashboard over the compute pool")]
struct Args {
    /// The port on which to listen for HTTP
    #[arg(long, default_value_t = drover::config::DEFAULT_HTTP_PORT)]
    port: u16,

    /// The multicast address to use for discovery
    #[arg(long, default_value = drover::config::DEFAULT_GROUP)]
    addr: SocketAddr,

    /// The port on which to listen for discovery replies
    #[arg(long, default_value_t = drover::config::DEFAULT_DASHBOARD_DISCOVERY_PORT)]
    dport: u16,

    /// Seconds to wait between discovery attempts
    #[arg(long, default_value_t = 60)]
    poll: u64,

    /// Seconds to wait between status updates
    #[arg(long, default_value_t = 10)]
    status_poll: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let shutdown = shutdown_token();
    let state = DashboardState::default();

    let config = DiscoveryConfig {
        group: args.addr,
        ..Default::default()
    }
    .with_reply_port(args.dport);

    tokio::spawn(discovery_loop(
        state.clone(),
        config,
        Duration::from_secs(args.poll),
        shutdown.clone(),
    ));
    tokio::spawn(status_loop(
        state.clone(),
        Duration::from_secs(args.status_poll),
        shutdown.clone(),
    ));

    let http_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    run_dashboard(http_addr, state, shutdown).await?;

    Ok(())
}
