use std::net::{Ipv4Addr, SocketAddr};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use drover::config::WorkerConfig;
use drover::discovery::Responder;
use drover::proto::worker_server::WorkerServer;
use drover::shutdown::shutdown_token;
use drover::system::OsProbe;
use drover::worker::{WorkerCore, WorkerService};

#[derive(Parser, Debug)]
#[command(name = "drover-worker")]
#[command(about = "A compute pool node that runs jobs for clients")]
struct Args {
    /// Port on which to listen for RPC requests
    #[arg(long, default_value_t = drover::config::DEFAULT_RPC_PORT)]
    port: u16,

    /// Multicast group address to answer discovery pings on
    #[arg(long, default_value = drover::config::DEFAULT_GROUP)]
    addr: SocketAddr,

    /// Interface address to join the multicast group on (default: any)
    #[arg(long)]
    iface: Option<Ipv4Addr>,

    /// Maximum 5-minute load average before jobs are rejected
    #[arg(long, default_value_t = 5.0)]
    load_limit: f64,
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

    let responder = Responder::new(args.addr, args.port, args.iface).await?;
    tokio::spawn(responder.run(shutdown.clone()));

    let config = WorkerConfig {
        rpc_port: args.port,
        load_limit: args.load_limit,
    };
    let core = WorkerCore::new(config, Box::new(OsProbe));

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    tracing::info!(addr = %listen_addr, "starting worker RPC server");

    tonic::transport::Server::builder()
        .add_service(WorkerServer::new(WorkerService::new(core)))
        .serve_with_shutdown(listen_addr, shutdown.cancelled_owned())
        .await?;

    Ok(())
}
