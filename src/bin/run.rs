use std::io::Write;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use drover::client::{best_worker, WorkerHandle};
use drover::config::DiscoveryConfig;
use drover::discovery;
use drover::proto::{LogType, LogsRequest, RunRequest};

#[derive(Parser, Debug)]
#[command(name = "drover-run")]
#[command(about = "Run a command on the best available pool worker")]
struct Args {
    /// The command to run
    #[arg(long)]
    cmd: String,

    /// The amount of RAM in bytes to reserve for the command
    #[arg(long, default_value_t = 0)]
    ram: u64,

    /// Wait for the command to complete and stream its output
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    wait: bool,

    /// The multicast address to use for discovery
    #[arg(long, default_value = drover::config::DEFAULT_GROUP)]
    addr: SocketAddr,

    /// The port to listen on for discovery replies
    #[arg(long, default_value_t = drover::config::DEFAULT_CLIENT_DISCOVERY_PORT)]
    port: u16,

    /// Number of times to retry finding a worker and submitting
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Seconds to wait between retries
    #[arg(long, default_value_t = 10)]
    retry_wait: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = DiscoveryConfig {
        group: args.addr,
        ..Default::default()
    }
    .with_reply_port(args.port);
    let retry_wait = Duration::from_secs(args.retry_wait);

    let mut submitted: Option<(WorkerHandle, i64)> = None;
    let mut errs: Vec<String> = Vec::new();

    for attempt in 1..=args.retries {
        // Each attempt runs a whole fresh scan; membership is soft state.
        let best = match discovery::scan(&config).await {
            Ok(mut endpoints) => best_worker(&mut endpoints, args.ram).await,
            Err(e) => {
                errs.push(format!("discovery failed: {e}"));
                None
            }
        };

        let Some(mut worker) = best else {
            errs.push("failed to identify best worker".to_string());
            tracing::warn!(attempt, "no admissible worker found");
            tokio::time::sleep(retry_wait).await;
            continue;
        };
        tracing::info!(worker = %worker.id, "best worker found");

        let req = RunRequest {
            cmd: args.cmd.clone(),
            ram: args.ram,
        };
        match worker.client.run(req).await {
            Ok(resp) => {
                submitted = Some((worker, resp.into_inner().job_id));
                break;
            }
            Err(e) => {
                errs.push(format!("failed to run command: {e}"));
                tracing::warn!(attempt, worker = %worker.id, error = %e, "run rejected");
                tokio::time::sleep(retry_wait).await;
            }
        }
    }

    let Some((mut worker, job_id)) = submitted else {
        for e in &errs {
            tracing::error!("{e}");
            eprintln!("drover-run: {e}");
        }
        std::process::exit(1);
    };
    tracing::info!(job_id, worker = %worker.id, "running job");

    if !args.wait {
        println!("{job_id}");
        return;
    }

    // The logs stream only opens once the job is complete, so there is no
    // need to poll Job in between.
    let req = LogsRequest {
        job_id,
        r#type: LogType::Both as i32,
    };
    let mut stream = match worker.client.logs(req).await {
        Ok(resp) => resp.into_inner(),
        Err(e) => {
            eprintln!("drover-run: failed to stream logs: {e}");
            std::process::exit(1);
        }
    };

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    loop {
        match stream.message().await {
            Ok(Some(resp)) => {
                if resp.chunk.is_empty() {
                    continue;
                }
                let result = match resp.r#type() {
                    LogType::Stderr => stderr.write_all(&resp.chunk),
                    _ => stdout.write_all(&resp.chunk),
                };
                if let Err(e) = result {
                    eprintln!("drover-run: failed to write output: {e}");
                    std::process::exit(1);
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("drover-run: log stream failed: {e}");
                std::process::exit(1);
            }
        }
    }
    let _ = stdout.flush();
    let _ = stderr.flush();
}
