//! Client-side plumbing: dialing workers and picking the best one.

use tokio::sync::mpsc;
use tonic::transport::Channel;

use crate::discovery::parse_endpoint;
use crate::error::Result;
use crate::proto::worker_client::WorkerClient;
use crate::proto::StatusRequest;

/// A dialed worker. The canonical `host:port` endpoint doubles as its id.
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: String,
    pub client: WorkerClient<Channel>,
}

impl WorkerHandle {
    /// Dials the worker's RPC endpoint. The connection is owned by the
    /// handle and closed when the handle is dropped.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let id = format!("{host}:{port}");
        let client = WorkerClient::connect(format!("http://{id}")).await?;
        Ok(Self { id, client })
    }
}

/// Admission predicate: a worker can host the job only if its free RAM
/// strictly exceeds the reservation.
fn admissible(free_ram: u64, ram: u64) -> bool {
    free_ram > ram
}

/// Consumes a discovery sequence and returns the admissible worker with the
/// least free RAM that still exceeds `ram` — tightest fit, so roomier
/// workers stay free for larger jobs. Ties keep the first seen.
///
/// Candidates that fail to parse, dial, or report status are logged and
/// skipped. A superseded candidate's connection is dropped before the
/// replacement is kept. Returns `None` when no worker is admissible.
pub async fn best_worker(endpoints: &mut mpsc::Receiver<String>, ram: u64) -> Option<WorkerHandle> {
    let mut best: Option<(WorkerHandle, u64)> = None;

    while let Some(endpoint) = endpoints.recv().await {
        tracing::info!(endpoint = %endpoint, "discovered worker");

        let addr = match parse_endpoint(&endpoint) {
            Ok(addr) => addr,
            Err(e) => {
                tracing::error!(error = %e, "skipping candidate");
                continue;
            }
        };

        let mut handle = match WorkerHandle::connect(&addr.ip().to_string(), addr.port()).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(endpoint = %endpoint, error = %e, "failed to dial worker");
                continue;
            }
        };

        let stat = match handle.client.status(StatusRequest {}).await {
            Ok(resp) => resp.into_inner(),
            Err(e) => {
                tracing::error!(worker = %handle.id, error = %e, "failed to get status");
                continue;
            }
        };
        tracing::info!(
            worker = %handle.id,
            free_ram = stat.free_ram,
            load = stat.load,
            "worker status"
        );

        if !admissible(stat.free_ram, ram) {
            continue;
        }

        match &best {
            // The held candidate is at least as tight; drop the new dial.
            Some((_, best_free)) if stat.free_ram >= *best_free => {}
            // Replacing drops any previously held candidate's connection.
            _ => best = Some((handle, stat.free_ram)),
        }
    }

    best.map(|(handle, _)| handle)
}
