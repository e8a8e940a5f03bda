//! Read-only dashboard over the pool.
//!
//! Two loops share state: a discovery loop that rebuilds the worker map
//! from a fresh scan each round (membership is soft state; a worker that
//! misses a window is forgotten), and a status loop that polls every known
//! worker for its status and job table. Rendering only ever takes read
//! locks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::client::WorkerHandle;
use crate::config::DiscoveryConfig;
use crate::discovery;
use crate::proto::{
    JobRequest, JobResponse, JobState, JobsRequest, StatusRequest, StatusResponse,
};

/// Shared state of the dashboard, keyed by worker id (`host:port`).
#[derive(Clone, Default)]
pub struct DashboardState {
    pub workers: Arc<RwLock<HashMap<String, WorkerHandle>>>,
    pub status: Arc<RwLock<HashMap<String, StatusResponse>>>,
    pub jobs: Arc<RwLock<HashMap<String, HashMap<i64, JobResponse>>>>,
}

#[derive(Serialize)]
struct WorkerView {
    id: String,
    ip: String,
    hostname: String,
    total_ram: u64,
    free_ram: u64,
    total_gb: String,
    free_gb: String,
    load: f64,
}

#[derive(Serialize)]
struct JobView {
    id: i64,
    state: String,
    success: bool,
    start_time: i64,
    end_time: i64,
    duration_secs: i64,
}

#[derive(Serialize)]
struct WorkerJobsView {
    worker: String,
    active: Vec<JobView>,
    inactive: Vec<JobView>,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index_handler))
        .route("/api/workers", get(workers_handler))
        .route("/api/jobs", get(jobs_handler))
        .layer(cors)
        .with_state(state)
}

/// Serves the dashboard until the token fires. Failing to bind the
/// listener is fatal; the caller exits with the error.
pub async fn run_dashboard(
    addr: SocketAddr,
    state: DashboardState,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let app = router(state);

    tracing::info!(addr = %addr, "starting dashboard server");

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "failed to bind dashboard server");
        e
    })?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "dashboard server failed");
            e
        })?;

    Ok(())
}

pub async fn index_handler() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

pub async fn workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let status = state.status.read().await;
    let mut workers: Vec<WorkerView> = status
        .iter()
        .map(|(id, stat)| WorkerView {
            id: id.clone(),
            ip: stat.ip.clone(),
            hostname: stat.hostname.clone(),
            total_ram: stat.total_ram,
            free_ram: stat.free_ram,
            total_gb: gb(stat.total_ram),
            free_gb: gb(stat.free_ram),
            load: stat.load,
        })
        .collect();
    workers.sort_by(|a, b| a.id.cmp(&b.id));

    Json(workers)
}

pub async fn jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let jobs = state.jobs.read().await;
    let mut views: Vec<WorkerJobsView> = jobs
        .iter()
        .map(|(worker, jobs)| {
            let mut active = Vec::new();
            let mut inactive = Vec::new();
            for (id, job) in jobs {
                let view = job_view(*id, job);
                match job.state() {
                    JobState::Pending | JobState::Running => active.push(view),
                    JobState::Unknown | JobState::Complete => inactive.push(view),
                }
            }
            active.sort_by_key(|j| j.id);
            inactive.sort_by_key(|j| j.id);
            WorkerJobsView {
                worker: worker.clone(),
                active,
                inactive,
            }
        })
        .collect();
    views.sort_by(|a, b| a.worker.cmp(&b.worker));

    Json(views)
}

fn job_view(id: i64, job: &JobResponse) -> JobView {
    JobView {
        id,
        state: state_name(job.state()).to_string(),
        success: job.success,
        start_time: job.start_time,
        end_time: job.end_time,
        duration_secs: if job.end_time == 0 {
            0
        } else {
            job.end_time - job.start_time
        },
    }
}

fn state_name(state: JobState) -> &'static str {
    match state {
        JobState::Unknown => "unknown",
        JobState::Pending => "pending",
        JobState::Running => "running",
        JobState::Complete => "complete",
    }
}

fn gb(bytes: u64) -> String {
    format!("{:.3}", bytes as f64 / (1000.0 * 1000.0 * 1000.0))
}

/// Repeats the discovery scan, rebuilding the worker map from scratch each
/// round so workers that miss a window age out.
pub async fn discovery_loop(
    state: DashboardState,
    config: DiscoveryConfig,
    poll: Duration,
    shutdown: CancellationToken,
) {
    loop {
        match discovery::scan(&config).await {
            Ok(mut endpoints) => {
                state.workers.write().await.clear();
                while let Some(endpoint) = endpoints.recv().await {
                    handle_discovery(&state, &endpoint).await;
                }
            }
            Err(e) => tracing::error!(error = %e, "discovery scan failed"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

async fn handle_discovery(state: &DashboardState, endpoint: &str) {
    tracing::info!(endpoint, "discovered worker");

    let addr = match discovery::parse_endpoint(endpoint) {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "skipping endpoint");
            return;
        }
    };

    let mut handle = match WorkerHandle::connect(&addr.ip().to_string(), addr.port()).await {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(endpoint, error = %e, "failed to connect to worker");
            return;
        }
    };
    let id = handle.id.clone();

    match handle.client.status(StatusRequest {}).await {
        Ok(resp) => {
            state.status.write().await.insert(id.clone(), resp.into_inner());
        }
        Err(e) => {
            tracing::warn!(worker = %id, error = %e, "dropping status after failure");
            state.status.write().await.remove(&id);
        }
    }

    state.workers.write().await.insert(id, handle);
}

/// Polls every known worker for status, then its job list, then each job.
/// Individual failures log and continue; this loop never removes a worker.
pub async fn status_loop(state: DashboardState, poll: Duration, shutdown: CancellationToken) {
    loop {
        let handles: Vec<WorkerHandle> = state.workers.read().await.values().cloned().collect();

        for mut handle in handles {
            let id = handle.id.clone();

            let stat = match handle.client.status(StatusRequest {}).await {
                Ok(resp) => resp.into_inner(),
                Err(e) => {
                    tracing::warn!(worker = %id, error = %e, "failed to get status");
                    continue;
                }
            };
            state.status.write().await.insert(id.clone(), stat);

            let job_ids = match handle.client.jobs(JobsRequest {}).await {
                Ok(resp) => resp.into_inner().id,
                Err(e) => {
                    tracing::warn!(worker = %id, error = %e, "failed to list jobs");
                    continue;
                }
            };

            let mut jobs = HashMap::new();
            for job_id in job_ids {
                match handle.client.job(JobRequest { id: job_id }).await {
                    Ok(resp) => {
                        jobs.insert(job_id, resp.into_inner());
                    }
                    Err(e) => {
                        tracing::warn!(worker = %id, job_id, error = %e, "failed to get job");
                    }
                }
            }
            state.jobs.write().await.insert(id, jobs);
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(poll) => {}
        }
    }
}
