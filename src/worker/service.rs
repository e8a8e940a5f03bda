use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::proto::worker_server::Worker;
use crate::proto::{
    JobRequest, JobResponse, JobState as ProtoJobState, JobsRequest, JobsResponse, LogType,
    LogsRequest, LogsResponse, RUsage, RunRequest, RunResponse, StatusRequest, StatusResponse,
    Timeval,
};

use super::job::{chunk_log, Job, JobState};
use super::{RunError, WorkerCore};

/// The RPC surface of one worker, bound to one [`WorkerCore`].
pub struct WorkerService {
    core: Arc<WorkerCore>,
}

impl WorkerService {
    pub fn new(core: Arc<WorkerCore>) -> Self {
        Self { core }
    }
}

#[tonic::async_trait]
impl Worker for WorkerService {
    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let stat = self
            .core
            .status()
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(Response::new(StatusResponse {
            ip: stat.ip.to_string(),
            hostname: stat.hostname,
            total_ram: stat.total_ram,
            free_ram: stat.free_ram,
            load: stat.load,
        }))
    }

    async fn run(&self, request: Request<RunRequest>) -> Result<Response<RunResponse>, Status> {
        let req = request.into_inner();
        if req.cmd.trim().is_empty() {
            return Err(Status::invalid_argument("command cannot be empty"));
        }

        match self.core.run(&req.cmd, req.ram).await {
            Ok(id) => Ok(Response::new(RunResponse { job_id: id })),
            Err(e @ (RunError::NotEnoughRam { .. } | RunError::LoadTooHigh { .. })) => {
                tracing::info!(error = %e, "rejecting job");
                Err(Status::unavailable(e.to_string()))
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to start job");
                Err(Status::internal(e.to_string()))
            }
        }
    }

    async fn job(&self, request: Request<JobRequest>) -> Result<Response<JobResponse>, Status> {
        let req = request.into_inner();
        let job = self
            .core
            .job(req.id)
            .await
            .ok_or_else(|| Status::not_found(format!("job {} not found", req.id)))?;
        Ok(Response::new(job_response(&job)))
    }

    async fn jobs(&self, _request: Request<JobsRequest>) -> Result<Response<JobsResponse>, Status> {
        Ok(Response::new(JobsResponse {
            id: self.core.job_ids().await,
        }))
    }

    type LogsStream = ReceiverStream<Result<LogsResponse, Status>>;

    async fn logs(
        &self,
        request: Request<LogsRequest>,
    ) -> Result<Response<Self::LogsStream>, Status> {
        let req = request.into_inner();
        if self.core.job(req.job_id).await.is_none() {
            return Err(Status::not_found(format!("job {} not found", req.job_id)));
        }

        let want = req.r#type();
        let core = Arc::clone(&self.core);
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            tracing::info!(job_id = req.job_id, "waiting for job to complete");
            let Some(job) = core.wait_complete(req.job_id).await else {
                // The table is never purged, so this only races shutdown.
                return;
            };

            if matches!(want, LogType::Stdout | LogType::Both) {
                if !send_chunks(&tx, LogType::Stdout, &job.stdout).await {
                    return;
                }
            }
            if matches!(want, LogType::Stderr | LogType::Both) {
                send_chunks(&tx, LogType::Stderr, &job.stderr).await;
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Sends one chunk per captured line. Returns false when the consumer is
/// gone, which aborts the stream.
async fn send_chunks(
    tx: &mpsc::Sender<Result<LogsResponse, Status>>,
    log_type: LogType,
    bytes: &[u8],
) -> bool {
    for chunk in chunk_log(bytes) {
        let resp = LogsResponse {
            r#type: log_type as i32,
            chunk,
        };
        if tx.send(Ok(resp)).await.is_err() {
            tracing::warn!("log stream consumer disconnected");
            return false;
        }
    }
    true
}

fn job_response(job: &Job) -> JobResponse {
    JobResponse {
        start_time: job.start.timestamp(),
        end_time: job.end.map(|t| t.timestamp()).unwrap_or(0),
        state: state_to_proto(job.state) as i32,
        success: job.success.unwrap_or(false),
        rusage: job.rusage.map(|ru| RUsage {
            utime: Some(Timeval {
                sec: ru.utime_sec,
                usec: ru.utime_usec,
            }),
            stime: Some(Timeval {
                sec: ru.stime_sec,
                usec: ru.stime_usec,
            }),
            maxrss: ru.maxrss_kb,
        }),
    }
}

fn state_to_proto(state: JobState) -> ProtoJobState {
    match state {
        JobState::Pending => ProtoJobState::Pending,
        JobState::Running => ProtoJobState::Running,
        JobState::Complete => ProtoJobState::Complete,
    }
}
