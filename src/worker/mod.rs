//! The worker job engine.
//!
//! [`WorkerCore`] owns the job table and id counter; the RPC service binds
//! to exactly one core, so the engine can be exercised in-process without a
//! server. Admission is synchronous and instantaneous: a `Run` either
//! spawns the child before returning or fails.
//!
//! Each admitted job gets a supervisory task that drains stdout and stderr
//! concurrently and only then reaps the child. The order is load-bearing:
//! a child that fills a pipe while the worker is already in `wait` would
//! block forever.

pub mod job;
pub mod service;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, RwLock};

use crate::config::WorkerConfig;
use crate::system::SystemProbe;
use job::{Job, JobState, ResourceUsage};

pub use service::WorkerService;

/// Fallback re-poll interval for completion waiters. The `Notify` signal is
/// the primary wakeup; the poll only covers a missed edge.
const COMPLETE_POLL: Duration = Duration::from_secs(3);

/// Why an admission was denied or a spawn failed.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("not enough available RAM; {want} vs {have}")]
    NotEnoughRam { want: u64, have: u64 },

    #[error("under too high load: {load:.3} (limit: {limit:.3})")]
    LoadTooHigh { load: f64, limit: f64 },

    #[error("failed to run {cmd:?}: {source}")]
    Spawn {
        cmd: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Probe(#[from] crate::error::PoolError),
}

/// Momentary resource snapshot of this worker.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub ip: Ipv4Addr,
    pub hostname: String,
    pub total_ram: u64,
    pub free_ram: u64,
    pub load: f64,
}

struct JobTable {
    next_job_id: i64,
    jobs: HashMap<i64, Job>,
}

/// The job table, id counter, and admission policy of one worker.
pub struct WorkerCore {
    config: WorkerConfig,
    probe: Box<dyn SystemProbe>,
    table: RwLock<JobTable>,
    /// Signalled on every completion; waiters re-check the table.
    completed: Notify,
}

impl WorkerCore {
    pub fn new(config: WorkerConfig, probe: Box<dyn SystemProbe>) -> Arc<Self> {
        Arc::new(Self {
            config,
            probe,
            table: RwLock::new(JobTable {
                next_job_id: 0,
                jobs: HashMap::new(),
            }),
            completed: Notify::new(),
        })
    }

    /// Momentary status, read from OS counters on every call.
    pub fn status(&self) -> crate::error::Result<StatusSnapshot> {
        let mem = self.probe.memory()?;
        let load = self.probe.load5()?;
        Ok(StatusSnapshot {
            ip: crate::net::external_ipv4()?,
            hostname: crate::system::hostname(),
            total_ram: mem.total,
            free_ram: mem.available,
            load,
        })
    }

    /// Admission plus spawn. Returns the job id as soon as the child has
    /// started; output capture and the reap happen in a supervisory task.
    pub async fn run(self: &Arc<Self>, cmd: &str, ram: u64) -> Result<i64, RunError> {
        let mem = self.probe.memory()?;
        if ram > mem.available {
            return Err(RunError::NotEnoughRam {
                want: ram,
                have: mem.available,
            });
        }
        let load = self.probe.load5()?;
        if load > self.config.load_limit {
            return Err(RunError::LoadTooHigh {
                load,
                limit: self.config.load_limit,
            });
        }

        // Reserve the id before spawning so concurrent Runs never share one.
        let id = {
            let mut table = self.table.write().await;
            table.next_job_id += 1;
            let id = table.next_job_id;
            table.jobs.insert(id, Job::pending());
            id
        };

        tracing::info!(id, cmd, "running command via sh -c");
        let spawned = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.table.write().await.jobs.remove(&id);
                return Err(RunError::Spawn {
                    cmd: cmd.to_string(),
                    source: e,
                });
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        {
            let mut table = self.table.write().await;
            if let Some(job) = table.jobs.get_mut(&id) {
                job.start = Utc::now();
                job.state = JobState::Running;
            }
        }

        let core = Arc::clone(self);
        tokio::spawn(async move {
            core.supervise(id, child, stdout, stderr).await;
        });

        Ok(id)
    }

    /// Non-blocking snapshot of one job.
    pub async fn job(&self, id: i64) -> Option<Job> {
        self.table.read().await.jobs.get(&id).cloned()
    }

    /// Known job ids, in arbitrary order.
    pub async fn job_ids(&self) -> Vec<i64> {
        self.table.read().await.jobs.keys().copied().collect()
    }

    /// Blocks until the job completes, then returns its frozen snapshot.
    /// Returns `None` if the id was never issued.
    pub async fn wait_complete(&self, id: i64) -> Option<Job> {
        loop {
            // Arm the wakeup before checking, or a completion landing
            // between check and wait would be missed.
            let notified = self.completed.notified();
            {
                let table = self.table.read().await;
                match table.jobs.get(&id) {
                    None => return None,
                    Some(job) if job.complete() => return Some(job.clone()),
                    Some(_) => {}
                }
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(COMPLETE_POLL) => {
                    tracing::debug!(id, "still waiting for job to complete");
                }
            }
        }
    }

    /// Drains both pipes, reaps the child, and freezes the job record.
    /// Always marks the job complete, even when a drain or the reap failed,
    /// so log waiters eventually unblock.
    async fn supervise(
        &self,
        id: i64,
        child: Child,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
    ) {
        // Both drains run to EOF before the reap is attempted.
        let out_task = tokio::task::spawn_blocking(move || drain(stdout));
        let err_task = tokio::task::spawn_blocking(move || drain(stderr));
        let (out, err) = tokio::join!(out_task, err_task);
        let stdout = capture(id, "stdout", out);
        let stderr = capture(id, "stderr", err);

        let pid = child.id() as libc::pid_t;
        let reaped = tokio::task::spawn_blocking(move || reap(pid, child)).await;
        let (success, rusage) = match reaped {
            Ok(Ok((success, rusage))) => (success, Some(rusage)),
            Ok(Err(e)) => {
                tracing::error!(id, error = %e, "failed to reap child");
                (false, None)
            }
            Err(e) => {
                tracing::error!(id, error = %e, "reap task failed");
                (false, None)
            }
        };

        tracing::info!(id, success, "marking job as complete");
        {
            let mut table = self.table.write().await;
            if let Some(job) = table.jobs.get_mut(&id) {
                job.stdout = stdout;
                job.stderr = stderr;
                job.success = Some(success);
                job.rusage = rusage;
                job.end = Some(Utc::now());
                job.state = JobState::Complete;
            }
        }
        self.completed.notify_waiters();
    }
}

fn drain<R: std::io::Read>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        std::io::Read::read_to_end(&mut pipe, &mut buf)?;
    }
    Ok(buf)
}

fn capture(
    id: i64,
    stream: &str,
    result: Result<std::io::Result<Vec<u8>>, tokio::task::JoinError>,
) -> Vec<u8> {
    match result {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            tracing::error!(id, stream, error = %e, "failed to read child pipe");
            format!("failed to read {stream}: {e}\n").into_bytes()
        }
        Err(e) => {
            tracing::error!(id, stream, error = %e, "pipe drain task failed");
            format!("failed to read {stream}: {e}\n").into_bytes()
        }
    }
}

/// Reaps the child via `wait4` so exit status and rusage come from the same
/// syscall, exactly once. The `Child` is consumed; its own `wait` is never
/// called.
fn reap(pid: libc::pid_t, child: Child) -> std::io::Result<(bool, ResourceUsage)> {
    let mut status: libc::c_int = 0;
    let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut rusage) };
        if rc >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            drop(child);
            return Err(err);
        }
    }
    drop(child);

    let success = libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0;
    Ok((
        success,
        ResourceUsage {
            utime_sec: rusage.ru_utime.tv_sec as i64,
            utime_usec: rusage.ru_utime.tv_usec as i64,
            stime_sec: rusage.ru_stime.tv_sec as i64,
            stime_usec: rusage.ru_stime.tv_usec as i64,
            maxrss_kb: rusage.ru_maxrss as i64,
        },
    ))
}
