//! In-process tests of the worker job engine. No server involved: the core
//! is exercised directly, with a fixed probe driving admission.

use std::sync::Arc;

use drover::config::WorkerConfig;
use drover::system::FixedProbe;
use drover::worker::job::JobState;
use drover::worker::{RunError, WorkerCore};

const GIB: u64 = 1024 * 1024 * 1024;

fn idle_probe() -> FixedProbe {
    FixedProbe {
        total: 16 * GIB,
        available: 8 * GIB,
        load5: 0.5,
    }
}

fn test_core(probe: FixedProbe) -> Arc<WorkerCore> {
    WorkerCore::new(WorkerConfig::default(), Box::new(probe))
}

#[tokio::test]
async fn run_captures_stdout() {
    let core = test_core(idle_probe());

    let id = core.run("echo hello", 1048576).await.unwrap();
    let job = core.wait_complete(id).await.unwrap();

    assert_eq!(job.state, JobState::Complete);
    assert_eq!(job.stdout, b"hello\n");
    assert!(job.stderr.is_empty());
    assert_eq!(job.success, Some(true));
}

#[tokio::test]
async fn run_captures_stderr() {
    let core = test_core(idle_probe());

    let id = core.run("echo err 1>&2", 0).await.unwrap();
    let job = core.wait_complete(id).await.unwrap();

    assert_eq!(job.stderr, b"err\n");
    assert!(job.stdout.is_empty());
    assert_eq!(job.success, Some(true));
}

#[tokio::test]
async fn shell_semantics_apply() {
    let core = test_core(idle_probe());

    // Pipelines only work if the command really goes through sh -c.
    let id = core.run("echo 'hello world' | wc -w", 0).await.unwrap();
    let job = core.wait_complete(id).await.unwrap();

    let out = String::from_utf8(job.stdout).unwrap();
    assert_eq!(out.trim(), "2");
}

#[tokio::test]
async fn job_ids_are_monotonic_and_unique() {
    let core = test_core(idle_probe());

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(core.run("true", 0).await.unwrap());
    }

    assert_eq!(ids, vec![1, 2, 3]);
    for id in &ids {
        assert!(core.job(*id).await.is_some());
    }
}

#[tokio::test]
async fn same_command_yields_independent_jobs() {
    let core = test_core(idle_probe());

    let a = core.run("echo one", 0).await.unwrap();
    let b = core.run("echo one", 0).await.unwrap();
    assert_ne!(a, b);

    let job_a = core.wait_complete(a).await.unwrap();
    let job_b = core.wait_complete(b).await.unwrap();
    assert_eq!(job_a.stdout, b"one\n");
    assert_eq!(job_b.stdout, b"one\n");
}

#[tokio::test]
async fn rejects_when_ram_exceeds_available() {
    let probe = FixedProbe {
        total: GIB,
        available: 512 * 1024 * 1024,
        load5: 0.5,
    };
    let core = test_core(probe);

    let err = core.run("true", GIB).await.unwrap_err();
    assert!(matches!(err, RunError::NotEnoughRam { .. }));
    assert!(err.to_string().contains("not enough available RAM"));

    // Nothing was reserved for the rejected run.
    assert!(core.job_ids().await.is_empty());
}

#[tokio::test]
async fn zero_ram_reservation_is_admissible() {
    let core = test_core(idle_probe());
    assert!(core.run("true", 0).await.is_ok());
}

#[tokio::test]
async fn rejects_when_load_exceeds_limit() {
    let probe = FixedProbe {
        total: 16 * GIB,
        available: 8 * GIB,
        load5: 7.5,
    };
    let core = test_core(probe);

    let err = core.run("true", 0).await.unwrap_err();
    assert!(matches!(err, RunError::LoadTooHigh { .. }));
    assert!(err.to_string().contains("too high load"));
}

#[tokio::test]
async fn drains_output_larger_than_pipe_buffer() {
    let core = test_core(idle_probe());

    // Well past the 64 KiB pipe buffer; a wait-before-drain engine
    // deadlocks here.
    let id = core.run("seq 1 20000", 0).await.unwrap();
    let job = core.wait_complete(id).await.unwrap();

    let out = String::from_utf8(job.stdout).unwrap();
    assert_eq!(out.lines().count(), 20000);
    assert!(out.ends_with("20000\n"));
    assert_eq!(job.success, Some(true));
}

#[tokio::test]
async fn failed_command_still_completes() {
    let core = test_core(idle_probe());

    let id = core.run("nonexistent_command_12345", 0).await.unwrap();
    let job = core.wait_complete(id).await.unwrap();

    assert_eq!(job.state, JobState::Complete);
    assert_eq!(job.success, Some(false));
    assert!(!job.stderr.is_empty());
}

#[tokio::test]
async fn completion_freezes_timestamps_and_rusage() {
    let core = test_core(idle_probe());

    let id = core.run("echo done", 0).await.unwrap();
    let job = core.wait_complete(id).await.unwrap();

    let end = job.end.expect("complete job has an end time");
    assert!(end >= job.start);
    let rusage = job.rusage.expect("complete job has rusage");
    assert!(rusage.maxrss_kb >= 0);
}

#[tokio::test]
async fn job_snapshot_shows_running_before_completion() {
    let core = test_core(idle_probe());

    let id = core.run("sleep 0.4; echo done", 0).await.unwrap();
    let snapshot = core.job(id).await.unwrap();
    assert_eq!(snapshot.state, JobState::Running);
    assert!(snapshot.stdout.is_empty());

    let job = core.wait_complete(id).await.unwrap();
    assert_eq!(job.state, JobState::Complete);
    assert_eq!(job.stdout, b"done\n");
}

#[tokio::test]
async fn unknown_job_id_is_absent() {
    let core = test_core(idle_probe());
    assert!(core.job(999).await.is_none());
    assert!(core.wait_complete(999).await.is_none());
}

#[tokio::test]
async fn job_table_only_grows() {
    let core = test_core(idle_probe());

    let a = core.run("true", 0).await.unwrap();
    core.wait_complete(a).await.unwrap();
    let before = core.job_ids().await.len();

    let b = core.run("true", 0).await.unwrap();
    core.wait_complete(b).await.unwrap();
    let after = core.job_ids().await.len();

    assert_eq!(before, 1);
    assert_eq!(after, 2);
}
