use chrono::{DateTime, Utc};

/// Lifecycle of one spawned child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Admitted; the id is reserved while the child is being spawned.
    Pending,
    /// The child process is running.
    Running,
    /// The child has exited and its output is frozen.
    Complete,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Complete => write!(f, "complete"),
        }
    }
}

/// Resource usage of a completed child, as reported by the reap.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub utime_sec: i64,
    pub utime_usec: i64,
    pub stime_sec: i64,
    pub stime_usec: i64,
    /// Maximum resident set size in kilobytes.
    pub maxrss_kb: i64,
}

/// One spawned child process on this worker.
///
/// `stdout` and `stderr` are populated by the supervisory task in the same
/// write-lock critical section that flips the state to [`JobState::Complete`],
/// so no observer ever sees output before completion.
#[derive(Debug, Clone)]
pub struct Job {
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub state: JobState,
    pub success: Option<bool>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub rusage: Option<ResourceUsage>,
}

impl Job {
    /// A fresh reservation: the id exists, the child does not yet.
    pub fn pending() -> Self {
        Self {
            start: Utc::now(),
            end: None,
            state: JobState::Pending,
            success: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            rusage: None,
        }
    }

    pub fn complete(&self) -> bool {
        self.state == JobState::Complete
    }
}

/// Splits captured output after each newline. Concatenating the chunks
/// reproduces the captured stream byte for byte; the final chunk keeps
/// exactly what the child wrote, with no synthetic trailing newline.
pub fn chunk_log(bytes: &[u8]) -> Vec<Vec<u8>> {
    bytes
        .split_inclusive(|&b| b == b'\n')
        .map(|chunk| chunk.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_empty_output() {
        assert!(chunk_log(b"").is_empty());
    }

    #[test]
    fn chunk_single_line() {
        assert_eq!(chunk_log(b"hello\n"), vec![b"hello\n".to_vec()]);
    }

    #[test]
    fn chunk_keeps_unterminated_tail() {
        assert_eq!(
            chunk_log(b"a\nb"),
            vec![b"a\n".to_vec(), b"b".to_vec()]
        );
    }

    #[test]
    fn chunk_preserves_blank_lines() {
        assert_eq!(
            chunk_log(b"a\n\nb\n"),
            vec![b"a\n".to_vec(), b"\n".to_vec(), b"b\n".to_vec()]
        );
    }

    #[test]
    fn concatenation_is_exact() {
        for bytes in [
            b"".as_slice(),
            b"hello\n",
            b"no newline",
            b"a\nb\nc\n",
            b"\n\n\n",
            b"trailing\ntail",
        ] {
            let joined: Vec<u8> = chunk_log(bytes).concat();
            assert_eq!(joined, bytes);
        }
    }
}
