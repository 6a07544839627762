//! Run statistics and the error-log sink.
//!
//! Counters are process-lifetime and monotonic within a run. Completion
//! callbacks from many in-flight dispatches update them concurrently, so they
//! are plain atomics; `sent >= ok + failed` holds at every observation point
//! (a unit is counted sent at admission, resolved later).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};

use crate::invoker::InvokeError;

/// Aggregate counters for one run.
#[derive(Debug, Default)]
pub struct RunStats {
    sent: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent: u64,
    pub ok: u64,
    pub failed: u64,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Append-only sink for failed dispatches, one complete line per failure.
///
/// Lines are written whole under a mutex so concurrent completions cannot
/// interleave; no cross-line ordering is promised.
#[derive(Debug)]
pub struct ErrorLog {
    file: Mutex<File>,
    path: PathBuf,
}

impl ErrorLog {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open error log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one failed dispatch. Sink trouble is reported but never fails
    /// the run; the failure is already tallied in the counters.
    pub fn record(&self, err: &InvokeError) {
        let line = format_error_line(Utc::now(), err);
        if let Ok(mut file) = self.file.lock() {
            if let Err(io_err) = file.write_all(line.as_bytes()) {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %io_err,
                    "failed to append to error log"
                );
            }
        }
    }
}

/// `[<ISO timestamp>] code=<exit code or empty> signal=<name or empty> stderr=<text>`
pub fn format_error_line(at: DateTime<Utc>, err: &InvokeError) -> String {
    format!(
        "[{}] code={} signal={} stderr={}\n",
        at.to_rfc3339_opts(SecondsFormat::Millis, true),
        err.code.map(|c| c.to_string()).unwrap_or_default(),
        err.signal.as_deref().unwrap_or(""),
        err.stderr.trim(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scratch_path(name: &str) -> PathBuf {
        let ts = Utc::now().timestamp_millis();
        std::env::temp_dir().join(format!("task_bench-{name}-{}-{ts}.log", std::process::id()))
    }

    #[test]
    fn counters_are_monotonic_and_conserved() {
        let stats = RunStats::new();
        for _ in 0..5 {
            stats.record_sent();
        }
        stats.record_ok();
        stats.record_ok();
        stats.record_failed();
        let snap = stats.snapshot();
        assert_eq!(snap.sent, 5);
        assert_eq!(snap.ok, 2);
        assert_eq!(snap.failed, 1);
        assert!(snap.sent >= snap.ok + snap.failed);
    }

    #[test]
    fn error_line_matches_the_log_format() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let err = InvokeError {
            code: Some(1),
            signal: None,
            stderr: "rpc error: code = Unavailable\n".to_string(),
        };
        assert_eq!(
            format_error_line(at, &err),
            "[2024-05-01T12:30:00.000Z] code=1 signal= stderr=rpc error: code = Unavailable\n"
        );
    }

    #[test]
    fn signal_kills_leave_the_code_empty() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let err = InvokeError {
            code: None,
            signal: Some("SIGKILL".to_string()),
            stderr: "".to_string(),
        };
        assert_eq!(
            format_error_line(at, &err),
            "[2024-05-01T00:00:00.000Z] code= signal=SIGKILL stderr=\n"
        );
    }

    #[test]
    fn log_appends_one_line_per_failure() {
        let path = scratch_path("errlog");
        let log = ErrorLog::open(&path).unwrap();
        log.record(&InvokeError::internal("first"));
        log.record(&InvokeError::internal("second"));
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("stderr=first"));
        assert!(lines[1].ends_with("stderr=second"));
        let _ = std::fs::remove_file(&path);
    }
}
