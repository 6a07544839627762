//! Claim mode: a concurrent `ClaimReward` hammer.
//!
//! A fixed pool of workers fires claim requests at one user/task pair, either
//! until a shared request budget is spent or until interrupted, tallying
//! successes and failures per gRPC status code. Unlike stress mode there is
//! no admission loop: each worker is one long-lived task issuing requests
//! back to back, optionally pausing between them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use crate::client::METHOD_CLAIM_REWARD;
use crate::invoker::Invoker;

/// Claim-run parameters.
#[derive(Debug, Clone)]
pub struct ClaimConfig {
    pub target: String,
    pub user_id: String,
    pub task_id: String,
    /// Total request budget shared by all workers; `None` runs until
    /// interrupted.
    pub count: Option<u64>,
    pub workers: usize,
    /// Pause between requests, per worker.
    pub delay: Option<Duration>,
    /// Log every Nth success.
    pub log_every: u64,
}

/// Aggregate claim counters plus a per-status-code error tally.
#[derive(Debug, Default)]
pub struct ClaimStats {
    sent: AtomicU64,
    ok: AtomicU64,
    errors: AtomicU64,
    codes: Mutex<BTreeMap<String, u64>>,
}

/// Point-in-time copy of the claim counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimSnapshot {
    pub sent: u64,
    pub ok: u64,
    pub errors: u64,
    pub codes: BTreeMap<String, u64>,
}

impl ClaimStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one send slot against the budget; `false` once it is spent.
    /// Reservation and send are one-to-one, so `sent == ok + errors` holds
    /// whenever all workers are parked or done.
    fn try_reserve(&self, count: Option<u64>) -> bool {
        match count {
            None => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Some(limit) => loop {
                let current = self.sent.load(Ordering::Relaxed);
                if current >= limit {
                    return false;
                }
                if self
                    .sent
                    .compare_exchange(current, current + 1, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
            },
        }
    }

    /// Record a success and return the new success count.
    fn record_ok(&self) -> u64 {
        self.ok.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_error(&self, code: String) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut codes) = self.codes.lock() {
            *codes.entry(code).or_insert(0) += 1;
        }
    }

    pub fn snapshot(&self) -> ClaimSnapshot {
        ClaimSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            codes: self
                .codes
                .lock()
                .map(|codes| codes.clone())
                .unwrap_or_default(),
        }
    }
}

/// Worker pool driving `ClaimReward` through the invoker.
pub struct ClaimHammer {
    cfg: ClaimConfig,
    invoker: Arc<dyn Invoker>,
    stats: Arc<ClaimStats>,
}

impl ClaimHammer {
    pub fn new(cfg: ClaimConfig, invoker: Arc<dyn Invoker>, stats: Arc<ClaimStats>) -> Self {
        Self {
            cfg,
            invoker,
            stats,
        }
    }

    /// Run all workers to completion. `cancel` flips to `true` on interrupt;
    /// workers stop at their next checkpoint (in-flight requests finish).
    pub async fn run(&self, cancel: watch::Receiver<bool>) {
        let mut workers = Vec::with_capacity(self.cfg.workers);
        for id in 0..self.cfg.workers {
            workers.push(tokio::spawn(worker(
                id + 1,
                self.cfg.clone(),
                self.invoker.clone(),
                self.stats.clone(),
                cancel.clone(),
            )));
        }
        for handle in workers {
            let _ = handle.await;
        }
    }
}

async fn worker(
    id: usize,
    cfg: ClaimConfig,
    invoker: Arc<dyn Invoker>,
    stats: Arc<ClaimStats>,
    mut cancel: watch::Receiver<bool>,
) {
    let payload = json!({ "userId": cfg.user_id, "taskId": cfg.task_id });
    loop {
        if *cancel.borrow() || !stats.try_reserve(cfg.count) {
            return;
        }

        match invoker.unary(METHOD_CLAIM_REWARD, payload.clone()).await {
            Ok(_) => {
                let n = stats.record_ok();
                if n % cfg.log_every.max(1) == 0 {
                    tracing::info!(worker = id, ok = n, "claim ok");
                }
            }
            Err(err) => {
                let code = grpc_error_code(&err.stderr);
                tracing::warn!(worker = id, code = %code, error = %err, "claim failed");
                stats.record_error(code);
            }
        }

        if let Some(delay) = cfg.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = cancel.wait_for(|stop| *stop) => {
                    // A closed channel means no interrupt source, not a stop.
                    if changed.is_ok() {
                        return;
                    }
                }
            }
        }
    }
}

/// Pull the gRPC status code out of relay diagnostics. grpcurl prints either
/// an `ERROR: / Code: <name>` block or a `rpc error: code = <name> ...` line.
pub fn grpc_error_code(stderr: &str) -> String {
    for line in stderr.lines() {
        let line = line.trim();
        if let Some(code) = line.strip_prefix("Code:") {
            return code.trim().to_string();
        }
        if let Some(rest) = line.split("code = ").nth(1) {
            if let Some(code) = rest.split_whitespace().next() {
                return code.to_string();
            }
        }
    }
    "Unknown".to_string()
}

/// Operator-facing summary printed when the hammer finishes.
pub fn print_summary(snap: &ClaimSnapshot) {
    println!(
        "summary sent={} ok={} errors={} error_codes={:?}",
        snap.sent, snap.ok, snap.errors, snap.codes
    );
}
