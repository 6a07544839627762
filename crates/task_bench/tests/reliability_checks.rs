//! Verifier behavior against in-memory targets with and without
//! idempotency-key deduplication.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use task_bench::client::{TaskApi, TaskDescriptor, TaskProgress, TasksWithProgress};
use task_bench::event::{Event, EventBatch};
use task_bench::reliability::{self, VerifyError};

const USER: &str = "user-verify";

/// In-memory task service. `dedupe` controls whether replayed event ids are
/// suppressed; a broken target applies every received event.
struct MockService {
    dedupe: bool,
    reject_second_claim: bool,
    tasks: Vec<TaskDescriptor>,
    state: Mutex<ServiceState>,
}

#[derive(Default)]
struct ServiceState {
    progress: HashMap<String, i64>,
    seen_events: HashSet<String>,
    claimed: HashSet<String>,
}

impl MockService {
    fn new(dedupe: bool, tasks: &[(&str, i64)]) -> Self {
        Self {
            dedupe,
            reject_second_claim: false,
            tasks: tasks
                .iter()
                .map(|(id, target)| TaskDescriptor {
                    id: id.to_string(),
                    title: String::new(),
                    target: *target,
                })
                .collect(),
            state: Mutex::new(ServiceState::default()),
        }
    }

    fn apply(&self, event: &Event) {
        let mut state = self.state.lock().unwrap();
        if self.dedupe && !state.seen_events.insert(event.event_id.clone()) {
            return;
        }
        *state
            .progress
            .entry(event.payload.task_id.clone())
            .or_insert(0) += event.payload.amount;
    }

    fn progress_of(&self, task_id: &str) -> i64 {
        let state = self.state.lock().unwrap();
        state.progress.get(task_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl TaskApi for MockService {
    async fn tasks_with_progress(&self, _user_id: &str) -> anyhow::Result<TasksWithProgress> {
        let state = self.state.lock().unwrap();
        Ok(TasksWithProgress {
            tasks: self.tasks.clone(),
            progress: state
                .progress
                .iter()
                .map(|(task_id, progress)| TaskProgress {
                    task_id: task_id.clone(),
                    progress: *progress,
                })
                .collect(),
        })
    }

    async fn process_event(&self, event: &Event) -> anyhow::Result<()> {
        self.apply(event);
        Ok(())
    }

    async fn stream_events(&self, body: &str) -> anyhow::Result<String> {
        let batch: EventBatch = serde_json::from_str(body)?;
        for event in &batch.events {
            self.apply(event);
        }
        Ok("{}".to_string())
    }

    async fn claim_reward(&self, _user_id: &str, task_id: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.claimed.insert(task_id.to_string()) && self.reject_second_claim {
            anyhow::bail!("reward already claimed for {task_id}");
        }
        Ok(())
    }
}

#[tokio::test]
async fn deduplicating_target_passes_all_checks() {
    let service = MockService::new(true, &[("daily-5", 5)]);
    reliability::run(&service, USER, None).await.unwrap();

    // One unit from each duplicate check plus the claim-fulfilment event.
    assert_eq!(service.progress_of("daily-5"), 1 + 1 + 5);
}

#[tokio::test]
async fn double_applying_target_is_reported_with_observed_values() {
    let service = MockService::new(false, &[("daily-5", 5)]);
    let err = reliability::run(&service, USER, None).await.unwrap_err();
    match err.downcast::<VerifyError>().unwrap() {
        VerifyError::ProgressIncreased {
            check,
            before,
            after1,
            after2,
        } => {
            assert_eq!(check, "ProcessEvent");
            assert_eq!(before, 0);
            assert_eq!(after1, 1);
            assert_eq!(after2, 2, "duplicate must have been applied twice");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn threshold_one_is_inconclusive_and_only_warns() {
    // Broken target, but the only task completes on one event.
    let service = MockService::new(false, &[("daily-1", 1)]);
    reliability::run(&service, USER, None).await.unwrap();
}

#[tokio::test]
async fn rejected_duplicate_claim_is_a_verification_failure() {
    let mut service = MockService::new(true, &[("daily-5", 5)]);
    service.reject_second_claim = true;
    let err = reliability::run(&service, USER, None).await.unwrap_err();
    match err.downcast::<VerifyError>().unwrap() {
        VerifyError::ClaimRejected { reason } => {
            assert!(reason.contains("already claimed"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn pinned_task_overrides_auto_selection() {
    // Auto-selection would pick the target-5 task and fail against this
    // broken service; pinning the threshold-1 task keeps the run warn-only.
    let service = MockService::new(false, &[("daily-1", 1), ("daily-5", 5)]);
    reliability::run(&service, USER, Some("daily-1")).await.unwrap();
}

#[tokio::test]
async fn missing_tasks_fail_before_any_submission() {
    let service = MockService::new(true, &[]);
    let err = reliability::run(&service, USER, None).await.unwrap_err();
    assert!(err.to_string().contains("no tasks found"));
    assert_eq!(service.state.lock().unwrap().seen_events.len(), 0);
}
