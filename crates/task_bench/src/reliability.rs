//! Reliability mode: verifies the target's idempotency contract.
//!
//! Each check replays an operation with the identical idempotency key and
//! compares persisted progress snapshots around both submissions. Comparing
//! persisted state rather than acknowledgments is the point: a target can
//! acknowledge a duplicate while silently double-applying it.

use anyhow::Context;

use crate::client::{TaskApi, TaskDescriptor, TasksWithProgress, effective_target, pick_task};
use crate::event::{Event, EventBatch};

/// A violated idempotency assertion. Always fatal to the run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifyError {
    #[error(
        "idempotency failed: duplicate {check} increased progress \
         (before={before}, after1={after1}, after2={after2})"
    )]
    ProgressIncreased {
        check: &'static str,
        before: i64,
        after1: i64,
        after2: i64,
    },
    #[error("idempotency failed: duplicate ClaimReward was rejected: {reason}")]
    ClaimRejected { reason: String },
}

/// Run all three idempotency checks against one task.
///
/// `task_override` pins the task under test; otherwise a task with a
/// completion threshold above one is preferred so duplicates stay observable.
pub async fn run(api: &dyn TaskApi, user_id: &str, task_override: Option<&str>) -> anyhow::Result<()> {
    let list = api
        .tasks_with_progress(user_id)
        .await
        .context("list tasks")?;
    let task = select_task(&list, task_override)?;
    let target = effective_target(&task);

    tracing::info!(user_id, task_id = %task.id, target, "verifying idempotency");
    if target <= 1 {
        tracing::warn!(task_id = %task.id, "task target is 1; idempotency check may be inconclusive");
    }

    check_process_event_duplicate(api, user_id, &task.id, target).await?;
    check_stream_events_duplicate(api, user_id, &task.id, target).await?;
    check_claim_reward_duplicate(api, user_id, &task.id, target).await?;
    Ok(())
}

/// Resolve the task under test. A pinned id that the listing does not contain
/// is still exercised, with an unknown (assume 1) threshold.
fn select_task(
    list: &TasksWithProgress,
    task_override: Option<&str>,
) -> anyhow::Result<TaskDescriptor> {
    match task_override {
        Some(id) => Ok(list.task(id).cloned().unwrap_or_else(|| TaskDescriptor {
            id: id.to_string(),
            ..TaskDescriptor::default()
        })),
        None => Ok(pick_task(list)?.clone()),
    }
}

async fn progress_of(api: &dyn TaskApi, user_id: &str, task_id: &str) -> anyhow::Result<i64> {
    let list = api
        .tasks_with_progress(user_id)
        .await
        .context("read progress snapshot")?;
    Ok(list.progress_of(task_id))
}

/// Submit one event, then replay the byte-identical event, and require that
/// the replay adds no progress (when the threshold can show it).
async fn check_process_event_duplicate(
    api: &dyn TaskApi,
    user_id: &str,
    task_id: &str,
    target: i64,
) -> anyhow::Result<()> {
    let event = Event::progress_update(user_id, task_id, 1);

    let before = progress_of(api, user_id, task_id).await?;
    api.process_event(&event).await.context("ProcessEvent")?;
    let after1 = progress_of(api, user_id, task_id).await?;
    api.process_event(&event)
        .await
        .context("duplicate ProcessEvent")?;
    let after2 = progress_of(api, user_id, task_id).await?;

    tracing::info!(before, after1, after2, "duplicate ProcessEvent progress");
    assert_no_replay_gain("ProcessEvent", target, before, after1, after2)
}

/// Same protocol through the client-streaming path, resending the identical
/// serialized batch.
async fn check_stream_events_duplicate(
    api: &dyn TaskApi,
    user_id: &str,
    task_id: &str,
    target: i64,
) -> anyhow::Result<()> {
    let batch = EventBatch::build(user_id, task_id, 1, 1);
    let body = batch.to_body()?;

    let before = progress_of(api, user_id, task_id).await?;
    api.stream_events(&body).await.context("StreamEvents")?;
    let after1 = progress_of(api, user_id, task_id).await?;
    api.stream_events(&body)
        .await
        .context("duplicate StreamEvents")?;
    let after2 = progress_of(api, user_id, task_id).await?;

    tracing::info!(before, after1, after2, "duplicate StreamEvents progress");
    assert_no_replay_gain("StreamEvents", target, before, after1, after2)
}

/// Fulfil the task, then claim its reward twice; the second claim must be
/// accepted (claiming is not progress-accumulating, so no numeric compare).
async fn check_claim_reward_duplicate(
    api: &dyn TaskApi,
    user_id: &str,
    task_id: &str,
    target: i64,
) -> anyhow::Result<()> {
    api.process_event(&Event::progress_update(user_id, task_id, target))
        .await
        .context("fulfil task before claiming")?;
    api.claim_reward(user_id, task_id)
        .await
        .context("first ClaimReward")?;
    if let Err(err) = api.claim_reward(user_id, task_id).await {
        return Err(VerifyError::ClaimRejected {
            reason: err.to_string(),
        }
        .into());
    }
    tracing::info!("duplicate ClaimReward accepted");
    Ok(())
}

/// The replay assertion. Only a threshold above one makes a duplicate
/// observable: at 1 the first event can complete the task and cap further
/// progress, so an unchanged value proves nothing. That case was already
/// warned about at selection time and is deliberately not failed.
fn assert_no_replay_gain(
    check: &'static str,
    target: i64,
    before: i64,
    after1: i64,
    after2: i64,
) -> anyhow::Result<()> {
    if target > 1 && after2 > after1 {
        return Err(VerifyError::ProgressIncreased {
            check,
            before,
            after1,
            after2,
        }
        .into());
    }
    Ok(())
}
