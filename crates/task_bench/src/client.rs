//! Typed surface of the `tasks.v1.TaskService` RPCs exercised by the harness.
//!
//! Responses come back as the JSON text grpcurl prints, so every field is
//! deserialized leniently: anything the server omits defaults.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::event::Event;
use crate::invoker::Invoker;

pub const METHOD_GET_TASKS: &str = "tasks.v1.TaskService/GetTasksWithProgress";
pub const METHOD_GET_TASK: &str = "tasks.v1.TaskService/GetTask";
pub const METHOD_PROCESS_EVENT: &str = "tasks.v1.TaskService/ProcessEvent";
pub const METHOD_STREAM_EVENTS: &str = "tasks.v1.TaskService/StreamEvents";
pub const METHOD_CLAIM_REWARD: &str = "tasks.v1.TaskService/ClaimReward";
pub const METHOD_SUBSCRIBE_PROGRESS: &str = "tasks.v1.TaskService/SubscribeProgress";

/// A task definition with its completion threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskDescriptor {
    pub id: String,
    pub title: String,
    pub target: i64,
}

/// Accumulated progress toward one task, read-only on our side.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskProgress {
    pub task_id: String,
    pub progress: i64,
}

/// `GetTasksWithProgress` response: the task list plus a progress snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TasksWithProgress {
    pub tasks: Vec<TaskDescriptor>,
    pub progress: Vec<TaskProgress>,
}

impl TasksWithProgress {
    pub fn task(&self, task_id: &str) -> Option<&TaskDescriptor> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Progress value for a task; zero when the server reported none.
    pub fn progress_of(&self, task_id: &str) -> i64 {
        self.progress
            .iter()
            .find(|p| p.task_id == task_id)
            .map(|p| p.progress)
            .unwrap_or(0)
    }
}

/// Prefer a task whose threshold is above one so duplicate-submission effects
/// stay observable; a threshold of one can complete on the first event and
/// mask a non-idempotent target. Falls back to the first task.
pub fn pick_task(list: &TasksWithProgress) -> anyhow::Result<&TaskDescriptor> {
    list.tasks
        .iter()
        .find(|t| t.target > 1)
        .or_else(|| list.tasks.first())
        .ok_or_else(|| anyhow::anyhow!("no tasks found"))
}

/// Completion threshold with the server's "unset means one" convention applied.
pub fn effective_target(task: &TaskDescriptor) -> i64 {
    if task.target <= 0 { 1 } else { task.target }
}

/// Service operations the verifier drives; mocked by in-memory services in
/// tests, implemented over the relay by [`TaskClient`].
#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn tasks_with_progress(&self, user_id: &str) -> anyhow::Result<TasksWithProgress>;
    async fn process_event(&self, event: &Event) -> anyhow::Result<()>;
    async fn stream_events(&self, body: &str) -> anyhow::Result<String>;
    async fn claim_reward(&self, user_id: &str, task_id: &str) -> anyhow::Result<()>;
}

/// Typed client over the invoker boundary.
#[derive(Clone)]
pub struct TaskClient {
    invoker: Arc<dyn Invoker>,
}

impl TaskClient {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self { invoker }
    }

    pub fn invoker(&self) -> &dyn Invoker {
        self.invoker.as_ref()
    }

    pub async fn get_task(&self, task_id: &str) -> anyhow::Result<String> {
        let out = self
            .invoker
            .unary(METHOD_GET_TASK, json!({ "taskId": task_id }))
            .await
            .context("GetTask")?;
        Ok(out)
    }

    pub async fn subscribe_progress_first(
        &self,
        user_id: &str,
        wait: Duration,
    ) -> anyhow::Result<String> {
        let out = self
            .invoker
            .server_stream_first(METHOD_SUBSCRIBE_PROGRESS, json!({ "userId": user_id }), wait)
            .await
            .context("SubscribeProgress")?;
        Ok(out)
    }
}

#[async_trait]
impl TaskApi for TaskClient {
    async fn tasks_with_progress(&self, user_id: &str) -> anyhow::Result<TasksWithProgress> {
        let out = self
            .invoker
            .unary(METHOD_GET_TASKS, json!({ "userId": user_id }))
            .await
            .context("GetTasksWithProgress")?;
        parse_tasks_with_progress(&out)
    }

    async fn process_event(&self, event: &Event) -> anyhow::Result<()> {
        let payload = serde_json::to_value(event).context("serialize event")?;
        self.invoker
            .unary(METHOD_PROCESS_EVENT, json!({ "event": payload }))
            .await
            .context("ProcessEvent")?;
        Ok(())
    }

    async fn stream_events(&self, body: &str) -> anyhow::Result<String> {
        let out = self
            .invoker
            .client_stream(METHOD_STREAM_EVENTS, body)
            .await
            .context("StreamEvents")?;
        Ok(out)
    }

    async fn claim_reward(&self, user_id: &str, task_id: &str) -> anyhow::Result<()> {
        self.invoker
            .unary(
                METHOD_CLAIM_REWARD,
                json!({ "userId": user_id, "taskId": task_id }),
            )
            .await
            .context("ClaimReward")?;
        Ok(())
    }
}

/// Parse the text of a `GetTasksWithProgress` reply; an empty reply is an
/// empty listing (grpcurl prints nothing for an empty message).
pub fn parse_tasks_with_progress(raw: &str) -> anyhow::Result<TasksWithProgress> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(TasksWithProgress::default());
    }
    serde_json::from_str(trimmed).context("parse GetTasksWithProgress response")
}
