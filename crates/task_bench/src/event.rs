//! Progress events and the per-dispatch batch builder.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Room all generated events are attributed to.
pub const ROOM_ID: &str = "room-1";
/// The only event type the target's progress pipeline consumes.
pub const EVENT_TYPE_PROGRESS: &str = "progress_update";

/// A single progress event in the service's wire shape.
///
/// `event_id` is the idempotency key: the target must apply two events with
/// the same id exactly once, no matter how often they are submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub user_id: String,
    pub room_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: ProgressPayload,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub task_id: String,
    pub amount: i64,
}

impl Event {
    /// A fresh progress-update event with a newly generated idempotency key.
    pub fn progress_update(user_id: &str, task_id: &str, amount: i64) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            room_id: ROOM_ID.to_string(),
            kind: EVENT_TYPE_PROGRESS.to_string(),
            payload: ProgressPayload {
                task_id: task_id.to_string(),
                amount,
            },
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// One dispatch unit's payload: an ordered run of freshly keyed events,
/// immutable once built and discarded after the call resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub events: Vec<Event>,
}

impl EventBatch {
    /// Build `size` events sharing a user and task, each with its own key.
    pub fn build(user_id: &str, task_id: &str, amount: i64, size: usize) -> Self {
        let events = (0..size)
            .map(|_| Event::progress_update(user_id, task_id, amount))
            .collect();
        Self { events }
    }

    /// Serialize to the request body fed to the client-streaming relay.
    pub fn to_body(&self) -> anyhow::Result<String> {
        serde_json::to_string(self).context("serialize event batch")
    }
}
