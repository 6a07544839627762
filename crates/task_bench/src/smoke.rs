//! Smoke mode: one sequential walk across every RPC the target exposes.
//!
//! Pure functional coverage with no concurrency and no assertions beyond
//! "the call succeeded"; any failed call aborts the walk.

use std::time::Duration;

use anyhow::Context;

use crate::client::{TaskApi, TaskClient};
use crate::event::{Event, EventBatch};
use crate::invoker::Invoker;

/// Bound on waiting for the first `SubscribeProgress` message.
const SUBSCRIBE_FIRST_WAIT: Duration = Duration::from_secs(5);

pub async fn run(client: &TaskClient, target: &str, user_id: &str) -> anyhow::Result<()> {
    println!("Target: {target}");

    println!("-> list services");
    let services = client.invoker().reflect_list().await.context("list services")?;
    println!("{services}");

    println!("-> GetTasksWithProgress");
    let list = client.tasks_with_progress(user_id).await?;
    let task_id = list
        .tasks
        .first()
        .map(|t| t.id.clone())
        .context("no tasks found to run smoke test")?;

    println!("User ID: {user_id}");
    println!("Task ID: {task_id}");

    println!("-> GetTask");
    client.get_task(&task_id).await?;

    println!("-> ProcessEvent");
    client
        .process_event(&Event::progress_update(user_id, &task_id, 1))
        .await?;

    println!("-> ClaimReward");
    client.claim_reward(user_id, &task_id).await?;

    println!("-> GetTasksWithProgress (final)");
    let final_list = client.tasks_with_progress(user_id).await?;
    println!("Final progress:");
    println!(
        "{}",
        serde_json::to_string_pretty(&final_list).context("render final progress")?
    );

    println!("-> StreamEvents (batch)");
    let body = EventBatch::build(user_id, &task_id, 1, 1).to_body()?;
    let stream_resp = client.stream_events(&body).await?;
    println!("StreamEvents response:");
    println!("{stream_resp}");

    println!("-> SubscribeProgress (first message)");
    let first = client
        .subscribe_progress_first(user_id, SUBSCRIBE_FIRST_WAIT)
        .await?;
    println!("SubscribeProgress first message:");
    println!("{first}");

    Ok(())
}
