//! Smoke walk over a canned invoker: every RPC touched once, in order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use task_bench::client::{
    METHOD_CLAIM_REWARD, METHOD_GET_TASK, METHOD_GET_TASKS, METHOD_PROCESS_EVENT,
    METHOD_STREAM_EVENTS, METHOD_SUBSCRIBE_PROGRESS, TaskClient,
};
use task_bench::invoker::{InvokeError, Invoker};
use task_bench::smoke;

/// Replays fixed responses and records the call order.
struct CannedInvoker {
    tasks_reply: String,
    calls: Mutex<Vec<String>>,
}

impl CannedInvoker {
    fn new(tasks_reply: &str) -> Self {
        Self {
            tasks_reply: tasks_reply.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl Invoker for CannedInvoker {
    async fn unary(
        &self,
        method: &str,
        _payload: serde_json::Value,
    ) -> Result<String, InvokeError> {
        self.record(method);
        if method == METHOD_GET_TASKS {
            Ok(self.tasks_reply.clone())
        } else {
            Ok("{}".to_string())
        }
    }

    async fn client_stream(&self, method: &str, body: &str) -> Result<String, InvokeError> {
        assert!(body.contains("\"events\""));
        self.record(method);
        Ok(r#"{"processed": 1}"#.to_string())
    }

    async fn reflect_list(&self) -> Result<String, InvokeError> {
        self.record("list");
        Ok("tasks.v1.TaskService".to_string())
    }

    async fn server_stream_first(
        &self,
        method: &str,
        _payload: serde_json::Value,
        _wait: Duration,
    ) -> Result<String, InvokeError> {
        self.record(method);
        Ok(r#"{"progress": []}"#.to_string())
    }
}

#[tokio::test]
async fn walks_every_rpc_in_order() {
    let invoker = Arc::new(CannedInvoker::new(
        r#"{"tasks": [{"id": "t1", "target": 3}], "progress": []}"#,
    ));
    let client = TaskClient::new(invoker.clone());

    smoke::run(&client, "localhost:50051", "user-smoke")
        .await
        .unwrap();

    let calls = invoker.calls.lock().unwrap().clone();
    let calls: Vec<&str> = calls.iter().map(String::as_str).collect();
    assert_eq!(
        calls,
        vec![
            "list",
            METHOD_GET_TASKS,
            METHOD_GET_TASK,
            METHOD_PROCESS_EVENT,
            METHOD_CLAIM_REWARD,
            METHOD_GET_TASKS,
            METHOD_STREAM_EVENTS,
            METHOD_SUBSCRIBE_PROGRESS,
        ]
    );
}

#[tokio::test]
async fn empty_task_list_aborts_the_walk() {
    let invoker = Arc::new(CannedInvoker::new(""));
    let client = TaskClient::new(invoker.clone());

    let err = smoke::run(&client, "localhost:50051", "user-smoke")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no tasks found"));

    // Nothing past the listing was called.
    let calls = invoker.calls.lock().unwrap().clone();
    let calls: Vec<&str> = calls.iter().map(String::as_str).collect();
    assert_eq!(calls, vec!["list", METHOD_GET_TASKS]);
}
