//! task_bench: load-generation and correctness harness for the
//! `tasks.v1.TaskService` progress API, driven through the `grpcurl` relay.
//!
//! Four modes:
//! - `smoke`: one sequential walk across every RPC;
//! - `reliability`: duplicate-submission idempotency checks;
//! - `claim`: a worker pool hammering `ClaimReward` on one user/task pair;
//! - `stress`: a concurrency-bounded batch generator with graceful drain.

pub mod claim;
pub mod client;
pub mod event;
pub mod invoker;
pub mod reliability;
pub mod smoke;
pub mod stats;
pub mod stress;
