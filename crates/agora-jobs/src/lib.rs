//! Asynchronous tool execution.
//!
//! The orchestrator writes a pending `ToolCall` row and hands a
//! [`ToolExecutionJob`] to a [`JobSubmitter`]. The [`queue::JobQueue`]
//! journals it to disk before it is visible to workers, and the
//! [`worker::Worker`] pool executes it with retries, independent of the
//! request that produced it.

use agora_core::error::Result;
use agora_core::model::ToolCallStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod queue;
pub mod retry;
pub mod worker;

pub use queue::{JobQueue, QueuedJob};
pub use retry::RetryPolicy;
pub use worker::{ToolExecutor, Worker, WorkerConfig};

/// Everything a worker needs to run one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecutionJob {
    pub tool_call_id: String,
    pub server_id: String,
    pub tool_name: String,
    /// Catalog id, for usage counters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<String>,
    pub arguments: serde_json::Value,
    pub session_id: String,
    pub message_id: String,
    pub request_id: String,
}

/// Fire-and-forget job submission.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Durably enqueue `job`, returning its job id.
    async fn submit(&self, job: ToolExecutionJob) -> Result<String>;
}

/// Progress or status change for one tool call, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub tool_call_id: String,
    pub message_id: String,
    pub status: ToolCallStatus,
    /// Coarse percentage, in steps of 10.
    pub progress: u8,
}
