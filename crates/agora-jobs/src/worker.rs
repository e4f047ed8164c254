//! Worker pool that executes queued tool jobs.
//!
//! Every step of a job is fault tolerant: a failure anywhere ends in a
//! terminal `ToolCall` write, never a crashed task. Terminal writes are keyed
//! by tool-call id, so a replayed or retried job overwrites its own row.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use agora_core::config::Config;
use agora_core::model::{ToolCallStatus, ToolCallUpdate};
use agora_core::store::{ChatStore, MessagePatch, ToolCatalog};
use agora_tools::{ConnectionManager, ProgressFn, ToolExecutionResult};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::{JobQueue, QueuedJob};
use crate::retry::RetryPolicy;
use crate::{JobUpdate, ToolExecutionJob};

/// The tool side of a job: resolve a client, then run the call.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn ensure_client(&self, server_id: &str) -> Result<(), String>;

    async fn execute(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        on_progress: Option<ProgressFn>,
    ) -> ToolExecutionResult;
}

#[async_trait]
impl ToolExecutor for ConnectionManager {
    async fn ensure_client(&self, server_id: &str) -> Result<(), String> {
        self.get_client(server_id)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn execute(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Value,
        on_progress: Option<ProgressFn>,
    ) -> ToolExecutionResult {
        self.execute_tool(server_id, tool_name, arguments, on_progress)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub rate_limit_per_sec: u32,
    pub retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit_per_sec: 50,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency().max(1),
            rate_limit_per_sec: config.rate_limit_per_sec().max(1),
            retry: RetryPolicy::from_config(config),
        }
    }
}

pub struct Worker {
    store: Arc<dyn ChatStore>,
    catalog: Arc<dyn ToolCatalog>,
    executor: Arc<dyn ToolExecutor>,
    queue: Arc<JobQueue>,
    config: WorkerConfig,
    updates: broadcast::Sender<JobUpdate>,
}

impl Worker {
    pub fn new(
        store: Arc<dyn ChatStore>,
        catalog: Arc<dyn ToolCatalog>,
        executor: Arc<dyn ToolExecutor>,
        queue: Arc<JobQueue>,
        config: WorkerConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            store,
            catalog,
            executor,
            queue,
            config,
            updates,
        }
    }

    /// Progress and status changes for every job this worker runs.
    pub fn subscribe(&self) -> broadcast::Receiver<JobUpdate> {
        self.updates.subscribe()
    }

    fn publish(&self, job: &ToolExecutionJob, status: ToolCallStatus, progress: u8) {
        // No subscribers is fine
        let _ = self.updates.send(JobUpdate {
            tool_call_id: job.tool_call_id.clone(),
            message_id: job.message_id.clone(),
            status,
            progress,
        });
    }

    /// Pull jobs until `cancel` fires, then wait for in-flight jobs.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let concurrency = self.config.concurrency.max(1);
            let permits = Arc::new(Semaphore::new(concurrency));
            let period = Duration::from_secs(1) / self.config.rate_limit_per_sec.max(1);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                concurrency,
                rate_limit_per_sec = self.config.rate_limit_per_sec,
                "Tool worker pool started"
            );

            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = self.queue.next() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                ticker.tick().await;
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let worker = self.clone();
                tokio::spawn(async move {
                    worker.process(job).await;
                    drop(permit);
                });
            }

            // Drain: every permit back means every job finished
            let _ = permits.acquire_many(concurrency as u32).await;
            info!("Tool worker pool stopped");
        })
    }

    /// Run one job to a terminal state and acknowledge it.
    pub async fn process(&self, queued: QueuedJob) {
        let job = &queued.job;
        let call_id = job.tool_call_id.as_str();

        match self.store.get_tool_call(call_id).await {
            Ok(Some(row)) if row.status.is_terminal() => {
                debug!(tool_call_id = call_id, "Tool call already terminal, skipping");
                self.ack(&queued).await;
                return;
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(tool_call_id = call_id, "No tool call row for job, dropping");
                self.ack(&queued).await;
                return;
            }
            Err(e) => warn!(tool_call_id = call_id, error = %e, "Failed to load tool call"),
        }

        // 1. running
        if let Err(e) = self
            .store
            .update_tool_call(call_id, ToolCallUpdate::running())
            .await
        {
            warn!(tool_call_id = call_id, error = %e, "Failed to mark tool call running");
        }
        self.publish(job, ToolCallStatus::Running, 0);

        // 2 + 3. resolve a client and execute, with retries
        let progress = self.progress_callback(job);
        let outcome = self
            .config
            .retry
            .run(call_id, |attempt| {
                let progress = progress.clone();
                async move {
                    debug!(tool_call_id = call_id, attempt, "Executing tool job");
                    self.executor.ensure_client(&job.server_id).await?;
                    let result = self
                        .executor
                        .execute(
                            &job.server_id,
                            &job.tool_name,
                            job.arguments.clone(),
                            Some(progress),
                        )
                        .await;
                    match result {
                        ToolExecutionResult {
                            success: true,
                            result,
                            ..
                        } => Ok(result.unwrap_or(Value::Null)),
                        ToolExecutionResult { error, .. } => {
                            Err(error.unwrap_or_else(|| "tool execution failed".into()))
                        }
                    }
                }
            })
            .await;

        // 4. terminal write
        let status = self.write_outcome(job, outcome).await;

        // 5. parent message metadata
        let patch = MessagePatch {
            tool_status: Some((call_id.to_string(), status)),
            ..Default::default()
        };
        if let Err(e) = self.store.patch_message(&job.message_id, patch).await {
            warn!(
                tool_call_id = call_id,
                message_id = %job.message_id,
                error = %e,
                "Failed to record tool status on message"
            );
        }

        self.publish(job, status, 100);
        self.ack(&queued).await;
    }

    async fn write_outcome(
        &self,
        job: &ToolExecutionJob,
        outcome: Result<Value, String>,
    ) -> ToolCallStatus {
        let call_id = job.tool_call_id.as_str();
        let update = match outcome {
            Ok(value) => ToolCallUpdate::completed(value),
            Err(reason) => {
                error!(tool_call_id = call_id, tool = %job.tool_name, error = %reason, "Tool job failed");
                ToolCallUpdate::failed(reason)
            }
        };
        let status = update.status;

        match self.store.update_tool_call(call_id, update).await {
            Ok(_) if status == ToolCallStatus::Completed => {
                info!(tool_call_id = call_id, tool = %job.tool_name, "Tool job completed");
                if let Some(tool_id) = &job.tool_id {
                    if let Err(e) = self.catalog.record_tool_usage(tool_id).await {
                        warn!(tool_id, error = %e, "Failed to record tool usage");
                    }
                }
                status
            }
            Ok(_) => status,
            Err(e) => {
                // Last resort: the row must not stay non-terminal
                error!(tool_call_id = call_id, error = %e, "Failed to write tool result");
                let fallback = ToolCallUpdate::failed(format!("failed to persist result: {e}"));
                if let Err(e) = self.store.update_tool_call(call_id, fallback).await {
                    error!(tool_call_id = call_id, error = %e, "Failed to write tool error");
                }
                ToolCallStatus::Error
            }
        }
    }

    async fn ack(&self, queued: &QueuedJob) {
        if let Err(e) = self.queue.ack(&queued.id).await {
            warn!(job_id = %queued.id, error = %e, "Failed to acknowledge job");
        }
    }

    /// Republish tool progress in 10% steps.
    fn progress_callback(&self, job: &ToolExecutionJob) -> ProgressFn {
        let updates = self.updates.clone();
        let tool_call_id = job.tool_call_id.clone();
        let message_id = job.message_id.clone();
        let last = Arc::new(AtomicU8::new(0));
        Arc::new(move |percent: f64| {
            let step = ((percent.clamp(0.0, 100.0) / 10.0).floor() * 10.0) as u8;
            if last.fetch_max(step, Ordering::SeqCst) < step {
                let _ = updates.send(JobUpdate {
                    tool_call_id: tool_call_id.clone(),
                    message_id: message_id.clone(),
                    status: ToolCallStatus::Running,
                    progress: step,
                });
            }
        })
    }
}
