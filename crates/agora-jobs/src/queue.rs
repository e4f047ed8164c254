//! Durable job queue: an append-only JSONL journal plus an in-process channel.
//!
//! Layout: `<dir>/jobs.jsonl`, one [`JournalRecord`] per line. A job is live
//! from its `enqueue` record until its `ack` record. On open, live jobs are
//! replayed into the channel in enqueue order and the journal is compacted.
//! Each job sits in the channel once, so exactly one worker receives it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use agora_core::error::{AgoraError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{JobSubmitter, ToolExecutionJob};

/// Acks between automatic compactions.
const COMPACT_EVERY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub id: String,
    pub job: ToolExecutionJob,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Enqueue { job: QueuedJob },
    Ack { id: String },
}

struct Journal {
    path: PathBuf,
    file: tokio::fs::File,
    acks_since_compact: usize,
}

pub struct JobQueue {
    journal: Option<tokio::sync::Mutex<Journal>>,
    live: Mutex<HashMap<String, QueuedJob>>,
    tx: mpsc::UnboundedSender<QueuedJob>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedJob>>,
}

impl JobQueue {
    fn with_journal(journal: Option<Journal>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            journal: journal.map(tokio::sync::Mutex::new),
            live: Mutex::new(HashMap::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// A queue without a journal; jobs do not survive a restart.
    pub fn in_memory() -> Self {
        Self::with_journal(None)
    }

    /// Open (or create) the journal in `dir` and replay unacknowledged jobs.
    pub async fn open(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("jobs.jsonl");

        let replay = if path.exists() {
            let data = tokio::fs::read_to_string(&path).await?;
            replay_journal(&data)
        } else {
            Vec::new()
        };

        write_snapshot(&path, &replay).await?;
        let file = open_append(&path).await?;
        let queue = Self::with_journal(Some(Journal {
            path,
            file,
            acks_since_compact: 0,
        }));

        if !replay.is_empty() {
            info!(jobs = replay.len(), "Replaying unacknowledged tool jobs");
        }
        for job in replay {
            queue.publish(job)?;
        }
        Ok(queue)
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueuedJob>> {
        self.live
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, job: QueuedJob) -> Result<()> {
        self.live().insert(job.id.clone(), job.clone());
        self.tx
            .send(job)
            .map_err(|_| AgoraError::Queue("job channel closed".into()))
    }

    async fn append(&self, record: &JournalRecord) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut journal = journal.lock().await;
        journal.file.write_all(line.as_bytes()).await?;
        journal.file.flush().await?;
        journal.file.sync_data().await?;
        Ok(())
    }

    /// Wait for the next job. Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<QueuedJob> {
        self.rx.lock().await.recv().await
    }

    /// Mark a job finished; it will not be replayed.
    pub async fn ack(&self, job_id: &str) -> Result<()> {
        if self.live().remove(job_id).is_none() {
            return Ok(());
        }
        self.append(&JournalRecord::Ack {
            id: job_id.to_string(),
        })
        .await?;

        let due = match &self.journal {
            Some(journal) => {
                let mut journal = journal.lock().await;
                journal.acks_since_compact += 1;
                journal.acks_since_compact >= COMPACT_EVERY
            }
            None => false,
        };
        if due {
            self.compact().await?;
        }
        Ok(())
    }

    /// Unacknowledged jobs, including ones currently being worked on.
    pub fn depth(&self) -> usize {
        self.live().len()
    }

    /// Rewrite the journal with only live jobs.
    pub async fn compact(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        let mut journal = journal.lock().await;
        let mut jobs: Vec<QueuedJob> = self.live().values().cloned().collect();
        jobs.sort_by_key(|j| j.enqueued_at);

        write_snapshot(&journal.path, &jobs).await?;
        journal.file = open_append(&journal.path).await?;
        journal.acks_since_compact = 0;
        debug!(live = jobs.len(), "Compacted job journal");
        Ok(())
    }
}

#[async_trait]
impl JobSubmitter for JobQueue {
    async fn submit(&self, job: ToolExecutionJob) -> Result<String> {
        let queued = QueuedJob {
            id: uuid::Uuid::new_v4().to_string(),
            job,
            enqueued_at: Utc::now(),
        };
        // Tracked before the append so a concurrent compaction keeps it
        self.live().insert(queued.id.clone(), queued.clone());
        if let Err(e) = self
            .append(&JournalRecord::Enqueue {
                job: queued.clone(),
            })
            .await
        {
            self.live().remove(&queued.id);
            return Err(e);
        }
        debug!(
            job_id = %queued.id,
            tool_call_id = %queued.job.tool_call_id,
            "Enqueued tool job"
        );
        let id = queued.id.clone();
        self.publish(queued)?;
        Ok(id)
    }
}

/// Fold journal lines into live jobs, oldest first. A torn final line from a
/// crash mid-write is skipped.
fn replay_journal(data: &str) -> Vec<QueuedJob> {
    let mut live: HashMap<String, QueuedJob> = HashMap::new();
    for (n, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(JournalRecord::Enqueue { job }) => {
                live.insert(job.id.clone(), job);
            }
            Ok(JournalRecord::Ack { id }) => {
                live.remove(&id);
            }
            Err(e) => warn!(line = n + 1, error = %e, "Skipping corrupt journal line"),
        }
    }
    let mut jobs: Vec<QueuedJob> = live.into_values().collect();
    jobs.sort_by_key(|j| j.enqueued_at);
    jobs
}

async fn write_snapshot(path: &Path, jobs: &[QueuedJob]) -> Result<()> {
    let mut data = String::new();
    for job in jobs {
        let line = serde_json::to_string(&JournalRecord::Enqueue { job: job.clone() })?;
        data.push_str(&line);
        data.push('\n');
    }
    // Atomic write: write to temp then rename
    let tmp = path.with_extension("jsonl.tmp");
    tokio::fs::write(&tmp, data.as_bytes()).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn open_append(path: &Path) -> Result<tokio::fs::File> {
    Ok(tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(call: &str) -> ToolExecutionJob {
        ToolExecutionJob {
            tool_call_id: call.into(),
            server_id: "search".into(),
            tool_name: "web_search".into(),
            tool_id: None,
            arguments: json!({"query": "x"}),
            session_id: "S1".into(),
            message_id: "m1".into(),
            request_id: "r1".into(),
        }
    }

    #[tokio::test]
    async fn test_submit_then_next_delivers_once() {
        let queue = JobQueue::in_memory();
        let id = queue.submit(job("c1")).await.unwrap();
        assert_eq!(queue.depth(), 1);

        let got = queue.next().await.unwrap();
        assert_eq!(got.id, id);
        assert_eq!(got.job.tool_call_id, "c1");

        queue.ack(&id).await.unwrap();
        assert_eq!(queue.depth(), 0);
        // Double ack is harmless
        queue.ack(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_unacked_jobs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let (first, second) = {
            let queue = JobQueue::open(dir.path()).await.unwrap();
            let a = queue.submit(job("c1")).await.unwrap();
            let b = queue.submit(job("c2")).await.unwrap();
            queue.ack(&a).await.unwrap();
            (a, b)
        };

        let queue = JobQueue::open(dir.path()).await.unwrap();
        assert_eq!(queue.depth(), 1);
        let replayed = queue.next().await.unwrap();
        assert_eq!(replayed.id, second);
        assert_ne!(replayed.id, first);
        assert_eq!(replayed.job.tool_call_id, "c2");
    }

    #[tokio::test]
    async fn test_reopen_compacts_and_tolerates_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        {
            let queue = JobQueue::open(dir.path()).await.unwrap();
            let a = queue.submit(job("c1")).await.unwrap();
            queue.submit(job("c2")).await.unwrap();
            queue.ack(&a).await.unwrap();
        }
        let path = dir.path().join("jobs.jsonl");
        let mut data = std::fs::read_to_string(&path).unwrap();
        data.push_str("{\"op\":\"enqueue\",\"job\":{\"id\"");
        std::fs::write(&path, data).unwrap();

        let queue = JobQueue::open(dir.path()).await.unwrap();
        assert_eq!(queue.depth(), 1);
        let compacted = std::fs::read_to_string(&path).unwrap();
        assert_eq!(compacted.lines().count(), 1);
        assert!(compacted.contains("\"c2\""));
    }

    #[tokio::test]
    async fn test_explicit_compaction_drops_acked() {
        let dir = tempfile::tempdir().unwrap();
        let queue = JobQueue::open(dir.path()).await.unwrap();
        let ids = [
            queue.submit(job("c1")).await.unwrap(),
            queue.submit(job("c2")).await.unwrap(),
            queue.submit(job("c3")).await.unwrap(),
        ];
        queue.ack(&ids[0]).await.unwrap();
        queue.ack(&ids[2]).await.unwrap();
        queue.compact().await.unwrap();

        let data = std::fs::read_to_string(dir.path().join("jobs.jsonl")).unwrap();
        assert_eq!(data.lines().count(), 1);

        // Appends after compaction land in the new file
        queue.submit(job("c4")).await.unwrap();
        let data = std::fs::read_to_string(dir.path().join("jobs.jsonl")).unwrap();
        assert_eq!(data.lines().count(), 2);
    }
}
