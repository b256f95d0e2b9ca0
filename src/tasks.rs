//! # Resumable tasks
//!
//! Long-running operations (currently record pruning) are persisted before
//! they run so a crash mid-way is recoverable: on startup, timed-out tasks
//! are grabbed and re-executed until none remain. While a task runs its
//! timeout is extended on a timer, so an in-flight task is never mistaken
//! for a crashed one.

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, interval, sleep};

use crate::provider::{Provider, TaskStore};
use crate::records::Delete;
use crate::Result;

/// Seconds before an unextended task is considered crashed.
pub const TIMEOUT_SECS: u64 = 120;

/// Seconds between timeout extensions while a task runs.
const EXTEND_SECS: u64 = 30;

/// Tasks grabbed per startup-sweep batch.
const GRAB_BATCH: u64 = 100;

/// Attempts (across restarts — each grab counts one) after which a
/// persistently failing task is dropped rather than retried.
const MAX_RETRY_COUNT: u64 = 5;

const MAX_RETRY_DELAY_SECS: u64 = 60;

/// A persisted resumable task.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumableTask {
    /// Unique task id.
    pub id: String,

    /// The operation to (re-)execute.
    #[serde(flatten)]
    pub task: TaskType,

    /// Unix timestamp (seconds) after which the task is grabbable.
    pub timeout: u64,

    /// Number of times the task has been grabbed.
    pub retry_count: u64,
}

/// The operations that run as resumable tasks.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "name", content = "data", rename_all = "camelCase")]
pub enum TaskType {
    /// Delete (and possibly prune) a record.
    RecordsDelete(Delete),
}

/// An operation executable as a resumable task.
#[allow(async_fn_in_trait)]
pub trait Task: Send + Sync {
    /// Execute the operation. Must be idempotent: a resumed task re-runs
    /// from the start.
    async fn run(&self, owner: &str, provider: &impl Provider) -> Result<()>;
}

/// Register and execute a task, extending its timeout while it runs.
/// On success the task row is deleted; on failure it is left registered so
/// the startup sweep retries it.
///
/// # Errors
///
/// Returns the task's error when execution fails.
pub async fn run(owner: &str, task: TaskType, provider: &impl Provider) -> Result<()> {
    let resumable = ResumableTask {
        id: uuid::Uuid::new_v4().to_string(),
        task,
        timeout: 0,
        retry_count: 0,
    };
    TaskStore::register(provider, owner, &resumable, TIMEOUT_SECS).await?;

    let mut extend = interval(Duration::from_secs(EXTEND_SECS));
    extend.tick().await; // the first tick fires immediately

    let fut = execute(owner, &resumable.task, provider);
    tokio::pin!(fut);

    loop {
        tokio::select! {
            result = &mut fut => {
                return match result {
                    Ok(()) => {
                        TaskStore::delete(provider, owner, &resumable.id).await?;
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %resumable.id, error = %e,
                            "task failed; leaving registered for resume");
                        Err(e)
                    }
                };
            }
            _ = extend.tick() => {
                TaskStore::extend(provider, owner, &resumable.id, TIMEOUT_SECS).await?;
            }
        }
    }
}

/// Grab and execute timed-out tasks until none remain. Called when a web
/// node opens.
///
/// # Errors
///
/// Returns an error when the task store fails; task execution errors are
/// retried up to [`MAX_RETRY_COUNT`] attempts, then the task is dropped so
/// a poison task cannot stall the sweep.
pub async fn resume(owner: &str, provider: &impl Provider) -> Result<()> {
    loop {
        let tasks = TaskStore::grab(provider, owner, GRAB_BATCH).await?;
        if tasks.is_empty() {
            return Ok(());
        }

        for task in tasks {
            // grabs from earlier sweeps already count against the cap
            let mut retry_count = task.retry_count;
            let mut delay_secs = 1;
            loop {
                match execute(owner, &task.task, provider).await {
                    Ok(()) => {
                        TaskStore::delete(provider, owner, &task.id).await?;
                        break;
                    }
                    Err(e) if e.code() == 400 && retry_count < MAX_RETRY_COUNT => {
                        // internal/integrity failure: retry with backoff
                        retry_count += 1;
                        tracing::warn!(task_id = %task.id, error = %e,
                            "task failed; retrying in {delay_secs}s \
                             ({retry_count}/{MAX_RETRY_COUNT})");
                        sleep(Duration::from_secs(delay_secs)).await;
                        delay_secs = (delay_secs * 2).min(MAX_RETRY_DELAY_SECS);
                    }
                    Err(e) => {
                        // authorization and state errors cannot succeed on
                        // retry, and a task out of attempts must not block
                        // the tasks behind it; drop it
                        tracing::warn!(task_id = %task.id, error = %e,
                            "task cannot complete; dropping");
                        TaskStore::delete(provider, owner, &task.id).await?;
                        break;
                    }
                }
            }
        }
    }
}

async fn execute(owner: &str, task: &TaskType, provider: &impl Provider) -> Result<()> {
    match task {
        TaskType::RecordsDelete(delete) => delete.run(owner, provider).await,
    }
}
