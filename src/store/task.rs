//! # Task store
//!
//! Persistence for resumable tasks. A task row is grabbable once its
//! timeout has passed; grabbing extends the timeout so no other client
//! picks the task up while it runs.

use crate::provider::KvStore;
use crate::store::partition::Partition;
use crate::tasks::ResumableTask;
use crate::Result;

const TASK: &str = "task";

fn task_partition(owner: &str) -> Result<Partition> {
    Partition::root(TASK)?.child(owner)
}

fn now_secs() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Register an in-flight task with a timeout of `timeout_secs` from now.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn register(
    owner: &str, task: &ResumableTask, timeout_secs: u64, kv: &impl KvStore,
) -> Result<()> {
    let mut row = task.clone();
    row.timeout = now_secs() + timeout_secs;

    let partition = task_partition(owner)?;
    kv.put(&partition, &row.id, &serde_json::to_vec(&row)?).await.map_err(Into::into)
}

/// Grab up to `count` timed-out tasks, extending each grabbed task's
/// timeout by `timeout_secs`.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn grab(
    owner: &str, count: u64, timeout_secs: u64, kv: &impl KvStore,
) -> Result<Vec<ResumableTask>> {
    let partition = task_partition(owner)?;
    let now = now_secs();

    let mut grabbed = Vec::new();
    for (_, bytes) in kv.range(&partition, None, None, false).await? {
        if grabbed.len() as u64 >= count {
            break;
        }
        let mut task: ResumableTask = serde_json::from_slice(&bytes)?;
        if task.timeout > now {
            continue;
        }

        task.timeout = now + timeout_secs;
        task.retry_count += 1;
        kv.put(&partition, &task.id, &serde_json::to_vec(&task)?).await?;
        grabbed.push(task);
    }

    Ok(grabbed)
}

/// Read a task regardless of in-flight status.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn read(
    owner: &str, task_id: &str, kv: &impl KvStore,
) -> Result<Option<ResumableTask>> {
    let partition = task_partition(owner)?;
    let Some(bytes) = kv.get(&partition, task_id).await? else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Extend a task's timeout to `timeout_secs` from now. No-op when the task
/// has already completed.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn extend(
    owner: &str, task_id: &str, timeout_secs: u64, kv: &impl KvStore,
) -> Result<()> {
    let partition = task_partition(owner)?;
    let Some(bytes) = kv.get(&partition, task_id).await? else {
        return Ok(());
    };

    let mut task: ResumableTask = serde_json::from_slice(&bytes)?;
    task.timeout = now_secs() + timeout_secs;
    kv.put(&partition, task_id, &serde_json::to_vec(&task)?).await.map_err(Into::into)
}

/// Delete a task.
///
/// # Errors
///
/// Returns an error when the underlying store fails.
pub async fn delete(owner: &str, task_id: &str, kv: &impl KvStore) -> Result<()> {
    let partition = task_partition(owner)?;
    kv.delete(&partition, task_id).await.map_err(Into::into)
}
