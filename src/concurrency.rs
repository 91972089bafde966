//! Bounded-concurrency batch execution.
//!
//! `batch_process` runs one async worker per item with at most `concurrency`
//! in flight. One item's failure never cancels or blocks its siblings; every
//! item produces a tagged outcome, returned in input order. Used at two
//! nested levels by the collector: per-salesperson (outer) and per-transcript
//! fetch (inner).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Per-item result of a batch run.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Success(T),
    Failure(String),
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// Outcome of a whole batch: per-item outcomes in input order plus counts.
#[derive(Debug)]
pub struct BatchSummary<T> {
    pub outcomes: Vec<TaskOutcome<T>>,
    pub success: usize,
    pub failed: usize,
}

/// Progress callback: (completed, total, success, failed).
pub type ProgressFn = Arc<dyn Fn(usize, usize, usize, usize) + Send + Sync>;

/// Execute `worker` for every item with at most `concurrency` in flight.
///
/// Worker errors (and worker panics) become `TaskOutcome::Failure` for that
/// item only. The optional progress callback fires after each completion.
pub async fn batch_process<I, T, E, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    progress: Option<ProgressFn>,
    worker: F,
) -> BatchSummary<T>
where
    I: Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let worker = Arc::new(worker);
    let mut set: JoinSet<Result<T, E>> = JoinSet::new();

    // Task id -> input index, so a panicked task still lands on its own item.
    let mut task_indices: HashMap<tokio::task::Id, usize> = HashMap::with_capacity(total);

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let worker = Arc::clone(&worker);
        let handle = set.spawn(async move {
            // The semaphore is never closed while tasks run; acquire cannot fail.
            let _permit = semaphore.acquire_owned().await.ok();
            worker(item).await
        });
        task_indices.insert(handle.id(), index);
    }

    let mut slots: Vec<Option<TaskOutcome<T>>> = (0..total).map(|_| None).collect();
    let mut completed = 0;
    let mut success = 0;
    let mut failed = 0;

    while let Some(joined) = set.join_next_with_id().await {
        let (task_id, outcome) = match joined {
            Ok((id, Ok(value))) => (id, TaskOutcome::Success(value)),
            Ok((id, Err(e))) => (id, TaskOutcome::Failure(e.to_string())),
            Err(join_err) => {
                log::error!("batch worker panicked: {join_err}");
                (
                    join_err.id(),
                    TaskOutcome::Failure(format!("task panicked: {join_err}")),
                )
            }
        };

        completed += 1;
        if outcome.is_success() {
            success += 1;
        } else {
            failed += 1;
        }
        if let Some(slot) = task_indices
            .get(&task_id)
            .and_then(|&index| slots.get_mut(index))
        {
            *slot = Some(outcome);
        }
        if let Some(ref callback) = progress {
            callback(completed, total, success, failed);
        }
    }

    let outcomes = slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| TaskOutcome::Failure("task lost".to_string())))
        .collect();

    BatchSummary {
        outcomes,
        success,
        failed,
    }
}
