use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{DdlError, Result};

/// Progress of the background reorganization for a job.
#[derive(Debug, PartialEq, Eq)]
pub enum ReorgStatus {
    Running,
    Finished(Result<()>),
}

struct ReorgTask {
    job_id: i64,
    token: CancellationToken,
    done_rx: oneshot::Receiver<Result<()>>,
    done: Arc<AtomicBool>,
}

/// Owns the single background backfill task of this process.
///
/// The task only ever learns about cancellation through its token; nothing
/// here aborts it.
#[derive(Default)]
pub struct ReorgCtx {
    task: Mutex<Option<ReorgTask>>,
    finished: Arc<Notify>,
}

impl std::fmt::Debug for ReorgCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let job_id = self.task.lock().as_ref().map(|t| t.job_id);
        f.debug_struct("ReorgCtx").field("job_id", &job_id).finish()
    }
}

impl ReorgCtx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts `backfill` for `job_id` on a blocking thread unless it is
    /// already running, then reports progress without waiting.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run_reorg_job<F>(&self, job_id: i64, backfill: F) -> ReorgStatus
    where
        F: FnOnce(CancellationToken) -> Result<()> + Send + 'static,
    {
        let mut slot = self.task.lock();
        if slot.as_ref().map(|t| t.job_id) != Some(job_id) {
            if let Some(stale) = slot.take() {
                tracing::warn!(job_id = stale.job_id, "Abandoning reorg of another job");
                stale.token.cancel();
            }
            let token = CancellationToken::new();
            let (done_tx, done_rx) = oneshot::channel();
            let child = token.clone();
            let done = Arc::new(AtomicBool::new(false));
            let finished = self.finished.clone();
            let task_done = done.clone();
            tokio::task::spawn_blocking(move || {
                let _ = done_tx.send(backfill(child));
                task_done.store(true, Ordering::Release);
                finished.notify_waiters();
            });
            tracing::info!(job_id, "Started reorg backfill");
            *slot = Some(ReorgTask {
                job_id,
                token,
                done_rx,
                done,
            });
        }

        let Some(task) = slot.as_mut() else {
            return ReorgStatus::Running;
        };
        let status = match task.done_rx.try_recv() {
            Ok(result) => ReorgStatus::Finished(result),
            Err(TryRecvError::Empty) => return ReorgStatus::Running,
            Err(TryRecvError::Closed) => ReorgStatus::Finished(Err(DdlError::Internal(
                "reorg worker exited without a result".to_string(),
            ))),
        };
        *slot = None;
        status
    }

    /// Asks the running backfill, if any, to stop at its next checkpoint.
    pub fn notify_reorg_cancel(&self) {
        if let Some(task) = self.task.lock().as_ref() {
            tracing::info!(job_id = task.job_id, "Cancelling reorg backfill");
            task.token.cancel();
        }
    }

    pub fn is_running(&self, job_id: i64) -> bool {
        self.task.lock().as_ref().map(|t| t.job_id) == Some(job_id)
    }

    /// Waits up to `timeout` for the running backfill to produce a result.
    /// Returns whether one is ready. Completions that happened before an
    /// earlier task was collected do not count.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let notified = self.finished.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let done = match self.task.lock().as_ref() {
            Some(task) => task.done.load(Ordering::Acquire),
            None => return false,
        };
        done || tokio::time::timeout(timeout, notified).await.is_ok()
    }
}

/// Checkpoint helper for backfill loops.
pub fn check_reorg_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        return Err(DdlError::CancelledJob("reorganization cancelled".to_string()));
    }
    Ok(())
}
