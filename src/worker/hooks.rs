use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{DdlError, Result};
use crate::meta::Meta;
use crate::scheduler::job::{Job, JobState, JobType, CURRENT_VERSION};

/// Observability hooks. Return values are never consumed by the scheduler.
pub trait Callback: Send + Sync {
    /// Called right before the job's handler is dispatched.
    fn on_job_run_before(&self, _job: &Job) {}

    /// Called after every persisted transition, including finalization.
    fn on_job_updated(&self, _job: &Job) {}
}

/// Callback that does nothing.
#[derive(Debug, Default)]
pub struct BaseCallback;

impl Callback for BaseCallback {}

/// Holds the registered callback. Callers get a clone of the `Arc`, so
/// hooks run without the registration lock held.
pub struct Hooks {
    callback: RwLock<Arc<dyn Callback>>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            callback: RwLock::new(Arc::new(BaseCallback)),
        }
    }
}

impl Hooks {
    pub fn set_callback(&self, callback: Arc<dyn Callback>) {
        *self.callback.write() = callback;
    }

    pub fn callback(&self) -> Arc<dyn Callback> {
        self.callback.read().clone()
    }
}

/// Emits change events for finished jobs, inside the finalizing transaction.
pub trait BinlogEmitter: Send + Sync {
    fn emit_ddl_event(&self, start_ts: u64, job: &Job);
}

#[derive(Debug, Default)]
pub struct NoopBinlog;

impl BinlogEmitter for NoopBinlog {
    fn emit_ddl_event(&self, _start_ts: u64, _job: &Job) {}
}

/// Schedules asynchronous deletion of data ranges a finished job orphaned.
pub trait RangeDeleter: Send + Sync {
    fn add_delete_range_job(&self, meta: &mut Meta<'_>, job: &Job) -> Result<()>;
}

/// Records pending range deletions in the metadata store, in the same
/// transaction that archives the job.
#[derive(Debug, Default)]
pub struct StoreRangeDeleter;

impl RangeDeleter for StoreRangeDeleter {
    fn add_delete_range_job(&self, meta: &mut Meta<'_>, job: &Job) -> Result<()> {
        if job.version > CURRENT_VERSION {
            return Err(DdlError::InvalidJobVersion {
                job: job.version,
                current: CURRENT_VERSION,
            });
        }
        let start_ts = meta.start_ts();
        meta.add_delete_range(job.id, start_ts)
    }
}

/// Whether finishing `job` leaves data ranges behind.
pub fn needs_range_deletion(job: &Job) -> bool {
    match job.job_type {
        JobType::AddIndex => job.state == JobState::RollbackDone,
        JobType::DropSchema | JobType::DropTable | JobType::TruncateTable | JobType::DropIndex => {
            true
        }
        _ => false,
    }
}
