use std::sync::Arc;

use chrono::Utc;

use crate::error::{DdlError, Result};
use crate::meta::Meta;
use crate::scheduler::history::add_history_job;
use crate::scheduler::job::{Job, JobState, SchemaState};
use crate::scheduler::queue::JobQueue;
use crate::worker::handler::{HandlerContext, HandlerRegistry};
use crate::worker::hooks::{needs_range_deletion, BinlogEmitter, Hooks, NoopBinlog, RangeDeleter, StoreRangeDeleter};
use crate::worker::reorg::ReorgCtx;

/// Outcome of one dispatch step on the head job.
#[derive(Debug)]
pub enum Step {
    /// The job left the queue and is now in history.
    Finalized(Job),
    /// The job advanced (or failed) and was written back to the head.
    Ran {
        job: Job,
        schema_version: i64,
        error: Option<DdlError>,
    },
}

impl Step {
    pub fn job(&self) -> &Job {
        match self {
            Step::Finalized(job) => job,
            Step::Ran { job, .. } => job,
        }
    }
}

/// Drives a single job through the state machine inside the caller's
/// transaction.
pub struct JobRunner {
    owner_id: String,
    handlers: HandlerRegistry,
    reorg: Arc<ReorgCtx>,
    hooks: Arc<Hooks>,
    range_deleter: Arc<dyn RangeDeleter>,
    binlog: Arc<dyn BinlogEmitter>,
}

impl JobRunner {
    pub fn new(owner_id: impl Into<String>, handlers: HandlerRegistry, hooks: Arc<Hooks>) -> Self {
        Self {
            owner_id: owner_id.into(),
            handlers,
            reorg: Arc::new(ReorgCtx::new()),
            hooks,
            range_deleter: Arc::new(StoreRangeDeleter),
            binlog: Arc::new(NoopBinlog),
        }
    }

    pub fn with_range_deleter(mut self, range_deleter: Arc<dyn RangeDeleter>) -> Self {
        self.range_deleter = range_deleter;
        self
    }

    pub fn with_binlog_emitter(mut self, binlog: Arc<dyn BinlogEmitter>) -> Self {
        self.binlog = binlog;
        self
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn reorg(&self) -> &Arc<ReorgCtx> {
        &self.reorg
    }

    /// Processes the head job `job` once.
    ///
    /// A head that already reached `Done` or `RollbackDone` is finalized
    /// without dispatch. Otherwise the handler runs and the result is
    /// written back; a job the handler cancelled, or whose record no longer
    /// fits in the store, is finalized instead.
    pub fn step(&self, meta: &mut Meta<'_>, mut job: Job) -> Result<Step> {
        if job.is_done() || job.is_rollback_done() {
            if job.is_done() {
                job.state = JobState::Synced;
            }
            self.finish_job(meta, &mut job)?;
            return Ok(Step::Finalized(job));
        }

        let accepted_args = job.raw_args.clone();
        let (schema_version, error) = self.run_job(meta, &mut job);
        if job.is_cancelled() {
            self.finish_job(meta, &mut job)?;
            return Ok(Step::Finalized(job));
        }

        match self.update_job(meta, &mut job, error.is_some()) {
            Ok(()) => Ok(Step::Ran {
                job,
                schema_version,
                error,
            }),
            Err(e) if e.is_entry_too_large() => {
                // Archive the args as they were when the record last fit.
                job.args = None;
                job.raw_args = accepted_args;
                self.handle_update_job_error(meta, &mut job, &e)?;
                Ok(Step::Finalized(job))
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the handler for `job`, returning the produced schema version and
    /// the error the job hit, if any. Errors are also recorded on the job.
    pub fn run_job(&self, meta: &mut Meta<'_>, job: &mut Job) -> (i64, Option<DdlError>) {
        if job.is_finished() {
            return (0, None);
        }
        tracing::info!(job = %job, "Running DDL job");

        if job.is_cancelling() {
            if job.is_reorg_in_progress() {
                tracing::info!(job_id = job.id, "Cancelling job with backfill in progress");
                self.reorg.notify_reorg_cancel();
            } else {
                job.state = JobState::Cancelled;
                if job.schema_state != SchemaState::Public {
                    job.schema_state = SchemaState::None;
                }
                let err = DdlError::CancelledJob(format!("job {} cancelled", job.id));
                job.record_error(&err);
                return (0, Some(err));
            }
        }

        if !job.is_rolling_back() && !job.is_cancelling() {
            job.state = JobState::Running;
        }
        self.hooks.callback().on_job_run_before(job);

        let result = match self.handlers.get(job.job_type) {
            Some(handler) => {
                let ctx = HandlerContext {
                    owner_id: &self.owner_id,
                    reorg: &self.reorg,
                };
                handler.execute(&ctx, meta, job)
            }
            None => {
                job.state = JobState::Cancelled;
                Err(DdlError::InvalidJob(job.to_string()))
            }
        };

        match result {
            Ok(version) => (version, None),
            // Backfill still going; poll again next pass.
            Err(DdlError::WaitReorgTimeout) => (0, None),
            Err(err) => {
                if job.is_cancelled() {
                    tracing::info!(job_id = job.id, error = %err, "DDL job cancelled");
                } else {
                    tracing::error!(job_id = job.id, error = %err, "Run DDL job failed");
                }
                job.record_error(&err);
                (0, Some(err))
            }
        }
    }

    /// Writes `job` back to the head. After a failed run, undecoded raw
    /// args are kept byte for byte.
    pub fn update_job(&self, meta: &mut Meta<'_>, job: &mut Job, meet_err: bool) -> Result<()> {
        let update_raw_args = !(meet_err && job.args_undecoded());
        if !update_raw_args {
            tracing::info!(job_id = job.id, "Keeping raw args of failed job");
        }
        JobQueue::new(meta).update_head(job, update_raw_args)
    }

    /// Force-cancels a job whose record exceeded the entry size limit.
    pub fn handle_update_job_error(&self, meta: &mut Meta<'_>, job: &mut Job, err: &DdlError) -> Result<()> {
        tracing::warn!(job = %job, error = %err, "Update DDL job failed, cancelling oversized job");
        job.binlog_info.clean();
        job.error = Some(err.to_string());
        job.schema_state = SchemaState::None;
        job.state = JobState::Cancelled;
        self.finish_job(meta, job)
    }

    /// Moves `job` from the head of the queue into history.
    ///
    /// Repeating this for an already archived job leaves history unchanged
    /// and emits no second change event.
    pub fn finish_job(&self, meta: &mut Meta<'_>, job: &mut Job) -> Result<()> {
        if needs_range_deletion(job) {
            self.range_deleter.add_delete_range_job(meta, job)?;
        }

        let queue_kind = meta.queue();
        let mut queue = JobQueue::new(meta);
        match queue.peek_head()? {
            Some(head) if head.id == job.id => {
                queue.dequeue_head()?;
            }
            _ => tracing::warn!(job_id = job.id, queue = %queue_kind, "Finished job is not at queue head"),
        }

        let start_ts = meta.start_ts();
        let mut archived = job.clone();
        archived.binlog_info.finished_ts = start_ts;
        archived.finished_at = Some(Utc::now());
        if !add_history_job(meta, &mut archived)? {
            return Ok(());
        }
        *job = archived;
        if job.is_synced() || job.is_rollback_done() {
            self.binlog.emit_ddl_event(start_ts, job);
        }
        tracing::info!(job = %job, "Finished DDL job");
        Ok(())
    }
}
