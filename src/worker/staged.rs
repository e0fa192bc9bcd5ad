//! Reference handlers.
//!
//! They keep no schema objects of their own: the job's `schema_state` is the
//! only record of how far a change has progressed, and every visible step
//! bumps the schema version through [`update_schema_version`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{DdlError, Result};
use crate::meta::Meta;
use crate::scheduler::job::{Job, JobState, JobType, SchemaState};
use crate::worker::handler::{update_schema_version, HandlerContext, HandlerRegistry, JobHandler};
use crate::worker::reorg::{check_reorg_cancelled, ReorgStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ladder {
    /// Object becomes public in a single step.
    OneStep,
    /// None -> DeleteOnly -> WriteOnly -> Public.
    Add,
    /// Public -> WriteOnly -> DeleteOnly -> None.
    Drop,
}

fn ladder(job_type: JobType) -> Ladder {
    match job_type {
        JobType::AddColumn | JobType::AddIndex | JobType::AddForeignKey => Ladder::Add,
        JobType::DropSchema
        | JobType::DropTable
        | JobType::DropColumn
        | JobType::DropIndex
        | JobType::DropForeignKey => Ladder::Drop,
        _ => Ladder::OneStep,
    }
}

fn finish(meta: &mut Meta<'_>, job: &mut Job, state: JobState) -> Result<i64> {
    let version = update_schema_version(meta, job)?;
    job.state = state;
    if state == JobState::Done {
        job.binlog_info.add_table_info(
            version,
            json!({
                "schema_id": job.schema_id,
                "table_id": job.table_id,
                "state": job.schema_state.to_string(),
            }),
        );
    }
    Ok(version)
}

/// Steps rollback from any partially visible state back to absent.
fn roll_back(meta: &mut Meta<'_>, job: &mut Job) -> Result<i64> {
    match job.schema_state {
        SchemaState::None => finish(meta, job, JobState::RollbackDone),
        SchemaState::DeleteOnly => {
            job.schema_state = SchemaState::None;
            finish(meta, job, JobState::RollbackDone)
        }
        _ => {
            job.schema_state = SchemaState::DeleteOnly;
            update_schema_version(meta, job)
        }
    }
}

/// Walks a job through the visibility states one step per call.
#[derive(Debug, Default)]
pub struct StagedHandler;

impl JobHandler for StagedHandler {
    fn execute(&self, _ctx: &HandlerContext<'_>, meta: &mut Meta<'_>, job: &mut Job) -> Result<i64> {
        if job.is_rolling_back() {
            return roll_back(meta, job);
        }
        match ladder(job.job_type) {
            Ladder::OneStep => {
                job.schema_state = SchemaState::Public;
                finish(meta, job, JobState::Done)
            }
            Ladder::Add => match job.schema_state {
                SchemaState::None => {
                    job.schema_state = SchemaState::DeleteOnly;
                    update_schema_version(meta, job)
                }
                SchemaState::DeleteOnly => {
                    job.schema_state = SchemaState::WriteOnly;
                    update_schema_version(meta, job)
                }
                _ => {
                    job.schema_state = SchemaState::Public;
                    finish(meta, job, JobState::Done)
                }
            },
            // A fresh drop job has not touched its public object yet.
            Ladder::Drop => match job.schema_state {
                SchemaState::None | SchemaState::Public => {
                    job.schema_state = SchemaState::WriteOnly;
                    update_schema_version(meta, job)
                }
                SchemaState::WriteOnly | SchemaState::WriteReorganization => {
                    job.schema_state = SchemaState::DeleteOnly;
                    update_schema_version(meta, job)
                }
                SchemaState::DeleteOnly => {
                    job.schema_state = SchemaState::None;
                    finish(meta, job, JobState::Done)
                }
            },
        }
    }
}

/// Add-index handler with a background backfill between write-only and
/// public.
#[derive(Debug, Clone)]
pub struct BackfillHandler {
    batches: usize,
    batch_delay: Duration,
}

impl Default for BackfillHandler {
    fn default() -> Self {
        Self::new(20, Duration::from_millis(10))
    }
}

impl BackfillHandler {
    pub fn new(batches: usize, batch_delay: Duration) -> Self {
        Self {
            batches,
            batch_delay,
        }
    }

    fn backfill(token: CancellationToken, job_id: i64, batches: usize, delay: Duration) -> Result<()> {
        for batch in 0..batches {
            check_reorg_cancelled(&token)?;
            std::thread::sleep(delay);
            tracing::trace!(job_id, batch, "Backfilled batch");
        }
        Ok(())
    }

    fn reorganize(&self, ctx: &HandlerContext<'_>, meta: &mut Meta<'_>, job: &mut Job) -> Result<i64> {
        let (job_id, batches, delay) = (job.id, self.batches, self.batch_delay);
        let status = ctx.reorg.run_reorg_job(job_id, move |token| {
            Self::backfill(token, job_id, batches, delay)
        });
        match status {
            ReorgStatus::Running => Err(DdlError::WaitReorgTimeout),
            ReorgStatus::Finished(Ok(())) => {
                tracing::info!(job_id, owner_id = %ctx.owner_id, "Backfill finished");
                job.schema_state = SchemaState::Public;
                finish(meta, job, JobState::Done)
            }
            ReorgStatus::Finished(Err(DdlError::CancelledJob(_))) => self.convert_to_rollback(meta, job),
            ReorgStatus::Finished(Err(e)) => Err(e),
        }
    }
}

impl JobHandler for BackfillHandler {
    fn execute(&self, ctx: &HandlerContext<'_>, meta: &mut Meta<'_>, job: &mut Job) -> Result<i64> {
        if job.is_rolling_back() {
            return roll_back(meta, job);
        }
        if job.is_cancelling() {
            // The token is already cancelled; wait for the task to notice.
            if ctx.reorg.is_running(job.id) {
                return match ctx.reorg.run_reorg_job(job.id, |_| Ok(())) {
                    ReorgStatus::Running => Err(DdlError::WaitReorgTimeout),
                    ReorgStatus::Finished(_) => self.convert_to_rollback(meta, job),
                };
            }
            return self.convert_to_rollback(meta, job);
        }
        match job.schema_state {
            SchemaState::None => {
                job.schema_state = SchemaState::DeleteOnly;
                update_schema_version(meta, job)
            }
            SchemaState::DeleteOnly => {
                job.schema_state = SchemaState::WriteOnly;
                update_schema_version(meta, job)
            }
            SchemaState::WriteOnly => {
                job.schema_state = SchemaState::WriteReorganization;
                job.snapshot_ver = meta.start_ts();
                update_schema_version(meta, job)
            }
            SchemaState::WriteReorganization => self.reorganize(ctx, meta, job),
            SchemaState::Public => finish(meta, job, JobState::Done),
        }
    }

    fn convert_to_rollback(&self, meta: &mut Meta<'_>, job: &mut Job) -> Result<i64> {
        tracing::info!(job_id = job.id, schema_state = %job.schema_state, "Rolling back add index");
        job.state = JobState::RollingBack;
        job.record_error(&DdlError::CancelledJob(format!("job {} rolled back", job.id)));
        if job.schema_state == SchemaState::None {
            return Ok(0);
        }
        job.schema_state = SchemaState::DeleteOnly;
        update_schema_version(meta, job)
    }
}

/// Registry with a reference handler for every job type.
pub fn reference_handlers() -> HandlerRegistry {
    reference_handlers_with(BackfillHandler::default())
}

pub fn reference_handlers_with(backfill: BackfillHandler) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let staged: Arc<dyn JobHandler> = Arc::new(StagedHandler);
    for job_type in JobType::ALL {
        registry.insert(job_type, staged.clone());
    }
    registry.insert(JobType::AddIndex, Arc::new(backfill));
    registry
}
