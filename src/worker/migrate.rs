use crate::error::{DdlError, Result};
use crate::meta::{Meta, QueueKind};
use crate::scheduler::job::{JobState, SchemaState};
use crate::scheduler::queue::JobQueue;
use crate::worker::runner::JobRunner;

/// Persisted once the legacy queue has been fully drained.
pub const LEGACY_DRAINED_FLAG: &str = "LegacyQueueDrained";

/// Empties the legacy queue inside the caller's transaction.
///
/// Jobs that are fully public or never became visible are archived as they
/// stand; anything in between is converted to a rollback job and moved to
/// the tail of the current queue. Returns how many jobs were handled.
/// Once the queue is empty the drained flag is set, and later calls return
/// immediately.
pub fn drain_legacy_queue(runner: &JobRunner, meta: &mut Meta<'_>) -> Result<usize> {
    if meta.flag(LEGACY_DRAINED_FLAG) {
        return Ok(0);
    }
    let previous = meta.queue();
    let drained = drain(runner, meta);
    meta.set_queue(previous);
    let count = drained?;
    meta.set_flag(LEGACY_DRAINED_FLAG)?;
    if count > 0 {
        tracing::info!(count, "Drained legacy job queue");
    }
    Ok(count)
}

fn drain(runner: &JobRunner, meta: &mut Meta<'_>) -> Result<usize> {
    let mut count = 0;
    loop {
        meta.set_queue(QueueKind::Legacy);
        let Some(mut job) = JobQueue::new(meta).peek_head()? else {
            return Ok(count);
        };
        count += 1;
        tracing::info!(job = %job, "Migrating legacy job");

        match job.schema_state {
            SchemaState::Public => {
                job.state = JobState::Synced;
                runner.finish_job(meta, &mut job)?;
            }
            SchemaState::None => {
                job.state = JobState::Cancelled;
                job.record_error(&DdlError::CancelledJob(format!(
                    "legacy job {} never became visible",
                    job.id
                )));
                runner.finish_job(meta, &mut job)?;
            }
            _ => match runner.handlers().get(job.job_type) {
                Some(handler) => {
                    handler.convert_to_rollback(meta, &mut job)?;
                    JobQueue::new(meta).dequeue_head()?;
                    meta.set_queue(QueueKind::Current);
                    JobQueue::new(meta).enqueue(&mut job)?;
                }
                None => {
                    job.state = JobState::Cancelled;
                    job.record_error(&DdlError::InvalidJob(job.to_string()));
                    runner.finish_job(meta, &mut job)?;
                }
            },
        }
    }
}
