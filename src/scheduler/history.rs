use crate::error::Result;
use crate::meta::Meta;
use crate::scheduler::job::Job;

/// Appends a finished job. Returns `false` when the ID was already
/// archived, in which case the stored entry is left untouched.
pub fn add_history_job(meta: &mut Meta<'_>, job: &mut Job) -> Result<bool> {
    if meta.history_get(job.id).is_some() {
        tracing::warn!(job_id = job.id, "Job already in history, skipping");
        return Ok(false);
    }
    let bytes = job.encode(true)?;
    meta.history_put(job.id, bytes)?;
    Ok(true)
}

pub fn get_history_job(meta: &Meta<'_>, id: i64) -> Result<Option<Job>> {
    match meta.history_get(id) {
        Some(bytes) => Ok(Some(Job::decode(bytes)?)),
        None => Ok(None),
    }
}

/// Most recently archived jobs first (by ID), at most `limit`.
pub fn history_jobs(meta: &Meta<'_>, limit: usize) -> Result<Vec<Job>> {
    meta.history_rev()
        .into_iter()
        .take(limit)
        .map(|(_, bytes)| Job::decode(bytes))
        .collect()
}
