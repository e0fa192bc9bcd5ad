use crate::error::Result;
use crate::meta::Meta;
use crate::scheduler::job::Job;
use crate::scheduler::queue::JobQueue;

/// Sets `job.dependency_id` to the largest queued job ID below `job.id`
/// that conflicts with it (0 when nothing conflicts).
///
/// Execution is already FIFO, so this only records causal intent. It must
/// run in the same transaction that enqueues `job`.
pub fn build_job_dependence(meta: &mut Meta<'_>, job: &mut Job) -> Result<()> {
    let queued = JobQueue::new(meta).all()?;
    let mut dependency = 0;
    for mut other in queued {
        if other.id >= job.id {
            continue;
        }
        if other.id > dependency && job.is_dependent_on(&mut other)? {
            dependency = other.id;
        }
    }
    if dependency != 0 {
        tracing::debug!(job_id = job.id, dependency_id = dependency, "Job depends on earlier job");
    }
    job.dependency_id = dependency;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemStore;
    use crate::scheduler::job::JobType;

    fn queue_jobs(store: &MemStore, jobs: Vec<Job>) {
        store
            .run_in_txn(false, |txn| {
                let mut meta = Meta::new(txn);
                let mut queue = JobQueue::new(&mut meta);
                for job in &jobs {
                    queue.enqueue(&mut job.clone())?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn job(id: i64, job_type: JobType, schema_id: i64, table_id: i64) -> Job {
        let mut job = Job::new(job_type, schema_id, table_id);
        job.id = id;
        job
    }

    fn resolve(store: &MemStore, mut new_job: Job) -> i64 {
        let mut txn = store.begin();
        let mut meta = Meta::new(&mut txn);
        build_job_dependence(&mut meta, &mut new_job).unwrap();
        new_job.dependency_id
    }

    #[test]
    fn no_conflict_means_no_dependency() {
        let store = MemStore::new();
        queue_jobs(&store, vec![job(1, JobType::CreateTable, 1, 10)]);
        assert_eq!(resolve(&store, job(2, JobType::CreateTable, 2, 20)), 0);
    }

    #[test]
    fn picks_largest_conflicting_id() {
        let store = MemStore::new();
        queue_jobs(
            &store,
            vec![
                job(3, JobType::AddColumn, 1, 10),
                job(4, JobType::CreateTable, 2, 20),
                job(5, JobType::AddIndex, 1, 10),
            ],
        );
        assert_eq!(resolve(&store, job(6, JobType::DropColumn, 1, 10)), 5);
    }

    #[test]
    fn ignores_later_jobs() {
        let store = MemStore::new();
        queue_jobs(&store, vec![job(9, JobType::AddColumn, 1, 10)]);
        assert_eq!(resolve(&store, job(8, JobType::DropColumn, 1, 10)), 0);
    }

    #[test]
    fn schema_job_is_dependency_for_table_in_schema() {
        let store = MemStore::new();
        queue_jobs(&store, vec![job(1, JobType::CreateSchema, 5, 0)]);
        assert_eq!(resolve(&store, job(2, JobType::CreateTable, 5, 50)), 1);
    }
}
