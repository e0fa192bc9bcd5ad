use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::meta::Meta;
use crate::scheduler::job::{Job, JobState, JobType, SchemaDiff};
use crate::worker::reorg::ReorgCtx;

/// What a handler can reach besides the transaction and the job.
pub struct HandlerContext<'a> {
    pub owner_id: &'a str,
    pub reorg: &'a ReorgCtx,
}

/// Mutation logic for one kind of schema change.
pub trait JobHandler: Send + Sync {
    /// Advances `job` by one step inside the caller's transaction.
    ///
    /// Returns the schema version produced by this step, or 0 if nothing
    /// visible changed. A handler finishes a job by setting its state to
    /// `Done`, and may give up on it by setting `Cancelled`.
    fn execute(&self, ctx: &HandlerContext<'_>, meta: &mut Meta<'_>, job: &mut Job) -> Result<i64>;

    /// Turns a partially applied job into one that undoes its changes.
    /// Used both for user cancellation and for legacy queue migration.
    /// Returns the schema version the conversion produced, or 0.
    fn convert_to_rollback(&self, _meta: &mut Meta<'_>, job: &mut Job) -> Result<i64> {
        job.state = JobState::RollingBack;
        Ok(0)
    }
}

/// Maps job types to their handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, job_type: JobType, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job_type, handler);
        self
    }

    pub fn insert(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.handlers.keys().map(|t| t.to_string()).collect();
        types.sort();
        f.debug_struct("HandlerRegistry").field("types", &types).finish()
    }
}

/// Bumps the global schema version and records the matching diff.
///
/// Truncate carries the new table ID as its first argument; rename carries
/// the source schema ID.
pub fn update_schema_version(meta: &mut Meta<'_>, job: &mut Job) -> Result<i64> {
    let version = meta.gen_schema_version()?;
    let mut diff = SchemaDiff {
        version,
        job_type: job.job_type,
        schema_id: job.schema_id,
        table_id: job.table_id,
        old_table_id: 0,
        old_schema_id: 0,
    };
    match job.job_type {
        JobType::TruncateTable => {
            let (new_table_id,): (i64,) = job.decode_args()?;
            diff.table_id = new_table_id;
            diff.old_table_id = job.table_id;
        }
        JobType::RenameTable => {
            let (old_schema_id,): (i64,) = job.decode_args()?;
            diff.old_schema_id = old_schema_id;
        }
        _ => {}
    }
    meta.set_schema_diff(&diff)?;
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::MemStore;
    use serde_json::json;

    struct Nop;
    impl JobHandler for Nop {
        fn execute(&self, _: &HandlerContext<'_>, _: &mut Meta<'_>, _: &mut Job) -> Result<i64> {
            Ok(0)
        }
    }

    #[test]
    fn registry_lookup() {
        let registry = HandlerRegistry::new().register(JobType::CreateTable, Arc::new(Nop));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(JobType::CreateTable).is_some());
        assert!(registry.get(JobType::DropTable).is_none());
    }

    #[test]
    fn default_rollback_conversion() {
        let store = MemStore::new();
        let mut job = Job::new(JobType::AddIndex, 1, 1);
        let version = store
            .run_in_txn(false, |txn| Nop.convert_to_rollback(&mut Meta::new(txn), &mut job))
            .unwrap();
        assert_eq!(version, 0);
        assert_eq!(job.state, JobState::RollingBack);
    }

    #[test]
    fn truncate_diff_records_both_tables() {
        let store = MemStore::new();
        let mut job = Job::new(JobType::TruncateTable, 1, 10).with_args(vec![json!(11)]);
        let version = store
            .run_in_txn(false, |txn| update_schema_version(&mut Meta::new(txn), &mut job))
            .unwrap();
        assert_eq!(version, 1);

        let mut txn = store.begin();
        let diff = Meta::new(&mut txn).schema_diff(1).unwrap().unwrap();
        assert_eq!(diff.table_id, 11);
        assert_eq!(diff.old_table_id, 10);
    }

    #[test]
    fn versions_pair_with_diffs() {
        let store = MemStore::new();
        let mut job = Job::new(JobType::AddColumn, 1, 10);
        for expected in 1..=3 {
            let v = store
                .run_in_txn(false, |txn| update_schema_version(&mut Meta::new(txn), &mut job))
                .unwrap();
            assert_eq!(v, expected);
        }
        let mut txn = store.begin();
        let meta = Meta::new(&mut txn);
        for v in 1..=3 {
            assert_eq!(meta.schema_diff(v).unwrap().unwrap().version, v);
        }
    }
}
