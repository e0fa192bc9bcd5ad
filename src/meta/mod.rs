//! Transactional metadata access.
//!
//! [`MemStore`] is the backing store: snapshot transactions over plain
//! values, lists and integer-keyed hashes. [`Meta`] layers the scheduler's
//! key layout on top of a single [`Txn`]: the global ID and schema version
//! counters, schema diffs, the two job queue namespaces, the history hash,
//! pending range deletions and persisted flags.

mod store;

pub use store::{MemStore, Txn};

use crate::error::Result;
use crate::scheduler::job::SchemaDiff;

const NEXT_GLOBAL_ID_KEY: &str = "NextGlobalID";
const SCHEMA_VERSION_KEY: &str = "SchemaVersionKey";
const SCHEMA_DIFF_KEY: &str = "SchemaDiff";
const HISTORY_KEY: &str = "DDLJobHistory";
const DELETE_RANGE_KEY: &str = "DDLDeleteRange";
const FLAG_PREFIX: &str = "Flag:";

/// Which physical job queue a [`Meta`] addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// The live queue all new jobs are appended to.
    Current,
    /// Pre-upgrade add-index queue, drained once and never written to.
    Legacy,
}

impl QueueKind {
    pub fn key(&self) -> &'static str {
        match self {
            QueueKind::Current => "DDLJobList",
            QueueKind::Legacy => "DDLJobAddIdxList",
        }
    }
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Current => write!(f, "current"),
            QueueKind::Legacy => write!(f, "legacy"),
        }
    }
}

/// Scheduler view of one transaction.
pub struct Meta<'a> {
    txn: &'a mut Txn,
    queue: QueueKind,
}

impl<'a> Meta<'a> {
    pub fn new(txn: &'a mut Txn) -> Self {
        Self {
            txn,
            queue: QueueKind::Current,
        }
    }

    pub fn with_queue(txn: &'a mut Txn, queue: QueueKind) -> Self {
        Self { txn, queue }
    }

    /// Switches which job queue subsequent queue operations address.
    pub fn set_queue(&mut self, queue: QueueKind) {
        self.queue = queue;
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn start_ts(&self) -> u64 {
        self.txn.start_ts()
    }

    pub fn gen_global_id(&mut self) -> Result<i64> {
        self.txn.inc(NEXT_GLOBAL_ID_KEY, 1)
    }

    pub fn global_id(&self) -> Result<i64> {
        self.txn.get_i64(NEXT_GLOBAL_ID_KEY)
    }

    /// Bumps the schema version. Callers must pair this with one diff.
    pub fn gen_schema_version(&mut self) -> Result<i64> {
        self.txn.inc(SCHEMA_VERSION_KEY, 1)
    }

    pub fn schema_version(&self) -> Result<i64> {
        self.txn.get_i64(SCHEMA_VERSION_KEY)
    }

    pub fn set_schema_diff(&mut self, diff: &SchemaDiff) -> Result<()> {
        let bytes = serde_json::to_vec(diff)?;
        self.txn.hash_set(SCHEMA_DIFF_KEY, diff.version, bytes)
    }

    pub fn schema_diff(&self, version: i64) -> Result<Option<SchemaDiff>> {
        match self.txn.hash_get(SCHEMA_DIFF_KEY, version) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    pub(crate) fn queue_push(&mut self, value: Vec<u8>) -> Result<()> {
        self.txn.list_push(self.queue.key(), value)
    }

    pub(crate) fn queue_index(&self, index: usize) -> Option<&[u8]> {
        self.txn.list_index(self.queue.key(), index)
    }

    pub(crate) fn queue_set(&mut self, index: usize, value: Vec<u8>) -> Result<()> {
        self.txn.list_set(self.queue.key(), index, value)
    }

    pub(crate) fn queue_pop(&mut self) -> Option<Vec<u8>> {
        self.txn.list_pop_front(self.queue.key())
    }

    pub(crate) fn queue_all(&self) -> Vec<&[u8]> {
        self.txn.list_all(self.queue.key())
    }

    pub fn queue_len(&self) -> usize {
        self.txn.list_len(self.queue.key())
    }

    pub(crate) fn history_get(&self, id: i64) -> Option<&[u8]> {
        self.txn.hash_get(HISTORY_KEY, id)
    }

    pub(crate) fn history_put(&mut self, id: i64, value: Vec<u8>) -> Result<()> {
        self.txn.hash_set(HISTORY_KEY, id, value)
    }

    pub(crate) fn history_rev(&self) -> Vec<(i64, &[u8])> {
        self.txn.hash_rev(HISTORY_KEY)
    }

    pub fn history_len(&self) -> usize {
        self.txn.hash_len(HISTORY_KEY)
    }

    /// Records a pending range deletion for `job_id`. Re-adding is a no-op.
    pub fn add_delete_range(&mut self, job_id: i64, start_ts: u64) -> Result<()> {
        if self.txn.hash_get(DELETE_RANGE_KEY, job_id).is_some() {
            return Ok(());
        }
        self.txn
            .hash_set(DELETE_RANGE_KEY, job_id, start_ts.to_string().into_bytes())
    }

    /// Job IDs with a pending range deletion, newest first.
    pub fn delete_range_jobs(&self) -> Vec<i64> {
        self.txn
            .hash_rev(DELETE_RANGE_KEY)
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    pub fn flag(&self, name: &str) -> bool {
        self.txn.get(&format!("{}{}", FLAG_PREFIX, name)).is_some()
    }

    pub fn set_flag(&mut self, name: &str) -> Result<()> {
        self.txn
            .set(&format!("{}{}", FLAG_PREFIX, name), b"1".to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobType;

    #[test]
    fn global_ids_increase_across_txns() {
        let store = MemStore::new();
        let a = store
            .run_in_txn(true, |txn| Meta::new(txn).gen_global_id())
            .unwrap();
        let b = store
            .run_in_txn(true, |txn| Meta::new(txn).gen_global_id())
            .unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
    }

    #[test]
    fn schema_diff_roundtrip() {
        let store = MemStore::new();
        store
            .run_in_txn(false, |txn| {
                let mut m = Meta::new(txn);
                let version = m.gen_schema_version()?;
                m.set_schema_diff(&SchemaDiff {
                    version,
                    job_type: JobType::CreateTable,
                    schema_id: 1,
                    table_id: 2,
                    old_table_id: 0,
                    old_schema_id: 0,
                })
            })
            .unwrap();
        let mut txn = store.begin();
        let m = Meta::new(&mut txn);
        assert_eq!(m.schema_version().unwrap(), 1);
        let diff = m.schema_diff(1).unwrap().unwrap();
        assert_eq!(diff.table_id, 2);
        assert!(m.schema_diff(2).unwrap().is_none());
    }

    #[test]
    fn queues_are_separate_namespaces() {
        let store = MemStore::new();
        store
            .run_in_txn(false, |txn| {
                let mut m = Meta::with_queue(txn, QueueKind::Legacy);
                m.queue_push(b"legacy".to_vec())?;
                m.set_queue(QueueKind::Current);
                m.queue_push(b"a".to_vec())?;
                m.queue_push(b"b".to_vec())
            })
            .unwrap();
        let mut txn = store.begin();
        let mut m = Meta::new(&mut txn);
        assert_eq!(m.queue_len(), 2);
        m.set_queue(QueueKind::Legacy);
        assert_eq!(m.queue_len(), 1);
        assert_eq!(m.queue_index(0), Some(&b"legacy"[..]));
    }

    #[test]
    fn flags_persist() {
        let store = MemStore::new();
        store
            .run_in_txn(false, |txn| Meta::new(txn).set_flag("drained"))
            .unwrap();
        let mut txn = store.begin();
        let m = Meta::new(&mut txn);
        assert!(m.flag("drained"));
        assert!(!m.flag("other"));
    }

    #[test]
    fn delete_range_is_idempotent() {
        let store = MemStore::new();
        store
            .run_in_txn(false, |txn| {
                let mut m = Meta::new(txn);
                m.add_delete_range(4, 10)?;
                m.add_delete_range(4, 11)?;
                m.add_delete_range(9, 12)
            })
            .unwrap();
        let mut txn = store.begin();
        assert_eq!(Meta::new(&mut txn).delete_range_jobs(), vec![9, 4]);
    }
}
