use std::collections::{BTreeMap, HashMap, VecDeque};

use parking_lot::Mutex;

use crate::config::{DdlConfig, DEFAULT_MAX_ENTRY_SIZE};
use crate::error::{DdlError, Result};

/// Logical shift applied to physical milliseconds when issuing timestamps.
const LOGICAL_BITS: u32 = 18;

/// Committed contents of the store.
///
/// Three structure kinds are exposed: plain values, lists (used for job
/// queues) and integer-keyed hashes (used for history and diffs).
#[derive(Debug, Clone, Default)]
struct StoreState {
    revision: u64,
    values: HashMap<String, Vec<u8>>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
    hashes: HashMap<String, BTreeMap<i64, Vec<u8>>>,
}

/// An in-memory transactional metadata store.
///
/// Transactions work on a private snapshot and commit optimistically: a
/// transaction that wrote anything fails with [`DdlError::TxnConflict`] if
/// another write committed after it started.
#[derive(Debug)]
pub struct MemStore {
    state: Mutex<StoreState>,
    last_ts: Mutex<u64>,
    max_entry_size: usize,
    max_retries: usize,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_ENTRY_SIZE, 10)
    }

    pub fn with_limits(max_entry_size: usize, max_retries: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            last_ts: Mutex::new(0),
            max_entry_size,
            max_retries,
        }
    }

    pub fn from_config(config: &DdlConfig) -> Self {
        Self::with_limits(config.max_entry_size, config.txn_max_retries)
    }

    /// Issues a strictly increasing timestamp (physical ms plus logical counter).
    pub fn next_ts(&self) -> u64 {
        let physical = (chrono::Utc::now().timestamp_millis().max(0) as u64) << LOGICAL_BITS;
        let mut last = self.last_ts.lock();
        *last = if physical > *last { physical } else { *last + 1 };
        *last
    }

    pub fn begin(&self) -> Txn {
        let start_ts = self.next_ts();
        let snapshot = self.state.lock().clone();
        Txn {
            start_ts,
            start_revision: snapshot.revision,
            state: snapshot,
            dirty: false,
            max_entry_size: self.max_entry_size,
        }
    }

    pub fn commit(&self, txn: Txn) -> Result<()> {
        if !txn.dirty {
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.revision != txn.start_revision {
            return Err(DdlError::TxnConflict);
        }
        let mut next = txn.state;
        next.revision = txn.start_revision + 1;
        *state = next;
        Ok(())
    }

    /// Runs `f` in a fresh transaction and commits it.
    ///
    /// Errors from `f` abort the transaction. With `retryable`, commit
    /// conflicts re-run `f` on a new snapshot up to the configured limit.
    pub fn run_in_txn<T, F>(&self, retryable: bool, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Txn) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            let mut txn = self.begin();
            let value = f(&mut txn)?;
            match self.commit(txn) {
                Ok(()) => return Ok(value),
                Err(e) if retryable && e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::debug!(attempt, "Transaction conflict, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A snapshot transaction against [`MemStore`].
#[derive(Debug)]
pub struct Txn {
    start_ts: u64,
    start_revision: u64,
    state: StoreState,
    dirty: bool,
    max_entry_size: usize,
}

impl Txn {
    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    fn check_size(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.max_entry_size {
            return Err(DdlError::EntryTooLarge {
                size: value.len(),
                limit: self.max_entry_size,
            });
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.state.values.get(key).map(|v| v.as_slice())
    }

    pub fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_size(&value)?;
        self.state.values.insert(key.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    /// Adds `step` to an integer value (missing keys count as zero).
    pub fn inc(&mut self, key: &str, step: i64) -> Result<i64> {
        let current = match self.get(key) {
            Some(bytes) => decode_i64(bytes)?,
            None => 0,
        };
        let next = current + step;
        self.set(key, next.to_string().into_bytes())?;
        Ok(next)
    }

    pub fn get_i64(&self, key: &str) -> Result<i64> {
        match self.get(key) {
            Some(bytes) => decode_i64(bytes),
            None => Ok(0),
        }
    }

    pub fn list_push(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_size(&value)?;
        self.state
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value);
        self.dirty = true;
        Ok(())
    }

    pub fn list_pop_front(&mut self, key: &str) -> Option<Vec<u8>> {
        let popped = self.state.lists.get_mut(key).and_then(|l| l.pop_front());
        if popped.is_some() {
            self.dirty = true;
        }
        popped
    }

    pub fn list_index(&self, key: &str, index: usize) -> Option<&[u8]> {
        self.state
            .lists
            .get(key)
            .and_then(|l| l.get(index))
            .map(|v| v.as_slice())
    }

    pub fn list_set(&mut self, key: &str, index: usize, value: Vec<u8>) -> Result<()> {
        self.check_size(&value)?;
        let slot = self
            .state
            .lists
            .get_mut(key)
            .and_then(|l| l.get_mut(index))
            .ok_or_else(|| DdlError::Internal(format!("list {} has no index {}", key, index)))?;
        *slot = value;
        self.dirty = true;
        Ok(())
    }

    pub fn list_len(&self, key: &str) -> usize {
        self.state.lists.get(key).map(|l| l.len()).unwrap_or(0)
    }

    pub fn list_all(&self, key: &str) -> Vec<&[u8]> {
        self.state
            .lists
            .get(key)
            .map(|l| l.iter().map(|v| v.as_slice()).collect())
            .unwrap_or_default()
    }

    pub fn hash_get(&self, key: &str, field: i64) -> Option<&[u8]> {
        self.state
            .hashes
            .get(key)
            .and_then(|h| h.get(&field))
            .map(|v| v.as_slice())
    }

    pub fn hash_set(&mut self, key: &str, field: i64, value: Vec<u8>) -> Result<()> {
        self.check_size(&value)?;
        self.state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field, value);
        self.dirty = true;
        Ok(())
    }

    pub fn hash_len(&self, key: &str) -> usize {
        self.state.hashes.get(key).map(|h| h.len()).unwrap_or(0)
    }

    /// Entries in descending field order.
    pub fn hash_rev(&self, key: &str) -> Vec<(i64, &[u8])> {
        self.state
            .hashes
            .get(key)
            .map(|h| h.iter().rev().map(|(k, v)| (*k, v.as_slice())).collect())
            .unwrap_or_default()
    }
}

fn decode_i64(bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| DdlError::Codec("stored value is not an integer".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn committed_writes_are_visible() {
        let store = MemStore::new();
        store
            .run_in_txn(false, |txn| txn.set("k", b"v".to_vec()))
            .unwrap();
        let txn = store.begin();
        assert_eq!(txn.get("k"), Some(&b"v"[..]));
    }

    #[test]
    fn failed_closure_discards_writes() {
        let store = MemStore::new();
        let res: Result<()> = store.run_in_txn(false, |txn| {
            txn.set("k", b"v".to_vec())?;
            Err(DdlError::Internal("boom".to_string()))
        });
        assert!(res.is_err());
        assert!(store.begin().get("k").is_none());
    }

    #[test]
    fn concurrent_writers_conflict() {
        let store = MemStore::new();
        let mut a = store.begin();
        let mut b = store.begin();
        a.set("x", b"1".to_vec()).unwrap();
        b.set("y", b"2".to_vec()).unwrap();
        store.commit(a).unwrap();
        assert_eq!(store.commit(b), Err(DdlError::TxnConflict));
    }

    #[test]
    fn read_only_txn_never_conflicts() {
        let store = MemStore::new();
        let reader = store.begin();
        store
            .run_in_txn(false, |txn| txn.set("x", b"1".to_vec()))
            .unwrap();
        assert!(store.commit(reader).is_ok());
    }

    #[test]
    fn retryable_txn_reruns_on_conflict() {
        let store = MemStore::new();
        let mut runs = 0;
        let value = store
            .run_in_txn(true, |txn| {
                runs += 1;
                if runs == 1 {
                    // Sneak in a concurrent commit.
                    store.run_in_txn(false, |other| other.inc("counter", 1))?;
                }
                txn.inc("counter", 1)
            })
            .unwrap();
        assert_eq!(runs, 2);
        assert_eq!(value, 2);
    }

    #[test]
    fn oversized_entry_rejected() {
        let store = MemStore::with_limits(8, 0);
        let res = store.run_in_txn(false, |txn| txn.list_push("q", vec![0u8; 9]));
        assert_eq!(res, Err(DdlError::EntryTooLarge { size: 9, limit: 8 }));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let store = MemStore::new();
        let mut last = 0;
        for _ in 0..1000 {
            let ts = store.next_ts();
            assert!(ts > last);
            last = ts;
        }
    }

    #[test]
    fn list_operations() {
        let store = MemStore::new();
        store
            .run_in_txn(false, |txn| {
                txn.list_push("q", b"a".to_vec())?;
                txn.list_push("q", b"b".to_vec())?;
                txn.list_set("q", 1, b"c".to_vec())?;
                Ok(())
            })
            .unwrap();
        let mut txn = store.begin();
        assert_eq!(txn.list_len("q"), 2);
        assert_eq!(txn.list_index("q", 1), Some(&b"c"[..]));
        assert_eq!(txn.list_pop_front("q"), Some(b"a".to_vec()));
        assert_eq!(txn.list_all("q"), vec![&b"c"[..]]);
        assert!(txn.list_set("q", 5, b"z".to_vec()).is_err());
    }
}
