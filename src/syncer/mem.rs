use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::syncer::SchemaSyncer;

/// Re-evaluation period while waiting, so members whose heartbeat expires
/// mid-wait drop out of the live set.
const RECHECK_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy)]
struct MemberState {
    version: i64,
    last_seen: Instant,
}

/// In-process schema version coordinator.
///
/// Members advertise the version they have loaded through [`heartbeat`];
/// a member counts as live while its last heartbeat is within `member_ttl`.
///
/// [`heartbeat`]: MemSchemaSyncer::heartbeat
#[derive(Debug)]
pub struct MemSchemaSyncer {
    global: watch::Sender<i64>,
    members: Mutex<HashMap<String, MemberState>>,
    members_changed: watch::Sender<u64>,
    member_ttl: Duration,
}

impl MemSchemaSyncer {
    pub fn new(member_ttl: Duration) -> Self {
        let (global, _) = watch::channel(0);
        let (members_changed, _) = watch::channel(0);
        Self {
            global,
            members: Mutex::new(HashMap::new()),
            members_changed,
            member_ttl,
        }
    }

    /// Records that `member_id` has loaded `version`.
    pub fn heartbeat(&self, member_id: &str, version: i64) {
        {
            let mut members = self.members.lock();
            members.insert(
                member_id.to_string(),
                MemberState {
                    version,
                    last_seen: Instant::now(),
                },
            );
        }
        self.members_changed.send_modify(|gen| *gen += 1);
    }

    pub fn remove_member(&self, member_id: &str) {
        self.members.lock().remove(member_id);
        self.members_changed.send_modify(|gen| *gen += 1);
    }

    pub fn subscribe_global(&self) -> watch::Receiver<i64> {
        self.global.subscribe()
    }

    /// Live members and their loaded versions, sorted by ID.
    pub fn live_members(&self) -> Vec<(String, i64)> {
        let now = Instant::now();
        let members = self.members.lock();
        let mut live: Vec<(String, i64)> = members
            .iter()
            .filter(|(_, m)| now.duration_since(m.last_seen) < self.member_ttl)
            .map(|(id, m)| (id.clone(), m.version))
            .collect();
        live.sort();
        live
    }

    fn all_synced(&self, version: i64) -> bool {
        self.live_members().iter().all(|(_, v)| *v >= version)
    }
}

#[async_trait]
impl SchemaSyncer for MemSchemaSyncer {
    async fn global_version(&self) -> Result<i64> {
        Ok(*self.global.borrow())
    }

    async fn publish_global_version(&self, version: i64) -> Result<()> {
        self.global.send_if_modified(|current| {
            if version > *current {
                *current = version;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    async fn wait_all_acknowledge(&self, version: i64, deadline: Instant) -> Result<bool> {
        let mut changed = self.members_changed.subscribe();
        loop {
            if self.all_synced(version) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wake_at = deadline.min(now + RECHECK_INTERVAL);
            // Either a heartbeat arrived or it's time to re-check liveness.
            let _ = tokio::time::timeout_at(wake_at, changed.changed()).await;
        }
    }
}

/// Runs a simulated cluster member that reloads the schema whenever the
/// global version moves and heartbeats its loaded version every `interval`.
pub fn spawn_member(
    syncer: Arc<MemSchemaSyncer>,
    member_id: String,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut global = syncer.subscribe_global();
        let mut loaded = *global.borrow_and_update();
        syncer.heartbeat(&member_id, loaded);
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                res = global.changed() => {
                    if res.is_err() {
                        break;
                    }
                    loaded = *global.borrow_and_update();
                    tracing::debug!(member_id = %member_id, version = loaded, "Member loaded schema");
                    syncer.heartbeat(&member_id, loaded);
                }
                _ = ticker.tick() => {
                    syncer.heartbeat(&member_id, loaded);
                }
            }
        }
        syncer.remove_member(&member_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_members_means_synced() {
        let syncer = MemSchemaSyncer::new(Duration::from_secs(1));
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(syncer.wait_all_acknowledge(5, deadline).await.unwrap());
    }

    #[tokio::test]
    async fn lagging_member_times_out() {
        let syncer = MemSchemaSyncer::new(Duration::from_secs(10));
        syncer.heartbeat("m1", 1);
        let deadline = Instant::now() + Duration::from_millis(50);
        assert!(!syncer.wait_all_acknowledge(2, deadline).await.unwrap());
    }

    #[tokio::test]
    async fn heartbeat_completes_wait() {
        let syncer = Arc::new(MemSchemaSyncer::new(Duration::from_secs(10)));
        syncer.heartbeat("m1", 1);
        let acker = syncer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            acker.heartbeat("m1", 2);
        });
        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(syncer.wait_all_acknowledge(2, deadline).await.unwrap());
    }

    #[tokio::test]
    async fn expired_member_is_ignored() {
        let syncer = MemSchemaSyncer::new(Duration::from_millis(30));
        syncer.heartbeat("dead", 0);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(syncer.live_members().is_empty());
        let deadline = Instant::now() + Duration::from_millis(10);
        assert!(syncer.wait_all_acknowledge(3, deadline).await.unwrap());
    }

    #[tokio::test]
    async fn publish_is_monotonic() {
        let syncer = MemSchemaSyncer::new(Duration::from_secs(1));
        syncer.publish_global_version(4).await.unwrap();
        syncer.publish_global_version(2).await.unwrap();
        assert_eq!(syncer.global_version().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn spawned_member_follows_global_version() {
        let syncer = Arc::new(MemSchemaSyncer::new(Duration::from_secs(1)));
        let shutdown = CancellationToken::new();
        let handle = spawn_member(
            syncer.clone(),
            "m1".to_string(),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        syncer.publish_global_version(7).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(syncer.wait_all_acknowledge(7, deadline).await.unwrap());

        shutdown.cancel();
        handle.await.unwrap();
        assert!(syncer.live_members().is_empty());
    }
}
