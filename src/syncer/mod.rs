//! Schema version propagation.
//!
//! After a job produces a new schema version the owner publishes it and
//! then waits, bounded by `2 * lease`, until every live member reports
//! having loaded it. A timeout is not an error: members that fall behind
//! stop serving once their own lease goes stale.

mod mem;

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::Result;

pub use mem::{spawn_member, MemSchemaSyncer};

/// Coordination value shared by the owner and every member.
#[async_trait]
pub trait SchemaSyncer: Send + Sync {
    /// Latest published global schema version.
    async fn global_version(&self) -> Result<i64>;

    async fn publish_global_version(&self, version: i64) -> Result<()>;

    /// Waits until every live member acknowledged at least `version`.
    /// Returns `Ok(false)` when `deadline` passes first.
    async fn wait_all_acknowledge(&self, version: i64, deadline: Instant) -> Result<bool>;
}

/// Publishes `latest` and waits for the cluster to catch up, at most
/// `wait_time`. Returns whether full convergence was observed.
pub async fn wait_schema_changed(
    syncer: &dyn SchemaSyncer,
    wait_time: Duration,
    latest: i64,
) -> bool {
    if wait_time.is_zero() {
        return false;
    }
    if latest == 0 {
        tracing::debug!("Schema version unchanged, skipping sync wait");
        return true;
    }

    let start = Instant::now();
    let deadline = start + wait_time;
    if let Err(e) = syncer.publish_global_version(latest).await {
        tracing::warn!(version = latest, error = %e, "Failed to publish schema version");
    }

    match syncer.wait_all_acknowledge(latest, deadline).await {
        Ok(true) => {
            tracing::info!(
                version = latest,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "All members synced schema version"
            );
            true
        }
        Ok(false) => {
            tracing::warn!(
                version = latest,
                wait_ms = wait_time.as_millis() as u64,
                "Timed out waiting for schema version to sync"
            );
            false
        }
        Err(e) => {
            tracing::warn!(version = latest, error = %e, "Schema version check failed, waiting out lease");
            tokio::time::sleep_until(deadline).await;
            false
        }
    }
}

/// One-time wait run when a new owner resumes a job that may already have
/// changed the schema. The target is the newer of the published version and
/// `store_version`, never a value cached by an earlier owner.
pub async fn wait_schema_synced(
    syncer: &dyn SchemaSyncer,
    wait_time: Duration,
    store_version: i64,
) -> bool {
    let start = Instant::now();
    let published = match tokio::time::timeout(wait_time, syncer.global_version()).await {
        Ok(Ok(v)) => v,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to read global schema version");
            return false;
        }
        Err(_) => {
            tracing::warn!("Timed out reading global schema version");
            return false;
        }
    };
    let latest = published.max(store_version);
    let remaining = wait_time.saturating_sub(start.elapsed());
    let synced = wait_schema_changed(syncer, remaining, latest).await;
    tracing::info!(
        version = latest,
        synced,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Resynchronized schema version after ownership change"
    );
    synced
}
