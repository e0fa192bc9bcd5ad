use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::owner::OwnerManager;

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// A single contended key standing in for an external coordination service.
#[derive(Debug, Default)]
pub struct ElectionKey {
    lease: Mutex<Option<Lease>>,
}

impl ElectionKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants or renews the lease for `id` if the key is free, expired, or
    /// already held by `id`.
    pub fn try_acquire(&self, id: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut lease = self.lease.lock();
        let available = match lease.as_ref() {
            None => true,
            Some(l) => l.holder == id || l.expires_at <= now,
        };
        if available {
            *lease = Some(Lease {
                holder: id.to_string(),
                expires_at: now + ttl,
            });
        }
        available
    }

    /// Releases the key if `id` holds it.
    pub fn resign(&self, id: &str) {
        let mut lease = self.lease.lock();
        if lease.as_ref().map(|l| l.holder == id).unwrap_or(false) {
            *lease = None;
        }
    }

    /// Current unexpired holder.
    pub fn holder(&self) -> Option<String> {
        let lease = self.lease.lock();
        lease
            .as_ref()
            .filter(|l| l.expires_at > Instant::now())
            .map(|l| l.holder.clone())
    }
}

/// Lease-based owner campaign over a shared [`ElectionKey`].
///
/// Ownership is only reported while the lease is unexpired, so a process
/// that stops renewing (stalled, partitioned) stops acting as owner by
/// itself once the TTL passes.
#[derive(Debug)]
pub struct MemElection {
    id: String,
    key: Arc<ElectionKey>,
    ttl: Duration,
}

impl MemElection {
    pub fn new(id: impl Into<String>, key: Arc<ElectionKey>, ttl: Duration) -> Self {
        Self {
            id: id.into(),
            key,
            ttl,
        }
    }

    /// Renews (or tries to take) the lease once.
    pub fn campaign_once(&self) -> bool {
        self.key.try_acquire(&self.id, self.ttl)
    }

    pub fn resign(&self) {
        self.key.resign(&self.id);
        tracing::info!(owner_id = %self.id, "Resigned DDL ownership");
    }

    /// Campaigns until `shutdown` fires, renewing roughly every third of the
    /// TTL with random jitter so competing campaigners do not collide.
    pub async fn campaign(self: Arc<Self>, shutdown: CancellationToken) {
        let mut was_owner = false;
        loop {
            let is_owner = self.campaign_once();
            if is_owner != was_owner {
                if is_owner {
                    tracing::info!(owner_id = %self.id, "Became DDL owner");
                } else {
                    tracing::info!(owner_id = %self.id, "Lost DDL ownership");
                }
                was_owner = is_owner;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(renew_interval(self.ttl)) => {}
            }
        }
        if was_owner {
            self.resign();
        }
    }
}

impl OwnerManager for MemElection {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_owner(&self) -> bool {
        self.key.holder().as_deref() == Some(self.id.as_str())
    }
}

/// Random renewal delay in `[ttl/4, ttl/3]`.
fn renew_interval(ttl: Duration) -> Duration {
    let max_ms = (ttl.as_millis() / 3).max(1) as u64;
    let min_ms = (ttl.as_millis() / 4) as u64;
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms))
}
