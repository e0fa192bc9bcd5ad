use std::time::Duration;

/// Default upper bound on a single stored entry, matching typical KV txn limits.
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 6 * 1024 * 1024;

/// Upper bound on the worker's periodic check interval.
const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for a DDL scheduler instance.
#[derive(Debug, Clone)]
pub struct DdlConfig {
    /// Stable identity used when asking the election collaborator for ownership.
    pub owner_id: String,
    /// Schema lease. Other members reload schema at least once per lease.
    pub lease: Duration,
    /// Fixed delay before retrying a job whose handler returned an error.
    pub error_backoff: Duration,
    /// Largest encoded record the store accepts.
    pub max_entry_size: usize,
    /// How long a member heartbeat counts as "live" for version sync.
    pub member_ttl: Duration,
    /// Retries for transactions submitted with `retryable = true`.
    pub txn_max_retries: usize,
}

impl Default for DdlConfig {
    fn default() -> Self {
        Self {
            owner_id: uuid::Uuid::new_v4().to_string(),
            lease: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            member_ttl: Duration::from_secs(4),
            txn_max_retries: 10,
        }
    }
}

impl DdlConfig {
    pub fn new(owner_id: impl Into<String>, lease: Duration) -> Self {
        Self {
            owner_id: owner_id.into(),
            lease,
            member_ttl: lease * 4,
            ..Default::default()
        }
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_max_entry_size(mut self, size: usize) -> Self {
        self.max_entry_size = size;
        self
    }

    pub fn with_member_ttl(mut self, ttl: Duration) -> Self {
        self.member_ttl = ttl;
        self
    }

    /// Period of the worker's backstop timer: `2 * lease`, capped at 1s.
    /// A zero lease falls back to the cap.
    pub fn check_interval(&self) -> Duration {
        choose_lease_time(self.lease * 2, MAX_CHECK_INTERVAL)
    }

    /// Bound on a single version synchronization wait.
    pub fn wait_time(&self) -> Duration {
        self.lease * 2
    }
}

fn choose_lease_time(t: Duration, max: Duration) -> Duration {
    if t.is_zero() || t > max {
        max
    } else {
        t
    }
}
