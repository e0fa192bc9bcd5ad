//! Ownership gate for the DDL worker.
//!
//! The scheduler never elects anyone itself. It asks an [`OwnerManager`]
//! whether this process currently holds ownership, inside every worker
//! transaction, and stops as soon as the answer is no.
//!
//! Two implementations ship with the crate:
//! - [`StaticOwner`]: ownership flipped by hand, for tests and single-node use
//! - [`MemElection`]: lease-based campaign over a shared [`ElectionKey`]

mod election;

use std::sync::atomic::{AtomicBool, Ordering};

pub use election::{ElectionKey, MemElection};

/// Answers whether this process may dispatch DDL jobs.
pub trait OwnerManager: Send + Sync {
    /// Stable process identity used as the election key.
    fn id(&self) -> &str;

    fn is_owner(&self) -> bool;
}

/// Ownership set explicitly by the caller.
#[derive(Debug)]
pub struct StaticOwner {
    id: String,
    owner: AtomicBool,
}

impl StaticOwner {
    pub fn new(id: impl Into<String>, is_owner: bool) -> Self {
        Self {
            id: id.into(),
            owner: AtomicBool::new(is_owner),
        }
    }

    pub fn set_owner(&self, is_owner: bool) {
        let was = self.owner.swap(is_owner, Ordering::SeqCst);
        if was != is_owner {
            tracing::info!(owner_id = %self.id, is_owner, "Ownership changed");
        }
    }
}

impl OwnerManager for StaticOwner {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_owner(&self) -> bool {
        let is_owner = self.owner.load(Ordering::SeqCst);
        tracing::trace!(owner_id = %self.id, is_owner, "Checked DDL ownership");
        is_owner
    }
}
