//! Age-based pruning of stored samples

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::config::RetentionConfig;
pub use crate::config::RetentionPolicy;
use crate::db::Store;
use crate::error::{Error, Result};
use crate::types::format_timestamp;

/// Outcome of a pruning pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub cutoff: String,
    pub deleted: usize,
    pub policy: RetentionPolicy,
}

/// `now` minus `days`, or a config error when that leaves chrono's range.
pub fn days_before(now: DateTime<Utc>, days: u32) -> Result<DateTime<Utc>> {
    now.checked_sub_signed(Duration::days(i64::from(days)))
        .ok_or_else(|| Error::Config(format!("retention window of {} days is out of range", days)))
}

/// Deletes samples captured before a cutoff, honoring the retention policy.
pub struct Pruner {
    store: Arc<Store>,
    config: RetentionConfig,
}

impl Pruner {
    pub fn new(store: Arc<Store>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.config.policy
    }

    /// Cutoff for rows that have outlived the retention window at `now`.
    pub fn cutoff_for(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        days_before(now, self.config.days)
    }

    /// Delete rows captured strictly before `cutoff` (a stored timestamp
    /// string, compared lexicographically). Returns the number deleted.
    pub fn prune_older_than(&self, cutoff: &str) -> Result<usize> {
        let deleted = match self.config.policy {
            RetentionPolicy::All => self.store.prune_older_than(cutoff)?,
            RetentionPolicy::DeliveredOnly => self.store.prune_delivered_older_than(cutoff)?,
        };

        if deleted > 0 {
            tracing::info!(deleted, cutoff, policy = ?self.config.policy, "Pruned expired samples");
        } else {
            tracing::debug!(cutoff, "Nothing to prune");
        }
        Ok(deleted)
    }

    /// Prune everything past the configured retention window.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        let cutoff = format_timestamp(self.cutoff_for(now)?);
        let deleted = self.prune_older_than(&cutoff)?;
        Ok(PruneReport {
            cutoff,
            deleted,
            policy: self.config.policy,
        })
    }
}
