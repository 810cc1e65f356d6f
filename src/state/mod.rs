pub mod factory;
pub mod pool;
pub mod sled_store;
pub mod store;

pub use factory::{create_in_memory_store, create_store, StoreHandles};
pub use pool::{PooledStore, StorePool};
pub use sled_store::SledStore;
pub use store::*;

use crate::enrichment::merge::{MergeOutcome, MergePolicy, RecordUpdate};
use crate::error::Result;
use crate::models::{ProfileRecord, QuarantineRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Trait for profile record storage
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Get a record by ID
    async fn get_record(&self, id: &Uuid) -> Result<Option<ProfileRecord>>;

    /// Insert or replace a record (validated)
    async fn save_record(&self, record: &ProfileRecord) -> Result<()>;

    /// Scan records matching a filter
    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<ProfileRecord>>;

    /// Apply a group of updates as one all-or-nothing unit.
    ///
    /// The priority rule is evaluated against the stored record inside the
    /// unit, so concurrent writers cannot interleave a read and a write.
    /// Any missing or invalid record aborts the whole group.
    async fn apply_updates(
        &self,
        updates: &[RecordUpdate],
        policy: &MergePolicy,
    ) -> Result<Vec<MergeOutcome>>;

    /// Count stored records
    async fn count_records(&self) -> Result<u64>;
}

/// Append-only log of quarantined values
#[async_trait]
pub trait QuarantineLog: Send + Sync {
    /// Append one entry
    async fn append(&self, entry: &QuarantineRecord) -> Result<()>;

    /// Unresolved entries, oldest first
    async fn list_pending(&self, limit: usize) -> Result<Vec<QuarantineRecord>>;

    /// Every entry, oldest first
    async fn list_all(&self) -> Result<Vec<QuarantineRecord>>;

    /// Mark an entry resolved
    async fn mark_resolved(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Count one more adaptive retry attempt against an entry
    async fn record_attempt(&self, id: &Uuid) -> Result<()>;
}

/// Filter for scanning records
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Only records enriched strictly before this instant
    pub enriched_before: Option<DateTime<Utc>>,
    /// Only records never enriched, or enriched strictly before this instant
    pub not_enriched_since: Option<DateTime<Utc>>,
    /// Only these records (empty means all)
    pub ids: Vec<Uuid>,
}

impl RecordFilter {
    pub fn matches(&self, record: &ProfileRecord) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&record.id) {
            return false;
        }

        if let Some(cutoff) = self.enriched_before {
            match record.last_enriched_at {
                Some(at) if at < cutoff => {}
                _ => return false,
            }
        }

        if let Some(cutoff) = self.not_enriched_since {
            if matches!(record.last_enriched_at, Some(at) if at >= cutoff) {
                return false;
            }
        }

        true
    }
}
