use crate::enrichment::merge::{apply_update, MergeOutcome, MergePolicy, RecordUpdate};
use crate::error::{AppError, Result};
use crate::models::{ProfileRecord, QuarantineRecord};
use crate::state::{QuarantineLog, RecordFilter, RecordStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Db;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// Persistent record store and quarantine log using the Sled embedded database
#[derive(Clone)]
pub struct SledStore {
    db: Arc<Db>,
    records_tree: sled::Tree,
    quarantine_tree: sled::Tree,
}

impl SledStore {
    /// Open (or create) a store at the specified path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref();
        let db = sled::open(&path)
            .map_err(|e| AppError::Store(format!("Failed to open Sled database: {}", e)))?;

        let records_tree = db
            .open_tree("records")
            .map_err(|e| AppError::Store(format!("Failed to open records tree: {}", e)))?;

        let quarantine_tree = db
            .open_tree("quarantine")
            .map_err(|e| AppError::Store(format!("Failed to open quarantine tree: {}", e)))?;

        tracing::info!("Initialized Sled store at {:?}", path_str);

        Ok(Self {
            db: Arc::new(db),
            records_tree,
            quarantine_tree,
        })
    }

    fn serialize_record(record: &ProfileRecord) -> Result<Vec<u8>> {
        bincode::serialize(record)
            .map_err(|e| AppError::Serialization(format!("Failed to serialize record: {}", e)))
    }

    fn deserialize_record(bytes: &[u8]) -> Result<ProfileRecord> {
        bincode::deserialize(bytes)
            .map_err(|e| AppError::Serialization(format!("Failed to deserialize record: {}", e)))
    }

    fn serialize_entry(entry: &QuarantineRecord) -> Result<Vec<u8>> {
        bincode::serialize(entry).map_err(|e| {
            AppError::Serialization(format!("Failed to serialize quarantine entry: {}", e))
        })
    }

    fn deserialize_entry(bytes: &[u8]) -> Result<QuarantineRecord> {
        bincode::deserialize(bytes).map_err(|e| {
            AppError::Serialization(format!("Failed to deserialize quarantine entry: {}", e))
        })
    }

    fn key(id: &Uuid) -> Vec<u8> {
        id.as_bytes().to_vec()
    }

    /// Flush pending writes to disk
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| AppError::Store(format!("Failed to flush database: {}", e)))?;
        Ok(())
    }

    /// Get database size in bytes
    pub fn size_on_disk(&self) -> Result<u64> {
        self.db
            .size_on_disk()
            .map_err(|e| AppError::Store(format!("Failed to get database size: {}", e)))
    }

    fn update_entry<F>(&self, id: &Uuid, mutate: F) -> Result<()>
    where
        F: Fn(&mut QuarantineRecord),
    {
        let key = Self::key(id);
        let bytes = self
            .quarantine_tree
            .get(&key)
            .map_err(|e| AppError::Store(format!("Failed to read quarantine entry: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("Quarantine entry {} not found", id)))?;

        let mut entry = Self::deserialize_entry(&bytes)?;
        mutate(&mut entry);

        self.quarantine_tree
            .insert(key, Self::serialize_entry(&entry)?)
            .map_err(|e| AppError::Store(format!("Failed to update quarantine entry: {}", e)))?;
        Ok(())
    }

    fn scan_quarantine(&self) -> Result<Vec<QuarantineRecord>> {
        let mut entries = Vec::new();
        for result in self.quarantine_tree.iter() {
            let (_, value) = result
                .map_err(|e| AppError::Store(format!("Failed to iterate quarantine: {}", e)))?;
            entries.push(Self::deserialize_entry(&value)?);
        }
        entries.sort_by_key(|entry| (entry.quarantined_at, entry.id));
        Ok(entries)
    }
}

#[async_trait]
impl RecordStore for SledStore {
    async fn get_record(&self, id: &Uuid) -> Result<Option<ProfileRecord>> {
        match self.records_tree.get(Self::key(id)) {
            Ok(Some(bytes)) => Ok(Some(Self::deserialize_record(&bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(AppError::Store(format!("Failed to get record: {}", e))),
        }
    }

    async fn save_record(&self, record: &ProfileRecord) -> Result<()> {
        record.validate()?;
        let value = Self::serialize_record(record)?;

        self.records_tree
            .insert(Self::key(&record.id), value)
            .map_err(|e| AppError::Store(format!("Failed to save record: {}", e)))?;

        self.flush().await?;

        tracing::debug!(record_id = %record.id, "Record saved to Sled");
        Ok(())
    }

    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<ProfileRecord>> {
        let mut records = Vec::new();

        for result in self.records_tree.iter() {
            let (_, value) = result
                .map_err(|e| AppError::Store(format!("Failed to iterate records: {}", e)))?;

            let record = Self::deserialize_record(&value)?;
            if filter.matches(&record) {
                records.push(record);
            }
        }

        Ok(records)
    }

    async fn apply_updates(
        &self,
        updates: &[RecordUpdate],
        policy: &MergePolicy,
    ) -> Result<Vec<MergeOutcome>> {
        // Sled may re-run the closure on conflict, so it only reads its inputs
        let result = self.records_tree.transaction(|tx| {
            let mut outcomes = Vec::with_capacity(updates.len());

            for update in updates {
                let key = Self::key(&update.record_id);
                let bytes = tx.get(&key)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(AppError::NotFound(format!(
                        "Record {} not found",
                        update.record_id
                    )))
                })?;

                let mut record =
                    Self::deserialize_record(&bytes).map_err(ConflictableTransactionError::Abort)?;
                let outcome = apply_update(&mut record, update, policy);

                record.validate().map_err(|e| {
                    ConflictableTransactionError::Abort(AppError::Validation(format!(
                        "record {}: {}",
                        update.record_id, e
                    )))
                })?;

                let value =
                    Self::serialize_record(&record).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(key, value)?;
                outcomes.push(outcome);
            }

            Ok(outcomes)
        });

        match result {
            Ok(outcomes) => {
                self.flush().await?;
                Ok(outcomes)
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => {
                Err(AppError::Store(format!("Update transaction failed: {}", e)))
            }
        }
    }

    async fn count_records(&self) -> Result<u64> {
        Ok(self.records_tree.len() as u64)
    }
}

#[async_trait]
impl QuarantineLog for SledStore {
    async fn append(&self, entry: &QuarantineRecord) -> Result<()> {
        self.quarantine_tree
            .insert(Self::key(&entry.id), Self::serialize_entry(entry)?)
            .map_err(|e| AppError::Store(format!("Failed to append quarantine entry: {}", e)))?;
        self.flush().await
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<QuarantineRecord>> {
        let mut pending: Vec<QuarantineRecord> = self
            .scan_quarantine()?
            .into_iter()
            .filter(QuarantineRecord::is_pending)
            .collect();
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_all(&self) -> Result<Vec<QuarantineRecord>> {
        self.scan_quarantine()
    }

    async fn mark_resolved(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()> {
        self.update_entry(id, |entry| entry.resolved_at = Some(at))?;
        self.flush().await
    }

    async fn record_attempt(&self, id: &Uuid) -> Result<()> {
        self.update_entry(id, |entry| entry.retry_attempts += 1)?;
        self.flush().await
    }
}
