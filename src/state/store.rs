use crate::enrichment::merge::{apply_update, MergeOutcome, MergePolicy, RecordUpdate};
use crate::error::{AppError, Result};
use crate::models::{ProfileRecord, QuarantineRecord};
use crate::state::{QuarantineLog, RecordFilter, RecordStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

/// In-memory record store and quarantine log (for development and testing)
#[derive(Clone)]
pub struct InMemoryStore {
    records: Arc<DashMap<Uuid, ProfileRecord>>,
    quarantine: Arc<DashMap<Uuid, QuarantineRecord>>,
    /// Serializes update groups so each group is one atomic unit
    write_lock: Arc<Mutex<()>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            quarantine: Arc::new(DashMap::new()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get_record(&self, id: &Uuid) -> Result<Option<ProfileRecord>> {
        Ok(self.records.get(id).map(|entry| entry.clone()))
    }

    async fn save_record(&self, record: &ProfileRecord) -> Result<()> {
        record.validate()?;
        let _guard = self.write_lock.lock();
        self.records.insert(record.id, record.clone());
        tracing::debug!(record_id = %record.id, "Record saved");
        Ok(())
    }

    async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<ProfileRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn apply_updates(
        &self,
        updates: &[RecordUpdate],
        policy: &MergePolicy,
    ) -> Result<Vec<MergeOutcome>> {
        let _guard = self.write_lock.lock();

        // Stage every merged record first; commit only if all of them are valid
        let mut staged = Vec::with_capacity(updates.len());
        let mut outcomes = Vec::with_capacity(updates.len());
        for update in updates {
            let mut record = self
                .records
                .get(&update.record_id)
                .map(|entry| entry.clone())
                .ok_or_else(|| {
                    AppError::NotFound(format!("Record {} not found", update.record_id))
                })?;

            let outcome = apply_update(&mut record, update, policy);
            record.validate().map_err(|e| {
                AppError::Validation(format!("record {}: {}", update.record_id, e))
            })?;

            staged.push(record);
            outcomes.push(outcome);
        }

        for record in staged {
            self.records.insert(record.id, record);
        }

        Ok(outcomes)
    }

    async fn count_records(&self) -> Result<u64> {
        Ok(self.records.len() as u64)
    }
}

#[async_trait]
impl QuarantineLog for InMemoryStore {
    async fn append(&self, entry: &QuarantineRecord) -> Result<()> {
        self.quarantine.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<QuarantineRecord>> {
        let mut pending: Vec<QuarantineRecord> = self
            .quarantine
            .iter()
            .filter(|entry| entry.is_pending())
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by_key(|entry| (entry.quarantined_at, entry.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn list_all(&self) -> Result<Vec<QuarantineRecord>> {
        let mut all: Vec<QuarantineRecord> = self
            .quarantine
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|entry| (entry.quarantined_at, entry.id));
        Ok(all)
    }

    async fn mark_resolved(&self, id: &Uuid, at: DateTime<Utc>) -> Result<()> {
        match self.quarantine.get_mut(id) {
            Some(mut entry) => {
                entry.resolved_at = Some(at);
                Ok(())
            }
            None => Err(AppError::NotFound(format!(
                "Quarantine entry {} not found",
                id
            ))),
        }
    }

    async fn record_attempt(&self, id: &Uuid) -> Result<()> {
        match self.quarantine.get_mut(id) {
            Some(mut entry) => {
                entry.retry_attempts += 1;
                Ok(())
            }
            None => Err(AppError::NotFound(format!(
                "Quarantine entry {} not found",
                id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfidenceConfig;
    use crate::enrichment::confidence::ConfidenceScorer;
    use crate::enrichment::merge::FieldWrite;
    use crate::models::{
        DiscoveredField, EnrichableField, ExtractionMethod, FieldValue, Source, SourcePriority,
        Stage,
    };
    use chrono::Duration;

    fn policy() -> MergePolicy {
        MergePolicy {
            priority: SourcePriority::default(),
            staleness_horizon: Duration::days(90),
            scorer: ConfidenceScorer::new(ConfidenceConfig::default(), SourcePriority::default()),
        }
    }

    fn niche_update(id: Uuid, niche: &str) -> RecordUpdate {
        RecordUpdate {
            record_id: id,
            writes: vec![FieldWrite {
                field: EnrichableField::Niche,
                value: FieldValue::text(niche),
                source: Source::SemanticResearch,
                extracted_at: Utc::now(),
                confidence_multiplier: 1.0,
            }],
            fill_only: false,
            tier: None,
            pipeline_version: 3,
            written_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let store = InMemoryStore::new();
        let record = ProfileRecord::new("Jane");

        store.save_record(&record).await.unwrap();

        let fetched = store.get_record(&record.id).await.unwrap();
        assert_eq!(fetched, Some(record));
        assert_eq!(store.count_records().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_save_rejects_invalid_record() {
        let store = InMemoryStore::new();
        let record = ProfileRecord::new("Jane").with_email("nope");
        assert!(store.save_record(&record).await.is_err());
    }

    #[tokio::test]
    async fn test_group_is_all_or_nothing() {
        let store = InMemoryStore::new();
        let a = ProfileRecord::new("A");
        let b = ProfileRecord::new("B");
        store.save_record(&a).await.unwrap();
        store.save_record(&b).await.unwrap();

        let updates = vec![niche_update(a.id, "Coaching"), niche_update(b.id, &"x".repeat(300))];
        assert!(store.apply_updates(&updates, &policy()).await.is_err());

        let a_after = store.get_record(&a.id).await.unwrap().unwrap();
        assert!(a_after.niche.is_none());
    }

    #[tokio::test]
    async fn test_missing_record_aborts_group() {
        let store = InMemoryStore::new();
        let err = store
            .apply_updates(&[niche_update(Uuid::new_v4(), "Coaching")], &policy())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_quarantine_log() {
        let store = InMemoryStore::new();
        let discovered = DiscoveredField {
            field: EnrichableField::Email,
            value: FieldValue::text("john@example.com"),
            source: Source::DeepResearch,
            provider: "deep".to_string(),
            stage: Stage::DeepFallback,
            extraction: ExtractionMethod::FreeText,
            discovered_at: Utc::now(),
        };
        let entry = QuarantineRecord::new(Uuid::new_v4(), &discovered, "placeholder".to_string());

        store.append(&entry).await.unwrap();
        assert_eq!(store.list_pending(10).await.unwrap().len(), 1);

        store.record_attempt(&entry.id).await.unwrap();
        store.mark_resolved(&entry.id, Utc::now()).await.unwrap();

        assert!(store.list_pending(10).await.unwrap().is_empty());
        let all = store.list_all().await.unwrap();
        assert_eq!(all[0].retry_attempts, 1);
    }
}
