use crate::enrichment::gate::{GateVerdict, VerificationGate};
use crate::enrichment::merge::{FieldWrite, MergeOutcome, MergePolicy, RecordUpdate, UpdateShape};
use crate::error::Result;
use crate::metrics::{
    FIELDS_QUARANTINED_TOTAL, FIELDS_REJECTED_TOTAL, FIELDS_WRITTEN_TOTAL,
    PERSISTENCE_FAILURES_TOTAL,
};
use crate::models::{
    DiscoveredField, EnrichableField, EnrichmentOutcome, EnrichmentResult, FieldKind, FieldValue,
    QuarantineRecord,
};
use crate::state::{QuarantineLog, StorePool};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Totals for one consolidation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceReport {
    /// Records whose update committed
    pub records_updated: u64,
    pub fields_written: u64,
    pub fields_rejected: u64,
    pub fields_quarantined: u64,
    /// Records whose update could not be written even on its own
    pub failed_records: Vec<Uuid>,
    /// Groups that had to fall back to per-record writes
    pub groups_split: u64,
    pub outcomes: Vec<MergeOutcome>,
}

impl PersistenceReport {
    fn absorb(&mut self, outcomes: Vec<MergeOutcome>) {
        for outcome in outcomes {
            self.records_updated += 1;
            self.fields_written += outcome.written.len() as u64;
            self.fields_rejected += outcome.rejected.len() as u64;

            for field in &outcome.written {
                FIELDS_WRITTEN_TOTAL
                    .with_label_values(&[field.as_ref()])
                    .inc();
            }
            for (_, reason) in &outcome.rejected {
                FIELDS_REJECTED_TOTAL
                    .with_label_values(&[reason.label()])
                    .inc();
            }
            self.outcomes.push(outcome);
        }
    }
}

/// Gates cascade output and writes it back in batches
pub struct Persister {
    pool: StorePool,
    quarantine: Arc<dyn QuarantineLog>,
    gate: VerificationGate,
    policy: MergePolicy,
    pipeline_version: u32,
}

impl Persister {
    pub fn new(
        pool: StorePool,
        quarantine: Arc<dyn QuarantineLog>,
        gate: VerificationGate,
        policy: MergePolicy,
        pipeline_version: u32,
    ) -> Self {
        Self {
            pool,
            quarantine,
            gate,
            policy,
            pipeline_version,
        }
    }

    pub fn gate(&self) -> &VerificationGate {
        &self.gate
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    /// Split a result into the update to write and the values to quarantine.
    ///
    /// Failed results produce no update so the record stays selectable.
    pub fn prepare(
        &self,
        result: &EnrichmentResult,
    ) -> (Option<RecordUpdate>, Vec<QuarantineRecord>) {
        if result.outcome == EnrichmentOutcome::Failed {
            return (None, Vec::new());
        }

        let mut passed: BTreeMap<EnrichableField, Vec<(&DiscoveredField, GateVerdict)>> =
            BTreeMap::new();
        let mut quarantined = Vec::new();

        for discovered in &result.fields {
            let verdict = self.gate.evaluate(discovered);
            if verdict.is_quarantined() {
                debug!(
                    record_id = %result.record_id,
                    field = %discovered.field,
                    reason = %verdict.failure_reason(),
                    "Value quarantined"
                );
                quarantined.push(QuarantineRecord::new(
                    result.record_id,
                    discovered,
                    verdict.failure_reason(),
                ));
                continue;
            }
            passed
                .entry(discovered.field)
                .or_default()
                .push((discovered, verdict));
        }

        let writes = passed
            .into_iter()
            .filter_map(|(field, candidates)| self.pick(field, &candidates))
            .collect();

        let update = RecordUpdate {
            record_id: result.record_id,
            writes,
            fill_only: result.fill_only,
            tier: result.tier,
            pipeline_version: self.pipeline_version,
            written_at: result.completed_at,
        };

        (Some(update), quarantined)
    }

    /// Reduce every verified candidate for one field to a single write.
    ///
    /// The candidate from the highest-ranked source wins, then the most
    /// trusted extraction, then the earliest stage. Audience counts prefer the
    /// largest number. Partnership lists combine every candidate's entries.
    fn pick(
        &self,
        field: EnrichableField,
        candidates: &[(&DiscoveredField, GateVerdict)],
    ) -> Option<FieldWrite> {
        let priority = &self.policy.priority;
        let standing = |(discovered, _): &&(&DiscoveredField, GateVerdict)| {
            (priority.rank(discovered.source), discovered.extraction.trust())
        };

        // `rev` so that ties go to the earliest candidate
        let (discovered, verdict) = match field.kind() {
            FieldKind::Audience => candidates.iter().rev().max_by_key(|candidate| {
                let count = match candidate.1.value {
                    FieldValue::Count(n) => n,
                    _ => 0,
                };
                (count, standing(candidate))
            }),
            _ => candidates.iter().rev().max_by_key(standing),
        }?;

        let value = match field.kind() {
            FieldKind::List => FieldValue::Partnerships(
                candidates
                    .iter()
                    .flat_map(|(_, v)| match &v.value {
                        FieldValue::Partnerships(entries) => entries.clone(),
                        _ => Vec::new(),
                    })
                    .collect(),
            ),
            _ => verdict.value.clone(),
        };

        Some(FieldWrite {
            field,
            value,
            source: discovered.source,
            extracted_at: discovered.discovered_at,
            confidence_multiplier: verdict.confidence_multiplier,
        })
    }

    /// `Consolidate(results)`: gate, quarantine, then write grouped by shape.
    pub async fn consolidate(&self, results: &[EnrichmentResult]) -> Result<PersistenceReport> {
        let mut updates = Vec::with_capacity(results.len());
        let mut quarantined = Vec::new();

        for result in results {
            let (update, held) = self.prepare(result);
            quarantined.extend(held);
            if let Some(update) = update {
                updates.push(update);
            }
        }

        self.write(updates, quarantined).await
    }

    /// Append quarantine entries, then apply updates grouped by shape.
    ///
    /// A group that fails is retried one record at a time, so one bad record
    /// only loses its own update. Fatal store errors are returned.
    pub async fn write(
        &self,
        updates: Vec<RecordUpdate>,
        quarantined: Vec<QuarantineRecord>,
    ) -> Result<PersistenceReport> {
        let mut report = PersistenceReport::default();

        for entry in quarantined {
            self.quarantine.append(&entry).await?;
            FIELDS_QUARANTINED_TOTAL
                .with_label_values(&[entry.field.as_ref()])
                .inc();
            report.fields_quarantined += 1;
        }

        let mut groups: BTreeMap<UpdateShape, Vec<RecordUpdate>> = BTreeMap::new();
        for update in updates {
            groups.entry(update.shape()).or_default().push(update);
        }

        for (shape, group) in groups {
            self.write_group(&shape, &group, &mut report).await?;
        }

        info!(
            records = report.records_updated,
            written = report.fields_written,
            rejected = report.fields_rejected,
            quarantined = report.fields_quarantined,
            failed = report.failed_records.len(),
            "Consolidated enrichment results"
        );

        Ok(report)
    }

    async fn write_group(
        &self,
        shape: &UpdateShape,
        group: &[RecordUpdate],
        report: &mut PersistenceReport,
    ) -> Result<()> {
        let attempt = {
            let store = self.pool.acquire().await?;
            store.apply_updates(group, &self.policy).await
        };

        let err = match attempt {
            Ok(outcomes) => {
                report.absorb(outcomes);
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => e,
        };

        warn!(
            size = group.len(),
            fields = ?shape.fields,
            fill_only = shape.fill_only,
            error = %err,
            "Group write failed, retrying records individually"
        );
        report.groups_split += 1;

        for update in group {
            let single = {
                let store = self.pool.acquire().await?;
                store
                    .apply_updates(std::slice::from_ref(update), &self.policy)
                    .await
            };

            match single {
                Ok(outcomes) => report.absorb(outcomes),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(record_id = %update.record_id, error = %e, "Record update failed");
                    PERSISTENCE_FAILURES_TOTAL.inc();
                    report.failed_records.push(update.record_id);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfidenceConfig, GateConfig};
    use crate::enrichment::confidence::ConfidenceScorer;
    use crate::models::{
        DiscoveredField, EnrichableField, ExtractionMethod, FieldValue, PartnershipEntry,
        ProfileRecord, Source, SourcePriority, Stage, Tier,
    };
    use crate::state::{InMemoryStore, RecordStore};
    use chrono::{Duration, Utc};

    fn persister(store: Arc<InMemoryStore>) -> Persister {
        persister_with(store, SourcePriority::default())
    }

    fn persister_with(store: Arc<InMemoryStore>, priority: SourcePriority) -> Persister {
        Persister::new(
            StorePool::new(store.clone(), 4),
            store,
            VerificationGate::new(GateConfig::default()),
            MergePolicy {
                priority: priority.clone(),
                staleness_horizon: Duration::days(90),
                scorer: ConfidenceScorer::new(ConfidenceConfig::default(), priority),
            },
            3,
        )
    }

    fn found(record_id: Uuid, fields: Vec<(EnrichableField, &str, ExtractionMethod)>) -> EnrichmentResult {
        let mut result = EnrichmentResult::new(record_id, false, false);
        result.tier = Some(Tier::Tier3);
        for (field, value, extraction) in fields {
            result.add_field(DiscoveredField {
                field,
                value: FieldValue::text(value),
                source: Source::SemanticResearch,
                provider: "semantic".to_string(),
                stage: Stage::Primary,
                extraction,
                discovered_at: Utc::now(),
            });
        }
        result.finish()
    }

    async fn seed(store: &InMemoryStore, name: &str) -> Uuid {
        let record = ProfileRecord::new(name);
        store.save_record(&record).await.unwrap();
        record.id
    }

    #[tokio::test]
    async fn test_quarantined_values_never_reach_the_record() {
        let store = Arc::new(InMemoryStore::new());
        let id = seed(&store, "Jane").await;
        let persister = persister(store.clone());

        let result = found(
            id,
            vec![
                (EnrichableField::Email, "info@example.com", ExtractionMethod::ProviderVerified),
                (EnrichableField::Niche, "Leadership coaching", ExtractionMethod::Structured),
            ],
        );
        let report = persister.consolidate(&[result]).await.unwrap();

        assert_eq!(report.fields_quarantined, 1);
        assert_eq!(report.fields_written, 1);

        let record = store.get_record(&id).await.unwrap().unwrap();
        assert!(record.email.is_none());
        assert_eq!(record.niche.as_deref(), Some("Leadership coaching"));

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].field, EnrichableField::Email);
        assert_eq!(pending[0].provider, "semantic");
    }

    #[tokio::test]
    async fn test_bad_record_does_not_sink_its_group() {
        let store = Arc::new(InMemoryStore::new());
        let persister = persister(store.clone());

        let mut updates = Vec::new();
        let mut ids = Vec::new();
        for i in 0..10 {
            let id = seed(&store, &format!("Person {}", i)).await;
            let niche = format!("Niche {}", i);
            let result = found(
                id,
                vec![(EnrichableField::Niche, niche.as_str(), ExtractionMethod::Structured)],
            );
            let mut update = persister.prepare(&result).0.unwrap();
            if i == 4 {
                // Bypasses the gate, so only the store's validation catches it
                update.writes[0].value = FieldValue::text("x".repeat(300));
            }
            updates.push(update);
            ids.push(id);
        }

        let report = persister.write(updates, Vec::new()).await.unwrap();

        assert_eq!(report.groups_split, 1);
        assert_eq!(report.records_updated, 9);
        assert_eq!(report.failed_records, vec![ids[4]]);

        for (i, id) in ids.iter().enumerate() {
            let record = store.get_record(id).await.unwrap().unwrap();
            if i == 4 {
                assert!(record.niche.is_none());
                assert!(record.last_enriched_at.is_none());
            } else {
                assert_eq!(record.niche, Some(format!("Niche {}", i)));
            }
        }
    }

    #[tokio::test]
    async fn test_oversized_value_is_quarantined_and_siblings_merge() {
        let store = Arc::new(InMemoryStore::new());
        let id = seed(&store, "Jane").await;
        let persister = persister(store.clone());

        let niche = "n".repeat(300);
        let result = found(
            id,
            vec![
                (EnrichableField::Email, "jane@acme.io", ExtractionMethod::ProviderVerified),
                (EnrichableField::Niche, niche.as_str(), ExtractionMethod::Structured),
            ],
        );
        let report = persister.consolidate(&[result.clone()]).await.unwrap();

        assert_eq!(report.fields_quarantined, 1);
        assert_eq!(report.fields_written, 1);
        assert!(report.failed_records.is_empty());
        assert_eq!(report.groups_split, 0);

        let record = store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(record.email.as_deref(), Some("jane@acme.io"));
        assert!(record.niche.is_none());
        assert_eq!(record.last_enriched_at, Some(result.completed_at));

        let pending = store.list_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].field, EnrichableField::Niche);
    }

    fn candidate(
        field: EnrichableField,
        value: FieldValue,
        source: Source,
        provider: &str,
        stage: Stage,
        extraction: ExtractionMethod,
    ) -> DiscoveredField {
        DiscoveredField {
            field,
            value,
            source,
            provider: provider.to_string(),
            stage,
            extraction,
            discovered_at: Utc::now(),
        }
    }

    fn competing_emails(record_id: Uuid) -> EnrichmentResult {
        let mut result = EnrichmentResult::new(record_id, false, false);
        result.add_field(candidate(
            EnrichableField::Email,
            FieldValue::text("guess@acme.io"),
            Source::SemanticResearch,
            "semantic",
            Stage::Primary,
            ExtractionMethod::FreeText,
        ));
        result.add_field(candidate(
            EnrichableField::Email,
            FieldValue::text("verified@acme.io"),
            Source::DirectoryApi,
            "directory",
            Stage::ContactGap,
            ExtractionMethod::ProviderVerified,
        ));
        result.finish()
    }

    #[test]
    fn test_higher_ranked_candidate_wins_within_a_result() {
        let store = Arc::new(InMemoryStore::new());
        let id = Uuid::new_v4();

        let ranked = persister_with(
            store.clone(),
            SourcePriority::default().with_rank(Source::DirectoryApi, 80),
        );
        let (update, _) = ranked.prepare(&competing_emails(id));
        let writes = update.unwrap().writes;
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value, FieldValue::text("verified@acme.io"));
        assert_eq!(writes[0].source, Source::DirectoryApi);

        // Default ranks put semantic research above the directory
        let (update, _) = persister(store).prepare(&competing_emails(id));
        let writes = update.unwrap().writes;
        assert_eq!(writes[0].value, FieldValue::text("guess@acme.io"));
        assert_eq!(writes[0].source, Source::SemanticResearch);
    }

    #[test]
    fn test_candidate_choice_per_field_kind() {
        let store = Arc::new(InMemoryStore::new());
        let persister = persister(store);
        let id = Uuid::new_v4();

        let mut result = EnrichmentResult::new(id, false, false);
        // Same source: the verified value beats the earlier free-text one
        result.add_field(candidate(
            EnrichableField::Niche,
            FieldValue::text("Coaching-ish"),
            Source::SemanticResearch,
            "semantic",
            Stage::Primary,
            ExtractionMethod::FreeText,
        ));
        result.add_field(candidate(
            EnrichableField::Niche,
            FieldValue::text("Executive coaching"),
            Source::SemanticResearch,
            "semantic",
            Stage::Primary,
            ExtractionMethod::ProviderVerified,
        ));
        // Audience keeps the largest count
        result.add_field(candidate(
            EnrichableField::ListSize,
            FieldValue::Count(900),
            Source::SemanticResearch,
            "semantic",
            Stage::Primary,
            ExtractionMethod::Structured,
        ));
        result.add_field(candidate(
            EnrichableField::ListSize,
            FieldValue::Count(4_000),
            Source::DeepResearch,
            "deep",
            Stage::DeepFallback,
            ExtractionMethod::Structured,
        ));
        // Lists combine every candidate
        result.add_field(candidate(
            EnrichableField::Partnerships,
            FieldValue::Partnerships(vec![PartnershipEntry::new("Summit A")]),
            Source::SemanticResearch,
            "semantic",
            Stage::Primary,
            ExtractionMethod::Structured,
        ));
        result.add_field(candidate(
            EnrichableField::Partnerships,
            FieldValue::Partnerships(vec![PartnershipEntry::new("Podcast B")]),
            Source::DeepResearch,
            "deep",
            Stage::DeepFallback,
            ExtractionMethod::Structured,
        ));
        // A quarantined candidate does not block a valid one
        result.add_field(candidate(
            EnrichableField::Email,
            FieldValue::text("info@example.com"),
            Source::SemanticResearch,
            "semantic",
            Stage::Primary,
            ExtractionMethod::ProviderVerified,
        ));
        result.add_field(candidate(
            EnrichableField::Email,
            FieldValue::text("jane@acme.io"),
            Source::DirectoryApi,
            "directory",
            Stage::ContactGap,
            ExtractionMethod::Structured,
        ));

        let (update, quarantined) = persister.prepare(&result.finish());
        let update = update.unwrap();
        assert_eq!(quarantined.len(), 1);
        assert_eq!(update.writes.len(), 4);

        let value_of = |field: EnrichableField| {
            update
                .writes
                .iter()
                .find(|w| w.field == field)
                .map(|w| w.value.clone())
                .unwrap()
        };
        assert_eq!(value_of(EnrichableField::Niche), FieldValue::text("Executive coaching"));
        assert_eq!(value_of(EnrichableField::ListSize), FieldValue::Count(4_000));
        assert_eq!(
            value_of(EnrichableField::Partnerships),
            FieldValue::Partnerships(vec![
                PartnershipEntry::new("Summit A"),
                PartnershipEntry::new("Podcast B"),
            ])
        );
        assert_eq!(value_of(EnrichableField::Email), FieldValue::text("jane@acme.io"));
    }

    #[tokio::test]
    async fn test_not_found_touches_enrichment_timestamp() {
        let store = Arc::new(InMemoryStore::new());
        let id = seed(&store, "Quiet").await;
        let persister = persister(store.clone());

        let result = found(id, vec![]);
        assert_eq!(result.outcome, EnrichmentOutcome::NoEnrichmentFound);
        persister.consolidate(&[result.clone()]).await.unwrap();

        let record = store.get_record(&id).await.unwrap().unwrap();
        assert_eq!(record.last_enriched_at, Some(result.completed_at));
        assert_eq!(record.pipeline_version, 3);
        assert_eq!(record.tier, Some(Tier::Tier3));
    }

    #[tokio::test]
    async fn test_failed_results_are_not_persisted() {
        let store = Arc::new(InMemoryStore::new());
        let id = seed(&store, "Unlucky").await;
        let persister = persister(store.clone());

        let mut result = EnrichmentResult::new(id, false, false);
        result.credits_exhausted = true;
        let result = result.finish();

        let report = persister.consolidate(&[result]).await.unwrap();
        assert_eq!(report.records_updated, 0);

        let record = store.get_record(&id).await.unwrap().unwrap();
        assert!(record.last_enriched_at.is_none());
    }

    #[tokio::test]
    async fn test_replaying_results_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let id = seed(&store, "Jane").await;
        let persister = persister(store.clone());

        let result = found(
            id,
            vec![(EnrichableField::WhatTheyDo, "Runs workshops", ExtractionMethod::Structured)],
        );
        persister.consolidate(&[result.clone()]).await.unwrap();
        let first = store.get_record(&id).await.unwrap().unwrap();

        persister.consolidate(&[result]).await.unwrap();
        let second = store.get_record(&id).await.unwrap().unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_missing_record_is_isolated() {
        let store = Arc::new(InMemoryStore::new());
        let id = seed(&store, "Real").await;
        let persister = persister(store.clone());

        let ghost = Uuid::new_v4();
        let results = vec![
            found(id, vec![(EnrichableField::Niche, "Yoga", ExtractionMethod::Structured)]),
            found(ghost, vec![(EnrichableField::Niche, "Pilates", ExtractionMethod::Structured)]),
        ];

        let report = persister.consolidate(&results).await.unwrap();
        assert_eq!(report.records_updated, 1);
        assert_eq!(report.failed_records, vec![ghost]);
    }
}
