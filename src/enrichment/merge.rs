//! Source-priority merge.
//!
//! `apply_update` is the write predicate the stores evaluate inside their
//! atomic write. It is pure: the same update applied to the same record
//! always yields the same record, which is what makes replays idempotent.

use crate::enrichment::confidence::{discount, ConfidenceScorer};
use crate::models::{
    EnrichableField, FieldKind, FieldProvenance, FieldValue, PartnershipEntry, ProfileRecord,
    Source, SourcePriority, Tier,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Priority rule parameters shared by every write
#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub priority: SourcePriority,
    pub staleness_horizon: Duration,
    pub scorer: ConfidenceScorer,
}

/// One candidate field write
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub field: EnrichableField,
    pub value: FieldValue,
    pub source: Source,
    pub extracted_at: DateTime<Utc>,
    /// Gate discount applied to the confidence score
    pub confidence_multiplier: f64,
}

/// Every write produced for one record by one cascade result
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub record_id: Uuid,
    pub writes: Vec<FieldWrite>,
    pub fill_only: bool,
    pub tier: Option<Tier>,
    pub pipeline_version: u32,
    /// Write timestamp, taken from the cascade result
    pub written_at: DateTime<Utc>,
}

impl RecordUpdate {
    /// Grouping key: updates with the same shape are written together
    pub fn shape(&self) -> UpdateShape {
        let mut fields: Vec<EnrichableField> = self.writes.iter().map(|w| w.field).collect();
        fields.sort();
        fields.dedup();
        UpdateShape {
            fill_only: self.fill_only,
            fields,
        }
    }
}

/// Mode plus sorted field set of an update
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpdateShape {
    pub fill_only: bool,
    pub fields: Vec<EnrichableField>,
}

/// Why a field write was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Existing value came from a higher-ranked source
    LowerPriority,
    /// Equal rank and the existing value is within the staleness horizon
    NotStale,
    /// Fill-only pass and the field already holds a value
    FillOnly,
    /// Upgrade-only field and the new number is not larger
    NotLarger,
    /// Nothing new to add
    NoChange,
    /// Value type does not fit the field
    TypeMismatch,
    /// Merged list would exceed the record's entry limit
    LimitReached,
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::LowerPriority => "lower_priority",
            RejectReason::NotStale => "not_stale",
            RejectReason::FillOnly => "fill_only",
            RejectReason::NotLarger => "not_larger",
            RejectReason::NoChange => "no_change",
            RejectReason::TypeMismatch => "type_mismatch",
            RejectReason::LimitReached => "limit_reached",
        }
    }
}

/// Result of applying one update to one record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub record_id: Uuid,
    pub written: Vec<EnrichableField>,
    pub rejected: Vec<(EnrichableField, RejectReason)>,
}

/// Apply `update` to `record` under the priority rule
pub fn apply_update(
    record: &mut ProfileRecord,
    update: &RecordUpdate,
    policy: &MergePolicy,
) -> MergeOutcome {
    let mut outcome = MergeOutcome {
        record_id: record.id,
        ..Default::default()
    };

    for write in &update.writes {
        let decided = decide(record, write, update, policy)
            .and_then(|decided| within_limit(write.field, decided));
        match decided {
            Ok((value, source)) => {
                if record.set(write.field, value).is_err() {
                    outcome
                        .rejected
                        .push((write.field, RejectReason::TypeMismatch));
                    continue;
                }

                let mut provenance =
                    FieldProvenance::new(source, update.written_at, update.pipeline_version);
                provenance.confidence = policy
                    .scorer
                    .score(write.field, source, write.extracted_at, update.written_at)
                    .map(|score| discount(score, write.confidence_multiplier));
                record.provenance.insert(write.field, provenance);
                outcome.written.push(write.field);
            }
            Err(reason) => outcome.rejected.push((write.field, reason)),
        }
    }

    record.last_enriched_at = Some(update.written_at);
    record.pipeline_version = record.pipeline_version.max(update.pipeline_version);
    if update.tier.is_some() {
        record.tier = update.tier;
    }
    if !outcome.written.is_empty() {
        record.updated_at = update.written_at;
    }

    outcome
}

/// Decide whether a single write wins, returning the value to store and the
/// source to record in provenance.
fn decide(
    record: &ProfileRecord,
    write: &FieldWrite,
    update: &RecordUpdate,
    policy: &MergePolicy,
) -> Result<(FieldValue, Source), RejectReason> {
    let Some(existing) = record.get(write.field) else {
        return Ok((normalize(&write.value), write.source));
    };

    if update.fill_only {
        return Err(RejectReason::FillOnly);
    }

    let existing_provenance = record.provenance.get(&write.field);
    let existing_source = existing_provenance
        .map(|p| p.source)
        .unwrap_or(Source::Unknown);

    match write.field.kind() {
        FieldKind::Audience => match (&existing, &write.value) {
            (FieldValue::Count(current), FieldValue::Count(new)) if new > current => {
                Ok((write.value.clone(), write.source))
            }
            (FieldValue::Count(_), FieldValue::Count(_)) => Err(RejectReason::NotLarger),
            _ => Err(RejectReason::TypeMismatch),
        },
        FieldKind::List => {
            let merged = append_dedupe(&existing, &write.value)?;
            if merged == existing {
                return Err(RejectReason::NoChange);
            }
            let source = if policy.priority.rank(write.source) >= policy.priority.rank(existing_source)
            {
                write.source
            } else {
                existing_source
            };
            Ok((merged, source))
        }
        FieldKind::Contact | FieldKind::Description => {
            let new_rank = policy.priority.rank(write.source);
            let existing_rank = policy.priority.rank(existing_source);

            if new_rank < existing_rank {
                return Err(RejectReason::LowerPriority);
            }
            if new_rank == existing_rank {
                let stale = existing_provenance
                    .map(|p| p.is_stale(update.written_at, policy.staleness_horizon))
                    .unwrap_or(true);
                if !stale {
                    return Err(RejectReason::NotStale);
                }
                if existing == write.value {
                    return Err(RejectReason::NoChange);
                }
            }
            Ok((write.value.clone(), write.source))
        }
    }
}

fn within_limit(
    field: EnrichableField,
    decided: (FieldValue, Source),
) -> Result<(FieldValue, Source), RejectReason> {
    match (&decided.0, field.max_len()) {
        (FieldValue::Partnerships(entries), Some(limit)) if entries.len() > limit => {
            Err(RejectReason::LimitReached)
        }
        _ => Ok(decided),
    }
}

fn normalize(value: &FieldValue) -> FieldValue {
    match value {
        FieldValue::Partnerships(entries) => FieldValue::Partnerships(dedupe(entries, &[])),
        other => other.clone(),
    }
}

fn append_dedupe(existing: &FieldValue, new: &FieldValue) -> Result<FieldValue, RejectReason> {
    match (existing, new) {
        (FieldValue::Partnerships(current), FieldValue::Partnerships(incoming)) => {
            Ok(FieldValue::Partnerships(dedupe(incoming, current)))
        }
        _ => Err(RejectReason::TypeMismatch),
    }
}

/// `base` followed by the entries of `incoming` whose key is not yet present
fn dedupe(incoming: &[PartnershipEntry], base: &[PartnershipEntry]) -> Vec<PartnershipEntry> {
    let mut seen: HashSet<String> = base.iter().map(PartnershipEntry::key).collect();
    let mut merged = base.to_vec();
    for entry in incoming {
        if seen.insert(entry.key()) {
            merged.push(entry.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfidenceConfig;

    fn policy() -> MergePolicy {
        let priority = SourcePriority::default();
        MergePolicy {
            priority: priority.clone(),
            staleness_horizon: Duration::days(90),
            scorer: ConfidenceScorer::new(ConfidenceConfig::default(), priority),
        }
    }

    fn write(field: EnrichableField, value: FieldValue, source: Source) -> FieldWrite {
        FieldWrite {
            field,
            value,
            source,
            extracted_at: Utc::now(),
            confidence_multiplier: 1.0,
        }
    }

    fn update(record: &ProfileRecord, writes: Vec<FieldWrite>, fill_only: bool) -> RecordUpdate {
        RecordUpdate {
            record_id: record.id,
            writes,
            fill_only,
            tier: Some(Tier::Tier1),
            pipeline_version: 3,
            written_at: Utc::now(),
        }
    }

    #[test]
    fn test_fills_empty_field_with_provenance() {
        let mut record = ProfileRecord::new("Jane");
        let u = update(
            &record,
            vec![write(
                EnrichableField::Email,
                FieldValue::text("jane@acme.io"),
                Source::SemanticResearch,
            )],
            false,
        );

        let outcome = apply_update(&mut record, &u, &policy());

        assert_eq!(outcome.written, vec![EnrichableField::Email]);
        assert_eq!(record.email.as_deref(), Some("jane@acme.io"));
        let provenance = &record.provenance[&EnrichableField::Email];
        assert_eq!(provenance.source, Source::SemanticResearch);
        assert!(provenance.confidence.is_some());
        assert_eq!(record.last_enriched_at, Some(u.written_at));
        assert_eq!(record.tier, Some(Tier::Tier1));
    }

    #[test]
    fn test_lower_rank_rejected_higher_rank_accepted() {
        let mut record = ProfileRecord::new("Jane");
        let first = update(
            &record,
            vec![write(
                EnrichableField::Email,
                FieldValue::text("a@acme.io"),
                Source::SemanticResearch,
            )],
            false,
        );
        apply_update(&mut record, &first, &policy());

        let lower = update(
            &record,
            vec![write(
                EnrichableField::Email,
                FieldValue::text("b@acme.io"),
                Source::DeepResearch,
            )],
            false,
        );
        let outcome = apply_update(&mut record, &lower, &policy());
        assert_eq!(
            outcome.rejected,
            vec![(EnrichableField::Email, RejectReason::LowerPriority)]
        );
        assert_eq!(record.email.as_deref(), Some("a@acme.io"));

        let higher = update(
            &record,
            vec![write(
                EnrichableField::Email,
                FieldValue::text("c@acme.io"),
                Source::Manual,
            )],
            false,
        );
        apply_update(&mut record, &higher, &policy());
        assert_eq!(record.email.as_deref(), Some("c@acme.io"));
        assert_eq!(
            record.provenance[&EnrichableField::Email].source,
            Source::Manual
        );
    }

    #[test]
    fn test_equal_rank_needs_staleness() {
        let mut record = ProfileRecord::new("Jane");
        record.what_they_do = Some("Old description".to_string());
        record.provenance.insert(
            EnrichableField::WhatTheyDo,
            FieldProvenance::new(Source::SemanticResearch, Utc::now() - Duration::days(10), 2),
        );

        let fresh = update(
            &record,
            vec![write(
                EnrichableField::WhatTheyDo,
                FieldValue::text("New description"),
                Source::SemanticResearch,
            )],
            false,
        );
        let outcome = apply_update(&mut record.clone(), &fresh, &policy());
        assert_eq!(
            outcome.rejected,
            vec![(EnrichableField::WhatTheyDo, RejectReason::NotStale)]
        );

        record
            .provenance
            .get_mut(&EnrichableField::WhatTheyDo)
            .unwrap()
            .updated_at = Utc::now() - Duration::days(200);
        let outcome = apply_update(&mut record, &fresh, &policy());
        assert_eq!(outcome.written, vec![EnrichableField::WhatTheyDo]);
        assert_eq!(record.what_they_do.as_deref(), Some("New description"));
    }

    #[test]
    fn test_fill_only_never_alters_existing_value() {
        let mut record = ProfileRecord::new("Jane").with_email("curated@acme.io");
        record.provenance.insert(
            EnrichableField::Email,
            FieldProvenance::new(Source::Unknown, Utc::now() - Duration::days(400), 1),
        );

        let u = update(
            &record,
            vec![
                write(
                    EnrichableField::Email,
                    FieldValue::text("new@acme.io"),
                    Source::ClientProvided,
                ),
                write(
                    EnrichableField::Niche,
                    FieldValue::text("Executive coaching"),
                    Source::SemanticResearch,
                ),
            ],
            true,
        );
        let outcome = apply_update(&mut record, &u, &policy());

        assert_eq!(record.email.as_deref(), Some("curated@acme.io"));
        assert_eq!(record.niche.as_deref(), Some("Executive coaching"));
        assert_eq!(
            outcome.rejected,
            vec![(EnrichableField::Email, RejectReason::FillOnly)]
        );
    }

    #[test]
    fn test_audience_is_upgrade_only() {
        let mut record = ProfileRecord::new("Jane").with_list_size(5_000);
        record.provenance.insert(
            EnrichableField::ListSize,
            FieldProvenance::new(Source::ClientProvided, Utc::now(), 1),
        );

        let smaller = update(
            &record,
            vec![write(EnrichableField::ListSize, FieldValue::Count(4_000), Source::Manual)],
            false,
        );
        let outcome = apply_update(&mut record, &smaller, &policy());
        assert_eq!(
            outcome.rejected,
            vec![(EnrichableField::ListSize, RejectReason::NotLarger)]
        );

        // A larger number wins even from a lower-ranked source
        let larger = update(
            &record,
            vec![write(
                EnrichableField::ListSize,
                FieldValue::Count(8_000),
                Source::DeepResearch,
            )],
            false,
        );
        apply_update(&mut record, &larger, &policy());
        assert_eq!(record.list_size, Some(8_000));
    }

    #[test]
    fn test_partnerships_append_and_dedupe() {
        let mut record = ProfileRecord::new("Jane");
        record.partnerships = vec![PartnershipEntry::new("Summit A")];

        let u = update(
            &record,
            vec![write(
                EnrichableField::Partnerships,
                FieldValue::Partnerships(vec![
                    PartnershipEntry::new("summit a"),
                    PartnershipEntry::new("Podcast B"),
                ]),
                Source::DeepResearch,
            )],
            false,
        );

        apply_update(&mut record, &u, &policy());
        apply_update(&mut record, &u, &policy());

        let partners: Vec<&str> = record.partnerships.iter().map(|p| p.partner.as_str()).collect();
        assert_eq!(partners, vec!["Summit A", "Podcast B"]);
    }

    #[test]
    fn test_partnerships_stop_at_entry_limit() {
        let mut record = ProfileRecord::new("Jane");
        record.partnerships = (0..499).map(|i| PartnershipEntry::new(format!("p{}", i))).collect();

        let u = update(
            &record,
            vec![write(
                EnrichableField::Partnerships,
                FieldValue::Partnerships(vec![
                    PartnershipEntry::new("Summit A"),
                    PartnershipEntry::new("Podcast B"),
                ]),
                Source::SemanticResearch,
            )],
            false,
        );

        let outcome = apply_update(&mut record, &u, &policy());
        assert_eq!(
            outcome.rejected,
            vec![(EnrichableField::Partnerships, RejectReason::LimitReached)]
        );
        assert_eq!(record.partnerships.len(), 499);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let mut record = ProfileRecord::new("Jane");
        let u = update(
            &record,
            vec![
                write(
                    EnrichableField::Email,
                    FieldValue::text("jane@acme.io"),
                    Source::DirectoryApi,
                ),
                write(EnrichableField::SocialReach, FieldValue::Count(900), Source::DirectoryApi),
            ],
            false,
        );

        apply_update(&mut record, &u, &policy());
        let once = record.clone();
        let outcome = apply_update(&mut record, &u, &policy());

        assert_eq!(record, once);
        assert!(outcome.written.is_empty());
    }

    #[test]
    fn test_shape_ignores_write_order() {
        let record = ProfileRecord::new("Jane");
        let a = update(
            &record,
            vec![
                write(EnrichableField::Niche, FieldValue::text("x"), Source::Manual),
                write(EnrichableField::Email, FieldValue::text("a@b.io"), Source::Manual),
            ],
            false,
        );
        let b = update(
            &record,
            vec![
                write(EnrichableField::Email, FieldValue::text("c@d.io"), Source::Manual),
                write(EnrichableField::Niche, FieldValue::text("y"), Source::Manual),
            ],
            false,
        );
        assert_eq!(a.shape(), b.shape());
    }
}
