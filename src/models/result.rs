use crate::models::candidate::Tier;
use crate::models::profile::{EnrichableField, FieldValue};
use crate::models::provenance::Source;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::Display;
use uuid::Uuid;

/// Cascade stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Primary,
    ContactGap,
    DeepFallback,
}

/// How a value was obtained, consumed by the verification gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// The provider matched and verified the value itself
    ProviderVerified,
    /// Structured provider output that was not independently verified
    Structured,
    /// Scraped or extracted from free text
    FreeText,
}

impl ExtractionMethod {
    pub fn is_authoritative(&self) -> bool {
        matches!(self, ExtractionMethod::ProviderVerified)
    }

    /// Ordering used to break ties between candidates from equally ranked sources
    pub fn trust(&self) -> u8 {
        match self {
            ExtractionMethod::ProviderVerified => 2,
            ExtractionMethod::Structured => 1,
            ExtractionMethod::FreeText => 0,
        }
    }
}

/// A single value discovered by a provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredField {
    pub field: EnrichableField,
    pub value: FieldValue,
    pub source: Source,
    pub provider: String,
    pub stage: Stage,
    pub extraction: ExtractionMethod,
    pub discovered_at: DateTime<Utc>,
}

/// A provider call that ended without a response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageFailure {
    pub stage: Stage,
    pub provider: String,
    /// Error class label (`permanent`, `transient`, ...)
    pub class: String,
    pub message: String,
}

/// Outcome of a cascade run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentOutcome {
    /// At least one new value was discovered
    Enriched,
    /// Every viable stage ran and produced nothing; expected, not an error
    NoEnrichmentFound,
    /// Nothing was discovered and at least one provider call failed terminally
    Failed,
}

/// Accumulated output of the cascade for one candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub record_id: Uuid,

    /// Discovered values in discovery order; several stages may supply the same field
    pub fields: Vec<DiscoveredField>,

    /// Summed provider cost for this candidate
    pub cost: f64,

    /// Cost per provider name
    pub cost_by_provider: BTreeMap<String, f64>,

    /// Provider calls that failed terminally
    pub failures: Vec<StageFailure>,

    /// A provider reported that its credits are exhausted
    pub credits_exhausted: bool,

    /// Stages that issued a provider call
    pub stages_run: Vec<Stage>,

    /// Whether writes may only fill empty fields
    pub fill_only: bool,

    /// Whether the run is a refresh pass
    pub refresh: bool,

    /// Tier the candidate was selected under; unset for single-field retries
    pub tier: Option<Tier>,

    pub outcome: EnrichmentOutcome,

    /// Completion timestamp; used as the write timestamp so replays are idempotent
    pub completed_at: DateTime<Utc>,
}

impl EnrichmentResult {
    pub fn new(record_id: Uuid, fill_only: bool, refresh: bool) -> Self {
        Self {
            record_id,
            fields: Vec::new(),
            cost: 0.0,
            cost_by_provider: BTreeMap::new(),
            failures: Vec::new(),
            credits_exhausted: false,
            stages_run: Vec::new(),
            fill_only,
            refresh,
            tier: None,
            outcome: EnrichmentOutcome::NoEnrichmentFound,
            completed_at: Utc::now(),
        }
    }

    /// Whether a value for `field` was already discovered
    pub fn has_field(&self, field: EnrichableField) -> bool {
        self.fields.iter().any(|f| f.field == field)
    }

    /// Add a discovered value. Empty values and exact repeats from the same
    /// provider are dropped. Returns whether the value was kept.
    pub fn add_field(&mut self, discovered: DiscoveredField) -> bool {
        let repeat = self.fields.iter().any(|f| {
            f.field == discovered.field
                && f.provider == discovered.provider
                && f.value == discovered.value
        });
        if discovered.value.is_empty() || repeat {
            return false;
        }
        self.fields.push(discovered);
        true
    }

    /// Account for one provider call
    pub fn add_cost(&mut self, provider: &str, cost: f64) {
        self.cost += cost;
        *self.cost_by_provider.entry(provider.to_string()).or_insert(0.0) += cost;
    }

    pub fn providers(&self) -> Vec<String> {
        let mut providers: Vec<String> = self.fields.iter().map(|f| f.provider.clone()).collect();
        providers.sort();
        providers.dedup();
        providers
    }

    /// Freeze the result
    pub fn finish(mut self) -> Self {
        self.outcome = if !self.fields.is_empty() {
            EnrichmentOutcome::Enriched
        } else if !self.failures.is_empty() || self.credits_exhausted {
            EnrichmentOutcome::Failed
        } else {
            EnrichmentOutcome::NoEnrichmentFound
        };
        self.completed_at = Utc::now();
        self
    }
}
