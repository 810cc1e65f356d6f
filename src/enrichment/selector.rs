use crate::config::SelectorConfig;
use crate::error::Result;
use crate::models::{EnrichmentCandidate, PriorityMode, ProfileRecord, Tier};
use crate::state::{RecordFilter, StorePool};
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;
use tracing::{debug, info};

/// Parameters of one selection pass
#[derive(Debug, Clone)]
pub struct SelectionRequest {
    /// Maximum number of candidates, `None` for all
    pub limit: Option<usize>,
    pub mode: PriorityMode,
    /// Only these tiers (empty means all)
    pub tier_filter: Vec<Tier>,
    /// Refresh mode selects records last enriched before `now - staleness_horizon`
    pub staleness_horizon: Duration,
}

/// Read-only query that picks and tiers records needing enrichment
pub struct CandidateSelector {
    pool: StorePool,
    config: SelectorConfig,
    pipeline_version: u32,
}

impl CandidateSelector {
    pub fn new(pool: StorePool, config: SelectorConfig, pipeline_version: u32) -> Self {
        Self {
            pool,
            config,
            pipeline_version,
        }
    }

    /// Completeness tier, or `None` when the record needs nothing
    pub fn assign_tier(&self, record: &ProfileRecord) -> Option<Tier> {
        let needs_reenrichment = record.last_enriched_at.is_some()
            && record.pipeline_version < self.pipeline_version
            && self
                .config
                .reenrich_fields
                .iter()
                .any(|field| !record.is_filled(*field));
        if needs_reenrichment {
            return Some(Tier::Tier0);
        }

        let missing_key_field = self
            .config
            .key_fields
            .iter()
            .any(|field| !record.is_filled(*field));
        if !missing_key_field {
            return None;
        }

        Some(self.signal_tier(record))
    }

    /// Tier derived from available signals only
    pub fn signal_tier(&self, record: &ProfileRecord) -> Tier {
        if record.has_website() {
            let audience = record.audience_size();
            if audience >= self.config.tier1_min_audience {
                Tier::Tier1
            } else if audience >= self.config.tier2_min_audience {
                Tier::Tier2
            } else {
                Tier::Tier3
            }
        } else if record.has_directory_handle() {
            Tier::Tier4
        } else {
            Tier::Tier5
        }
    }

    /// `SelectCandidates(limit, priorityMode, tierFilter)`
    pub async fn select(&self, request: &SelectionRequest) -> Result<Vec<EnrichmentCandidate>> {
        self.select_at(request, Utc::now()).await
    }

    pub async fn select_at(
        &self,
        request: &SelectionRequest,
        now: DateTime<Utc>,
    ) -> Result<Vec<EnrichmentCandidate>> {
        let filter = match request.mode {
            PriorityMode::Tiered => RecordFilter {
                not_enriched_since: Some(
                    now - Duration::hours(self.config.reattempt_cooldown_hours),
                ),
                ..Default::default()
            },
            PriorityMode::Refresh => RecordFilter {
                enriched_before: Some(now - request.staleness_horizon),
                ..Default::default()
            },
        };

        let records = {
            let store = self.pool.acquire().await?;
            store.list_records(&filter).await?
        };
        let scanned = records.len();

        let mut candidates: Vec<EnrichmentCandidate> = records
            .into_iter()
            .filter_map(|record| {
                let tier = match request.mode {
                    PriorityMode::Tiered => self.assign_tier(&record)?,
                    PriorityMode::Refresh => self.signal_tier(&record),
                };
                Some(EnrichmentCandidate::new(record, tier))
            })
            .filter(|c| request.tier_filter.is_empty() || request.tier_filter.contains(&c.tier()))
            .collect();

        candidates.sort_by_key(|c| (c.tier(), Reverse(c.record().audience_size()), c.id()));

        if let Some(limit) = request.limit {
            candidates.truncate(limit);
        }

        debug!(scanned, selected = candidates.len(), "Candidate scan complete");
        info!(
            mode = %request.mode,
            selected = candidates.len(),
            "Selected enrichment candidates"
        );

        Ok(candidates)
    }
}
