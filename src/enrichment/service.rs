use crate::config::{Config, ProviderSettings};
use crate::enrichment::cascade::{CascadeEngine, CascadeSettings, ProviderSet};
use crate::enrichment::confidence::ConfidenceScorer;
use crate::enrichment::gate::{VerificationGate, VerificationStatus};
use crate::enrichment::merge::MergePolicy;
use crate::enrichment::persistence::Persister;
use crate::enrichment::retry::RetryPolicy;
use crate::enrichment::scheduler::{RunReport, RunStats, Scheduler, SchedulerSettings};
use crate::enrichment::selector::{CandidateSelector, SelectionRequest};
use crate::error::{AppError, Result};
use crate::models::{
    EnrichableField, EnrichmentCandidate, ExtractionMethod, PriorityMode, QuarantineRecord,
    Source, Tier,
};
use crate::providers::http::{HttpProvider, HttpProviderConfig};
use crate::state::{QuarantineLog, StoreHandles, StorePool};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use strum::IntoEnumIterator;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Per-run overrides; `None` falls back to configuration
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub limit: Option<usize>,
    pub concurrency: Option<usize>,
    pub mode: PriorityMode,
    pub tier_filter: Vec<Tier>,
    pub staleness_horizon: Option<Duration>,
    pub credit_cap: Option<f64>,
    pub sub_batch_size: Option<usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            limit: None,
            concurrency: None,
            mode: PriorityMode::Tiered,
            tier_filter: Vec::new(),
            staleness_horizon: None,
            credit_cap: None,
            sub_batch_size: None,
        }
    }
}

/// Existing value that would not pass the gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateFinding {
    pub record_id: Uuid,
    pub field: EnrichableField,
    pub value: String,
    pub issues: Vec<String>,
    /// `apply_fixes` would repair the value
    pub fixable: bool,
}

/// What a run would do, without calling providers or writing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DryRunPlan {
    pub candidates: usize,
    pub by_tier: BTreeMap<Tier, usize>,
    pub fill_only: usize,
    pub findings: Vec<GateFinding>,
}

/// Outcome of one adaptive quarantine pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QuarantineRetryReport {
    pub attempted: u64,
    pub resolved: u64,
    pub still_pending: u64,
    /// Replacement values that failed the gate and were logged
    pub requarantined: u64,
    pub cost: f64,
}

/// Run orchestration: select, schedule, persist, report
pub struct EnrichmentService {
    config: Config,
    quarantine: Arc<dyn QuarantineLog>,
    pool: StorePool,
    selector: CandidateSelector,
    cascade: Arc<CascadeEngine>,
    persister: Persister,
}

impl EnrichmentService {
    /// Create a service over explicit providers
    pub fn new(config: Config, stores: StoreHandles, providers: ProviderSet) -> Self {
        if providers.is_empty() {
            warn!("No research providers enabled; every candidate will come back empty");
        }

        let pool = StorePool::new(stores.records, config.store.pool_size);
        let selector = CandidateSelector::new(
            pool.clone(),
            config.selector.clone(),
            config.enrichment.pipeline_version,
        );

        let cascade = Arc::new(CascadeEngine::new(
            providers,
            RetryPolicy::new(config.retry.clone()),
            CascadeSettings {
                required_fields: config.enrichment.required_fields.clone(),
                fill_only_tiers: config.enrichment.fill_only_tiers.clone(),
            },
        ));

        let policy = MergePolicy {
            priority: config.priority.clone(),
            staleness_horizon: config.enrichment.staleness_horizon(),
            scorer: ConfidenceScorer::new(config.confidence.clone(), config.priority.clone()),
        };
        let persister = Persister::new(
            pool.clone(),
            Arc::clone(&stores.quarantine),
            VerificationGate::new(config.gate.clone()),
            policy,
            config.enrichment.pipeline_version,
        );

        Self {
            config,
            quarantine: stores.quarantine,
            pool,
            selector,
            cascade,
            persister,
        }
    }

    /// Create a service with HTTP providers built from configuration
    pub fn from_config(config: Config, stores: StoreHandles) -> Result<Self> {
        let providers = build_providers(&config)?;
        Ok(Self::new(config, stores, providers))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &StorePool {
        &self.pool
    }

    fn selection_request(&self, options: &RunOptions) -> SelectionRequest {
        SelectionRequest {
            limit: options.limit,
            mode: options.mode,
            tier_filter: options.tier_filter.clone(),
            staleness_horizon: options
                .staleness_horizon
                .unwrap_or_else(|| self.config.enrichment.staleness_horizon()),
        }
    }

    /// Select, enrich and persist until candidates or credits run out.
    ///
    /// Selection and fatal store errors abort the run; everything else is
    /// counted in the report.
    pub async fn run(&self, options: &RunOptions) -> Result<RunReport> {
        let concurrency = options
            .concurrency
            .unwrap_or(self.config.enrichment.concurrency);
        if concurrency == 0 {
            return Err(AppError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        self.config.store.check_pool_size(concurrency)?;

        let candidates = self.selector.select(&self.selection_request(options)).await?;
        let total = candidates.len();
        let refresh = options.mode == PriorityMode::Refresh;

        info!(
            candidates = total,
            concurrency,
            mode = %options.mode,
            providers = ?self.cascade.providers().names(),
            "🚀 Starting enrichment run"
        );

        let settings = SchedulerSettings {
            concurrency,
            sub_batch_size: options
                .sub_batch_size
                .unwrap_or(self.config.enrichment.sub_batch_size)
                .max(1),
            task_timeout: std::time::Duration::from_secs(self.config.enrichment.task_timeout_secs),
            credit_cap: options.credit_cap.or(self.config.enrichment.credit_cap),
        };
        let scheduler = Scheduler::new(Arc::clone(&self.cascade), settings);
        let stats = Arc::new(RunStats::new());

        let persister = &self.persister;
        let run_stats = &stats;
        let outcome = scheduler
            .run_batch(candidates, refresh, &stats, |results| async move {
                match persister.consolidate(&results).await {
                    Ok(persisted) => {
                        run_stats.add_quarantined(persisted.fields_quarantined);
                        run_stats.add_fields_written(persisted.fields_written);
                        run_stats.add_fields_rejected(persisted.fields_rejected);
                        run_stats.add_persistence_failures(persisted.failed_records.len() as u64);
                        Ok(())
                    }
                    Err(e) => {
                        run_stats.add_persistence_failures(results.len() as u64);
                        Err(e)
                    }
                }
            })
            .await;

        if let Err(e) = outcome {
            error!(error = %e, "Persistence aborted, run stopped");
        }

        let report = stats.report(scheduler.is_cancelled());
        info!(
            attempted = report.attempted,
            enriched = report.enriched,
            not_found = report.not_found,
            failed = report.failed,
            quarantined = report.quarantined,
            cost = report.total_cost,
            duration_secs = report.duration_secs,
            "✅ Enrichment run complete"
        );

        Ok(report)
    }

    /// Tier histogram and gate findings for the candidates a run would pick
    pub async fn dry_run(&self, options: &RunOptions) -> Result<DryRunPlan> {
        let candidates = self.selector.select(&self.selection_request(options)).await?;
        let refresh = options.mode == PriorityMode::Refresh;
        let gate = self.persister.gate();

        let mut plan = DryRunPlan {
            candidates: candidates.len(),
            ..Default::default()
        };

        for candidate in &candidates {
            *plan.by_tier.entry(candidate.tier()).or_insert(0) += 1;
            if self.cascade.is_fill_only(candidate.tier(), refresh) {
                plan.fill_only += 1;
            }
            plan.findings.extend(self.audit(candidate, gate));
        }

        info!(
            candidates = plan.candidates,
            findings = plan.findings.len(),
            "Dry run complete, nothing written"
        );
        Ok(plan)
    }

    fn audit(&self, candidate: &EnrichmentCandidate, gate: &VerificationGate) -> Vec<GateFinding> {
        let record = candidate.record();
        EnrichableField::iter()
            .filter_map(|field| {
                let value = record.get(field)?;
                let verdict = gate.evaluate_value(field, &value, ExtractionMethod::Structured);
                let fixable = verdict.fixed;
                if verdict.status != VerificationStatus::Quarantined && !fixable {
                    return None;
                }
                let issues = if fixable {
                    gate.check(field, &value)
                } else {
                    verdict.issues
                };
                Some(GateFinding {
                    record_id: record.id,
                    field,
                    value: value.display(),
                    issues,
                    fixable,
                })
            })
            .collect()
    }

    /// Pending quarantine entries, oldest first
    pub async fn pending_quarantine(&self, limit: usize) -> Result<Vec<QuarantineRecord>> {
        self.quarantine.list_pending(limit).await
    }

    /// Ask a different provider for each quarantined field.
    ///
    /// An entry is resolved once its field holds a value; otherwise the
    /// attempt is counted and the entry stays pending.
    pub async fn retry_quarantined(&self, limit: usize) -> Result<QuarantineRetryReport> {
        let mut report = QuarantineRetryReport::default();

        for entry in self.quarantine.list_pending(limit).await? {
            report.attempted += 1;

            let record = {
                let store = self.pool.acquire().await?;
                store.get_record(&entry.record_id).await?
            };
            let Some(record) = record else {
                warn!(quarantine_id = %entry.id, record_id = %entry.record_id, "Record gone, closing quarantine entry");
                self.quarantine.mark_resolved(&entry.id, Utc::now()).await?;
                report.resolved += 1;
                continue;
            };

            if record.is_filled(entry.field) {
                self.quarantine.mark_resolved(&entry.id, Utc::now()).await?;
                report.resolved += 1;
                continue;
            }

            let result = self
                .cascade
                .enrich_field(&record, entry.field, &entry.provider)
                .await;
            report.cost += result.cost;

            let (update, requarantined) = self.persister.prepare(&result);
            if !requarantined.is_empty() {
                warn!(
                    quarantine_id = %entry.id,
                    field = %entry.field,
                    values = requarantined.len(),
                    "Replacement value failed verification"
                );
                report.requarantined += requarantined.len() as u64;
            }

            // A single-field retry does not count as a pipeline pass
            let updates: Vec<_> = update
                .map(|mut update| {
                    update.pipeline_version = record.pipeline_version;
                    update.tier = None;
                    update
                })
                .into_iter()
                .collect();
            if !updates.is_empty() || !requarantined.is_empty() {
                self.persister.write(updates, requarantined).await?;
            }

            let filled = {
                let store = self.pool.acquire().await?;
                store
                    .get_record(&entry.record_id)
                    .await?
                    .map(|r| r.is_filled(entry.field))
                    .unwrap_or(false)
            };

            if filled {
                info!(quarantine_id = %entry.id, field = %entry.field, "Quarantined field resolved");
                self.quarantine.mark_resolved(&entry.id, Utc::now()).await?;
                report.resolved += 1;
            } else {
                self.quarantine.record_attempt(&entry.id).await?;
                report.still_pending += 1;
            }
        }

        Ok(report)
    }
}

/// Build HTTP providers for every enabled section with a credential
pub fn build_providers(config: &Config) -> Result<ProviderSet> {
    let mut set = ProviderSet::default();
    let sections = &config.providers;

    if let Some(provider) = http_provider("semantic", Source::SemanticResearch, sections.semantic.as_ref())? {
        set.semantic = Some(provider);
    }
    if let Some(provider) = http_provider("directory", Source::DirectoryApi, sections.directory.as_ref())? {
        set.directory = Some(provider);
    }
    if let Some(provider) = http_provider("deep", Source::DeepResearch, sections.deep.as_ref())? {
        set.deep = Some(provider);
    }

    Ok(set)
}

fn http_provider(
    name: &str,
    default_source: Source,
    settings: Option<&ProviderSettings>,
) -> Result<Option<Arc<HttpProvider>>> {
    let Some(settings) = settings.filter(|s| s.enabled) else {
        info!(provider = name, "Provider disabled");
        return Ok(None);
    };

    let Some(api_key) = settings.api_key() else {
        warn!(
            provider = name,
            env = %settings.api_key_env,
            "Provider credential missing, stage disabled"
        );
        return Ok(None);
    };

    let provider = HttpProvider::new(HttpProviderConfig {
        name: name.to_string(),
        source: settings.source.unwrap_or(default_source),
        endpoint: settings.endpoint.clone(),
        api_key,
        timeout_secs: settings.timeout_secs,
        cost_per_call: settings.cost_per_call,
    })
    .map_err(|source| AppError::Provider {
        provider: name.to_string(),
        source,
    })?;

    info!(provider = name, endpoint = %settings.endpoint, "Provider enabled");
    Ok(Some(Arc::new(provider)))
}
