use crate::enrichment::retry::RetryPolicy;
use crate::metrics::{PROVIDER_COST_TOTAL, STAGE_DURATION_SECONDS};
use crate::models::{
    DiscoveredField, EnrichableField, EnrichmentCandidate, EnrichmentResult, ExtractionMethod,
    ProfileRecord, Stage, StageFailure, Tier,
};
use crate::providers::{
    DeepResearchProvider, DirectoryContactProvider, ErrorClass, ProviderError, ProviderField,
    ProviderInfo, ProviderResponse, ResearchHints, SemanticResearchProvider,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use strum::IntoEnumIterator;
use tracing::{debug, info, warn};

/// Providers available to the cascade; a missing one disables its stage
#[derive(Clone, Default)]
pub struct ProviderSet {
    pub semantic: Option<Arc<dyn SemanticResearchProvider>>,
    pub directory: Option<Arc<dyn DirectoryContactProvider>>,
    pub deep: Option<Arc<dyn DeepResearchProvider>>,
}

impl ProviderSet {
    pub fn is_empty(&self) -> bool {
        self.semantic.is_none() && self.directory.is_none() && self.deep.is_none()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(p) = &self.semantic {
            names.push(p.name().to_string());
        }
        if let Some(p) = &self.directory {
            names.push(p.name().to_string());
        }
        if let Some(p) = &self.deep {
            names.push(p.name().to_string());
        }
        names
    }
}

/// Cascade policy knobs
#[derive(Debug, Clone)]
pub struct CascadeSettings {
    /// Fields that end the cascade once filled
    pub required_fields: Vec<EnrichableField>,
    /// Tiers that run fill-only outside refresh mode
    pub fill_only_tiers: Vec<Tier>,
}

/// Per-candidate state machine over the three provider stages
pub struct CascadeEngine {
    providers: ProviderSet,
    retry: RetryPolicy,
    settings: CascadeSettings,
}

impl CascadeEngine {
    pub fn new(providers: ProviderSet, retry: RetryPolicy, settings: CascadeSettings) -> Self {
        Self {
            providers,
            retry,
            settings,
        }
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    /// Whether writes for this candidate may only fill empty fields
    pub fn is_fill_only(&self, tier: Tier, refresh: bool) -> bool {
        !refresh && self.settings.fill_only_tiers.contains(&tier)
    }

    /// `Enrich(candidate)`
    pub async fn enrich(&self, candidate: &EnrichmentCandidate, refresh: bool) -> EnrichmentResult {
        let record = candidate.record();
        let tier = candidate.tier();
        let mut result =
            EnrichmentResult::new(record.id, self.is_fill_only(tier, refresh), refresh);
        result.tier = Some(tier);

        // Stage 1: semantic research
        let mut primary_found = 0;
        if let Some(provider) = self.providers.semantic.clone() {
            let hints = ResearchHints {
                company: record.company.clone(),
                directory_handle: record.directory_handle.clone(),
                wanted: self.wanted_fields(record, &result, refresh),
            };
            let website = record.website.clone();

            let response = self
                .run_stage(Stage::Primary, provider.as_ref(), &mut result, || {
                    provider.research(&record.name, website.as_deref(), &hints)
                })
                .await;
            if let Some(response) = response {
                primary_found = self.collect(&mut result, provider.as_ref(), Stage::Primary, response);
            }

            if result.credits_exhausted || self.required_satisfied(record, &result, refresh) {
                return self.finish(result, tier);
            }
        }

        // Stage 2: contact gap
        if let Some(provider) = self.providers.directory.clone() {
            if self.contact_gap(record, &result, refresh) {
                let company = record.company.clone();
                let domain = record.domain();

                let response = self
                    .run_stage(Stage::ContactGap, provider.as_ref(), &mut result, || {
                        provider.lookup(&record.name, company.as_deref(), domain.as_deref())
                    })
                    .await;
                if let Some(response) = response {
                    self.collect(&mut result, provider.as_ref(), Stage::ContactGap, response);
                }

                if result.credits_exhausted || self.required_satisfied(record, &result, refresh) {
                    return self.finish(result, tier);
                }
            }
        }

        // Stage 3: deep fallback, only for records without a website
        if let Some(provider) = self.providers.deep.clone() {
            if tier.lacks_website() && primary_found == 0 {
                let company = record.company.clone();

                let response = self
                    .run_stage(Stage::DeepFallback, provider.as_ref(), &mut result, || {
                        provider.research(&record.name, company.as_deref())
                    })
                    .await;
                if let Some(response) = response {
                    self.collect(&mut result, provider.as_ref(), Stage::DeepFallback, response);
                }
            }
        }

        self.finish(result, tier)
    }

    /// Ask providers other than `exclude_provider` for exactly one field.
    ///
    /// Providers are tried in cascade order; the first usable value wins.
    pub async fn enrich_field(
        &self,
        record: &ProfileRecord,
        field: EnrichableField,
        exclude_provider: &str,
    ) -> EnrichmentResult {
        let mut result = EnrichmentResult::new(record.id, false, false);
        let keep_only = |response: ProviderResponse| ProviderResponse {
            fields: response
                .fields
                .into_iter()
                .filter(|f| f.field == field)
                .collect(),
            cost: response.cost,
        };

        if let Some(provider) = self.providers.semantic.clone() {
            if provider.name() != exclude_provider {
                let hints = ResearchHints {
                    company: record.company.clone(),
                    directory_handle: record.directory_handle.clone(),
                    wanted: vec![field],
                };
                let website = record.website.clone();
                if let Some(response) = self
                    .run_stage(Stage::Primary, provider.as_ref(), &mut result, || {
                        provider.research(&record.name, website.as_deref(), &hints)
                    })
                    .await
                {
                    self.collect(&mut result, provider.as_ref(), Stage::Primary, keep_only(response));
                }
            }
        }

        if !result.has_field(field) && !result.credits_exhausted {
            if let Some(provider) = self.providers.directory.clone() {
                if provider.name() != exclude_provider {
                    let company = record.company.clone();
                    let domain = record.domain();
                    if let Some(response) = self
                        .run_stage(Stage::ContactGap, provider.as_ref(), &mut result, || {
                            provider.lookup(&record.name, company.as_deref(), domain.as_deref())
                        })
                        .await
                    {
                        self.collect(
                            &mut result,
                            provider.as_ref(),
                            Stage::ContactGap,
                            keep_only(response),
                        );
                    }
                }
            }
        }

        if !result.has_field(field) && !result.credits_exhausted {
            if let Some(provider) = self.providers.deep.clone() {
                if provider.name() != exclude_provider {
                    let company = record.company.clone();
                    if let Some(response) = self
                        .run_stage(Stage::DeepFallback, provider.as_ref(), &mut result, || {
                            provider.research(&record.name, company.as_deref())
                        })
                        .await
                    {
                        self.collect(
                            &mut result,
                            provider.as_ref(),
                            Stage::DeepFallback,
                            keep_only(response),
                        );
                    }
                }
            }
        }

        result.finish()
    }

    /// Run one provider call through the retry policy, recording cost,
    /// latency and terminal failures on `result`.
    async fn run_stage<P, F, Fut>(
        &self,
        stage: Stage,
        provider: &P,
        result: &mut EnrichmentResult,
        call: F,
    ) -> Option<ProviderResponse>
    where
        P: ProviderInfo + ?Sized,
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<ProviderResponse, ProviderError>>,
    {
        let name = provider.name();
        let started = Instant::now();
        result.stages_run.push(stage);

        let outcome = self.retry.run(name, call).await;
        let stage_label = stage.to_string();
        STAGE_DURATION_SECONDS
            .with_label_values(&[stage_label.as_str()])
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(response) => {
                let cost = response.cost.unwrap_or_else(|| provider.estimated_cost());
                result.add_cost(name, cost);
                PROVIDER_COST_TOTAL.with_label_values(&[name]).inc_by(cost);
                Some(response)
            }
            Err(err) => {
                match err.classify() {
                    ErrorClass::NotIndexed => {
                        debug!(record_id = %result.record_id, provider = name, %stage, "Subject not indexed, falling through");
                    }
                    ErrorClass::CreditsExhausted => {
                        warn!(record_id = %result.record_id, provider = name, "Provider credits exhausted");
                        result.credits_exhausted = true;
                    }
                    _ => {
                        warn!(record_id = %result.record_id, provider = name, %stage, error = %err, "Stage failed");
                        result.failures.push(StageFailure {
                            stage,
                            provider: name.to_string(),
                            class: err.label().to_string(),
                            message: err.to_string(),
                        });
                    }
                }
                None
            }
        }
    }

    /// Move provider fields into the result; returns how many were kept
    fn collect<P: ProviderInfo + ?Sized>(
        &self,
        result: &mut EnrichmentResult,
        provider: &P,
        stage: Stage,
        response: ProviderResponse,
    ) -> usize {
        let now = Utc::now();
        let mut kept = 0;
        for ProviderField {
            field,
            value,
            verified,
            free_text,
        } in response.fields
        {
            let extraction = if verified {
                ExtractionMethod::ProviderVerified
            } else if free_text {
                ExtractionMethod::FreeText
            } else {
                ExtractionMethod::Structured
            };

            if result.add_field(DiscoveredField {
                field,
                value,
                source: provider.source(),
                provider: provider.name().to_string(),
                stage,
                extraction,
                discovered_at: now,
            }) {
                kept += 1;
            }
        }
        debug!(record_id = %result.record_id, provider = provider.name(), %stage, kept, "Stage returned fields");
        kept
    }

    fn finish(&self, result: EnrichmentResult, tier: Tier) -> EnrichmentResult {
        let result = result.finish();
        info!(
            record_id = %result.record_id,
            tier = %tier,
            fields = result.fields.len(),
            stages = result.stages_run.len(),
            cost = result.cost,
            outcome = ?result.outcome,
            "Cascade complete"
        );
        result
    }

    /// A field counts as filled when this run discovered it, or (outside
    /// refresh mode) when the record already holds it.
    fn is_filled(record: &ProfileRecord, result: &EnrichmentResult, field: EnrichableField, refresh: bool) -> bool {
        result.has_field(field) || (!refresh && record.is_filled(field))
    }

    fn required_satisfied(&self, record: &ProfileRecord, result: &EnrichmentResult, refresh: bool) -> bool {
        self.settings
            .required_fields
            .iter()
            .all(|field| Self::is_filled(record, result, *field, refresh))
    }

    fn contact_gap(&self, record: &ProfileRecord, result: &EnrichmentResult, refresh: bool) -> bool {
        EnrichableField::contact_fields()
            .iter()
            .any(|field| !Self::is_filled(record, result, *field, refresh))
    }

    fn wanted_fields(&self, record: &ProfileRecord, result: &EnrichmentResult, refresh: bool) -> Vec<EnrichableField> {
        EnrichableField::iter()
            .filter(|field| !Self::is_filled(record, result, *field, refresh))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::models::{EnrichmentOutcome, FieldValue, ProfileRecord, Source};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Scripted provider that plays back queued responses and logs calls
    struct Scripted {
        name: &'static str,
        source: Source,
        responses: Mutex<Vec<Result<ProviderResponse, ProviderError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(
            name: &'static str,
            source: Source,
            responses: Vec<Result<ProviderResponse, ProviderError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                source,
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            })
        }

        fn next(&self) -> Result<ProviderResponse, ProviderError> {
            *self.calls.lock() += 1;
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(ProviderResponse::empty())
            } else {
                responses.remove(0)
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    impl ProviderInfo for Scripted {
        fn name(&self) -> &str {
            self.name
        }
        fn source(&self) -> Source {
            self.source
        }
        fn estimated_cost(&self) -> f64 {
            0.5
        }
    }

    #[async_trait]
    impl SemanticResearchProvider for Scripted {
        async fn research(
            &self,
            _name: &str,
            _website: Option<&str>,
            _hints: &ResearchHints,
        ) -> Result<ProviderResponse, ProviderError> {
            self.next()
        }
    }

    #[async_trait]
    impl DirectoryContactProvider for Scripted {
        async fn lookup(
            &self,
            _name: &str,
            _company: Option<&str>,
            _domain: Option<&str>,
        ) -> Result<ProviderResponse, ProviderError> {
            self.next()
        }
    }

    #[async_trait]
    impl DeepResearchProvider for Scripted {
        async fn research(
            &self,
            _name: &str,
            _company: Option<&str>,
        ) -> Result<ProviderResponse, ProviderError> {
            self.next()
        }
    }

    fn engine(
        semantic: Option<Arc<Scripted>>,
        directory: Option<Arc<Scripted>>,
        deep: Option<Arc<Scripted>>,
    ) -> CascadeEngine {
        let providers = ProviderSet {
            semantic: semantic.map(|p| p as Arc<dyn SemanticResearchProvider>),
            directory: directory.map(|p| p as Arc<dyn DirectoryContactProvider>),
            deep: deep.map(|p| p as Arc<dyn DeepResearchProvider>),
        };
        let retry = RetryPolicy::new(RetryConfig {
            rate_limit_cooldown_ms: 1,
            rate_limit_jitter_ms: 0,
            backoff_unit_ms: 1,
            backoff_jitter_ms: 0,
            ..RetryConfig::default()
        });
        CascadeEngine::new(
            providers,
            retry,
            CascadeSettings {
                required_fields: vec![EnrichableField::Email, EnrichableField::WhatTheyDo],
                fill_only_tiers: vec![Tier::Tier0],
            },
        )
    }

    fn text(field: EnrichableField, value: &str) -> ProviderField {
        ProviderField::new(field, FieldValue::text(value))
    }

    #[tokio::test]
    async fn test_stops_when_required_fields_filled() {
        let semantic = Scripted::new(
            "semantic",
            Source::SemanticResearch,
            vec![Ok(ProviderResponse::empty()
                .with_field(text(EnrichableField::Email, "jane@acme.io").verified())
                .with_field(text(EnrichableField::WhatTheyDo, "Coaching"))
                .with_cost(0.1))],
        );
        let directory = Scripted::new("directory", Source::DirectoryApi, vec![]);

        let engine = engine(Some(semantic.clone()), Some(directory.clone()), None);
        let record = ProfileRecord::new("Jane").with_website("https://acme.io");
        let result = engine
            .enrich(&EnrichmentCandidate::new(record, Tier::Tier1), false)
            .await;

        assert_eq!(result.outcome, EnrichmentOutcome::Enriched);
        assert_eq!(result.fields.len(), 2);
        assert_eq!(directory.calls(), 0);
        assert!((result.cost - 0.1).abs() < 1e-9);
        assert_eq!(result.fields[0].extraction, ExtractionMethod::ProviderVerified);
    }

    #[tokio::test]
    async fn test_not_indexed_falls_through_to_directory() {
        let semantic = Scripted::new(
            "semantic",
            Source::SemanticResearch,
            vec![Err(ProviderError::NotIndexed("unknown site".to_string()))],
        );
        let directory = Scripted::new(
            "directory",
            Source::DirectoryApi,
            vec![Ok(ProviderResponse::empty()
                .with_field(text(EnrichableField::Email, "jane@acme.io"))
                .with_field(ProviderField::new(EnrichableField::ListSize, FieldValue::Count(4_000))))],
        );

        let engine = engine(Some(semantic.clone()), Some(directory.clone()), None);
        let record = ProfileRecord::new("Jane").with_website("https://acme.io");
        let result = engine
            .enrich(&EnrichmentCandidate::new(record, Tier::Tier2), false)
            .await;

        assert_eq!(semantic.calls(), 1);
        assert_eq!(directory.calls(), 1);
        // Every returned field is captured, not only the contact one
        assert!(result.has_field(EnrichableField::ListSize));
        assert!(result.failures.is_empty());
        // No reported cost: falls back to the static estimate
        assert!((result.cost - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_later_stage_values_are_kept_alongside_earlier_ones() {
        let semantic = Scripted::new(
            "semantic",
            Source::SemanticResearch,
            vec![Ok(ProviderResponse::empty()
                .with_field(text(EnrichableField::Email, "guess@acme.io")))],
        );
        let directory = Scripted::new(
            "directory",
            Source::DirectoryApi,
            vec![Ok(ProviderResponse::empty()
                .with_field(text(EnrichableField::Email, "jane@acme.io").verified()))],
        );

        let engine = engine(Some(semantic), Some(directory.clone()), None);
        let record = ProfileRecord::new("Jane").with_website("https://acme.io");
        let result = engine
            .enrich(&EnrichmentCandidate::new(record, Tier::Tier1), false)
            .await;

        assert_eq!(directory.calls(), 1);
        let emails: Vec<(Source, ExtractionMethod)> = result
            .fields
            .iter()
            .filter(|f| f.field == EnrichableField::Email)
            .map(|f| (f.source, f.extraction))
            .collect();
        assert_eq!(
            emails,
            vec![
                (Source::SemanticResearch, ExtractionMethod::Structured),
                (Source::DirectoryApi, ExtractionMethod::ProviderVerified),
            ]
        );
    }

    #[tokio::test]
    async fn test_deep_fallback_only_without_website() {
        let deep = Scripted::new("deep", Source::DeepResearch, vec![]);
        let engine = engine(None, None, Some(deep.clone()));

        let with_site = ProfileRecord::new("A").with_website("https://a.io");
        engine
            .enrich(&EnrichmentCandidate::new(with_site, Tier::Tier3), false)
            .await;
        assert_eq!(deep.calls(), 0);

        let bare = ProfileRecord::new("B");
        let result = engine
            .enrich(&EnrichmentCandidate::new(bare, Tier::Tier5), false)
            .await;
        assert_eq!(deep.calls(), 1);
        assert_eq!(result.outcome, EnrichmentOutcome::NoEnrichmentFound);
    }

    #[tokio::test]
    async fn test_permanent_error_is_recorded() {
        let semantic = Scripted::new(
            "semantic",
            Source::SemanticResearch,
            vec![Err(ProviderError::Permanent("401".to_string()))],
        );
        let engine = engine(Some(semantic.clone()), None, None);

        let result = engine
            .enrich(
                &EnrichmentCandidate::new(ProfileRecord::new("A").with_website("https://a.io"), Tier::Tier3),
                false,
            )
            .await;

        assert_eq!(semantic.calls(), 1);
        assert_eq!(result.outcome, EnrichmentOutcome::Failed);
        assert_eq!(result.failures[0].class, "permanent");
    }

    #[tokio::test]
    async fn test_credits_exhausted_stops_cascade() {
        let semantic = Scripted::new(
            "semantic",
            Source::SemanticResearch,
            vec![Err(ProviderError::CreditsExhausted("0 left".to_string()))],
        );
        let directory = Scripted::new("directory", Source::DirectoryApi, vec![]);
        let engine = engine(Some(semantic), Some(directory.clone()), None);

        let result = engine
            .enrich(&EnrichmentCandidate::new(ProfileRecord::new("A"), Tier::Tier5), false)
            .await;

        assert!(result.credits_exhausted);
        assert_eq!(directory.calls(), 0);
    }

    #[tokio::test]
    async fn test_fill_only_mapping() {
        let engine = engine(None, None, None);
        assert!(engine.is_fill_only(Tier::Tier0, false));
        assert!(!engine.is_fill_only(Tier::Tier0, true));
        assert!(!engine.is_fill_only(Tier::Tier2, false));
    }

    #[tokio::test]
    async fn test_enrich_field_skips_excluded_provider() {
        let semantic = Scripted::new(
            "semantic",
            Source::SemanticResearch,
            vec![Ok(ProviderResponse::empty().with_field(text(EnrichableField::Email, "bad@x.io")))],
        );
        let directory = Scripted::new(
            "directory",
            Source::DirectoryApi,
            vec![Ok(ProviderResponse::empty()
                .with_field(text(EnrichableField::Email, "jane@acme.io"))
                .with_field(text(EnrichableField::Phone, "+1 415 555 0199")))],
        );
        let engine = engine(Some(semantic.clone()), Some(directory), None);

        let result = engine
            .enrich_field(&ProfileRecord::new("Jane"), EnrichableField::Email, "semantic")
            .await;

        assert_eq!(semantic.calls(), 0);
        assert_eq!(result.fields.len(), 1);
        assert_eq!(result.fields[0].value, FieldValue::text("jane@acme.io"));
    }
}
