//! Common test utilities: scripted providers and store fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use profile_enricher::{
    config::Config,
    models::{EnrichableField, FieldValue, Source},
    providers::{
        DeepResearchProvider, DirectoryContactProvider, ProviderError, ProviderField,
        ProviderInfo, ProviderResponse, ResearchHints, SemanticResearchProvider,
    },
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Responder = Box<dyn Fn(&str) -> Result<ProviderResponse, ProviderError> + Send + Sync>;

/// Provider fake that answers every role from one closure keyed by subject name
pub struct FakeProvider {
    name: String,
    source: Source,
    respond: Responder,
    calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new<F>(name: &str, source: Source, respond: F) -> Arc<Self>
    where
        F: Fn(&str) -> Result<ProviderResponse, ProviderError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            name: name.to_string(),
            source,
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        })
    }

    /// Same fields for every subject
    pub fn fixed(name: &str, source: Source, fields: Vec<ProviderField>) -> Arc<Self> {
        Self::new(name, source, move |_| {
            Ok(ProviderResponse {
                fields: fields.clone(),
                cost: Some(0.01),
            })
        })
    }

    /// Never finds anything
    pub fn empty(name: &str, source: Source) -> Arc<Self> {
        Self::fixed(name, source, Vec::new())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self, subject: &str) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(subject)
    }
}

impl ProviderInfo for FakeProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Source {
        self.source
    }

    fn estimated_cost(&self) -> f64 {
        0.01
    }
}

#[async_trait]
impl SemanticResearchProvider for FakeProvider {
    async fn research(
        &self,
        name: &str,
        _website: Option<&str>,
        _hints: &ResearchHints,
    ) -> Result<ProviderResponse, ProviderError> {
        self.answer(name)
    }
}

#[async_trait]
impl DirectoryContactProvider for FakeProvider {
    async fn lookup(
        &self,
        name: &str,
        _company: Option<&str>,
        _domain: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        self.answer(name)
    }
}

#[async_trait]
impl DeepResearchProvider for FakeProvider {
    async fn research(
        &self,
        name: &str,
        _company: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        self.answer(name)
    }
}

/// Text field helper
pub fn text(field: EnrichableField, value: &str) -> ProviderField {
    ProviderField::new(field, FieldValue::text(value))
}

/// In-memory configuration with fast retries
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.store.url = Some("memory://".to_string());
    config.retry.rate_limit_cooldown_ms = 1;
    config.retry.rate_limit_jitter_ms = 0;
    config.retry.backoff_unit_ms = 1;
    config.retry.backoff_jitter_ms = 0;
    config
}
