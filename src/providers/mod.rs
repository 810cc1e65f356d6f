//! Research provider contracts.
//!
//! The concrete providers (semantic web research, contact directory, deep
//! web research) are external collaborators. The orchestrator only sees the
//! three traits below, all sharing one response shape: a structured field
//! map, an optional reported cost, and a classified error.

pub mod http;

use crate::models::{EnrichableField, FieldValue, Source};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::{HttpProvider, HttpProviderConfig};

/// Errors a provider call can surface
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Explicit rate-limit response
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Auth failure, resource not found, malformed request
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// The provider has no index entry for the subject
    #[error("not indexed: {0}")]
    NotIndexed(String),

    /// The account has no credits left
    #[error("credits exhausted: {0}")]
    CreditsExhausted(String),

    /// Anything else (timeouts, 5xx, connection resets)
    #[error("transient failure: {0}")]
    Transient(String),
}

/// Retry classification of a provider error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimited,
    Permanent,
    NotIndexed,
    CreditsExhausted,
    Transient,
}

impl ProviderError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            ProviderError::RateLimited(_) => ErrorClass::RateLimited,
            ProviderError::Permanent(_) => ErrorClass::Permanent,
            ProviderError::NotIndexed(_) => ErrorClass::NotIndexed,
            ProviderError::CreditsExhausted(_) => ErrorClass::CreditsExhausted,
            ProviderError::Transient(_) => ErrorClass::Transient,
        }
    }

    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self.classify() {
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Permanent => "permanent",
            ErrorClass::NotIndexed => "not_indexed",
            ErrorClass::CreditsExhausted => "credits_exhausted",
            ErrorClass::Transient => "transient",
        }
    }
}

/// A field value returned by a provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderField {
    pub field: EnrichableField,
    pub value: FieldValue,
    /// The provider matched the value against its own records
    #[serde(default)]
    pub verified: bool,
    /// The value was extracted from unstructured text
    #[serde(default)]
    pub free_text: bool,
}

impl ProviderField {
    pub fn new(field: EnrichableField, value: FieldValue) -> Self {
        Self {
            field,
            value,
            verified: false,
            free_text: false,
        }
    }

    pub fn verified(mut self) -> Self {
        self.verified = true;
        self
    }

    pub fn free_text(mut self) -> Self {
        self.free_text = true;
        self
    }
}

/// Shared response shape of all providers
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderResponse {
    pub fields: Vec<ProviderField>,
    /// Cost reported by the provider for this call, if any
    pub cost: Option<f64>,
}

impl ProviderResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: ProviderField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }
}

/// Hints forwarded to semantic research
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchHints {
    pub company: Option<String>,
    pub directory_handle: Option<String>,
    /// Fields the caller still needs
    pub wanted: Vec<EnrichableField>,
}

/// Common identity of a provider
pub trait ProviderInfo: Send + Sync {
    /// Name used in logs, metrics and cost accounting
    fn name(&self) -> &str;

    /// Provenance source recorded for values from this provider
    fn source(&self) -> Source;

    /// Static per-call estimate used when the provider reports no cost
    fn estimated_cost(&self) -> f64 {
        0.0
    }
}

/// Semantic web-research provider
#[async_trait]
pub trait SemanticResearchProvider: ProviderInfo {
    async fn research(
        &self,
        name: &str,
        website: Option<&str>,
        hints: &ResearchHints,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Directory / contact-lookup provider
#[async_trait]
pub trait DirectoryContactProvider: ProviderInfo {
    async fn lookup(
        &self,
        name: &str,
        company: Option<&str>,
        domain: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Deep web-research fallback provider
#[async_trait]
pub trait DeepResearchProvider: ProviderInfo {
    async fn research(
        &self,
        name: &str,
        company: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError>;
}
