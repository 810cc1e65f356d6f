use crate::models::{EnrichableField, Source, SourcePriority, Tier};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Record store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Research provider configuration
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Enrichment run configuration
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Candidate selection configuration
    #[serde(default)]
    pub selector: SelectorConfig,

    /// Provider retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Verification gate configuration
    #[serde(default)]
    pub gate: GateConfig,

    /// Confidence scoring configuration
    #[serde(default)]
    pub confidence: ConfidenceConfig,

    /// Source priority ranks
    #[serde(default)]
    pub priority: SourcePriority,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the embedded defaults, an optional file and environment
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let config_path = path
            .map(|p| p.to_string_lossy().to_string())
            .or_else(|| std::env::var("PROFILE_ENRICHER_CONFIG").ok())
            .unwrap_or_else(|| "config/local.toml".to_string());

        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(&config_path).required(false))
            // Override with environment variables (prefix: PROFILE_ENRICHER__)
            .add_source(
                config::Environment::with_prefix("PROFILE_ENRICHER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Check required inputs and resource sizing
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::AppError;

        match self.store.url.as_deref() {
            Some(url) if !url.trim().is_empty() => {}
            _ => {
                return Err(AppError::Configuration(
                    "store.url is required (memory:// or sled://<path>)".to_string(),
                ))
            }
        }

        if self.enrichment.concurrency == 0 {
            return Err(AppError::Configuration(
                "enrichment.concurrency must be at least 1".to_string(),
            ));
        }

        self.store.check_pool_size(self.enrichment.concurrency)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            providers: ProvidersConfig::default(),
            enrichment: EnrichmentConfig::default(),
            selector: SelectorConfig::default(),
            retry: RetryConfig::default(),
            gate: GateConfig::default(),
            confidence: ConfidenceConfig::default(),
            priority: SourcePriority::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection string: `memory://` or `sled://<path>`
    pub url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Headroom the pool must keep above the concurrency degree
    #[serde(default = "default_pool_margin")]
    pub pool_margin: usize,
}

impl StoreConfig {
    /// The pool must cover every in-flight task plus a margin
    pub fn check_pool_size(&self, concurrency: usize) -> crate::error::Result<()> {
        let required = concurrency + self.pool_margin;
        if self.pool_size < required {
            return Err(crate::error::AppError::Configuration(format!(
                "store.pool_size ({}) must be at least concurrency ({}) + margin ({})",
                self.pool_size, concurrency, self.pool_margin
            )));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
            pool_margin: default_pool_margin(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    pub semantic: Option<ProviderSettings>,
    pub directory: Option<ProviderSettings>,
    pub deep: Option<ProviderSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Disable without removing the section
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// JSON endpoint
    pub endpoint: String,

    /// Environment variable holding the credential
    pub api_key_env: String,

    /// Provenance source recorded for this provider's values
    pub source: Option<Source>,

    /// Request timeout (seconds)
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Static per-call cost estimate
    #[serde(default)]
    pub cost_per_call: f64,
}

impl ProviderSettings {
    /// Resolve the credential; `None` disables the provider's stage
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Simultaneous in-flight cascades
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Candidates per sub-batch (progress + persistence granularity)
    #[serde(default = "default_sub_batch_size")]
    pub sub_batch_size: usize,

    /// Current enrichment pipeline version
    #[serde(default = "default_pipeline_version")]
    pub pipeline_version: u32,

    /// Age beyond which an equal-priority value may be overwritten (days)
    #[serde(default = "default_staleness_horizon_days")]
    pub staleness_horizon_days: i64,

    /// Fields that end the cascade once filled
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<EnrichableField>,

    /// Tiers that only fill empty fields outside refresh mode
    #[serde(default = "default_fill_only_tiers")]
    pub fill_only_tiers: Vec<Tier>,

    /// Stop dispatching once accumulated provider cost reaches this cap
    #[serde(default)]
    pub credit_cap: Option<f64>,

    /// Upper bound on one candidate's cascade (seconds)
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            sub_batch_size: default_sub_batch_size(),
            pipeline_version: default_pipeline_version(),
            staleness_horizon_days: default_staleness_horizon_days(),
            required_fields: default_required_fields(),
            fill_only_tiers: default_fill_only_tiers(),
            credit_cap: None,
            task_timeout_secs: default_task_timeout(),
        }
    }
}

impl EnrichmentConfig {
    pub fn staleness_horizon(&self) -> chrono::Duration {
        chrono::Duration::days(self.staleness_horizon_days)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Minimum audience for Tier 1
    #[serde(default = "default_tier1_min_audience")]
    pub tier1_min_audience: u64,

    /// Minimum audience for Tier 2
    #[serde(default = "default_tier2_min_audience")]
    pub tier2_min_audience: u64,

    /// Outreach fields whose absence makes a record a candidate
    #[serde(default = "default_key_fields")]
    pub key_fields: Vec<EnrichableField>,

    /// Fields added by newer pipeline versions (Tier 0 triggers)
    #[serde(default = "default_reenrich_fields")]
    pub reenrich_fields: Vec<EnrichableField>,

    /// Tiered mode skips records attempted more recently than this (hours)
    #[serde(default = "default_reattempt_cooldown_hours")]
    pub reattempt_cooldown_hours: i64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            tier1_min_audience: default_tier1_min_audience(),
            tier2_min_audience: default_tier2_min_audience(),
            key_fields: default_key_fields(),
            reenrich_fields: default_reenrich_fields(),
            reattempt_cooldown_hours: default_reattempt_cooldown_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per provider call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed cooldown after a rate-limit response (milliseconds)
    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,

    /// Jitter applied around the rate-limit cooldown (milliseconds, ±)
    #[serde(default = "default_rate_limit_jitter_ms")]
    pub rate_limit_jitter_ms: u64,

    /// Exponential base for transient errors
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    /// Unit the exponential term is expressed in (milliseconds)
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,

    /// Random jitter added to transient backoff (milliseconds)
    #[serde(default = "default_backoff_jitter_ms")]
    pub backoff_jitter_ms: u64,

    /// Cap on a single transient backoff (milliseconds)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
            rate_limit_jitter_ms: default_rate_limit_jitter_ms(),
            backoff_base: default_backoff_base(),
            backoff_unit_ms: default_backoff_unit_ms(),
            backoff_jitter_ms: default_backoff_jitter_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Confidence multiplier for values from lower-trust extraction paths
    #[serde(default = "default_unverified_multiplier")]
    pub unverified_confidence_multiplier: f64,

    /// Email domains that indicate placeholder or test data
    #[serde(default = "default_placeholder_domains")]
    pub placeholder_domains: Vec<String>,

    /// Email local parts that indicate placeholder data
    #[serde(default = "default_placeholder_local_parts")]
    pub placeholder_local_parts: Vec<String>,

    #[serde(default = "default_min_phone_digits")]
    pub min_phone_digits: usize,

    #[serde(default = "default_max_phone_digits")]
    pub max_phone_digits: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            unverified_confidence_multiplier: default_unverified_multiplier(),
            placeholder_domains: default_placeholder_domains(),
            placeholder_local_parts: default_placeholder_local_parts(),
            min_phone_digits: default_min_phone_digits(),
            max_phone_digits: default_max_phone_digits(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// Age at which confidence halves (days)
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,

    #[serde(default = "default_email_ttl_days")]
    pub email_ttl_days: i64,

    #[serde(default = "default_phone_ttl_days")]
    pub phone_ttl_days: i64,

    #[serde(default = "default_website_ttl_days")]
    pub website_ttl_days: i64,

    #[serde(default = "default_handle_ttl_days")]
    pub handle_ttl_days: i64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life_days(),
            email_ttl_days: default_email_ttl_days(),
            phone_ttl_days: default_phone_ttl_days(),
            website_ttl_days: default_website_ttl_days(),
            handle_ttl_days: default_handle_ttl_days(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

// Default value functions
fn default_pool_size() -> usize {
    16
}

fn default_pool_margin() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_concurrency() -> usize {
    8
}

fn default_sub_batch_size() -> usize {
    50
}

fn default_pipeline_version() -> u32 {
    3
}

fn default_staleness_horizon_days() -> i64 {
    90
}

fn default_required_fields() -> Vec<EnrichableField> {
    vec![EnrichableField::Email, EnrichableField::WhatTheyDo]
}

fn default_fill_only_tiers() -> Vec<Tier> {
    vec![Tier::Tier0]
}

fn default_task_timeout() -> u64 {
    300
}

fn default_tier1_min_audience() -> u64 {
    10_000
}

fn default_tier2_min_audience() -> u64 {
    1_000
}

fn default_key_fields() -> Vec<EnrichableField> {
    vec![
        EnrichableField::Email,
        EnrichableField::WhatTheyDo,
        EnrichableField::WhoTheyServe,
    ]
}

fn default_reenrich_fields() -> Vec<EnrichableField> {
    vec![
        EnrichableField::Seeking,
        EnrichableField::Offering,
        EnrichableField::Niche,
    ]
}

fn default_reattempt_cooldown_hours() -> i64 {
    72
}

fn default_max_attempts() -> u32 {
    3
}

fn default_rate_limit_cooldown_ms() -> u64 {
    30_000
}

fn default_rate_limit_jitter_ms() -> u64 {
    5_000
}

fn default_backoff_base() -> f64 {
    2.0
}

fn default_backoff_unit_ms() -> u64 {
    1_000
}

fn default_backoff_jitter_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_unverified_multiplier() -> f64 {
    0.7
}

fn default_placeholder_domains() -> Vec<String> {
    [
        "example.com",
        "example.org",
        "example.net",
        "test.com",
        "domain.com",
        "email.com",
        "yourdomain.com",
        "yoursite.com",
        "sentry.io",
        "wixpress.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_placeholder_local_parts() -> Vec<String> {
    ["test", "user", "name", "email", "you", "yourname", "firstname.lastname"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_min_phone_digits() -> usize {
    7
}

fn default_max_phone_digits() -> usize {
    15
}

fn default_half_life_days() -> f64 {
    365.0
}

fn default_email_ttl_days() -> i64 {
    180
}

fn default_phone_ttl_days() -> i64 {
    365
}

fn default_website_ttl_days() -> i64 {
    730
}

fn default_handle_ttl_days() -> i64 {
    365
}

fn default_log_level() -> String {
    "info".to_string()
}
