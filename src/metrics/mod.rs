//! Prometheus metrics for enrichment runs.
//!
//! Counters are process-wide and only ever incremented; per-run totals live
//! in the run-scoped `RunStats` struct instead.
//!
//! # Example
//! ```no_run
//! use profile_enricher::metrics::PROVIDER_CALLS_TOTAL;
//!
//! PROVIDER_CALLS_TOTAL
//!     .with_label_values(&["semantic", "success"])
//!     .inc();
//! ```

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry for all metrics
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    /// Candidates processed
    ///
    /// Labels: outcome (enriched, not_found, failed)
    pub static ref CANDIDATES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("candidates_total", "Candidates processed by outcome")
            .namespace("profile_enricher"),
        &["outcome"]
    ).expect("Failed to create CANDIDATES_TOTAL metric");

    /// Provider call attempts
    ///
    /// Labels: provider, status (success or error class)
    pub static ref PROVIDER_CALLS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("provider_calls_total", "Provider call attempts by status")
            .namespace("profile_enricher"),
        &["provider", "status"]
    ).expect("Failed to create PROVIDER_CALLS_TOTAL metric");

    /// Accumulated provider cost
    ///
    /// Labels: provider
    pub static ref PROVIDER_COST_TOTAL: CounterVec = CounterVec::new(
        Opts::new("provider_cost_total", "Accumulated provider cost")
            .namespace("profile_enricher"),
        &["provider"]
    ).expect("Failed to create PROVIDER_COST_TOTAL metric");

    /// Field writes accepted by the priority rule
    ///
    /// Labels: field
    pub static ref FIELDS_WRITTEN_TOTAL: CounterVec = CounterVec::new(
        Opts::new("fields_written_total", "Field writes accepted")
            .namespace("profile_enricher"),
        &["field"]
    ).expect("Failed to create FIELDS_WRITTEN_TOTAL metric");

    /// Field writes rejected by the priority rule
    ///
    /// Labels: reason
    pub static ref FIELDS_REJECTED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("fields_rejected_total", "Field writes rejected")
            .namespace("profile_enricher"),
        &["reason"]
    ).expect("Failed to create FIELDS_REJECTED_TOTAL metric");

    /// Values routed to the quarantine log
    ///
    /// Labels: field
    pub static ref FIELDS_QUARANTINED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("fields_quarantined_total", "Values quarantined by the gate")
            .namespace("profile_enricher"),
        &["field"]
    ).expect("Failed to create FIELDS_QUARANTINED_TOTAL metric");

    /// Record writes that failed even after per-record fallback
    pub static ref PERSISTENCE_FAILURES_TOTAL: Counter = Counter::with_opts(
        Opts::new("persistence_failures_total", "Records that could not be persisted")
            .namespace("profile_enricher")
    ).expect("Failed to create PERSISTENCE_FAILURES_TOTAL metric");

    /// Cascade stage latency in seconds
    ///
    /// Labels: stage
    pub static ref STAGE_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("stage_duration_seconds", "Cascade stage latency in seconds")
            .namespace("profile_enricher")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["stage"]
    ).expect("Failed to create STAGE_DURATION_SECONDS metric");
}

/// Register all metrics with the global registry
pub fn init_metrics() -> Result<(), prometheus::Error> {
    PROMETHEUS_REGISTRY.register(Box::new(CANDIDATES_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(PROVIDER_CALLS_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(PROVIDER_COST_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(FIELDS_WRITTEN_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(FIELDS_REJECTED_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(FIELDS_QUARANTINED_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(PERSISTENCE_FAILURES_TOTAL.clone()))?;
    PROMETHEUS_REGISTRY.register(Box::new(STAGE_DURATION_SECONDS.clone()))?;

    tracing::debug!("Prometheus metrics initialized");
    Ok(())
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Metrics output is not valid UTF-8: {}", e);
        String::from("# Error encoding metrics\n")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_after_init() {
        // Registration may already have happened in another test
        let _ = init_metrics();
        CANDIDATES_TOTAL.with_label_values(&["enriched"]).inc();

        let output = gather_metrics();
        assert!(output.contains("profile_enricher_candidates_total"));
    }
}
