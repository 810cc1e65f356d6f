use crate::enrichment::cascade::CascadeEngine;
use crate::metrics::CANDIDATES_TOTAL;
use crate::models::{EnrichmentCandidate, EnrichmentOutcome, EnrichmentResult};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Run-scoped counters, shared by reference between tasks
#[derive(Debug)]
pub struct RunStats {
    attempted: AtomicU64,
    enriched: AtomicU64,
    not_found: AtomicU64,
    failed: AtomicU64,
    quarantined: AtomicU64,
    fields_written: AtomicU64,
    fields_rejected: AtomicU64,
    persistence_failures: AtomicU64,
    costs: Mutex<BTreeMap<String, f64>>,
    started: Instant,
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            attempted: AtomicU64::new(0),
            enriched: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            fields_written: AtomicU64::new(0),
            fields_rejected: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            costs: Mutex::new(BTreeMap::new()),
            started: Instant::now(),
        }
    }

    /// Count a finished cascade
    pub fn record_result(&self, result: &EnrichmentResult) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        let label = match result.outcome {
            EnrichmentOutcome::Enriched => {
                self.enriched.fetch_add(1, Ordering::Relaxed);
                "enriched"
            }
            EnrichmentOutcome::NoEnrichmentFound => {
                self.not_found.fetch_add(1, Ordering::Relaxed);
                "not_found"
            }
            EnrichmentOutcome::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                "failed"
            }
        };
        CANDIDATES_TOTAL.with_label_values(&[label]).inc();

        let mut costs = self.costs.lock();
        for (provider, cost) in &result.cost_by_provider {
            *costs.entry(provider.clone()).or_insert(0.0) += cost;
        }
    }

    /// Count a task that never produced a result
    pub fn record_crash(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        CANDIDATES_TOTAL.with_label_values(&["failed"]).inc();
    }

    pub fn add_quarantined(&self, n: u64) {
        self.quarantined.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_fields_written(&self, n: u64) {
        self.fields_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_fields_rejected(&self, n: u64) {
        self.fields_rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_persistence_failures(&self, n: u64) {
        self.persistence_failures.fetch_add(n, Ordering::Relaxed);
    }

    pub fn attempted(&self) -> u64 {
        self.attempted.load(Ordering::Relaxed)
    }

    pub fn total_cost(&self) -> f64 {
        self.costs.lock().values().sum()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log rate, cost so far and ETA
    pub fn log_progress(&self, total: usize) {
        let done = self.attempted();
        let elapsed = self.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 { done as f64 / elapsed } else { 0.0 };
        let remaining = (total as u64).saturating_sub(done);
        let eta_secs = if rate > 0.0 {
            (remaining as f64 / rate).round() as u64
        } else {
            0
        };

        info!(
            done,
            total,
            enriched = self.enriched.load(Ordering::Relaxed),
            failed = self.failed.load(Ordering::Relaxed),
            rate_per_sec = format!("{:.2}", rate),
            cost = format!("{:.4}", self.total_cost()),
            eta_secs,
            "Enrichment progress"
        );
    }

    /// Freeze the counters into a report
    pub fn report(&self, cancelled: bool) -> RunReport {
        let cost_by_provider = self.costs.lock().clone();
        RunReport {
            attempted: self.attempted(),
            enriched: self.enriched.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            fields_written: self.fields_written.load(Ordering::Relaxed),
            fields_rejected: self.fields_rejected.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            total_cost: cost_by_provider.values().sum(),
            cost_by_provider,
            duration_secs: self.elapsed().as_secs_f64(),
            cancelled,
        }
    }
}

/// Totals of a completed run; always produced, even when candidates failed
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub attempted: u64,
    pub enriched: u64,
    pub not_found: u64,
    pub failed: u64,
    pub quarantined: u64,
    pub fields_written: u64,
    pub fields_rejected: u64,
    pub persistence_failures: u64,
    pub total_cost: f64,
    pub cost_by_provider: BTreeMap<String, f64>,
    pub duration_secs: f64,
    /// Dispatch stopped early (credits exhausted or credit cap reached)
    pub cancelled: bool,
}

/// Scheduler knobs
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub concurrency: usize,
    pub sub_batch_size: usize,
    pub task_timeout: Duration,
    pub credit_cap: Option<f64>,
}

/// Bounded-concurrency runner over candidates
pub struct Scheduler {
    cascade: Arc<CascadeEngine>,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    cancelled: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(cascade: Arc<CascadeEngine>, settings: SchedulerSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            cascade,
            settings,
            permits,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Batch-wide stop flag; set on credit exhaustion or when the cap is hit
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Stop dispatching new tasks; in-flight tasks still finish
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn over_budget(&self, stats: &RunStats) -> bool {
        matches!(self.settings.credit_cap, Some(cap) if stats.total_cost() >= cap)
    }

    /// `RunBatch(candidates, concurrency)`: every sub-batch in turn.
    ///
    /// Each sub-batch's results go to `on_sub_batch` before the next one is
    /// dispatched. An error from it cancels the batch and is returned.
    pub async fn run_batch<F, Fut>(
        &self,
        candidates: Vec<EnrichmentCandidate>,
        refresh: bool,
        stats: &Arc<RunStats>,
        mut on_sub_batch: F,
    ) -> crate::error::Result<()>
    where
        F: FnMut(Vec<EnrichmentResult>) -> Fut,
        Fut: Future<Output = crate::error::Result<()>>,
    {
        let total = candidates.len();

        for chunk in candidates.chunks(self.settings.sub_batch_size.max(1)) {
            if self.is_cancelled() {
                break;
            }

            let results = self.run_sub_batch(chunk.to_vec(), refresh, stats).await;
            if let Err(e) = on_sub_batch(results).await {
                self.cancel();
                return Err(e);
            }
            stats.log_progress(total);
        }

        Ok(())
    }

    /// Fan one sub-batch out over the worker pool
    pub async fn run_sub_batch(
        &self,
        chunk: Vec<EnrichmentCandidate>,
        refresh: bool,
        stats: &Arc<RunStats>,
    ) -> Vec<EnrichmentResult> {
        let mut tasks = JoinSet::new();

        for candidate in chunk {
            if self.is_cancelled() || self.over_budget(stats) {
                self.cancel();
                warn!("Dispatch stopped: provider credits exhausted or credit cap reached");
                break;
            }

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Scheduler semaphore closed: {}", e);
                    break;
                }
            };

            // Re-check after waiting for a slot
            if self.is_cancelled() || self.over_budget(stats) {
                self.cancel();
                break;
            }

            let cascade = Arc::clone(&self.cascade);
            let stats = Arc::clone(stats);
            let cancelled = Arc::clone(&self.cancelled);
            let credit_cap = self.settings.credit_cap;
            let task_timeout = self.settings.task_timeout;

            tasks.spawn(async move {
                let _permit = permit;
                let record_id = candidate.id();

                let run = tokio::time::timeout(task_timeout, cascade.enrich(&candidate, refresh));
                let outcome = AssertUnwindSafe(run).catch_unwind().await;

                match outcome {
                    Ok(Ok(result)) => {
                        stats.record_result(&result);
                        if result.credits_exhausted
                            || matches!(credit_cap, Some(cap) if stats.total_cost() >= cap)
                        {
                            cancelled.store(true, Ordering::SeqCst);
                        }
                        Some(result)
                    }
                    Ok(Err(_)) => {
                        warn!(record_id = %record_id, timeout_secs = task_timeout.as_secs(), "Cascade timed out");
                        stats.record_crash();
                        None
                    }
                    Err(panic) => {
                        error!(record_id = %record_id, panic = %panic_message(panic.as_ref()), "Cascade task panicked");
                        stats.record_crash();
                        None
                    }
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => {
                    error!("Cascade task aborted: {}", e);
                    stats.record_crash();
                }
            }
        }
        results
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
