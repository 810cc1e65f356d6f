//! Profile enrichment pipeline
//!
//! - Tiered candidate selection
//! - Provider cascade with classified retry
//! - Verification gate and quarantine
//! - Confidence scoring for contact fields
//! - Source-priority merge and batched persistence

pub mod cascade;
pub mod confidence;
pub mod gate;
pub mod merge;
pub mod persistence;
pub mod retry;
pub mod scheduler;
pub mod selector;
pub mod service;

pub use cascade::{CascadeEngine, CascadeSettings, ProviderSet};
pub use confidence::ConfidenceScorer;
pub use gate::{GateVerdict, VerificationGate, VerificationStatus};
pub use merge::{apply_update, FieldWrite, MergeOutcome, MergePolicy, RecordUpdate, RejectReason};
pub use persistence::{PersistenceReport, Persister};
pub use retry::RetryPolicy;
pub use scheduler::{RunReport, RunStats, Scheduler, SchedulerSettings};
pub use selector::{CandidateSelector, SelectionRequest};
pub use service::{
    build_providers, DryRunPlan, EnrichmentService, GateFinding, QuarantineRetryReport,
    RunOptions,
};
