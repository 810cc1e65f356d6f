//! Profile Enrichment Orchestrator
//!
//! Fills missing attributes on business-profile records from external
//! research providers without letting a weaker source overwrite a stronger
//! one.

pub mod config;
pub mod enrichment;
pub mod error;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod state;

pub use config::Config;
pub use enrichment::{EnrichmentService, RunOptions, RunReport};
pub use error::{AppError, Result};
