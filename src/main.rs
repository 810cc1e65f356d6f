use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use profile_enricher::{
    config::{Config, ObservabilityConfig},
    enrichment::{EnrichmentService, RunOptions},
    metrics,
    models::{
        EnrichableField, FieldProvenance, PartnershipEntry, PriorityMode, ProfileRecord, Source,
        Tier,
    },
    state::create_store,
};
use serde::Deserialize;
use std::path::PathBuf;
use strum::IntoEnumIterator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "profile-enricher")]
#[command(about = "Profile Enrichment Orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (overrides PROFILE_ENRICHER_CONFIG)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print Prometheus metrics when the command finishes
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Select candidates and enrich them
    Run {
        /// Maximum number of candidates
        #[arg(short, long)]
        limit: Option<usize>,

        /// Simultaneous cascades
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Selection mode (tiered or refresh)
        #[arg(short, long, default_value = "tiered")]
        mode: PriorityMode,

        /// Only these tiers (0-5, repeatable)
        #[arg(short, long = "tier", value_parser = parse_tier)]
        tiers: Vec<Tier>,

        /// Refresh horizon in days
        #[arg(long)]
        staleness_days: Option<i64>,

        /// Stop dispatching once this much provider credit is spent
        #[arg(long)]
        credit_cap: Option<f64>,

        /// Candidates per sub-batch
        #[arg(long)]
        sub_batch_size: Option<usize>,

        /// Report tiers and gate findings without calling providers
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect or retry quarantined values
    Quarantine {
        #[command(subcommand)]
        action: QuarantineAction,
    },

    /// Load profile records from a JSON array
    Seed {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum QuarantineAction {
    /// List pending entries
    List {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Ask a different provider for each pending field
    Retry {
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
}

/// Minimal record shape accepted by `seed`
#[derive(Debug, Deserialize)]
struct SeedProfile {
    name: String,
    #[serde(default)]
    company: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    website: Option<String>,
    #[serde(default)]
    directory_handle: Option<String>,
    #[serde(default)]
    what_they_do: Option<String>,
    #[serde(default)]
    who_they_serve: Option<String>,
    #[serde(default)]
    seeking: Option<String>,
    #[serde(default)]
    offering: Option<String>,
    #[serde(default)]
    niche: Option<String>,
    #[serde(default)]
    list_size: Option<u64>,
    #[serde(default)]
    social_reach: Option<u64>,
    #[serde(default)]
    partnerships: Vec<PartnershipEntry>,
}

impl SeedProfile {
    /// Imported values count as client-provided
    fn into_record(self) -> ProfileRecord {
        let mut record = ProfileRecord::new(self.name);
        record.company = self.company;
        record.email = self.email;
        record.phone = self.phone;
        record.website = self.website;
        record.directory_handle = self.directory_handle;
        record.what_they_do = self.what_they_do;
        record.who_they_serve = self.who_they_serve;
        record.seeking = self.seeking;
        record.offering = self.offering;
        record.niche = self.niche;
        record.list_size = self.list_size;
        record.social_reach = self.social_reach;
        record.partnerships = self.partnerships;

        let now = Utc::now();
        for field in EnrichableField::iter() {
            if record.is_filled(field) {
                record
                    .provenance
                    .insert(field, FieldProvenance::new(Source::ClientProvided, now, 0));
            }
        }
        record
    }
}

fn parse_tier(raw: &str) -> Result<Tier, String> {
    let raw = raw.trim().to_lowercase();
    let digits = raw.trim_start_matches("tier");
    digits
        .parse::<u8>()
        .ok()
        .and_then(Tier::from_u8)
        .ok_or_else(|| format!("unknown tier '{}' (expected 0-5)", raw))
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("profile_enricher={}", observability.log_level).into()
    });

    // Logs go to stderr so reports on stdout stay machine-readable
    if observability.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.observability);

    tracing::info!("Starting Profile Enricher v{}", env!("CARGO_PKG_VERSION"));

    config.validate().context("Invalid configuration")?;

    if let Err(e) = metrics::init_metrics() {
        tracing::warn!("Failed to initialize metrics: {}", e);
    }

    let store_url = config.store.url.clone().unwrap_or_default();
    let stores = create_store(&store_url).context("Failed to open record store")?;

    match cli.command {
        Commands::Run {
            limit,
            concurrency,
            mode,
            tiers,
            staleness_days,
            credit_cap,
            sub_batch_size,
            dry_run,
        } => {
            let service = EnrichmentService::from_config(config, stores)?;
            let options = RunOptions {
                limit,
                concurrency,
                mode,
                tier_filter: tiers,
                staleness_horizon: staleness_days.map(chrono::Duration::days),
                credit_cap,
                sub_batch_size,
            };

            if dry_run {
                let plan = service.dry_run(&options).await?;
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                let report = service.run(&options).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
        Commands::Quarantine { action } => {
            let service = EnrichmentService::from_config(config, stores)?;
            match action {
                QuarantineAction::List { limit } => {
                    let pending = service.pending_quarantine(limit).await?;
                    println!("{}", serde_json::to_string_pretty(&pending)?);
                }
                QuarantineAction::Retry { limit } => {
                    let report = service.retry_quarantined(limit).await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
            }
        }
        Commands::Seed { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let profiles: Vec<SeedProfile> =
                serde_json::from_str(&raw).context("Seed file must be a JSON array of profiles")?;

            let mut loaded = 0usize;
            for profile in profiles {
                let record = profile.into_record();
                match stores.records.save_record(&record).await {
                    Ok(()) => loaded += 1,
                    Err(e) => tracing::warn!(name = %record.name, error = %e, "Skipping invalid profile"),
                }
            }
            tracing::info!(loaded, "✅ Seed complete");
        }
    }

    if cli.print_metrics {
        print!("{}", metrics::gather_metrics());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tier() {
        assert_eq!(parse_tier("0"), Ok(Tier::Tier0));
        assert_eq!(parse_tier("tier4"), Ok(Tier::Tier4));
        assert!(parse_tier("9").is_err());
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::parse_from([
            "profile-enricher",
            "run",
            "--limit",
            "10",
            "--mode",
            "refresh",
            "-t",
            "1",
            "-t",
            "2",
            "--dry-run",
        ]);
        match cli.command {
            Commands::Run {
                limit,
                mode,
                tiers,
                dry_run,
                ..
            } => {
                assert_eq!(limit, Some(10));
                assert_eq!(mode, PriorityMode::Refresh);
                assert_eq!(tiers, vec![Tier::Tier1, Tier::Tier2]);
                assert!(dry_run);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_seed_marks_client_provenance() {
        let profiles: Vec<SeedProfile> =
            serde_json::from_str(r#"[{"name": "Ada", "email": "ada@lovelace.dev"}]"#).unwrap();
        let record = profiles.into_iter().next().unwrap().into_record();

        assert_eq!(
            record.provenance.get(&EnrichableField::Email).map(|p| p.source),
            Some(Source::ClientProvided)
        );
        assert!(!record.provenance.contains_key(&EnrichableField::Phone));
    }

    #[test]
    fn test_seed_carries_every_description_field() {
        let profiles: Vec<SeedProfile> = serde_json::from_str(
            r#"[{
                "name": "Ada",
                "what_they_do": "Engine consulting",
                "who_they_serve": "Inventors",
                "seeking": "Podcast guests",
                "offering": "Workshops",
                "niche": "Computing"
            }]"#,
        )
        .unwrap();
        let record = profiles.into_iter().next().unwrap().into_record();

        assert_eq!(record.seeking.as_deref(), Some("Podcast guests"));
        assert_eq!(record.offering.as_deref(), Some("Workshops"));
        for field in [
            EnrichableField::WhatTheyDo,
            EnrichableField::WhoTheyServe,
            EnrichableField::Seeking,
            EnrichableField::Offering,
            EnrichableField::Niche,
        ] {
            assert_eq!(
                record.provenance.get(&field).map(|p| p.source),
                Some(Source::ClientProvided),
                "{}",
                field
            );
        }
    }
}
