use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};

/// Origin of a field value
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Source {
    /// Supplied by the client who owns the profile
    ClientProvided,
    /// Corrected by hand by an operator
    Manual,
    /// Semantic web-research provider
    SemanticResearch,
    /// Directory / contact-lookup API
    DirectoryApi,
    /// Broad web search plus extraction
    DeepResearch,
    /// Legacy values with no recorded origin
    Unknown,
}

/// Total order over sources, expressed as integer ranks (higher wins).
///
/// The table is configurable so deployments can decide whether, for example,
/// the directory API outranks semantic research.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourcePriority {
    ranks: HashMap<Source, u8>,
}

impl SourcePriority {
    /// Build from an explicit rank table. Sources missing from the table rank 0.
    pub fn new(ranks: HashMap<Source, u8>) -> Self {
        Self { ranks }
    }

    /// Rank of a source
    pub fn rank(&self, source: Source) -> u8 {
        self.ranks.get(&source).copied().unwrap_or(0)
    }

    /// Override a single rank
    pub fn with_rank(mut self, source: Source, rank: u8) -> Self {
        self.ranks.insert(source, rank);
        self
    }

    /// Highest rank in the table, used to normalize confidence
    pub fn max_rank(&self) -> u8 {
        Source::iter().map(|s| self.rank(s)).max().unwrap_or(0)
    }
}

impl Default for SourcePriority {
    fn default() -> Self {
        let ranks = HashMap::from([
            (Source::ClientProvided, 100),
            (Source::Manual, 90),
            (Source::SemanticResearch, 70),
            (Source::DirectoryApi, 60),
            (Source::DeepResearch, 40),
            (Source::Unknown, 10),
        ]);
        Self { ranks }
    }
}

/// Decayable trust signal attached to contact fields
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceScore {
    /// Confidence in [0, 1]
    pub confidence: f64,

    /// When downstream consumers should treat the value as stale
    pub expires_at: DateTime<Utc>,
}

impl ConfidenceScore {
    /// Whether the score has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Per-field provenance entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldProvenance {
    /// Source that last won the priority comparison for this field
    pub source: Source,

    /// When the winning value was written
    pub updated_at: DateTime<Utc>,

    /// Enrichment pipeline version that wrote the value
    pub pipeline_version: u32,

    /// Confidence annotation (contact fields only)
    #[serde(default)]
    pub confidence: Option<ConfidenceScore>,
}

impl FieldProvenance {
    pub fn new(source: Source, updated_at: DateTime<Utc>, pipeline_version: u32) -> Self {
        Self {
            source,
            updated_at,
            pipeline_version,
            confidence: None,
        }
    }

    /// Whether the entry is older than `horizon` relative to `now`
    pub fn is_stale(&self, now: DateTime<Utc>, horizon: chrono::Duration) -> bool {
        now - self.updated_at > horizon
    }
}
