use crate::config::ConfidenceConfig;
use crate::models::{ConfidenceScore, EnrichableField, Source, SourcePriority};
use chrono::{DateTime, Duration, Utc};

/// Computes decayable trust scores for contact fields
#[derive(Debug, Clone)]
pub struct ConfidenceScorer {
    config: ConfidenceConfig,
    priority: SourcePriority,
}

impl ConfidenceScorer {
    pub fn new(config: ConfidenceConfig, priority: SourcePriority) -> Self {
        Self { config, priority }
    }

    /// How long a score for `field` stays fresh. `None` for non-contact fields.
    pub fn ttl(&self, field: EnrichableField) -> Option<Duration> {
        let days = match field {
            EnrichableField::Email => self.config.email_ttl_days,
            EnrichableField::Phone => self.config.phone_ttl_days,
            EnrichableField::Website => self.config.website_ttl_days,
            EnrichableField::DirectoryHandle => self.config.handle_ttl_days,
            _ => return None,
        };
        Some(Duration::days(days))
    }

    /// Score a value of `field` from `source`, extracted at `extracted_at` and
    /// written at `written_at`.
    ///
    /// The base is the source rank normalized by the highest rank in the
    /// table; it halves every `half_life_days` of age at write time. Business
    /// description fields return `None`: their staleness is handled by the
    /// refresh horizon instead.
    pub fn score(
        &self,
        field: EnrichableField,
        source: Source,
        extracted_at: DateTime<Utc>,
        written_at: DateTime<Utc>,
    ) -> Option<ConfidenceScore> {
        let ttl = self.ttl(field)?;

        let max_rank = self.priority.max_rank();
        let base = if max_rank == 0 {
            0.0
        } else {
            self.priority.rank(source) as f64 / max_rank as f64
        };

        let age_days = (written_at - extracted_at).num_seconds().max(0) as f64 / 86_400.0;
        let decay = if self.config.half_life_days > 0.0 {
            0.5_f64.powf(age_days / self.config.half_life_days)
        } else {
            1.0
        };

        Some(ConfidenceScore {
            confidence: (base * decay).clamp(0.0, 1.0),
            expires_at: extracted_at + ttl,
        })
    }
}

/// Apply the gate's discount to an existing score
pub fn discount(score: ConfidenceScore, multiplier: f64) -> ConfidenceScore {
    ConfidenceScore {
        confidence: (score.confidence * multiplier).clamp(0.0, 1.0),
        expires_at: score.expires_at,
    }
}
