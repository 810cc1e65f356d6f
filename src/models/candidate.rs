use crate::models::profile::ProfileRecord;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Priority bucket assigned from the signals a record already has
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Enriched by an older pipeline version, missing newly-added fields
    #[strum(serialize = "tier0")]
    Tier0,
    /// Website, missing key field, large audience
    #[strum(serialize = "tier1")]
    Tier1,
    /// Website, missing key field, medium audience
    #[strum(serialize = "tier2")]
    Tier2,
    /// Website, missing key field
    #[strum(serialize = "tier3")]
    Tier3,
    /// No website, has a directory handle
    #[strum(serialize = "tier4")]
    Tier4,
    /// No website, no directory handle
    #[strum(serialize = "tier5")]
    Tier5,
}

impl Tier {
    pub const ALL: [Tier; 6] = [
        Tier::Tier0,
        Tier::Tier1,
        Tier::Tier2,
        Tier::Tier3,
        Tier::Tier4,
        Tier::Tier5,
    ];

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn from_u8(value: u8) -> Option<Tier> {
        Tier::ALL.get(value as usize).copied()
    }

    /// Tiers whose records have no website
    pub fn lacks_website(&self) -> bool {
        matches!(self, Tier::Tier4 | Tier::Tier5)
    }
}

/// How the selector picks records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PriorityMode {
    /// Completeness-driven selection
    Tiered,
    /// Staleness-driven selection
    Refresh,
}

/// A record snapshot queued for exactly one enrichment attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentCandidate {
    record: ProfileRecord,
    tier: Tier,
}

impl EnrichmentCandidate {
    pub fn new(record: ProfileRecord, tier: Tier) -> Self {
        Self { record, tier }
    }

    pub fn record(&self) -> &ProfileRecord {
        &self.record
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn id(&self) -> uuid::Uuid {
        self.record.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_tier_round_trip_u8() {
        for tier in Tier::ALL {
            assert_eq!(Tier::from_u8(tier.as_u8()), Some(tier));
        }
        assert_eq!(Tier::from_u8(6), None);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Tier0 < Tier::Tier1);
        assert!(Tier::Tier4.lacks_website());
        assert!(!Tier::Tier3.lacks_website());
        assert_eq!(Tier::Tier2.to_string(), "tier2");
    }

    #[test]
    fn test_priority_mode_parse() {
        assert_eq!(PriorityMode::from_str("refresh").unwrap(), PriorityMode::Refresh);
        assert_eq!(PriorityMode::Tiered.to_string(), "tiered");
    }
}
