use crate::models::profile::EnrichableField;
use crate::models::provenance::Source;
use crate::models::result::DiscoveredField;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A field value held back from the record after failing verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineRecord {
    pub id: Uuid,
    pub record_id: Uuid,
    pub field: EnrichableField,
    /// Rendered rejected value, kept for operators
    pub value: String,
    /// Provider that produced the value; the adaptive pass avoids it
    pub provider: String,
    pub source: Source,
    pub failure_reason: String,
    pub quarantined_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Adaptive retry attempts made so far
    pub retry_attempts: u32,
}

impl QuarantineRecord {
    pub fn new(record_id: Uuid, discovered: &DiscoveredField, failure_reason: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id,
            field: discovered.field,
            value: discovered.value.display(),
            provider: discovered.provider.clone(),
            source: discovered.source,
            failure_reason,
            quarantined_at: Utc::now(),
            resolved_at: None,
            retry_attempts: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.resolved_at.is_none()
    }
}
