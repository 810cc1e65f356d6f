use crate::error::{AppError, Result};
use crate::models::candidate::Tier;
use crate::models::provenance::FieldProvenance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;
use validator::Validate;

/// Enrichable columns of a profile record.
///
/// Every generic operation (merge, gate, provider parsing) works over this
/// enum rather than free-form column names.
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
    AsRefStr,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EnrichableField {
    Email,
    Phone,
    Website,
    DirectoryHandle,
    Company,
    WhatTheyDo,
    WhoTheyServe,
    Seeking,
    Offering,
    Niche,
    ListSize,
    SocialReach,
    Partnerships,
}

/// How a field is merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Contact data; carries a confidence score
    Contact,
    /// Business description text
    Description,
    /// Numeric audience signal, upgrade-only
    Audience,
    /// Keyed history list, append/dedupe
    List,
}

impl EnrichableField {
    pub fn kind(&self) -> FieldKind {
        match self {
            EnrichableField::Email
            | EnrichableField::Phone
            | EnrichableField::Website
            | EnrichableField::DirectoryHandle => FieldKind::Contact,
            EnrichableField::Company
            | EnrichableField::WhatTheyDo
            | EnrichableField::WhoTheyServe
            | EnrichableField::Seeking
            | EnrichableField::Offering
            | EnrichableField::Niche => FieldKind::Description,
            EnrichableField::ListSize | EnrichableField::SocialReach => FieldKind::Audience,
            EnrichableField::Partnerships => FieldKind::List,
        }
    }

    pub fn is_contact(&self) -> bool {
        self.kind() == FieldKind::Contact
    }

    /// Largest value `ProfileRecord` validation accepts: characters for text
    /// fields, entries for lists. Must match the `#[validate]` attributes below.
    pub fn max_len(&self) -> Option<usize> {
        match self {
            EnrichableField::Email => Some(254),
            EnrichableField::Phone => Some(32),
            EnrichableField::Website => None,
            EnrichableField::DirectoryHandle
            | EnrichableField::Company
            | EnrichableField::Niche => Some(255),
            EnrichableField::WhatTheyDo
            | EnrichableField::WhoTheyServe
            | EnrichableField::Seeking
            | EnrichableField::Offering => Some(2000),
            EnrichableField::ListSize | EnrichableField::SocialReach => None,
            EnrichableField::Partnerships => Some(500),
        }
    }

    /// Contact fields the directory stage can fill
    pub fn contact_fields() -> &'static [EnrichableField] {
        &[
            EnrichableField::Email,
            EnrichableField::Phone,
            EnrichableField::DirectoryHandle,
        ]
    }
}

/// One entry of a profile's partnership history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartnershipEntry {
    pub partner: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
}

impl PartnershipEntry {
    pub fn new(partner: impl Into<String>) -> Self {
        Self {
            partner: partner.into(),
            kind: None,
            year: None,
        }
    }

    /// Dedupe key
    pub fn key(&self) -> String {
        format!(
            "{}|{}",
            self.partner.trim().to_lowercase(),
            self.kind.as_deref().unwrap_or("").trim().to_lowercase()
        )
    }
}

/// Typed value of an enrichable field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FieldValue {
    Text(String),
    Count(u64),
    Partnerships(Vec<PartnershipEntry>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Text(s) => s.trim().is_empty(),
            FieldValue::Count(n) => *n == 0,
            FieldValue::Partnerships(list) => list.is_empty(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Short human-readable rendering for logs and the quarantine log
    pub fn display(&self) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Count(n) => n.to_string(),
            FieldValue::Partnerships(list) => list
                .iter()
                .map(|p| p.partner.clone())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

/// The enrichable entity
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ProfileRecord {
    /// Stable identifier
    pub id: Uuid,

    #[validate(length(min = 1, max = 255))]
    pub name: String,

    #[validate(length(max = 255))]
    pub company: Option<String>,

    #[validate(email, length(max = 254))]
    pub email: Option<String>,

    #[validate(length(min = 7, max = 32))]
    pub phone: Option<String>,

    #[validate(url)]
    pub website: Option<String>,

    #[validate(length(max = 255))]
    pub directory_handle: Option<String>,

    #[validate(length(max = 2000))]
    pub what_they_do: Option<String>,

    #[validate(length(max = 2000))]
    pub who_they_serve: Option<String>,

    #[validate(length(max = 2000))]
    pub seeking: Option<String>,

    #[validate(length(max = 2000))]
    pub offering: Option<String>,

    #[validate(length(max = 255))]
    pub niche: Option<String>,

    /// Mailing-list size
    pub list_size: Option<u64>,

    /// Combined social following
    pub social_reach: Option<u64>,

    #[validate(length(max = 500))]
    pub partnerships: Vec<PartnershipEntry>,

    /// Provenance per populated field
    pub provenance: HashMap<EnrichableField, FieldProvenance>,

    pub last_enriched_at: Option<DateTime<Utc>>,

    /// Tier assigned by the most recent selection pass
    pub tier: Option<Tier>,

    /// Pipeline version of the last enrichment that touched the record
    pub pipeline_version: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileRecord {
    /// Create an empty record for a named profile
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            company: None,
            email: None,
            phone: None,
            website: None,
            directory_handle: None,
            what_they_do: None,
            who_they_serve: None,
            seeking: None,
            offering: None,
            niche: None,
            list_size: None,
            social_reach: None,
            partnerships: Vec::new(),
            provenance: HashMap::new(),
            last_enriched_at: None,
            tier: None,
            pipeline_version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_company(mut self, company: impl Into<String>) -> Self {
        self.company = Some(company.into());
        self
    }

    pub fn with_website(mut self, website: impl Into<String>) -> Self {
        self.website = Some(website.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_directory_handle(mut self, handle: impl Into<String>) -> Self {
        self.directory_handle = Some(handle.into());
        self
    }

    pub fn with_list_size(mut self, size: u64) -> Self {
        self.list_size = Some(size);
        self
    }

    fn text_slot(&mut self, field: EnrichableField) -> Option<&mut Option<String>> {
        match field {
            EnrichableField::Email => Some(&mut self.email),
            EnrichableField::Phone => Some(&mut self.phone),
            EnrichableField::Website => Some(&mut self.website),
            EnrichableField::DirectoryHandle => Some(&mut self.directory_handle),
            EnrichableField::Company => Some(&mut self.company),
            EnrichableField::WhatTheyDo => Some(&mut self.what_they_do),
            EnrichableField::WhoTheyServe => Some(&mut self.who_they_serve),
            EnrichableField::Seeking => Some(&mut self.seeking),
            EnrichableField::Offering => Some(&mut self.offering),
            EnrichableField::Niche => Some(&mut self.niche),
            _ => None,
        }
    }

    /// Current value of a field, `None` when absent or empty
    pub fn get(&self, field: EnrichableField) -> Option<FieldValue> {
        let value = match field {
            EnrichableField::Email => self.email.clone().map(FieldValue::Text),
            EnrichableField::Phone => self.phone.clone().map(FieldValue::Text),
            EnrichableField::Website => self.website.clone().map(FieldValue::Text),
            EnrichableField::DirectoryHandle => {
                self.directory_handle.clone().map(FieldValue::Text)
            }
            EnrichableField::Company => self.company.clone().map(FieldValue::Text),
            EnrichableField::WhatTheyDo => self.what_they_do.clone().map(FieldValue::Text),
            EnrichableField::WhoTheyServe => self.who_they_serve.clone().map(FieldValue::Text),
            EnrichableField::Seeking => self.seeking.clone().map(FieldValue::Text),
            EnrichableField::Offering => self.offering.clone().map(FieldValue::Text),
            EnrichableField::Niche => self.niche.clone().map(FieldValue::Text),
            EnrichableField::ListSize => self.list_size.map(FieldValue::Count),
            EnrichableField::SocialReach => self.social_reach.map(FieldValue::Count),
            EnrichableField::Partnerships => {
                Some(FieldValue::Partnerships(self.partnerships.clone()))
            }
        };
        value.filter(|v| !v.is_empty())
    }

    /// Whether a field currently holds a non-empty value
    pub fn is_filled(&self, field: EnrichableField) -> bool {
        self.get(field).is_some()
    }

    /// Set a field, rejecting values of the wrong type
    pub fn set(&mut self, field: EnrichableField, value: FieldValue) -> Result<()> {
        match (field.kind(), value) {
            (FieldKind::Contact | FieldKind::Description, FieldValue::Text(text)) => {
                if let Some(slot) = self.text_slot(field) {
                    *slot = Some(text);
                }
            }
            (FieldKind::Audience, FieldValue::Count(n)) => match field {
                EnrichableField::ListSize => self.list_size = Some(n),
                _ => self.social_reach = Some(n),
            },
            (FieldKind::List, FieldValue::Partnerships(list)) => self.partnerships = list,
            (_, other) => {
                return Err(AppError::FieldType(format!(
                    "{} cannot hold {:?}",
                    field, other
                )))
            }
        }
        Ok(())
    }

    /// Largest audience signal
    pub fn audience_size(&self) -> u64 {
        self.list_size
            .unwrap_or(0)
            .max(self.social_reach.unwrap_or(0))
    }

    pub fn has_website(&self) -> bool {
        self.is_filled(EnrichableField::Website)
    }

    pub fn has_directory_handle(&self) -> bool {
        self.is_filled(EnrichableField::DirectoryHandle)
    }

    /// Registrable domain from the website, falling back to the email domain
    pub fn domain(&self) -> Option<String> {
        if let Some(website) = self.website.as_deref().filter(|w| !w.trim().is_empty()) {
            let with_scheme = if website.contains("://") {
                website.to_string()
            } else {
                format!("https://{}", website)
            };
            if let Some(host) = url::Url::parse(&with_scheme)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
            {
                return Some(host.trim_start_matches("www.").to_lowercase());
            }
        }
        self.email
            .as_deref()
            .and_then(|e| e.split_once('@'))
            .map(|(_, domain)| domain.to_lowercase())
    }
}
