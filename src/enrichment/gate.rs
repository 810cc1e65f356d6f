use crate::config::GateConfig;
use crate::models::{DiscoveredField, EnrichableField, ExtractionMethod, FieldValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strum::Display;

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$")
        .expect("email pattern is valid")
});

static YEAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:19|20)\d{2}(?:\s*[-/]\s*(?:19|20)\d{2})?$").expect("year pattern is valid")
});

static PHONE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9()\-\s.]+$").expect("phone pattern is valid"));

/// Asset extensions that scraped "emails" like `logo@2x.png` end in
const ASSET_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp", "css", "js"];

/// Gate classification of one extracted value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    /// Passed every check and came from an authoritative path
    Verified,
    /// Passed every check but came from a lower-trust path
    Unverified,
    /// Failed a structural check; never merged
    Quarantined,
}

/// Verdict for one candidate field
#[derive(Debug, Clone, PartialEq)]
pub struct GateVerdict {
    pub field: EnrichableField,
    pub status: VerificationStatus,
    pub issues: Vec<String>,
    /// Value to merge; may be normalized by `apply_fixes`
    pub value: FieldValue,
    /// Factor applied to the value's confidence
    pub confidence_multiplier: f64,
    /// Whether `apply_fixes` changed the value
    pub fixed: bool,
}

impl GateVerdict {
    pub fn is_quarantined(&self) -> bool {
        self.status == VerificationStatus::Quarantined
    }

    pub fn failure_reason(&self) -> String {
        self.issues.join("; ")
    }
}

/// Structural verification of extracted field values
#[derive(Debug, Clone)]
pub struct VerificationGate {
    config: GateConfig,
}

impl VerificationGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Classify one discovered value
    pub fn evaluate(&self, discovered: &DiscoveredField) -> GateVerdict {
        self.evaluate_value(discovered.field, &discovered.value, discovered.extraction)
    }

    /// Classify a value given how it was extracted
    pub fn evaluate_value(
        &self,
        field: EnrichableField,
        value: &FieldValue,
        extraction: ExtractionMethod,
    ) -> GateVerdict {
        let mut value = value.clone();
        let mut issues = self.check(field, &value);
        let mut fixed = false;

        if !issues.is_empty() {
            if let Some(normalized) = self.apply_fixes(field, &value) {
                let retry_issues = self.check(field, &normalized);
                if retry_issues.is_empty() {
                    value = normalized;
                    fixed = true;
                }
                issues = retry_issues;
            }
        }

        let status = if !issues.is_empty() {
            VerificationStatus::Quarantined
        } else if Self::is_trusted(field, extraction) {
            VerificationStatus::Verified
        } else {
            VerificationStatus::Unverified
        };

        let confidence_multiplier = match status {
            VerificationStatus::Verified => 1.0,
            VerificationStatus::Unverified => self.config.unverified_confidence_multiplier,
            VerificationStatus::Quarantined => 0.0,
        };

        GateVerdict {
            field,
            status,
            issues,
            value,
            confidence_multiplier,
            fixed,
        }
    }

    /// Provider-verified values are trusted; structured output is trusted for
    /// everything except contact data; free text is never trusted.
    fn is_trusted(field: EnrichableField, extraction: ExtractionMethod) -> bool {
        match extraction {
            ExtractionMethod::ProviderVerified => true,
            ExtractionMethod::Structured => !field.is_contact(),
            ExtractionMethod::FreeText => false,
        }
    }

    /// Structural checks; returns the list of failures
    pub fn check(&self, field: EnrichableField, value: &FieldValue) -> Vec<String> {
        let mut issues = self.check_shape(field, value);
        issues.extend(Self::check_length(field, value));
        issues
    }

    /// Values longer than the record schema allows would fail the whole
    /// record's write, so they are held back here instead.
    fn check_length(field: EnrichableField, value: &FieldValue) -> Option<String> {
        let limit = field.max_len()?;
        let len = match value {
            FieldValue::Text(text) => text.chars().count(),
            FieldValue::Partnerships(entries) => entries.len(),
            FieldValue::Count(_) => return None,
        };
        (len > limit).then(|| format!("{} is {} long (max {})", field, len, limit))
    }

    fn check_shape(&self, field: EnrichableField, value: &FieldValue) -> Vec<String> {
        match (field, value) {
            (EnrichableField::Email, FieldValue::Text(email)) => self.check_email(email),
            (EnrichableField::Phone, FieldValue::Text(phone)) => self.check_phone(phone),
            (EnrichableField::Website, FieldValue::Text(url)) => self.check_url(url),
            (EnrichableField::DirectoryHandle, FieldValue::Text(handle)) => {
                if handle.trim() != handle || handle.chars().any(char::is_whitespace) {
                    vec!["directory handle contains whitespace".to_string()]
                } else {
                    Vec::new()
                }
            }
            (EnrichableField::Partnerships, FieldValue::Partnerships(entries)) => {
                if entries.iter().any(|e| e.partner.trim().is_empty()) {
                    vec!["partnership entry without a partner".to_string()]
                } else {
                    Vec::new()
                }
            }
            (_, FieldValue::Text(text)) if text.trim().is_empty() => {
                vec!["empty value".to_string()]
            }
            _ => Vec::new(),
        }
    }

    fn check_email(&self, email: &str) -> Vec<String> {
        let mut issues = Vec::new();

        if !EMAIL_PATTERN.is_match(email) {
            issues.push(format!("'{}' is not a valid email address", email));
            return issues;
        }

        let Some((local, domain)) = email.rsplit_once('@') else {
            issues.push("email has no domain".to_string());
            return issues;
        };
        let domain = domain.to_lowercase();
        let local = local.to_lowercase();

        if local.chars().count() > 64 {
            issues.push("email local part is longer than 64 characters".to_string());
        }

        if self.is_placeholder_domain(&domain) {
            issues.push(format!("placeholder email domain '{}'", domain));
        }

        if self
            .config
            .placeholder_local_parts
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&local))
        {
            issues.push(format!("placeholder email local part '{}'", local));
        }

        if let Some(tld) = domain.rsplit('.').next() {
            if ASSET_EXTENSIONS.contains(&tld) {
                issues.push(format!("'{}' looks like an asset file name", email));
            }
        }

        issues
    }

    fn check_phone(&self, phone: &str) -> Vec<String> {
        let mut issues = Vec::new();
        let trimmed = phone.trim();

        if YEAR_PATTERN.is_match(trimmed) {
            issues.push(format!("'{}' looks like a year", trimmed));
            return issues;
        }

        if !PHONE_CHARS.is_match(trimmed) {
            issues.push(format!("'{}' contains non-phone characters", trimmed));
            return issues;
        }

        let digits: Vec<u32> = trimmed.chars().filter_map(|c| c.to_digit(10)).collect();

        if digits.len() < self.config.min_phone_digits || digits.len() > self.config.max_phone_digits
        {
            issues.push(format!(
                "phone has {} digits (expected {}-{})",
                digits.len(),
                self.config.min_phone_digits,
                self.config.max_phone_digits
            ));
            return issues;
        }

        if digits.windows(2).all(|w| w[0] == w[1]) {
            issues.push("phone is a single repeated digit".to_string());
        } else if digits.windows(2).all(|w| w[1] == (w[0] + 1) % 10)
            || digits.windows(2).all(|w| w[0] == (w[1] + 1) % 10)
        {
            issues.push("phone is a sequential digit run".to_string());
        }

        issues
    }

    fn check_url(&self, raw: &str) -> Vec<String> {
        let parsed = match url::Url::parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => return vec![format!("'{}' is not a URL: {}", raw, e)],
        };

        let mut issues = Vec::new();

        if !matches!(parsed.scheme(), "http" | "https") {
            issues.push(format!("unsupported URL scheme '{}'", parsed.scheme()));
        }

        match parsed.host_str() {
            None => issues.push("URL has no host".to_string()),
            Some(host) => {
                let host = host.to_lowercase();
                let labels: Vec<&str> = host.split('.').collect();
                let tld_ok = labels
                    .last()
                    .map(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()))
                    .unwrap_or(false);

                if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) || !tld_ok {
                    issues.push(format!("'{}' is not a resolvable-looking host", host));
                } else if self.is_placeholder_domain(host.trim_start_matches("www.")) {
                    issues.push(format!("placeholder domain '{}'", host));
                }
            }
        }

        issues
    }

    fn is_placeholder_domain(&self, domain: &str) -> bool {
        self.config
            .placeholder_domains
            .iter()
            .any(|p| domain == p || domain.ends_with(&format!(".{}", p)))
    }

    /// Normalize a value that failed a soft check.
    ///
    /// Returns `None` when there is nothing to normalize. Never invents content:
    /// every output is derived from the input by trimming, case folding,
    /// prefix removal or adding a missing URL scheme.
    pub fn apply_fixes(&self, field: EnrichableField, value: &FieldValue) -> Option<FieldValue> {
        let fixed = match (field, value) {
            (EnrichableField::Email, FieldValue::Text(email)) => {
                let email = strip_prefix_ignore_case(email.trim(), "mailto:");
                let email = email.split('?').next().unwrap_or(email);
                FieldValue::Text(email.trim_end_matches('.').trim().to_lowercase())
            }
            (EnrichableField::Phone, FieldValue::Text(phone)) => {
                let mut phone = phone.trim();
                for prefix in ["tel:", "phone:"] {
                    phone = strip_prefix_ignore_case(phone, prefix).trim();
                }
                FieldValue::Text(phone.split_whitespace().collect::<Vec<_>>().join(" "))
            }
            (EnrichableField::Website, FieldValue::Text(url)) => {
                let url = url.trim().trim_end_matches(|c| c == '.' || c == ',');
                if url.is_empty() {
                    return None;
                }
                if url.contains("://") {
                    FieldValue::Text(url.to_string())
                } else {
                    FieldValue::Text(format!("https://{}", url.trim_start_matches("//")))
                }
            }
            (EnrichableField::DirectoryHandle, FieldValue::Text(handle)) => {
                FieldValue::Text(handle.trim().trim_start_matches('@').to_string())
            }
            (EnrichableField::Partnerships, FieldValue::Partnerships(entries)) => {
                FieldValue::Partnerships(
                    entries
                        .iter()
                        .filter(|e| !e.partner.trim().is_empty())
                        .cloned()
                        .collect(),
                )
            }
            _ => return None,
        };

        if &fixed == value || fixed.is_empty() {
            None
        } else {
            Some(fixed)
        }
    }
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> &'a str {
    match value.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => &value[prefix.len()..],
        _ => value,
    }
}
