use crate::models::{EnrichableField, FieldKind, FieldValue, PartnershipEntry, Source};
use crate::providers::{
    DeepResearchProvider, DirectoryContactProvider, ProviderError, ProviderField, ProviderInfo,
    ProviderResponse, ResearchHints, SemanticResearchProvider,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Connection settings for one JSON research endpoint
#[derive(Debug, Clone)]
pub struct HttpProviderConfig {
    pub name: String,
    pub source: Source,
    pub endpoint: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub cost_per_call: f64,
}

/// Wire format returned by research endpoints
#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
    #[serde(default)]
    verified: Vec<String>,
    #[serde(default)]
    free_text: Vec<String>,
    #[serde(default)]
    cost: Option<f64>,
}

/// JSON-over-HTTP provider client.
///
/// One client type serves all three provider roles; the role only changes the
/// `operation` sent in the request body.
pub struct HttpProvider {
    config: HttpProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: HttpProviderConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::Permanent(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    async fn call(&self, body: Value) -> Result<ProviderResponse, ProviderError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, text));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::Transient(format!("unreadable response: {}", e)))?;

        if wire.status.as_deref() == Some("not_indexed") {
            return Err(ProviderError::NotIndexed(format!(
                "{} has no index entry",
                self.config.name
            )));
        }

        Ok(parse_wire_response(&self.config.name, wire))
    }
}

fn classify_status(status: StatusCode, body: String) -> ProviderError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(detail),
        StatusCode::PAYMENT_REQUIRED => ProviderError::CreditsExhausted(detail),
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND
        | StatusCode::UNPROCESSABLE_ENTITY => ProviderError::Permanent(detail),
        _ => ProviderError::Transient(detail),
    }
}

fn parse_wire_response(provider: &str, wire: WireResponse) -> ProviderResponse {
    let verified: HashSet<&str> = wire.verified.iter().map(String::as_str).collect();
    let free_text: HashSet<&str> = wire.free_text.iter().map(String::as_str).collect();

    let mut fields = Vec::new();
    for (key, raw) in &wire.fields {
        let Ok(field) = EnrichableField::from_str(key) else {
            debug!(provider, key = %key, "Ignoring unknown field");
            continue;
        };
        let Some(value) = parse_value(field, raw) else {
            debug!(provider, field = %field, "Ignoring value of unexpected shape");
            continue;
        };
        fields.push(ProviderField {
            field,
            value,
            verified: verified.contains(key.as_str()),
            free_text: free_text.contains(key.as_str()),
        });
    }
    fields.sort_by_key(|f| f.field);

    ProviderResponse {
        fields,
        cost: wire.cost,
    }
}

fn parse_value(field: EnrichableField, raw: &Value) -> Option<FieldValue> {
    match field.kind() {
        FieldKind::Contact | FieldKind::Description => {
            raw.as_str().map(|s| FieldValue::Text(s.to_string()))
        }
        FieldKind::Audience => raw
            .as_u64()
            .or_else(|| raw.as_str().and_then(|s| s.replace(',', "").parse().ok()))
            .map(FieldValue::Count),
        FieldKind::List => {
            let entries: Vec<PartnershipEntry> = raw
                .as_array()?
                .iter()
                .filter_map(|item| match item {
                    Value::String(partner) => Some(PartnershipEntry::new(partner.clone())),
                    other => serde_json::from_value(other.clone()).ok(),
                })
                .collect();
            Some(FieldValue::Partnerships(entries))
        }
    }
}

impl ProviderInfo for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn source(&self) -> Source {
        self.config.source
    }

    fn estimated_cost(&self) -> f64 {
        self.config.cost_per_call
    }
}

#[async_trait]
impl SemanticResearchProvider for HttpProvider {
    async fn research(
        &self,
        name: &str,
        website: Option<&str>,
        hints: &ResearchHints,
    ) -> Result<ProviderResponse, ProviderError> {
        self.call(json!({
            "operation": "research",
            "name": name,
            "website": website,
            "company": hints.company,
            "directory_handle": hints.directory_handle,
            "wanted": hints.wanted.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
        }))
        .await
    }
}

#[async_trait]
impl DirectoryContactProvider for HttpProvider {
    async fn lookup(
        &self,
        name: &str,
        company: Option<&str>,
        domain: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        self.call(json!({
            "operation": "lookup",
            "name": name,
            "company": company,
            "domain": domain,
        }))
        .await
    }
}

#[async_trait]
impl DeepResearchProvider for HttpProvider {
    async fn research(
        &self,
        name: &str,
        company: Option<&str>,
    ) -> Result<ProviderResponse, ProviderError> {
        self.call(json!({
            "operation": "deep_research",
            "name": name,
            "company": company,
        }))
        .await
    }
}
