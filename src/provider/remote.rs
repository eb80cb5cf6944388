//! HTTP implementation of both collaborators.
//!
//! POSTs the candidate as JSON to an operator-supplied service:
//! - `{endpoint}/enrich` → `{"summary", "cost", "web_search_used"}`
//! - `{endpoint}/summarize` → `{"summary"}`
//!
//! Non-2xx answers are failures. An error body of the form
//! `{"error": "...", "partial_cost": "0.01"}` reports cost already incurred.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::enrichment::types::{EnrichedSummary, PostCandidate};
use crate::error::{ConfigError, FailureKind, ProviderFailure, SummaryError};
use crate::provider::{EnrichmentProvider, Summarizer, SummaryMode};

/// Longest error body echoed into a failure reason.
const MAX_ERROR_BODY: usize = 200;

#[derive(Serialize)]
struct EnrichRequest<'a> {
    candidate: &'a PostCandidate,
}

#[derive(Serialize)]
struct SummarizeRequest<'a> {
    candidate: &'a PostCandidate,
    mode: SummaryMode,
    images: &'a [String],
}

#[derive(Deserialize)]
struct SummarizeResponse {
    summary: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    partial_cost: Option<Decimal>,
}

/// Client for a remote enrichment service.
///
/// Reuses a single `reqwest::Client` for connection pooling.
#[derive(Clone)]
pub struct RemoteEnrichment {
    http: reqwest::Client,
    endpoint: String,
    token: Option<SecretString>,
}

impl std::fmt::Debug for RemoteEnrichment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEnrichment")
            .field("endpoint", &self.endpoint)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl RemoteEnrichment {
    pub fn new(endpoint: &str, token: Option<SecretString>) -> Result<Self, ConfigError> {
        let parsed = url::Url::parse(endpoint).map_err(|e| ConfigError::InvalidValue {
            key: "ENRICH_ENDPOINT".into(),
            message: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "ENRICH_ENDPOINT".into(),
                message: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "ENRICH_ENDPOINT".into(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Read `ENRICH_ENDPOINT` and optional `ENRICH_API_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint =
            std::env::var("ENRICH_ENDPOINT").map_err(|_| ConfigError::MissingRequired {
                key: "ENRICH_ENDPOINT".into(),
                hint: "Set it to the base URL of the enrichment service".into(),
            })?;
        let token = std::env::var("ENRICH_API_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(SecretString::from);
        Self::new(&endpoint, token)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let request = self.http.post(format!("{}/{path}", self.endpoint));
        match &self.token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }
}

fn request_failure(e: reqwest::Error, timeout: Duration) -> ProviderFailure {
    if e.is_timeout() {
        ProviderFailure::timeout(timeout)
    } else {
        ProviderFailure::new(FailureKind::Request, e.to_string())
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(MAX_ERROR_BODY).collect()
}

#[async_trait]
impl EnrichmentProvider for RemoteEnrichment {
    fn name(&self) -> &str {
        "remote"
    }

    async fn invoke(
        &self,
        candidate: &PostCandidate,
        timeout: Duration,
    ) -> Result<EnrichedSummary, ProviderFailure> {
        debug!(candidate = %candidate.id, endpoint = %self.endpoint, "Invoking remote enrichment");

        let resp = self
            .post("enrich")
            .timeout(timeout)
            .json(&EnrichRequest { candidate })
            .send()
            .await
            .map_err(|e| request_failure(e, timeout))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| request_failure(e, timeout))?;

        if !status.is_success() {
            let parsed = serde_json::from_str::<ErrorBody>(&body).ok();
            let reason = parsed
                .as_ref()
                .and_then(|b| b.error.clone())
                .unwrap_or_else(|| truncate(&body));
            let mut failure = ProviderFailure::new(
                FailureKind::Rejected,
                format!("HTTP {}: {reason}", status.as_u16()),
            );
            if let Some(cost) = parsed.and_then(|b| b.partial_cost) {
                failure = failure.with_partial_cost(cost);
            }
            warn!(candidate = %candidate.id, status = status.as_u16(), "Enrichment rejected");
            return Err(failure);
        }

        serde_json::from_str::<EnrichedSummary>(&body).map_err(|e| {
            ProviderFailure::new(
                FailureKind::InvalidResponse,
                format!("unreadable enrichment response: {e}"),
            )
        })
    }
}

#[async_trait]
impl Summarizer for RemoteEnrichment {
    async fn summarize(
        &self,
        candidate: &PostCandidate,
        mode: SummaryMode,
    ) -> Result<String, SummaryError> {
        if mode == SummaryMode::Multimodal && candidate.image_urls.is_empty() {
            return Err(SummaryError::Unsupported("candidate has no images".into()));
        }

        let resp = self
            .post("summarize")
            .json(&SummarizeRequest {
                candidate,
                mode,
                images: &candidate.image_urls,
            })
            .send()
            .await
            .map_err(|e| SummaryError::RequestFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SummaryError::RequestFailed(format!(
                "HTTP {}: {}",
                status.as_u16(),
                truncate(&body)
            )));
        }

        let parsed: SummarizeResponse = resp
            .json()
            .await
            .map_err(|e| SummaryError::RequestFailed(format!("unreadable summary: {e}")))?;
        Ok(parsed.summary)
    }
}
