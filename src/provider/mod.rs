//! Collaborator interfaces for the costly enrichment call and the cheaper
//! fallback summarizer.

pub mod remote;

pub use remote::RemoteEnrichment;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::enrichment::types::{EnrichedSummary, PostCandidate};
use crate::error::{ProviderFailure, SummaryError};

/// The expensive, web-search-augmented enrichment call.
///
/// Implementations should honour `timeout` themselves; the coordinator also
/// wraps the call in its own deadline and drops it when that passes.
#[async_trait]
pub trait EnrichmentProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        candidate: &PostCandidate,
        timeout: Duration,
    ) -> Result<EnrichedSummary, ProviderFailure>;
}

/// Summary flavours the fallback chain asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryMode {
    /// Text plus the candidate's images.
    Multimodal,
    TextOnly,
}

/// Cheap summarizer used by the fallback chain.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(
        &self,
        candidate: &PostCandidate,
        mode: SummaryMode,
    ) -> Result<String, SummaryError>;
}
