//! Shared types for the enrichment pipeline.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::admission::budget::Reservation;

/// Most images forwarded to a multimodal summarizer.
pub const MAX_IMAGES_PER_POST: usize = 2;

// ── Candidate ───────────────────────────────────────────────────────

/// A post under consideration for enrichment.
///
/// Immutable input to scoring. The surrounding fetcher builds these; the
/// convenience constructor [`PostCandidate::from_post`] derives the link and
/// image fields from a raw url + body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCandidate {
    /// Unique ID (community-native post id).
    pub id: String,
    pub title: String,
    /// Body text, possibly truncated by the fetcher.
    pub body: String,
    /// Upvote-style ranking score.
    pub engagement: i64,
    /// Community the post was fetched from.
    pub community: String,
    /// Post link target, if it points somewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Normalized domain of `url` (lower-case, no `www.`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linked_domain: Option<String>,
    #[serde(default)]
    pub has_image: bool,
    /// Image URLs for the multimodal summarizer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    /// Length of the full body in characters.
    pub body_length: usize,
}

impl PostCandidate {
    /// Build a candidate from raw post fields.
    pub fn from_post(
        id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        engagement: i64,
        community: impl Into<String>,
        url: Option<&str>,
    ) -> Self {
        let body = body.into();
        let linked_domain = url.and_then(extract_domain);
        let image_urls = detect_image_urls(url.unwrap_or_default(), &body);
        Self {
            id: id.into(),
            title: title.into(),
            body_length: body.chars().count(),
            body,
            engagement,
            community: community.into(),
            url: url.map(String::from),
            linked_domain,
            has_image: !image_urls.is_empty(),
            image_urls,
        }
    }

    /// Short title for log lines.
    pub fn short_title(&self) -> String {
        truncate_chars(&self.title, 50)
    }
}

/// Extract the normalized host of a URL: lower-case, leading `www.` removed.
pub fn extract_domain(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw.trim()).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    let host = host.strip_prefix("www.").map(String::from).unwrap_or(host);
    if host.is_empty() { None } else { Some(host) }
}

static BODY_IMAGE_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)https?://(?:i\.redd\.it/[^\s)\]]+|(?:i\.)?imgur\.com/[^\s)\]]+|[^\s)\]]+\.(?:jpg|jpeg|png|gif|webp))",
    )
    .expect("static image pattern compiles")
});

/// Find likely image URLs in a post link and its body.
///
/// Direct `i.redd.it` links count as-is; `imgur.com/<id>` pages are rewritten
/// to their direct `i.imgur.com/<id>.jpg` form. At most
/// [`MAX_IMAGES_PER_POST`] unique URLs are returned, link first.
pub fn detect_image_urls(post_url: &str, body: &str) -> Vec<String> {
    let mut found = Vec::new();

    if post_url.contains("i.redd.it") {
        found.push(post_url.to_string());
    } else if post_url.contains("imgur.com") && !post_url.ends_with('/') {
        if let Some(direct) = normalize_imgur_url(post_url) {
            found.push(direct);
        }
    }

    for m in BODY_IMAGE_URL.find_iter(body) {
        let candidate = m.as_str();
        let normalized = if candidate.contains("imgur.com") && !candidate.contains("i.imgur.com") {
            normalize_imgur_url(candidate)
        } else {
            Some(candidate.to_string())
        };
        if let Some(url) = normalized {
            if !found.contains(&url) {
                found.push(url);
            }
        }
    }

    found.truncate(MAX_IMAGES_PER_POST);
    found
}

/// `imgur.com/abc` → `https://i.imgur.com/abc.jpg`.
fn normalize_imgur_url(url: &str) -> Option<String> {
    if url.contains("i.imgur.com") {
        return Some(url.to_string());
    }
    let path = url.split("imgur.com/").nth(1)?;
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    let id = last.split('.').next().filter(|s| !s.is_empty())?;
    Some(format!("https://i.imgur.com/{id}.jpg"))
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max).collect();
        format!("{head}...")
    }
}

// ── Strategies ──────────────────────────────────────────────────────

/// Result-producing strategies, most expensive first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Costly provider call with web search.
    WebSearchEnhanced,
    /// Text + image summary.
    Multimodal,
    /// Text-only summary.
    TextOnly,
    /// No summary at all. Never fails.
    NoSummary,
}

impl Strategy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::WebSearchEnhanced => "web_search_enhanced",
            Self::Multimodal => "multimodal",
            Self::TextOnly => "text_only",
            Self::NoSummary => "no_summary",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Provider output ─────────────────────────────────────────────────

/// Successful output of the enrichment provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedSummary {
    pub summary: String,
    /// What the call actually cost.
    pub cost: Decimal,
    /// Whether the provider actually ran a web search.
    #[serde(default)]
    pub web_search_used: bool,
}

// ── Attempts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { reason: String },
}

/// One strategy attempt for one candidate. Reporting only, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentAttempt {
    pub strategy: Strategy,
    pub outcome: AttemptOutcome,
    pub cost: Decimal,
    #[serde(with = "millis")]
    pub latency: Duration,
}

impl EnrichmentAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Succeeded)
    }
}

// ── Admission decision ──────────────────────────────────────────────

/// Outcome of admission control for one candidate.
///
/// Only `Eligible` carries a live reservation; every other variant sends the
/// candidate straight to the fallback chain.
#[derive(Debug, Clone)]
pub enum AdmissionDecision {
    /// Scored high enough, breaker allowed the call, budget reserved.
    Eligible(Reservation),
    /// Breaker allowed the call but the daily budget did not.
    BudgetBlocked,
    /// Breaker is open.
    CircuitBlocked,
    /// Score below the trigger threshold.
    Ineligible,
    /// Subsystem switched off.
    Disabled,
}

impl AdmissionDecision {
    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::Eligible(_) => DecisionKind::Eligible,
            Self::BudgetBlocked => DecisionKind::BudgetBlocked,
            Self::CircuitBlocked => DecisionKind::CircuitBlocked,
            Self::Ineligible => DecisionKind::Ineligible,
            Self::Disabled => DecisionKind::Disabled,
        }
    }
}

/// Serializable tag of an [`AdmissionDecision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Eligible,
    BudgetBlocked,
    CircuitBlocked,
    Ineligible,
    Disabled,
}

// ── Result ──────────────────────────────────────────────────────────

/// Final outcome for one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentResult {
    pub candidate_id: String,
    /// Strategy that produced the result.
    pub strategy: Strategy,
    /// `None` only for [`Strategy::NoSummary`].
    pub summary: Option<String>,
    pub decision: DecisionKind,
    pub score: i64,
    pub matched_factors: Vec<String>,
    pub attempts: Vec<EnrichmentAttempt>,
    pub total_cost: Decimal,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
