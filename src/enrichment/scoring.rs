//! Eligibility scoring.
//!
//! Runs before any budget or breaker check and decides whether a candidate is
//! worth a costly enrichment call. Factors are independent and additive:
//! - target community → +20
//! - trigger keyword in title/body → +15
//! - engagement at or above the minimum → +25
//! - link to a known domain → +20, any other external link → +10
//! - product/brand mention in the body → +15
//! - minimal body text → +5
//!
//! There is no cap; a candidate is eligible once the sum reaches the trigger
//! threshold.

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::config::ScoringConfig;
use crate::enrichment::types::PostCandidate;
use crate::error::ConfigError;

/// Captured names that never count as a product mention.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "this", "that", "have", "been", "will", "would", "could",
    "should",
];

/// A single scoring factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreFactor {
    TargetCommunity,
    TriggerKeyword,
    HighEngagement,
    KnownDomain,
    ExternalLink,
    ProductMention,
    MinimalText,
}

impl ScoreFactor {
    pub fn weight(&self) -> i64 {
        match self {
            Self::TargetCommunity => 20,
            Self::TriggerKeyword => 15,
            Self::HighEngagement => 25,
            Self::KnownDomain => 20,
            Self::ExternalLink => 10,
            Self::ProductMention => 15,
            Self::MinimalText => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::TargetCommunity => "target_community",
            Self::TriggerKeyword => "trigger_keyword",
            Self::HighEngagement => "high_engagement",
            Self::KnownDomain => "known_domain",
            Self::ExternalLink => "external_link",
            Self::ProductMention => "product_mention",
            Self::MinimalText => "minimal_text",
        }
    }
}

/// Score plus the factors that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EligibilityScore {
    pub score: i64,
    pub matched: Vec<ScoreFactor>,
}

impl EligibilityScore {
    fn from_factors(matched: Vec<ScoreFactor>) -> Self {
        Self {
            score: matched.iter().map(ScoreFactor::weight).sum(),
            matched,
        }
    }

    pub fn zero() -> Self {
        Self::from_factors(Vec::new())
    }

    pub fn factor_names(&self) -> Vec<String> {
        self.matched.iter().map(|f| f.name().to_string()).collect()
    }
}

/// Scoring rules compiled from a [`ScoringConfig`].
#[derive(Debug, Clone)]
pub struct ScoringEvaluator {
    threshold: i64,
    min_engagement: i64,
    communities: Vec<String>,
    keywords: Vec<String>,
    known_domains: Vec<String>,
    self_hosted_domains: Vec<String>,
    product_patterns: Vec<Regex>,
    minimal_text_length: usize,
}

impl ScoringEvaluator {
    /// Compile the configured rules. Fails only on a bad product pattern.
    pub fn new(config: &ScoringConfig) -> Result<Self, ConfigError> {
        let product_patterns = config
            .product_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::InvalidPattern {
                    key: "product_patterns".into(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        fn lower(items: &[String]) -> Vec<String> {
            items.iter().map(|s| s.trim().to_lowercase()).collect()
        }

        // Same normal form as `extract_domain` on the candidate side.
        fn domains(items: &[String]) -> Vec<String> {
            lower(items)
                .into_iter()
                .map(|d| d.strip_prefix("www.").map(String::from).unwrap_or(d))
                .collect()
        }

        Ok(Self {
            threshold: config.trigger_threshold,
            min_engagement: config.min_engagement,
            communities: lower(&config.target_communities),
            keywords: lower(&config.trigger_keywords),
            known_domains: domains(&config.known_domains),
            self_hosted_domains: domains(&config.self_hosted_domains),
            product_patterns,
            minimal_text_length: config.minimal_text_length,
        })
    }

    /// Score a candidate. Pure and deterministic.
    pub fn score(&self, candidate: &PostCandidate) -> EligibilityScore {
        let mut matched = Vec::new();

        if self.communities.contains(&candidate.community.to_lowercase()) {
            matched.push(ScoreFactor::TargetCommunity);
        }

        let text = format!("{} {}", candidate.title, candidate.body).to_lowercase();
        if self.keywords.iter().any(|k| !k.is_empty() && text.contains(k.as_str())) {
            matched.push(ScoreFactor::TriggerKeyword);
        }

        if candidate.engagement >= self.min_engagement {
            matched.push(ScoreFactor::HighEngagement);
        }

        if let Some(domain) = candidate.linked_domain.as_deref() {
            let domain = domain.to_lowercase();
            if self.known_domains.contains(&domain) {
                matched.push(ScoreFactor::KnownDomain);
            } else if !self.self_hosted_domains.contains(&domain) {
                matched.push(ScoreFactor::ExternalLink);
            }
        }

        if self.mentions_product(&candidate.body) {
            matched.push(ScoreFactor::ProductMention);
        }

        if candidate.body_length < self.minimal_text_length {
            matched.push(ScoreFactor::MinimalText);
        }

        let score = EligibilityScore::from_factors(matched);
        debug!(
            candidate = %candidate.id,
            score = score.score,
            factors = ?score.factor_names(),
            "Scored candidate"
        );
        score
    }

    pub fn is_eligible(&self, score: &EligibilityScore) -> bool {
        score.score >= self.threshold
    }

    /// Names the product heuristic found in `text`, stop words removed.
    pub fn product_mentions(&self, text: &str) -> Vec<String> {
        let mut mentions = Vec::new();
        for pattern in &self.product_patterns {
            for caps in pattern.captures_iter(text) {
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().trim())
                    .unwrap_or_default();
                if !name.is_empty() && !STOP_WORDS.contains(&name.to_lowercase().as_str()) {
                    mentions.push(name.to_string());
                }
            }
        }
        mentions
    }

    fn mentions_product(&self, text: &str) -> bool {
        !self.product_mentions(text).is_empty()
    }
}
