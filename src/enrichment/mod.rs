//! Enrichment pipeline: scoring, admission, the costly call, and fallbacks.

pub mod coordinator;
pub mod fallback;
pub mod scoring;
pub mod types;

pub use coordinator::{CoordinatorStatus, EnrichmentCoordinator};
pub use fallback::{ChainOutcome, FallbackChain};
pub use scoring::{EligibilityScore, ScoreFactor, ScoringEvaluator};
pub use types::{
    AdmissionDecision, AttemptOutcome, DecisionKind, EnrichedSummary, EnrichmentAttempt,
    EnrichmentResult, PostCandidate, Strategy,
};
