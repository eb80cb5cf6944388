//! Per-candidate orchestration.
//!
//! 1. Score the candidate.
//! 2. Ask the breaker whether the provider may be called.
//! 3. Reserve budget, call the provider under a deadline, then settle the
//!    budget and report the outcome to the breaker.
//! 4. Anything short of a successful provider call falls through to the
//!    fallback chain.
//!
//! Side effects on durable state happen only in steps 2 and 3.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::admission::{BreakerStatus, BudgetSnapshot, BudgetTracker, CircuitBreaker, Reservation};
use crate::clock::Clock;
use crate::config::EnrichmentConfig;
use crate::enrichment::fallback::FallbackChain;
use crate::enrichment::scoring::{EligibilityScore, ScoringEvaluator};
use crate::enrichment::types::{
    AdmissionDecision, AttemptOutcome, EnrichedSummary, EnrichmentAttempt, EnrichmentResult,
    PostCandidate, Strategy,
};
use crate::error::{ConfigError, EnrichmentError, FailureKind, ProviderFailure};
use crate::provider::{EnrichmentProvider, Summarizer};
use crate::store::StateStore;

/// Subsystem status for operators.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub enabled: bool,
    pub provider: String,
    /// `None` when the budget record could not be read.
    pub budget: Option<BudgetSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_error: Option<String>,
    pub breaker: BreakerStatus,
}

pub struct EnrichmentCoordinator {
    enabled: bool,
    cost_per_call: Decimal,
    call_timeout: Duration,
    scoring: ScoringEvaluator,
    budget: BudgetTracker,
    breaker: CircuitBreaker,
    provider: Arc<dyn EnrichmentProvider>,
    chain: FallbackChain,
}

impl EnrichmentCoordinator {
    /// Wire up the subsystem. Loads the breaker state from `store`.
    pub async fn new(
        config: &EnrichmentConfig,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn EnrichmentProvider>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let scoring = ScoringEvaluator::new(&config.scoring)?;

        let budget = BudgetTracker::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.budget.clone(),
            config.timeouts.lock,
        );
        let breaker = CircuitBreaker::load(
            store,
            clock,
            config.breaker.clone(),
            config.timeouts.lock,
        )
        .await;

        info!(
            enabled = config.enabled,
            provider = provider.name(),
            breaker = %breaker.status().state,
            "Enrichment coordinator ready"
        );

        Ok(Self {
            enabled: config.enabled,
            cost_per_call: config.budget.cost_per_call,
            call_timeout: config.timeouts.call,
            scoring,
            budget,
            breaker,
            provider,
            chain: FallbackChain::new(summarizer, config.timeouts.summary),
        })
    }

    pub fn scoring(&self) -> &ScoringEvaluator {
        &self.scoring
    }

    pub fn budget(&self) -> &BudgetTracker {
        &self.budget
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Score a candidate; zero with no factors while disabled.
    pub fn score(&self, candidate: &PostCandidate) -> EligibilityScore {
        if self.enabled {
            self.scoring.score(candidate)
        } else {
            EligibilityScore::zero()
        }
    }

    /// Decide whether `candidate` gets the costly call.
    ///
    /// Checks run in order: enabled, score, breaker, budget. Only an
    /// `Eligible` decision holds a reservation, which the caller must settle.
    pub async fn admit(
        &self,
        candidate: &PostCandidate,
        score: &EligibilityScore,
    ) -> AdmissionDecision {
        if !self.enabled {
            return AdmissionDecision::Disabled;
        }
        if !self.scoring.is_eligible(score) {
            return AdmissionDecision::Ineligible;
        }

        match self.try_admit(candidate).await {
            Ok(reservation) => AdmissionDecision::Eligible(reservation),
            Err(EnrichmentError::CircuitOpen) => AdmissionDecision::CircuitBlocked,
            Err(e) => {
                // A probe lease granted for this call goes unused.
                self.breaker.abandon_probe().await;
                info!(candidate = %candidate.id, error = %e, "Enrichment not admitted");
                AdmissionDecision::BudgetBlocked
            }
        }
    }

    async fn try_admit(&self, candidate: &PostCandidate) -> Result<Reservation, EnrichmentError> {
        if !self.breaker.allow_request().await {
            return Err(EnrichmentError::CircuitOpen);
        }
        let reservation = self
            .budget
            .reserve_for(self.cost_per_call, &candidate.short_title())
            .await?;
        Ok(reservation)
    }

    /// Produce a result for one candidate. Never fails.
    pub async fn enrich(&self, candidate: &PostCandidate) -> EnrichmentResult {
        let score = self.score(candidate);
        let decision = self.admit(candidate, &score).await;
        let kind = decision.kind();
        info!(
            candidate = %candidate.id,
            title = %candidate.short_title(),
            score = score.score,
            decision = ?kind,
            "Admission decided"
        );

        let mut attempts = Vec::new();
        let mut outcome = None;

        if let AdmissionDecision::Eligible(reservation) = decision {
            match self.call_provider(candidate, &reservation, &mut attempts).await {
                Ok(summary) => outcome = Some((Strategy::WebSearchEnhanced, Some(summary))),
                Err(e) => {
                    warn!(candidate = %candidate.id, error = %e, "Enrichment failed, falling back")
                }
            }
        }

        let (strategy, summary) = match outcome {
            Some(done) => done,
            None => {
                let chained = self.chain.run(candidate, &mut attempts).await;
                (chained.strategy, chained.summary)
            }
        };

        EnrichmentResult {
            candidate_id: candidate.id.clone(),
            strategy,
            summary,
            decision: kind,
            score: score.score,
            matched_factors: score.factor_names(),
            total_cost: attempts.iter().map(|a| a.cost).sum(),
            attempts,
        }
    }

    /// Process candidates one at a time, in order.
    pub async fn enrich_batch(&self, candidates: &[PostCandidate]) -> Vec<EnrichmentResult> {
        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            results.push(self.enrich(candidate).await);
        }

        let enriched = results
            .iter()
            .filter(|r| r.strategy == Strategy::WebSearchEnhanced)
            .count();
        info!(candidates = candidates.len(), enriched, "Batch complete");
        results
    }

    /// Call the provider under the reservation, then settle budget and breaker.
    async fn call_provider(
        &self,
        candidate: &PostCandidate,
        reservation: &Reservation,
        attempts: &mut Vec<EnrichmentAttempt>,
    ) -> Result<String, EnrichmentError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.call_timeout,
            self.provider.invoke(candidate, self.call_timeout),
        )
        .await
        {
            Ok(Ok(EnrichedSummary { summary, cost, .. })) if summary.trim().is_empty() => Err(
                ProviderFailure::new(FailureKind::InvalidResponse, "empty summary")
                    .with_partial_cost(cost),
            ),
            Ok(result) => result,
            Err(_) => Err(ProviderFailure::timeout(self.call_timeout)),
        };
        let latency = started.elapsed();

        match result {
            Ok(enriched) => {
                let charged = match self.budget.commit(reservation, enriched.cost).await {
                    Ok(charged) => charged,
                    Err(e) => {
                        error!(candidate = %candidate.id, error = %e, "Failed to commit budget");
                        enriched.cost.max(Decimal::ZERO)
                    }
                };
                self.breaker.record_success().await;
                debug!(
                    candidate = %candidate.id,
                    reported = %enriched.cost,
                    %charged,
                    web_search = enriched.web_search_used,
                    "Enrichment succeeded"
                );
                attempts.push(EnrichmentAttempt {
                    strategy: Strategy::WebSearchEnhanced,
                    outcome: AttemptOutcome::Succeeded,
                    cost: charged,
                    latency,
                });
                Ok(enriched.summary.trim().to_string())
            }
            Err(failure) => {
                let settled = match failure.partial_cost {
                    Some(cost) => self
                        .budget
                        .commit_failed(reservation, cost)
                        .await
                        .map_err(|e| (e, cost.max(Decimal::ZERO))),
                    None => self
                        .budget
                        .rollback(reservation)
                        .await
                        .map(|()| Decimal::ZERO)
                        .map_err(|e| (e, Decimal::ZERO)),
                };
                let charged = match settled {
                    Ok(charged) => charged,
                    Err((e, fallback)) => {
                        error!(candidate = %candidate.id, error = %e, "Failed to settle budget");
                        fallback
                    }
                };
                self.breaker.record_failure().await;

                let err = EnrichmentError::from(failure);
                attempts.push(EnrichmentAttempt {
                    strategy: Strategy::WebSearchEnhanced,
                    outcome: AttemptOutcome::Failed {
                        reason: err.to_string(),
                    },
                    cost: charged,
                    latency,
                });
                Err(err)
            }
        }
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let (budget, budget_error) = match self.budget.snapshot().await {
            Ok(snapshot) => (Some(snapshot), None),
            Err(e) => (None, Some(e.to_string())),
        };
        CoordinatorStatus {
            enabled: self.enabled,
            provider: self.provider.name().to_string(),
            budget,
            budget_error,
            breaker: self.breaker.status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::admission::{BUDGET_KEY, BudgetState, CircuitState};
    use crate::clock::ManualClock;
    use crate::enrichment::types::DecisionKind;
    use crate::error::SummaryError;
    use crate::provider::SummaryMode;
    use crate::store::{self, LibSqlStateStore};

    enum Script {
        Succeed(Decimal),
        Fail(Option<Decimal>),
        Hang,
    }

    struct MockProvider {
        script: Script,
        calls: AtomicUsize,
    }

    impl MockProvider {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl EnrichmentProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn invoke(
            &self,
            candidate: &PostCandidate,
            _timeout: Duration,
        ) -> Result<EnrichedSummary, ProviderFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Succeed(cost) => Ok(EnrichedSummary {
                    summary: format!("Researched: {}", candidate.title),
                    cost,
                    web_search_used: true,
                }),
                Script::Fail(partial) => {
                    let failure = ProviderFailure::new(FailureKind::Rejected, "HTTP 502");
                    Err(match partial {
                        Some(cost) => failure.with_partial_cost(cost),
                        None => failure,
                    })
                }
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Err(ProviderFailure::new(FailureKind::Request, "too late"))
                }
            }
        }
    }

    struct TextSummarizer;

    #[async_trait::async_trait]
    impl Summarizer for TextSummarizer {
        async fn summarize(
            &self,
            candidate: &PostCandidate,
            mode: SummaryMode,
        ) -> Result<String, SummaryError> {
            match mode {
                SummaryMode::TextOnly => Ok(format!("Summary of {}", candidate.title)),
                SummaryMode::Multimodal => Err(SummaryError::Unsupported("no vision".into())),
            }
        }
    }

    struct Harness {
        store: Arc<dyn StateStore>,
        clock: Arc<ManualClock>,
        provider: Arc<MockProvider>,
        coordinator: EnrichmentCoordinator,
    }

    fn config() -> EnrichmentConfig {
        let mut config = EnrichmentConfig::default();
        config.scoring.target_communities = vec!["SideProject".into()];
        config.scoring.trigger_keywords = vec!["launched".into()];
        config.scoring.minimal_text_length = 10;
        config.breaker.failure_threshold = 2;
        config.timeouts.call = Duration::from_millis(100);
        config
    }

    async fn harness_with(config: EnrichmentConfig, script: Script) -> Harness {
        let store: Arc<dyn StateStore> = Arc::new(LibSqlStateStore::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
        ));
        let provider = MockProvider::new(script);
        let coordinator = EnrichmentCoordinator::new(
            &config,
            Arc::clone(&store),
            clock.clone(),
            provider.clone(),
            Some(Arc::new(TextSummarizer)),
        )
        .await
        .unwrap();
        Harness {
            store,
            clock,
            provider,
            coordinator,
        }
    }

    async fn harness(script: Script) -> Harness {
        harness_with(config(), script).await
    }

    /// Community + keyword + engagement = 60.
    fn hot() -> PostCandidate {
        PostCandidate::from_post(
            "t3_hot",
            "We launched our app",
            "a long enough body about the project and its users",
            250,
            "SideProject",
            None,
        )
    }

    /// Only an external link: 10.
    fn cold() -> PostCandidate {
        PostCandidate::from_post(
            "t3_cold",
            "Weekend thoughts",
            "nothing much going on around here lately",
            2,
            "cooking",
            Some("https://example.org/post"),
        )
    }

    async fn budget_state(h: &Harness) -> Option<BudgetState> {
        store::load::<BudgetState>(h.store.as_ref(), BUDGET_KEY)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn eligible_candidate_is_enriched_and_committed() {
        let h = harness(Script::Succeed(dec!(0.02))).await;
        let result = h.coordinator.enrich(&hot()).await;

        assert_eq!(result.score, 60);
        assert_eq!(result.decision, DecisionKind::Eligible);
        assert_eq!(result.strategy, Strategy::WebSearchEnhanced);
        assert_eq!(result.summary.as_deref(), Some("Researched: We launched our app"));
        assert_eq!(result.total_cost, dec!(0.02));
        assert_eq!(h.provider.calls(), 1);

        let state = budget_state(&h).await.unwrap();
        assert_eq!(state.count, 1);
        assert_eq!(state.total_cost, dec!(0.02));
        assert!(state.holds.is_empty());
        assert_eq!(h.coordinator.breaker().status().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn ineligible_candidate_never_touches_provider_or_state() {
        let h = harness(Script::Succeed(dec!(0.02))).await;
        let result = h.coordinator.enrich(&cold()).await;

        assert_eq!(result.score, 10);
        assert_eq!(result.decision, DecisionKind::Ineligible);
        assert_eq!(result.strategy, Strategy::TextOnly);
        assert_eq!(h.provider.calls(), 0);
        assert!(budget_state(&h).await.is_none());
        assert!(
            h.store
                .load(crate::admission::BREAKER_KEY)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn failure_without_partial_cost_rolls_back() {
        let h = harness(Script::Fail(None)).await;
        let result = h.coordinator.enrich(&hot()).await;

        assert_eq!(result.decision, DecisionKind::Eligible);
        assert_eq!(result.strategy, Strategy::TextOnly);
        assert!(!result.attempts[0].succeeded());

        let state = budget_state(&h).await.unwrap();
        assert_eq!(state.count, 0);
        assert!(state.holds.is_empty());
        assert_eq!(h.coordinator.breaker().status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn negative_reported_cost_is_recorded_as_zero() {
        let h = harness(Script::Succeed(dec!(-0.5))).await;
        let result = h.coordinator.enrich(&hot()).await;

        assert_eq!(result.strategy, Strategy::WebSearchEnhanced);
        assert_eq!(result.attempts[0].cost, Decimal::ZERO);
        assert_eq!(result.total_cost, Decimal::ZERO);

        let state = budget_state(&h).await.unwrap();
        assert_eq!(state.count, 1);
        assert_eq!(state.total_cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn negative_partial_cost_is_recorded_as_zero() {
        let h = harness(Script::Fail(Some(dec!(-0.01)))).await;
        let result = h.coordinator.enrich(&hot()).await;

        assert_eq!(result.attempts[0].cost, Decimal::ZERO);
        assert_eq!(result.total_cost, Decimal::ZERO);
        assert_eq!(budget_state(&h).await.unwrap().total_cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn failure_with_partial_cost_commits_it() {
        let h = harness(Script::Fail(Some(dec!(0.01)))).await;
        let result = h.coordinator.enrich(&hot()).await;

        assert_eq!(result.total_cost, dec!(0.01));
        let state = budget_state(&h).await.unwrap();
        assert_eq!(state.count, 1);
        assert_eq!(state.total_cost, dec!(0.01));
        assert!(!state.history[0].success);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_and_rolls_back() {
        let h = harness(Script::Hang).await;
        let result = h.coordinator.enrich(&hot()).await;

        assert_eq!(result.strategy, Strategy::TextOnly);
        assert!(matches!(
            &result.attempts[0].outcome,
            AttemptOutcome::Failed { reason } if reason.contains("Timeout")
        ));
        assert_eq!(budget_state(&h).await.unwrap().count, 0);
        assert_eq!(h.coordinator.breaker().status().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn open_breaker_blocks_without_reserving() {
        let h = harness(Script::Fail(None)).await;
        h.coordinator.enrich(&hot()).await;
        h.coordinator.enrich(&hot()).await;
        assert_eq!(h.coordinator.breaker().status().state, CircuitState::Open);

        let result = h.coordinator.enrich(&hot()).await;
        assert_eq!(result.decision, DecisionKind::CircuitBlocked);
        assert_eq!(h.provider.calls(), 2);
        assert!(budget_state(&h).await.unwrap().holds.is_empty());
    }

    #[tokio::test]
    async fn exhausted_budget_blocks_and_releases_probe() {
        let mut config = config();
        config.budget.daily_limit = 1;
        let h = harness_with(config, Script::Fail(Some(dec!(0.03)))).await;

        // Uses the only call and records one failure.
        h.coordinator.enrich(&hot()).await;
        h.coordinator.enrich(&hot()).await;
        assert_eq!(h.provider.calls(), 1);

        // Open the breaker, then let it recover so the next call gets the probe.
        h.coordinator.breaker().record_failure().await;
        h.clock.advance(chrono::TimeDelta::seconds(1801));

        let result = h.coordinator.enrich(&hot()).await;
        assert_eq!(result.decision, DecisionKind::BudgetBlocked);
        assert!(!h.coordinator.breaker().status().probe_in_flight);
    }

    #[tokio::test]
    async fn disabled_scores_zero_and_skips_everything() {
        let mut config = config();
        config.enabled = false;
        let h = harness_with(config, Script::Succeed(dec!(0.02))).await;

        let result = h.coordinator.enrich(&hot()).await;
        assert_eq!(result.decision, DecisionKind::Disabled);
        assert_eq!(result.score, 0);
        assert!(result.matched_factors.is_empty());
        assert_eq!(h.provider.calls(), 0);
        assert!(budget_state(&h).await.is_none());
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let h = harness(Script::Succeed(dec!(0.02))).await;
        let results = h.coordinator.enrich_batch(&[cold(), hot(), cold()]).await;

        let ids: Vec<&str> = results.iter().map(|r| r.candidate_id.as_str()).collect();
        assert_eq!(ids, vec!["t3_cold", "t3_hot", "t3_cold"]);
        assert_eq!(h.provider.calls(), 1);
    }

    #[tokio::test]
    async fn status_reports_budget_and_breaker() {
        let h = harness(Script::Succeed(dec!(0.02))).await;
        h.coordinator.enrich(&hot()).await;

        let status = h.coordinator.status().await;
        assert!(status.enabled);
        assert_eq!(status.provider, "mock");
        let budget = status.budget.unwrap();
        assert_eq!(budget.count, 1);
        assert_eq!(budget.remaining_calls, 14);
        assert_eq!(status.breaker.state, CircuitState::Closed);
    }
}
