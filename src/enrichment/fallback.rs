//! Fallback summarization chain.
//!
//! Walks progressively cheaper strategies until one yields a result:
//! multimodal (only when the candidate has images), text-only, and finally
//! no summary at all, which cannot fail. Errors never leave the chain; each
//! one becomes a failed attempt on the candidate's record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::enrichment::types::{AttemptOutcome, EnrichmentAttempt, PostCandidate, Strategy};
use crate::error::SummaryError;
use crate::provider::{Summarizer, SummaryMode};

/// Final strategy and its summary.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutcome {
    pub strategy: Strategy,
    pub summary: Option<String>,
}

pub struct FallbackChain {
    summarizer: Option<Arc<dyn Summarizer>>,
    summary_timeout: Duration,
}

impl FallbackChain {
    pub fn new(summarizer: Option<Arc<dyn Summarizer>>, summary_timeout: Duration) -> Self {
        Self {
            summarizer,
            summary_timeout,
        }
    }

    /// Chain that goes straight to no-summary.
    pub fn without_summarizer() -> Self {
        Self::new(None, Duration::ZERO)
    }

    /// Run the chain for `candidate`, appending one attempt per step tried.
    pub async fn run(
        &self,
        candidate: &PostCandidate,
        attempts: &mut Vec<EnrichmentAttempt>,
    ) -> ChainOutcome {
        if let Some(summarizer) = &self.summarizer {
            let steps = [
                (Strategy::Multimodal, SummaryMode::Multimodal),
                (Strategy::TextOnly, SummaryMode::TextOnly),
            ];
            for (strategy, mode) in steps {
                if mode == SummaryMode::Multimodal && !candidate.has_image {
                    continue;
                }

                let started = Instant::now();
                let result = match tokio::time::timeout(
                    self.summary_timeout,
                    summarizer.summarize(candidate, mode),
                )
                .await
                {
                    Ok(Ok(text)) if text.trim().is_empty() => Err(SummaryError::Empty),
                    Ok(result) => result,
                    Err(_) => Err(SummaryError::Timeout(self.summary_timeout)),
                };
                let latency = started.elapsed();

                match result {
                    Ok(text) => {
                        debug!(candidate = %candidate.id, %strategy, "Fallback summary produced");
                        attempts.push(EnrichmentAttempt {
                            strategy,
                            outcome: AttemptOutcome::Succeeded,
                            cost: Decimal::ZERO,
                            latency,
                        });
                        return ChainOutcome {
                            strategy,
                            summary: Some(text.trim().to_string()),
                        };
                    }
                    Err(e) => {
                        warn!(
                            candidate = %candidate.id,
                            %strategy,
                            error = %e,
                            "Fallback step failed"
                        );
                        attempts.push(EnrichmentAttempt {
                            strategy,
                            outcome: AttemptOutcome::Failed {
                                reason: e.to_string(),
                            },
                            cost: Decimal::ZERO,
                            latency,
                        });
                    }
                }
            }
        }

        attempts.push(EnrichmentAttempt {
            strategy: Strategy::NoSummary,
            outcome: AttemptOutcome::Succeeded,
            cost: Decimal::ZERO,
            latency: Duration::ZERO,
        });
        ChainOutcome {
            strategy: Strategy::NoSummary,
            summary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Summarizer that answers each mode from a fixed script and records calls.
    struct ScriptedSummarizer {
        multimodal: Result<&'static str, &'static str>,
        text_only: Result<&'static str, &'static str>,
        delay: Duration,
        calls: Mutex<Vec<SummaryMode>>,
    }

    impl ScriptedSummarizer {
        fn new(
            multimodal: Result<&'static str, &'static str>,
            text_only: Result<&'static str, &'static str>,
        ) -> Self {
            Self {
                multimodal,
                text_only,
                delay: Duration::ZERO,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<SummaryMode> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Summarizer for ScriptedSummarizer {
        async fn summarize(
            &self,
            _candidate: &PostCandidate,
            mode: SummaryMode,
        ) -> Result<String, SummaryError> {
            self.calls.lock().unwrap().push(mode);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = match mode {
                SummaryMode::Multimodal => self.multimodal,
                SummaryMode::TextOnly => self.text_only,
            };
            scripted
                .map(String::from)
                .map_err(|e| SummaryError::RequestFailed(e.into()))
        }
    }

    fn candidate(has_image: bool) -> PostCandidate {
        PostCandidate {
            id: "t3_chain".into(),
            title: "A post".into(),
            body: "body".into(),
            engagement: 1,
            community: "c".into(),
            url: None,
            linked_domain: None,
            has_image,
            image_urls: if has_image {
                vec!["https://i.redd.it/x.png".into()]
            } else {
                vec![]
            },
            body_length: 4,
        }
    }

    fn chain(summarizer: Arc<ScriptedSummarizer>) -> FallbackChain {
        FallbackChain::new(Some(summarizer), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn multimodal_first_when_images_present() {
        let s = Arc::new(ScriptedSummarizer::new(Ok("with pictures"), Ok("plain")));
        let mut attempts = Vec::new();
        let out = chain(s.clone()).run(&candidate(true), &mut attempts).await;

        assert_eq!(out.strategy, Strategy::Multimodal);
        assert_eq!(out.summary.as_deref(), Some("with pictures"));
        assert_eq!(s.calls(), vec![SummaryMode::Multimodal]);
        assert_eq!(attempts.len(), 1);
    }

    #[tokio::test]
    async fn skips_multimodal_without_images() {
        let s = Arc::new(ScriptedSummarizer::new(Ok("with pictures"), Ok("plain")));
        let mut attempts = Vec::new();
        let out = chain(s.clone()).run(&candidate(false), &mut attempts).await;

        assert_eq!(out.strategy, Strategy::TextOnly);
        assert_eq!(s.calls(), vec![SummaryMode::TextOnly]);
    }

    #[tokio::test]
    async fn falls_through_failures_to_no_summary() {
        let s = Arc::new(ScriptedSummarizer::new(Err("vision down"), Err("llm down")));
        let mut attempts = Vec::new();
        let out = chain(s).run(&candidate(true), &mut attempts).await;

        assert_eq!(out.strategy, Strategy::NoSummary);
        assert!(out.summary.is_none());
        let strategies: Vec<Strategy> = attempts.iter().map(|a| a.strategy).collect();
        assert_eq!(
            strategies,
            vec![Strategy::Multimodal, Strategy::TextOnly, Strategy::NoSummary]
        );
        assert!(!attempts[0].succeeded());
        assert!(attempts[2].succeeded());
    }

    #[tokio::test]
    async fn empty_summary_counts_as_failure() {
        let s = Arc::new(ScriptedSummarizer::new(Ok("   "), Ok("plain")));
        let mut attempts = Vec::new();
        let out = chain(s).run(&candidate(true), &mut attempts).await;

        assert_eq!(out.strategy, Strategy::TextOnly);
        assert_eq!(
            attempts[0].outcome,
            AttemptOutcome::Failed {
                reason: SummaryError::Empty.to_string()
            }
        );
    }

    #[tokio::test]
    async fn slow_summarizer_times_out() {
        let mut s = ScriptedSummarizer::new(Ok("late"), Ok("late"));
        s.delay = Duration::from_millis(200);
        let chain = FallbackChain::new(Some(Arc::new(s)), Duration::from_millis(20));

        let mut attempts = Vec::new();
        let out = chain.run(&candidate(false), &mut attempts).await;
        assert_eq!(out.strategy, Strategy::NoSummary);
        assert!(matches!(attempts[0].outcome, AttemptOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn no_summarizer_goes_straight_to_no_summary() {
        let mut attempts = Vec::new();
        let out = FallbackChain::without_summarizer()
            .run(&candidate(true), &mut attempts)
            .await;
        assert_eq!(out.strategy, Strategy::NoSummary);
        assert_eq!(attempts.len(), 1);
    }
}
