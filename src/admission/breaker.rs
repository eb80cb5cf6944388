//! Circuit breaker guarding the enrichment provider.
//!
//! `Closed → Open → HalfOpen → {Closed | Open}`. The state is loaded once per
//! run; afterwards the in-memory copy answers `Closed` checks directly and
//! every transition is applied to the freshest persisted record by
//! compare-and-swap, then adopted in memory.
//!
//! The half-open probe is a lease: `probe_started_at` marks it taken, and a
//! lease older than the recovery timeout counts as abandoned.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::BreakerConfig;
use crate::error::StoreError;
use crate::store::{self, Mutation, StateStore};

/// Store key of the breaker record.
pub const BREAKER_KEY: &str = "enrichment_circuit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are refused until the recovery timeout elapses.
    Open,
    /// One probing call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Persisted breaker record body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probe_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_started_at: None,
            last_failure_at: None,
        }
    }
}

/// Time since `since`, never negative.
fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> TimeDelta {
    (now - since).max(TimeDelta::zero())
}

impl BreakerState {
    fn opened(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Open,
            opened_at: Some(now),
            ..Self::default()
        }
    }

    /// Decide whether a call may go through, moving Open → HalfOpen once the
    /// recovery timeout has passed.
    fn allow(&mut self, now: DateTime<Utc>, recovery: TimeDelta) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = match self.opened_at {
                    Some(at) if at <= now => at,
                    // Missing or in the future after a clock jump.
                    _ => {
                        self.opened_at = Some(now);
                        now
                    }
                };
                if elapsed(now, opened_at) < recovery {
                    return false;
                }
                self.state = CircuitState::HalfOpen;
                self.probe_started_at = Some(now);
                true
            }
            CircuitState::HalfOpen => match self.probe_started_at {
                Some(started) if started > now => {
                    self.probe_started_at = Some(now);
                    false
                }
                Some(started) if elapsed(now, started) < recovery => false,
                // No lease, or the previous probe was abandoned.
                _ => {
                    self.probe_started_at = Some(now);
                    true
                }
            },
        }
    }

    fn success(&mut self) {
        *self = Self {
            last_failure_at: self.last_failure_at,
            ..Self::default()
        };
    }

    fn failure(&mut self, now: DateTime<Utc>, threshold: u32) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);
        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.probe_started_at = None;
            }
            CircuitState::Open => {
                if self.opened_at.is_none() {
                    self.opened_at = Some(now);
                }
            }
        }
    }

    fn abandon_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_started_at = None;
        }
    }
}

/// Breaker state for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Earliest moment an Open breaker will allow a probe.
    pub retry_at: Option<DateTime<Utc>>,
    pub probe_in_flight: bool,
    pub last_failure_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: BreakerConfig,
    lock_timeout: Duration,
    current: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Load the persisted state. An unreadable record starts the breaker Open.
    pub async fn load(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: BreakerConfig,
        lock_timeout: Duration,
    ) -> Self {
        let initial = match store::load::<BreakerState>(store.as_ref(), BREAKER_KEY).await {
            Ok(Some(state)) => {
                debug!(
                    state = %state.state,
                    failures = state.consecutive_failures,
                    "Circuit state loaded"
                );
                state
            }
            Ok(None) => BreakerState::default(),
            Err(e) => {
                error!(error = %e, "Circuit state unreadable, starting open");
                BreakerState::opened(clock.now())
            }
        };

        Self {
            store,
            clock,
            config,
            lock_timeout,
            current: Mutex::new(initial),
        }
    }

    fn recovery(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.recovery_timeout)
            .unwrap_or_else(|_| TimeDelta::days(365))
    }

    fn snapshot(&self) -> BreakerState {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn adopt(&self, next: BreakerState) {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if current.state != next.state {
            match next.state {
                CircuitState::Open => warn!(
                    failures = next.consecutive_failures,
                    opened_at = ?next.opened_at,
                    "Circuit opened"
                ),
                CircuitState::HalfOpen => info!("Circuit half-open, allowing one probe"),
                CircuitState::Closed => info!("Circuit closed"),
            }
        }
        *current = next;
    }

    /// Apply `transition` to the freshest persisted state and adopt the result.
    ///
    /// A record that no longer decodes is replaced, starting from the
    /// in-memory state. On a store failure the transition is applied to the
    /// in-memory state only and `None` is returned.
    async fn transition<R, F>(&self, mut transition: F) -> Option<R>
    where
        R: Send,
        F: FnMut(&mut BreakerState) -> R + Send,
    {
        let fallback = self.snapshot();
        let result = store::mutate::<serde_json::Value, _, StoreError, _>(
            self.store.as_ref(),
            BREAKER_KEY,
            self.lock_timeout,
            |stored| {
                let before = match stored {
                    Some(value) => serde_json::from_value(value).unwrap_or_else(|e| {
                        warn!(error = %e, "Circuit record unreadable, overwriting");
                        fallback.clone()
                    }),
                    None => fallback.clone(),
                };
                let mut next = before.clone();
                let out = transition(&mut next);
                if next == before {
                    Ok(Mutation::Keep((out, next)))
                } else {
                    Ok(Mutation::Write(serde_json::to_value(&next)?, (out, next)))
                }
            },
        )
        .await;

        match result {
            Ok((out, next)) => {
                self.adopt(next);
                Some(out)
            }
            Err(e) => {
                error!(error = %e, "Failed to persist circuit state, keeping in-memory state");
                let mut next = fallback;
                transition(&mut next);
                self.adopt(next);
                None
            }
        }
    }

    /// Whether an enrichment call may be attempted now.
    pub async fn allow_request(&self) -> bool {
        if self.snapshot().state == CircuitState::Closed {
            return true;
        }

        let now = self.clock.now();
        let recovery = self.recovery();
        match self.transition(|state| state.allow(now, recovery)).await {
            Some(allowed) => {
                if !allowed {
                    debug!("Circuit open, request denied");
                }
                allowed
            }
            // A probe whose lease could not be persisted is not granted.
            None => false,
        }
    }

    /// Record a successful call.
    pub async fn record_success(&self) -> CircuitState {
        self.transition(BreakerState::success).await;
        self.status().state
    }

    /// Record a failed or timed-out call.
    pub async fn record_failure(&self) -> CircuitState {
        let now = self.clock.now();
        let threshold = self.config.failure_threshold;
        self.transition(|state| state.failure(now, threshold)).await;
        self.status().state
    }

    /// Release a probe lease that will not be used.
    pub async fn abandon_probe(&self) {
        if self.snapshot().state != CircuitState::HalfOpen {
            return;
        }
        self.transition(BreakerState::abandon_probe).await;
        debug!("Probe lease released");
    }

    pub fn status(&self) -> BreakerStatus {
        let state = self.snapshot();
        let retry_at = match state.state {
            CircuitState::Open => state.opened_at.map(|at| at + self.recovery()),
            _ => None,
        };
        BreakerStatus {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            opened_at: state.opened_at,
            retry_at,
            probe_in_flight: state.state == CircuitState::HalfOpen
                && state.probe_started_at.is_some(),
            last_failure_at: state.last_failure_at,
        }
    }
}
