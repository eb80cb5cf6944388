//! Daily enrichment budget.
//!
//! A single versioned record tracks the current day's committed call count
//! and cost, plus the provisional holds of calls in flight. Holds count
//! toward both limits, so overlapping runs cannot jointly overshoot.
//!
//! Every operation is a read → modify → compare-and-swap cycle through
//! [`store::mutate`], so the record is written before the call returns.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::BudgetConfig;
use crate::error::{BudgetError, ExhaustedReason, StoreError};
use crate::store::{self, Mutation, StateStore};

/// Store key of the budget record.
pub const BUDGET_KEY: &str = "enrichment_budget";

/// Settled calls kept in the record.
const MAX_HISTORY: usize = 200;

/// History descriptions are cut to this many characters.
const DESCRIPTION_LIMIT: usize = 50;

/// A provisional hold on budget, returned by [`BudgetTracker::reserve`].
///
/// Must be settled with `commit`, `commit_failed` or `rollback`. A hold that
/// is never settled is released after the configured grace period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub estimated_cost: Decimal,
    /// Budget day the hold was taken on.
    pub date: NaiveDate,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hold {
    pub id: Uuid,
    pub estimate: Decimal,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub description: String,
    pub cost: Decimal,
    pub success: bool,
}

/// Persisted budget record body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetState {
    pub date: NaiveDate,
    pub count: u32,
    pub total_cost: Decimal,
    #[serde(default)]
    pub holds: Vec<Hold>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Actual cost the daily cap kept from being charged.
    #[serde(default)]
    pub unbilled_overage: Decimal,
}

impl BudgetState {
    pub fn fresh(date: NaiveDate) -> Self {
        Self {
            date,
            count: 0,
            total_cost: Decimal::ZERO,
            holds: Vec::new(),
            history: Vec::new(),
            unbilled_overage: Decimal::ZERO,
        }
    }

    pub fn held_cost(&self) -> Decimal {
        self.holds.iter().map(|h| h.estimate).sum()
    }

    /// Drop holds older than `grace`. Returns how many were released.
    fn release_stale(&mut self, now: DateTime<Utc>, grace: TimeDelta) -> usize {
        let before = self.holds.len();
        self.holds.retain(|h| now - h.created_at < grace);
        before - self.holds.len()
    }

    fn remove_hold(&mut self, id: Uuid) -> Option<Hold> {
        let idx = self.holds.iter().position(|h| h.id == id)?;
        Some(self.holds.remove(idx))
    }

    fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }
}

/// Point-in-time view of the budget for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub date: NaiveDate,
    pub count: u32,
    pub total_cost: Decimal,
    pub open_holds: usize,
    pub remaining_calls: u32,
    pub remaining_budget: Decimal,
    pub unbilled_overage: Decimal,
}

/// Durable daily quota on enrichment calls.
pub struct BudgetTracker {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: BudgetConfig,
    lock_timeout: Duration,
}

impl BudgetTracker {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        config: BudgetConfig,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            lock_timeout,
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    fn grace(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.reservation_grace)
            .unwrap_or_else(|_| TimeDelta::days(365))
    }

    /// Load the stored state, rolling it onto today's epoch and releasing
    /// stale holds. The flag reports whether anything changed.
    fn current(&self, stored: Option<BudgetState>) -> (BudgetState, bool) {
        let today = self.clock.today();
        let (mut state, mut changed) = match stored {
            Some(state) if state.date == today => (state, false),
            Some(state) => {
                info!(
                    previous = %state.date,
                    today = %today,
                    count = state.count,
                    total_cost = %state.total_cost,
                    "New budget day, resetting usage"
                );
                (BudgetState::fresh(today), true)
            }
            None => (BudgetState::fresh(today), true),
        };

        let released = state.release_stale(self.clock.now(), self.grace());
        if released > 0 {
            warn!(released, "Released stale budget holds");
            changed = true;
        }
        (state, changed)
    }

    /// Reserve `estimated_cost` for one call.
    pub async fn reserve(&self, estimated_cost: Decimal) -> Result<Reservation, BudgetError> {
        self.reserve_for(estimated_cost, "enrichment").await
    }

    /// Reserve with a label that ends up in the call history.
    pub async fn reserve_for(
        &self,
        estimated_cost: Decimal,
        label: &str,
    ) -> Result<Reservation, BudgetError> {
        let limit = self.config.daily_limit;
        let cost_limit = self.config.daily_cost_limit;

        let outcome = store::mutate::<BudgetState, _, BudgetError, _>(
            self.store.as_ref(),
            BUDGET_KEY,
            self.lock_timeout,
            |stored| {
                let (mut state, changed) = self.current(stored);

                let in_use = state.count as usize + state.holds.len();
                let refusal = if in_use >= limit as usize {
                    Some(ExhaustedReason::DailyCount)
                } else if state.total_cost + state.held_cost() + estimated_cost > cost_limit {
                    Some(ExhaustedReason::DailyCost)
                } else {
                    None
                };

                if let Some(reason) = refusal {
                    return Ok(if changed {
                        Mutation::Write(state, Err(reason))
                    } else {
                        Mutation::Keep(Err(reason))
                    });
                }

                let reservation = Reservation {
                    id: Uuid::new_v4(),
                    estimated_cost,
                    date: state.date,
                    label: label.to_string(),
                };
                state.holds.push(Hold {
                    id: reservation.id,
                    estimate: estimated_cost,
                    created_at: self.clock.now(),
                });
                Ok(Mutation::Write(state, Ok(reservation)))
            },
        )
        .await;

        match outcome {
            Ok(Ok(reservation)) => {
                debug!(id = %reservation.id, cost = %estimated_cost, "Budget reserved");
                Ok(reservation)
            }
            Ok(Err(reason)) => {
                info!(%reason, "Budget reservation refused");
                Err(BudgetError::Exceeded { reason })
            }
            Err(BudgetError::Persistence(e)) => {
                error!(error = %e, "Budget state unavailable, refusing reservation");
                Err(BudgetError::Exceeded {
                    reason: ExhaustedReason::StateUnavailable,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Settle a successful call at `actual_cost`. Returns the amount charged.
    pub async fn commit(
        &self,
        reservation: &Reservation,
        actual_cost: Decimal,
    ) -> Result<Decimal, BudgetError> {
        self.settle(reservation, actual_cost, true).await
    }

    /// Settle a failed call that still incurred `partial_cost`.
    pub async fn commit_failed(
        &self,
        reservation: &Reservation,
        partial_cost: Decimal,
    ) -> Result<Decimal, BudgetError> {
        self.settle(reservation, partial_cost, false).await
    }

    async fn settle(
        &self,
        reservation: &Reservation,
        actual_cost: Decimal,
        success: bool,
    ) -> Result<Decimal, BudgetError> {
        let actual_cost = actual_cost.max(Decimal::ZERO);
        let limit = self.config.daily_limit;
        let cost_limit = self.config.daily_cost_limit;

        let (charged, overage) = store::mutate::<BudgetState, _, BudgetError, _>(
            self.store.as_ref(),
            BUDGET_KEY,
            self.lock_timeout,
            |stored| {
                let (mut state, _) = self.current(stored);

                if state.remove_hold(reservation.id).is_none() {
                    warn!(
                        id = %reservation.id,
                        "Committing a hold that is no longer open, charging current day"
                    );
                }

                let headroom = (cost_limit - state.total_cost).max(Decimal::ZERO);
                let charged = actual_cost.min(headroom);
                let overage = actual_cost - charged;

                state.total_cost += charged;
                state.unbilled_overage += overage;
                if state.count < limit {
                    state.count += 1;
                } else {
                    warn!(limit, "Call committed past the daily count limit");
                }
                state.push_history(HistoryEntry {
                    at: self.clock.now(),
                    description: reservation.label.chars().take(DESCRIPTION_LIMIT).collect(),
                    cost: charged,
                    success,
                });
                Ok(Mutation::Write(state, (charged, overage)))
            },
        )
        .await?;

        if overage > Decimal::ZERO {
            warn!(
                id = %reservation.id,
                %charged,
                %overage,
                "Actual cost exceeded daily headroom, overage left unbilled"
            );
        }
        debug!(id = %reservation.id, %charged, success, "Budget committed");
        Ok(charged)
    }

    /// Release a hold that was never consumed.
    pub async fn rollback(&self, reservation: &Reservation) -> Result<(), BudgetError> {
        let released = store::mutate::<BudgetState, _, BudgetError, _>(
            self.store.as_ref(),
            BUDGET_KEY,
            self.lock_timeout,
            |stored| {
                let (mut state, changed) = self.current(stored);
                let released = state.remove_hold(reservation.id).is_some();
                Ok(if released || changed {
                    Mutation::Write(state, released)
                } else {
                    Mutation::Keep(false)
                })
            },
        )
        .await?;

        debug!(id = %reservation.id, released, "Budget rolled back");
        Ok(())
    }

    /// Reset usage if the stored day is not today. Returns `true` when a
    /// reset was written.
    pub async fn reset_if_new_day(&self) -> Result<bool, BudgetError> {
        let today = self.clock.today();
        store::mutate::<BudgetState, _, BudgetError, _>(
            self.store.as_ref(),
            BUDGET_KEY,
            self.lock_timeout,
            |stored| match stored {
                Some(state) if state.date != today => {
                    let (state, _) = self.current(Some(state));
                    Ok(Mutation::Write(state, true))
                }
                _ => Ok(Mutation::Keep(false)),
            },
        )
        .await
    }

    /// Current usage without modifying the record.
    pub async fn snapshot(&self) -> Result<BudgetSnapshot, StoreError> {
        let stored = store::load::<BudgetState>(self.store.as_ref(), BUDGET_KEY).await?;
        let (state, _) = self.current(stored);

        let in_use = state.count + state.holds.len() as u32;
        Ok(BudgetSnapshot {
            date: state.date,
            count: state.count,
            total_cost: state.total_cost,
            open_holds: state.holds.len(),
            remaining_calls: self.config.daily_limit.saturating_sub(in_use),
            remaining_budget: (self.config.daily_cost_limit - state.total_cost - state.held_cost())
                .max(Decimal::ZERO),
            unbilled_overage: state.unbilled_overage,
        })
    }

    /// Settled calls for the current record, oldest first.
    pub async fn history(&self) -> Result<Vec<HistoryEntry>, StoreError> {
        let stored = store::load::<BudgetState>(self.store.as_ref(), BUDGET_KEY).await?;
        Ok(self.current(stored).0.history)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LibSqlStateStore;

    struct Harness {
        store: Arc<dyn StateStore>,
        clock: Arc<ManualClock>,
        tracker: BudgetTracker,
    }

    fn budget(daily_limit: u32, cost_limit: Decimal) -> BudgetConfig {
        BudgetConfig {
            daily_limit,
            daily_cost_limit: cost_limit,
            cost_per_call: dec!(0.03),
            reservation_grace: Duration::from_secs(900),
        }
    }

    async fn harness(config: BudgetConfig) -> Harness {
        let store: Arc<dyn StateStore> = Arc::new(LibSqlStateStore::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap(),
        ));
        let tracker = BudgetTracker::new(
            Arc::clone(&store),
            clock.clone(),
            config,
            Duration::from_secs(2),
        );
        Harness {
            store,
            clock,
            tracker,
        }
    }

    async fn stored(h: &Harness) -> BudgetState {
        store::load::<BudgetState>(h.store.as_ref(), BUDGET_KEY)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn reserve_and_commit_charges_actual_cost() {
        let h = harness(budget(15, dec!(1.50))).await;

        let r = h.tracker.reserve(dec!(0.03)).await.unwrap();
        assert_eq!(stored(&h).await.holds.len(), 1);

        let charged = h.tracker.commit(&r, dec!(0.02)).await.unwrap();
        assert_eq!(charged, dec!(0.02));

        let state = stored(&h).await;
        assert_eq!(state.count, 1);
        assert_eq!(state.total_cost, dec!(0.02));
        assert!(state.holds.is_empty());
        assert_eq!(state.history.len(), 1);
        assert!(state.history[0].success);
    }

    #[tokio::test]
    async fn rollback_does_not_count() {
        let h = harness(budget(15, dec!(1.50))).await;
        let r = h.tracker.reserve(dec!(0.03)).await.unwrap();
        h.tracker.rollback(&r).await.unwrap();

        let state = stored(&h).await;
        assert_eq!(state.count, 0);
        assert_eq!(state.total_cost, Decimal::ZERO);
        assert!(state.holds.is_empty());
    }

    #[tokio::test]
    async fn rollback_of_unknown_hold_is_noop() {
        let h = harness(budget(15, dec!(1.50))).await;
        let r = h.tracker.reserve(dec!(0.03)).await.unwrap();
        h.tracker.commit(&r, dec!(0.03)).await.unwrap();
        let version = h.store.load(BUDGET_KEY).await.unwrap().unwrap().version;

        h.tracker.rollback(&r).await.unwrap();
        assert_eq!(h.store.load(BUDGET_KEY).await.unwrap().unwrap().version, version);
        assert_eq!(stored(&h).await.count, 1);
    }

    #[tokio::test]
    async fn count_limit_blocks() {
        let h = harness(budget(2, dec!(10))).await;
        for _ in 0..2 {
            let r = h.tracker.reserve(dec!(0.03)).await.unwrap();
            h.tracker.commit(&r, dec!(0.03)).await.unwrap();
        }
        let err = h.tracker.reserve(dec!(0.03)).await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::Exceeded {
                reason: ExhaustedReason::DailyCount
            }
        ));
    }

    #[tokio::test]
    async fn cost_limit_blocks_before_crossing() {
        let h = harness(budget(100, dec!(0.10))).await;
        for _ in 0..3 {
            let r = h.tracker.reserve(dec!(0.03)).await.unwrap();
            h.tracker.commit(&r, dec!(0.03)).await.unwrap();
        }
        // 0.09 + 0.03 would cross 0.10.
        let err = h.tracker.reserve(dec!(0.03)).await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::Exceeded {
                reason: ExhaustedReason::DailyCost
            }
        ));
        // An exact fit is still allowed.
        assert!(h.tracker.reserve(dec!(0.01)).await.is_ok());
    }

    #[tokio::test]
    async fn open_holds_count_toward_limits() {
        let h = harness(budget(2, dec!(10))).await;
        let _a = h.tracker.reserve(dec!(0.03)).await.unwrap();
        let _b = h.tracker.reserve(dec!(0.03)).await.unwrap();
        assert!(h.tracker.reserve(dec!(0.03)).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overshoot() {
        let h = harness(budget(5, dec!(1.50))).await;
        let tracker = Arc::new(h.tracker);

        let mut handles = Vec::new();
        for _ in 0..12 {
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                match tracker.reserve(dec!(0.03)).await {
                    Ok(r) => tracker.commit(&r, dec!(0.03)).await.map(|_| true),
                    Err(BudgetError::Exceeded { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 5);

        let snapshot = tracker.snapshot().await.unwrap();
        assert_eq!(snapshot.count, 5);
        assert_eq!(snapshot.remaining_calls, 0);
    }

    #[tokio::test]
    async fn commit_caps_at_headroom_and_records_overage() {
        let h = harness(budget(15, dec!(0.10))).await;
        let r = h.tracker.reserve(dec!(0.03)).await.unwrap();
        h.tracker.commit(&r, dec!(0.05)).await.unwrap();

        let r = h.tracker.reserve(dec!(0.03)).await.unwrap();
        let charged = h.tracker.commit(&r, dec!(0.08)).await.unwrap();
        assert_eq!(charged, dec!(0.05));

        let state = stored(&h).await;
        assert_eq!(state.total_cost, dec!(0.10));
        assert_eq!(state.unbilled_overage, dec!(0.03));
    }

    #[tokio::test]
    async fn new_day_resets_once() {
        let h = harness(budget(15, dec!(1.50))).await;
        let r = h.tracker.reserve(dec!(0.03)).await.unwrap();
        h.tracker.commit(&r, dec!(0.03)).await.unwrap();

        // Same day: nothing to reset.
        assert!(!h.tracker.reset_if_new_day().await.unwrap());

        h.clock.advance(TimeDelta::days(1));
        assert!(h.tracker.reset_if_new_day().await.unwrap());
        assert!(!h.tracker.reset_if_new_day().await.unwrap());

        let state = stored(&h).await;
        assert_eq!(state.date, NaiveDate::from_ymd_opt(2026, 3, 15).unwrap());
        assert_eq!(state.count, 0);
        assert_eq!(state.total_cost, Decimal::ZERO);
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn reserve_rolls_into_new_day() {
        let h = harness(budget(1, dec!(1.50))).await;
        let r = h.tracker.reserve(dec!(0.03)).await.unwrap();
        h.tracker.commit(&r, dec!(0.03)).await.unwrap();
        assert!(h.tracker.reserve(dec!(0.03)).await.is_err());

        h.clock.advance(TimeDelta::days(1));
        assert!(h.tracker.reserve(dec!(0.03)).await.is_ok());
    }

    #[tokio::test]
    async fn commit_after_day_reset_charges_current_day() {
        let h = harness(budget(15, dec!(1.50))).await;
        let r = h.tracker.reserve(dec!(0.03)).await.unwrap();

        h.clock.advance(TimeDelta::days(1));
        h.tracker.commit(&r, dec!(0.03)).await.unwrap();

        let state = stored(&h).await;
        assert_eq!(state.date, NaiveDate::from_ymd_opt(2026, 3, 15).unwrap());
        assert_eq!(state.count, 1);
    }

    #[tokio::test]
    async fn stale_holds_are_released() {
        let h = harness(budget(1, dec!(1.50))).await;
        let _abandoned = h.tracker.reserve(dec!(0.03)).await.unwrap();
        assert!(h.tracker.reserve(dec!(0.03)).await.is_err());

        h.clock.advance(TimeDelta::minutes(16));
        assert!(h.tracker.reserve(dec!(0.03)).await.is_ok());
        assert_eq!(stored(&h).await.holds.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_record_fails_safe() {
        let h = harness(budget(15, dec!(1.50))).await;
        h.store
            .compare_and_swap(BUDGET_KEY, None, serde_json::json!({"date": "garbage"}))
            .await
            .unwrap();

        let err = h.tracker.reserve(dec!(0.03)).await.unwrap_err();
        assert!(matches!(
            err,
            BudgetError::Exceeded {
                reason: ExhaustedReason::StateUnavailable
            }
        ));
    }

    #[tokio::test]
    async fn history_is_bounded_and_descriptions_truncated() {
        let h = harness(budget(500, dec!(100))).await;
        let label = "x".repeat(80);
        for _ in 0..(MAX_HISTORY + 5) {
            let r = h.tracker.reserve_for(dec!(0.01), &label).await.unwrap();
            h.tracker.commit_failed(&r, dec!(0)).await.unwrap();
        }
        let history = h.tracker.history().await.unwrap();
        assert_eq!(history.len(), MAX_HISTORY);
        assert_eq!(history[0].description.chars().count(), DESCRIPTION_LIMIT);
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn snapshot_of_empty_store() {
        let h = harness(budget(15, dec!(1.50))).await;
        let snapshot = h.tracker.snapshot().await.unwrap();
        assert_eq!(snapshot.count, 0);
        assert_eq!(snapshot.remaining_calls, 15);
        assert_eq!(snapshot.remaining_budget, dec!(1.50));
        // Snapshots never write.
        assert!(h.store.load(BUDGET_KEY).await.unwrap().is_none());
    }
}
