//! Admission control: durable daily budget and provider circuit breaker.

pub mod breaker;
pub mod budget;

pub use breaker::{BreakerState, BreakerStatus, CircuitBreaker, CircuitState, BREAKER_KEY};
pub use budget::{BudgetSnapshot, BudgetState, BudgetTracker, Reservation, BUDGET_KEY};
