//! Error types for the enrichment subsystem.

use std::time::Duration;

use rust_decimal::Decimal;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid pattern for {key}: {source}")]
    InvalidPattern {
        key: String,
        #[source]
        source: regex::Error,
    },
}

/// Durable state store errors.
///
/// Any of these on the budget path means "budget unavailable"; on the
/// breaker path it means "keep the last known state".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Record {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Timed out after {waited:?} waiting for record {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("Database error: {0}")]
    Database(String),

    /// Another writer holds the database lock. Retryable.
    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a reservation was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedReason {
    /// Daily call count reached.
    DailyCount,
    /// Daily cost ceiling would be crossed.
    DailyCost,
    /// The persisted budget record is unreadable; treated as exhausted.
    StateUnavailable,
}

impl std::fmt::Display for ExhaustedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DailyCount => "daily call limit reached",
            Self::DailyCost => "daily cost limit reached",
            Self::StateUnavailable => "budget state unavailable",
        };
        write!(f, "{s}")
    }
}

/// Budget tracker errors.
#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("Budget exceeded: {reason}")]
    Exceeded { reason: ExhaustedReason },

    #[error("Budget persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

/// Classification of a failed enrichment call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The call did not finish within its deadline.
    Timeout,
    /// Transport-level failure (connect, TLS, reset).
    Request,
    /// The provider answered with an error status.
    Rejected,
    /// The provider answered, but the body was unusable.
    InvalidResponse,
}

/// A failed enrichment call, as reported by the provider.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {reason}")]
pub struct ProviderFailure {
    pub kind: FailureKind,
    pub reason: String,
    /// Cost the provider says was incurred before failing, if any.
    pub partial_cost: Option<Decimal>,
}

impl ProviderFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            partial_cost: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(FailureKind::Timeout, format!("no response after {after:?}"))
    }

    pub fn with_partial_cost(mut self, cost: Decimal) -> Self {
        self.partial_cost = Some(cost);
        self
    }
}

/// Fallback summarizer errors.
#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("Summarizer request failed: {0}")]
    RequestFailed(String),

    #[error("Summarizer timed out after {0:?}")]
    Timeout(Duration),

    #[error("Summarizer returned an empty summary")]
    Empty,

    #[error("Mode not supported for this candidate: {0}")]
    Unsupported(String),
}

/// The subsystem's error taxonomy.
///
/// Every variant is non-fatal: the coordinator records it on the attempt and
/// moves on to the next strategy.
#[derive(Debug, thiserror::Error)]
pub enum EnrichmentError {
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(ExhaustedReason),

    #[error("Circuit open: provider presumed unhealthy")]
    CircuitOpen,

    #[error("Provider failure: {0}")]
    ProviderFailure(#[from] ProviderFailure),

    #[error("State persistence error: {0}")]
    StatePersistence(#[from] StoreError),
}

impl From<BudgetError> for EnrichmentError {
    fn from(e: BudgetError) -> Self {
        match e {
            BudgetError::Exceeded { reason } => Self::BudgetExceeded(reason),
            BudgetError::Persistence(inner) => Self::StatePersistence(inner),
        }
    }
}
