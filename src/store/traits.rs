//! `StateStore` trait, the single seam between components and durable state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Envelope schema written by this build.
pub const RECORD_SCHEMA: u32 = 1;

/// A persisted record with its version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateRecord {
    pub schema: u32,
    /// Bumped on every successful write; the compare-and-swap token.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub body: serde_json::Value,
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Written; the record now has `version`.
    Swapped { version: u64 },
    /// Someone else wrote first. `current` is the version found, if any.
    Conflict { current: Option<u64> },
}

/// Durable key → versioned record storage.
///
/// Implementations must make `compare_and_swap` atomic and durable: when it
/// returns `Swapped`, the new body is on stable storage, and a crash at any
/// point leaves either the old or the new record, never a mix.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Read a record. `Ok(None)` means it was never written.
    async fn load(&self, key: &str) -> Result<Option<StateRecord>, StoreError>;

    /// Write `body` if the stored version still equals `expected`
    /// (`None` = the record must not exist yet).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        body: serde_json::Value,
    ) -> Result<SwapOutcome, StoreError>;
}
