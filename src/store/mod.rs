//! Persistence layer for versioned state records for budget and breaker.
//!
//! Each record lives inside an envelope with a schema number and a
//! monotonically increasing version. Writers never overwrite blindly: they
//! read, compute, and `compare_and_swap` against the version they read,
//! retrying on conflict until the lock timeout runs out.

pub mod file;
pub mod libsql_backend;
mod migrations;
pub mod traits;

pub use file::FileStateStore;
pub use libsql_backend::LibSqlStateStore;
pub use traits::{StateRecord, StateStore, SwapOutcome, RECORD_SCHEMA};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::{StateConfig, TimeoutConfig};
use crate::error::StoreError;

/// Upper bound on the pause between compare-and-swap attempts.
const MAX_BACKOFF: Duration = Duration::from_millis(200);

/// Result of a mutation closure.
pub enum Mutation<T, R> {
    /// Persist `T`, then hand `R` back to the caller.
    Write(T, R),
    /// Leave the record untouched.
    Keep(R),
}

/// Decode a record body, rejecting unknown schemas.
pub fn decode<T: DeserializeOwned>(key: &str, record: &StateRecord) -> Result<T, StoreError> {
    if record.schema != RECORD_SCHEMA {
        return Err(StoreError::Corrupt {
            key: key.into(),
            reason: format!("unsupported schema {}", record.schema),
        });
    }
    serde_json::from_value(record.body.clone()).map_err(|e| StoreError::Corrupt {
        key: key.into(),
        reason: e.to_string(),
    })
}

/// Read the current value of a record, if any.
pub async fn load<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    match store.load(key).await? {
        Some(record) => decode(key, &record).map(Some),
        None => Ok(None),
    }
}

/// Read-modify-write a record under compare-and-swap.
///
/// `f` sees the current decoded value (or `None` if the record does not
/// exist yet) and may be called more than once if another writer wins the
/// race. The whole cycle is bounded by `deadline`.
pub async fn mutate<T, R, E, F>(
    store: &dyn StateStore,
    key: &str,
    deadline: Duration,
    mut f: F,
) -> Result<R, E>
where
    T: Serialize + DeserializeOwned + Send,
    R: Send,
    E: From<StoreError> + Send,
    F: FnMut(Option<T>) -> Result<Mutation<T, R>, E> + Send,
{
    match tokio::time::timeout(deadline, swap_loop(store, key, &mut f)).await {
        Ok(result) => result,
        Err(_) => Err(E::from(StoreError::LockTimeout {
            key: key.into(),
            waited: deadline,
        })),
    }
}

async fn swap_loop<T, R, E, F>(store: &dyn StateStore, key: &str, f: &mut F) -> Result<R, E>
where
    T: Serialize + DeserializeOwned + Send,
    R: Send,
    E: From<StoreError> + Send,
    F: FnMut(Option<T>) -> Result<Mutation<T, R>, E> + Send,
{
    let mut backoff = Duration::from_millis(5);
    loop {
        let current = match store.load(key).await {
            Err(StoreError::Busy(reason)) => {
                debug!(key, %reason, "State store busy, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            other => other?,
        };
        let expected = current.as_ref().map(|r| r.version);
        let value = match &current {
            Some(record) => Some(decode::<T>(key, record)?),
            None => None,
        };

        let (next, out) = match f(value)? {
            Mutation::Keep(out) => return Ok(out),
            Mutation::Write(next, out) => (next, out),
        };

        let body = serde_json::to_value(&next).map_err(StoreError::from)?;
        match store.compare_and_swap(key, expected, body).await {
            Ok(SwapOutcome::Swapped { version }) => {
                debug!(key, version, "State record written");
                return Ok(out);
            }
            Ok(SwapOutcome::Conflict { current }) => {
                debug!(key, ?expected, ?current, "State record changed underneath, retrying");
            }
            Err(StoreError::Busy(reason)) => {
                debug!(key, %reason, "State store busy, retrying");
            }
            Err(e) => return Err(E::from(e)),
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Open the configured backend.
pub async fn open(
    config: &StateConfig,
    timeouts: &TimeoutConfig,
) -> Result<Arc<dyn StateStore>, StoreError> {
    let store: Arc<dyn StateStore> = match config {
        StateConfig::File { dir } => Arc::new(
            FileStateStore::new(dir.clone())
                .with_lock_timeout(timeouts.lock)
                .with_stale_lock_after(timeouts.stale_lock_after),
        ),
        StateConfig::Libsql { path } => {
            Arc::new(LibSqlStateStore::new_local(path, timeouts.lock).await?)
        }
    };
    info!(backend = store.backend(), "State store ready");
    Ok(store)
}
