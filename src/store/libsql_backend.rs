//! libSQL backend: `StateStore` over a single `state_records` table.
//!
//! Compare-and-swap is a conditional statement: an insert that does nothing
//! on key conflict, or an update guarded by `version = ?`. Zero affected rows
//! means another writer got there first.
//!
//! Several processes may share one database file. Each connection waits up to
//! its busy timeout for the write lock; a `SQLITE_BUSY` that still comes back
//! surfaces as [`StoreError::Busy`] so the caller can retry.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{RECORD_SCHEMA, StateRecord, StateStore, SwapOutcome};

/// Primary result codes that mean another connection holds the lock.
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Map a libSQL error, keeping lock contention distinguishable.
pub(crate) fn db_error(context: &str, e: libsql::Error) -> StoreError {
    match &e {
        libsql::Error::SqliteFailure(code, _)
            if matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED) =>
        {
            StoreError::Busy(format!("{context}: {e}"))
        }
        _ => StoreError::Database(format!("{context}: {e}")),
    }
}

/// libSQL state store.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlStateStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStateStore {
    /// Open (or create) a local database file and run migrations.
    ///
    /// `busy_timeout` bounds how long a statement waits for another
    /// process's write lock, including while migrating.
    pub async fn new_local(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Database(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db, busy_timeout).await?;
        info!(path = %path.display(), "State database opened");
        Ok(store)
    }

    /// In-memory database, for tests.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Database(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, Duration::from_secs(1)).await
    }

    async fn from_database(db: LibSqlDatabase, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Database(format!("Failed to create connection: {e}")))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| StoreError::Database(format!("Failed to set busy timeout: {e}")))?;

        // Racing another process can still yield an immediate SQLITE_BUSY.
        // Every migration step is idempotent.
        let started = Instant::now();
        loop {
            match migrations::run_migrations(&conn).await {
                Ok(()) => break,
                Err(StoreError::Busy(reason)) if started.elapsed() < busy_timeout => {
                    debug!(%reason, "Migrations waiting on another writer");
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn current_version(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT version FROM state_records WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| db_error("current_version", e))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let version: i64 = row
                    .get(0)
                    .map_err(|e| StoreError::Database(format!("current_version row: {e}")))?;
                Ok(Some(version as u64))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(db_error("current_version", e)),
        }
    }
}

/// Parse an RFC 3339 timestamp; unreadable values fall back to the epoch.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[async_trait]
impl StateStore for LibSqlStateStore {
    fn backend(&self) -> &'static str {
        "libsql"
    }

    async fn load(&self, key: &str) -> Result<Option<StateRecord>, StoreError> {
        let mut rows = self
            .conn
            .query(
                "SELECT schema, version, body, updated_at FROM state_records WHERE key = ?1",
                params![key],
            )
            .await
            .map_err(|e| db_error("load", e))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(db_error("load", e)),
        };

        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.into(),
            reason,
        };
        let schema: i64 = row.get(0).map_err(|e| corrupt(e.to_string()))?;
        let version: i64 = row.get(1).map_err(|e| corrupt(e.to_string()))?;
        let body: String = row.get(2).map_err(|e| corrupt(e.to_string()))?;
        let updated_at: String = row.get(3).map_err(|e| corrupt(e.to_string()))?;

        Ok(Some(StateRecord {
            schema: schema as u32,
            version: version as u64,
            updated_at: parse_datetime(&updated_at),
            body: serde_json::from_str(&body).map_err(|e| corrupt(e.to_string()))?,
        }))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        body: serde_json::Value,
    ) -> Result<SwapOutcome, StoreError> {
        let body = serde_json::to_string(&body)?;
        let now = Utc::now().to_rfc3339();

        let (affected, version) = match expected {
            None => {
                let affected = self
                    .conn
                    .execute(
                        "INSERT INTO state_records (key, schema, version, body, updated_at)
                         VALUES (?1, ?2, 1, ?3, ?4)
                         ON CONFLICT(key) DO NOTHING",
                        params![key, RECORD_SCHEMA as i64, body, now],
                    )
                    .await
                    .map_err(|e| db_error("compare_and_swap insert", e))?;
                (affected, 1)
            }
            Some(current) => {
                let next = current + 1;
                let affected = self
                    .conn
                    .execute(
                        "UPDATE state_records
                         SET schema = ?1, version = ?2, body = ?3, updated_at = ?4
                         WHERE key = ?5 AND version = ?6",
                        params![
                            RECORD_SCHEMA as i64,
                            next as i64,
                            body,
                            now,
                            key,
                            current as i64
                        ],
                    )
                    .await
                    .map_err(|e| db_error("compare_and_swap update", e))?;
                (affected, next)
            }
        };

        if affected == 0 {
            return Ok(SwapOutcome::Conflict {
                current: self.current_version(key).await?,
            });
        }
        Ok(SwapOutcome::Swapped { version })
    }
}
