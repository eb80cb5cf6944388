//! File-backed state store.
//!
//! One JSON file per record under a state directory:
//! - `<key>.json`: the current envelope
//! - `<key>.lock`: exclusive writer lock (created with `create_new`), holding
//!   the owner's token on its first line
//! - `<key>.json.<uuid>.tmp`: in-flight write, renamed over the record
//!
//! Readers never lock: a rename is atomic, so they see the old or the new
//! record. A lock file older than `stale_lock_after` belongs to a writer that
//! died mid-cycle. It is broken by renaming it aside and checking that the
//! file moved is still the one judged stale. A writer confirms its token is
//! still in the lock before publishing, and only ever removes its own lock.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::traits::{RECORD_SCHEMA, StateRecord, StateStore, SwapOutcome};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// JSON-file state store.
pub struct FileStateStore {
    dir: PathBuf,
    lock_timeout: Duration,
    stale_lock_after: Duration,
}

impl FileStateStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock_timeout: Duration::from_secs(5),
            stale_lock_after: Duration::from_secs(30),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for `key`.
    pub fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.lock"))
    }

    async fn read_record(&self, key: &str) -> Result<Option<StateRecord>, StoreError> {
        check_key(key)?;
        let path = self.record_path(key);
        let raw = match fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.into(),
                reason: e.to_string(),
            })
    }

    /// Take the writer lock for `key`, waiting up to `lock_timeout`.
    async fn acquire(&self, key: &str) -> Result<LockGuard, StoreError> {
        let path = self.lock_path(key);
        let token = Uuid::new_v4().to_string();
        let started = tokio::time::Instant::now();

        loop {
            let attempt = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await;

            match attempt {
                Ok(mut file) => {
                    let owner = format!(
                        "{token}\npid={} at={}\n",
                        std::process::id(),
                        Utc::now().to_rfc3339()
                    );
                    let written = async {
                        file.write_all(owner.as_bytes()).await?;
                        file.flush().await
                    }
                    .await;
                    if let Err(e) = written {
                        let _ = fs::remove_file(&path).await;
                        return Err(io_err(&path, e));
                    }
                    return Ok(LockGuard { path, token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(observed) = self.stale_lock(&path).await {
                        if self.break_lock(&path, &observed).await? {
                            continue;
                        }
                    }
                }
                Err(e) => return Err(io_err(&path, e)),
            }

            if started.elapsed() >= self.lock_timeout {
                return Err(StoreError::LockTimeout {
                    key: key.into(),
                    waited: self.lock_timeout,
                });
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    /// Contents of the lock at `path` if it is older than `stale_lock_after`.
    async fn stale_lock(&self, path: &Path) -> Option<String> {
        if !self.is_stale(path).await {
            return None;
        }
        fs::read_to_string(path).await.ok()
    }

    async fn is_stale(&self, path: &Path) -> bool {
        let Ok(meta) = fs::metadata(path).await else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        // A lock stamped in the future is treated as fresh.
        modified
            .elapsed()
            .map(|age| age >= self.stale_lock_after)
            .unwrap_or(false)
    }

    /// Break the stale lock whose contents were `observed`.
    ///
    /// The lock is renamed aside first. If the file that moved is not the
    /// stale one (another contender broke it and a new owner took over in
    /// between), it is linked back into place. Returns whether the caller
    /// should retry creating the lock right away.
    async fn break_lock(&self, path: &Path, observed: &str) -> Result<bool, StoreError> {
        let aside = path.with_extension(format!("lock.{}.broken", Uuid::new_v4()));
        match fs::rename(path, &aside).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(io_err(path, e)),
        }

        let moved = fs::read_to_string(&aside).await.unwrap_or_default();
        if moved == observed && self.is_stale(&aside).await {
            warn!(lock = %path.display(), "Broke stale state lock");
            let _ = fs::remove_file(&aside).await;
            return Ok(true);
        }

        // Put the live lock back unless yet another owner already holds the path.
        match fs::hard_link(&aside, path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(lock = %path.display(), "Live lock displaced; its owner will retry");
            }
            Err(e) => {
                let _ = fs::remove_file(&aside).await;
                return Err(io_err(path, e));
            }
        }
        let _ = fs::remove_file(&aside).await;
        Ok(false)
    }

    /// Write `record` to a temp file and flush it to disk.
    async fn stage(&self, key: &str, record: &StateRecord) -> Result<PathBuf, StoreError> {
        let tmp = self.dir.join(format!("{key}.json.{}.tmp", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(record)?;

        let result = async {
            let mut file = fs::File::create(&tmp).await.map_err(|e| io_err(&tmp, e))?;
            file.write_all(&bytes).await.map_err(|e| io_err(&tmp, e))?;
            file.sync_all().await.map_err(|e| io_err(&tmp, e))
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(e);
        }
        Ok(tmp)
    }

    /// Rename a staged file over the record for `key`.
    async fn publish(&self, key: &str, tmp: &Path) -> Result<(), StoreError> {
        let target = self.record_path(key);
        if let Err(e) = fs::rename(tmp, &target).await {
            let _ = fs::remove_file(tmp).await;
            return Err(io_err(&target, e));
        }

        // Persist the rename itself. Not every platform can open a directory.
        if let Ok(dir) = fs::File::open(&self.dir).await {
            let _ = dir.sync_all().await;
        }
        Ok(())
    }

    /// Compare-and-swap while holding `guard`.
    async fn swap_locked(
        &self,
        key: &str,
        expected: Option<u64>,
        body: serde_json::Value,
        guard: &LockGuard,
    ) -> Result<SwapOutcome, StoreError> {
        let current = self.read_record(key).await?.map(|r| r.version);
        if current != expected {
            return Ok(SwapOutcome::Conflict { current });
        }

        let version = current.unwrap_or(0) + 1;
        let record = StateRecord {
            schema: RECORD_SCHEMA,
            version,
            updated_at: Utc::now(),
            body,
        };
        let tmp = self.stage(key, &record).await?;

        if !guard.is_held().await {
            let _ = fs::remove_file(&tmp).await;
            warn!(key, "State lock was broken mid-write, discarding");
            return Ok(SwapOutcome::Conflict { current });
        }

        self.publish(key, &tmp).await?;
        debug!(key, version, "Record swapped on disk");
        Ok(SwapOutcome::Swapped { version })
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn load(&self, key: &str) -> Result<Option<StateRecord>, StoreError> {
        self.read_record(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        body: serde_json::Value,
    ) -> Result<SwapOutcome, StoreError> {
        check_key(key)?;
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_err(&self.dir, e))?;

        let guard = self.acquire(key).await?;
        self.swap_locked(key, expected, body, &guard).await
    }
}

/// Writer lock owned by one `compare_and_swap`.
///
/// Released on drop, including on cancellation, but only while the lock
/// file still carries this guard's token.
struct LockGuard {
    path: PathBuf,
    token: String,
}

impl LockGuard {
    async fn is_held(&self) -> bool {
        match fs::read_to_string(&self.path).await {
            Ok(raw) => lock_token(&raw) == Some(self.token.as_str()),
            Err(_) => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let owned = std::fs::read_to_string(&self.path)
            .map(|raw| lock_token(&raw) == Some(self.token.as_str()))
            .unwrap_or(false);
        if owned {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn lock_token(raw: &str) -> Option<&str> {
    raw.lines().next().map(str::trim).filter(|t| !t.is_empty())
}

fn check_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::Io {
            path: key.into(),
            source: std::io::Error::new(ErrorKind::InvalidInput, "invalid record key"),
        })
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}
