//! Cross-process advisory locking for cache entries.
//!
//! A lock on an entry is a `<body>.lock` file created with create-new
//! semantics. The holder refreshes its mtime every `update` interval; a lock
//! whose mtime is older than `stale` is treated as abandoned and reclaimed.
//!
//! Reclaiming is serialized per lock by a `<body>.lock.reclaim` guard file,
//! and the stale file is moved aside before it is deleted so that a lock
//! recreated in the meantime is put back instead of removed.
//!
//! Contention is resolved by retrying on the configured [`RetryPolicy`]. When
//! retries run out the caller gets an *unheld* lock and proceeds anyway: the
//! cache read that follows is then the synchronization point, and the worst
//! case is a duplicate fetch whose write overwrites the first.

mod retry;

pub use retry::RetryPolicy;

use crate::config::CacheDefaults;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lock acquisition options (`lockOpt`). Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LockOptions {
    /// Age after which a lock file is considered abandoned.
    pub stale: u64,
    /// Interval at which a held lock's mtime is refreshed (defaults to `stale / 2`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<u64>,
    #[serde(deserialize_with = "retry::count_or_policy")]
    pub retries: RetryPolicy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale: CacheDefaults::LOCK_STALE.as_millis() as u64,
            update: None,
            retries: RetryPolicy::default(),
        }
    }
}

impl LockOptions {
    /// Options with the given retry policy and default staleness.
    pub fn with_retries(retries: RetryPolicy) -> Self {
        Self {
            retries,
            ..Self::default()
        }
    }

    pub fn stale(&self) -> Duration {
        Duration::from_millis(self.stale)
    }

    pub fn update(&self) -> Duration {
        Duration::from_millis(self.update.unwrap_or(self.stale / 2))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockFileContents {
    pid: u32,
    started_at: u64,
    token: u64,
}

struct HeldLock {
    path: PathBuf,
    token: u64,
    refresher: Option<JoinHandle<()>>,
}

/// Handle to a (possibly unheld) entry lock.
///
/// [`EntryLock::release`] may be called any number of times. A handle dropped
/// while still held releases the lock on a background task.
pub struct EntryLock {
    held: Option<HeldLock>,
}

impl EntryLock {
    /// A handle that holds nothing (degraded mode).
    pub fn unheld() -> Self {
        Self { held: None }
    }

    fn held(path: PathBuf, token: u64, update: Duration) -> Self {
        let refresher = (!update.is_zero()).then(|| spawn_refresher(path.clone(), token, update));
        Self {
            held: Some(HeldLock {
                path,
                token,
                refresher,
            }),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Release the lock. Idempotent; tolerates a lock file that is already gone.
    pub async fn release(&mut self) {
        if let Some((path, token)) = self.take() {
            remove_if_owned(&path, token).await;
        }
    }

    fn take(&mut self) -> Option<(PathBuf, u64)> {
        let lock = self.held.take()?;
        if let Some(refresher) = lock.refresher {
            refresher.abort();
        }
        Some((lock.path, lock.token))
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let Some((path, token)) = self.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove_if_owned(&path, token).await });
            }
            // Outside a runtime the file is left to go stale.
            Err(_) => debug!("Lock {} dropped outside a runtime", path.display()),
        }
    }
}

impl std::fmt::Debug for EntryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryLock")
            .field("path", &self.held.as_ref().map(|l| &l.path))
            .finish()
    }
}

/// Path of the lock file guarding `body_path`.
pub fn lock_path_for(body_path: &Path) -> PathBuf {
    with_suffix(body_path, CacheDefaults::LOCK_SUFFIX)
}

fn with_suffix(path: &Path, suffix: impl AsRef<OsStr>) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Acquire the lock guarding `body_path`.
///
/// Returns an unheld handle when the lock stays contended past the retry
/// budget. Any failure other than contention is an error.
pub async fn acquire(body_path: &Path, options: &LockOptions) -> Result<EntryLock> {
    let lock_path = lock_path_for(body_path);
    let policy = &options.retries;
    let mut attempt: u32 = 0;
    let mut reclaimed = false;

    loop {
        match try_create(&lock_path).await {
            Ok(token) => {
                debug!("Acquired lock {} after {} retries", lock_path.display(), attempt);
                return Ok(EntryLock::held(lock_path, token, options.update()));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !reclaimed && reclaim_if_stale(&lock_path, options.stale()).await {
                    reclaimed = true;
                    continue;
                }
                reclaimed = false;

                if attempt >= policy.retries {
                    if policy.retries > 0 {
                        warn!(
                            "Lock {} still held after {} retries, proceeding without it",
                            lock_path.display(),
                            attempt
                        );
                    } else {
                        debug!("Lock {} is held, proceeding without it", lock_path.display());
                    }
                    return Ok(EntryLock::unheld());
                }

                let delay = policy.delay(attempt);
                attempt += 1;
                debug!(
                    "Lock {} contended, retry {}/{} in {:?}",
                    lock_path.display(),
                    attempt,
                    policy.retries,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(CacheError::Lock {
                    path: lock_path,
                    source: e,
                })
            }
        }
    }
}

async fn try_create(lock_path: &Path) -> io::Result<u64> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)
        .await?;

    let contents = LockFileContents {
        pid: std::process::id(),
        started_at: now_seconds(),
        token: rand::random(),
    };
    let serialized = serde_json::to_vec(&contents).map_err(io::Error::other)?;

    let written = async {
        file.write_all(&serialized).await?;
        file.flush().await
    }
    .await;
    if let Err(e) = written {
        let _ = fs::remove_file(lock_path).await;
        return Err(e);
    }

    Ok(contents.token)
}

async fn owns(lock_path: &Path, token: u64) -> bool {
    fs::read(lock_path)
        .await
        .ok()
        .and_then(|bytes| serde_json::from_slice::<LockFileContents>(&bytes).ok())
        .is_some_and(|contents| contents.token == token)
}

async fn remove_if_owned(lock_path: &Path, token: u64) {
    // It may have been reclaimed as stale and recreated by someone else.
    if !owns(lock_path, token).await {
        debug!("Lock {} no longer ours, leaving it", lock_path.display());
        return;
    }
    match fs::remove_file(lock_path).await {
        Ok(()) => debug!("Released lock {}", lock_path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove lock {}: {}", lock_path.display(), e),
    }
}

/// Clear `lock_path` if it is stale.
///
/// Returns true when the path was found empty or was cleared, meaning creation
/// should be retried at once.
async fn reclaim_if_stale(lock_path: &Path, stale: Duration) -> bool {
    match fs::metadata(lock_path).await {
        Ok(meta) if is_stale(&meta, stale) => {}
        Ok(_) => return false,
        // Released between our create attempt and now.
        Err(e) => return e.kind() == ErrorKind::NotFound,
    }

    let guard = with_suffix(lock_path, CacheDefaults::LOCK_RECLAIM_SUFFIX);
    match OpenOptions::new().write(true).create_new(true).open(&guard).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            clear_abandoned_guard(&guard, stale).await;
            return false;
        }
        Err(e) => {
            debug!("Cannot guard reclaim of {}: {}", lock_path.display(), e);
            return false;
        }
    }

    let reclaimed = reclaim_guarded(lock_path, stale).await;
    if let Err(e) = fs::remove_file(&guard).await {
        warn!("Failed to remove reclaim guard {}: {}", guard.display(), e);
    }
    reclaimed
}

/// Runs with the reclaim guard held.
async fn reclaim_guarded(lock_path: &Path, stale: Duration) -> bool {
    match read_if_stale(lock_path, stale).await {
        Ok(Some(observed)) => remove_if_unchanged(lock_path, &observed).await,
        Ok(None) => false,
        Err(e) => e.kind() == ErrorKind::NotFound,
    }
}

/// Move `lock_path` aside and delete it if it still holds `observed`.
///
/// A lock recreated after it was observed is put back.
async fn remove_if_unchanged(lock_path: &Path, observed: &[u8]) -> bool {
    let aside = with_suffix(lock_path, format!(".{:016x}.stale", rand::random::<u64>()));
    if let Err(e) = fs::rename(lock_path, &aside).await {
        return e.kind() == ErrorKind::NotFound;
    }

    match fs::read(&aside).await {
        Ok(moved) if moved == observed => {
            if let Err(e) = fs::remove_file(&aside).await {
                warn!("Failed to remove reclaimed lock {}: {}", aside.display(), e);
            }
            warn!("Reclaimed stale lock {}", lock_path.display());
            true
        }
        _ => {
            if let Err(e) = fs::hard_link(&aside, lock_path).await {
                warn!("Failed to restore lock {}: {}", lock_path.display(), e);
            }
            let _ = fs::remove_file(&aside).await;
            false
        }
    }
}

async fn read_if_stale(lock_path: &Path, stale: Duration) -> io::Result<Option<Vec<u8>>> {
    let meta = fs::metadata(lock_path).await?;
    if !is_stale(&meta, stale) {
        return Ok(None);
    }
    fs::read(lock_path).await.map(Some)
}

/// A guard outlives its reclaim only when that contender died mid-way.
async fn clear_abandoned_guard(guard: &Path, stale: Duration) {
    let Ok(meta) = fs::metadata(guard).await else {
        return;
    };
    if is_stale(&meta, stale) && fs::remove_file(guard).await.is_ok() {
        warn!("Removed abandoned reclaim guard {}", guard.display());
    }
}

fn is_stale(meta: &std::fs::Metadata, stale: Duration) -> bool {
    lock_age_from_metadata(meta).is_some_and(|age| age > stale)
}

fn lock_age_from_metadata(meta: &std::fs::Metadata) -> Option<Duration> {
    meta.modified()
        .or_else(|_| meta.created())
        .ok()
        .and_then(|time| SystemTime::now().duration_since(time).ok())
}

fn spawn_refresher(path: PathBuf, token: u64, update: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(update);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let target = path.clone();
            match tokio::task::spawn_blocking(move || touch_if_owned(&target, token)).await {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    warn!("Lock {} was taken over, no longer refreshing", path.display());
                    return;
                }
                Ok(Err(e)) => warn!("Failed to refresh lock {}: {}", path.display(), e),
                Err(e) => warn!("Lock refresh task failed for {}: {}", path.display(), e),
            }
        }
    })
}

/// Bump the mtime of `path` if it still carries `token`.
fn touch_if_owned(path: &Path, token: u64) -> io::Result<bool> {
    let contents: LockFileContents = match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(io::Error::other)?,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if contents.token != token {
        return Ok(false);
    }
    std::fs::OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())?;
    Ok(true)
}

fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
