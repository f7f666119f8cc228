//! Cross-process file lock.
//!
//! A lock is a small JSON record created next to the protected resource with
//! `create_new` (`O_CREAT | O_EXCL`), so at most one process can create it.
//! A record older than the configured timeout is stale and may be reclaimed.
//! Reclamation is guarded by a second create-if-absent file: only the process
//! that wins `<record>.reclaim` may delete the stale record, and only after
//! confirming it is byte-identical to the one it judged stale.
//!
//! Nothing deletes a file another process may have just written in place.
//! Removal first renames the file to a private name, compares the content it
//! actually took, and links it back if it changed. This covers stale records,
//! reclaim guards left by a crashed reclaimer, and release.
//!
//! ```no_run
//! # async fn demo() -> pipewright::Result<()> {
//! use pipewright::lock::{LockManager, LockOptions};
//!
//! let locks = LockManager::new(LockOptions::default());
//! let state = locks.lock_for("/var/lib/pipewright/state.json");
//! state.with_lock(|| async { /* mutate state.json */ }).await?;
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{LockTimeoutError, PipewrightError, Result};
use crate::retry::BackoffPolicy;

const RECORD_SUFFIX: &str = "lock";
const RECLAIM_SUFFIX: &str = "reclaim";

/// Identity of a lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Process ID.
    pub pid: u32,
    /// Host name of the process.
    pub hostname: String,
    /// Random per-lock token; distinguishes two locks in one process.
    pub token: String,
}

impl LockOwner {
    /// Identity for the current process with a fresh token.
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
            token: Uuid::new_v4().to_string(),
        }
    }
}

impl fmt::Display for LockOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} on {} (token {})", self.pid, self.hostname, self.token)
    }
}

/// Content of a lock record file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Current holder.
    pub owner: LockOwner,
    /// When the lock was taken (or last refreshed).
    pub acquired_at: DateTime<Utc>,
    /// The protected resource.
    pub resource: String,
    /// Staleness timeout the holder was configured with.
    pub timeout_secs: u64,
}

/// Lock behaviour. Also the `[lock]` section of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// Age after which a record is considered stale.
    pub timeout_secs: u64,
    /// Additional attempts after the first.
    pub max_retries: u32,
    /// Initial backoff delay.
    pub retry_delay_ms: u64,
    /// Backoff cap.
    pub max_retry_delay_ms: u64,
    /// Return `LockTimeoutError` from `acquire` instead of `Ok(false)`.
    pub strict: bool,
    /// Directory for lock records. `None` places them next to the resource.
    pub lock_dir: Option<PathBuf>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_retries: 10,
            retry_delay_ms: 100,
            max_retry_delay_ms: 5_000,
            strict: false,
            lock_dir: None,
        }
    }
}

impl LockOptions {
    /// Staleness timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::exponential(
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }

    /// Path of the lock record for `resource`.
    #[must_use]
    pub fn record_path(&self, resource: &Path) -> PathBuf {
        match &self.lock_dir {
            Some(dir) => dir.join(format!("{}.{RECORD_SUFFIX}", sanitise(resource))),
            None => append_suffix(resource, RECORD_SUFFIX),
        }
    }
}

fn sanitise(resource: &Path) -> String {
    resource
        .to_string_lossy()
        .trim_start_matches('/')
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".");
    os.push(suffix);
    PathBuf::from(os)
}

/// Outcome of one acquisition attempt.
enum Attempt {
    Acquired,
    Contended(Option<LockOwner>),
}

/// A lock over one resource, held by one owner identity.
#[derive(Debug)]
pub struct FileLock {
    resource: PathBuf,
    record_path: PathBuf,
    owner: LockOwner,
    options: LockOptions,
    held: Arc<AtomicBool>,
}

impl FileLock {
    /// Creates a lock for `resource` with a fresh owner identity.
    #[must_use]
    pub fn new(resource: impl Into<PathBuf>, options: LockOptions) -> Self {
        let resource = resource.into();
        Self {
            record_path: options.record_path(&resource),
            resource,
            owner: LockOwner::current(),
            options,
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The protected resource.
    #[must_use]
    pub fn resource(&self) -> &Path {
        &self.resource
    }

    /// Path of the lock record file.
    #[must_use]
    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// This lock's owner identity.
    #[must_use]
    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Whether this instance currently believes it holds the lock.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Tries to acquire the lock, retrying with backoff.
    ///
    /// Returns `Ok(false)` when retries are exhausted, or
    /// [`LockTimeoutError`] if the options are strict.
    pub async fn acquire(&self) -> Result<bool> {
        match self.acquire_inner().await {
            Ok(()) => Ok(true),
            Err(PipewrightError::LockTimeout(e)) if !self.options.strict => {
                debug!(resource = %self.resource.display(), attempts = e.attempts, "Lock not acquired");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn acquire_inner(&self) -> Result<()> {
        if self.is_held() {
            return Ok(());
        }
        if let Some(parent) = self.record_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let policy = self.options.backoff();
        let mut last_owner = None;
        for attempt in 0..=self.options.max_retries {
            match self.attempt_once().await? {
                Attempt::Acquired => {
                    self.held.store(true, Ordering::SeqCst);
                    debug!(resource = %self.resource.display(), attempt, "Lock acquired");
                    return Ok(());
                }
                Attempt::Contended(owner) => last_owner = owner.or(last_owner),
            }
            if attempt < self.options.max_retries {
                tokio::time::sleep(policy.delay(attempt)).await;
            }
        }

        Err(LockTimeoutError {
            resource: self.resource.display().to_string(),
            owner: last_owner,
            attempts: self.options.max_retries + 1,
        }
        .into())
    }

    async fn attempt_once(&self) -> Result<Attempt> {
        let record = LockRecord {
            owner: self.owner.clone(),
            acquired_at: Utc::now(),
            resource: self.resource.display().to_string(),
            timeout_secs: self.options.timeout_secs,
        };
        let record_path = self.record_path.clone();
        let timeout = self.options.timeout();

        tokio::task::spawn_blocking(move || attempt_sync(&record_path, &record, timeout))
            .await
            .map_err(|e| PipewrightError::Io(io::Error::other(e)))?
    }

    /// Releases the lock if this instance holds it. Idempotent.
    pub async fn release(&self) -> Result<()> {
        if !self.held.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let path = self.record_path.clone();
        let token = self.owner.token.clone();
        tokio::task::spawn_blocking(move || release_sync(&path, &token))
            .await
            .map_err(|e| PipewrightError::Io(io::Error::other(e)))??;
        Ok(())
    }

    /// Acquires the lock (always strict) and returns a guard that releases
    /// it when dropped.
    pub async fn lock(&self) -> Result<LockGuard> {
        self.acquire_inner().await?;
        Ok(LockGuard {
            record_path: self.record_path.clone(),
            token: self.owner.token.clone(),
            held: Arc::clone(&self.held),
        })
    }

    /// Runs `f` while holding the lock. The lock is released on every exit
    /// path, including panics and cancellation of the returned future.
    pub async fn with_lock<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock().await?;
        let out = f().await;
        guard.release();
        Ok(out)
    }

    /// Rewrites `acquired_at` so a long-running holder is not considered
    /// stale. Returns `false` if the record no longer belongs to us.
    pub async fn refresh(&self) -> Result<bool> {
        if !self.is_held() {
            return Ok(false);
        }
        let Some(mut record) = self.inspect().await? else {
            return Ok(false);
        };
        if record.owner.token != self.owner.token {
            warn!(resource = %self.resource.display(), holder = %record.owner, "Lock was taken over");
            self.held.store(false, Ordering::SeqCst);
            return Ok(false);
        }
        record.acquired_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&record)?;
        let tmp = append_suffix(&self.record_path, &format!("{}.tmp", self.owner.token));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.record_path).await?;
        Ok(true)
    }

    /// Reads the current lock record, if any.
    pub async fn inspect(&self) -> Result<Option<LockRecord>> {
        match tokio::fs::read(&self.record_path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Releases the lock on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    record_path: PathBuf,
    token: String,
    held: Arc<AtomicBool>,
}

impl LockGuard {
    /// Releases the lock now.
    pub fn release(self) {
        drop(self);
    }

    fn release_inner(&self) {
        if self.held.swap(false, Ordering::SeqCst) {
            if let Err(e) = release_sync(&self.record_path, &self.token) {
                warn!(path = %self.record_path.display(), error = %e, "Failed to release lock");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Builds [`FileLock`]s that share one set of options.
#[derive(Debug, Clone, Default)]
pub struct LockManager {
    options: LockOptions,
}

impl LockManager {
    /// Creates a manager.
    #[must_use]
    pub fn new(options: LockOptions) -> Self {
        Self { options }
    }

    /// The shared options.
    #[must_use]
    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// A lock for `resource` with a fresh owner identity.
    #[must_use]
    pub fn lock_for(&self, resource: impl Into<PathBuf>) -> FileLock {
        FileLock::new(resource, self.options.clone())
    }

    /// Acquires guards for every resource in sorted order. On failure,
    /// guards already taken are released.
    pub async fn lock_all<I, P>(&self, resources: I) -> Result<Vec<(FileLock, LockGuard)>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut paths: Vec<PathBuf> = resources.into_iter().map(Into::into).collect();
        paths.sort();
        paths.dedup();

        let mut held = Vec::with_capacity(paths.len());
        for path in paths {
            let lock = self.lock_for(path);
            let guard = lock.lock().await?;
            held.push((lock, guard));
        }
        Ok(held)
    }
}

// ============================================================================
// Blocking primitives
// ============================================================================

fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn age_of(path: &Path) -> io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default())
}

fn attempt_sync(record_path: &Path, record: &LockRecord, timeout: Duration) -> Result<Attempt> {
    let bytes = serde_json::to_vec_pretty(record)?;
    match write_new(record_path, &bytes) {
        Ok(()) => return Ok(Attempt::Acquired),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }

    let existing = match fs::read(record_path) {
        Ok(existing) => existing,
        // Released between our create and read; try again next round.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Attempt::Contended(None)),
        Err(e) => return Err(e.into()),
    };

    let parsed: Option<LockRecord> = serde_json::from_slice(&existing).ok();
    let age = match &parsed {
        Some(r) => (Utc::now() - r.acquired_at).to_std().unwrap_or_default(),
        // Unreadable: a writer may be mid-write; fall back to mtime.
        None => match age_of(record_path) {
            Ok(age) => age,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Attempt::Contended(None)),
            Err(e) => return Err(e.into()),
        },
    };
    let holder = parsed.map(|r| r.owner);

    if age <= timeout {
        return Ok(Attempt::Contended(holder));
    }

    if reclaim(record_path, &existing, &record.owner.token, timeout)? {
        info!(
            path = %record_path.display(),
            stale_secs = age.as_secs(),
            previous = ?holder.as_ref().map(ToString::to_string),
            "Reclaimed stale lock"
        );
        match write_new(record_path, &bytes) {
            Ok(()) => return Ok(Attempt::Acquired),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Attempt::Contended(holder))
}

/// Deletes `record_path` if it still holds `stale`, under the reclaim guard.
fn reclaim(record_path: &Path, stale: &[u8], token: &str, timeout: Duration) -> Result<bool> {
    let guard = append_suffix(record_path, RECLAIM_SUFFIX);
    match write_new(&guard, token.as_bytes()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // Someone else is reclaiming. Clear their guard only if they died.
            clear_dead_guard(&guard, token, timeout)?;
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }

    let outcome = remove_if_unchanged(record_path, stale, token);
    if let Err(e) = remove_if_unchanged(&guard, token.as_bytes(), token) {
        warn!(path = %guard.display(), error = %e, "Failed to remove reclaim guard");
    }
    Ok(!matches!(outcome?, Removal::Changed))
}

/// Removes a reclaim guard older than `timeout`, unless it is replaced
/// while being judged.
fn clear_dead_guard(guard: &Path, token: &str, timeout: Duration) -> io::Result<()> {
    // Content first, age second: the content is what removal verifies.
    let content = match fs::read(guard) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    match age_of(guard) {
        Ok(age) if age > timeout => {}
        Ok(_) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    }
    if let Removal::Removed = remove_if_unchanged(guard, &content, token)? {
        debug!(path = %guard.display(), "Removed stale reclaim guard");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Removed,
    Absent,
    Changed,
}

/// Removes `path` only if it still contains `expected`.
///
/// A matching file is renamed to a name private to `token` and checked
/// again before it is deleted. A file that changed in between is linked
/// back into place when the slot is still free.
fn remove_if_unchanged(path: &Path, expected: &[u8], token: &str) -> io::Result<Removal> {
    match fs::read(path) {
        Ok(bytes) if bytes.as_slice() == expected => {}
        Ok(_) => return Ok(Removal::Changed),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Removal::Absent),
        Err(e) => return Err(e),
    }

    let aside = append_suffix(path, &format!("{token}.aside"));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Removal::Absent),
        Err(e) => return Err(e),
    }

    let taken = fs::read(&aside);
    if matches!(&taken, Ok(bytes) if bytes.as_slice() == expected) {
        fs::remove_file(&aside)?;
        return Ok(Removal::Removed);
    }

    match fs::hard_link(&aside, path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            warn!(path = %path.display(), "Slot refilled while restoring a changed file; dropping the taken copy");
        }
        Err(e) => {
            let _ = fs::remove_file(&aside);
            return Err(e);
        }
    }
    fs::remove_file(&aside)?;
    taken.map(|_| Removal::Changed)
}

/// Deletes the record only if it names `token`.
fn release_sync(record_path: &Path, token: &str) -> io::Result<()> {
    let bytes = match fs::read(record_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    match serde_json::from_slice::<LockRecord>(&bytes) {
        Ok(record) if record.owner.token == token => {
            if remove_if_unchanged(record_path, &bytes, token)? == Removal::Changed {
                warn!(path = %record_path.display(), "Lock record changed during release; leaving it in place");
            } else {
                debug!(path = %record_path.display(), "Lock released");
            }
            Ok(())
        }
        Ok(record) => {
            warn!(
                path = %record_path.display(),
                holder = %record.owner,
                "Lock no longer ours; leaving record in place"
            );
            Ok(())
        }
        Err(_) => {
            warn!(path = %record_path.display(), "Unreadable lock record; leaving in place");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast() -> LockOptions {
        LockOptions {
            timeout_secs: 30,
            max_retries: 2,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..LockOptions::default()
        }
    }

    #[test]
    fn test_record_paths() {
        let opts = LockOptions::default();
        assert_eq!(
            opts.record_path(Path::new("/data/state.json")),
            PathBuf::from("/data/state.json.lock")
        );

        let opts = LockOptions {
            lock_dir: Some(PathBuf::from("/run/locks")),
            ..LockOptions::default()
        };
        assert_eq!(
            opts.record_path(Path::new("/data/my state.json")),
            PathBuf::from("/run/locks/data_my_state.json.lock")
        );
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("state.json");
        let lock = FileLock::new(&resource, fast());

        assert!(lock.acquire().await.unwrap());
        assert!(lock.is_held());
        let record = lock.inspect().await.unwrap().unwrap();
        assert_eq!(record.owner, *lock.owner());
        assert_eq!(record.resource, resource.display().to_string());

        lock.release().await.unwrap();
        assert!(!lock.record_path().exists());
        // Idempotent.
        lock.release().await.unwrap();

        assert!(lock.acquire().await.unwrap());
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_owner_is_refused() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("state.json");
        let first = FileLock::new(&resource, fast());
        let second = FileLock::new(&resource, fast());

        assert!(first.acquire().await.unwrap());
        assert!(!second.acquire().await.unwrap());

        first.release().await.unwrap();
        assert!(second.acquire().await.unwrap());
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_strict_reports_owner() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("state.json");
        let holder = FileLock::new(&resource, fast());
        let strict = FileLock::new(&resource, LockOptions { strict: true, ..fast() });

        holder.acquire().await.unwrap();
        let err = strict.acquire().await.unwrap_err();
        match err {
            PipewrightError::LockTimeout(e) => {
                assert_eq!(e.attempts, 3);
                assert_eq!(e.owner.as_ref(), Some(holder.owner()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("shared.txt");
        let opts = LockOptions { max_retries: 0, ..fast() };

        let locks: Vec<Arc<FileLock>> = (0..8)
            .map(|_| Arc::new(FileLock::new(&resource, opts.clone())))
            .collect();
        let handles: Vec<_> = locks
            .iter()
            .map(|l| {
                let l = Arc::clone(l);
                tokio::spawn(async move { l.acquire().await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_stale_record_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("state.json");
        let lock = FileLock::new(&resource, fast());

        let stale = LockRecord {
            owner: LockOwner {
                pid: 1,
                hostname: "gone".into(),
                token: "dead".into(),
            },
            acquired_at: Utc::now() - chrono::Duration::hours(1),
            resource: resource.display().to_string(),
            timeout_secs: 30,
        };
        fs::write(lock.record_path(), serde_json::to_vec(&stale).unwrap()).unwrap();

        assert!(lock.acquire().await.unwrap());
        let record = lock.inspect().await.unwrap().unwrap();
        assert_eq!(record.owner.token, lock.owner().token);
        assert!(!append_suffix(lock.record_path(), RECLAIM_SUFFIX).exists());
    }

    fn stale_record(resource: &Path) -> Vec<u8> {
        serde_json::to_vec(&LockRecord {
            owner: LockOwner {
                pid: 1,
                hostname: "gone".into(),
                token: "dead".into(),
            },
            acquired_at: Utc::now() - chrono::Duration::hours(1),
            resource: resource.display().to_string(),
            timeout_secs: 30,
        })
        .unwrap()
    }

    fn backdate(path: &Path) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".aside") || n.ends_with(".reclaim"))
            .collect()
    }

    #[tokio::test]
    async fn test_dead_reclaim_guard_is_cleared() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("state.json");
        let lock = FileLock::new(&resource, fast());
        fs::write(lock.record_path(), stale_record(&resource)).unwrap();
        let guard = append_suffix(lock.record_path(), RECLAIM_SUFFIX);
        fs::write(&guard, b"crashed-reclaimer").unwrap();
        backdate(&guard);

        assert!(lock.acquire().await.unwrap());
        assert_eq!(lock.inspect().await.unwrap().unwrap().owner.token, lock.owner().token);
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_live_reclaim_guard_blocks_reclaim() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("state.json");
        let lock = FileLock::new(&resource, fast());
        let stale = stale_record(&resource);
        fs::write(lock.record_path(), &stale).unwrap();
        let guard = append_suffix(lock.record_path(), RECLAIM_SUFFIX);
        fs::write(&guard, b"busy-reclaimer").unwrap();

        assert!(!lock.acquire().await.unwrap());
        assert_eq!(fs::read(lock.record_path()).unwrap(), stale);
        assert_eq!(fs::read(&guard).unwrap(), b"busy-reclaimer");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_reclaimers_have_one_winner() {
        for _ in 0..10 {
            let dir = TempDir::new().unwrap();
            let resource = dir.path().join("shared.txt");
            let opts = LockOptions { max_retries: 5, ..fast() };
            let record_path = opts.record_path(&resource);
            fs::write(&record_path, stale_record(&resource)).unwrap();
            let guard = append_suffix(&record_path, RECLAIM_SUFFIX);
            fs::write(&guard, b"crashed-reclaimer").unwrap();
            backdate(&guard);

            let locks: Vec<Arc<FileLock>> = (0..8)
                .map(|_| Arc::new(FileLock::new(&resource, opts.clone())))
                .collect();
            let handles: Vec<_> = locks
                .iter()
                .map(|l| {
                    let l = Arc::clone(l);
                    tokio::spawn(async move { l.acquire().await.unwrap() })
                })
                .collect();

            let mut winners = Vec::new();
            for (i, h) in handles.into_iter().enumerate() {
                if h.await.unwrap() {
                    winners.push(i);
                }
            }
            assert_eq!(winners.len(), 1, "winners: {winners:?}");
            let record: LockRecord = serde_json::from_slice(&fs::read(&record_path).unwrap()).unwrap();
            assert_eq!(record.owner.token, locks[winners[0]].owner().token);
            assert!(leftovers(dir.path()).is_empty());
        }
    }

    #[test]
    fn test_remove_if_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slot");

        assert_eq!(remove_if_unchanged(&path, b"x", "t").unwrap(), Removal::Absent);

        fs::write(&path, b"replacement").unwrap();
        assert_eq!(remove_if_unchanged(&path, b"original", "t").unwrap(), Removal::Changed);
        assert_eq!(fs::read(&path).unwrap(), b"replacement");

        assert_eq!(remove_if_unchanged(&path, b"replacement", "t").unwrap(), Removal::Removed);
        assert!(!path.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_fresh_unreadable_record_is_respected() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("state.json");
        let lock = FileLock::new(&resource, fast());
        fs::write(lock.record_path(), b"{\"owner\":").unwrap();

        assert!(!lock.acquire().await.unwrap());
        assert!(lock.record_path().exists());
    }

    #[tokio::test]
    async fn test_release_keeps_foreign_record() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("state.json");
        let lock = FileLock::new(&resource, fast());
        lock.acquire().await.unwrap();

        // Another process reclaimed and now owns the record.
        let other = LockRecord {
            owner: LockOwner::current(),
            acquired_at: Utc::now(),
            resource: resource.display().to_string(),
            timeout_secs: 30,
        };
        fs::write(lock.record_path(), serde_json::to_vec(&other).unwrap()).unwrap();

        lock.release().await.unwrap();
        let record = lock.inspect().await.unwrap().unwrap();
        assert_eq!(record.owner, other.owner);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path().join("r"), fast());
        {
            let _guard = lock.lock().await.unwrap();
            assert!(lock.record_path().exists());
        }
        assert!(!lock.record_path().exists());
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_error_result() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path().join("r"), fast());

        let out: Result<std::result::Result<(), &str>> =
            lock.with_lock(|| async { Err("inner failure") }).await;
        assert_eq!(out.unwrap(), Err("inner failure"));
        assert!(!lock.record_path().exists());
    }

    #[tokio::test]
    async fn test_with_lock_times_out_even_when_lenient() {
        let dir = TempDir::new().unwrap();
        let resource = dir.path().join("r");
        let holder = FileLock::new(&resource, fast());
        holder.acquire().await.unwrap();

        let other = FileLock::new(&resource, fast());
        let err = other.with_lock(|| async {}).await.unwrap_err();
        assert!(matches!(err, PipewrightError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn test_refresh_moves_timestamp() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path().join("r"), fast());
        assert!(!lock.refresh().await.unwrap());

        lock.acquire().await.unwrap();
        let before = lock.inspect().await.unwrap().unwrap().acquired_at;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(lock.refresh().await.unwrap());
        let after = lock.inspect().await.unwrap().unwrap().acquired_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_lock_all_sorts_and_dedups() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(fast());
        let held = manager
            .lock_all([dir.path().join("b"), dir.path().join("a"), dir.path().join("b")])
            .await
            .unwrap();
        let resources: Vec<_> = held.iter().map(|(l, _)| l.resource().to_path_buf()).collect();
        assert_eq!(resources, vec![dir.path().join("a"), dir.path().join("b")]);
        drop(held);
        assert!(!dir.path().join("a.lock").exists());
    }
}
