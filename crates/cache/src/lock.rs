//! Advisory file-presence lock guarding manifest updates
//!
//! The lock is a marker file created with `create_new`, holding the owner's
//! pid, host and acquisition time. Contenders back off exponentially with
//! jitter until the marker disappears, it becomes stale (older than
//! [`LockOptions::stale_after`] by modification time, in which case it is
//! broken), or the wait budget runs out.
//!
//! Locks are released when the [`LockGuard`] is dropped.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;

/// Default total wait budget
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default age after which a lock is considered abandoned
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

/// Default first retry delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(25);

/// Default retry delay multiplier
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.6;

/// Default retry delay ceiling
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound of the random delay added to each retry
pub const DEFAULT_JITTER: Duration = Duration::from_millis(25);

/// Contents of a lock marker file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Process ID of the holder
    pub pid: u32,
    /// Host name of the holder
    pub host: String,
    /// When the lock was taken
    pub at: DateTime<Utc>,
}

impl LockOwner {
    /// Metadata describing the current process
    #[must_use]
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: gethostname::gethostname().to_string_lossy().into_owned(),
            at: Utc::now(),
        }
    }
}

/// Timing parameters for lock acquisition
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    /// Maximum total time to wait for the lock
    pub timeout: Duration,
    /// Age after which a held lock is broken
    pub stale_after: Duration,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied to the delay after every retry
    pub backoff_factor: f64,
    /// Ceiling for a single retry delay
    pub max_delay: Duration,
    /// Upper bound for the random delay added to each retry
    pub jitter: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
            base_delay: DEFAULT_BASE_DELAY,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl LockOptions {
    /// Set the total wait budget
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the staleness threshold
    #[must_use]
    pub const fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Delay to sleep after a failed attempt, given the current backoff step
    fn sleep_for(&self, current: Duration) -> Duration {
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            let max_nanos = u64::try_from(self.jitter.as_nanos()).unwrap_or(u64::MAX);
            Duration::from_nanos(rand::rng().random_range(0..=max_nanos))
        };
        (current + jitter).min(self.max_delay)
    }

    fn next_delay(&self, current: Duration) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        current.mul_f64(factor).min(self.max_delay)
    }
}

/// A lock marker file and the policy used to acquire it
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    options: LockOptions,
    cancel: Option<CancellationToken>,
}

impl FileLock {
    /// Create a lock handle for `path`; nothing is touched until acquisition
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, options: LockOptions) -> Self {
        Self {
            path: path.into(),
            options,
            cancel: None,
        }
    }

    /// Abort waiting as soon as `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Lock marker path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until the lock is held, it times out, or the wait is cancelled
    pub fn acquire(&self) -> Result<LockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }

        let start = Instant::now();
        let mut delay = self.options.base_delay;

        loop {
            if let Some(guard) = self.try_create()? {
                return Ok(guard);
            }

            let age = lock_age(&self.path);
            let freed = match age {
                // Released between our attempt and the age check
                None => true,
                Some(age) if age > self.options.stale_after => self.break_stale(age),
                Some(_) => false,
            };

            // Checked even after a break so an undeletable marker cannot spin.
            let waited = start.elapsed();
            if waited >= self.options.timeout {
                return Err(Error::LockTimeout {
                    path: self.path.clone().into_boxed_path(),
                    holder: read_owner(&self.path),
                    lock_age_ms: age.map(duration_ms),
                    waited_ms: duration_ms(waited),
                });
            }

            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(Error::LockCancelled {
                    path: self.path.clone().into_boxed_path(),
                });
            }

            if freed {
                continue;
            }

            let sleep = self.options.sleep_for(delay);
            tracing::debug!(
                lock = %self.path.display(),
                sleep_ms = sleep.as_millis(),
                waited_ms = waited.as_millis(),
                "Lock held by another process, waiting"
            );
            std::thread::sleep(sleep);
            delay = self.options.next_delay(delay);
        }
    }

    /// Single acquisition attempt; `Ok(None)` when someone else holds the lock
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        self.try_create()
    }

    /// Whether a lock marker currently exists
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    /// Metadata of the current holder, if readable
    #[must_use]
    pub fn owner(&self) -> Option<LockOwner> {
        read_owner(&self.path)
    }

    /// Remove a stale marker; `true` when the marker is gone afterwards
    fn break_stale(&self, age: Duration) -> bool {
        tracing::warn!(
            lock = %self.path.display(),
            age_ms = age.as_millis(),
            holder = ?read_owner(&self.path),
            "Breaking stale lock"
        );
        match fs::remove_file(&self.path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(
                    lock = %self.path.display(),
                    error = %e,
                    "Failed to break stale lock"
                );
                false
            }
        }
    }

    fn try_create(&self) -> Result<Option<LockGuard>> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let owner = LockOwner::current();
                let written = serde_json::to_vec(&owner)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
                    .and_then(|bytes| file.write_all(&bytes));
                if let Err(e) = written {
                    let _ = fs::remove_file(&self.path);
                    return Err(Error::io(e, &self.path, "write_lock"));
                }
                tracing::trace!(lock = %self.path.display(), "Acquired lock");
                Ok(Some(LockGuard {
                    path: self.path.clone(),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(Error::io(e, &self.path, "create_lock")),
        }
    }
}

/// Acquire the lock at `lock_path`, blocking per `options`
pub fn acquire_lock(lock_path: &Path, options: &LockOptions) -> Result<LockGuard> {
    FileLock::new(lock_path, options.clone()).acquire()
}

/// Held lock; the marker file is removed on drop
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Lock marker path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicitly release the lock
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!(lock = %self.path.display(), "Released lock"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                lock = %self.path.display(),
                error = %e,
                "Failed to release lock"
            ),
        }
    }
}

/// Age of the lock marker by modification time; `None` when it is gone
fn lock_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let content = fs::read(path).ok()?;
    serde_json::from_slice(&content).ok()
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn fast_options() -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(200),
            stale_after: Duration::from_secs(60),
            base_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(20),
            jitter: Duration::from_millis(2),
        }
    }

    fn backdate(path: &Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn acquire_and_release() {
        let tmp = TempDir::new().unwrap();
        let lock = FileLock::new(tmp.path().join("manifest.json.lock"), fast_options());

        let guard = lock.acquire().unwrap();
        assert!(lock.is_locked());
        assert!(lock.try_acquire().unwrap().is_none(), "lock is exclusive");

        drop(guard);
        assert!(!lock.is_locked());
        assert!(lock.try_acquire().unwrap().is_some());
    }

    #[test]
    fn marker_records_owner() {
        let tmp = TempDir::new().unwrap();
        let lock = FileLock::new(tmp.path().join("x.lock"), fast_options());
        let _guard = lock.acquire().unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&fs::read(lock.path()).unwrap()).unwrap();
        assert!(raw.get("pid").is_some());
        assert!(raw.get("host").is_some());
        assert!(raw.get("at").is_some());

        let owner = lock.owner().unwrap();
        assert_eq!(owner.pid, std::process::id());
    }

    #[test]
    fn creates_missing_parent_directory() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a/b/c/manifest.json.lock");
        let lock = FileLock::new(&path, fast_options());
        let _guard = lock.acquire().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn timeout_reports_holder() {
        let tmp = TempDir::new().unwrap();
        let lock = FileLock::new(tmp.path().join("busy.lock"), fast_options());
        let _held = lock.acquire().unwrap();

        let started = Instant::now();
        let err = lock.acquire().unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(200));
        match err {
            Error::LockTimeout {
                holder, waited_ms, ..
            } => {
                assert_eq!(holder.unwrap().pid, std::process::id());
                assert!(waited_ms >= 200);
            }
            other => panic!("expected lock timeout, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_broken() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stale.lock");
        fs::write(&path, br#"{"pid":1,"host":"gone","at":"2020-01-01T00:00:00Z"}"#).unwrap();
        backdate(&path, Duration::from_secs(3600));

        let lock = FileLock::new(&path, fast_options());
        let guard = lock.acquire().unwrap();
        assert_eq!(lock.owner().unwrap().pid, std::process::id());
        drop(guard);
    }

    #[test]
    fn undeletable_stale_lock_still_times_out() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("manifest.json.lock");
        // A directory cannot be removed with remove_file
        fs::create_dir(&path).unwrap();
        fs::File::open(&path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(3600))
            .unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let lock = FileLock::new(&path, fast_options());
        std::thread::spawn(move || {
            let _ = tx.send(lock.acquire().map(drop));
        });

        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("acquire must return within its wait budget");
        match result {
            Err(Error::LockTimeout {
                lock_age_ms,
                waited_ms,
                ..
            }) => {
                assert!(waited_ms >= 200);
                assert!(lock_age_ms.unwrap() >= 3_600_000);
            }
            other => panic!("expected lock timeout, got {other:?}"),
        }
        assert!(path.is_dir());
    }

    #[test]
    fn unreadable_fresh_lock_still_blocks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("garbage.lock");
        fs::write(&path, b"not json").unwrap();

        let err = FileLock::new(&path, fast_options()).acquire().unwrap_err();
        assert!(matches!(err, Error::LockTimeout { holder: None, .. }));
        assert!(path.exists(), "a fresh lock is never removed by a contender");
    }

    #[test]
    fn waiter_gets_lock_after_release() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("handoff.lock");
        let options = fast_options().with_timeout(Duration::from_secs(5));
        let holder = FileLock::new(&path, options.clone()).acquire().unwrap();

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let path = path.clone();
            let acquired = Arc::clone(&acquired);
            std::thread::spawn(move || {
                let _guard = FileLock::new(path, options).acquire().unwrap();
                acquired.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(holder);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancellation_aborts_wait() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cancel.lock");
        let _held = FileLock::new(&path, fast_options()).acquire().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = FileLock::new(&path, fast_options().with_timeout(Duration::from_secs(30)))
            .with_cancellation(token)
            .acquire()
            .unwrap_err();
        assert!(matches!(err, Error::LockCancelled { .. }));
    }

    #[test]
    fn backoff_is_capped() {
        let options = fast_options();
        let mut delay = options.base_delay;
        for _ in 0..20 {
            delay = options.next_delay(delay);
            assert!(options.sleep_for(delay) <= options.max_delay);
        }
        assert_eq!(delay, options.max_delay);
    }
}
