//! System-wide named mutex (inter-process and inter-thread).
//!
//! A `NamedMutex` combines two locks that must both be held:
//!
//! 1. an in-process lock shared by every mutex constructed with the same name through
//!    the same [`MutexRegistry`], and
//! 2. an exclusive `flock` on a lock file named after the mutex inside the lock
//!    directory, which arbitrates between processes.
//!
//! Acquisition polls both locks non-blockingly and sleeps [`SLEEP_TIME`] between
//! attempts, so timeouts behave the same whichever layer is contended. Starvation is
//! not prevented.
//!
//! The lock file is truncated and stamped with the holder's PID and acquisition time
//! on every acquire, and the release time is appended on release. The contents are
//! for diagnosis only; correctness rests on the OS lock alone.
//!
//! # Example
//!
//! ```rust,no_run
//! use automat::mutex::MutexRegistry;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> automat::error::AutomatResult<()> {
//! let registry = Arc::new(MutexRegistry::new(MutexRegistry::default_lock_dir()));
//! let mutex = registry.mutex("laser", Some(Duration::from_secs(10)))?;
//! {
//!     let _guard = mutex.lock(None)?;
//!     // exclusive hardware exchange here
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{AutomatResult, MutexTimeoutError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Interval between acquisition attempts.
pub const SLEEP_TIME: Duration = Duration::from_millis(10);

/// Prefix of every lock file name.
pub const LOCKFILE_PREFIX: &str = "AUTOMAT_MUTEX";

/// Default timeout applied to device mutexes that do not specify one.
pub const DEFAULT_MUTEX_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-wide table of in-process locks keyed by mutex name.
///
/// One registry is owned by a `Configuration` and handed to everything that builds
/// mutexes, so two mutexes with the same name always share one in-process lock.
pub struct MutexRegistry {
    lock_dir: PathBuf,
    thread_locks: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl MutexRegistry {
    /// Registry rooted at `lock_dir`. The directory is created when the first mutex is built.
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            thread_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Per-user runtime directory when available, the system temp directory otherwise.
    pub fn default_lock_dir() -> PathBuf {
        dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
    }

    /// Directory holding the lock files.
    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Build a mutex for `name`, sharing the in-process lock with any other mutex of
    /// the same name. `default_timeout` of `None` retries forever.
    pub fn mutex(&self, name: &str, default_timeout: Option<Duration>) -> io::Result<NamedMutex> {
        std::fs::create_dir_all(&self.lock_dir)?;
        let thread_lock = self
            .thread_locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone();

        Ok(NamedMutex {
            name: name.to_string(),
            lockfile_path: self.lock_dir.join(format!("{LOCKFILE_PREFIX}_{name}")),
            default_timeout,
            thread_lock,
            held: Mutex::new(None),
        })
    }
}

/// Exclusive lock keyed by name, valid across threads and processes.
pub struct NamedMutex {
    name: String,
    lockfile_path: PathBuf,
    default_timeout: Option<Duration>,
    thread_lock: Arc<AtomicBool>,
    held: Mutex<Option<File>>,
}

impl NamedMutex {
    /// Mutex name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock file backing the mutex.
    pub fn lockfile_path(&self) -> &Path {
        &self.lockfile_path
    }

    /// Timeout used when [`lock`](Self::lock) is given `None`.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }

    /// Whether this instance currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.held.lock().is_some()
    }

    /// Acquire both locks, polling until `timeout` (or the default timeout) elapses.
    ///
    /// # Errors
    ///
    /// `AutomatError::MutexTimeout` when the timeout is exceeded, `AutomatError::Io`
    /// when the lock file cannot be opened or locked.
    pub fn acquire(&self, timeout: Option<Duration>) -> AutomatResult<()> {
        let timeout = timeout.or(self.default_timeout);
        let start = Instant::now();
        loop {
            if let Some(mut file) = self.try_acquire()? {
                if let Err(e) = stamp_acquired(&mut file) {
                    warn!(mutex = %self.name, error = %e, "failed to stamp lock file on acquire");
                }
                *self.held.lock() = Some(file);
                trace!(mutex = %self.name, "acquired");
                return Ok(());
            }
            let elapsed = start.elapsed();
            if timeout.is_some_and(|limit| elapsed >= limit) {
                return Err(MutexTimeoutError {
                    name: self.name.clone(),
                    elapsed,
                }
                .into());
            }
            std::thread::sleep(SLEEP_TIME);
        }
    }

    /// Acquire and return a guard that releases on drop.
    pub fn lock(&self, timeout: Option<Duration>) -> AutomatResult<MutexGuard<'_>> {
        self.acquire(timeout)?;
        Ok(MutexGuard { mutex: self })
    }

    /// Release the file lock, then the in-process lock.
    ///
    /// Releasing a mutex this instance does not hold is a caller error; it is logged
    /// and otherwise ignored.
    pub fn release(&self) {
        let Some(mut file) = self.held.lock().take() else {
            warn!(mutex = %self.name, "release called without holding the mutex");
            return;
        };
        let stamp = format!(", released at {}", chrono::Local::now().to_rfc3339());
        if let Err(e) = file.write_all(stamp.as_bytes()).and_then(|()| file.flush()) {
            warn!(mutex = %self.name, error = %e, "failed to stamp lock file on release");
        }
        if let Err(e) = unlock_file(&file) {
            warn!(mutex = %self.name, error = %e, "failed to unlock lock file");
        }
        drop(file);
        self.thread_lock.store(false, Ordering::Release);
        trace!(mutex = %self.name, "released");
    }

    /// One non-blocking attempt. `Ok(None)` means another holder has it.
    fn try_acquire(&self) -> io::Result<Option<File>> {
        if self
            .thread_lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Ok(None);
        }
        let attempt = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lockfile_path)
            .and_then(|file| try_lock_exclusive(&file).map(|locked| locked.then_some(file)));
        match attempt {
            Ok(Some(file)) => Ok(Some(file)),
            other => {
                self.thread_lock.store(false, Ordering::Release);
                other
            }
        }
    }
}

impl std::fmt::Debug for NamedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutex")
            .field("name", &self.name)
            .field("lockfile_path", &self.lockfile_path)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        if self.is_held() {
            self.release();
        }
    }
}

/// Scoped acquisition of a [`NamedMutex`]; releases on every exit path.
#[must_use = "the mutex is released as soon as the guard is dropped"]
pub struct MutexGuard<'a> {
    mutex: &'a NamedMutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

fn stamp_acquired(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(
        file,
        "acquired by PID {} at {}",
        std::process::id(),
        chrono::Local::now().to_rfc3339()
    )?;
    file.flush()
}

fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid open descriptor owned by `file` for the duration of
        // the call. LOCK_EX | LOCK_NB never blocks.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

fn unlock_file(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: fd is a valid open descriptor owned by `file`.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(())
    }
}
