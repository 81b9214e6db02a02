// Copyright (c) The stackfix Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cross-process mutual exclusion keyed by a filesystem path.
//!
//! Locks are advisory OS file locks taken on a dedicated lock file. Lock files are never removed
//! and never treated as data; only their lock state matters.

use crate::errors::LockError;
use camino::{Utf8Path, Utf8PathBuf};
use debug_ignore::DebugIgnore;
use serde::Deserialize;
use std::{
    fs::{File, OpenOptions, TryLockError},
    thread,
    time::{Duration, Instant},
};
use tracing::debug;

/// The default time to wait for a lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// The default interval between lock attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The extension appended to a path to form its lock file.
pub const LOCK_EXTENSION: &str = "lock";

/// Timing options for acquiring a [`FileLock`].
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct LockOptions {
    /// How long to wait for the lock before failing with [`LockError::Timeout`].
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// How long to sleep between lock attempts.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl LockOptions {
    /// Creates a new set of lock options.
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// Returns the sibling lock file for `path`: `<path>.lock`.
pub fn lock_path_for(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.{LOCK_EXTENSION}"))
}

/// An exclusive lock on a lock file, released when dropped.
#[derive(Debug)]
pub struct FileLock {
    path: Utf8PathBuf,
    file: DebugIgnore<File>,
}

impl FileLock {
    /// Acquires an exclusive lock on `lock_path`, creating the file if necessary.
    ///
    /// Uses non-blocking attempts spaced by `options.poll_interval`. If the lock is still held
    /// elsewhere once `options.timeout` has elapsed, fails with [`LockError::Timeout`]. With a
    /// zero timeout, exactly one attempt is made.
    pub fn acquire(lock_path: &Utf8Path, options: &LockOptions) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(lock_path)
            .map_err(|error| LockError::Open {
                path: lock_path.to_owned(),
                error,
            })?;

        let start = Instant::now();
        loop {
            match file.try_lock() {
                Ok(()) => {
                    debug!("acquired lock {lock_path} after {:?}", start.elapsed());
                    return Ok(Self {
                        path: lock_path.to_owned(),
                        file: DebugIgnore(file),
                    });
                }
                Err(TryLockError::WouldBlock) => {
                    let elapsed = start.elapsed();
                    if elapsed >= options.timeout {
                        return Err(LockError::Timeout {
                            path: lock_path.to_owned(),
                            timeout: options.timeout,
                        });
                    }
                    // Don't oversleep past the deadline.
                    thread::sleep(options.poll_interval.min(options.timeout - elapsed));
                }
                Err(TryLockError::Error(error)) => {
                    // e.g. locking isn't supported on this filesystem.
                    return Err(LockError::Lock {
                        path: lock_path.to_owned(),
                        error,
                    });
                }
            }
        }
    }

    /// Returns the path of the lock file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Closing the file releases the lock too, so errors here aren't important.
        _ = self.file.unlock();
    }
}

/// Runs `body` while holding an exclusive lock on `lock_path`.
///
/// The lock is released on every exit path, including when `body` returns an error.
pub fn with_lock<T, E>(
    lock_path: &Utf8Path,
    options: &LockOptions,
    body: impl FnOnce() -> Result<T, E>,
) -> Result<T, E>
where
    E: From<LockError>,
{
    let _lock = FileLock::acquire(lock_path, options)?;
    body()
}
