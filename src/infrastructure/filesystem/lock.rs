use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock {key} is already held")]
    AlreadyHeld { key: String },

    #[error("Cannot open lock file {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot lock {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Advisory lock on `<dir>/<key>.lock`, released on drop.
///
/// Only other instances of this program honour it. The file itself is left
/// in place so that a waiting instance never locks an unlinked inode.
#[derive(Debug)]
pub struct AdvisoryLock {
    key: String,
    path: PathBuf,
    file: File,
}

impl AdvisoryLock {
    /// Try to take the lock without blocking.
    pub fn try_acquire(dir: &Path, key: &str) -> Result<Self, LockError> {
        let path = dir.join(format!("{}.lock", key));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| LockError::OpenFailed {
                path: path.clone(),
                source,
            })?;

        try_lock_exclusive(&file).map_err(|source| {
            if source.kind() == std::io::ErrorKind::WouldBlock {
                LockError::AlreadyHeld { key: key.to_string() }
            } else {
                LockError::LockFailed {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        // Informational only; a failure here does not affect the lock.
        let _ = file.set_len(0).and_then(|_| {
            writeln!(
                file,
                "{} {}",
                std::process::id(),
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
            )
        });

        tracing::debug!("Acquired lock {}", path.display());
        Ok(Self {
            key: key.to_string(),
            path,
            file,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        unlock(&self.file);
        tracing::debug!("Released lock {}", self.path.display());
    }
}

/// All-or-nothing set of advisory locks.
///
/// Keys are taken in sorted order so two overlapping sets always collide on
/// the first shared key instead of deadlocking.
#[derive(Debug)]
pub struct LockSet {
    locks: Vec<AdvisoryLock>,
}

impl LockSet {
    pub fn try_acquire<I, S>(dir: &Path, keys: I) -> Result<Self, LockError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
        keys.sort();
        keys.dedup();

        let mut locks = Vec::with_capacity(keys.len());
        for key in &keys {
            // dropping the already taken locks releases them
            locks.push(AdvisoryLock::try_acquire(dir, key)?);
        }
        Ok(Self { locks })
    }

    pub fn keys(&self) -> Vec<&str> {
        self.locks.iter().map(AdvisoryLock::key).collect()
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor stays valid for the lifetime of `file`.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: see try_lock_exclusive.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let first = AdvisoryLock::try_acquire(temp_dir.path(), "foo-mirror").unwrap();
        assert_eq!(first.key(), "foo-mirror");
        assert!(first.path().ends_with("foo-mirror.lock"));

        let second = AdvisoryLock::try_acquire(temp_dir.path(), "foo-mirror");
        assert!(matches!(second, Err(LockError::AlreadyHeld { .. })));

        drop(first);
        assert!(AdvisoryLock::try_acquire(temp_dir.path(), "foo-mirror").is_ok());
    }

    #[test]
    fn test_overlapping_sets_collide() {
        let temp_dir = TempDir::new().unwrap();
        let batch = LockSet::try_acquire(temp_dir.path(), ["bar-mirror", "foo-mirror", "mirror-batch"]).unwrap();
        assert_eq!(batch.keys(), vec!["bar-mirror", "foo-mirror", "mirror-batch"]);

        let single = LockSet::try_acquire(temp_dir.path(), ["foo-mirror"]);
        assert!(matches!(single, Err(LockError::AlreadyHeld { ref key }) if key == "foo-mirror"));

        let disjoint = LockSet::try_acquire(temp_dir.path(), ["baz-mirror"]);
        assert!(disjoint.is_ok());
    }

    #[test]
    fn test_failed_set_releases_partial_locks() {
        let temp_dir = TempDir::new().unwrap();
        let held = AdvisoryLock::try_acquire(temp_dir.path(), "b").unwrap();

        assert!(LockSet::try_acquire(temp_dir.path(), ["a", "b"]).is_err());
        // "a" was taken and released again
        assert!(AdvisoryLock::try_acquire(temp_dir.path(), "a").is_ok());
        drop(held);
    }
}
