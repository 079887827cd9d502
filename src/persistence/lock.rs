//! Single-writer process lock.
//!
//! One agent process per `(db_path, account_key)`. The lock is an advisory
//! exclusive flock on a sidecar file next to the database; a second process
//! refuses to start with `LockContention`. The OS releases the lock on any
//! exit path, including crashes.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{LirabotError, Result};

/// Held for the lifetime of the process; dropping releases the lock.
pub struct SingleWriterLock {
    file: File,
    path: PathBuf,
}

impl SingleWriterLock {
    /// Lock file path: `<db_path>.<account_key>.lock`.
    pub fn lock_path(db_path: &str, account_key: &str) -> PathBuf {
        PathBuf::from(format!("{}.{}.lock", db_path, account_key))
    }

    pub fn acquire(db_path: &str, account_key: &str) -> Result<Self> {
        let path = Self::lock_path(db_path, account_key);
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|_| {
            LirabotError::LockContention(format!(
                "another process holds the writer lock for {} ({})",
                db_path, account_key
            ))
        })?;

        // Best-effort pid marker for operators inspecting a stuck lock.
        let _ = writeln!(file, "{}", std::process::id());
        let _ = file.flush();

        info!(lock = %path.display(), "acquired single-writer lock");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SingleWriterLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquisition_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        let db = db.to_str().unwrap();

        let first = SingleWriterLock::acquire(db, "acct").unwrap();
        let second = SingleWriterLock::acquire(db, "acct");
        assert!(matches!(second, Err(LirabotError::LockContention(_))));
        drop(first);
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        let db = db.to_str().unwrap();

        let first = SingleWriterLock::acquire(db, "acct").unwrap();
        drop(first);
        let again = SingleWriterLock::acquire(db, "acct");
        assert!(again.is_ok());
    }

    #[test]
    fn different_accounts_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state.db");
        let db = db.to_str().unwrap();

        let _a = SingleWriterLock::acquire(db, "acct-a").unwrap();
        let b = SingleWriterLock::acquire(db, "acct-b");
        assert!(b.is_ok());
    }
}
