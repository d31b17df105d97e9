//! Process-wide advisory file lock on a `.lock` file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::NodeError;

/// An OS-level advisory lock bound to a single `.lock` file.
pub struct Locker {
    path: PathBuf,
    file: Option<File>,
}

impl Locker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Acquire the lock, blocking until available. Respects the OS's own
    /// deadlock detection (`fs2::FileExt::lock_exclusive`).
    pub fn lock(&mut self) -> Result<(), NodeError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| {
                NodeError::External(anyhow::anyhow!(e).context(format!(
                    "failed to open lock file {}",
                    self.path.display()
                )))
            })?;
        file.lock_exclusive().map_err(|e| {
            NodeError::External(anyhow::anyhow!(e).context(format!(
                "failed to acquire lock on {}",
                self.path.display()
            )))
        })?;
        self.file = Some(file);
        Ok(())
    }

    pub fn locked(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. An error if not currently held.
    pub fn unlock(&mut self) -> Result<(), NodeError> {
        let Some(file) = self.file.take() else {
            return Err(NodeError::NotLocked {
                path: self.path.display().to_string(),
            });
        };
        fs2::FileExt::unlock(&file).map_err(|e| {
            NodeError::External(anyhow::anyhow!(e).context(format!(
                "failed to release lock on {}",
                self.path.display()
            )))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[test]
    fn lock_then_unlock_round_trips() {
        let dir = TempDir::new("locker").unwrap();
        let mut locker = Locker::new(dir.path().join(".lock"));
        assert!(!locker.locked());
        locker.lock().unwrap();
        assert!(locker.locked());
        locker.unlock().unwrap();
        assert!(!locker.locked());
    }

    #[test]
    fn unlock_without_lock_is_not_locked_error() {
        let dir = TempDir::new("locker").unwrap();
        let mut locker = Locker::new(dir.path().join(".lock"));
        let err = locker.unlock().unwrap_err();
        assert!(matches!(err, NodeError::NotLocked { .. }));
    }

    #[test]
    fn lock_creates_file_if_missing() {
        let dir = TempDir::new("locker").unwrap();
        let path = dir.path().join(".lock");
        assert!(!path.exists());
        let mut locker = Locker::new(&path);
        locker.lock().unwrap();
        assert!(path.exists());
    }
}
