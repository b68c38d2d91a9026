use crate::{Error, Result};
use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on `<store path>.lock`, released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    pub fn lock_path(store: &Path) -> PathBuf {
        let mut name = store.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Takes the lock or fails immediately with `StoreLocked`.
    pub fn acquire(store: &Path) -> Result<Self> {
        let path = Self::lock_path(store);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::path(parent, e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Error::path(&path, e))?;

        match file.try_lock() {
            Ok(()) => Ok(Self { file, path }),
            Err(TryLockError::WouldBlock) => Err(Error::StoreLocked {
                path: store.display().to_string(),
            }),
            Err(TryLockError::Error(e)) => Err(Error::path(&path, e)),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release store lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_fails_until_release() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("backups.db");

        let held = StoreLock::acquire(&store).unwrap();
        assert!(matches!(
            StoreLock::acquire(&store),
            Err(Error::StoreLocked { .. })
        ));

        drop(held);
        assert!(StoreLock::acquire(&store).is_ok());
    }

    #[test]
    fn test_lock_path_appends_suffix() {
        assert_eq!(
            StoreLock::lock_path(Path::new("/var/lib/coldstash/audit.log")),
            PathBuf::from("/var/lib/coldstash/audit.log.lock")
        );
    }
}
