use super::{MetadataStore, StoreLock};
use crate::types::{Backup, sort_by_creation};
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::debug;

const TREE: &str = "backups";

/// Attempts at opening the database while sled's own lock is released by a
/// handle that was just dropped.
const OPEN_ATTEMPTS: u32 = 3;
const OPEN_BACKOFF: Duration = Duration::from_millis(20);

/// Embedded key-value backend. One sled tree keyed by backup id, with the
/// JSON-encoded backup as value. The database is only open for the length
/// of one operation.
pub struct KvStore {
    path: PathBuf,
}

impl KvStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn open(&self) -> Result<sled::Db> {
        let mut attempt = 1;
        loop {
            match sled::open(&self.path).map_err(|e| self.map_err(e)) {
                Err(Error::StoreLocked { .. }) if attempt < OPEN_ATTEMPTS => {
                    debug!(path = %self.path.display(), attempt, "Key-value store busy, retrying");
                    attempt += 1;
                    thread::sleep(OPEN_BACKOFF);
                }
                result => return result,
            }
        }
    }

    /// Runs `op` on the backups tree while holding the store lock. The
    /// database is flushed and closed before the lock is released.
    fn with_tree<T>(&self, op: impl FnOnce(&sled::Tree) -> Result<T>) -> Result<T> {
        let _lock = StoreLock::acquire(&self.path)?;
        debug!(path = %self.path.display(), "Opening key-value store");
        let db = self.open()?;
        let tree = db.open_tree(TREE).map_err(|e| self.map_err(e))?;

        let result = op(&tree);
        let flushed = db.flush().map_err(|e| self.map_err(e));
        drop(tree);
        drop(db);

        let value = result?;
        flushed?;
        Ok(value)
    }

    fn map_err(&self, err: sled::Error) -> Error {
        match err {
            sled::Error::Io(e) if is_lock_failure(&e) => Error::StoreLocked {
                path: self.path.display().to_string(),
            },
            sled::Error::Io(e) => Error::path(&self.path, e),
            other => Error::StoreCorrupt(format!("{}: {}", self.path.display(), other)),
        }
    }
}

/// sled reports a held database lock as an `Other` error wrapping the
/// original `WouldBlock`.
fn is_lock_failure(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock || err.to_string().contains("could not acquire lock")
}

impl MetadataStore for KvStore {
    fn save(&self, backup: &Backup) -> Result<()> {
        let value = serde_json::to_vec(backup)?;
        self.with_tree(|tree| {
            tree.insert(backup.id.as_bytes(), value)
                .map_err(|e| self.map_err(e))?;
            Ok(())
        })?;

        debug!(id = %backup.id, "Saved backup record");
        Ok(())
    }

    fn list(&self) -> Result<Vec<Backup>> {
        let mut backups = self.with_tree(|tree| {
            let mut backups = Vec::new();
            for item in tree.iter() {
                let (key, value) = item.map_err(|e| self.map_err(e))?;
                let backup: Backup = serde_json::from_slice(&value).map_err(|e| {
                    Error::StoreCorrupt(format!(
                        "record {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    ))
                })?;
                backups.push(backup);
            }
            Ok(backups)
        })?;

        sort_by_creation(&mut backups);
        Ok(backups)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let removed = self.with_tree(|tree| {
            Ok(tree.remove(id.as_bytes()).map_err(|e| self.map_err(e))?.is_some())
        })?;
        if removed {
            debug!(id, "Removed backup record");
        }
        Ok(())
    }
}
