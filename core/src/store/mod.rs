//! Durable local record of uploaded backups.

mod audit;
mod convert;
mod kv;
mod lock;

pub use audit::AuditFile;
pub use convert::convert;
pub use kv::KvStore;
pub use lock::StoreLock;

use crate::types::Backup;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub trait MetadataStore: Send + Sync {
    /// Records a backup. Saving the same backup again is a no-op.
    fn save(&self, backup: &Backup) -> Result<()>;

    /// All known backups, oldest first, ties broken by id.
    fn list(&self) -> Result<Vec<Backup>>;

    /// Forgets a backup. Unknown ids are ignored.
    fn remove(&self, id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Kv,
    Audit,
}

impl FromStr for StoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kv" | "sled" => Ok(StoreKind::Kv),
            "audit" | "audit-file" => Ok(StoreKind::Audit),
            other => Err(Error::Config(format!("Unknown store kind: {}", other))),
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Kv => f.write_str("kv"),
            StoreKind::Audit => f.write_str("audit"),
        }
    }
}

pub fn open_store(kind: StoreKind, path: &Path) -> Box<dyn MetadataStore> {
    match kind {
        StoreKind::Kv => Box::new(KvStore::new(path)),
        StoreKind::Audit => Box::new(AuditFile::new(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Info, ItemInfo, ItemStatus};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    pub(crate) fn sample_backup(id: &str, hour: u32) -> Backup {
        let mut info = Info::new();
        info.insert(
            format!("/data/{}.txt", id),
            ItemInfo::new(ItemStatus::New, None, "abc123".to_string()),
        );
        Backup {
            id: id.to_string(),
            vault_name: "vault".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            checksum: format!("{:064x}", hour),
            size: 1024 * hour as u64,
            info,
        }
    }

    fn exercise(store: &dyn MetadataStore) -> Vec<Backup> {
        store.save(&sample_backup("c", 3)).unwrap();
        store.save(&sample_backup("a", 1)).unwrap();
        store.save(&sample_backup("b", 2)).unwrap();
        store.save(&sample_backup("a", 1)).unwrap();
        store.remove("b").unwrap();
        store.remove("missing").unwrap();
        store.list().unwrap()
    }

    #[test]
    fn test_backends_list_identically() {
        let dir = TempDir::new().unwrap();
        let kv = open_store(StoreKind::Kv, &dir.path().join("store.db"));
        let audit = open_store(StoreKind::Audit, &dir.path().join("audit.log"));

        let from_kv = exercise(kv.as_ref());
        let from_audit = exercise(audit.as_ref());

        assert_eq!(from_kv, from_audit);
        let ids: Vec<_> = from_kv.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!("kv".parse::<StoreKind>().unwrap(), StoreKind::Kv);
        assert_eq!("Audit".parse::<StoreKind>().unwrap(), StoreKind::Audit);
        assert!("boltdb".parse::<StoreKind>().is_err());
    }
}
