use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type ArchiveID = String;

/// Per-path change information, keyed by the absolute path as walked.
pub type Info = BTreeMap<String, ItemInfo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    New,
    Modified,
    Unmodified,
    Deleted,
    Unknown,
}

impl ItemStatus {
    /// True when the file was present on disk at backup time.
    pub fn is_useful(&self) -> bool {
        matches!(self, ItemStatus::New | ItemStatus::Modified | ItemStatus::Unmodified)
    }
}

impl Default for ItemStatus {
    fn default() -> Self {
        ItemStatus::Unknown
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemStatus::New => "new",
            ItemStatus::Modified => "modified",
            ItemStatus::Unmodified => "unmodified",
            ItemStatus::Deleted => "deleted",
            ItemStatus::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemInfo {
    pub status: ItemStatus,
    pub last_modified: Option<DateTime<Utc>>,
    pub checksum: String,
}

impl ItemInfo {
    pub fn new(status: ItemStatus, last_modified: Option<DateTime<Utc>>, checksum: String) -> Self {
        Self {
            status,
            last_modified,
            checksum,
        }
    }
}

/// An archive that was uploaded and confirmed by the vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: ArchiveID,
    pub vault_name: String,
    pub created_at: DateTime<Utc>,
    pub checksum: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub info: Info,
}

impl Backup {
    pub fn short_id(&self) -> String {
        self.id.chars().take(12).collect()
    }

    /// Paths that were present on disk when this backup was taken.
    pub fn useful_paths(&self) -> impl Iterator<Item = &str> {
        self.info
            .iter()
            .filter(|(_, item)| item.status.is_useful())
            .map(|(path, _)| path.as_str())
    }

    pub fn summary(&self) -> String {
        format!(
            "{} - {} in {} at {}",
            self.short_id(),
            self.checksum.chars().take(12).collect::<String>(),
            self.vault_name,
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Orders backups the way every store lists them: oldest first, ties
/// broken by id so the order is total.
pub fn sort_by_creation(backups: &mut [Backup]) {
    backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    InventoryRetrieval,
    ArchiveRetrieval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Submitted,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status_message: Option<String>,
}

/// One row of a vault inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDescriptor {
    pub archive_id: ArchiveID,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub checksum: String,
}

impl ArchiveDescriptor {
    /// A backup record for an archive only known remotely. The change
    /// information is unknown until the archive itself is retrieved.
    pub fn into_backup(self, vault_name: &str) -> Backup {
        Backup {
            id: self.archive_id,
            vault_name: vault_name.to_string(),
            created_at: self.created_at,
            checksum: self.checksum,
            size: self.size,
            info: Info::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_useful_statuses() {
        assert!(ItemStatus::New.is_useful());
        assert!(ItemStatus::Modified.is_useful());
        assert!(ItemStatus::Unmodified.is_useful());
        assert!(!ItemStatus::Deleted.is_useful());
        assert!(!ItemStatus::Unknown.is_useful());
    }

    #[test]
    fn test_sort_by_creation_breaks_ties_by_id() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let backup = |id: &str, created_at| Backup {
            id: id.to_string(),
            vault_name: "vault".to_string(),
            created_at,
            checksum: String::new(),
            size: 0,
            info: Info::new(),
        };

        let mut backups = vec![
            backup("b", at),
            backup("c", at - chrono::Duration::hours(1)),
            backup("a", at),
        ];
        sort_by_creation(&mut backups);

        let ids: Vec<_> = backups.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
