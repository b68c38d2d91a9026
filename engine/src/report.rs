//! Per-operation reports, collected by a sink and rendered as plain text.

use chrono::{DateTime, Utc};
use coldstash_core::{Backup, ChangeStats};
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub id: String,
    pub vault_name: String,
    pub checksum: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl From<&Backup> for BackupSummary {
    fn from(backup: &Backup) -> Self {
        Self {
            id: backup.id.clone(),
            vault_name: backup.vault_name.clone(),
            checksum: backup.checksum.clone(),
            size: backup.size,
            created_at: backup.created_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupDurations {
    pub build: Duration,
    pub encrypt: Duration,
    pub upload: Duration,
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub created_at: DateTime<Utc>,
    pub paths: Vec<PathBuf>,
    pub backup: Option<BackupSummary>,
    pub new: usize,
    pub modified: usize,
    pub deleted: usize,
    pub unmodified: usize,
    pub durations: BackupDurations,
    pub errors: Vec<String>,
}

impl BackupReport {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            created_at: Utc::now(),
            paths,
            backup: None,
            new: 0,
            modified: 0,
            deleted: 0,
            unmodified: 0,
            durations: BackupDurations::default(),
            errors: Vec::new(),
        }
    }

    pub fn record_stats(&mut self, stats: &ChangeStats) {
        self.new = stats.new;
        self.modified = stats.modified;
        self.deleted = stats.deleted;
        self.unmodified = stats.unmodified;
    }
}

#[derive(Debug, Clone)]
pub struct RetrieveReport {
    pub created_at: DateTime<Utc>,
    pub id: String,
    pub restored: usize,
    pub skipped: usize,
    pub wait: Duration,
    pub download: Duration,
    pub extract: Duration,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RemoveReport {
    pub created_at: DateTime<Utc>,
    pub requested: Vec<String>,
    pub removed: Vec<String>,
    pub duration: Duration,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ListReport {
    pub created_at: DateTime<Utc>,
    pub remote: bool,
    pub count: usize,
    pub wait: Duration,
    pub duration: Duration,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RemoveOldReport {
    pub created_at: DateTime<Utc>,
    pub keep: usize,
    pub removed: Vec<BackupSummary>,
    pub list: Duration,
    pub remove: Duration,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ReportEntry {
    Backup(BackupReport),
    Retrieve(RetrieveReport),
    Remove(RemoveReport),
    List(ListReport),
    RemoveOld(RemoveOldReport),
}

impl ReportEntry {
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            ReportEntry::Backup(r) => r.created_at,
            ReportEntry::Retrieve(r) => r.created_at,
            ReportEntry::Remove(r) => r.created_at,
            ReportEntry::List(r) => r.created_at,
            ReportEntry::RemoveOld(r) => r.created_at,
        }
    }

    pub fn errors(&self) -> &[String] {
        match self {
            ReportEntry::Backup(r) => &r.errors,
            ReportEntry::Retrieve(r) => &r.errors,
            ReportEntry::Remove(r) => &r.errors,
            ReportEntry::List(r) => &r.errors,
            ReportEntry::RemoveOld(r) => &r.errors,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors().is_empty()
    }
}

fn write_errors(f: &mut fmt::Formatter<'_>, errors: &[String]) -> fmt::Result {
    for error in errors {
        writeln!(f, "  Error: {}", error)?;
    }
    Ok(())
}

impl fmt::Display for ReportEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at = self.created_at().format("%Y-%m-%d %H:%M:%S");
        match self {
            ReportEntry::Backup(r) => {
                writeln!(f, "[{}] Backup", at)?;
                if let Some(backup) = &r.backup {
                    writeln!(f, "  Archive: {} ({} bytes) in {}", backup.id, backup.size, backup.vault_name)?;
                    writeln!(f, "  Checksum: {}", backup.checksum)?;
                }
                let paths: Vec<String> = r.paths.iter().map(|p| p.display().to_string()).collect();
                writeln!(f, "  Paths: {}", paths.join(", "))?;
                writeln!(
                    f,
                    "  Files: {} new, {} modified, {} deleted, {} unmodified",
                    r.new, r.modified, r.deleted, r.unmodified
                )?;
                writeln!(
                    f,
                    "  Durations: build {:.2?}, encrypt {:.2?}, upload {:.2?}",
                    r.durations.build, r.durations.encrypt, r.durations.upload
                )?;
                write_errors(f, &r.errors)
            }
            ReportEntry::Retrieve(r) => {
                writeln!(f, "[{}] Retrieve {}", at, r.id)?;
                writeln!(f, "  Files: {} restored, {} skipped", r.restored, r.skipped)?;
                writeln!(
                    f,
                    "  Durations: wait {:.2?}, download {:.2?}, extract {:.2?}",
                    r.wait, r.download, r.extract
                )?;
                write_errors(f, &r.errors)
            }
            ReportEntry::Remove(r) => {
                writeln!(f, "[{}] Remove", at)?;
                writeln!(f, "  Requested: {}", r.requested.join(", "))?;
                writeln!(f, "  Removed: {}", r.removed.join(", "))?;
                writeln!(f, "  Duration: {:.2?}", r.duration)?;
                write_errors(f, &r.errors)
            }
            ReportEntry::List(r) => {
                let source = if r.remote { "remote" } else { "local" };
                writeln!(f, "[{}] List ({})", at, source)?;
                writeln!(f, "  Backups: {}", r.count)?;
                writeln!(f, "  Durations: wait {:.2?}, total {:.2?}", r.wait, r.duration)?;
                write_errors(f, &r.errors)
            }
            ReportEntry::RemoveOld(r) => {
                writeln!(f, "[{}] Remove old backups (keep {})", at, r.keep)?;
                for backup in &r.removed {
                    writeln!(
                        f,
                        "  Removed: {} from {}",
                        backup.id,
                        backup.created_at.format("%Y-%m-%d %H:%M:%S")
                    )?;
                }
                writeln!(f, "  Durations: list {:.2?}, remove {:.2?}", r.list, r.remove)?;
                write_errors(f, &r.errors)
            }
        }
    }
}

pub trait ReportSink: Send + Sync {
    fn add(&self, entry: ReportEntry);
}

/// Keeps every entry in memory until taken.
#[derive(Default)]
pub struct ReportLog {
    entries: Mutex<Vec<ReportEntry>>,
}

impl ReportLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<ReportEntry> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Removes and returns everything collected so far.
    pub fn take(&self) -> Vec<ReportEntry> {
        match self.entries.lock() {
            Ok(mut entries) => std::mem::take(&mut *entries),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl ReportSink for ReportLog {
    fn add(&self, entry: ReportEntry) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

impl fmt::Display for ReportLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in self.entries() {
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_renders_and_drains() {
        let log = ReportLog::new();
        log.add(ReportEntry::Remove(RemoveReport {
            created_at: Utc::now(),
            requested: vec!["a".to_string(), "b".to_string()],
            removed: vec!["a".to_string()],
            duration: Duration::from_millis(12),
            errors: vec!["Remote failure during delete_archive: denied".to_string()],
        }));

        let text = log.to_string();
        assert!(text.contains("Requested: a, b"));
        assert!(text.contains("Error: Remote failure"));
        assert!(!log.entries()[0].is_success());

        assert_eq!(log.take().len(), 1);
        assert!(log.entries().is_empty());
    }
}
