use super::{MetadataStore, StoreLock};
use crate::types::{Backup, Info, sort_by_creation};
use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Append-only, human readable log of backup records. Each line is
///
/// ```text
/// <rfc3339> save <vault> <id> <checksum> <size> <info-json>
/// <rfc3339> remove <id>
/// ```
///
/// Older files with `<rfc3339> <vault> <id> <checksum>` lines are read as
/// saves without change information.
pub struct AuditFile {
    path: PathBuf,
}

#[derive(Debug, PartialEq)]
enum Record {
    Save(Backup),
    Remove(String),
}

impl AuditFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn replay(&self) -> Result<HashMap<String, Backup>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(Error::path(&self.path, e)),
        };

        let mut state = HashMap::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| Error::path(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }

            let record = parse_line(&line).map_err(|reason| {
                Error::StoreCorrupt(format!(
                    "{} line {}: {}",
                    self.path.display(),
                    index + 1,
                    reason
                ))
            })?;

            match record {
                Record::Save(backup) => {
                    state.insert(backup.id.clone(), backup);
                }
                Record::Remove(id) => {
                    state.remove(&id);
                }
            }
        }
        Ok(state)
    }

    fn append(&self, line: &str) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::path(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::path(&self.path, e))?;
        writeln!(file, "{}", line).map_err(|e| Error::path(&self.path, e))?;
        file.sync_data().map_err(|e| Error::path(&self.path, e))?;
        Ok(())
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn format_save(backup: &Backup) -> Result<String> {
    Ok(format!(
        "{} save {} {} {} {} {}",
        timestamp(&backup.created_at),
        backup.vault_name,
        backup.id,
        backup.checksum,
        backup.size,
        serde_json::to_string(&backup.info)?
    ))
}

fn format_remove(id: &str) -> String {
    format!("{} remove {}", timestamp(&Utc::now()), id)
}

fn parse_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp {:?}: {}", value, e))
}

fn parse_line(line: &str) -> std::result::Result<Record, String> {
    let fields: Vec<&str> = line.splitn(7, ' ').collect();

    match fields.as_slice() {
        [at, "save", vault, id, checksum, size, info] => {
            let size = size.parse().map_err(|e| format!("invalid size {:?}: {}", size, e))?;
            let info: Info = serde_json::from_str(info).map_err(|e| format!("invalid info: {}", e))?;
            Ok(Record::Save(Backup {
                id: id.to_string(),
                vault_name: vault.to_string(),
                created_at: parse_timestamp(at)?,
                checksum: checksum.to_string(),
                size,
                info,
            }))
        }
        [at, "remove", id] => {
            parse_timestamp(at)?;
            Ok(Record::Remove(id.to_string()))
        }
        [at, vault, id, checksum] => Ok(Record::Save(Backup {
            id: id.to_string(),
            vault_name: vault.to_string(),
            created_at: parse_timestamp(at)?,
            checksum: checksum.to_string(),
            size: 0,
            info: Info::new(),
        })),
        _ => Err(format!("unexpected record with {} fields", fields.len())),
    }
}

impl MetadataStore for AuditFile {
    fn save(&self, backup: &Backup) -> Result<()> {
        let _lock = StoreLock::acquire(&self.path)?;

        if self.replay()?.get(&backup.id) == Some(backup) {
            debug!(id = %backup.id, "Backup record already present");
            return Ok(());
        }

        self.append(&format_save(backup)?)?;
        debug!(id = %backup.id, "Appended save record");
        Ok(())
    }

    fn list(&self) -> Result<Vec<Backup>> {
        let _lock = StoreLock::acquire(&self.path)?;

        let mut backups: Vec<Backup> = self.replay()?.into_values().collect();
        sort_by_creation(&mut backups);
        Ok(backups)
    }

    fn remove(&self, id: &str) -> Result<()> {
        let _lock = StoreLock::acquire(&self.path)?;

        if !self.replay()?.contains_key(id) {
            return Ok(());
        }

        self.append(&format_remove(id))?;
        debug!(id, "Appended remove record");
        Ok(())
    }
}
